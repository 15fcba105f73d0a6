use std::any::Any;
use std::fmt;
use std::time::Instant;

use quark::shared::NetworkResult;

use crate::addr::Endpoint;
use crate::api::Context;
use crate::app::AppId;
use crate::codec::{PacketReader, PacketWriter};

/// Stable cluster-wide kernel identity. 0 means "not yet identified".
pub type KernelId = u64;

/// Result of a kernel's execution, carried on the wire as a u16.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ExitCode {
    Undefined = 0,
    Success = 1,
    EndpointNotConnected = 2,
    NoPrincipalFound = 3,
    NoUpstreamServersAvailable = 4,
    UserError = 5,
}

impl ExitCode {
    pub fn from_u16(value: u16) -> Option<ExitCode> {
        match value {
            0 => Some(ExitCode::Undefined),
            1 => Some(ExitCode::Success),
            2 => Some(ExitCode::EndpointNotConnected),
            3 => Some(ExitCode::NoPrincipalFound),
            4 => Some(ExitCode::NoUpstreamServersAvailable),
            5 => Some(ExitCode::UserError),
            _ => None,
        }
    }

    #[inline]
    pub fn is_defined(self) -> bool {
        self != ExitCode::Undefined
    }
}

/// Kernel flag bit set (u8 on the wire).
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct Flags(u8);

impl Flags {
    pub const CARRIES_PARENT: Flags = Flags(1 << 0);
    pub const DELETED: Flags = Flags(1 << 1);
    pub const DO_NOT_DELETE: Flags = Flags(1 << 2);
    pub const PRIORITY: Flags = Flags(1 << 3);

    #[inline]
    pub fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits)
    }

    #[inline]
    pub fn set(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }

    #[inline]
    pub fn unset(&mut self, rhs: Flags) {
        self.0 &= !rhs.0;
    }

    #[inline]
    pub fn contains(self, rhs: Flags) -> bool {
        self.0 & rhs.0 == rhs.0
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Flags({:#04b})", self.0)
    }
}

/// A reference to another kernel: absent, owned in memory, or an identity
/// placeholder left behind by transport. Deserialization always produces
/// `Id`; the instance registry turns it back into a live kernel before any
/// dereference.
pub enum Link {
    None,
    Kernel(KernelBox),
    Id(KernelId),
}

impl Link {
    #[inline]
    pub fn is_set(&self) -> bool {
        !matches!(self, Link::None)
    }

    /// The identity behind the link; 0 when absent or not yet identified.
    pub fn id(&self) -> KernelId {
        match self {
            Link::None => 0,
            Link::Kernel(k) => k.header().id(),
            Link::Id(id) => *id,
        }
    }

    #[inline]
    pub fn take(&mut self) -> Link {
        std::mem::replace(self, Link::None)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Link::None => write!(f, "Link::None"),
            Link::Kernel(k) => write!(f, "Link::Kernel(id={})", k.header().id()),
            Link::Id(id) => write!(f, "Link::Id({})", id),
        }
    }
}

/// Routing phase, derived from (result, principal, parent).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    /// A request moving toward a worker.
    Upstream,
    /// A reply heading home.
    Downstream,
    /// Point-to-point with a live target.
    Somewhere,
    /// Broadcast.
    Everywhere,
}

/// Common kernel state: identity, routing links, addressing, result.
pub struct Header {
    id: KernelId,
    result: ExitCode,
    flags: Flags,
    parent: Link,
    principal: Link,
    source: Option<Endpoint>,
    destination: Option<Endpoint>,
    source_app: AppId,
    target_app: AppId,
    deadline: Option<Instant>,
}

impl Header {
    pub fn new() -> Header {
        Header {
            id: 0,
            result: ExitCode::Undefined,
            flags: Flags::default(),
            parent: Link::None,
            principal: Link::None,
            source: None,
            destination: None,
            source_app: 0,
            target_app: 0,
            deadline: None,
        }
    }

    #[inline]
    pub fn id(&self) -> KernelId {
        self.id
    }

    #[inline]
    pub fn has_id(&self) -> bool {
        self.id != 0
    }

    #[inline]
    pub fn set_id(&mut self, id: KernelId) {
        self.id = id;
    }

    #[inline]
    pub fn result(&self) -> ExitCode {
        self.result
    }

    #[inline]
    pub fn set_result(&mut self, result: ExitCode) {
        self.result = result;
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    #[inline]
    pub fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }

    #[inline]
    pub fn carries_parent(&self) -> bool {
        self.flags.contains(Flags::CARRIES_PARENT)
    }

    #[inline]
    pub fn parent(&self) -> &Link {
        &self.parent
    }

    #[inline]
    pub fn parent_mut(&mut self) -> &mut Link {
        &mut self.parent
    }

    #[inline]
    pub fn set_parent(&mut self, parent: Link) {
        self.parent = parent;
    }

    #[inline]
    pub fn principal(&self) -> &Link {
        &self.principal
    }

    #[inline]
    pub fn principal_mut(&mut self) -> &mut Link {
        &mut self.principal
    }

    #[inline]
    pub fn set_principal(&mut self, principal: Link) {
        self.principal = principal;
    }

    #[inline]
    pub fn source(&self) -> Option<&Endpoint> {
        self.source.as_ref()
    }

    #[inline]
    pub fn set_source(&mut self, source: Option<Endpoint>) {
        self.source = source;
    }

    #[inline]
    pub fn destination(&self) -> Option<&Endpoint> {
        self.destination.as_ref()
    }

    #[inline]
    pub fn set_destination(&mut self, destination: Option<Endpoint>) {
        self.destination = destination;
    }

    #[inline]
    pub fn source_app(&self) -> AppId {
        self.source_app
    }

    #[inline]
    pub fn set_source_app(&mut self, app: AppId) {
        self.source_app = app;
    }

    #[inline]
    pub fn target_app(&self) -> AppId {
        self.target_app
    }

    #[inline]
    pub fn set_target_app(&mut self, app: AppId) {
        self.target_app = app;
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[inline]
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Aim this kernel back at the kernel that issued it, with `result`.
    pub fn return_to_parent(&mut self, result: ExitCode) {
        self.principal = match &self.parent {
            Link::None => Link::None,
            link => Link::Id(link.id()),
        };
        self.result = result;
    }

    /// Aim this kernel at an arbitrary principal, with `result`.
    pub fn return_to(&mut self, principal: KernelId, result: ExitCode) {
        self.principal = Link::Id(principal);
        self.result = result;
    }

    /// The routing phase, or `None` for link combinations that no route
    /// accepts (the recovery path logs those as malformed).
    pub fn phase(&self) -> Option<Phase> {
        let has_principal = self.principal.is_set();
        let has_parent = self.parent.is_set();
        match (self.result.is_defined(), has_principal, has_parent) {
            (_, false, false) => Some(Phase::Everywhere),
            (false, false, true) => Some(Phase::Upstream),
            (true, true, true) => Some(Phase::Downstream),
            (false, true, true) => Some(Phase::Somewhere),
            _ => None,
        }
    }
}

impl Default for Header {
    fn default() -> Header {
        Header::new()
    }
}

/// By id when both sides are identifiable, field by field otherwise.
impl PartialEq for Header {
    fn eq(&self, other: &Header) -> bool {
        if self.has_id() && other.has_id() {
            return self.id == other.id;
        }
        self.result == other.result
            && self.flags == other.flags
            && self.parent.id() == other.parent.id()
            && self.principal.id() == other.principal.id()
            && self.source == other.source
            && self.destination == other.destination
            && self.source_app == other.source_app
            && self.target_app == other.target_app
    }
}

impl Eq for Header {}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "id={},result={:?},parent={},principal={}",
            self.id,
            self.result,
            self.parent.id(),
            self.principal.id()
        )
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Header")
            .field("id", &self.id)
            .field("result", &self.result)
            .field("flags", &self.flags)
            .field("parent", &self.parent.id())
            .field("principal", &self.principal.id())
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("source_app", &self.source_app)
            .field("target_app", &self.target_app)
            .finish()
    }
}

/// A mobile unit of computation.
///
/// `act` runs when the kernel reaches a worker with no principal to return
/// to; `react` runs on the principal when one of its children comes home.
/// `write_payload`/`read_payload` carry the type-specific wire state;
/// kernels with the default `wire_type` of 0 never leave the process.
pub trait Kernel: Send {
    fn header(&self) -> &Header;
    fn header_mut(&mut self) -> &mut Header;

    /// Wire type id for polymorphic reconstruction on the receiving side.
    fn wire_type(&self) -> u16 {
        0
    }

    fn act(&mut self, _ctx: &mut Context) {}

    fn react(&mut self, _child: KernelBox, _ctx: &mut Context) {}

    fn write_payload(&self, _out: &mut PacketWriter) -> NetworkResult<()> {
        Ok(())
    }

    fn read_payload(&mut self, _input: &mut PacketReader) -> NetworkResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

pub type KernelBox = Box<dyn Kernel>;

/// Expands to the `as_any`/`into_any` members of a `Kernel` impl.
#[macro_export]
macro_rules! kernel_cast {
    () => {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any> {
            self
        }
    };
}

/// Reclaims the concrete type of a kernel, handing the box back on mismatch.
pub fn downcast<T: Kernel + 'static>(k: KernelBox) -> Result<Box<T>, KernelBox> {
    if k.as_any().is::<T>() {
        Ok(k.into_any().downcast::<T>().expect("Type checked above"))
    } else {
        Err(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(Header);

    impl Kernel for Plain {
        fn header(&self) -> &Header {
            &self.0
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.0
        }

        kernel_cast!();
    }

    fn plain() -> Plain {
        Plain(Header::new())
    }

    #[test]
    fn test_phase_upstream() {
        let mut k = plain();
        k.0.set_parent(Link::Id(5));
        assert_eq!(k.0.phase(), Some(Phase::Upstream));
    }

    #[test]
    fn test_phase_downstream() {
        let mut k = plain();
        k.0.set_parent(Link::Id(5));
        k.0.return_to_parent(ExitCode::Success);
        assert_eq!(k.0.phase(), Some(Phase::Downstream));
        assert_eq!(k.0.principal().id(), 5);
    }

    #[test]
    fn test_phase_somewhere() {
        let mut k = plain();
        k.0.set_parent(Link::Id(5));
        k.0.set_principal(Link::Id(9));
        assert_eq!(k.0.phase(), Some(Phase::Somewhere));
    }

    #[test]
    fn test_phase_everywhere() {
        let k = plain();
        assert_eq!(k.0.phase(), Some(Phase::Everywhere));
    }

    #[test]
    fn test_phase_malformed() {
        let mut k = plain();
        k.0.set_principal(Link::Id(9));
        assert_eq!(k.0.phase(), None);
        k.0.set_parent(Link::Id(5));
        k.0.set_principal(Link::None);
        k.0.set_result(ExitCode::Success);
        assert_eq!(k.0.phase(), None);
    }

    #[test]
    fn test_flags() {
        let mut flags = Flags::default();
        flags.set(Flags::CARRIES_PARENT);
        flags.set(Flags::PRIORITY);
        assert!(flags.contains(Flags::CARRIES_PARENT));
        assert!(!flags.contains(Flags::DELETED));
        flags.unset(Flags::CARRIES_PARENT);
        assert!(!flags.contains(Flags::CARRIES_PARENT));
        assert_eq!(Flags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn test_downcast() {
        let k: KernelBox = Box::new(plain());
        let back = downcast::<Plain>(k).ok().unwrap();
        assert_eq!(back.0.id(), 0);
    }

    #[test]
    fn test_header_equality_prefers_ids() {
        let mut a = Header::new();
        let mut b = Header::new();
        assert_eq!(a, b);

        a.set_id(9);
        b.set_id(9);
        b.set_result(ExitCode::Success);
        // identifiable on both sides: the id decides
        assert_eq!(a, b);

        b.set_id(10);
        assert_ne!(a, b);

        // one side unidentified: the fields decide
        b.set_id(0);
        assert_ne!(a, b);
        b.set_result(ExitCode::Undefined);
        a.set_id(0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_link_ids() {
        assert_eq!(Link::None.id(), 0);
        assert_eq!(Link::Id(42).id(), 42);
        let mut inner = plain();
        inner.0.set_id(7);
        assert_eq!(Link::Kernel(Box::new(inner)).id(), 7);
    }
}
