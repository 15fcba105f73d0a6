//! The mobile kernels of the discovery protocol. All of them, when they
//! surface at a node with no principal, hand themselves to the network
//! master, which routes them to the discoverer covering their interface.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use quark::shared::NetworkResult;

use crate::api::Context;
use crate::codec::packet::{PacketReader, PacketWriter};
use crate::codec::wire;
use crate::discovery::hierarchy::HierarchySnapshot;
use crate::ifaddr::IfaceAddr;
use crate::kernel::{Header, Kernel, KernelId};
use crate::kernel_cast;
use crate::types::TypeRegistry;

pub const PROBE_TYPE: u16 = 2;
pub const HIERARCHY_TYPE: u16 = 3;
pub const STATUS_TYPE: u16 = 4;
pub const TERMINATE_TYPE: u16 = 5;

/// Register every discovery kernel with the type registry.
pub fn register_types(types: &mut TypeRegistry) {
    types.register(PROBE_TYPE, || Box::new(Probe::empty()));
    types.register(HIERARCHY_TYPE, || Box::new(HierarchyKernel::empty()));
    types.register(STATUS_TYPE, || Box::new(StatusKernel::empty()));
    types.register(TERMINATE_TYPE, || Box::new(TerminateKernel::empty()));
}

fn redirect_to_master(header: &Header, ctx: &mut Context) {
    match ctx.master() {
        Some(master) => ctx.redirect_to(master),
        None => {
            quark::logging::warn!(ctx.log(), "no network master for kernel";
                                  "kernel" => %header);
        }
    }
}

/// "Please consider me a subordinate of `new_superior`": sent by the
/// scanner to a candidate superior, and to the deposed superior when the
/// election picks a better one.
pub struct Probe {
    header: Header,
    ifaddr: IfaceAddr,
    old_superior: Option<crate::addr::Endpoint>,
    new_superior: Option<crate::addr::Endpoint>,
}

impl Probe {
    pub fn new(
        ifaddr: IfaceAddr,
        old_superior: Option<crate::addr::Endpoint>,
        new_superior: Option<crate::addr::Endpoint>,
    ) -> Probe {
        Probe {
            header: Header::new(),
            ifaddr,
            old_superior,
            new_superior,
        }
    }

    fn empty() -> Probe {
        Probe::new("0.0.0.0/32".parse().expect("A valid placeholder"), None, None)
    }

    #[inline]
    pub fn interface_address(&self) -> IfaceAddr {
        self.ifaddr
    }

    #[inline]
    pub fn old_superior(&self) -> Option<&crate::addr::Endpoint> {
        self.old_superior.as_ref()
    }

    #[inline]
    pub fn new_superior(&self) -> Option<&crate::addr::Endpoint> {
        self.new_superior.as_ref()
    }
}

impl Kernel for Probe {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn wire_type(&self) -> u16 {
        PROBE_TYPE
    }

    fn act(&mut self, ctx: &mut Context) {
        redirect_to_master(&self.header, ctx);
    }

    fn write_payload(&self, out: &mut PacketWriter) -> NetworkResult<()> {
        wire::write_ifaddr(out, &self.ifaddr)?;
        wire::write_endpoint(out, self.old_superior.as_ref())?;
        wire::write_endpoint(out, self.new_superior.as_ref())?;
        Ok(())
    }

    fn read_payload(&mut self, input: &mut PacketReader) -> NetworkResult<()> {
        self.ifaddr = wire::read_ifaddr(input)?;
        self.old_superior = wire::read_endpoint(input)?;
        self.new_superior = wire::read_endpoint(input)?;
        Ok(())
    }

    kernel_cast!();
}

/// Carries one link weight between neighbours whenever a subtree changes
/// size.
pub struct HierarchyKernel {
    header: Header,
    ifaddr: IfaceAddr,
    weight: u32,
}

impl HierarchyKernel {
    pub fn new(ifaddr: IfaceAddr, weight: u32) -> HierarchyKernel {
        HierarchyKernel {
            header: Header::new(),
            ifaddr,
            weight,
        }
    }

    fn empty() -> HierarchyKernel {
        HierarchyKernel::new("0.0.0.0/32".parse().expect("A valid placeholder"), 0)
    }

    #[inline]
    pub fn interface_address(&self) -> IfaceAddr {
        self.ifaddr
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl Kernel for HierarchyKernel {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn wire_type(&self) -> u16 {
        HIERARCHY_TYPE
    }

    fn act(&mut self, ctx: &mut Context) {
        redirect_to_master(&self.header, ctx);
    }

    fn write_payload(&self, out: &mut PacketWriter) -> NetworkResult<()> {
        wire::write_ifaddr(out, &self.ifaddr)?;
        out.write_u32::<BigEndian>(self.weight)?;
        Ok(())
    }

    fn read_payload(&mut self, input: &mut PacketReader) -> NetworkResult<()> {
        self.ifaddr = wire::read_ifaddr(input)?;
        self.weight = input.read_u32::<BigEndian>()?;
        Ok(())
    }

    kernel_cast!();
}

/// A control-surface request for the node's view of every hierarchy. The
/// master threads it through the discoverers; the visit list never leaves
/// the process.
pub struct StatusKernel {
    header: Header,
    pending: Vec<KernelId>,
    hierarchies: Vec<HierarchySnapshot>,
}

impl StatusKernel {
    pub fn new() -> StatusKernel {
        StatusKernel {
            header: Header::new(),
            pending: Vec::new(),
            hierarchies: Vec::new(),
        }
    }

    fn empty() -> StatusKernel {
        StatusKernel::new()
    }

    #[inline]
    pub fn hierarchies(&self) -> &[HierarchySnapshot] {
        &self.hierarchies
    }

    #[inline]
    pub fn push_hierarchy(&mut self, snapshot: HierarchySnapshot) {
        self.hierarchies.push(snapshot);
    }

    #[inline]
    pub fn set_pending(&mut self, pending: Vec<KernelId>) {
        self.pending = pending;
    }

    #[inline]
    pub fn next_pending(&mut self) -> Option<KernelId> {
        self.pending.pop()
    }
}

impl Default for StatusKernel {
    fn default() -> StatusKernel {
        StatusKernel::new()
    }
}

impl Kernel for StatusKernel {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn wire_type(&self) -> u16 {
        STATUS_TYPE
    }

    fn act(&mut self, ctx: &mut Context) {
        redirect_to_master(&self.header, ctx);
    }

    fn write_payload(&self, out: &mut PacketWriter) -> NetworkResult<()> {
        out.write_u32::<BigEndian>(self.hierarchies.len() as u32)?;
        for snapshot in &self.hierarchies {
            wire::write_ifaddr(out, &snapshot.ifaddr)?;
            wire::write_endpoint(out, Some(&snapshot.socket_address))?;
            match &snapshot.superior {
                Some((addr, weight)) => {
                    wire::write_endpoint(out, Some(addr))?;
                    out.write_u32::<BigEndian>(*weight)?;
                }
                None => {
                    wire::write_endpoint(out, None)?;
                    out.write_u32::<BigEndian>(0)?;
                }
            }
            out.write_u32::<BigEndian>(snapshot.subordinates.len() as u32)?;
            for (addr, weight) in &snapshot.subordinates {
                wire::write_endpoint(out, Some(addr))?;
                out.write_u32::<BigEndian>(*weight)?;
            }
        }
        Ok(())
    }

    fn read_payload(&mut self, input: &mut PacketReader) -> NetworkResult<()> {
        use quark::shared::{ErrorType, NetworkError};

        self.hierarchies.clear();
        let count = input.read_u32::<BigEndian>()?;
        for _ in 0..count {
            let ifaddr = wire::read_ifaddr(input)?;
            let socket_address = wire::read_endpoint(input)?
                .ok_or(NetworkError::Fatal(ErrorType::BadEncoding))?;
            let superior_addr = wire::read_endpoint(input)?;
            let superior_weight = input.read_u32::<BigEndian>()?;
            let subordinate_count = input.read_u32::<BigEndian>()?;
            let mut subordinates = Vec::new();
            for _ in 0..subordinate_count {
                let addr = wire::read_endpoint(input)?
                    .ok_or(NetworkError::Fatal(ErrorType::BadEncoding))?;
                let weight = input.read_u32::<BigEndian>()?;
                subordinates.push((addr, weight));
            }
            self.hierarchies.push(HierarchySnapshot {
                ifaddr,
                socket_address,
                superior: superior_addr.map(|addr| (addr, superior_weight)),
                subordinates,
            });
        }
        Ok(())
    }

    kernel_cast!();
}

/// Broadcast when a job ends so every node can drop the application's
/// kernels and processes.
pub struct TerminateKernel {
    header: Header,
    app_ids: Vec<u64>,
}

impl TerminateKernel {
    pub fn new(app_ids: Vec<u64>) -> TerminateKernel {
        TerminateKernel {
            header: Header::new(),
            app_ids,
        }
    }

    fn empty() -> TerminateKernel {
        TerminateKernel::new(Vec::new())
    }

    #[inline]
    pub fn app_ids(&self) -> &[u64] {
        &self.app_ids
    }
}

impl Kernel for TerminateKernel {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn wire_type(&self) -> u16 {
        TERMINATE_TYPE
    }

    fn act(&mut self, ctx: &mut Context) {
        redirect_to_master(&self.header, ctx);
    }

    fn write_payload(&self, out: &mut PacketWriter) -> NetworkResult<()> {
        out.write_u32::<BigEndian>(self.app_ids.len() as u32)?;
        for app in &self.app_ids {
            out.write_u64::<BigEndian>(*app)?;
        }
        Ok(())
    }

    fn read_payload(&mut self, input: &mut PacketReader) -> NetworkResult<()> {
        let count = input.read_u32::<BigEndian>()?;
        self.app_ids.clear();
        for _ in 0..count {
            self.app_ids.push(input.read_u64::<BigEndian>()?);
        }
        Ok(())
    }

    kernel_cast!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Endpoint;
    use crate::codec::buffer::Buffer;
    use crate::codec::packet::take_packet;
    use crate::kernel::{downcast, Link};

    fn roundtrip(kernel: &dyn Kernel, types: &TypeRegistry) -> crate::kernel::KernelBox {
        let mut buf = Buffer::new();
        let mut writer = PacketWriter::begin(&mut buf);
        wire::write_kernel(&mut writer, kernel).unwrap();
        writer.end().unwrap();
        let payload = take_packet(&mut buf).unwrap().unwrap();
        let mut reader = PacketReader::new(&payload);
        wire::read_kernel(&mut reader, types).unwrap()
    }

    fn types() -> TypeRegistry {
        let mut types = TypeRegistry::new();
        register_types(&mut types);
        types
    }

    #[test]
    fn test_probe_roundtrip() {
        let mut probe = Probe::new(
            "10.0.0.2/16".parse().unwrap(),
            Some(Endpoint::v4(10, 0, 0, 3, 5000)),
            Some(Endpoint::v4(10, 0, 0, 1, 5000)),
        );
        probe.header.set_id(77);
        probe.header.set_parent(Link::Id(5));

        let back = roundtrip(&probe, &types());
        let back = downcast::<Probe>(back).ok().unwrap();
        assert_eq!(back.interface_address(), probe.ifaddr);
        assert_eq!(back.old_superior(), Some(&Endpoint::v4(10, 0, 0, 3, 5000)));
        assert_eq!(back.new_superior(), Some(&Endpoint::v4(10, 0, 0, 1, 5000)));
        assert_eq!(back.header().id(), 77);
    }

    #[test]
    fn test_hierarchy_kernel_roundtrip() {
        let hk = HierarchyKernel::new("10.0.0.2/16".parse().unwrap(), 7);
        let back = roundtrip(&hk, &types());
        let back = downcast::<HierarchyKernel>(back).ok().unwrap();
        assert_eq!(back.weight(), 7);
        assert_eq!(back.interface_address(), hk.ifaddr);
    }

    #[test]
    fn test_status_roundtrip() {
        let mut status = StatusKernel::new();
        status.push_hierarchy(HierarchySnapshot {
            ifaddr: "10.0.0.2/16".parse().unwrap(),
            socket_address: Endpoint::v4(10, 0, 0, 2, 5000),
            superior: Some((Endpoint::v4(10, 0, 0, 1, 5000), 4)),
            subordinates: vec![
                (Endpoint::v4(10, 0, 0, 4, 5000), 2),
                (Endpoint::v4(10, 0, 0, 5, 5000), 1),
            ],
        });
        let back = roundtrip(&status, &types());
        let back = downcast::<StatusKernel>(back).ok().unwrap();
        assert_eq!(back.hierarchies(), status.hierarchies());
    }

    #[test]
    fn test_terminate_roundtrip() {
        let terminate = TerminateKernel::new(vec![3, 5, 9]);
        let back = roundtrip(&terminate, &types());
        let back = downcast::<TerminateKernel>(back).ok().unwrap();
        assert_eq!(back.app_ids(), &[3, 5, 9]);
    }
}
