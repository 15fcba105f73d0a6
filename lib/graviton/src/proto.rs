//! The per-connection protocol engine: frames kernels onto the stream,
//! parses and resolves what arrives, buffers what is in flight and recovers
//! it when the peer is lost.
//!
//! The engine never routes by itself. Every operation appends `Dispatch`
//! values that the owning connection applies, which keeps the engine free
//! of pipeline back-references and directly testable against in-memory
//! buffers.

use std::collections::VecDeque;
use std::fmt;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use quark::logging::{self, Logger};
use quark::shared::{NetworkError, NetworkResult};

use crate::addr::Endpoint;
use crate::app::{AppId, Application};
use crate::codec::buffer::Buffer;
use crate::codec::packet::{take_packet, PacketReader, PacketWriter};
use crate::codec::wire;
use crate::factory::IdPool;
use crate::kernel::{ExitCode, Kernel, KernelBox, Link, Phase};
use crate::registry::InstanceRegistry;
use crate::txlog::Journal;
use crate::types::TypeRegistry;

/// Per-connection framing flags, negotiated at connection setup rather than
/// per packet.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct ProtoFlags(u8);

impl ProtoFlags {
    /// The full application record precedes every payload.
    pub const PREPEND_APPLICATION: ProtoFlags = ProtoFlags(1 << 0);
    /// Source and destination endpoints precede every kernel frame.
    pub const PREPEND_SOURCE_AND_DEST: ProtoFlags = ProtoFlags(1 << 1);

    #[inline]
    pub fn set(&mut self, rhs: ProtoFlags) {
        self.0 |= rhs.0;
    }

    #[inline]
    pub fn contains(self, rhs: ProtoFlags) -> bool {
        self.0 & rhs.0 == rhs.0
    }
}

/// Which kind of connection a transit packet entered through. The router
/// uses this to avoid bouncing a packet back where it came from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ForeignOrigin {
    Remote,
    Process,
    Unix,
}

/// A packet that belongs to another application and crosses this process
/// untouched: the kernel frame is carried verbatim, no kernel parse. The
/// negotiated header fields are lifted out so the packet can be re-framed
/// for a connection with different flags.
pub struct ForeignPacket {
    pub origin: ForeignOrigin,
    pub source: Option<Endpoint>,
    pub app: AppId,
    pub application: Option<Application>,
    pub wire_source: Option<Endpoint>,
    pub wire_destination: Option<Endpoint>,
    pub frame: Vec<u8>,
}

impl ForeignPacket {
    /// The wire type id of the kernel inside, readable without a parse.
    pub fn frame_type(&self) -> Option<u16> {
        if self.frame.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.frame[0], self.frame[1]]))
    }

    /// The result code of the kernel inside, readable without a parse.
    pub fn frame_result(&self) -> Option<u16> {
        if self.frame.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([self.frame[2], self.frame[3]]))
    }
}

impl fmt::Debug for ForeignPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ForeignPacket(app={},origin={:?},len={})",
            self.app,
            self.origin,
            self.frame.len()
        )
    }
}

/// Routing instructions produced by the engine for its owner to apply.
pub enum Dispatch {
    /// Hand the kernel to the local worker pool.
    Local(KernelBox),
    /// Re-route the kernel through the socket pipeline.
    Remote(KernelBox),
    /// Pass a transit packet to the application forwarding hook.
    Forward(ForeignPacket),
}

fn reborrow_journal<'a>(
    journal: &'a mut Option<&mut dyn Journal>,
) -> Option<&'a mut dyn Journal> {
    match journal {
        Some(journal) => Some(&mut **journal),
        None => None,
    }
}

pub struct ProtocolEngine {
    flags: ProtoFlags,
    /// Endpoint from which kernels come.
    peer: Option<Endpoint>,
    /// Cluster-wide application id of this process.
    this_app: AppId,
    /// Application of the kernels coming in, for pipes that frame without
    /// an application id on the wire.
    other_app: Option<Application>,
    /// Which kind of connection this engine serves; stamped on transit
    /// packets.
    origin: ForeignOrigin,
    upstream: VecDeque<KernelBox>,
    downstream: VecDeque<KernelBox>,
    log: Logger,
}

impl ProtocolEngine {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(this_app: AppId, log: L) -> ProtocolEngine {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        ProtocolEngine {
            flags: ProtoFlags::default(),
            peer: None,
            this_app,
            other_app: None,
            origin: ForeignOrigin::Remote,
            upstream: VecDeque::new(),
            downstream: VecDeque::new(),
            log,
        }
    }

    #[inline]
    pub fn set_origin(&mut self, origin: ForeignOrigin) {
        self.origin = origin;
    }

    #[inline]
    pub fn setf(&mut self, flags: ProtoFlags) {
        self.flags.set(flags);
    }

    #[inline]
    pub fn flags(&self) -> ProtoFlags {
        self.flags
    }

    #[inline]
    pub fn set_peer(&mut self, peer: Option<Endpoint>) {
        self.peer = peer;
    }

    #[inline]
    pub fn peer(&self) -> Option<&Endpoint> {
        self.peer.as_ref()
    }

    #[inline]
    pub fn set_other_app(&mut self, app: Option<Application>) {
        self.other_app = app;
    }

    #[inline]
    pub fn upstream_len(&self) -> usize {
        self.upstream.len()
    }

    #[inline]
    pub fn downstream_len(&self) -> usize {
        self.downstream.len()
    }

    #[inline]
    fn prepends_application(&self) -> bool {
        self.flags.contains(ProtoFlags::PREPEND_APPLICATION)
    }

    #[inline]
    fn has_src_and_dest(&self) -> bool {
        self.flags.contains(ProtoFlags::PREPEND_SOURCE_AND_DEST)
    }

    /// Send a kernel out over this connection.
    ///
    /// Upstream- and somewhere-bound kernels are identified, written and
    /// retained in the upstream buffer until their reply arrives.
    /// Downstream kernels carrying their parent are retained in the
    /// downstream buffer. A broadcast kernel is written but never owned:
    /// it is handed back to the caller for the remaining peers.
    pub fn send(
        &mut self,
        mut kernel: KernelBox,
        out: &mut Buffer,
        ids: &IdPool,
        mut journal: Option<&mut dyn Journal>,
    ) -> Option<KernelBox> {
        let phase = kernel.header().phase();
        if kernel_goes_in_upstream_buffer(phase) {
            self.ensure_has_id(&mut *kernel, ids);
            self.ensure_parent_has_id(&mut *kernel, ids);
            logging::trace!(self.log, "save parent";
                            "kernel" => %kernel.header(),
                            "peer" => ?self.peer);
            self.write_kernel(&*kernel, out);
            if let Some(journal) = journal.as_deref_mut() {
                journal.insert(&*kernel);
            }
            self.upstream.push_back(kernel);
            None
        } else if kernel_goes_in_downstream_buffer(phase, kernel.header().carries_parent()) {
            self.write_kernel(&*kernel, out);
            self.downstream.push_back(kernel);
            None
        } else if phase == Some(Phase::Everywhere) {
            self.write_kernel(&*kernel, out);
            Some(kernel)
        } else {
            // plain downstream, nothing to keep
            self.write_kernel(&*kernel, out);
            None
        }
    }

    /// Parse every complete packet in `input`, answering on `out` where the
    /// protocol calls for it and appending deliveries to `sink`.
    ///
    /// Returns a fatal error only when the framing itself is corrupt; decode
    /// errors inside one packet consume that packet and move on.
    pub fn receive(
        &mut self,
        input: &mut Buffer,
        out: &mut Buffer,
        registry: &InstanceRegistry,
        types: &TypeRegistry,
        ids: &IdPool,
        mut journal: Option<&mut dyn Journal>,
        sink: &mut Vec<Dispatch>,
    ) -> NetworkResult<()> {
        while let Some(payload) = take_packet(input)? {
            let journal_ref = reborrow_journal(&mut journal);
            match self.read_packet(&payload, out, registry, types, ids, journal_ref, sink)
            {
                Ok(()) => {}
                Err(err) => {
                    logging::debug!(self.log, "read error";
                                    "error" => ?err,
                                    "app" => self.this_app,
                                    "peer" => ?self.peer);
                }
            }
        }
        Ok(())
    }

    /// Drain the buffers of a lost connection. Every retained kernel is
    /// either re-routed to another peer or delivered locally with a defined
    /// result; the buffers are empty on return.
    pub fn recover(
        &mut self,
        include_downstream: bool,
        mut journal: Option<&mut dyn Journal>,
        sink: &mut Vec<Dispatch>,
    ) {
        while let Some(kernel) = self.upstream.pop_front() {
            if let Some(journal) = journal.as_deref_mut() {
                journal.erase(kernel.header().id());
            }
            self.recover_kernel(kernel, sink);
        }
        if include_downstream {
            while let Some(kernel) = self.downstream.pop_front() {
                self.recover_kernel(kernel, sink);
            }
        }
    }

    /// Inherit the buffers of a deposed connection to the same peer.
    pub fn absorb(&mut self, mut other: ProtocolEngine) {
        self.upstream.append(&mut other.upstream);
        self.downstream.append(&mut other.downstream);
    }

    /// Refill the upstream buffer with kernels replayed from a transaction
    /// log, so a following `recover` routes them exactly as if the previous
    /// process had lost its peers.
    pub fn restore(&mut self, kernels: Vec<KernelBox>) {
        self.upstream.extend(kernels);
    }

    /// Re-frame a transit packet onto this connection: the negotiated
    /// header fields of this connection, then the kernel frame verbatim.
    pub fn forward(&mut self, packet: &ForeignPacket, out: &mut Buffer) -> NetworkResult<()> {
        let mut writer = PacketWriter::begin(out);
        if self.prepends_application() {
            match &packet.application {
                Some(app) => wire::write_application(&mut writer, app)?,
                None => {
                    return Err(NetworkError::Fatal(quark::shared::ErrorType::BadEncoding))
                }
            }
        }
        writer.write_u32::<BigEndian>(packet.app as u32)?;
        if self.has_src_and_dest() {
            wire::write_endpoint(&mut writer, packet.wire_source.as_ref())?;
            wire::write_endpoint(&mut writer, packet.wire_destination.as_ref())?;
        }
        writer.put(&packet.frame);
        writer.end()
    }

    fn recover_kernel(&mut self, mut kernel: KernelBox, sink: &mut Vec<Dispatch>) {
        let header = kernel.header();
        match header.phase() {
            Some(Phase::Upstream) if header.destination().is_none() => {
                logging::debug!(self.log, "recover kernel"; "kernel" => %kernel.header());
                sink.push(Dispatch::Remote(kernel));
            }
            Some(Phase::Upstream) | Some(Phase::Somewhere) => {
                logging::debug!(self.log, "destination is unreachable";
                                "kernel" => %kernel.header());
                let header = kernel.header_mut();
                let destination = header.destination().cloned();
                header.set_source(destination);
                header.set_result(ExitCode::EndpointNotConnected);
                let parent = header.parent().id();
                header.set_principal(Link::Id(parent));
                sink.push(Dispatch::Local(kernel));
            }
            Some(Phase::Downstream) if kernel.header().carries_parent() => {
                logging::debug!(self.log, "restore parent"; "kernel" => %kernel.header());
                sink.push(Dispatch::Local(kernel));
            }
            _ => {
                logging::warn!(self.log, "bad kernel in sent buffer";
                               "kernel" => %kernel.header());
            }
        }
    }

    // send path {{{

    fn write_kernel(&mut self, kernel: &dyn Kernel, out: &mut Buffer) {
        let result = self.do_write_kernel(kernel, out);
        if let Err(err) = result {
            logging::warn!(self.log, "write error";
                           "error" => ?err,
                           "kernel" => %kernel.header());
        }
    }

    fn do_write_kernel(&self, kernel: &dyn Kernel, out: &mut Buffer) -> NetworkResult<()> {
        let mut writer = PacketWriter::begin(out);
        if self.prepends_application() {
            match &self.other_app {
                Some(app) => wire::write_application(&mut writer, app)?,
                None => return Err(NetworkError::Fatal(quark::shared::ErrorType::BadEncoding)),
            }
        }
        writer.write_u32::<BigEndian>(kernel.header().source_app() as u32)?;
        if self.has_src_and_dest() {
            wire::write_endpoint(&mut writer, kernel.header().source())?;
            wire::write_endpoint(&mut writer, kernel.header().destination())?;
        }
        wire::write_kernel(&mut writer, kernel)?;
        writer.end()
    }

    fn ensure_has_id(&self, kernel: &mut dyn Kernel, ids: &IdPool) {
        if !kernel.header().has_id() {
            let destination = kernel.header().destination().cloned();
            let id = match destination {
                Some(dest) => ids.issue_remote(&dest).unwrap_or_else(|| ids.issue_local()),
                None => ids.issue_local(),
            };
            kernel.header_mut().set_id(id);
        }
    }

    fn ensure_parent_has_id(&self, kernel: &mut dyn Kernel, ids: &IdPool) {
        if let Link::Kernel(parent) = kernel.header_mut().parent_mut() {
            if !parent.header().has_id() {
                parent.header_mut().set_id(ids.issue_local());
            }
        }
    }
    // }}}

    // receive path {{{

    #[allow(clippy::too_many_arguments)]
    fn read_packet(
        &mut self,
        payload: &[u8],
        out: &mut Buffer,
        registry: &InstanceRegistry,
        types: &TypeRegistry,
        ids: &IdPool,
        journal: Option<&mut dyn Journal>,
        sink: &mut Vec<Dispatch>,
    ) -> NetworkResult<()> {
        let mut reader = PacketReader::new(payload);
        let mut application = if self.prepends_application() {
            Some(wire::read_application(&mut reader)?)
        } else {
            None
        };
        let mut app = reader.read_u32::<BigEndian>()? as AppId;
        if let Some(other) = &self.other_app {
            app = other.id;
            application = Some(other.clone());
        }
        if app != self.this_app {
            let (wire_source, wire_destination) = if self.has_src_and_dest() {
                (
                    wire::read_endpoint(&mut reader)?,
                    wire::read_endpoint(&mut reader)?,
                )
            } else {
                (None, None)
            };
            logging::debug!(self.log, "forward transit packet";
                            "app" => app,
                            "peer" => ?self.peer);
            sink.push(Dispatch::Forward(ForeignPacket {
                origin: self.origin,
                source: self.peer.clone(),
                app,
                application,
                wire_source,
                wire_destination,
                frame: reader.take_rest().to_vec(),
            }));
            return Ok(());
        }
        let (source, destination) = if self.has_src_and_dest() {
            (
                wire::read_endpoint(&mut reader)?,
                wire::read_endpoint(&mut reader)?,
            )
        } else {
            (None, None)
        };
        let mut kernel = wire::read_kernel(&mut reader, types)?;
        {
            let header = kernel.header_mut();
            header.set_source_app(app);
            header.set_source(source.or_else(|| self.peer.clone()));
            header.set_destination(destination);
            if let Link::Kernel(parent) = header.parent_mut() {
                parent.header_mut().set_source_app(app);
            }
        }
        self.receive_kernel(kernel, out, registry, ids, journal, sink);
        Ok(())
    }

    fn receive_kernel(
        &mut self,
        mut kernel: KernelBox,
        out: &mut Buffer,
        registry: &InstanceRegistry,
        ids: &IdPool,
        journal: Option<&mut dyn Journal>,
        sink: &mut Vec<Dispatch>,
    ) {
        logging::trace!(self.log, "recv kernel"; "kernel" => %kernel.header());
        if kernel.header().phase() == Some(Phase::Downstream)
            || (kernel.header().result().is_defined() && kernel.header().principal().is_set())
        {
            match self.plug_parent(kernel, journal) {
                Some(plugged) => sink.push(Dispatch::Local(plugged)),
                None => {}
            }
            return;
        }
        let principal_id = kernel.header().principal().id();
        if principal_id != 0 && !registry.contains(principal_id) {
            logging::debug!(self.log, "no principal found"; "kernel" => %kernel.header());
            let header = kernel.header_mut();
            let parent = header.parent().id();
            header.return_to(parent, ExitCode::NoPrincipalFound);
            let source = header.source().cloned();
            header.set_destination(source);
            // back along the same connection
            self.send(kernel, out, ids, journal);
            return;
        }
        sink.push(Dispatch::Local(kernel));
    }

    /// Transplant the parent stored at send time onto the returning kernel.
    fn plug_parent(
        &mut self,
        mut kernel: KernelBox,
        mut journal: Option<&mut dyn Journal>,
    ) -> Option<KernelBox> {
        let id = kernel.header().id();
        if id == 0 {
            logging::warn!(self.log, "downstream kernel without an id";
                           "kernel" => %kernel.header());
            return None;
        }
        let position = self
            .upstream
            .iter()
            .position(|stored| stored.header().id() == id);
        match position {
            None => {
                logging::warn!(self.log, "parent not found"; "kernel" => %kernel.header());
                None
            }
            Some(position) => {
                let mut stored = self.upstream.remove(position).expect("Position is valid");
                if let Some(journal) = journal.as_deref_mut() {
                    journal.erase(id);
                }
                let parent = stored.header_mut().parent_mut().take();
                let parent_id = parent.id();
                let header = kernel.header_mut();
                header.set_parent(parent);
                header.set_principal(Link::Id(parent_id));
                Some(kernel)
            }
        }
    }
    // }}}
}

fn kernel_goes_in_upstream_buffer(phase: Option<Phase>) -> bool {
    matches!(phase, Some(Phase::Upstream) | Some(Phase::Somewhere))
}

fn kernel_goes_in_downstream_buffer(phase: Option<Phase>, carries_parent: bool) -> bool {
    phase == Some(Phase::Downstream) && carries_parent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::packet::PacketWriter;
    use crate::kernel::{downcast, Flags, Header};
    use crate::kernel_cast;

    struct Job {
        header: Header,
        input: u64,
    }

    impl Job {
        fn boxed() -> KernelBox {
            Box::new(Job {
                header: Header::new(),
                input: 0,
            })
        }
    }

    impl Kernel for Job {
        fn header(&self) -> &Header {
            &self.header
        }

        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }

        fn wire_type(&self) -> u16 {
            21
        }

        fn write_payload(&self, out: &mut PacketWriter) -> NetworkResult<()> {
            out.write_u64::<BigEndian>(self.input)?;
            Ok(())
        }

        fn read_payload(&mut self, input: &mut PacketReader) -> NetworkResult<()> {
            self.input = input.read_u64::<BigEndian>()?;
            Ok(())
        }

        kernel_cast!();
    }

    struct Rig {
        registry: InstanceRegistry,
        types: TypeRegistry,
        ids: IdPool,
    }

    impl Rig {
        fn new() -> Rig {
            let mut types = TypeRegistry::new();
            types.register(21, Job::boxed);
            Rig {
                registry: InstanceRegistry::new(None),
                types,
                ids: IdPool::new(),
            }
        }

        fn receive(
            &self,
            engine: &mut ProtocolEngine,
            input: &mut Buffer,
            out: &mut Buffer,
        ) -> Vec<Dispatch> {
            let mut sink = Vec::new();
            engine
                .receive(
                    input,
                    out,
                    &self.registry,
                    &self.types,
                    &self.ids,
                    None,
                    &mut sink,
                )
                .unwrap();
            sink
        }
    }

    fn upstream_job(parent_id: u64) -> KernelBox {
        let mut job = Job {
            header: Header::new(),
            input: 17,
        };
        job.header.set_parent(Link::Id(parent_id));
        Box::new(job)
    }

    #[test]
    fn test_upstream_send_is_buffered_and_identified() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        let mut wire = Buffer::new();

        let owned = engine.send(upstream_job(88), &mut wire, &rig.ids, None);
        assert!(owned.is_none());
        assert_eq!(engine.upstream_len(), 1);
        assert!(!wire.is_empty());
        // buffered kernel is identifiable
        assert_ne!(engine.upstream[0].header().id(), 0);
    }

    #[test]
    fn test_upstream_reply_roundtrip_restores_parent() {
        // Node 1 sends a job to node 2; node 2 executes it and returns it;
        // node 1 finds the original parent and the preserved id.
        let rig1 = Rig::new();
        let rig2 = Rig::new();
        let mut node1 = ProtocolEngine::new(0, None);
        let mut node2 = ProtocolEngine::new(0, None);
        let mut wire12 = Buffer::new();
        let mut wire21 = Buffer::new();

        node1.send(upstream_job(88), &mut wire12, &rig1.ids, None);
        let sent_id = node1.upstream[0].header().id();

        let mut deliveries = rig2.receive(&mut node2, &mut wire12, &mut wire21);
        assert_eq!(deliveries.len(), 1);
        let mut job = match deliveries.pop().unwrap() {
            Dispatch::Local(k) => k,
            _ => panic!("Expected a local delivery"),
        };
        assert_eq!(job.header().id(), sent_id);
        assert_eq!(downcast::<Job>(job).ok().unwrap().input, 17);

        // node 2 completes the job and sends it home
        let mut reply = Job {
            header: Header::new(),
            input: 17,
        };
        reply.header.set_id(sent_id);
        reply.header.set_parent(Link::Id(1));
        reply.header.return_to_parent(ExitCode::Success);
        node2.send(Box::new(reply), &mut wire21, &rig2.ids, None);

        let mut returned = rig1.receive(&mut node1, &mut wire21, &mut wire12);
        assert_eq!(returned.len(), 1);
        let home = match returned.pop().unwrap() {
            Dispatch::Local(k) => k,
            _ => panic!("Expected a local delivery"),
        };
        assert_eq!(home.header().id(), sent_id);
        assert_eq!(home.header().result(), ExitCode::Success);
        assert_eq!(home.header().principal().id(), 88);
        assert_eq!(home.header().parent().id(), 88);
        // upstream buffer holds exactly the kernels whose reply is pending
        assert_eq!(node1.upstream_len(), 0);
    }

    #[test]
    fn test_missing_principal_is_sent_back() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        let mut input = Buffer::new();
        let mut out = Buffer::new();

        // a kernel aimed at a principal the receiving node does not know;
        // the sender keeps its copy in the upstream buffer
        let mut stray = Job {
            header: Header::new(),
            input: 0,
        };
        stray.header.set_id(500);
        stray.header.set_parent(Link::Id(77));
        stray.header.set_principal(Link::Id(404));
        stray
            .header
            .set_destination(Some(Endpoint::v4(10, 0, 0, 2, 5000)));
        let sender_rig = Rig::new();
        let mut sender = ProtocolEngine::new(0, None);
        sender.send(Box::new(stray), &mut input, &sender_rig.ids, None);
        assert_eq!(sender.upstream_len(), 1);

        let deliveries = rig.receive(&mut engine, &mut input, &mut out);
        assert!(deliveries.is_empty());

        // the reply went straight back on the same connection and plugs the
        // stored copy on arrival
        let mut sink = sender_rig.receive(&mut sender, &mut out, &mut input);
        assert_eq!(sink.len(), 1);
        match sink.pop().unwrap() {
            Dispatch::Local(k) => {
                assert_eq!(k.header().result(), ExitCode::NoPrincipalFound);
                assert_eq!(k.header().id(), 500);
                assert_eq!(k.header().principal().id(), 77);
            }
            _ => panic!("Expected a local delivery"),
        }
        assert_eq!(sender.upstream_len(), 0);
    }

    #[test]
    fn test_known_principal_is_delivered() {
        let rig = Rig::new();
        let mut waiting = Job {
            header: Header::new(),
            input: 0,
        };
        waiting.header.set_id(404);
        rig.registry.insert(Box::new(waiting)).ok().unwrap();

        let mut engine = ProtocolEngine::new(0, None);
        let mut input = Buffer::new();
        let mut out = Buffer::new();

        let mut aimed = Job {
            header: Header::new(),
            input: 0,
        };
        aimed.header.set_id(500);
        aimed.header.set_parent(Link::Id(77));
        aimed.header.set_principal(Link::Id(404));
        let mut sender = ProtocolEngine::new(0, None);
        sender.send(Box::new(aimed), &mut input, &rig.ids, None);

        let deliveries = rig.receive(&mut engine, &mut input, &mut out);
        assert_eq!(deliveries.len(), 1);
        assert!(out.is_empty());
    }

    #[test]
    fn test_recover_upstream_is_resent_remotely() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        let mut wire = Buffer::new();
        for _ in 0..10 {
            engine.send(upstream_job(88), &mut wire, &rig.ids, None);
        }
        assert_eq!(engine.upstream_len(), 10);

        let mut sink = Vec::new();
        engine.recover(true, None, &mut sink);
        assert_eq!(engine.upstream_len(), 0);
        assert_eq!(engine.downstream_len(), 0);
        assert_eq!(sink.len(), 10);
        for dispatch in sink {
            assert!(matches!(dispatch, Dispatch::Remote(_)));
        }
    }

    #[test]
    fn test_recover_somewhere_returns_endpoint_not_connected() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        let mut wire = Buffer::new();

        let mut aimed = Job {
            header: Header::new(),
            input: 0,
        };
        aimed.header.set_parent(Link::Id(88));
        aimed.header.set_principal(Link::Id(404));
        aimed
            .header
            .set_destination(Some(Endpoint::v4(10, 0, 0, 2, 5000)));
        engine.send(Box::new(aimed), &mut wire, &rig.ids, None);

        let mut sink = Vec::new();
        engine.recover(true, None, &mut sink);
        assert_eq!(sink.len(), 1);
        match sink.pop().unwrap() {
            Dispatch::Local(k) => {
                assert_eq!(k.header().result(), ExitCode::EndpointNotConnected);
                assert_eq!(k.header().principal().id(), 88);
                assert_eq!(k.header().source(), Some(&Endpoint::v4(10, 0, 0, 2, 5000)));
            }
            _ => panic!("Expected a local delivery"),
        }
    }

    #[test]
    fn test_broadcast_kernel_is_never_owned() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        let mut wire = Buffer::new();

        let everywhere = Job {
            header: Header::new(),
            input: 5,
        };
        let returned = engine.send(Box::new(everywhere), &mut wire, &rig.ids, None);
        assert!(returned.is_some());
        assert_eq!(engine.upstream_len(), 0);
        assert_eq!(engine.downstream_len(), 0);
        assert!(!wire.is_empty());
    }

    #[test]
    fn test_foreign_packet_is_forwarded_without_parse() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        engine.set_peer(Some(Endpoint::v4(10, 0, 0, 9, 5000)));
        let mut input = Buffer::new();
        let mut out = Buffer::new();

        // hand-build a packet for application 7 with an unparseable body
        let mut writer = PacketWriter::begin(&mut input);
        writer.write_u32::<BigEndian>(7).unwrap();
        writer.put(&[0xde, 0xad, 0xbe, 0xef]);
        writer.end().unwrap();

        let mut deliveries = rig.receive(&mut engine, &mut input, &mut out);
        assert_eq!(deliveries.len(), 1);
        match deliveries.pop().unwrap() {
            Dispatch::Forward(packet) => {
                assert_eq!(packet.app, 7);
                assert_eq!(packet.frame, vec![0xde, 0xad, 0xbe, 0xef]);
                assert_eq!(packet.source, Some(Endpoint::v4(10, 0, 0, 9, 5000)));
                assert_eq!(packet.frame_type(), Some(0xdead));
            }
            _ => panic!("Expected a forward"),
        }
    }

    #[test]
    fn test_forward_reframes_for_target_flags() {
        // transit packet leaves a src/dst connection and is re-emitted on
        // another src/dst connection: the endpoints survive the hop
        let rig = Rig::new();
        let mut ingress = ProtocolEngine::new(0, None);
        ingress.setf(ProtoFlags::PREPEND_SOURCE_AND_DEST);
        let mut input = Buffer::new();
        let mut out = Buffer::new();

        let mut writer = PacketWriter::begin(&mut input);
        writer.write_u32::<BigEndian>(7).unwrap();
        wire::write_endpoint(&mut writer, Some(&Endpoint::v4(10, 0, 0, 3, 5000))).unwrap();
        wire::write_endpoint(&mut writer, None).unwrap();
        writer.put(&[0, 21, 0, 1]);
        writer.end().unwrap();

        let mut deliveries = rig.receive(&mut ingress, &mut input, &mut out);
        let packet = match deliveries.pop().unwrap() {
            Dispatch::Forward(packet) => packet,
            _ => panic!("Expected a forward"),
        };
        assert_eq!(packet.wire_source, Some(Endpoint::v4(10, 0, 0, 3, 5000)));
        assert_eq!(packet.frame_result(), Some(1));

        let mut egress = ProtocolEngine::new(0, None);
        egress.setf(ProtoFlags::PREPEND_SOURCE_AND_DEST);
        let mut rewired = Buffer::new();
        egress.forward(&packet, &mut rewired).unwrap();

        // the re-framed packet parses identically on the next hop
        let mut next = ProtocolEngine::new(0, None);
        next.setf(ProtoFlags::PREPEND_SOURCE_AND_DEST);
        let mut again = rig.receive(&mut next, &mut rewired, &mut out);
        match again.pop().unwrap() {
            Dispatch::Forward(packet) => {
                assert_eq!(packet.app, 7);
                assert_eq!(packet.wire_source, Some(Endpoint::v4(10, 0, 0, 3, 5000)));
                assert_eq!(packet.frame, vec![0, 21, 0, 1]);
            }
            _ => panic!("Expected a forward"),
        }
    }

    #[test]
    fn test_decode_error_skips_one_packet_only() {
        let rig = Rig::new();
        let mut engine = ProtocolEngine::new(0, None);
        let mut input = Buffer::new();
        let mut out = Buffer::new();

        // first packet: truncated kernel frame for this application
        let mut writer = PacketWriter::begin(&mut input);
        writer.write_u32::<BigEndian>(0).unwrap();
        writer.write_u16::<BigEndian>(21).unwrap();
        writer.end().unwrap();
        // second packet: a valid kernel
        let mut sender = ProtocolEngine::new(0, None);
        sender.send(upstream_job(88), &mut input, &rig.ids, None);

        let deliveries = rig.receive(&mut engine, &mut input, &mut out);
        assert_eq!(deliveries.len(), 1);
        assert!(input.is_empty());
    }

    #[test]
    fn test_absorb_inherits_upstream_buffer() {
        let rig = Rig::new();
        let mut old = ProtocolEngine::new(0, None);
        let mut wire = Buffer::new();
        old.send(upstream_job(88), &mut wire, &rig.ids, None);

        let mut replacement = ProtocolEngine::new(0, None);
        replacement.absorb(old);
        assert_eq!(replacement.upstream_len(), 1);

        let mut sink = Vec::new();
        replacement.recover(true, None, &mut sink);
        assert_eq!(sink.len(), 1);
    }
}
