//! The network master kernel: watches the interface set through a
//! pluggable enumerator, spawns a discoverer (and a server) per interface,
//! and routes probes, weight reports, status requests and pipeline events
//! to the discoverer covering them.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;

use quark::logging::{self, Logger};

use crate::addr::Endpoint;
use crate::api::Context;
use crate::discovery::discoverer::Discoverer;
use crate::discovery::kernels::{HierarchyKernel, Probe, StatusKernel, TerminateKernel};
use crate::ifaddr::IfaceAddr;
use crate::kernel::{downcast, ExitCode, Flags, Header, Kernel, KernelBox, KernelId, Link};
use crate::kernel_cast;
use crate::pipeline::event::{PipelineEvent, PipelineEventKernel, ProcessEventKernel};
use crate::pipeline::process::ProcessPipeline;
use crate::pipeline::remote::RemotePipeline;

/// Produces the current set of interface addresses to serve. Interface
/// enumeration itself lives outside the engine; tests and the daemon both
/// plug in here.
pub type InterfaceEnumerator = Box<dyn FnMut() -> Vec<IfaceAddr> + Send>;

pub struct MasterProperties {
    pub fanout: u64,
    pub port: u16,
    /// How often discoverers re-run the election.
    pub scan_interval: Duration,
    /// How often the interface set is re-enumerated.
    pub update_interval: Duration,
    /// When non-empty, only these interfaces are served.
    pub allowed: Vec<IfaceAddr>,
}

impl Default for MasterProperties {
    fn default() -> MasterProperties {
        MasterProperties {
            fanout: 2,
            port: crate::factory::DEFAULT_PORT,
            scan_interval: Duration::from_secs(60),
            update_interval: Duration::from_secs(60),
            allowed: Vec::new(),
        }
    }
}

/// The master's periodic wake-up.
struct UpdateTimer {
    header: Header,
}

impl UpdateTimer {
    fn new(owner: KernelId) -> UpdateTimer {
        let mut header = Header::new();
        header.set_principal(Link::Id(owner));
        UpdateTimer { header }
    }
}

impl Kernel for UpdateTimer {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    kernel_cast!();
}

pub struct NetworkMaster {
    header: Header,
    props: MasterProperties,
    enumerate: InterfaceEnumerator,
    discoverers: HashMap<IfaceAddr, KernelId>,
    remote: RemotePipeline,
    process: Option<ProcessPipeline>,
    log: Logger,
}

impl NetworkMaster {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        props: MasterProperties,
        enumerate: InterfaceEnumerator,
        remote: RemotePipeline,
        process: Option<ProcessPipeline>,
        log: L,
    ) -> NetworkMaster {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        let mut header = Header::new();
        header.flags_mut().set(Flags::DO_NOT_DELETE);
        NetworkMaster {
            header,
            props,
            enumerate,
            discoverers: HashMap::new(),
            remote,
            process,
            log,
        }
    }

    fn update_ifaddrs(&mut self, ctx: &mut Context) {
        let mut new_ifaddrs: Vec<IfaceAddr> = (self.enumerate)()
            .into_iter()
            .filter(|ifaddr| !ifaddr.is_loopback())
            .collect();
        if !self.props.allowed.is_empty() {
            new_ifaddrs.retain(|ifaddr| self.props.allowed.contains(ifaddr));
        }

        let removed: Vec<IfaceAddr> = self
            .discoverers
            .keys()
            .filter(|ifaddr| !new_ifaddrs.contains(ifaddr))
            .copied()
            .collect();
        for ifaddr in removed {
            self.remove_ifaddr(ifaddr, ctx);
        }
        let added: Vec<IfaceAddr> = new_ifaddrs
            .into_iter()
            .filter(|ifaddr| !self.discoverers.contains_key(ifaddr))
            .collect();
        for ifaddr in added {
            self.add_ifaddr(ifaddr, ctx);
        }
    }

    fn add_ifaddr(&mut self, ifaddr: IfaceAddr, ctx: &mut Context) {
        logging::info!(self.log, "add interface address"; "ifaddr" => %ifaddr);
        self.remote.add_server(ifaddr);
        let mut discoverer = Discoverer::new(
            ifaddr,
            self.props.port,
            self.props.fanout,
            self.props.scan_interval,
            Arc::new(self.remote.clone()),
            &self.log,
        );
        let id = ctx.ids().issue_local();
        discoverer.header_mut().set_id(id);
        self.discoverers.insert(ifaddr, id);
        ctx.send_local(Box::new(discoverer));
    }

    fn remove_ifaddr(&mut self, ifaddr: IfaceAddr, ctx: &mut Context) {
        logging::info!(self.log, "remove interface address"; "ifaddr" => %ifaddr);
        self.remote.remove_server(ifaddr);
        if let Some(id) = self.discoverers.remove(&ifaddr) {
            ctx.registry().erase(id);
        }
    }

    fn find_discoverer(&self, addr: &IpAddr) -> Option<KernelId> {
        let v4 = match addr {
            IpAddr::V4(v4) => *v4,
            IpAddr::V6(_) => return None,
        };
        self.discoverers
            .iter()
            .find(|(ifaddr, _)| ifaddr.contains(v4))
            .map(|(_, id)| *id)
    }

    fn find_discoverer_for_endpoint(&self, endpoint: &Endpoint) -> Option<KernelId> {
        endpoint
            .socket_addr()
            .and_then(|addr| self.find_discoverer(&addr.ip()))
    }

    /// Hand a kernel to the discoverer covering `ifaddr`.
    fn route_to_discoverer(
        &mut self,
        mut kernel: KernelBox,
        ifaddr: IfaceAddr,
        ctx: &mut Context,
    ) {
        match self.find_discoverer(&IpAddr::V4(ifaddr.address())) {
            Some(id) => {
                kernel.header_mut().set_principal(Link::Id(id));
                ctx.send_local(kernel);
            }
            None => {
                logging::warn!(self.log, "no discoverer for kernel";
                               "ifaddr" => %ifaddr,
                               "kernel" => %kernel.header());
            }
        }
    }

    fn on_event(&mut self, event: PipelineEventKernel, ctx: &mut Context) {
        let addr = match event.event() {
            PipelineEvent::AddClient(addr) | PipelineEvent::RemoveClient(addr) => addr.clone(),
            _ => return,
        };
        match self.find_discoverer_for_endpoint(&addr) {
            Some(id) => {
                let mut kernel: KernelBox = Box::new(event);
                kernel.header_mut().set_principal(Link::Id(id));
                ctx.send_local(kernel);
            }
            None => {
                logging::debug!(self.log, "event for an unknown interface"; "peer" => %addr);
            }
        }
    }

    fn on_status(&mut self, mut status: Box<StatusKernel>, ctx: &mut Context) {
        if status.hierarchies().is_empty() && !self.discoverers.is_empty() {
            let pending: Vec<KernelId> = self.discoverers.values().copied().collect();
            status.set_pending(pending);
            let first = status.next_pending().expect("Discoverers are present");
            status.header_mut().set_principal(Link::Id(first));
            ctx.send_local(status);
            return;
        }
        // the visit is complete (or there is nothing to visit)
        let source = status.header().source().cloned();
        status.header_mut().return_to_parent(ExitCode::Success);
        status.header_mut().set_destination(source.clone());
        match source {
            Some(source) if source.is_unix() => ctx.send_unix(status),
            Some(_) => ctx.send_remote(status),
            None => {
                logging::warn!(self.log, "status request without a source");
            }
        }
    }

    fn on_process_event(&mut self, event: Box<ProcessEventKernel>, ctx: &mut Context) {
        logging::info!(self.log, "job terminated";
                       "app" => event.app(),
                       "status" => event.exit_code());
        let terminate = TerminateKernel::new(vec![event.app()]);
        ctx.send_remote(Box::new(terminate));
    }

    fn on_terminate(&mut self, terminate: Box<TerminateKernel>, _ctx: &mut Context) {
        logging::info!(self.log, "terminate jobs"; "apps" => ?terminate.app_ids());
        if let Some(process) = &self.process {
            for app in terminate.app_ids() {
                process.remove(*app);
            }
        }
    }
}

impl Kernel for NetworkMaster {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn act(&mut self, ctx: &mut Context) {
        self.update_ifaddrs(ctx);
        let tick = UpdateTimer::new(self.header.id());
        ctx.send_timer(Box::new(tick), self.props.update_interval);
    }

    fn react(&mut self, child: KernelBox, ctx: &mut Context) {
        let child = match downcast::<UpdateTimer>(child) {
            Ok(_) => {
                self.update_ifaddrs(ctx);
                let tick = UpdateTimer::new(self.header.id());
                ctx.send_timer(Box::new(tick), self.props.update_interval);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<Probe>(child) {
            Ok(probe) => {
                let ifaddr = probe.interface_address();
                self.route_to_discoverer(probe, ifaddr, ctx);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<HierarchyKernel>(child) {
            Ok(report) => {
                let ifaddr = report.interface_address();
                self.route_to_discoverer(report, ifaddr, ctx);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<PipelineEventKernel>(child) {
            Ok(event) => {
                self.on_event(*event, ctx);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<StatusKernel>(child) {
            Ok(status) => {
                self.on_status(status, ctx);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<ProcessEventKernel>(child) {
            Ok(event) => {
                self.on_process_event(event, ctx);
                return;
            }
            Err(child) => child,
        };
        match downcast::<TerminateKernel>(child) {
            Ok(terminate) => self.on_terminate(terminate, ctx),
            Err(child) => {
                logging::warn!(self.log, "unexpected kernel";
                               "kernel" => %child.header());
            }
        }
    }

    kernel_cast!();
}
