//! The per-interface discoverer kernel: runs the election scanner, owns
//! the hierarchy, answers probes and keeps link weights flowing into the
//! socket pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;

use quark::logging::{self, Logger};

use crate::addr::Endpoint;
use crate::api::Context;
use crate::discovery::hierarchy::{Hierarchy, HierarchySnapshot};
use crate::discovery::kernels::{HierarchyKernel, Probe, StatusKernel};
use crate::discovery::tree::TreePosition;
use crate::ifaddr::IfaceAddr;
use crate::kernel::{downcast, ExitCode, Flags, Header, Kernel, KernelBox, Link};
use crate::kernel_cast;
use crate::pipeline::event::{PipelineEvent, PipelineEventKernel};
use crate::pipeline::remote::RemotePipeline;

/// Where accepted link weights land: the socket pipeline's per-peer
/// `max_weight`. Split out so election is testable without sockets.
pub trait WeightSink: Send + Sync {
    fn set_client_weight(&self, addr: Endpoint, weight: u32);
}

impl WeightSink for RemotePipeline {
    fn set_client_weight(&self, addr: Endpoint, weight: u32) {
        RemotePipeline::set_client_weight(self, addr, weight);
    }
}

/// The discoverer's periodic wake-up.
struct ScanTimer {
    header: Header,
}

impl ScanTimer {
    fn new(owner: u64) -> ScanTimer {
        let mut header = Header::new();
        header.set_principal(Link::Id(owner));
        ScanTimer { header }
    }
}

impl Kernel for ScanTimer {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    kernel_cast!();
}

pub struct Discoverer {
    header: Header,
    hierarchy: Hierarchy,
    fanout: u64,
    interval: Duration,
    /// Candidate superiors still to try this scan, nearest ancestor first.
    candidates: Vec<Endpoint>,
    /// The candidate whose probe reply is outstanding.
    probing: Option<Endpoint>,
    /// Last weight reported to each neighbour, to keep the gossip quiet.
    last_sent: HashMap<Endpoint, u32>,
    weights: Arc<dyn WeightSink>,
    log: Logger,
}

impl Discoverer {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        ifaddr: IfaceAddr,
        port: u16,
        fanout: u64,
        interval: Duration,
        weights: Arc<dyn WeightSink>,
        log: L,
    ) -> Discoverer {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        let mut header = Header::new();
        header.flags_mut().set(Flags::DO_NOT_DELETE);
        Discoverer {
            header,
            hierarchy: Hierarchy::new(ifaddr, port),
            fanout,
            interval,
            candidates: Vec::new(),
            probing: None,
            last_sent: HashMap::new(),
            weights,
            log,
        }
    }

    #[inline]
    pub fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    #[inline]
    pub fn interface_address(&self) -> IfaceAddr {
        self.hierarchy.interface_address()
    }

    pub fn snapshot(&self) -> HierarchySnapshot {
        self.hierarchy.snapshot()
    }

    /// Candidate superiors: the ancestors of this node's position in the
    /// fanout-ary tree over the interface's address range, nearest first.
    /// The lowest address has none and is the designated root.
    fn candidate_superiors(&self) -> Vec<Endpoint> {
        let ifaddr = self.hierarchy.interface_address();
        let port = self.hierarchy.socket_address().port();
        let position = TreePosition::from_linear(ifaddr.position(), self.fanout);
        position
            .ancestors()
            .into_iter()
            .map(|linear| Endpoint::Ip(SocketAddr::new(ifaddr.nth(linear).into(), port)))
            .collect()
    }

    fn begin_scan(&mut self, ctx: &mut Context) {
        if self.probing.is_some() {
            return;
        }
        self.candidates = self.candidate_superiors();
        self.probe_next(ctx);
    }

    fn probe_next(&mut self, ctx: &mut Context) {
        if self.candidates.is_empty() {
            self.probing = None;
            if !self.hierarchy.has_superior() {
                logging::debug!(self.log, "no superior found, acting as root";
                                "ifaddr" => %self.interface_address());
            }
            return;
        }
        let candidate = self.candidates.remove(0);
        logging::debug!(self.log, "scanning"; "candidate" => %candidate);
        self.probing = Some(candidate.clone());
        let old = self
            .hierarchy
            .superior()
            .map(|s| s.socket_address().clone());
        let mut probe = Probe::new(self.interface_address(), old, Some(candidate.clone()));
        probe.header_mut().set_destination(Some(candidate));
        ctx.upstream_remote(self, Box::new(probe));
    }

    fn on_timer(&mut self, ctx: &mut Context) {
        self.begin_scan(ctx);
        let tick = ScanTimer::new(self.header.id());
        ctx.send_timer(Box::new(tick), self.interval);
    }

    /// A probe we sent came home.
    fn on_probe_reply(&mut self, probe: Box<Probe>, ctx: &mut Context) {
        let candidate = match &self.probing {
            Some(candidate) => candidate.clone(),
            None => return,
        };
        // a goodbye acknowledgement from a deposed superior is not part of
        // the scan
        if probe.header().source() != Some(&candidate) {
            return;
        }
        self.probing = None;
        if probe.header().result() == ExitCode::Success {
            self.candidates.clear();
            self.adopt_superior(candidate, ctx);
        } else {
            logging::debug!(self.log, "candidate unreachable";
                            "candidate" => %candidate,
                            "result" => ?probe.header().result());
            self.probe_next(ctx);
        }
    }

    fn adopt_superior(&mut self, candidate: Endpoint, ctx: &mut Context) {
        if self.hierarchy.superior_is(&candidate) {
            return;
        }
        let old = self
            .hierarchy
            .superior()
            .map(|s| s.socket_address().clone());
        self.hierarchy.set_superior(candidate.clone());
        self.last_sent.clear();
        logging::info!(self.log, "set principal";
                       "ifaddr" => %self.interface_address(),
                       "principal" => %candidate);
        if let Some(old) = old {
            if old != candidate {
                // tell the deposed superior it lost a subordinate
                let mut goodbye = Probe::new(
                    self.interface_address(),
                    Some(old.clone()),
                    Some(candidate),
                );
                goodbye.header_mut().set_destination(Some(old));
                ctx.upstream_remote(self, Box::new(goodbye));
            }
        }
        self.report_weights(ctx);
    }

    /// A peer asks to (re)arrange its subordination under us.
    fn on_probe_request(&mut self, mut probe: Box<Probe>, ctx: &mut Context) {
        let src = match probe.header().source().cloned() {
            Some(src) => src,
            None => {
                logging::warn!(self.log, "probe without a source");
                return;
            }
        };
        let me = self.hierarchy.socket_address().clone();
        let mut changed = false;
        if probe.new_superior() == Some(&me) {
            changed = self.hierarchy.add_subordinate(src.clone());
            if changed {
                logging::info!(self.log, "add subordinate"; "subordinate" => %src);
            }
        } else if probe.old_superior() == Some(&me) {
            changed = self.hierarchy.remove_subordinate(&src);
            if changed {
                logging::info!(self.log, "remove subordinate"; "subordinate" => %src);
            }
        }
        let destination = Some(src);
        probe.header_mut().return_to_parent(ExitCode::Success);
        probe.header_mut().set_destination(destination);
        ctx.send_remote(probe);
        if changed {
            self.report_weights(ctx);
        }
    }

    /// A neighbour reported the size of the tree behind its link.
    fn on_weight(&mut self, mut report: Box<HierarchyKernel>, ctx: &mut Context) {
        if report.header().result().is_defined() {
            // the acknowledgement of our own report
            return;
        }
        let src = match report.header().source().cloned() {
            Some(src) => src,
            None => return,
        };
        let weight = report.weight();
        let changed = if self.hierarchy.superior_is(&src) {
            self.hierarchy.set_superior_weight(weight)
        } else if self.hierarchy.has_subordinate(&src) {
            self.hierarchy.set_subordinate_weight(&src, weight)
        } else {
            logging::debug!(self.log, "weight report from a stranger"; "peer" => %src);
            false
        };
        if changed {
            logging::info!(self.log, "set weight";
                           "peer" => %src, "weight" => weight);
            self.weights.set_client_weight(src, weight);
            self.report_weights(ctx);
        }
        let destination = report.header().source().cloned();
        report.header_mut().return_to_parent(ExitCode::Success);
        report.header_mut().set_destination(destination);
        ctx.send_remote(report);
    }

    /// Push the current weights to every neighbour whose view changed.
    fn report_weights(&mut self, ctx: &mut Context) {
        let mut reports: Vec<(Endpoint, u32)> = Vec::new();
        if let Some(superior) = self.hierarchy.superior() {
            reports.push((superior.socket_address().clone(), self.hierarchy.superior_report()));
        }
        let subordinate_reports: Vec<(Endpoint, u32)> = self
            .hierarchy
            .subordinates()
            .map(|(addr, _)| (addr.clone(), self.hierarchy.subordinate_report(addr)))
            .collect();
        reports.extend(subordinate_reports);

        let ifaddr = self.interface_address();
        for (addr, weight) in reports {
            if self.last_sent.get(&addr) == Some(&weight) {
                continue;
            }
            self.last_sent.insert(addr.clone(), weight);
            let mut report = HierarchyKernel::new(ifaddr, weight);
            report.header_mut().set_destination(Some(addr));
            ctx.upstream_remote(self, Box::new(report));
        }
    }

    fn on_event(&mut self, event: &PipelineEvent, ctx: &mut Context) {
        match event {
            PipelineEvent::RemoveClient(addr) => {
                if self.hierarchy.superior_is(addr) {
                    logging::info!(self.log, "lost superior"; "peer" => %addr);
                    self.hierarchy.remove_superior();
                    self.last_sent.remove(addr);
                    self.probing = None;
                    self.begin_scan(ctx);
                } else if self.hierarchy.remove_subordinate(addr) {
                    logging::info!(self.log, "remove subordinate"; "subordinate" => %addr);
                    self.last_sent.remove(addr);
                    self.report_weights(ctx);
                }
            }
            PipelineEvent::AddClient(_) => {
                if !self.hierarchy.has_superior() {
                    self.begin_scan(ctx);
                }
            }
            _ => {}
        }
    }

    fn on_status(&mut self, mut status: Box<StatusKernel>, ctx: &mut Context) {
        status.push_hierarchy(self.snapshot());
        let next = status.next_pending().or_else(|| ctx.master());
        match next {
            Some(next) => {
                status.header_mut().set_principal(Link::Id(next));
                ctx.send_local(status);
            }
            None => {
                logging::warn!(self.log, "status kernel with nowhere to go");
            }
        }
    }
}

impl Kernel for Discoverer {
    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn act(&mut self, ctx: &mut Context) {
        logging::info!(self.log, "add interface address";
                       "ifaddr" => %self.interface_address());
        self.on_timer(ctx);
    }

    fn react(&mut self, child: KernelBox, ctx: &mut Context) {
        let child = match downcast::<ScanTimer>(child) {
            Ok(_) => {
                self.on_timer(ctx);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<Probe>(child) {
            Ok(probe) => {
                if probe.header().result().is_defined() {
                    self.on_probe_reply(probe, ctx);
                } else {
                    self.on_probe_request(probe, ctx);
                }
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<HierarchyKernel>(child) {
            Ok(report) => {
                self.on_weight(report, ctx);
                return;
            }
            Err(child) => child,
        };
        let child = match downcast::<PipelineEventKernel>(child) {
            Ok(event) => {
                let event = event.event().clone();
                self.on_event(&event, ctx);
                return;
            }
            Err(child) => child,
        };
        match downcast::<StatusKernel>(child) {
            Ok(status) => self.on_status(status, ctx),
            Err(child) => {
                logging::warn!(self.log, "unexpected kernel";
                               "kernel" => %child.header());
            }
        }
    }

    kernel_cast!();
}
