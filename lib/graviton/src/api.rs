//! The surface kernels are written against. A `Context` is handed to
//! `act`/`react` by the worker pool; kernels use it to spawn children,
//! route results and reach the shared runtime services. Everything a kernel
//! queues on the context is applied by the worker after the call returns,
//! so a panicking kernel never leaves half of its sends behind.

use std::time::{Duration, Instant};

use quark::logging::Logger;

use crate::factory::{IdPool, Router};
use crate::kernel::{Kernel, KernelBox, KernelId, Link};
use crate::registry::InstanceRegistry;

/// Where a queued kernel is headed.
pub enum Outgoing {
    Local(KernelBox),
    Remote(KernelBox),
    Timer(KernelBox),
    Unix(KernelBox),
}

pub struct Context<'a> {
    router: &'a Router,
    registry: &'a InstanceRegistry,
    ids: &'a IdPool,
    log: &'a Logger,
    outbox: Vec<Outgoing>,
    redirect: Option<KernelId>,
    spawned: usize,
}

impl<'a> Context<'a> {
    pub fn new(
        router: &'a Router,
        registry: &'a InstanceRegistry,
        ids: &'a IdPool,
        log: &'a Logger,
    ) -> Context<'a> {
        Context {
            router,
            registry,
            ids,
            log,
            outbox: Vec::new(),
            redirect: None,
            spawned: 0,
        }
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        self.log
    }

    #[inline]
    pub fn registry(&self) -> &InstanceRegistry {
        self.registry
    }

    #[inline]
    pub fn ids(&self) -> &IdPool {
        self.ids
    }

    #[inline]
    pub fn router(&self) -> &Router {
        self.router
    }

    /// The identity of the network master kernel, once one is installed.
    #[inline]
    pub fn master(&self) -> Option<KernelId> {
        self.router.master()
    }

    /// Reroute the kernel currently being dispatched to another local
    /// principal. Applied by the worker after the current call returns.
    #[inline]
    pub fn redirect_to(&mut self, principal: KernelId) {
        self.redirect = Some(principal);
    }

    /// Queue a kernel for the local worker pool.
    #[inline]
    pub fn send_local(&mut self, kernel: KernelBox) {
        self.outbox.push(Outgoing::Local(kernel));
    }

    /// Queue a kernel for the socket pipeline.
    #[inline]
    pub fn send_remote(&mut self, kernel: KernelBox) {
        self.outbox.push(Outgoing::Remote(kernel));
    }

    /// Queue a kernel for the Unix-domain pipeline.
    #[inline]
    pub fn send_unix(&mut self, kernel: KernelBox) {
        self.outbox.push(Outgoing::Unix(kernel));
    }

    /// Schedule a kernel to come back to `principal` after `delay`.
    pub fn send_timer(&mut self, mut kernel: KernelBox, delay: Duration) {
        kernel
            .header_mut()
            .set_deadline(Some(Instant::now() + delay));
        self.outbox.push(Outgoing::Timer(kernel));
    }

    /// Issue an id to `kernel` if it has none yet, drawing from the local
    /// interface ranges.
    pub fn ensure_id(&self, kernel: &mut dyn Kernel) {
        if !kernel.header().has_id() {
            kernel.header_mut().set_id(self.ids.issue_local());
        }
    }

    /// Send `child` upstream through the local pipeline on behalf of
    /// `parent`. The parent is identified first so the child can find its
    /// way home.
    pub fn upstream_local(&mut self, parent: &mut dyn Kernel, child: KernelBox) {
        let child = self.adopt(parent, child);
        self.send_local(child);
    }

    /// Send `child` upstream through the socket pipeline on behalf of
    /// `parent`.
    pub fn upstream_remote(&mut self, parent: &mut dyn Kernel, child: KernelBox) {
        let child = self.adopt(parent, child);
        self.send_remote(child);
    }

    fn adopt(&mut self, parent: &mut dyn Kernel, mut child: KernelBox) -> KernelBox {
        self.ensure_id(parent);
        {
            let header = child.header_mut();
            header.set_parent(Link::Id(parent.header().id()));
            header.set_source_app(parent.header().source_app());
        }
        self.spawned += 1;
        child
    }

    /// The number of children spawned during this dispatch. A parent with
    /// outstanding children stays in the instance registry.
    #[inline]
    pub(crate) fn spawned(&self) -> usize {
        self.spawned
    }

    #[inline]
    pub(crate) fn take_redirect(&mut self) -> Option<KernelId> {
        self.redirect.take()
    }

    #[inline]
    pub(crate) fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }
}
