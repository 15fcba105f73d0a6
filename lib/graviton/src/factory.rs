//! Composition of the pipelines into a running node, plus the shared
//! services every pipeline and kernel reaches through the explicit context:
//! the id pool, the inter-pipeline router and the shutdown latch. There is
//! no process-global state; everything hangs off the `Factory` the caller
//! owns.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use quark::logging::{self, Logger};

use crate::addr::Endpoint;
use crate::app::AppId;
use crate::ifaddr::IfaceAddr;
use crate::kernel::{KernelBox, KernelId};
use crate::pipeline::local::LocalPipeline;
use crate::pipeline::process::ProcessPipeline;
use crate::pipeline::remote::RemotePipeline;
use crate::pipeline::timer::TimerPipeline;
use crate::pipeline::unix::UnixPipeline;
use crate::proto::ForeignPacket;
use crate::registry::InstanceRegistry;
use crate::types::TypeRegistry;

pub const DEFAULT_PORT: u16 = 33333;

/// Anything that accepts kernels for asynchronous processing.
pub trait KernelSink: Send + Sync {
    fn submit(&self, kernel: KernelBox);
}

/// Anything that accepts transit packets addressed to another application.
pub trait ForeignSink: Send + Sync {
    /// Take the packet, or hand it back if this sink does not serve the
    /// packet's application.
    fn forward(&self, packet: ForeignPacket) -> Result<(), ForeignPacket>;
}

struct IdRange {
    ifaddr: IfaceAddr,
    pos0: u64,
    pos1: u64,
    next: u64,
}

impl IdRange {
    fn new(ifaddr: IfaceAddr) -> IdRange {
        let (pos0, pos1) = ifaddr.id_range();
        IdRange {
            ifaddr,
            pos0,
            pos1,
            next: pos0,
        }
    }

    fn issue(&mut self) -> KernelId {
        loop {
            if self.next == self.pos1 {
                self.next = self.pos0;
            }
            let id = self.next;
            self.next += 1;
            if id != 0 {
                return id;
            }
        }
    }
}

/// Issues kernel ids. Remote-bound kernels draw from the id range of the
/// interface covering their destination, so ids stay globally unique with
/// no coordination; local and Unix-domain traffic draws from a separate
/// counter.
pub struct IdPool {
    ranges: Mutex<Vec<IdRange>>,
    local_counter: AtomicU64,
}

impl IdPool {
    pub fn new() -> IdPool {
        IdPool {
            ranges: Mutex::new(Vec::new()),
            local_counter: AtomicU64::new(1),
        }
    }

    pub fn add_range(&self, ifaddr: IfaceAddr) {
        let mut ranges = self.lock();
        if !ranges.iter().any(|r| r.ifaddr == ifaddr) {
            ranges.push(IdRange::new(ifaddr));
        }
    }

    pub fn remove_range(&self, ifaddr: IfaceAddr) {
        self.lock().retain(|r| r.ifaddr != ifaddr);
    }

    pub fn has_ranges(&self) -> bool {
        !self.lock().is_empty()
    }

    /// An id for a kernel staying on this node: the first interface range,
    /// or the plain counter when no servers exist.
    pub fn issue_local(&self) -> KernelId {
        let mut ranges = self.lock();
        match ranges.first_mut() {
            Some(range) => range.issue(),
            None => self.local_counter.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// An id for a kernel bound for `destination`. `None` means no
    /// interface range exists to draw from (the caller turns that into
    /// `NoUpstreamServersAvailable`); Unix destinations use the separate
    /// counter.
    pub fn issue_remote(&self, destination: &Endpoint) -> Option<KernelId> {
        match destination {
            Endpoint::Unix(_) => Some(self.local_counter.fetch_add(1, Ordering::Relaxed)),
            Endpoint::Ip(addr) => {
                let mut ranges = self.lock();
                if ranges.is_empty() {
                    return None;
                }
                let position = match addr.ip() {
                    std::net::IpAddr::V4(ip) => {
                        ranges.iter().position(|r| r.ifaddr.contains(ip))
                    }
                    std::net::IpAddr::V6(_) => None,
                };
                let range = match position {
                    Some(position) => &mut ranges[position],
                    None => &mut ranges[0],
                };
                Some(range.issue())
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<Vec<IdRange>> {
        match self.ranges.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for IdPool {
    fn default() -> IdPool {
        IdPool::new()
    }
}

/// The shutdown latch: flipped when the root application finishes (or the
/// operator asks), holding the worst application exit status.
pub struct Shutdown {
    state: Mutex<(bool, i32)>,
    cv: Condvar,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            state: Mutex::new((false, 0)),
            cv: Condvar::new(),
        }
    }

    pub fn request(&self, exit_code: i32) {
        let mut state = self.lock();
        state.0 = true;
        state.1 = state.1.max(exit_code);
        self.cv.notify_all();
    }

    /// Record an application exit status without initiating shutdown.
    pub fn record_status(&self, exit_code: i32) {
        let mut state = self.lock();
        state.1 = state.1.max(exit_code);
    }

    pub fn is_requested(&self) -> bool {
        self.lock().0
    }

    pub fn wait(&self) -> i32 {
        let mut state = self.lock();
        while !state.0 {
            state = match self.cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        state.1
    }

    fn lock(&self) -> std::sync::MutexGuard<(bool, i32)> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Shutdown {
        Shutdown::new()
    }
}

/// Routes kernels between pipelines. Policy: kernels that fail locally
/// with a transport-relevant code escalate to remote; kernels destined for
/// this node's application come back to local; transit packets go to the
/// application's own transport or are re-emitted on remote.
pub struct Router {
    local: Arc<dyn KernelSink>,
    remote: Arc<dyn KernelSink>,
    timer: Arc<dyn KernelSink>,
    unix: Option<Arc<dyn KernelSink>>,
    process: Option<Arc<dyn ForeignSink>>,
    remote_foreign: Option<Arc<dyn ForeignSink>>,
    /// In an application process: the pipe back to the parent daemon.
    child: Option<Arc<dyn KernelSink>>,
    master: AtomicU64,
    shutdown: Arc<Shutdown>,
    log: Logger,
}

impl Router {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        local: Arc<dyn KernelSink>,
        remote: Arc<dyn KernelSink>,
        timer: Arc<dyn KernelSink>,
        shutdown: Arc<Shutdown>,
        log: L,
    ) -> Router {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        Router {
            local,
            remote,
            timer,
            unix: None,
            process: None,
            remote_foreign: None,
            child: None,
            master: AtomicU64::new(0),
            shutdown,
            log,
        }
    }

    pub fn with_unix(mut self, unix: Arc<dyn KernelSink>) -> Router {
        self.unix = Some(unix);
        self
    }

    pub fn with_process(mut self, process: Arc<dyn ForeignSink>) -> Router {
        self.process = Some(process);
        self
    }

    pub fn with_remote_foreign(mut self, remote: Arc<dyn ForeignSink>) -> Router {
        self.remote_foreign = Some(remote);
        self
    }

    pub fn with_child(mut self, child: Arc<dyn KernelSink>) -> Router {
        self.child = Some(child);
        self
    }

    /// The parent link of an application process, when this process is one.
    #[inline]
    pub fn child(&self) -> Option<&Arc<dyn KernelSink>> {
        self.child.as_ref()
    }

    #[inline]
    pub fn send_local(&self, kernel: KernelBox) {
        self.local.submit(kernel);
    }

    #[inline]
    pub fn send_remote(&self, kernel: KernelBox) {
        self.remote.submit(kernel);
    }

    #[inline]
    pub fn send_timer(&self, kernel: KernelBox) {
        self.timer.submit(kernel);
    }

    pub fn send_unix(&self, kernel: KernelBox) {
        match &self.unix {
            Some(unix) => unix.submit(kernel),
            None => self.local.submit(kernel),
        }
    }

    /// Hand a transit packet to the application it belongs to, or re-emit
    /// it on the socket pipeline.
    pub fn forward(&self, packet: ForeignPacket) {
        let packet = match &self.process {
            Some(process) => match process.forward(packet) {
                Ok(()) => return,
                Err(packet) => packet,
            },
            None => packet,
        };
        match &self.remote_foreign {
            Some(remote) => {
                if let Err(packet) = remote.forward(packet) {
                    logging::warn!(self.log, "dropping unroutable transit packet";
                                   "app" => packet.app);
                }
            }
            None => {
                logging::warn!(self.log, "dropping transit packet, no route";
                               "app" => packet.app);
            }
        }
    }

    #[inline]
    pub fn master(&self) -> Option<KernelId> {
        match self.master.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    #[inline]
    pub fn set_master(&self, id: KernelId) {
        self.master.store(id, Ordering::Release);
    }

    #[inline]
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }
}

/// Everything a pipeline needs from the rest of the node.
#[derive(Clone)]
pub struct Services {
    pub router: Arc<Router>,
    pub registry: Arc<InstanceRegistry>,
    pub ids: Arc<IdPool>,
    pub types: Arc<TypeRegistry>,
    pub shutdown: Arc<Shutdown>,
}

pub struct Properties {
    /// Worker threads in the local pipeline; 0 = one per hardware CPU.
    pub num_threads: usize,
    /// Listening port for every interface server.
    pub port: u16,
    pub connection_timeout: Duration,
    pub max_connection_attempts: u32,
    pub transactions_directory: PathBuf,
    /// Allow child applications to run as the superuser.
    pub allow_root: bool,
    /// Path of the Unix-domain control socket, if any.
    pub unix_socket: Option<PathBuf>,
    /// Cluster-wide application id of this process.
    pub this_app: AppId,
}

impl Default for Properties {
    fn default() -> Properties {
        Properties {
            num_threads: 0,
            port: DEFAULT_PORT,
            connection_timeout: Duration::from_secs(7),
            max_connection_attempts: 1,
            transactions_directory: PathBuf::from("."),
            allow_root: false,
            unix_socket: None,
            this_app: crate::app::ROOT_APP,
        }
    }
}

/// Composes the local (worker pool), remote (socket), timer, Unix-domain
/// and process pipelines and owns their lifecycle.
pub struct Factory {
    services: Services,
    local: LocalPipeline,
    remote: RemotePipeline,
    timer: TimerPipeline,
    unix: Option<UnixPipeline>,
    process: ProcessPipeline,
    log: Logger,
}

impl Factory {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        properties: Properties,
        types: TypeRegistry,
        log: L,
    ) -> Factory {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        let types = Arc::new(types);
        let registry = Arc::new(InstanceRegistry::new(&log));
        let ids = Arc::new(IdPool::new());
        let shutdown = Arc::new(Shutdown::new());

        let local = LocalPipeline::new(properties.num_threads, &log);
        let timer = TimerPipeline::new(&log);
        let remote = RemotePipeline::new(
            crate::pipeline::remote::RemoteProperties {
                port: properties.port,
                connection_timeout: properties.connection_timeout,
                max_connection_attempts: properties.max_connection_attempts,
                transactions_directory: properties.transactions_directory.clone(),
                this_app: properties.this_app,
                use_localhost: true,
            },
            &log,
        );
        let unix = properties
            .unix_socket
            .as_ref()
            .map(|path| UnixPipeline::new(path.clone(), properties.this_app, &log));
        let process = ProcessPipeline::new(properties.allow_root, &log);

        let mut router = Router::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            Arc::new(timer.clone()),
            shutdown.clone(),
            &log,
        );
        router = router.with_process(Arc::new(process.clone()));
        router = router.with_remote_foreign(Arc::new(remote.clone()));
        if let Some(unix) = &unix {
            router = router.with_unix(Arc::new(unix.clone()));
        }

        let services = Services {
            router: Arc::new(router),
            registry,
            ids,
            types,
            shutdown,
        };

        Factory {
            services,
            local,
            remote,
            timer,
            unix,
            process,
            log,
        }
    }

    pub fn start(&self) {
        logging::info!(self.log, "starting pipelines");
        self.timer.start(self.services.clone());
        self.local.start(self.services.clone());
        self.remote.start(self.services.clone());
        if let Some(unix) = &self.unix {
            unix.start(self.services.clone());
        }
        self.process.start(self.services.clone());
    }

    pub fn stop(&self) {
        logging::info!(self.log, "stopping pipelines");
        // the timer goes first so pending deadlines still fire into a live
        // worker pool
        self.timer.stop();
        self.timer.wait();
        self.process.stop();
        if let Some(unix) = &self.unix {
            unix.stop();
        }
        self.remote.stop();
        self.local.stop();
    }

    /// Block until shutdown is requested, then stop everything. Returns
    /// the process exit code.
    pub fn wait(&self) -> i32 {
        let code = self.services.shutdown.wait();
        self.stop();
        self.wait_pipelines();
        code
    }

    fn wait_pipelines(&self) {
        self.process.wait();
        if let Some(unix) = &self.unix {
            unix.wait();
        }
        self.remote.wait();
        self.local.wait();
    }

    #[inline]
    pub fn services(&self) -> &Services {
        &self.services
    }

    #[inline]
    pub fn local(&self) -> &LocalPipeline {
        &self.local
    }

    #[inline]
    pub fn remote(&self) -> &RemotePipeline {
        &self.remote
    }

    #[inline]
    pub fn timer(&self) -> &TimerPipeline {
        &self.timer
    }

    #[inline]
    pub fn process(&self) -> &ProcessPipeline {
        &self.process
    }

    #[inline]
    pub fn unix(&self) -> Option<&UnixPipeline> {
        self.unix.as_ref()
    }

    /// Submit a kernel to the local worker pool.
    #[inline]
    pub fn send(&self, kernel: KernelBox) {
        self.services.router.send_local(kernel);
    }

    /// Submit a kernel to the socket pipeline.
    #[inline]
    pub fn send_remote(&self, kernel: KernelBox) {
        self.services.router.send_remote(kernel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_pool_prefers_matching_range() {
        let ids = IdPool::new();
        ids.add_range("10.0.0.1/16".parse().unwrap());
        ids.add_range("192.168.0.5/24".parse().unwrap());

        let (a0, a1) = "10.0.0.1/16".parse::<IfaceAddr>().unwrap().id_range();
        let (b0, b1) = "192.168.0.5/24".parse::<IfaceAddr>().unwrap().id_range();

        let into_a = ids
            .issue_remote(&Endpoint::v4(10, 0, 0, 9, 5000))
            .unwrap();
        assert!(a0 <= into_a && into_a < a1 && into_a != 0);

        let into_b = ids
            .issue_remote(&Endpoint::v4(192, 168, 0, 9, 5000))
            .unwrap();
        assert!(b0 <= into_b && into_b < b1);

        // no range covers this destination: the first range serves
        let fallback = ids
            .issue_remote(&Endpoint::v4(172, 16, 0, 1, 5000))
            .unwrap();
        assert!(a0 <= fallback && fallback < a1);
    }

    #[test]
    fn test_id_pool_without_ranges() {
        let ids = IdPool::new();
        assert_eq!(ids.issue_remote(&Endpoint::v4(10, 0, 0, 9, 5000)), None);
        // local issuance falls back to the plain counter
        let a = ids.issue_local();
        let b = ids.issue_local();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_id_pool_skips_zero_and_wraps() {
        let ids = IdPool::new();
        // position 1: the range starts at 0, which must never be issued
        ids.add_range("10.0.0.1/30".parse().unwrap());
        let first = ids.issue_local();
        assert_ne!(first, 0);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            seen.insert(ids.issue_local());
        }
        assert!(!seen.contains(&0));
    }

    #[test]
    fn test_unix_destination_uses_separate_counter() {
        let ids = IdPool::new();
        ids.add_range("10.0.0.1/16".parse().unwrap());
        let id = ids
            .issue_remote(&Endpoint::Unix(PathBuf::from("/run/g.sock")))
            .unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_shutdown_keeps_worst_status() {
        let shutdown = Shutdown::new();
        shutdown.record_status(1);
        shutdown.request(0);
        assert!(shutdown.is_requested());
        assert_eq!(shutdown.wait(), 1);
    }
}
