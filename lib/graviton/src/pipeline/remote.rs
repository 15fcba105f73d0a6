//! The socket pipeline: one event-loop thread per node owning a listening
//! socket per local interface, a non-blocking socket per remote peer and a
//! waker for cross-thread submission. Kernel routing (neighbour selection,
//! weights, broadcast, point-to-point) happens here; per-connection framing
//! and recovery live in the protocol engine.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token, Waker};

use quark::logging::{self, Logger};

use crate::addr::Endpoint;
use crate::app::AppId;
use crate::factory::{ForeignSink, KernelSink, Services};
use crate::ifaddr::IfaceAddr;
use crate::kernel::{ExitCode, Kernel, KernelBox, KernelId, Phase};
use crate::pipeline::conn::{Channel, ConnState, Transport};
use crate::pipeline::event::{PipelineEvent, PipelineEventKernel};
use crate::proto::{Dispatch, ForeignOrigin, ForeignPacket, ProtoFlags, ProtocolEngine};
use crate::txlog::{self, Journal, TransactionLog};

const WAKE: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);
// drain passes before sockets are closed regardless
const MAX_STOP_ITERATIONS: u32 = 13;

#[derive(Clone)]
pub struct RemoteProperties {
    pub port: u16,
    pub connection_timeout: Duration,
    pub max_connection_attempts: u32,
    pub transactions_directory: PathBuf,
    pub this_app: AppId,
    /// Whether neighbour selection may fall back to this node once every
    /// peer is saturated.
    pub use_localhost: bool,
}

enum Command {
    Submit(KernelBox),
    Foreign(ForeignPacket),
    AddServer(IfaceAddr),
    RemoveServer(IfaceAddr),
    AddClient(Endpoint),
    StopClient(Endpoint),
    SetClientWeight(Endpoint, u32),
    SetEventListener(KernelId),
    Stop,
}

struct Shared {
    commands: Mutex<VecDeque<Command>>,
    waker: Mutex<Option<Waker>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    log: Logger,
}

impl Shared {
    fn push(&self, command: Command) {
        {
            let mut commands = match self.commands.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            commands.push_back(command);
        }
        let waker = match self.waker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(waker) = waker.as_ref() {
            waker.wake().ok();
        }
    }
}

#[derive(Clone)]
pub struct RemotePipeline {
    shared: Arc<Shared>,
    props: RemoteProperties,
}

impl RemotePipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        props: RemoteProperties,
        log: L,
    ) -> RemotePipeline {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        RemotePipeline {
            shared: Arc::new(Shared {
                commands: Mutex::new(VecDeque::new()),
                waker: Mutex::new(None),
                thread: Mutex::new(None),
                log,
            }),
            props,
        }
    }

    pub fn start(&self, services: Services) {
        let poll = Poll::new().expect("Error creating the poller");
        let waker = Waker::new(poll.registry(), WAKE).expect("Error creating the waker");
        *lock(&self.shared.waker) = Some(waker);

        let shared = self.shared.clone();
        let props = self.props.clone();
        let handle = std::thread::Builder::new()
            .name("socket-pipeline".into())
            .spawn(move || {
                let log = shared.log.new(logging::o!());
                EventLoop::new(poll, shared, props, services, log).run();
            })
            .expect("Error spawning the socket pipeline thread");
        *lock(&self.shared.thread) = Some(handle);
    }

    pub fn stop(&self) {
        self.shared.push(Command::Stop);
    }

    pub fn wait(&self) {
        if let Some(handle) = lock(&self.shared.thread).take() {
            handle.join().ok();
        }
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.props.port
    }

    pub fn send(&self, kernel: KernelBox) {
        self.shared.push(Command::Submit(kernel));
    }

    pub fn add_server(&self, ifaddr: IfaceAddr) {
        self.shared.push(Command::AddServer(ifaddr));
    }

    pub fn remove_server(&self, ifaddr: IfaceAddr) {
        self.shared.push(Command::RemoveServer(ifaddr));
    }

    pub fn add_client(&self, addr: Endpoint) {
        self.shared.push(Command::AddClient(addr));
    }

    pub fn stop_client(&self, addr: Endpoint) {
        self.shared.push(Command::StopClient(addr));
    }

    pub fn set_client_weight(&self, addr: Endpoint, weight: u32) {
        self.shared.push(Command::SetClientWeight(addr, weight));
    }

    pub fn set_event_listener(&self, listener: KernelId) {
        self.shared.push(Command::SetEventListener(listener));
    }
}

impl KernelSink for RemotePipeline {
    fn submit(&self, kernel: KernelBox) {
        self.send(kernel);
    }
}

impl ForeignSink for RemotePipeline {
    fn forward(&self, packet: ForeignPacket) -> Result<(), ForeignPacket> {
        self.shared.push(Command::Foreign(packet));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Weight-bearing view of a client used by neighbour selection; split out
/// so the algorithm is testable without sockets.
pub trait Selectable {
    fn is_started(&self) -> bool;
    fn weight(&self) -> u32;
    fn set_weight(&mut self, weight: u32);
    fn max_weight(&self) -> u32;

    fn is_full(&self) -> bool {
        self.weight() >= self.max_weight()
    }
}

/// Pick the neighbour an upstream kernel goes to. `None` means "execute
/// locally". Weights are running counters against the advertised capacity;
/// when every started peer is saturated the counters reset, which is what
/// makes the distribution proportional over time.
pub fn select_neighbour<C: Selectable>(
    clients: &mut BTreeMap<Endpoint, C>,
    source: Option<&Endpoint>,
    carries_parent: bool,
    use_localhost: bool,
) -> Option<Endpoint> {
    if clients.is_empty() {
        return None;
    }
    let mut any_started = false;
    let mut all_full = true;
    for client in clients.values() {
        if !client.is_started() {
            continue;
        }
        any_started = true;
        if !client.is_full() {
            all_full = false;
        }
    }
    if !any_started {
        return None;
    }
    if all_full {
        for client in clients.values_mut() {
            client.set_weight(0);
        }
        // do not send kernels carrying the parent to localhost
        if use_localhost && !carries_parent {
            return None;
        }
    }
    for (addr, client) in clients.iter_mut() {
        if Some(addr) == source {
            continue;
        }
        if !client.is_started() || client.is_full() {
            continue;
        }
        client.set_weight(client.weight() + 1);
        return Some(addr.clone());
    }
    None
}

struct Server {
    ifaddr: IfaceAddr,
    listener: TcpListener,
    token: Token,
}

struct Client {
    channel: Channel,
    token: Token,
    weight: u32,
    max_weight: u32,
    attempts: u32,
    /// The local interface this peer is reachable through; keys the
    /// transaction journal.
    ifaddr: Option<IfaceAddr>,
}

impl Selectable for Client {
    fn is_started(&self) -> bool {
        self.channel.state == ConnState::Started
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn set_weight(&mut self, weight: u32) {
        self.weight = weight;
    }

    fn max_weight(&self) -> u32 {
        self.max_weight
    }
}

enum Routed {
    Kernel(KernelBox),
    Foreign(ForeignPacket),
}

struct EventLoop {
    poll: Poll,
    shared: Arc<Shared>,
    props: RemoteProperties,
    services: Services,
    servers: Vec<Server>,
    clients: BTreeMap<Endpoint, Client>,
    tokens: HashMap<Token, Endpoint>,
    next_token: usize,
    queue: VecDeque<Routed>,
    listener: Option<KernelId>,
    journals: HashMap<IfaceAddr, TransactionLog>,
    stopping: bool,
    stop_iterations: u32,
    log: Logger,
}

impl EventLoop {
    fn new(
        poll: Poll,
        shared: Arc<Shared>,
        props: RemoteProperties,
        services: Services,
        log: Logger,
    ) -> EventLoop {
        EventLoop {
            poll,
            shared,
            props,
            services,
            servers: Vec::new(),
            clients: BTreeMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            queue: VecDeque::new(),
            listener: None,
            journals: HashMap::new(),
            stopping: false,
            stop_iterations: 0,
            log,
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = quark::choose!(self.stopping => STOP_POLL_INTERVAL, POLL_INTERVAL);
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() != std::io::ErrorKind::Interrupted {
                    logging::error!(self.log, "poll error"; "error" => %err);
                    return;
                }
            }
            let ready: Vec<(Token, bool, bool, bool)> = events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error() || event.is_read_closed() || event.is_write_closed(),
                    )
                })
                .collect();

            self.drain_commands();
            for (token, readable, writable, failed) in ready {
                self.handle_token(token, readable, writable, failed);
            }
            self.process_queue();
            self.sweep_timeouts();

            if self.stopping {
                self.flush_all();
                self.stop_iterations += 1;
                let drained = self.queue.is_empty()
                    && self.clients.values().all(|c| !c.channel.has_egress());
                if drained || self.stop_iterations >= MAX_STOP_ITERATIONS {
                    self.close_all();
                    return;
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        loop {
            let command = {
                let mut commands = lock(&self.shared.commands);
                commands.pop_front()
            };
            let command = match command {
                Some(command) => command,
                None => return,
            };
            match command {
                Command::Submit(kernel) => self.queue.push_back(Routed::Kernel(kernel)),
                Command::Foreign(packet) => self.queue.push_back(Routed::Foreign(packet)),
                Command::AddServer(ifaddr) => self.add_server(ifaddr),
                Command::RemoveServer(ifaddr) => self.remove_server(ifaddr),
                Command::AddClient(addr) => {
                    if !self.clients.contains_key(&addr) {
                        if let Err(err) = self.connect_client(addr.clone()) {
                            logging::warn!(self.log, "connect error";
                                           "peer" => %addr, "error" => %err);
                        }
                    }
                }
                Command::StopClient(addr) => {
                    if let Some(client) = self.clients.get_mut(&addr) {
                        client.channel.set_state(ConnState::Stopped);
                    }
                }
                Command::SetClientWeight(addr, weight) => {
                    if let Some(client) = self.clients.get_mut(&addr) {
                        logging::debug!(self.log, "set client weight";
                                        "peer" => %addr, "weight" => weight);
                        client.max_weight = weight;
                    }
                }
                Command::SetEventListener(listener) => self.listener = Some(listener),
                Command::Stop => {
                    logging::info!(self.log, "stopping socket pipeline");
                    self.stopping = true;
                }
            }
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // servers {{{

    fn add_server(&mut self, ifaddr: IfaceAddr) {
        if self.servers.iter().any(|s| s.ifaddr == ifaddr) {
            return;
        }
        let addr = SocketAddr::new(ifaddr.address().into(), self.props.port);
        let mut listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                logging::error!(self.log, "bind error"; "addr" => %addr, "error" => %err);
                return;
            }
        };
        let token = self.alloc_token();
        if let Err(err) =
            self.poll
                .registry()
                .register(&mut listener, token, mio::Interest::READABLE)
        {
            logging::error!(self.log, "register error"; "addr" => %addr, "error" => %err);
            return;
        }
        logging::info!(self.log, "add server"; "ifaddr" => %ifaddr, "port" => self.props.port);
        self.services.ids.add_range(ifaddr);
        self.replay_journal(ifaddr);
        self.servers.push(Server {
            ifaddr,
            listener,
            token,
        });
        self.fire_event(PipelineEvent::AddServer(ifaddr));
    }

    fn remove_server(&mut self, ifaddr: IfaceAddr) {
        let position = match self.servers.iter().position(|s| s.ifaddr == ifaddr) {
            Some(position) => position,
            None => return,
        };
        let mut server = self.servers.remove(position);
        self.poll.registry().deregister(&mut server.listener).ok();
        self.services.ids.remove_range(ifaddr);
        self.journals.remove(&ifaddr);
        logging::info!(self.log, "remove server"; "ifaddr" => %ifaddr);
        self.fire_event(PipelineEvent::RemoveServer(ifaddr));
    }

    /// Replay the interface's transaction log and run the survivors through
    /// recovery, as if the previous process had lost every peer.
    fn replay_journal(&mut self, ifaddr: IfaceAddr) {
        let path = txlog::log_path(&self.props.transactions_directory, &ifaddr);
        let kernels = txlog::replay(&path, &self.services.types, &self.log);
        if !kernels.is_empty() {
            logging::info!(self.log, "replaying transactions";
                           "ifaddr" => %ifaddr, "kernels" => kernels.len());
            let mut engine = ProtocolEngine::new(self.props.this_app, &self.log);
            engine.restore(kernels);
            let mut sink = Vec::new();
            engine.recover(true, None, &mut sink);
            self.apply_dispatches(sink);
        }
        match TransactionLog::open(&path, &self.log) {
            Ok(journal) => {
                self.journals.insert(ifaddr, journal);
            }
            Err(err) => {
                logging::warn!(self.log, "transaction log open error";
                               "path" => %path.display(), "error" => %err);
            }
        }
    }
    // }}}

    // clients {{{

    fn new_engine(&self, peer: &Endpoint) -> ProtocolEngine {
        let mut engine = ProtocolEngine::new(self.props.this_app, &self.log);
        engine.setf(ProtoFlags::PREPEND_SOURCE_AND_DEST);
        engine.set_origin(ForeignOrigin::Remote);
        engine.set_peer(Some(peer.clone()));
        engine
    }

    fn server_for(&self, addr: &SocketAddr) -> Option<IfaceAddr> {
        let ip = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            _ => return None,
        };
        self.servers
            .iter()
            .map(|s| s.ifaddr)
            .find(|ifaddr| ifaddr.contains(ip))
            .or_else(|| self.servers.first().map(|s| s.ifaddr))
    }

    fn install_client(
        &mut self,
        stream: TcpStream,
        vaddr: Endpoint,
        engine: ProtocolEngine,
        attempts: u32,
    ) {
        let channel = Channel::new(Transport::Tcp(stream), engine);
        self.install_channel(channel, vaddr.clone(), attempts);
        logging::debug!(self.log, "add client"; "peer" => %vaddr);
        self.fire_event(PipelineEvent::AddClient(vaddr));
    }

    fn install_channel(&mut self, mut channel: Channel, vaddr: Endpoint, attempts: u32) {
        let ifaddr = vaddr.socket_addr().and_then(|a| self.server_for(&a));
        let token = self.alloc_token();
        if let Err(err) = channel.transport.register(self.poll.registry(), token) {
            logging::error!(self.log, "register error"; "peer" => %vaddr, "error" => %err);
            return;
        }
        channel.set_state(ConnState::Starting);
        self.tokens.insert(token, vaddr.clone());
        self.clients.insert(
            vaddr,
            Client {
                channel,
                token,
                weight: 0,
                max_weight: 1,
                attempts,
                ifaddr,
            },
        );
    }

    fn connect_client(&mut self, vaddr: Endpoint) -> std::io::Result<()> {
        let addr = vaddr.socket_addr().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not an ip endpoint")
        })?;
        let stream = TcpStream::connect(addr)?;
        let engine = self.new_engine(&vaddr);
        self.install_client(stream, vaddr, engine, 0);
        Ok(())
    }

    fn accept_loop(&mut self, token: Token) {
        let position = match self.servers.iter().position(|s| s.token == token) {
            Some(position) => position,
            None => return,
        };
        loop {
            let accepted = self.servers[position].listener.accept();
            match accepted {
                Ok((stream, peer)) => self.handle_accept(stream, peer),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept error"; "error" => %err);
                    break;
                }
            }
        }
    }

    /// An incoming connection. Peers address each other by virtual address
    /// (host plus the listening port); when both sides dial simultaneously
    /// the connection whose bind port is lower survives.
    fn handle_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let vaddr = Endpoint::ip(peer).with_port(self.props.port);
        let incumbent_wins = self
            .clients
            .get(&vaddr)
            .map(|existing| existing.channel.transport.local_port() < peer.port());
        match incumbent_wins {
            None => {
                let engine = self.new_engine(&vaddr);
                self.install_client(stream, vaddr, engine, 0);
            }
            Some(true) => {
                logging::debug!(self.log, "not replacing peer"; "peer" => %vaddr);
                drop(stream);
            }
            Some(false) => {
                logging::debug!(self.log, "replacing peer"; "peer" => %vaddr);
                let old = self.detach_client(&vaddr);
                let mut engine = self.new_engine(&vaddr);
                if let Some(old) = old {
                    engine.absorb(old.channel.engine);
                }
                self.install_client(stream, vaddr.clone(), engine, 0);
                // the inherited buffer goes straight through recovery;
                // anything still upstream-bound is re-routed
                let mut sink = Vec::new();
                if let Some(client) = self.clients.get_mut(&vaddr) {
                    let journal = match client.ifaddr {
                        Some(ifaddr) => self.journals.get_mut(&ifaddr),
                        None => None,
                    };
                    client.channel.engine.recover(
                        true,
                        journal.map(|j| j as &mut dyn Journal),
                        &mut sink,
                    );
                }
                self.apply_dispatches(sink);
            }
        }
    }

    /// Pull a client out of the tables without recovery.
    fn detach_client(&mut self, vaddr: &Endpoint) -> Option<Client> {
        let mut client = self.clients.remove(vaddr)?;
        self.tokens.remove(&client.token);
        client
            .channel
            .transport
            .deregister(self.poll.registry())
            .ok();
        Some(client)
    }

    /// The connection to `vaddr` failed or closed. A connection still in
    /// `starting` is retried up to the configured attempt count; otherwise the client
    /// is removed and its buffers recovered.
    fn client_lost(&mut self, vaddr: Endpoint) {
        let mut client = match self.detach_client(&vaddr) {
            Some(client) => client,
            None => return,
        };
        let retry = client.channel.state == ConnState::Starting
            && client.attempts + 1 < self.props.max_connection_attempts
            && !self.stopping;
        if retry {
            if let Some(addr) = vaddr.socket_addr() {
                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        logging::debug!(self.log, "retrying connection";
                                        "peer" => %vaddr,
                                        "attempt" => client.attempts + 1);
                        let attempts = client.attempts + 1;
                        // keep the engine and buffers: the upstream buffer
                        // and any unflushed packets ride along
                        let Channel {
                            engine,
                            input,
                            output,
                            ..
                        } = client.channel;
                        let mut channel = Channel::new(Transport::Tcp(stream), engine);
                        channel.input = input;
                        channel.output = output;
                        self.install_channel(channel, vaddr, attempts);
                        return;
                    }
                    Err(err) => {
                        logging::debug!(self.log, "reconnect error";
                                        "peer" => %vaddr, "error" => %err);
                    }
                }
            }
        }
        let reason = match client.channel.state {
            ConnState::Starting => "timed out",
            _ => "connection closed",
        };
        logging::debug!(self.log, "remove client"; "peer" => %vaddr, "reason" => reason);
        client.channel.set_state(ConnState::Stopped);
        let mut sink = Vec::new();
        let journal = match client.ifaddr {
            Some(ifaddr) => self.journals.get_mut(&ifaddr),
            None => None,
        };
        client
            .channel
            .engine
            .recover(true, journal.map(|j| j as &mut dyn Journal), &mut sink);
        self.apply_dispatches(sink);
        self.fire_event(PipelineEvent::RemoveClient(vaddr));
    }

    fn handle_token(&mut self, token: Token, readable: bool, writable: bool, failed: bool) {
        if token == WAKE {
            return;
        }
        if self.servers.iter().any(|s| s.token == token) {
            self.accept_loop(token);
            return;
        }
        let vaddr = match self.tokens.get(&token) {
            Some(vaddr) => vaddr.clone(),
            None => return,
        };
        self.client_event(vaddr, readable, writable, failed);
    }

    fn client_event(&mut self, vaddr: Endpoint, readable: bool, writable: bool, failed: bool) {
        let mut lost = false;
        let mut sink = Vec::new();
        {
            let client = match self.clients.get_mut(&vaddr) {
                Some(client) => client,
                None => return,
            };
            let journal = match client.ifaddr {
                Some(ifaddr) => self.journals.get_mut(&ifaddr),
                None => None,
            };
            if client.channel.state == ConnState::Starting && writable {
                match client.channel.transport.take_error() {
                    None => {
                        logging::debug!(self.log, "peer started"; "peer" => %vaddr);
                        client.channel.set_state(ConnState::Started);
                    }
                    Some(err) => {
                        logging::debug!(self.log, "connect failed";
                                        "peer" => %vaddr, "error" => %err);
                        lost = true;
                    }
                }
            }
            if !lost && readable {
                match client.channel.fill() {
                    Ok(_) => {
                        let Channel {
                            input,
                            output,
                            engine,
                            ..
                        } = &mut client.channel;
                        let received = engine.receive(
                            input,
                            output,
                            &self.services.registry,
                            &self.services.types,
                            &self.services.ids,
                            journal.map(|j| j as &mut dyn Journal),
                            &mut sink,
                        );
                        if received.is_err() {
                            logging::warn!(self.log, "stream corrupt"; "peer" => %vaddr);
                            lost = true;
                        }
                    }
                    Err(_) => lost = true,
                }
            }
            if !lost && (writable || client.channel.has_egress()) {
                if client.channel.flush().is_err() {
                    lost = true;
                }
            }
            if failed && client.channel.state != ConnState::Started {
                lost = true;
            }
            if failed && !readable && !writable {
                lost = true;
            }
        }
        self.apply_dispatches(sink);
        if lost {
            self.client_lost(vaddr);
        }
    }
    // }}}

    // routing {{{

    fn apply_dispatches(&mut self, sink: Vec<Dispatch>) {
        for dispatch in sink {
            match dispatch {
                Dispatch::Local(kernel) => self.services.router.send_local(kernel),
                Dispatch::Remote(kernel) => self.queue.push_back(Routed::Kernel(kernel)),
                Dispatch::Forward(packet) => self.services.router.forward(packet),
            }
        }
    }

    fn process_queue(&mut self) {
        while let Some(routed) = self.queue.pop_front() {
            match routed {
                Routed::Kernel(kernel) => self.route_kernel(kernel),
                Routed::Foreign(packet) => self.route_foreign(packet),
            }
        }
    }

    fn route_kernel(&mut self, kernel: KernelBox) {
        match kernel.header().phase() {
            None => {
                logging::warn!(self.log, "dropping malformed kernel";
                               "kernel" => %kernel.header());
            }
            Some(Phase::Everywhere) => self.broadcast(kernel),
            Some(Phase::Upstream) if kernel.header().destination().is_none() => {
                self.route_upstream(kernel)
            }
            Some(Phase::Downstream) if kernel.header().source().is_none() => {
                // sent to the local node because no upstream servers had
                // been available
                self.services.router.send_local(kernel);
            }
            _ => self.route_direct(kernel),
        }
    }

    fn broadcast(&mut self, kernel: KernelBox) {
        let source = kernel.header().source().cloned();
        let peers: Vec<Endpoint> = self.clients.keys().cloned().collect();
        let mut kernel = Some(kernel);
        for vaddr in peers {
            if source.as_ref() == Some(&vaddr) {
                continue;
            }
            let k = match kernel.take() {
                Some(k) => k,
                None => return,
            };
            kernel = self.write_to_client(&vaddr, k);
        }
        // one local delivery, source excluded remotely
        if let Some(kernel) = kernel {
            self.services.router.send_local(kernel);
        }
    }

    fn route_upstream(&mut self, kernel: KernelBox) {
        let source = kernel.header().source().cloned();
        let carries_parent = kernel.header().carries_parent();
        let selected = select_neighbour(
            &mut self.clients,
            source.as_ref(),
            carries_parent,
            self.props.use_localhost,
        );
        match selected {
            None => {
                if carries_parent {
                    logging::warn!(self.log, "sending a kernel carrying parent to local pipeline";
                                   "kernel" => %kernel.header());
                }
                logging::trace!(self.log, "neighbour local");
                self.services.router.send_local(kernel);
            }
            Some(vaddr) => {
                logging::trace!(self.log, "neighbour"; "peer" => %vaddr);
                let kernel = match self.ensure_identity(kernel, &vaddr) {
                    Some(kernel) => kernel,
                    None => return,
                };
                self.write_to_client(&vaddr, kernel);
            }
        }
    }

    fn route_direct(&mut self, mut kernel: KernelBox) {
        if kernel.header().destination().is_none() {
            let source = kernel.header().source().cloned();
            kernel.header_mut().set_destination(source);
        }
        let destination = match kernel.header().destination() {
            Some(destination) => destination.clone(),
            None => {
                logging::warn!(self.log, "kernel without destination";
                               "kernel" => %kernel.header());
                return;
            }
        };
        if kernel.header().phase() == Some(Phase::Somewhere) {
            kernel = match self.ensure_identity(kernel, &destination) {
                Some(kernel) => kernel,
                None => return,
            };
        }
        if !self.clients.contains_key(&destination) {
            if let Err(err) = self.connect_client(destination.clone()) {
                logging::warn!(self.log, "connect error";
                               "peer" => %destination, "error" => %err);
                let mut kernel = kernel;
                kernel
                    .header_mut()
                    .return_to_parent(ExitCode::NoUpstreamServersAvailable);
                kernel.header_mut().set_destination(None);
                self.services.router.send_local(kernel);
                return;
            }
        }
        self.write_to_client(&destination, kernel);
    }

    /// Identify the kernel from the interface ranges, or fail it back to
    /// its parent when this node serves no interfaces.
    fn ensure_identity(&mut self, mut kernel: KernelBox, dest: &Endpoint) -> Option<KernelBox> {
        if kernel.header().has_id() && kernel.header().parent().id() != 0 {
            return Some(kernel);
        }
        if !dest.is_unix() && !self.services.ids.has_ranges() {
            kernel
                .header_mut()
                .return_to_parent(ExitCode::NoUpstreamServersAvailable);
            kernel.header_mut().set_destination(None);
            self.services.router.send_local(kernel);
            return None;
        }
        // actual issuance happens in the engine as the kernel is written
        Some(kernel)
    }

    /// Hand the kernel to the peer's protocol engine and push bytes out.
    /// Returns the kernel only for broadcast sends.
    fn write_to_client(&mut self, vaddr: &Endpoint, kernel: KernelBox) -> Option<KernelBox> {
        let client = match self.clients.get_mut(vaddr) {
            Some(client) => client,
            None => {
                logging::warn!(self.log, "no client for kernel"; "peer" => %vaddr);
                return None;
            }
        };
        let journal = match client.ifaddr {
            Some(ifaddr) => self.journals.get_mut(&ifaddr),
            None => None,
        };
        let Channel {
            engine, output, ..
        } = &mut client.channel;
        let returned = engine.send(
            kernel,
            output,
            &self.services.ids,
            journal.map(|j| j as &mut dyn Journal),
        );
        if client.channel.state == ConnState::Started {
            client.channel.flush().ok();
        }
        returned
    }

    fn route_foreign(&mut self, packet: ForeignPacket) {
        let target = match &packet.wire_destination {
            Some(destination) => Some(destination.clone()),
            None => select_neighbour(&mut self.clients, packet.source.as_ref(), false, false),
        };
        let vaddr = match target {
            Some(vaddr) => vaddr,
            None => {
                logging::warn!(self.log, "no route for transit packet"; "app" => packet.app);
                return;
            }
        };
        if !self.clients.contains_key(&vaddr) {
            if let Err(err) = self.connect_client(vaddr.clone()) {
                logging::warn!(self.log, "connect error"; "peer" => %vaddr, "error" => %err);
                return;
            }
        }
        if let Some(client) = self.clients.get_mut(&vaddr) {
            let Channel {
                engine, output, ..
            } = &mut client.channel;
            if let Err(err) = engine.forward(&packet, output) {
                logging::warn!(self.log, "forward error";
                               "peer" => %vaddr, "error" => ?err);
            }
            if client.channel.state == ConnState::Started {
                client.channel.flush().ok();
            }
        }
    }
    // }}}

    // lifecycle {{{

    fn sweep_timeouts(&mut self) {
        let timeout = self.props.connection_timeout;
        let expired: Vec<Endpoint> = self
            .clients
            .iter()
            .filter(|(_, client)| {
                client.channel.state == ConnState::Starting
                    && client.channel.since.elapsed() > timeout
            })
            .map(|(vaddr, _)| vaddr.clone())
            .collect();
        for vaddr in expired {
            self.client_lost(vaddr);
        }
    }

    fn flush_all(&mut self) {
        for client in self.clients.values_mut() {
            client.channel.flush().ok();
        }
    }

    fn close_all(&mut self) {
        let peers: Vec<Endpoint> = self.clients.keys().cloned().collect();
        for vaddr in peers {
            let mut client = match self.detach_client(&vaddr) {
                Some(client) => client,
                None => continue,
            };
            let mut sink = Vec::new();
            client.channel.engine.recover(true, None, &mut sink);
            for dispatch in sink {
                match dispatch {
                    Dispatch::Local(kernel) => self.services.router.send_local(kernel),
                    Dispatch::Remote(mut kernel) => {
                        // no peers are coming back; fail the kernel home
                        kernel
                            .header_mut()
                            .return_to_parent(ExitCode::EndpointNotConnected);
                        self.services.router.send_local(kernel);
                    }
                    Dispatch::Forward(packet) => {
                        logging::debug!(self.log, "dropping transit packet at shutdown";
                                        "app" => packet.app);
                    }
                }
            }
        }
        for server in &mut self.servers {
            self.poll.registry().deregister(&mut server.listener).ok();
        }
        self.servers.clear();
        logging::info!(self.log, "socket pipeline stopped");
    }
    // }}}

    fn fire_event(&mut self, event: PipelineEvent) {
        if let Some(listener) = self.listener {
            let kernel = PipelineEventKernel::new(event, listener);
            self.services.router.send_local(Box::new(kernel));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Peer {
        started: bool,
        weight: u32,
        max_weight: u32,
    }

    impl Peer {
        fn new(max_weight: u32) -> Peer {
            Peer {
                started: true,
                weight: 0,
                max_weight,
            }
        }
    }

    impl Selectable for Peer {
        fn is_started(&self) -> bool {
            self.started
        }

        fn weight(&self) -> u32 {
            self.weight
        }

        fn set_weight(&mut self, weight: u32) {
            self.weight = weight;
        }

        fn max_weight(&self) -> u32 {
            self.max_weight
        }
    }

    fn addr(d: u8) -> Endpoint {
        Endpoint::v4(10, 0, 0, d, 5000)
    }

    #[test]
    fn test_no_clients_is_local() {
        let mut clients: BTreeMap<Endpoint, Peer> = BTreeMap::new();
        assert_eq!(select_neighbour(&mut clients, None, false, true), None);
    }

    #[test]
    fn test_no_started_clients_is_local() {
        let mut clients = BTreeMap::new();
        let mut peer = Peer::new(2);
        peer.started = false;
        clients.insert(addr(2), peer);
        assert_eq!(select_neighbour(&mut clients, None, false, true), None);
    }

    #[test]
    fn test_selection_is_weight_proportional() {
        // peer 2 advertises capacity 4, peer 3 capacity 1: over one full
        // round peer 2 takes four kernels, peer 3 takes one, then the
        // saturated round resets and yields a local turn
        let mut clients = BTreeMap::new();
        clients.insert(addr(2), Peer::new(4));
        clients.insert(addr(3), Peer::new(1));

        let mut picks = Vec::new();
        for _ in 0..5 {
            picks.push(select_neighbour(&mut clients, None, false, true).unwrap());
        }
        assert_eq!(picks.iter().filter(|p| **p == addr(2)).count(), 4);
        assert_eq!(picks.iter().filter(|p| **p == addr(3)).count(), 1);

        // everyone full: weights reset, this round goes local
        assert_eq!(select_neighbour(&mut clients, None, false, true), None);
        assert_eq!(clients.get(&addr(2)).unwrap().weight, 0);

        // and the next round starts over deterministically
        assert_eq!(
            select_neighbour(&mut clients, None, false, true),
            Some(addr(2))
        );
    }

    #[test]
    fn test_source_is_excluded() {
        let mut clients = BTreeMap::new();
        clients.insert(addr(2), Peer::new(10));
        clients.insert(addr(3), Peer::new(10));
        let source = addr(2);
        assert_eq!(
            select_neighbour(&mut clients, Some(&source), false, true),
            Some(addr(3))
        );
    }

    #[test]
    fn test_ties_break_in_address_order() {
        let mut clients = BTreeMap::new();
        clients.insert(addr(9), Peer::new(10));
        clients.insert(addr(2), Peer::new(10));
        clients.insert(addr(5), Peer::new(10));
        assert_eq!(
            select_neighbour(&mut clients, None, false, true),
            Some(addr(2))
        );
    }

    #[test]
    fn test_carried_parent_never_goes_local_on_reset() {
        let mut clients = BTreeMap::new();
        clients.insert(addr(2), Peer::new(1));
        // saturate
        assert_eq!(
            select_neighbour(&mut clients, None, false, true),
            Some(addr(2))
        );
        // a kernel carrying its parent gets a peer even on the reset round
        assert_eq!(
            select_neighbour(&mut clients, None, true, true),
            Some(addr(2))
        );
    }
}
