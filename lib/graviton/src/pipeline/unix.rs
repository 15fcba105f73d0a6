//! The Unix-domain pipeline: the local control surface. External tools
//! connect to the daemon's socket to submit status requests and jobs; the
//! same pipeline serves as the client side for those tools.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token, Waker};

use quark::logging::{self, Logger};

use crate::addr::Endpoint;
use crate::app::AppId;
use crate::factory::{KernelSink, Services};
use crate::kernel::{Kernel, KernelBox};
use crate::pipeline::conn::{Channel, ConnState, Transport};
use crate::proto::{Dispatch, ForeignOrigin, ProtocolEngine};

const WAKE: Token = Token(0);
const LISTENER: Token = Token(1);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

enum Command {
    Submit(KernelBox),
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
pub struct UnixPipeline {
    shared: Arc<Shared>,
    path: PathBuf,
    this_app: AppId,
}

impl UnixPipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        path: PathBuf,
        this_app: AppId,
        log: L,
    ) -> UnixPipeline {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        UnixPipeline {
            shared: Arc::new(Shared {
                commands: Mutex::new(VecDeque::new()),
                waker: Mutex::new(None),
                thread: Mutex::new(None),
                log,
            }),
            path,
            this_app,
        }
    }

    pub fn start(&self, services: Services) {
        let poll = Poll::new().expect("Error creating the poller");
        let waker = Waker::new(poll.registry(), WAKE).expect("Error creating the waker");
        *lock(&self.shared.waker) = Some(waker);

        let shared = self.shared.clone();
        let path = self.path.clone();
        let this_app = self.this_app;
        let handle = std::thread::Builder::new()
            .name("unix-pipeline".into())
            .spawn(move || {
                let log = shared.log.new(logging::o!());
                UnixLoop::new(poll, shared, path, this_app, services, log).run();
            })
            .expect("Error spawning the unix pipeline thread");
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

    pub fn send(&self, kernel: KernelBox) {
        self.shared.push(Command::Submit(kernel));
    }
}

impl KernelSink for UnixPipeline {
    fn submit(&self, kernel: KernelBox) {
        self.send(kernel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct UnixLoop {
    poll: Poll,
    shared: Arc<Shared>,
    path: PathBuf,
    this_app: AppId,
    services: Services,
    listener: Option<UnixListener>,
    clients: HashMap<Token, Channel>,
    by_endpoint: BTreeMap<Endpoint, Token>,
    next_token: usize,
    queue: VecDeque<KernelBox>,
    stopping: bool,
    log: Logger,
}

impl UnixLoop {
    fn new(
        poll: Poll,
        shared: Arc<Shared>,
        path: PathBuf,
        this_app: AppId,
        services: Services,
        log: Logger,
    ) -> UnixLoop {
        UnixLoop {
            poll,
            shared,
            path,
            this_app,
            services,
            listener: None,
            clients: HashMap::new(),
            by_endpoint: BTreeMap::new(),
            next_token: 2,
            queue: VecDeque::new(),
            stopping: false,
            log,
        }
    }

    fn run(mut self) {
        // a stale socket file blocks the bind
        std::fs::remove_file(&self.path).ok();
        match UnixListener::bind(&self.path) {
            Ok(mut listener) => {
                if let Err(err) =
                    self.poll
                        .registry()
                        .register(&mut listener, LISTENER, Interest::READABLE)
                {
                    logging::error!(self.log, "register error"; "error" => %err);
                    return;
                }
                logging::info!(self.log, "listening";
                               "path" => %self.path.display());
                self.listener = Some(listener);
            }
            Err(err) => {
                logging::error!(self.log, "bind error";
                                "path" => %self.path.display(), "error" => %err);
                return;
            }
        }

        let mut events = Events::with_capacity(256);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
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
                match token {
                    WAKE => {}
                    LISTENER => self.accept_loop(),
                    token => self.client_event(token, readable, writable, failed),
                }
            }
            self.process_queue();

            if self.stopping {
                let drained =
                    self.queue.is_empty() && self.clients.values().all(|c| !c.has_egress());
                if drained {
                    std::fs::remove_file(&self.path).ok();
                    logging::info!(self.log, "unix pipeline stopped");
                    return;
                }
                for channel in self.clients.values_mut() {
                    channel.flush().ok();
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
            match command {
                Some(Command::Submit(kernel)) => self.queue.push_back(kernel),
                Some(Command::Stop) => self.stopping = true,
                None => return,
            }
        }
    }

    fn synthetic_endpoint(token: Token) -> Endpoint {
        Endpoint::Unix(PathBuf::from(format!("@unix-{}", token.0)))
    }

    fn new_engine(&self, peer: Endpoint) -> ProtocolEngine {
        let mut engine = ProtocolEngine::new(self.this_app, &self.log);
        engine.set_origin(ForeignOrigin::Unix);
        engine.set_peer(Some(peer));
        engine
    }

    fn install(&mut self, stream: UnixStream, endpoint: Option<Endpoint>) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        let endpoint = endpoint.unwrap_or_else(|| Self::synthetic_endpoint(token));
        let engine = self.new_engine(endpoint.clone());
        let mut channel = Channel::new(Transport::Unix(stream), engine);
        if let Err(err) = channel.transport.register(self.poll.registry(), token) {
            logging::error!(self.log, "register error"; "error" => %err);
            return token;
        }
        channel.set_state(ConnState::Started);
        self.clients.insert(token, channel);
        self.by_endpoint.insert(endpoint, token);
        token
    }

    fn accept_loop(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, _)) => {
                    let token = self.install(stream, None);
                    logging::debug!(self.log, "accept"; "token" => token.0);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept error"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn client_event(&mut self, token: Token, readable: bool, writable: bool, failed: bool) {
        let mut lost = false;
        let mut sink = Vec::new();
        {
            let channel = match self.clients.get_mut(&token) {
                Some(channel) => channel,
                None => return,
            };
            if readable {
                match channel.fill() {
                    Ok(_) => {
                        let Channel {
                            input,
                            output,
                            engine,
                            ..
                        } = channel;
                        if engine
                            .receive(
                                input,
                                output,
                                &self.services.registry,
                                &self.services.types,
                                &self.services.ids,
                                None,
                                &mut sink,
                            )
                            .is_err()
                        {
                            lost = true;
                        }
                    }
                    Err(_) => lost = true,
                }
            }
            if !lost && (writable || channel.has_egress()) {
                if channel.flush().is_err() {
                    lost = true;
                }
            }
            if failed && !readable {
                lost = true;
            }
        }
        for dispatch in sink {
            match dispatch {
                Dispatch::Local(kernel) => self.services.router.send_local(kernel),
                Dispatch::Remote(kernel) => self.services.router.send_remote(kernel),
                Dispatch::Forward(packet) => self.services.router.forward(packet),
            }
        }
        if lost {
            self.client_lost(token);
        }
    }

    fn client_lost(&mut self, token: Token) {
        let mut channel = match self.clients.remove(&token) {
            Some(channel) => channel,
            None => return,
        };
        self.by_endpoint.retain(|_, t| *t != token);
        channel.transport.deregister(self.poll.registry()).ok();
        let mut sink = Vec::new();
        channel.engine.recover(true, None, &mut sink);
        for dispatch in sink {
            match dispatch {
                Dispatch::Local(kernel) => self.services.router.send_local(kernel),
                Dispatch::Remote(kernel) => self.services.router.send_remote(kernel),
                Dispatch::Forward(_) => {}
            }
        }
        logging::debug!(self.log, "client closed"; "token" => token.0);
    }

    fn process_queue(&mut self) {
        while let Some(kernel) = self.queue.pop_front() {
            self.route_kernel(kernel);
        }
    }

    fn route_kernel(&mut self, kernel: KernelBox) {
        let destination = match kernel.header().destination() {
            Some(destination) => destination.clone(),
            None => {
                logging::warn!(self.log, "unix kernel without destination";
                               "kernel" => %kernel.header());
                return;
            }
        };
        let token = match self.by_endpoint.get(&destination) {
            Some(token) => *token,
            None => match &destination {
                Endpoint::Unix(path) if !path.to_string_lossy().starts_with('@') => {
                    match UnixStream::connect(path) {
                        Ok(stream) => self.install(stream, Some(destination.clone())),
                        Err(err) => {
                            logging::warn!(self.log, "connect error";
                                           "path" => %path.display(), "error" => %err);
                            return;
                        }
                    }
                }
                _ => {
                    logging::warn!(self.log, "no connection for kernel";
                                   "kernel" => %kernel.header());
                    return;
                }
            },
        };
        if let Some(channel) = self.clients.get_mut(&token) {
            let Channel {
                engine, output, ..
            } = channel;
            engine.send(kernel, output, &self.services.ids, None);
            channel.flush().ok();
        }
    }
}
