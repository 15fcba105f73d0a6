//! The child-process side of the process handler: a single pipe connection
//! back to the parent daemon on the file descriptors the parent wired up
//! at spawn time. Kernels the child cannot execute locally (and its
//! finished main kernel) travel up this pipe.

use std::collections::VecDeque;
use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::pipe;
use mio::{Events, Poll, Token, Waker};

use quark::logging::{self, Logger};

use crate::app::AppId;
use crate::factory::{KernelSink, Services};
use crate::kernel::{Kernel, KernelBox};
use crate::pipeline::conn::{Channel, ConnState, Transport};
use crate::proto::{Dispatch, ForeignOrigin, ProtocolEngine};

const WAKE: Token = Token(0);
const PARENT: Token = Token(1);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

// the parent connects these descriptors before exec
const INPUT_FD: i32 = 0;
const OUTPUT_FD: i32 = 1;

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

/// The parent link of an application process.
#[derive(Clone)]
pub struct ChildPipeline {
    shared: Arc<Shared>,
    this_app: AppId,
}

impl ChildPipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(this_app: AppId, log: L) -> ChildPipeline {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        ChildPipeline {
            shared: Arc::new(Shared {
                commands: Mutex::new(VecDeque::new()),
                waker: Mutex::new(None),
                thread: Mutex::new(None),
                log,
            }),
            this_app,
        }
    }

    pub fn start(&self, services: Services) {
        let poll = Poll::new().expect("Error creating the poller");
        let waker = Waker::new(poll.registry(), WAKE).expect("Error creating the waker");
        *lock(&self.shared.waker) = Some(waker);

        let shared = self.shared.clone();
        let this_app = self.this_app;
        let handle = std::thread::Builder::new()
            .name("child-pipeline".into())
            .spawn(move || {
                let log = shared.log.new(logging::o!());
                ChildLoop::new(poll, shared, this_app, services, log).run();
            })
            .expect("Error spawning the child pipeline thread");
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

impl KernelSink for ChildPipeline {
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

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

struct ChildLoop {
    poll: Poll,
    shared: Arc<Shared>,
    this_app: AppId,
    services: Services,
    parent: Option<Channel>,
    queue: VecDeque<KernelBox>,
    stopping: bool,
    log: Logger,
}

impl ChildLoop {
    fn new(
        poll: Poll,
        shared: Arc<Shared>,
        this_app: AppId,
        services: Services,
        log: Logger,
    ) -> ChildLoop {
        ChildLoop {
            poll,
            shared,
            this_app,
            services,
            parent: None,
            queue: VecDeque::new(),
            stopping: false,
            log,
        }
    }

    fn attach_parent(&mut self) {
        set_nonblocking(INPUT_FD);
        set_nonblocking(OUTPUT_FD);
        let input = unsafe { pipe::Receiver::from_raw_fd(INPUT_FD) };
        let output = unsafe { pipe::Sender::from_raw_fd(OUTPUT_FD) };

        let mut engine = ProtocolEngine::new(self.this_app, &self.log);
        engine.set_origin(ForeignOrigin::Process);

        let mut channel = Channel::new(Transport::Pipe { input, output }, engine);
        if let Err(err) = channel.transport.register(self.poll.registry(), PARENT) {
            logging::error!(self.log, "register error"; "error" => %err);
            return;
        }
        channel.set_state(ConnState::Started);
        self.parent = Some(channel);
    }

    fn run(mut self) {
        self.attach_parent();
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if err.kind() != std::io::ErrorKind::Interrupted {
                    logging::error!(self.log, "poll error"; "error" => %err);
                    return;
                }
            }
            let ready: Vec<(bool, bool, bool)> = events
                .iter()
                .filter(|event| event.token() == PARENT)
                .map(|event| {
                    (
                        event.is_readable(),
                        event.is_writable(),
                        event.is_error() || event.is_read_closed(),
                    )
                })
                .collect();

            self.drain_commands();
            for (readable, writable, failed) in ready {
                self.parent_event(readable, writable, failed);
            }
            self.process_queue();

            if self.stopping {
                if let Some(parent) = &mut self.parent {
                    parent.flush().ok();
                }
                let drained = self.queue.is_empty()
                    && self.parent.as_ref().map(|p| !p.has_egress()).unwrap_or(true);
                if drained {
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
            match command {
                Some(Command::Submit(kernel)) => self.queue.push_back(kernel),
                Some(Command::Stop) => self.stopping = true,
                None => return,
            }
        }
    }

    fn parent_event(&mut self, readable: bool, writable: bool, failed: bool) {
        let mut lost = false;
        let mut sink = Vec::new();
        if let Some(parent) = &mut self.parent {
            if readable {
                match parent.fill() {
                    Ok(_) => {
                        let Channel {
                            input,
                            output,
                            engine,
                            ..
                        } = parent;
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
            if !lost && (writable || parent.has_egress()) {
                if parent.flush().is_err() {
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
                Dispatch::Forward(_) => {}
            }
        }
        if lost {
            // the parent daemon is gone; finish what is queued locally
            logging::warn!(self.log, "lost the parent link");
            if let Some(mut parent) = self.parent.take() {
                let mut sink = Vec::new();
                parent.engine.recover(true, None, &mut sink);
                for dispatch in sink {
                    if let Dispatch::Local(kernel) = dispatch {
                        self.services.router.send_local(kernel);
                    }
                }
            }
        }
    }

    fn process_queue(&mut self) {
        while let Some(mut kernel) = self.queue.pop_front() {
            if kernel.header().source_app() == 0 {
                kernel.header_mut().set_source_app(self.this_app);
            }
            match &mut self.parent {
                Some(parent) => {
                    let Channel {
                        engine, output, ..
                    } = parent;
                    engine.send(kernel, output, &self.services.ids, None);
                    parent.flush().ok();
                }
                None => {
                    // no parent: execute everything locally
                    self.services.router.send_local(kernel);
                }
            }
        }
    }
}
