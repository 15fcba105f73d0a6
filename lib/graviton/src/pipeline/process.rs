//! The process pipeline: one pipe-pair connection per child application.
//! Kernels crossing the parent/child boundary are framed exactly like
//! socket traffic, minus the source/destination prefix; everything a child
//! emits is transit traffic for its own application and is forwarded into
//! the cluster fabric. A main kernel (wire type 1) coming back downstream
//! completes the job.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::{HashMap, HashSet};
use mio::unix::pipe;
use mio::{Events, Poll, Token, Waker};

use quark::logging::{self, Logger};

use crate::app::{AppId, Application};
use crate::factory::{ForeignSink, Services};
use crate::kernel::ExitCode;
use crate::pipeline::conn::{Channel, ConnState, Transport};
use crate::pipeline::event::ProcessEventKernel;
use crate::proto::{Dispatch, ForeignOrigin, ForeignPacket, ProtocolEngine};
use crate::types::MAIN_KERNEL_TYPE;

const WAKE: Token = Token(0);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
// children get this long to exit after SIGTERM before the reaper gives up
const REAP_INTERVAL: Duration = Duration::from_millis(100);

enum Command {
    Add(Application),
    Remove(AppId),
    Forward(ForeignPacket),
    Stop,
}

struct Shared {
    commands: Mutex<VecDeque<Command>>,
    waker: Mutex<Option<Waker>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    apps: Mutex<HashSet<AppId>>,
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
pub struct ProcessPipeline {
    shared: Arc<Shared>,
    allow_root: bool,
}

impl ProcessPipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(allow_root: bool, log: L) -> ProcessPipeline {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        ProcessPipeline {
            shared: Arc::new(Shared {
                commands: Mutex::new(VecDeque::new()),
                waker: Mutex::new(None),
                thread: Mutex::new(None),
                apps: Mutex::new(HashSet::new()),
                log,
            }),
            allow_root,
        }
    }

    pub fn start(&self, services: Services) {
        let poll = Poll::new().expect("Error creating the poller");
        let waker = Waker::new(poll.registry(), WAKE).expect("Error creating the waker");
        *lock(&self.shared.waker) = Some(waker);

        let shared = self.shared.clone();
        let allow_root = self.allow_root;
        let handle = std::thread::Builder::new()
            .name("process-pipeline".into())
            .spawn(move || {
                let log = shared.log.new(logging::o!());
                ProcessLoop::new(poll, shared, allow_root, services, log).run();
            })
            .expect("Error spawning the process pipeline thread");
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

    /// Launch a child application and attach its pipe connection.
    pub fn add(&self, app: Application) {
        lock(&self.shared.apps).insert(app.id);
        self.shared.push(Command::Add(app));
    }

    /// Terminate a job and drop its connection.
    pub fn remove(&self, app: AppId) {
        lock(&self.shared.apps).remove(&app);
        self.shared.push(Command::Remove(app));
    }

    pub fn has_app(&self, app: AppId) -> bool {
        lock(&self.shared.apps).contains(&app)
    }
}

impl ForeignSink for ProcessPipeline {
    fn forward(&self, packet: ForeignPacket) -> Result<(), ForeignPacket> {
        // traffic coming *from* a child is never echoed back into it
        if packet.origin == ForeignOrigin::Process || !self.has_app(packet.app) {
            return Err(packet);
        }
        self.shared.push(Command::Forward(packet));
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct Job {
    app: Application,
    child: std::process::Child,
    channel: Channel,
    token: Token,
}

struct ProcessLoop {
    poll: Poll,
    shared: Arc<Shared>,
    allow_root: bool,
    services: Services,
    jobs: HashMap<AppId, Job>,
    tokens: HashMap<Token, AppId>,
    next_token: usize,
    stopping: bool,
    log: Logger,
}

impl ProcessLoop {
    fn new(
        poll: Poll,
        shared: Arc<Shared>,
        allow_root: bool,
        services: Services,
        log: Logger,
    ) -> ProcessLoop {
        ProcessLoop {
            poll,
            shared,
            allow_root,
            services,
            jobs: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            stopping: false,
            log,
        }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = quark::choose!(self.stopping => REAP_INTERVAL, POLL_INTERVAL);
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
                        event.is_error() || event.is_read_closed(),
                    )
                })
                .collect();

            self.drain_commands();
            for (token, readable, writable, failed) in ready {
                if token != WAKE {
                    self.job_event(token, readable, writable, failed);
                }
            }
            self.reap();

            if self.stopping && self.jobs.is_empty() {
                logging::info!(self.log, "process pipeline stopped");
                return;
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
                Some(Command::Add(app)) => self.add_job(app),
                Some(Command::Remove(app)) => self.remove_job(app, None),
                Some(Command::Forward(packet)) => self.forward_to_child(packet),
                Some(Command::Stop) => {
                    self.stopping = true;
                    let apps: Vec<AppId> = self.jobs.keys().copied().collect();
                    for app in apps {
                        self.terminate(app);
                    }
                }
                None => return,
            }
        }
    }

    fn add_job(&mut self, app: Application) {
        if !self.allow_root && unsafe { libc::getuid() } == 0 {
            logging::error!(self.log, "refusing to run application as the superuser";
                            "app" => app.id);
            lock(&self.shared.apps).remove(&app.id);
            return;
        }
        let spawned = std::process::Command::new(&app.exec_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                logging::error!(self.log, "spawn error";
                                "app" => app.id,
                                "path" => %app.exec_path.display(),
                                "error" => %err);
                lock(&self.shared.apps).remove(&app.id);
                return;
            }
        };
        let stdin = child.stdin.take().expect("Child stdin is piped");
        let stdout = child.stdout.take().expect("Child stdout is piped");
        let output = pipe::Sender::from(stdin);
        let input = pipe::Receiver::from(stdout);

        let mut engine = ProtocolEngine::new(0, &self.log);
        engine.set_origin(ForeignOrigin::Process);
        engine.set_other_app(Some(app.clone()));

        let mut channel = Channel::new(Transport::Pipe { input, output }, engine);
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(err) = channel.transport.register(self.poll.registry(), token) {
            logging::error!(self.log, "register error"; "app" => app.id, "error" => %err);
            child.kill().ok();
            return;
        }
        channel.set_state(ConnState::Started);
        logging::info!(self.log, "job started";
                       "app" => app.id,
                       "pid" => child.id(),
                       "path" => %app.exec_path.display());
        self.tokens.insert(token, app.id);
        self.jobs.insert(
            app.id,
            Job {
                app,
                child,
                channel,
                token,
            },
        );
    }

    fn forward_to_child(&mut self, packet: ForeignPacket) {
        let app = packet.app;
        if let Some(job) = self.jobs.get_mut(&app) {
            let Channel {
                engine, output, ..
            } = &mut job.channel;
            if let Err(err) = engine.forward(&packet, output) {
                logging::warn!(self.log, "forward error"; "app" => app, "error" => ?err);
            }
            if job.channel.flush().is_err() {
                self.terminate(app);
            }
        }
    }

    fn terminate(&mut self, app: AppId) {
        if let Some(job) = self.jobs.get(&app) {
            unsafe {
                libc::kill(job.child.id() as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    fn remove_job(&mut self, app: AppId, status: Option<i32>) {
        let mut job = match self.jobs.remove(&app) {
            Some(job) => job,
            None => return,
        };
        self.tokens.remove(&job.token);
        lock(&self.shared.apps).remove(&app);
        job.channel.transport.deregister(self.poll.registry()).ok();
        let status = status.unwrap_or(0);
        logging::info!(self.log, "job terminated";
                       "app" => app,
                       "path" => %job.app.exec_path.display(),
                       "status" => status);
        if job.app.wait_for_completion {
            self.services.shutdown.record_status(status);
        }
        if let Some(listener) = self.services.router.master() {
            let event = ProcessEventKernel::new(app, status, listener);
            self.services.router.send_local(Box::new(event));
        }
        // collect the exit status off-thread so no zombie lingers
        std::thread::spawn(move || {
            let mut child = job.child;
            child.wait().ok();
        });
    }

    fn job_event(&mut self, token: Token, readable: bool, writable: bool, failed: bool) {
        let app = match self.tokens.get(&token) {
            Some(app) => *app,
            None => return,
        };
        let mut lost = false;
        let mut sink = Vec::new();
        {
            let job = match self.jobs.get_mut(&app) {
                Some(job) => job,
                None => return,
            };
            if readable {
                match job.channel.fill() {
                    Ok(_) => {
                        let Channel {
                            input,
                            output,
                            engine,
                            ..
                        } = &mut job.channel;
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
            if !lost && (writable || job.channel.has_egress()) {
                if job.channel.flush().is_err() {
                    lost = true;
                }
            }
            if failed && !readable {
                lost = true;
            }
        }
        for dispatch in sink {
            self.apply_dispatch(app, dispatch);
        }
        if lost {
            // the pipe went away; the reaper collects the exit status
            self.terminate(app);
        }
    }

    fn apply_dispatch(&mut self, app: AppId, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Local(kernel) => self.services.router.send_local(kernel),
            Dispatch::Remote(kernel) => self.services.router.send_remote(kernel),
            Dispatch::Forward(packet) => {
                let main_returned = packet.frame_type() == Some(MAIN_KERNEL_TYPE)
                    && packet.frame_result().map(|r| r != 0).unwrap_or(false);
                if main_returned {
                    // the application's main kernel came home: the job is done
                    let status = match packet.frame_result() {
                        Some(result) if result == ExitCode::Success as u16 => 0,
                        Some(result) => result as i32,
                        None => 0,
                    };
                    logging::info!(self.log, "application finished";
                                   "app" => app, "status" => status);
                    self.terminate(app);
                    self.remove_job(app, Some(status));
                } else {
                    self.services.router.forward(packet);
                }
            }
        }
    }

    fn reap(&mut self) {
        let mut finished: Vec<(AppId, i32)> = Vec::new();
        for (app, job) in self.jobs.iter_mut() {
            match job.child.try_wait() {
                Ok(Some(status)) => {
                    finished.push((*app, status.code().unwrap_or(1)));
                }
                Ok(None) => {}
                Err(err) => {
                    logging::warn!(self.log, "wait error"; "app" => *app, "error" => %err);
                }
            }
        }
        for (app, status) in finished {
            self.remove_job(app, Some(status));
        }
    }
}
