//! The worker-pool pipeline. A mutex+condvar queue feeds a small fixed set
//! of threads, one per hardware CPU by default. Workers resolve a kernel's
//! principal, run `act`/`react` with panic isolation and route whatever the
//! kernel decided afterwards.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use quark::logging::{self, Logger};

use crate::addr::Endpoint;
use crate::api::{Context, Outgoing};
use crate::factory::{KernelSink, Services};
use crate::kernel::{ExitCode, Flags, Kernel, KernelBox, Link};
use crate::registry::Checkout;

struct State {
    queue: VecDeque<KernelBox>,
    stopped: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    num_threads: usize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    log: Logger,
}

#[derive(Clone)]
pub struct LocalPipeline {
    inner: Arc<Inner>,
}

impl LocalPipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(num_threads: usize, log: L) -> LocalPipeline {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        let num_threads = if num_threads == 0 {
            thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            num_threads
        };
        LocalPipeline {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    stopped: false,
                }),
                cv: Condvar::new(),
                num_threads,
                threads: Mutex::new(Vec::new()),
                log,
            }),
        }
    }

    pub fn start(&self, services: Services) {
        let mut threads = lock(&self.inner.threads);
        for index in 0..self.inner.num_threads {
            let inner = self.inner.clone();
            let services = services.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || worker_loop(inner, services))
                .expect("Error spawning a worker thread");
            threads.push(handle);
        }
        logging::info!(self.inner.log, "worker pool started";
                       "threads" => self.inner.num_threads);
    }

    pub fn send(&self, kernel: KernelBox) {
        let mut state = lock(&self.inner.state);
        if state.stopped {
            logging::debug!(self.inner.log, "dropping kernel, pipeline stopped";
                            "kernel" => %kernel.header());
            return;
        }
        if kernel.header().flags().contains(Flags::PRIORITY) {
            state.queue.push_front(kernel);
        } else {
            state.queue.push_back(kernel);
        }
        self.inner.cv.notify_one();
    }

    pub fn stop(&self) {
        let mut state = lock(&self.inner.state);
        state.stopped = true;
        self.inner.cv.notify_all();
    }

    pub fn wait(&self) {
        let handles: Vec<_> = lock(&self.inner.threads).drain(..).collect();
        for handle in handles {
            handle.join().ok();
        }
    }
}

impl KernelSink for LocalPipeline {
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

fn worker_loop(inner: Arc<Inner>, services: Services) {
    loop {
        let kernel = {
            let mut state = lock(&inner.state);
            loop {
                if let Some(kernel) = state.queue.pop_front() {
                    break kernel;
                }
                if state.stopped {
                    return;
                }
                state = match inner.cv.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        };
        dispatch(kernel, &services, &inner.log);
    }
}

/// One kernel through the worker: resolve the principal and run the user
/// code.
fn dispatch(kernel: KernelBox, services: &Services, log: &Logger) {
    if kernel.header().principal().is_set() {
        deliver_to_principal(kernel, services, log);
    } else if kernel.header().result().is_defined() {
        if !kernel.header().parent().is_set() {
            complete_root(kernel, services, log);
        } else {
            logging::warn!(log, "kernel with a result but nowhere to go";
                           "kernel" => %kernel.header());
        }
    } else {
        run_act(kernel, services, log);
    }
}

/// A finished root kernel. In a daemon its result becomes the process exit
/// status; in an application process the kernel travels up the parent pipe
/// instead, announcing completion to the daemon that spawned us.
fn complete_root(kernel: KernelBox, services: &Services, log: &Logger) {
    if let Some(child) = services.router.child() {
        logging::info!(log, "main kernel finished, notifying parent";
                       "kernel" => %kernel.header());
        child.submit(kernel);
        return;
    }
    let code = exit_status(kernel.header().result());
    logging::info!(log, "root kernel finished";
                   "kernel" => %kernel.header(),
                   "exit_code" => code);
    services.shutdown.request(code);
}

fn exit_status(result: ExitCode) -> i32 {
    match result {
        ExitCode::Undefined | ExitCode::Success => 0,
        other => other as i32,
    }
}

fn run_act(mut kernel: KernelBox, services: &Services, log: &Logger) {
    let mut ctx = Context::new(&services.router, &services.registry, &services.ids, log);
    let panicked = catch_unwind(AssertUnwindSafe(|| kernel.act(&mut ctx))).is_err();
    if panicked {
        logging::error!(log, "kernel panicked in act"; "kernel" => %kernel.header());
        kernel.header_mut().return_to_parent(ExitCode::UserError);
        route_back(kernel, services, log);
        return;
    }
    let spawned = ctx.spawned();
    let redirect = ctx.take_redirect();
    let outbox = ctx.take_outbox();
    if let Some(target) = redirect {
        kernel.header_mut().set_principal(Link::Id(target));
        services.router.send_local(kernel);
        apply_outbox(outbox, services);
        return;
    }
    // the kernel settles before its children leave, so a fast reply always
    // finds its waiting parent
    settle(kernel, spawned, services, log);
    apply_outbox(outbox, services);
}

fn deliver_to_principal(mut kernel: KernelBox, services: &Services, log: &Logger) {
    let principal_id = kernel.header().principal().id();

    // a carried parent travels with its child and is never registered here
    let parent_is_carried = matches!(
        kernel.header().parent(),
        Link::Kernel(parent) if parent.header().id() == principal_id
    );
    if parent_is_carried {
        if let Link::Kernel(parent) = kernel.header_mut().parent_mut().take() {
            kernel.header_mut().set_parent(Link::Id(principal_id));
            run_react(parent, kernel, false, services, log);
        }
        return;
    }

    match services.registry.checkout(principal_id) {
        Checkout::Kernel(principal) => run_react(principal, kernel, true, services, log),
        Checkout::Busy => {
            // the principal is mid-dispatch on another worker; come back
            services.router.send_local(kernel);
        }
        Checkout::Missing => {
            logging::debug!(log, "no principal found"; "kernel" => %kernel.header());
            if kernel.header().parent().is_set() {
                kernel
                    .header_mut()
                    .return_to_parent(ExitCode::NoPrincipalFound);
                route_back(kernel, services, log);
            } else {
                logging::warn!(log, "dropping unroutable kernel";
                               "kernel" => %kernel.header());
            }
        }
    }
}

fn run_react(
    mut principal: KernelBox,
    child: KernelBox,
    registered: bool,
    services: &Services,
    log: &Logger,
) {
    let principal_id = principal.header().id();
    let mut ctx = Context::new(&services.router, &services.registry, &services.ids, log);
    let panicked = catch_unwind(AssertUnwindSafe(|| principal.react(child, &mut ctx))).is_err();
    if panicked {
        logging::error!(log, "kernel panicked in react"; "kernel" => %principal.header());
        if registered {
            services.registry.erase(principal_id);
        }
        principal.header_mut().return_to_parent(ExitCode::UserError);
        route_back(principal, services, log);
        return;
    }
    let outbox = ctx.take_outbox();

    // the principal settles before its sends leave, so a fast reply always
    // finds it
    let committed =
        principal.header().principal().is_set() || principal.header().result().is_defined();
    if committed {
        if registered {
            services.registry.erase(principal_id);
        }
        route_back(principal, services, log);
    } else if registered {
        services.registry.checkin(principal);
    } else if principal.header().flags().contains(Flags::DO_NOT_DELETE) {
        if services.registry.insert(principal).is_err() {
            logging::warn!(log, "unable to keep kernel registered"; "id" => principal_id);
        }
    }
    // otherwise the principal is done and dropped here
    apply_outbox(outbox, services);
}

/// Post-`act` bookkeeping: a committed kernel travels on, a waiting parent
/// moves into the instance registry, everything else is finished.
fn settle(mut kernel: KernelBox, spawned: usize, services: &Services, log: &Logger) {
    let committed = kernel.header().principal().is_set() || kernel.header().result().is_defined();
    if committed {
        route_back(kernel, services, log);
        return;
    }
    let keep = spawned > 0 || kernel.header().flags().contains(Flags::DO_NOT_DELETE);
    if keep {
        if !kernel.header().has_id() {
            kernel.header_mut().set_id(services.ids.issue_local());
        }
        if let Err(kernel) = services.registry.insert(kernel) {
            logging::warn!(log, "unable to register waiting kernel";
                           "kernel" => %kernel.header());
        }
    }
}

fn apply_outbox(outbox: Vec<Outgoing>, services: &Services) {
    for outgoing in outbox {
        match outgoing {
            Outgoing::Local(kernel) => services.router.send_local(kernel),
            Outgoing::Remote(kernel) => services.router.send_remote(kernel),
            Outgoing::Timer(kernel) => services.router.send_timer(kernel),
            Outgoing::Unix(kernel) => services.router.send_unix(kernel),
        }
    }
}

/// Route a committed kernel toward its principal: across the wire when it
/// came from (or is aimed at) another node, back through the local queue
/// otherwise.
fn route_back(mut kernel: KernelBox, services: &Services, log: &Logger) {
    let header = kernel.header();
    if !header.principal().is_set() && !header.parent().is_set() {
        complete_root(kernel, services, log);
        return;
    }
    if header.result().is_defined() {
        // a reply travels to wherever the request came from; whatever the
        // request was addressed with is stale now
        let source = header.source().cloned();
        match source {
            Some(source) => {
                let unix = source.is_unix();
                kernel.header_mut().set_destination(Some(source));
                if unix {
                    services.router.send_unix(kernel);
                } else {
                    services.router.send_remote(kernel);
                }
            }
            None => services.router.send_local(kernel),
        }
        return;
    }
    match header.destination() {
        Some(Endpoint::Unix(_)) => services.router.send_unix(kernel),
        Some(Endpoint::Ip(_)) => services.router.send_remote(kernel),
        None => services.router.send_local(kernel),
    }
}
