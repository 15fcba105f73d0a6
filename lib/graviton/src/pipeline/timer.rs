//! The timer pipeline: a deadline-ordered heap drained by one thread.
//! Kernels fire at their deadline or at shutdown, whichever comes first,
//! and are then delivered through the local pipeline.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use quark::logging::{self, Logger};

use crate::factory::{KernelSink, Services};
use crate::kernel::{Kernel, KernelBox};

struct Entry {
    deadline: Instant,
    seq: u64,
    kernel: KernelBox,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> CmpOrdering {
        // reversed: BinaryHeap is a max-heap, the earliest deadline wins
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

struct State {
    heap: BinaryHeap<Entry>,
    seq: u64,
    stopped: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    log: Logger,
}

#[derive(Clone)]
pub struct TimerPipeline {
    inner: Arc<Inner>,
}

impl TimerPipeline {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> TimerPipeline {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };
        TimerPipeline {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    heap: BinaryHeap::new(),
                    seq: 0,
                    stopped: false,
                }),
                cv: Condvar::new(),
                thread: Mutex::new(None),
                log,
            }),
        }
    }

    pub fn start(&self, services: Services) {
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("timer".into())
            .spawn(move || timer_loop(inner, services))
            .expect("Error spawning the timer thread");
        *lock_thread(&self.inner) = Some(handle);
    }

    pub fn send(&self, kernel: KernelBox) {
        let deadline = kernel.header().deadline().unwrap_or_else(Instant::now);
        let mut state = lock(&self.inner);
        if state.stopped {
            logging::debug!(self.inner.log, "dropping timer kernel, pipeline stopped";
                            "kernel" => %kernel.header());
            return;
        }
        let seq = state.seq;
        state.seq += 1;
        state.heap.push(Entry {
            deadline,
            seq,
            kernel,
        });
        self.inner.cv.notify_one();
    }

    pub fn stop(&self) {
        let mut state = lock(&self.inner);
        state.stopped = true;
        self.inner.cv.notify_all();
    }

    pub fn wait(&self) {
        if let Some(handle) = lock_thread(&self.inner).take() {
            handle.join().ok();
        }
    }
}

impl KernelSink for TimerPipeline {
    fn submit(&self, kernel: KernelBox) {
        self.send(kernel);
    }
}

fn lock(inner: &Inner) -> std::sync::MutexGuard<State> {
    match inner.state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_thread(inner: &Inner) -> std::sync::MutexGuard<Option<thread::JoinHandle<()>>> {
    match inner.thread.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn timer_loop(inner: Arc<Inner>, services: Services) {
    let mut state = lock(&inner);
    loop {
        let now = Instant::now();
        // fire everything due (or everything, at shutdown)
        while state
            .heap
            .peek()
            .map(|entry| state.stopped || entry.deadline <= now)
            .unwrap_or(false)
        {
            let entry = state.heap.pop().expect("Heap was peeked");
            services.router.send_local(entry.kernel);
        }
        if state.stopped && state.heap.is_empty() {
            return;
        }
        state = match state.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match inner.cv.wait_timeout(state, timeout) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                }
            }
            None => match inner.cv.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            },
        };
    }
}
