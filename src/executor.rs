//! Fixed worker pool with cooperative submission barriers.
//!
//! A [`FixedActiveThreadsExecutor`] owns exactly `n` workers identified by
//! a stable index, so the engine can address threads by number.
//! `submit_and_await` publishes one task per worker, wakes them, and
//! busy-waits (spin, then park) until every worker reports completion or
//! the deadline passes. The pool is reusable across schedules: between
//! successful submissions every worker is observably idle.
//!
//! On timeout, workers still running are abandoned (their threads keep
//! executing the runaway task and exit once it returns) and replaced by
//! fresh workers under the same index, so the pool stays responsive. A
//! panicking task is captured and rethrown from the submitting thread.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};
use tracing::debug;

use crate::error::Failure;

/// A unit of work for one worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

const IDLE: u8 = 0;
const SUBMITTED: u8 = 1;
const DONE: u8 = 2;
const PANICKED: u8 = 3;

/// Spins before the waiting side starts parking.
const SPIN_ITERS: u32 = 200;
const PARK_TIMEOUT: Duration = Duration::from_micros(100);

struct Slot {
    state: AtomicU8,
    task: Mutex<Option<Task>>,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
    shutdown: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            task: Mutex::new(None),
            panic: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        }
    }
}

struct Worker {
    slot: Arc<Slot>,
    unparker: Unparker,
    handle: Option<JoinHandle<()>>,
}

pub struct FixedActiveThreadsExecutor {
    name: String,
    workers: Vec<Worker>,
}

impl FixedActiveThreadsExecutor {
    /// Spawn exactly `threads` workers named `{name}-{index}`.
    pub fn new(name: &str, threads: usize) -> Self {
        assert!(threads > 0, "a pool needs at least one worker");
        let workers = (0..threads)
            .map(|index| spawn_worker(name, index))
            .collect();
        Self {
            name: name.to_owned(),
            workers,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// True if every worker sits in the idle state.
    pub fn all_idle(&self) -> bool {
        self.workers
            .iter()
            .all(|w| w.slot.state.load(Ordering::Acquire) == IDLE)
    }

    /// Publish one task per worker and await all completions.
    ///
    /// On timeout, returns [`Failure::Timeout`] after replacing every
    /// worker still running. If a task panicked, the first captured panic
    /// is rethrown from the calling thread.
    pub fn submit_and_await(
        &mut self,
        tasks: Vec<Task>,
        timeout: Duration,
    ) -> Result<(), Failure> {
        assert_eq!(
            tasks.len(),
            self.workers.len(),
            "one task per worker is required"
        );
        debug_assert!(self.all_idle(), "workers must be idle between submissions");

        for (worker, task) in self.workers.iter().zip(tasks) {
            *worker.slot.task.lock().expect("task mutex poisoned") = Some(task);
            worker.slot.state.store(SUBMITTED, Ordering::Release);
            worker.unparker.unpark();
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut spins: u32 = 0;
        loop {
            let all_done = self.workers.iter().all(|w| {
                matches!(w.slot.state.load(Ordering::Acquire), DONE | PANICKED)
            });
            if all_done {
                break;
            }
            if Instant::now() >= deadline {
                self.recover_from_timeout();
                return Err(Failure::Timeout {
                    elapsed: started.elapsed(),
                });
            }
            spins = spins.wrapping_add(1);
            if spins < SPIN_ITERS {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }

        let mut first_panic: Option<Box<dyn Any + Send>> = None;
        for worker in &self.workers {
            if worker.slot.state.load(Ordering::Acquire) == PANICKED {
                let payload = worker
                    .slot
                    .panic
                    .lock()
                    .expect("panic mutex poisoned")
                    .take();
                if first_panic.is_none() {
                    first_panic = payload;
                }
            }
            worker.slot.state.store(IDLE, Ordering::Release);
        }
        if let Some(payload) = first_panic {
            std::panic::resume_unwind(payload);
        }
        Ok(())
    }

    /// Abandon every worker still running and spawn a replacement under the
    /// same index; reset finished workers to idle.
    fn recover_from_timeout(&mut self) {
        let name = self.name.clone();
        for (index, worker) in self.workers.iter_mut().enumerate() {
            match worker.slot.state.load(Ordering::Acquire) {
                DONE | PANICKED => {
                    worker.slot.panic.lock().expect("panic mutex poisoned").take();
                    worker.slot.state.store(IDLE, Ordering::Release);
                }
                _ => {
                    debug!(index, "abandoning stuck worker");
                    worker.slot.shutdown.store(true, Ordering::Release);
                    worker.unparker.unpark();
                    // Detach the stuck thread; it exits when the runaway
                    // task returns.
                    worker.handle.take();
                    *worker = spawn_worker(&name, index);
                }
            }
        }
    }

    /// Stop and join every worker. The pool is unusable afterwards.
    fn close(&mut self) {
        for worker in &self.workers {
            worker.slot.shutdown.store(true, Ordering::Release);
            worker.unparker.unpark();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for FixedActiveThreadsExecutor {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_worker(name: &str, index: usize) -> Worker {
    let slot = Arc::new(Slot::new());
    let parker = Parker::new();
    let unparker = parker.unparker().clone();
    let worker_slot = Arc::clone(&slot);
    let handle = thread::Builder::new()
        .name(format!("{name}-{index}"))
        .spawn(move || worker_loop(worker_slot, parker))
        .expect("failed to spawn worker thread");
    Worker {
        slot,
        unparker,
        handle: Some(handle),
    }
}

/// Worker main loop: busy-wait for a submission, run it, publish the
/// outcome, return to waiting. Exits on shutdown.
fn worker_loop(slot: Arc<Slot>, parker: Parker) {
    let mut spins: u32 = 0;
    loop {
        if slot.state.load(Ordering::Acquire) == SUBMITTED {
            spins = 0;
            let task = slot
                .task
                .lock()
                .expect("task mutex poisoned")
                .take()
                .expect("submitted state without a task");
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(()) => slot.state.store(DONE, Ordering::Release),
                Err(payload) => {
                    *slot.panic.lock().expect("panic mutex poisoned") = Some(payload);
                    slot.state.store(PANICKED, Ordering::Release);
                }
            }
            continue;
        }
        if slot.shutdown.load(Ordering::Acquire) {
            return;
        }
        spins = spins.wrapping_add(1);
        if spins < SPIN_ITERS {
            std::hint::spin_loop();
        } else {
            parker.park_timeout(PARK_TIMEOUT);
        }
    }
}
