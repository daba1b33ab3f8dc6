//! Bounded worker pool with caller-runs backpressure.
//!
//! `core_workers` threads are started up front and live until shutdown.
//! When the queue is full, overflow workers are started up to `max_workers`;
//! they exit after `keep_alive` without work. When both the queue and the
//! worker budget are exhausted, the job runs on the submitting thread, which
//! throttles whoever is producing events instead of dropping work.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::config::PoolConfig;
use crate::error::{PipelineError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a submitted job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Waiting in the bounded queue
    Queued,
    /// Handed to a freshly started overflow worker
    OverflowWorker,
    /// Already executed on the submitting thread
    CallerRan,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live_workers: usize,
    pub queued: usize,
    pub caller_runs: u64,
}

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
    available: Condvar,
    live_workers: AtomicUsize,
    next_worker_id: AtomicUsize,
    caller_runs: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Start a pool and its core workers.
    pub fn new(name: &str, config: PoolConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            state: Mutex::new(QueueState {
                jobs: VecDeque::with_capacity(config.queue_depth.min(1024)),
                shutdown: false,
            }),
            available: Condvar::new(),
            live_workers: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(1),
            caller_runs: AtomicU64::new(0),
            handles: Mutex::new(Vec::new()),
        });
        let pool = Self { shared, config };

        for _ in 0..pool.config.core_workers {
            pool.shared.live_workers.fetch_add(1, Ordering::SeqCst);
            if let Err((e, _)) = pool.spawn_worker(None, false) {
                pool.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                pool.shutdown(Duration::ZERO);
                return Err(e.into());
            }
        }
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Submit a job. Fails only after shutdown.
    pub fn execute<F>(&self, job: F) -> Result<Dispatch>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let job = {
            let mut state = self.shared.lock_state();
            if state.shutdown {
                return Err(PipelineError::PoolShutdown);
            }
            if state.jobs.len() < self.config.queue_depth {
                state.jobs.push_back(job);
                self.shared.available.notify_one();
                return Ok(Dispatch::Queued);
            }
            job
        };

        if self.reserve_overflow_worker() {
            match self.spawn_worker(Some(job), true) {
                Ok(()) => return Ok(Dispatch::OverflowWorker),
                Err((e, job)) => {
                    self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
                    warn!(pool = %self.shared.name, error = %e, "Failed to start overflow worker");
                    return Ok(self.run_on_caller(job));
                }
            }
        }

        Ok(self.run_on_caller(job))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_workers: self.shared.live_workers.load(Ordering::SeqCst),
            queued: self.shared.lock_state().jobs.len(),
            caller_runs: self.shared.caller_runs.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, let workers drain the queue, and wait up to
    /// `timeout` for them to exit. Returns whether every worker finished.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        {
            let mut state = self.shared.lock_state();
            state.shutdown = true;
        }
        self.shared.available.notify_all();

        let deadline = Instant::now() + timeout;
        loop {
            let mut handles = self.shared.lock_handles();
            let (finished, running): (Vec<_>, Vec<_>) =
                handles.drain(..).partition(|h| h.is_finished());
            *handles = running;
            drop(handles);

            for handle in finished {
                let _ = handle.join();
            }

            if self.shared.lock_handles().is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(pool = %self.shared.name, "Workers still busy at shutdown deadline");
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn reserve_overflow_worker(&self) -> bool {
        let max = self.config.max_workers;
        self.shared
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok()
    }

    fn run_on_caller(&self, job: Job) -> Dispatch {
        self.shared.caller_runs.fetch_add(1, Ordering::SeqCst);
        debug!(pool = %self.shared.name, "Pool saturated, running job on submitting thread");
        run_job(&self.shared.name, job);
        Dispatch::CallerRan
    }

    fn spawn_worker(&self, first: Option<Job>, overflow: bool) -> std::result::Result<(), (std::io::Error, Job)> {
        let id = self.shared.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let keep_alive = self.config.keep_alive();

        // The first job is parked in a slot so it can be recovered if the
        // thread fails to start.
        let slot = Arc::new(Mutex::new(first));
        let thread_slot = Arc::clone(&slot);

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.shared.name, id))
            .spawn(move || {
                let first = thread_slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                worker_loop(shared, first, overflow, keep_alive);
            });

        match spawned {
            Ok(handle) => {
                let mut handles = self.shared.lock_handles();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                let job = slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                let noop: Job = Box::new(|| {});
                Err((e, job.unwrap_or(noop)))
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Detached workers drain what is queued and exit; nothing joins them,
        // so they never hold the process open.
        {
            let mut state = self.shared.lock_state();
            state.shutdown = true;
        }
        self.shared.available.notify_all();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, first: Option<Job>, overflow: bool, keep_alive: Duration) {
    if let Some(job) = first {
        run_job(&shared.name, job);
    }
    while let Some(job) = next_job(&shared, overflow, keep_alive) {
        run_job(&shared.name, job);
    }
    shared.live_workers.fetch_sub(1, Ordering::SeqCst);
}

/// Next queued job; `None` once shut down and drained, or when an overflow
/// worker has idled past `keep_alive`.
fn next_job(shared: &Shared, overflow: bool, keep_alive: Duration) -> Option<Job> {
    let mut state = shared.lock_state();
    let idle_deadline = Instant::now() + keep_alive;
    loop {
        if let Some(job) = state.jobs.pop_front() {
            return Some(job);
        }
        if state.shutdown {
            return None;
        }
        if overflow {
            let now = Instant::now();
            if now >= idle_deadline {
                return None;
            }
            state = match shared.available.wait_timeout(state, idle_deadline - now) {
                Ok((state, _)) => state,
                Err(poisoned) => poisoned.into_inner().0,
            };
        } else {
            state = shared
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Run a job, containing panics so the worker survives.
fn run_job(pool: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(pool = %pool, "Job panicked");
    }
}
