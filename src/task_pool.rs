// src/task_pool.rs

//! Fixed-size worker pool used by the device to run tasks.
//!
//! Jobs are closures that receive the pool's [`CancelToken`]. Cancellation is
//! cooperative: [`TaskPool::cancel`] discards queued jobs, raises the token
//! and blocks until running jobs have returned, then lowers the token again
//! so the pool can be reused.
//!
//! A panicking job is fatal. Its tile state cannot be resumed, so the worker
//! logs the panic and aborts the process.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};

use crate::config::DeviceConfig;
use crate::cpu;

type Job = Box<dyn FnOnce(&CancelToken) + Send + 'static>;

/// Shared cancellation flag polled by running jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Configuration for [`TaskPool`].
#[derive(Debug, Clone)]
pub struct TaskPoolConfig {
    /// Number of worker threads, at least one.
    pub num_workers: usize,
    /// Workers are named "{prefix}-{id}".
    pub thread_name_prefix: Option<String>,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: cpu::num_threads(),
            thread_name_prefix: Some("render-worker".to_string()),
        }
    }
}

impl From<&DeviceConfig> for TaskPoolConfig {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            num_workers: config.threads.unwrap_or_else(cpu::num_threads).max(1),
            thread_name_prefix: Some(config.thread_name_prefix.clone()),
        }
    }
}

struct PoolState {
    queue: VecDeque<Job>,
    running: usize,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    all_done: Condvar,
    cancel: CancelToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed pool of worker threads with wait and cancel.
pub struct TaskPool {
    config: TaskPoolConfig,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `config.num_workers` threads.
    pub fn new(config: TaskPoolConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: 0,
                shutdown: false,
            }),
            work_available: Condvar::new(),
            all_done: Condvar::new(),
            cancel: CancelToken::new(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let shared = Arc::clone(&shared);
            let mut builder = thread::Builder::new();
            if let Some(prefix) = &config.thread_name_prefix {
                builder = builder.name(format!("{}-{}", prefix, worker_id));
            }
            let handle = builder
                .spawn(move || Self::worker_loop(worker_id, shared))
                .expect("Failed to spawn worker thread");
            workers.push(handle);
        }
        debug!("Task pool started with {} workers", num_workers);

        Self {
            config: TaskPoolConfig { num_workers, ..config },
            shared,
            workers,
        }
    }

    fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
        loop {
            let job = {
                let mut state = shared.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        state.running += 1;
                        break job;
                    }
                    if state.shutdown {
                        trace!("Worker {} exiting", worker_id);
                        return;
                    }
                    state = shared
                        .work_available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };

            let cancel = &shared.cancel;
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| job(cancel))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Worker {} task panicked: {}", worker_id, msg);
                std::process::abort();
            }

            let mut state = shared.lock();
            state.running -= 1;
            if state.running == 0 && state.queue.is_empty() {
                shared.all_done.notify_all();
            }
        }
    }

    /// Queues a job; returns immediately.
    pub fn push<F>(&self, job: F)
    where
        F: FnOnce(&CancelToken) + Send + 'static,
    {
        let mut state = self.shared.lock();
        state.queue.push_back(Box::new(job));
        self.shared.work_available.notify_one();
    }

    /// Blocks until every queued and running job has finished.
    pub fn wait(&self) {
        let mut state = self.shared.lock();
        while !(state.queue.is_empty() && state.running == 0) {
            state = self
                .shared
                .all_done
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drops queued jobs, signals running ones to stop and waits for them.
    pub fn cancel(&self) {
        // Empty the queue first so no queued job starts after the token rises.
        let dropped = std::mem::take(&mut self.shared.lock().queue);
        self.shared.cancel.cancel();
        if !dropped.is_empty() {
            debug!("Canceled {} queued jobs", dropped.len());
        }
        drop(dropped);
        self.wait();
        self.shared.cancel.reset();
    }

    /// Whether a cancel is in progress.
    pub fn canceled(&self) -> bool {
        self.shared.cancel.is_canceled()
    }

    /// A handle to the token running jobs poll.
    pub fn cancel_token(&self) -> CancelToken {
        self.shared.cancel.clone()
    }

    pub fn num_threads(&self) -> usize {
        self.config.num_workers
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        let dropped = {
            let mut state = self.shared.lock();
            state.shutdown = true;
            std::mem::take(&mut state.queue)
        };
        drop(dropped);
        self.shared.work_available.notify_all();

        while let Some(handle) = self.workers.pop() {
            let _ = handle.join();
        }
    }
}
