//! Fiber schedulers.
//!
//! A [`Scheduler`] decides where fiber turns execute. The production
//! implementation is a work-stealing thread pool: one global injector, one
//! local deque per worker, and idle workers stealing from their peers. The
//! [`TestScheduler`] runs every turn on the calling thread in FIFO order,
//! which makes interleavings deterministic in tests.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A unit of work: one fiber turn.
pub type Task = Box<dyn FnOnce() + Send>;

/// Dispatches fiber turns onto executor threads.
pub trait Scheduler: Send + Sync {
    /// Enqueue `task` for execution. Must not run it on the calling thread
    /// synchronously unless the scheduler is explicitly single-threaded.
    fn schedule(&self, task: Task);
}

// ==== Work-stealing pool =================================================

/// Configuration for [`PoolScheduler`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub workers: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            thread_name_prefix: "strand-worker".to_string(),
        }
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Tasks accepted by `schedule`.
    pub scheduled: u64,
    /// Tasks that finished executing.
    pub executed: u64,
}

struct PoolInner {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    shutdown: AtomicBool,
    idle: Mutex<usize>,
    wake: Condvar,
    scheduled: AtomicU64,
    executed: AtomicU64,
}

/// A work-stealing thread pool.
///
/// Shutting down (explicitly or on drop) stops workers after their current
/// task; queued tasks that have not started are dropped.
pub struct PoolScheduler {
    inner: Arc<PoolInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolScheduler {
    /// Start a pool with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    /// Start a pool with `config`.
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        let workers: Vec<Worker<Task>> = (0..config.workers.max(1))
            .map(|_| Worker::new_fifo())
            .collect();
        let stealers = workers.iter().map(Worker::stealer).collect();
        let inner = Arc::new(PoolInner {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            idle: Mutex::new(0),
            wake: Condvar::new(),
            scheduled: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        });
        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(index, local)| {
                let inner = inner.clone();
                std::thread::Builder::new()
                    .name(format!("{}-{index}", config.thread_name_prefix))
                    .spawn(move || worker_loop(&inner, &local, index))
                    .expect("failed to spawn scheduler worker thread")
            })
            .collect();
        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// A snapshot of the pool's counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            executed: self.inner.executed.load(Ordering::Relaxed),
        }
    }

    /// Stop the workers and join their threads.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_all();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Default for PoolScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for PoolScheduler {
    fn schedule(&self, task: Task) {
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        self.inner.injector.push(task);
        self.inner.wake.notify_one();
    }
}

impl Drop for PoolScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &Arc<PoolInner>, local: &Worker<Task>, index: usize) {
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        if let Some(task) = find_task(inner, local, index) {
            task();
            inner.executed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        // Nothing to do; park with a timeout so a wake racing with the
        // queue check cannot strand the worker.
        let mut idle = inner.idle.lock();
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        *idle += 1;
        inner.wake.wait_for(&mut idle, Duration::from_millis(10));
        *idle -= 1;
    }
}

fn find_task(inner: &PoolInner, local: &Worker<Task>, index: usize) -> Option<Task> {
    local.pop().or_else(|| {
        std::iter::repeat_with(|| {
            inner.injector.steal_batch_and_pop(local).or_else(|| {
                inner
                    .stealers
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, stealer)| stealer.steal())
                    .collect::<Steal<Task>>()
            })
        })
        .find(|steal| !steal.is_retry())
        .and_then(Steal::success)
    })
}

// ==== Deterministic scheduler ============================================

/// A single-threaded FIFO scheduler for tests.
///
/// `schedule` only queues; nothing runs until the test drives the queue
/// with [`TestScheduler::run_until_idle`] or [`TestScheduler::step`].
#[derive(Default)]
pub struct TestScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl TestScheduler {
    /// An empty scheduler, shared so tests can both drive it and hand it
    /// to a runtime.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run queued tasks, including ones they enqueue, until the queue is
    /// empty. Returns the number of tasks executed.
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while self.step() {
            executed += 1;
        }
        executed
    }

    /// Run the next queued task, if any.
    pub fn step(&self) -> bool {
        let task = self.queue.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Check whether the queue is empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Scheduler for TestScheduler {
    fn schedule(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}
