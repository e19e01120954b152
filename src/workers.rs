//! Background worker pool for CPU-heavy operations.
//!
//! Plain OS threads drain a priority queue: strictly descending priority,
//! FIFO within a priority class. Tasks carry immutable inputs and return
//! JSON payloads, so execution order never changes results. A panicking
//! task is contained and reported as a typed error; the worker survives to
//! take the next task. Waiting on a handle past the task's deadline yields
//! a `Timeout` error.

use crate::config::WorkerConfig;
use crate::error::{CoreError, CoreResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FileAnalysis,
    BatchIndexing,
    RelevanceScoring,
    ContentSampling,
    Serialization,
    SymbolExtraction,
    ImportGraphBuild,
}

pub type TaskPayload = serde_json::Value;

pub struct Task {
    pub kind: TaskKind,
    /// Higher runs first.
    pub priority: u8,
    /// Overrides the pool's default deadline.
    pub timeout: Option<Duration>,
    work: Box<dyn FnOnce() -> CoreResult<TaskPayload> + Send>,
}

impl Task {
    pub fn new(
        kind: TaskKind,
        priority: u8,
        work: impl FnOnce() -> CoreResult<TaskPayload> + Send + 'static,
    ) -> Self {
        Self { kind, priority, timeout: None, work: Box::new(work) }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct QueuedTask {
    priority: u8,
    seq: u64,
    kind: TaskKind,
    work: Box<dyn FnOnce() -> CoreResult<TaskPayload> + Send>,
    result_tx: Sender<CoreResult<TaskPayload>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedTask {}
impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first; earlier sequence first within a
        // priority class.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Handle to a submitted task. Waiting consumes the handle.
pub struct TaskHandle {
    pub kind: TaskKind,
    rx: Receiver<CoreResult<TaskPayload>>,
    deadline: Duration,
}

impl TaskHandle {
    /// Block until the task finishes or its deadline passes.
    pub fn wait(self) -> CoreResult<TaskPayload> {
        match self.rx.recv_timeout(self.deadline) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                Err(CoreError::Timeout(format!("{:?} task exceeded {:?}", self.kind, self.deadline)))
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(CoreError::Timeout(format!("{:?} worker lost", self.kind)))
            }
        }
    }

    /// Non-blocking poll. `None` while the task is still running.
    pub fn try_wait(&self) -> Option<CoreResult<TaskPayload>> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_duration_ms: f64,
    pub active_workers: usize,
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    total: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    active: AtomicUsize,
    queued: AtomicUsize,
    duration_ms_sum: AtomicU64,
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

struct PoolShared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    available: Condvar,
    shutdown: AtomicBool,
    counters: Counters,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    default_timeout: Duration,
    queue_soft_limit: usize,
    next_seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig) -> CoreResult<Self> {
        config.validate()?;
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        });

        let workers = (0..config.workers)
            .map(|worker_id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("ctx-worker-{worker_id}"))
                    .spawn(move || worker_loop(worker_id, shared))
                    .map_err(CoreError::Io)
            })
            .collect::<CoreResult<Vec<_>>>()?;

        Ok(Self {
            shared,
            workers,
            default_timeout: config.default_timeout,
            queue_soft_limit: config.queue_soft_limit,
            next_seq: AtomicU64::new(0),
        })
    }

    /// Enqueue a task. Never blocks: past the soft queue bound submissions
    /// still land, visible only as growth of the `queued` counter.
    pub fn submit(&self, task: Task) -> TaskHandle {
        let (result_tx, rx) = bounded(1);
        let deadline = task.timeout.unwrap_or(self.default_timeout);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedTask {
            priority: task.priority,
            seq,
            kind: task.kind,
            work: task.work,
            result_tx,
        };

        self.shared.counters.total.fetch_add(1, Ordering::Relaxed);
        let depth = {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.push(queued);
            self.shared.counters.queued.store(queue.len(), Ordering::Relaxed);
            queue.len()
        };
        if depth > self.queue_soft_limit {
            warn!(depth, limit = self.queue_soft_limit, "worker queue past soft bound");
        }
        self.shared.available.notify_one();

        TaskHandle { kind: task.kind, rx, deadline }
    }

    pub fn submit_batch(&self, tasks: Vec<Task>) -> Vec<TaskHandle> {
        tasks.into_iter().map(|t| self.submit(t)).collect()
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        let completed = c.completed.load(Ordering::Relaxed);
        let avg = if completed == 0 {
            0.0
        } else {
            c.duration_ms_sum.load(Ordering::Relaxed) as f64 / completed as f64
        };
        PoolStats {
            total: c.total.load(Ordering::Relaxed),
            completed,
            failed: c.failed.load(Ordering::Relaxed),
            avg_duration_ms: avg,
            active_workers: c.active.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and join every worker. Queued-but-unstarted
    /// tasks are dropped; their handles report a lost worker.
    pub fn shutdown(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker_id: usize, shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(task) = queue.pop() {
                    shared.counters.queued.store(queue.len(), Ordering::Relaxed);
                    break task;
                }
                queue = shared.available.wait(queue).unwrap_or_else(|e| e.into_inner());
            }
        };

        shared.counters.active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(task.work));
        let elapsed_ms = started.elapsed().as_millis() as u64;
        shared.counters.active.fetch_sub(1, Ordering::Relaxed);

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(worker = worker_id, kind = ?task.kind, "task panicked, worker recovered");
                // Crashes share the timeout recovery path: the worker is
                // reclaimed and the caller sees a typed error.
                Err(CoreError::Timeout(format!("{:?} task crashed", task.kind)))
            }
        };

        match &result {
            Ok(_) => {
                shared.counters.completed.fetch_add(1, Ordering::Relaxed);
                shared.counters.duration_ms_sum.fetch_add(elapsed_ms, Ordering::Relaxed);
            }
            Err(_) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(worker = worker_id, kind = ?task.kind, elapsed_ms, "task finished");
        // Receiver may be gone; that's fine.
        let _ = task.result_tx.send(result);
    }
}
