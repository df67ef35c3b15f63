//! Conditional scheduler
//!
//! Runs validation tasks on a fixed pool of worker threads once every
//! dependency latch they wait on has fired. A waiting task holds no thread:
//! it sits behind an atomic pending count, and whichever latch release
//! brings the count to zero pushes it onto the ready queue.

use crate::latch::DependencyLatch;
use crate::transaction::GlobalTransactionId;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send>;

/// Commands consumed by the worker threads
enum SchedulerCommand {
    /// Run a task whose dependencies all fired
    Run(GlobalTransactionId, Job),
    /// Stop one worker
    Shutdown,
}

/// Scheduler statistics
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Tasks submitted
    pub submitted: u64,
    /// Tasks that had to wait for at least one dependency
    pub deferred: u64,
    /// Tasks run to completion
    pub completed: u64,
    /// Tasks that panicked
    pub panicked: u64,
}

struct Shared {
    sender: Sender<SchedulerCommand>,
    waiting: DashMap<GlobalTransactionId, usize>,
    outstanding: Mutex<usize>,
    idle: Condvar,
    stats: Mutex<SchedulerStats>,
}

impl Shared {
    fn task_done(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.idle.notify_all();
        }
    }
}

struct PendingTask {
    gtx: GlobalTransactionId,
    remaining: AtomicUsize,
    job: Mutex<Option<Job>>,
    shared: Arc<Shared>,
}

impl PendingTask {
    /// One dependency (or the submission guard) fired
    fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        self.shared.waiting.remove(&self.gtx);
        let Some(job) = self.job.lock().take() else {
            return;
        };
        if self
            .shared
            .sender
            .send(SchedulerCommand::Run(self.gtx, job))
            .is_err()
        {
            tracing::warn!(gtx = %self.gtx, "scheduler stopped, dropping validation task");
            self.shared.task_done();
        }
    }
}

/// Dependency-driven worker pool
pub struct ConditionalScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConditionalScheduler {
    /// Start `workers` threads named `{name}-{i}`
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let shared = Arc::new(Shared {
            sender,
            waiting: DashMap::new(),
            outstanding: Mutex::new(0),
            idle: Condvar::new(),
            stats: Mutex::new(SchedulerStats::default()),
        });

        let mut handles = Vec::with_capacity(workers.max(1));
        for i in 0..workers.max(1) {
            let receiver = receiver.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || Self::worker_thread(receiver, shared))
                .map_err(|e| Error::internal(format!("failed to spawn validation worker: {}", e)))?;
            handles.push(handle);
        }

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    fn worker_thread(receiver: Receiver<SchedulerCommand>, shared: Arc<Shared>) {
        while let Ok(command) = receiver.recv() {
            match command {
                SchedulerCommand::Run(gtx, job) => {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!(%gtx, "validation task panicked");
                        shared.stats.lock().panicked += 1;
                    } else {
                        shared.stats.lock().completed += 1;
                    }
                    shared.task_done();
                }
                SchedulerCommand::Shutdown => break,
            }
        }
    }

    /// Run `job` once every latch in `dependencies` fired
    pub fn submit(
        &self,
        gtx: GlobalTransactionId,
        dependencies: Vec<Arc<DependencyLatch>>,
        job: impl FnOnce() + Send + 'static,
    ) {
        *self.shared.outstanding.lock() += 1;
        {
            let mut stats = self.shared.stats.lock();
            stats.submitted += 1;
            if !dependencies.is_empty() {
                stats.deferred += 1;
            }
        }

        let task = Arc::new(PendingTask {
            gtx,
            remaining: AtomicUsize::new(dependencies.len() + 1),
            job: Mutex::new(Some(Box::new(job))),
            shared: self.shared.clone(),
        });
        if !dependencies.is_empty() {
            self.shared.waiting.insert(gtx, dependencies.len());
            tracing::trace!(%gtx, dependencies = dependencies.len(), "validation deferred");
        }

        for latch in dependencies {
            let task = task.clone();
            latch.on_release(move |_| task.arrive());
        }
        task.arrive();
    }

    /// Tasks still waiting for dependencies
    pub fn pending_tasks(&self) -> usize {
        self.shared.waiting.len()
    }

    /// Whether `gtx` is waiting for dependencies
    pub fn is_waiting(&self, gtx: GlobalTransactionId) -> bool {
        self.shared.waiting.contains_key(&gtx)
    }

    /// Block until every submitted task ran. Returns false on timeout.
    pub fn await_quiescence(&self, timeout: Duration) -> bool {
        let mut outstanding = self.shared.outstanding.lock();
        if *outstanding > 0 {
            let _ = self
                .shared
                .idle
                .wait_while_for(&mut outstanding, |n| *n > 0, timeout);
        }
        *outstanding == 0
    }

    /// Current statistics
    pub fn stats(&self) -> SchedulerStats {
        self.shared.stats.lock().clone()
    }

    /// Stop the workers after the already-ready tasks ran
    pub fn shutdown(&self) {
        let handles = std::mem::take(&mut *self.workers.lock());
        for _ in &handles {
            let _ = self.shared.sender.send(SchedulerCommand::Shutdown);
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("validation worker panicked");
            }
        }
    }
}

impl Drop for ConditionalScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
