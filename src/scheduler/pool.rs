//! Fixed-size worker pool consuming one stage's intake.
//!
//! Each worker takes one WorkItem, runs it to completion, and only then takes
//! the next. A panic that escapes a stage's own error handling is caught per
//! item and counted as Failed; the worker keeps going.

use super::queue::{IntakeQueue, PushError};
use super::work::{panic_message, Stage, StageCounters, StageStats, WorkItem, WorkState};
use crate::error::{PipelineError, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One stage's unit of work.
pub trait StageWorker: Send + Sync + 'static {
    type Job: Send + 'static;

    fn stage(&self) -> Stage;

    /// Short label of the object(s) a job concerns, for spans.
    fn subject(&self, job: &Self::Job) -> String;

    /// Run one job to a terminal state. May push follow-up jobs onto `intake`.
    fn process(&self, job: Self::Job, intake: &Intake<Self::Job>) -> WorkState;
}

/// Entry point into a stage: queue, item ids, and counters.
pub struct Intake<J> {
    stage: Stage,
    queue: IntakeQueue<WorkItem<J>>,
    next_id: AtomicU64,
    counters: StageCounters,
}

impl<J> Intake<J> {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            queue: IntakeQueue::new(),
            next_id: AtomicU64::new(1),
            counters: StageCounters::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Accept work from outside the stage. Refused once draining has begun.
    pub fn submit(&self, job: J, priority: i32) -> Result<u64> {
        self.enqueue(job, priority, false)
    }

    /// Accept follow-up work produced inside the pipeline.
    pub fn submit_internal(&self, job: J, priority: i32) -> Result<u64> {
        self.enqueue(job, priority, true)
    }

    fn enqueue(&self, job: J, priority: i32, internal: bool) -> Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let item = WorkItem { id, priority, job };
        // counted first so a fast worker never observes a negative queue
        self.counters.enqueued();
        let pushed = if internal {
            self.queue.push_internal(item, priority)
        } else {
            self.queue.push(item, priority)
        };
        match pushed {
            Ok(()) => {
                debug!(stage = %self.stage, item = id, priority, "queued");
                Ok(id)
            }
            Err(PushError::Closed) | Err(PushError::Aborted) => {
                self.counters.rejected();
                Err(PipelineError::ShuttingDown {
                    stage: self.stage.to_string(),
                })
            }
        }
    }

    pub fn stats(&self) -> StageStats {
        self.counters.snapshot()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.wait_idle(timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn close(&self) {
        self.queue.close();
    }

    fn abort(&self) -> usize {
        let dropped = self.queue.abort();
        self.counters.abandoned(dropped as u64);
        dropped
    }
}

pub struct WorkerPool<W: StageWorker> {
    worker: Arc<W>,
    intake: Arc<Intake<W::Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl<W: StageWorker> WorkerPool<W> {
    /// Spawn `workers` threads named `<stage>-worker-<n>`.
    pub fn start(worker: W, workers: usize) -> Result<Self> {
        let stage = worker.stage();
        if workers == 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "{stage}.workers must be at least 1"
            )));
        }
        let worker = Arc::new(worker);
        let intake = Arc::new(Intake::new(stage));
        let mut pool = Self {
            worker,
            intake,
            handles: Vec::with_capacity(workers),
        };
        for n in 0..workers {
            let worker = Arc::clone(&pool.worker);
            let intake = Arc::clone(&pool.intake);
            let handle = thread::Builder::new()
                .name(format!("{stage}-worker-{n}"))
                .spawn(move || worker_loop(worker, intake))
                .map_err(|source| PipelineError::WorkerSpawn {
                    stage: stage.to_string(),
                    source,
                })?;
            pool.handles.push(handle);
        }
        info!(stage = %stage, workers, "stage started");
        Ok(pool)
    }

    pub fn stage(&self) -> Stage {
        self.intake.stage()
    }

    pub fn intake(&self) -> Arc<Intake<W::Job>> {
        Arc::clone(&self.intake)
    }

    pub fn worker(&self) -> &Arc<W> {
        &self.worker
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> StageStats {
        self.intake.stats()
    }

    /// Cooperative drain: refuse new work, finish everything accepted, join.
    pub fn shutdown(mut self) -> StageStats {
        let stage = self.stage();
        let started = Instant::now();
        info!(stage = %stage, queued = self.intake.len(), "draining stage");
        self.intake.close();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!(stage = %stage, "worker thread terminated abnormally");
            }
        }
        let stats = self.intake.stats();
        info!(
            stage = %stage,
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stage drained"
        );
        stats
    }

    /// Abrupt cancel: drop queued items and detach the workers. Items already
    /// running finish on their own; their side effects are not rolled back.
    pub fn cancel(mut self) -> StageStats {
        let stage = self.stage();
        let dropped = self.intake.abort();
        self.handles.clear();
        warn!(stage = %stage, dropped, "stage cancelled");
        self.intake.stats()
    }
}

impl<W: StageWorker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.intake.abort();
        }
    }
}

fn worker_loop<W: StageWorker>(worker: Arc<W>, intake: Arc<Intake<W::Job>>) {
    let stage = worker.stage();
    while let Some(item) = intake.queue.pop() {
        intake.counters.started();
        let subject = worker.subject(&item.job);
        let span = crate::stage_span!(stage, item.id, subject = %subject);
        let _enter = span.enter();
        debug!(priority = item.priority, "running");

        let state = panic::catch_unwind(AssertUnwindSafe(|| worker.process(item.job, &intake)))
            .unwrap_or_else(|payload| {
                error!(error = %panic_message(payload.as_ref()), "work item panicked");
                WorkState::Failed
            });

        debug!(state = ?state, "finished");
        intake.counters.finished(state);
        intake.queue.task_done();
    }
    debug!(stage = %stage, "worker exiting");
}
