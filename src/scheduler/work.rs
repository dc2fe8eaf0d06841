//! Work items, their terminal states, and per-stage counters.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Unpacking,
    Analysis,
    Comparison,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Unpacking => "unpacking",
            Stage::Analysis => "analysis",
            Stage::Comparison => "comparison",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one WorkItem: `Queued -> Running -> {Completed, Failed, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkState {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Completed | WorkState::Failed | WorkState::Skipped
        )
    }
}

/// A queued unit of work.
#[derive(Debug)]
pub struct WorkItem<J> {
    pub id: u64,
    pub priority: i32,
    pub job: J,
}

/// Snapshot of a stage's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Dropped from the queue by an abrupt cancel.
    pub abandoned: u64,
}

impl StageStats {
    pub fn accepted(&self) -> u64 {
        self.queued + self.running + self.finished() + self.abandoned
    }

    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.skipped
    }
}

#[derive(Debug, Default)]
pub(crate) struct StageCounters {
    queued: AtomicU64,
    running: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    abandoned: AtomicU64,
}

impl StageCounters {
    pub(crate) fn enqueued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Undo `enqueued` for a push the queue refused.
    pub(crate) fn rejected(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn started(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finished(&self, state: WorkState) {
        self.running.fetch_sub(1, Ordering::Relaxed);
        let counter = match state {
            WorkState::Completed => &self.completed,
            WorkState::Skipped => &self.skipped,
            // a worker never reports a non-terminal state
            WorkState::Failed | WorkState::Queued | WorkState::Running => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn abandoned(&self, count: u64) {
        self.queued.fetch_sub(count, Ordering::Relaxed);
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StageStats {
        StageStats {
            queued: self.queued.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}
