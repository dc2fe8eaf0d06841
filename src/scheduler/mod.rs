//! Stage schedulers.
//!
//! The three stages share one abstraction: a [`WorkerPool`] of named threads
//! pulling [`WorkItem`]s from a priority [`IntakeQueue`]. What differs is the
//! [`StageWorker`] plugged into the pool. Stages talk to each other only
//! through [`Handoff`] channels and report out through an [`OutcomeSink`].

pub mod analysis;
pub mod comparison;
pub mod handoff;
pub mod outcome;
pub mod pool;
pub mod queue;
pub mod unpacking;
pub mod work;

use crate::storage::{
    ContentStore, HealthMonitor, HealthTransition, ObjectStore, StorageError, StorageResult,
};
use std::sync::Arc;
use tracing::{error, info, warn};

pub use analysis::{AnalysisJob, AnalysisRequest, AnalysisScheduler, AnalysisTarget};
pub use comparison::{CompareRequest, ComparisonScheduler, GatedComparisons};
pub use handoff::{handoff, Handoff, HandoffReceiver};
pub use outcome::{Outcome, OutcomeReceiver, OutcomeSink};
pub use pool::{Intake, StageWorker, WorkerPool};
pub use queue::IntakeQueue;
pub use unpacking::{UnpackJob, UnpackingScheduler};
pub use work::{Stage, StageStats, WorkItem, WorkState};

/// Collaborators every stage worker needs.
#[derive(Clone)]
pub struct StageContext {
    pub objects: Arc<dyn ObjectStore>,
    pub contents: Arc<dyn ContentStore>,
    pub health: Arc<HealthMonitor>,
    pub outcomes: OutcomeSink,
}

impl StageContext {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        contents: Arc<dyn ContentStore>,
        health: Arc<HealthMonitor>,
        outcomes: OutcomeSink,
    ) -> Self {
        Self {
            objects,
            contents,
            health,
            outcomes,
        }
    }

    pub fn emit(&self, outcome: Outcome) {
        self.outcomes.emit(outcome);
    }

    /// Feed a storage call's result into the health monitor. NotFound is an
    /// answer, not a failure.
    pub(crate) fn storage<T>(&self, stage: Stage, result: StorageResult<T>) -> StorageResult<T> {
        match &result {
            Ok(_) => self.storage_ok(stage),
            Err(e) if e.is_not_found() => self.storage_ok(stage),
            Err(e) => self.storage_failed(stage, e),
        }
        result
    }

    fn storage_ok(&self, stage: Stage) {
        if let Some(HealthTransition::Recovered) = self.health.record_success() {
            info!(stage = %stage, "storage recovered");
            self.emit(Outcome::HealthRecovered { stage });
        }
    }

    fn storage_failed(&self, stage: Stage, err: &StorageError) {
        warn!(stage = %stage, error = %err, "storage call failed");
        if let Some(HealthTransition::Degraded {
            consecutive_failures,
        }) = self.health.record_failure()
        {
            error!(stage = %stage, consecutive_failures, "storage degraded");
            self.emit(Outcome::HealthDegraded {
                stage,
                consecutive_failures,
            });
        }
    }
}
