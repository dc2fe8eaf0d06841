//! Stage outcomes pushed out of the pipeline.
//!
//! Every stage reports its terminal results and health transitions through an
//! [`OutcomeSink`]. The boundary binding drains the matching receiver and
//! hands each outcome to the registered handlers.

use super::work::Stage;
use crate::core::{ComparisonId, ComparisonResult, Uid};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Outcome {
    Unpacked {
        uid: Uid,
        children: Vec<Uid>,
        /// Earlier results were reused instead of extracting again.
        reused: bool,
    },
    UnpackFailed {
        uid: Uid,
        error: String,
    },
    PluginCompleted {
        uid: Uid,
        plugin: String,
    },
    PluginFailed {
        uid: Uid,
        plugin: String,
        error: String,
    },
    PluginSkipped {
        uid: Uid,
        plugin: String,
        missing: Vec<String>,
    },
    /// Every selected plugin reached a terminal entry.
    Analyzed {
        uid: Uid,
        analyses: Vec<String>,
    },
    /// The analysis request could not start at all.
    AnalysisFailed {
        uid: Uid,
        error: String,
    },
    Compared {
        result: ComparisonResult,
        reused: bool,
    },
    CompareFailed {
        compare_id: ComparisonId,
        error: String,
    },
    HealthDegraded {
        stage: Stage,
        consecutive_failures: usize,
    },
    HealthRecovered {
        stage: Stage,
    },
}

impl Outcome {
    pub fn stage(&self) -> Stage {
        match self {
            Outcome::Unpacked { .. } | Outcome::UnpackFailed { .. } => Stage::Unpacking,
            Outcome::PluginCompleted { .. }
            | Outcome::PluginFailed { .. }
            | Outcome::PluginSkipped { .. }
            | Outcome::Analyzed { .. }
            | Outcome::AnalysisFailed { .. } => Stage::Analysis,
            Outcome::Compared { .. } | Outcome::CompareFailed { .. } => Stage::Comparison,
            Outcome::HealthDegraded { stage, .. } | Outcome::HealthRecovered { stage } => *stage,
        }
    }

    pub fn uid(&self) -> Option<&Uid> {
        match self {
            Outcome::Unpacked { uid, .. }
            | Outcome::UnpackFailed { uid, .. }
            | Outcome::PluginCompleted { uid, .. }
            | Outcome::PluginFailed { uid, .. }
            | Outcome::PluginSkipped { uid, .. }
            | Outcome::Analyzed { uid, .. }
            | Outcome::AnalysisFailed { uid, .. } => Some(uid),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::UnpackFailed { .. }
                | Outcome::PluginFailed { .. }
                | Outcome::AnalysisFailed { .. }
                | Outcome::CompareFailed { .. }
        )
    }
}

/// Sending half shared by all stage workers.
#[derive(Clone)]
pub struct OutcomeSink {
    tx: Sender<Outcome>,
    pending: Arc<AtomicUsize>,
}

/// Receiving half; tracks outcomes that are not yet delivered.
pub struct OutcomeReceiver {
    rx: Receiver<Outcome>,
    pending: Arc<AtomicUsize>,
}

impl OutcomeSink {
    pub fn channel() -> (OutcomeSink, OutcomeReceiver) {
        let (tx, rx) = unbounded();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            OutcomeSink {
                tx,
                pending: Arc::clone(&pending),
            },
            OutcomeReceiver { rx, pending },
        )
    }

    pub fn emit(&self, outcome: Outcome) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(outcome).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            trace!("outcome receiver gone");
        }
    }
}

impl OutcomeReceiver {
    pub fn pending_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.pending)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let outcome = self.rx.recv_timeout(timeout).ok()?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(outcome)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<Outcome> {
        let outcomes: Vec<_> = self.rx.try_iter().collect();
        self.pending.fetch_sub(outcomes.len(), Ordering::SeqCst);
        outcomes
    }

    /// Call `deliver` for each outcome until every sink is dropped. An outcome
    /// counts as pending until `deliver` returns.
    pub fn for_each(self, mut deliver: impl FnMut(&Outcome)) {
        for outcome in self.rx.iter() {
            deliver(&outcome);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
