//! Degraded-health tracking for repeated storage failures.
//!
//! A single storage failure only fails the WorkItem it hit. Once failures
//! happen back to back past a threshold the pipeline is reported degraded,
//! and the first success afterwards reports recovery.

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded { consecutive_failures: usize },
}

/// Transition reported to the caller that triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Degraded { consecutive_failures: usize },
    Recovered,
}

#[derive(Debug)]
pub struct HealthMonitor {
    threshold: usize,
    state: Mutex<(usize, bool)>,
}

impl HealthMonitor {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            state: Mutex::new((0, false)),
        }
    }

    pub fn record_failure(&self) -> Option<HealthTransition> {
        let mut state = self.state.lock();
        state.0 += 1;
        if !state.1 && state.0 >= self.threshold {
            state.1 = true;
            return Some(HealthTransition::Degraded {
                consecutive_failures: state.0,
            });
        }
        None
    }

    pub fn record_success(&self) -> Option<HealthTransition> {
        let mut state = self.state.lock();
        state.0 = 0;
        if state.1 {
            state.1 = false;
            return Some(HealthTransition::Recovered);
        }
        None
    }

    pub fn status(&self) -> HealthStatus {
        let state = self.state.lock();
        if state.1 {
            HealthStatus::Degraded {
                consecutive_failures: state.0,
            }
        } else {
            HealthStatus::Healthy
        }
    }
}
