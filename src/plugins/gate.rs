//! Dependency gating for analysis and compare plugins.
//!
//! A plugin may run only when every declared dependency has a recorded result
//! on every object of its input batch. Any recorded entry counts, including a
//! Failed or Skipped one; dependents read its status themselves. A single
//! member lacking a prerequisite blocks the whole batch. Missing prerequisites
//! are an expected condition and are reported as data, never as an error.

use crate::core::comparison::{compare_failed, compare_skipped};
use crate::core::{AnalysisStatus, FileObject, PluginComparison};
use crate::plugins::ComparePlugin;
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Ready,
    /// Unmet dependency names, deduplicated and sorted.
    Missing(BTreeSet<String>),
}

impl GateDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, GateDecision::Ready)
    }
}

/// Stateless dependency check.
pub struct DependencyGate;

impl DependencyGate {
    /// Check `required` against every object. An empty batch is trivially ready.
    pub fn evaluate<O: Borrow<FileObject>>(objects: &[O], required: &[String]) -> GateDecision {
        let missing: BTreeSet<String> = required
            .iter()
            .filter(|dep| {
                objects
                    .iter()
                    .any(|object| !object.borrow().has_analysis(dep))
            })
            .cloned()
            .collect();
        if missing.is_empty() {
            GateDecision::Ready
        } else {
            GateDecision::Missing(missing)
        }
    }

    pub fn evaluate_one(object: &FileObject, required: &[String]) -> GateDecision {
        Self::evaluate(std::slice::from_ref(object), required)
    }
}

/// Result of a gated compare invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareRun {
    pub status: AnalysisStatus,
    pub result: PluginComparison,
}

/// Gate a compare plugin over `objects` and run it when ready.
///
/// Missing prerequisites yield the standard skipped shape without invoking the
/// plugin; an error from the plugin yields the failed shape.
pub fn run_compare(plugin: &dyn ComparePlugin, objects: &[Arc<FileObject>]) -> CompareRun {
    match DependencyGate::evaluate(objects, plugin.dependencies()) {
        GateDecision::Missing(missing) => {
            debug!(plugin = plugin.name(), ?missing, "compare skipped");
            CompareRun {
                status: AnalysisStatus::Skipped,
                result: compare_skipped(&missing),
            }
        }
        GateDecision::Ready => match plugin.compare(objects) {
            Ok(result) => CompareRun {
                status: AnalysisStatus::Completed,
                result,
            },
            Err(e) => CompareRun {
                status: AnalysisStatus::Failed,
                result: compare_failed(format!("{:#}", e)),
            },
        },
    }
}
