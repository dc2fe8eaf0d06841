//! Recorded analysis results attached to file objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Reserved slot name under which the unpacking stage records its outcome.
pub const UNPACKER_PLUGIN: &str = "unpacker";

/// Terminal state of one analysis slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Completed => write!(f, "completed"),
            AnalysisStatus::Failed => write!(f, "failed"),
            AnalysisStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One plugin's result on one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub plugin: String,
    pub plugin_version: String,
    pub status: AnalysisStatus,
    /// Plugin payload, or the failure/skip description.
    pub result: Value,
    pub analysis_date: DateTime<Utc>,
}

impl AnalysisEntry {
    pub fn completed(plugin: &str, version: &str, result: Value) -> Self {
        Self::with_status(plugin, version, AnalysisStatus::Completed, result)
    }

    /// Failure shape: `{"failed": "<detail>"}`.
    pub fn failed(plugin: &str, version: &str, detail: impl fmt::Display) -> Self {
        Self::with_status(
            plugin,
            version,
            AnalysisStatus::Failed,
            json!({ "failed": detail.to_string() }),
        )
    }

    /// Skip shape: `{"skipped": "Required analysis not present: a, b"}`.
    pub fn skipped(plugin: &str, version: &str, missing: &BTreeSet<String>) -> Self {
        Self::with_status(
            plugin,
            version,
            AnalysisStatus::Skipped,
            json!({ "skipped": missing_dependencies_message(missing) }),
        )
    }

    fn with_status(plugin: &str, version: &str, status: AnalysisStatus, result: Value) -> Self {
        Self {
            plugin: plugin.to_string(),
            plugin_version: version.to_string(),
            status,
            result,
            analysis_date: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == AnalysisStatus::Completed
    }

    /// Failure or skip detail, if any.
    pub fn detail(&self) -> Option<&str> {
        match self.status {
            AnalysisStatus::Completed => None,
            AnalysisStatus::Failed => self.result.get("failed").and_then(Value::as_str),
            AnalysisStatus::Skipped => self.result.get("skipped").and_then(Value::as_str),
        }
    }
}

/// Human readable list of unmet prerequisites.
pub fn missing_dependencies_message(missing: &BTreeSet<String>) -> String {
    let names: Vec<&str> = missing.iter().map(String::as_str).collect();
    format!("Required analysis not present: {}", names.join(", "))
}
