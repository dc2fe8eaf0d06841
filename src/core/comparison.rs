//! Comparison result types.
//!
//! A compare plugin produces a [`PluginComparison`]: a map from a feature key
//! to a [`CompareEntry`]. An entry holds values keyed by object uid, or a single
//! `"all"` value when every compared object agrees, plus an optional display
//! hint telling the presentation layer to collapse the entry.

use crate::core::analysis::missing_dependencies_message;
use crate::core::uid::Uid;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Key used when every compared object shares a value.
pub const ALL_KEY: &str = "all";
/// Feature key substituted when a compare plugin lacks prerequisites.
pub const COMPARE_SKIPPED: &str = "Compare Skipped";
/// Feature key substituted when a compare plugin's unit of work errors.
pub const COMPARE_FAILED: &str = "Compare Failed";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompareEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse: Option<bool>,
    #[serde(flatten)]
    pub values: BTreeMap<String, Value>,
}

impl CompareEntry {
    /// Single shared value, no display hint.
    pub fn all(value: impl Into<Value>) -> Self {
        let mut values = BTreeMap::new();
        values.insert(ALL_KEY.to_string(), value.into());
        Self {
            collapse: None,
            values,
        }
    }

    /// Values per object, folded into `"all"` when they are identical.
    pub fn per_object(values: BTreeMap<Uid, Value>, collapse: bool) -> Self {
        let mut distinct = values.values();
        let first = distinct.next().cloned();
        let identical = values.len() > 1 && distinct.all(|v| Some(v) == first.as_ref());
        let values = match first {
            Some(shared) if identical => {
                let mut map = BTreeMap::new();
                map.insert(ALL_KEY.to_string(), shared);
                map
            }
            _ => values
                .into_iter()
                .map(|(uid, value)| (uid.to_string(), value))
                .collect(),
        };
        Self {
            collapse: Some(collapse),
            values,
        }
    }

    pub fn with_collapse(mut self, collapse: bool) -> Self {
        self.collapse = Some(collapse);
        self
    }

    pub fn value_for(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// One compare plugin's output.
pub type PluginComparison = BTreeMap<String, CompareEntry>;

/// Standard skipped shape: `{"Compare Skipped": {"all": "Required analysis not present: ..."}}`.
pub fn compare_skipped(missing: &BTreeSet<String>) -> PluginComparison {
    let mut result = PluginComparison::new();
    result.insert(
        COMPARE_SKIPPED.to_string(),
        CompareEntry::all(missing_dependencies_message(missing)),
    );
    result
}

/// Failure shape: `{"Compare Failed": {"all": "<detail>"}}`.
pub fn compare_failed(detail: impl fmt::Display) -> PluginComparison {
    let mut result = PluginComparison::new();
    result.insert(
        COMPARE_FAILED.to_string(),
        CompareEntry::all(detail.to_string()),
    );
    result
}

/// Identity of a comparison: the member uids, sorted, joined by `;`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComparisonId(String);

impl ComparisonId {
    pub fn from_uids(uids: &[Uid]) -> Self {
        let sorted: BTreeSet<&str> = uids.iter().map(Uid::as_str).collect();
        ComparisonId(sorted.into_iter().collect::<Vec<_>>().join(";"))
    }

    /// Member uids in sorted order.
    pub fn uids(&self) -> Result<Vec<Uid>> {
        self.0.split(';').map(Uid::parse).collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComparisonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// All plugin outputs for one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub compare_id: ComparisonId,
    /// Uids in the order they were submitted.
    pub uids: Vec<Uid>,
    pub plugins: BTreeMap<String, PluginComparison>,
    pub submission_date: DateTime<Utc>,
}

impl ComparisonResult {
    pub fn new(uids: Vec<Uid>) -> Self {
        Self {
            compare_id: ComparisonId::from_uids(&uids),
            uids,
            plugins: BTreeMap::new(),
            submission_date: Utc::now(),
        }
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginComparison> {
        self.plugins.get(name)
    }
}
