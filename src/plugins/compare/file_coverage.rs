//! Which extracted files the compared objects share and which are exclusive.

use crate::core::{CompareEntry, FileObject, PluginComparison, Uid};
use crate::plugins::{ComparePlugin, Plugin};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const NAME: &str = "file_coverage";

#[derive(Debug, Default)]
pub struct FileCoveragePlugin;

impl FileCoveragePlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Plugin for FileCoveragePlugin {
    fn name(&self) -> &str {
        NAME
    }
}

impl ComparePlugin for FileCoveragePlugin {
    fn compare(&self, objects: &[Arc<FileObject>]) -> anyhow::Result<PluginComparison> {
        let children: Vec<(Uid, BTreeSet<Uid>)> = objects
            .iter()
            .map(|o| (o.uid().clone(), o.children()))
            .collect();

        let mut common: Option<BTreeSet<Uid>> = None;
        for (_, set) in &children {
            common = Some(match common {
                None => set.clone(),
                Some(acc) => acc.intersection(set).cloned().collect(),
            });
        }
        let common = common.unwrap_or_default();

        let mut exclusive = BTreeMap::new();
        for (uid, set) in &children {
            let others: BTreeSet<&Uid> = children
                .iter()
                .filter(|(other, _)| other != uid)
                .flat_map(|(_, s)| s.iter())
                .collect();
            let only_here: Vec<&Uid> = set.iter().filter(|c| !others.contains(c)).collect();
            exclusive.insert(uid.clone(), json!(only_here));
        }

        let mut result = PluginComparison::new();
        result.insert(
            "files_in_common".into(),
            CompareEntry::all(json!(common)).with_collapse(true),
        );
        result.insert(
            "exclusive_files".into(),
            CompareEntry::per_object(exclusive, true),
        );
        Ok(result)
    }
}
