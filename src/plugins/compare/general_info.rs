//! Side-by-side basic facts: name, size, type, and depth.

use crate::core::{CompareEntry, FileObject, PluginComparison, Uid};
use crate::plugins::{file_type, ComparePlugin, Plugin};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const NAME: &str = "general_info";

#[derive(Debug)]
pub struct GeneralInfoPlugin {
    dependencies: Vec<String>,
}

impl GeneralInfoPlugin {
    pub fn new() -> Self {
        Self {
            dependencies: vec![file_type::NAME.to_string()],
        }
    }
}

impl Default for GeneralInfoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

fn feature(objects: &[Arc<FileObject>], extract: impl Fn(&FileObject) -> Value) -> CompareEntry {
    let values: BTreeMap<Uid, Value> = objects
        .iter()
        .map(|object| (object.uid().clone(), extract(object)))
        .collect();
    CompareEntry::per_object(values, false)
}

impl Plugin for GeneralInfoPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl ComparePlugin for GeneralInfoPlugin {
    fn compare(&self, objects: &[Arc<FileObject>]) -> anyhow::Result<PluginComparison> {
        let mut result = PluginComparison::new();
        result.insert(
            "file_name".into(),
            feature(objects, |o| json!(o.file_name())),
        );
        result.insert("size".into(), feature(objects, |o| json!(o.size())));
        result.insert(
            "mime".into(),
            feature(objects, |o| {
                o.analysis(file_type::NAME)
                    .map(|entry| entry.result["mime"].clone())
                    .unwrap_or(Value::Null)
            }),
        );
        result.insert(
            "included_files".into(),
            feature(objects, |o| json!(o.children().len())),
        );
        Ok(result)
    }
}
