//! Plugin capability traits and the explicit plugin registry.
//!
//! A plugin is anything that exposes a name, a dependency list, and a unit of
//! work. Analysis plugins consume one [`FileObject`]; compare plugins consume an
//! ordered list. The registry is built by the caller and handed to each stage,
//! so a test can assemble a pipeline with exactly the plugins it needs.

pub mod compare;
pub mod entropy;
pub mod file_hashes;
pub mod file_type;
pub mod gate;

use crate::core::{FileObject, PluginComparison, UNPACKER_PLUGIN};
use crate::error::{PipelineError, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub use gate::{DependencyGate, GateDecision};

/// Shared plugin metadata.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    /// Names of analyses that must have completed on every input object.
    fn dependencies(&self) -> &[String] {
        &[]
    }
}

/// Single-object analysis.
pub trait AnalysisPlugin: Plugin {
    fn analyze(&self, object: &FileObject) -> anyhow::Result<Value>;
}

/// Multi-object comparison over an ordered list.
pub trait ComparePlugin: Plugin {
    fn compare(&self, objects: &[Arc<FileObject>]) -> anyhow::Result<PluginComparison>;
}

/// Registered analysis and compare plugins, keyed by name.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    analysis: BTreeMap<String, Arc<dyn AnalysisPlugin>>,
    compare: BTreeMap<String, Arc<dyn ComparePlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in plugin.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let analysis: [Arc<dyn AnalysisPlugin>; 3] = [
            Arc::new(file_type::FileTypePlugin::new()),
            Arc::new(file_hashes::FileHashesPlugin::new()),
            Arc::new(entropy::EntropyPlugin::new()),
        ];
        for plugin in analysis {
            // names are distinct constants
            let _ = registry.register_analysis(plugin);
        }
        let _ = registry.register_compare(Arc::new(compare::GeneralInfoPlugin::new()));
        let _ = registry.register_compare(Arc::new(compare::FileCoveragePlugin::new()));
        registry
    }

    pub fn register_analysis(&mut self, plugin: Arc<dyn AnalysisPlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if name == UNPACKER_PLUGIN || self.analysis.contains_key(&name) {
            return Err(PipelineError::DuplicatePlugin(name));
        }
        self.analysis.insert(name, plugin);
        Ok(())
    }

    pub fn register_compare(&mut self, plugin: Arc<dyn ComparePlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        if self.compare.contains_key(&name) {
            return Err(PipelineError::DuplicatePlugin(name));
        }
        self.compare.insert(name, plugin);
        Ok(())
    }

    pub fn analysis(&self, name: &str) -> Option<Arc<dyn AnalysisPlugin>> {
        self.analysis.get(name).cloned()
    }

    pub fn analysis_names(&self) -> Vec<String> {
        self.analysis.keys().cloned().collect()
    }

    pub fn compare_plugins(&self) -> impl Iterator<Item = &Arc<dyn ComparePlugin>> {
        self.compare.values()
    }

    pub fn compare_names(&self) -> Vec<String> {
        self.compare.keys().cloned().collect()
    }

    /// Expand a selection with its transitive dependencies.
    ///
    /// `None` selects every registered analysis plugin. Requested names must be
    /// registered; dependencies that are not registered (including the
    /// unpacker slot) are left out and surface later as missing prerequisites.
    pub fn resolve(&self, requested: Option<&[String]>) -> Result<BTreeSet<String>> {
        let mut stack: Vec<String> = match requested {
            None => return Ok(self.analysis.keys().cloned().collect()),
            Some(names) => {
                for name in names {
                    if !self.analysis.contains_key(name) {
                        return Err(PipelineError::UnknownPlugin(name.clone()));
                    }
                }
                names.to_vec()
            }
        };
        let mut selected = BTreeSet::new();
        while let Some(name) = stack.pop() {
            let Some(plugin) = self.analysis.get(&name) else {
                continue;
            };
            if selected.insert(name) {
                stack.extend(plugin.dependencies().iter().cloned());
            }
        }
        Ok(selected)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("analysis", &self.analysis.keys().collect::<Vec<_>>())
            .field("compare", &self.compare.keys().collect::<Vec<_>>())
            .finish()
    }
}
