//! Configuration for the pipeline.
//!
//! Every section has defaults, so a partial JSON document only overrides
//! the values it names.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Master configuration for all three stages and their collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Unpacking stage configuration.
    pub unpacking: UnpackingConfig,
    /// Analysis stage configuration.
    pub analysis: AnalysisConfig,
    /// Comparison stage configuration.
    pub comparison: ComparisonConfig,
    /// Per-object lock configuration.
    pub locks: LockConfig,
    /// Degraded-health detection.
    pub health: HealthConfig,
    /// Storage locations.
    pub storage: StorageConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        for (stage, workers) in [
            ("unpacking", self.unpacking.workers),
            ("analysis", self.analysis.workers),
            ("comparison", self.comparison.workers),
        ] {
            if workers == 0 {
                return Err(PipelineError::InvalidConfig(format!(
                    "{stage}.workers must be at least 1"
                )));
            }
        }
        if self.health.storage_failure_threshold == 0 {
            return Err(PipelineError::InvalidConfig(
                "health.storage_failure_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnpackingConfig {
    pub workers: usize,
    /// Objects at this extraction depth are not unpacked further.
    pub max_depth: usize,
    /// Extra bounded waits after a lock timeout before the item fails as busy.
    pub lock_retries: u32,
}

impl Default for UnpackingConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_depth: 8,
            lock_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub workers: usize,
    /// Selection used when a submission names none. `None` runs everything registered.
    pub default_plugins: Option<Vec<String>>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            default_plugins: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    pub workers: usize,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self { workers: 1 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub acquire_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive storage failures before the pipeline reports degraded.
    pub storage_failure_threshold: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            storage_failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for the filesystem content store.
    pub content_dir: Option<PathBuf>,
}
