//! Error types for the fwflow pipeline.
//!
//! A single structured error type covers configuration, locking, plugin
//! registration, and stage lifecycle failures. Storage collaborator errors
//! keep their own type and convert into [`PipelineError::Storage`].

use crate::core::uid::Uid;
use crate::storage::StorageError;
use thiserror::Error;

/// Main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A string that is not a `<sha256>_<size>` content address
    #[error("Invalid uid: {0}")]
    InvalidUid(String),

    /// Plugin name not present in the registry
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    /// Boundary request that cannot be routed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Two plugins registered under the same name
    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    /// A second write to an analysis slot within one run
    #[error("Result for plugin '{plugin}' already recorded on {uid}")]
    DuplicateResult { uid: Uid, plugin: String },

    /// Bounded lock wait expired
    #[error("Lock on {uid} not granted within {waited_ms}ms")]
    LockTimeout { uid: Uid, waited_ms: u64 },

    /// Lock manager was shut down while waiting or before acquiring
    #[error("Lock manager is shut down")]
    LocksShutDown,

    /// Stage intake no longer accepts work
    #[error("Stage '{stage}' is shutting down")]
    ShuttingDown { stage: String },

    /// Worker thread could not be started
    #[error("Failed to start worker for stage '{stage}': {source}")]
    WorkerSpawn {
        stage: String,
        #[source]
        source: std::io::Error,
    },

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::LockTimeout { .. })
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
