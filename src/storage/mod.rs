//! Storage collaborator contracts.
//!
//! The pipeline never touches persistence directly. It reads and writes file
//! objects, analysis results, and comparisons through [`ObjectStore`], and raw
//! bytes through [`ContentStore`]. Implementations provide read-your-writes
//! after a synchronous call returns; the pipeline relies on nothing more.

pub mod fs;
pub mod health;
pub mod memory;

use crate::core::{AnalysisEntry, ComparisonId, ComparisonResult, FileObject, Uid};
use bytes::Bytes;
use thiserror::Error;

pub use fs::FsContentStore;
pub use health::{HealthMonitor, HealthStatus, HealthTransition};
pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(Uid),

    #[error("Storage backend failure: {0}")]
    Backend(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Object metadata and result persistence, keyed by uid.
pub trait ObjectStore: Send + Sync {
    /// Load an object without its content.
    fn get_object(&self, uid: &Uid) -> StorageResult<FileObject>;

    /// Upsert. Relations of an existing object are unioned and incoming
    /// analyses replace same-named ones; nothing stored is dropped.
    fn put_object(&self, object: &FileObject) -> StorageResult<()>;

    fn record_result(&self, uid: &Uid, plugin: &str, entry: &AnalysisEntry) -> StorageResult<()>;

    fn has_result(&self, uid: &Uid, plugin: &str) -> StorageResult<bool>;

    fn get_comparison(&self, id: &ComparisonId) -> StorageResult<Option<ComparisonResult>>;

    fn put_comparison(&self, result: &ComparisonResult) -> StorageResult<()>;
}

/// Content-addressed byte storage.
pub trait ContentStore: Send + Sync {
    fn put_content(&self, uid: &Uid, content: &[u8]) -> StorageResult<()>;

    fn get_content(&self, uid: &Uid) -> StorageResult<Bytes>;

    fn has_content(&self, uid: &Uid) -> StorageResult<bool>;
}
