//! Three-stage firmware processing pipeline: unpacking, analysis, comparison.

/// Error types
pub mod error;
/// Logging and tracing setup
pub mod logging;
/// Pipeline configuration
pub mod config;
/// Content digests
pub mod hashing;
/// Core data types module
pub mod core;
/// Plugin traits, registry and dependency gate
pub mod plugins;
/// Embedded file extraction
pub mod unpack;
/// Storage collaborator contracts and backends
pub mod storage;
/// Per-object unpacking locks
pub mod locks;
/// Stage schedulers
pub mod scheduler;
/// Boundary request routing
pub mod binding;
/// Stage assembly
pub mod pipeline;

pub use binding::{Acknowledgement, BackendBinding, Request, RequestKind};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use locks::{LockGuard, LockManager, LockToken};
pub use pipeline::{Pipeline, PipelineStats, Topology};
pub use scheduler::{Outcome, Stage, StageStats, WorkState};
