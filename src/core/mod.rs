//! Core data types for the firmware pipeline.
//!
//! File objects, their content-addressed identifiers, and the analysis and
//! comparison results that accumulate on them as they move through the stages.

pub mod analysis;
pub mod comparison;
pub mod file_object;
pub mod uid;

pub use analysis::{AnalysisEntry, AnalysisStatus, UNPACKER_PLUGIN};
pub use comparison::{
    CompareEntry, ComparisonId, ComparisonResult, PluginComparison, COMPARE_FAILED,
    COMPARE_SKIPPED,
};
pub use file_object::{FileObject, FileObjectRecord};
pub use uid::Uid;
