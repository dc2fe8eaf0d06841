//! Built-in compare plugins.

pub mod file_coverage;
pub mod general_info;

pub use file_coverage::FileCoveragePlugin;
pub use general_info::GeneralInfoPlugin;
