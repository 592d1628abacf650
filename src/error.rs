//! Error types for the backup pipeline.

use thiserror::Error;

/// A stage-scoped backup failure. Export, archive, and upload errors abort
/// the run and become the run's recorded error message; reporting errors are
/// always caught at the reporter boundary and never abort a run.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Export-stage failure. The message already names the failing tool or
    /// carries the exact zero-collections text, so no prefix is added here.
    #[error("{0}")]
    Export(String),

    #[error("Archive creation failed: {0}")]
    Archive(String),

    #[error("S3 upload failed: {0}")]
    Upload(String),

    #[error("Reporting failed: {0}")]
    Reporting(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
