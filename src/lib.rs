//! Backup service library.
//!
//! Exports the backup pipeline and its collaborators so integration tests
//! and the binary can wire them together.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

pub use config::AppConfig;
pub use error::BackupError;
