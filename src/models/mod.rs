pub mod run;

pub use run::{BackupOutcome, BackupRequest, BackupRun, RunHistory, MAX_HISTORY};
