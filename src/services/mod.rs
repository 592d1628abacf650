pub mod archiver;
pub mod exporter;
pub mod orchestrator;
pub mod rate_limiter;
pub mod reporter;
pub mod scheduler;
pub mod uploader;
