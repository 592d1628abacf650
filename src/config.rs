//! Configuration loaded from environment variables (with `.env` support).

use std::path::PathBuf;

/// Collections exported when a request does not name any.
pub const DEFAULT_COLLECTIONS: &[&str] = &[
    "entries",
    "treatments",
    "devicestatus",
    "profile",
    "food",
    "activity",
];

/// Compression codec applied to the backup archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Fast, universally readable (default).
    Gzip,
    /// Slower, higher ratio.
    Brotli,
}

impl CompressionMethod {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "brotli" => CompressionMethod::Brotli,
            _ => CompressionMethod::Gzip,
        }
    }

    /// File extension without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionMethod::Gzip => "gz",
            CompressionMethod::Brotli => "br",
        }
    }

    /// Display label used in completion summaries.
    pub fn label(&self) -> &'static str {
        match self {
            CompressionMethod::Gzip => "GZIP",
            CompressionMethod::Brotli => "BROTLI",
        }
    }
}

/// Which export strategy the orchestrator is wired with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStrategyKind {
    /// One `mongodump` invocation for the whole database (default).
    Dump,
    /// Per-collection export, continuing past individual failures.
    Collections,
}

impl ExportStrategyKind {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "collections" => ExportStrategyKind::Collections,
            _ => ExportStrategyKind::Dump,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mongo_uri: String,
    pub mongo_db: String,
    pub default_collections: Vec<String>,
    pub backups_dir: PathBuf,
    pub export_strategy: ExportStrategyKind,
    pub compression_method: CompressionMethod,
    pub enable_nightly_backup: bool,
    pub backup_hour: u32,
    pub backup_minute: u32,
    pub rate_limit_minutes: u64,
    pub s3_bucket: String,
    pub aws_region: String,
    pub s3_endpoint: Option<String>,
    pub discord_token: String,
    pub backup_channel_id: Option<String>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let default_collections = std::env::var("BACKUP_COLLECTIONS")
            .ok()
            .map(|v| {
                v.split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect());

        Self {
            mongo_uri: std::env::var("MONGO_URI").unwrap_or_default(),
            mongo_db: std::env::var("MONGO_DB").unwrap_or_else(|_| "nightscout".into()),
            default_collections,
            backups_dir: PathBuf::from(
                std::env::var("BACKUPS_DIR").unwrap_or_else(|_| "backups".into()),
            ),
            export_strategy: ExportStrategyKind::parse(
                &std::env::var("EXPORT_STRATEGY").unwrap_or_default(),
            ),
            compression_method: CompressionMethod::parse(
                &std::env::var("COMPRESSION_METHOD").unwrap_or_default(),
            ),
            enable_nightly_backup: std::env::var("ENABLE_NIGHTLY_BACKUP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            backup_hour: std::env::var("BACKUP_HOUR")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|h| *h < 24)
                .unwrap_or(2),
            backup_minute: std::env::var("BACKUP_MINUTE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|m| *m < 60)
                .unwrap_or(0),
            rate_limit_minutes: std::env::var("RATE_LIMIT_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            s3_bucket: std::env::var("S3_BACKUP_BUCKET").unwrap_or_default(),
            aws_region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".into()),
            s3_endpoint: std::env::var("S3_ENDPOINT").ok(),
            discord_token: std::env::var("DISCORD_TOKEN").unwrap_or_default(),
            backup_channel_id: std::env::var("BACKUP_CHANNEL_ID").ok().filter(|v| !v.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_method_parse() {
        assert_eq!(CompressionMethod::parse("gzip"), CompressionMethod::Gzip);
        assert_eq!(CompressionMethod::parse("BROTLI"), CompressionMethod::Brotli);
        // Unknown values fall back to the default codec
        assert_eq!(CompressionMethod::parse("zip"), CompressionMethod::Gzip);
        assert_eq!(CompressionMethod::parse(""), CompressionMethod::Gzip);
    }

    #[test]
    fn test_compression_method_extension() {
        assert_eq!(CompressionMethod::Gzip.extension(), "gz");
        assert_eq!(CompressionMethod::Brotli.extension(), "br");
    }

    #[test]
    fn test_export_strategy_parse() {
        assert_eq!(ExportStrategyKind::parse("dump"), ExportStrategyKind::Dump);
        assert_eq!(
            ExportStrategyKind::parse("collections"),
            ExportStrategyKind::Collections
        );
        assert_eq!(ExportStrategyKind::parse(""), ExportStrategyKind::Dump);
    }
}
