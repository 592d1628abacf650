//! Export stage: pulls collection data out of MongoDB into a per-run
//! directory.
//!
//! Two interchangeable strategies implement the same contract. `DumpExport`
//! shells out to `mongodump` once for the whole database and parses the
//! per-collection counts out of its report; any failure there is fatal.
//! `CollectionExport` fetches collections one at a time and keeps going when
//! an individual collection fails, so partial success is possible.

use crate::error::BackupError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

pub const NO_COLLECTIONS_ERROR: &str = "No collections were successfully backed up";

/// What the export stage produced.
#[derive(Debug, Default)]
pub struct ExportReport {
    pub collections: Vec<String>,
    pub documents: u64,
    /// Per-collection failures that did not abort the stage.
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait ExportStrategy: Send + Sync {
    /// Export the requested collections into `dest_dir`, creating it.
    async fn export(
        &self,
        collections: &[String],
        dest_dir: &Path,
    ) -> Result<ExportReport, BackupError>;
}

/// Capability to fetch one collection's documents.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch_collection(&self, name: &str) -> anyhow::Result<Vec<serde_json::Value>>;
}

/// `DocumentFetcher` backed by one `mongoexport` process per collection
/// (NDJSON on stdout).
pub struct MongoExportFetcher {
    uri: String,
    db: String,
}

impl MongoExportFetcher {
    pub fn new(uri: String, db: String) -> Self {
        Self { uri, db }
    }
}

#[async_trait]
impl DocumentFetcher for MongoExportFetcher {
    async fn fetch_collection(&self, name: &str) -> anyhow::Result<Vec<serde_json::Value>> {
        let output = Command::new("mongoexport")
            .arg(format!("--uri={}", self.uri))
            .arg(format!("--db={}", self.db))
            .arg(format!("--collection={name}"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            anyhow::bail!(
                "mongoexport exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut documents = Vec::new();
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            documents.push(serde_json::from_str(line)?);
        }
        Ok(documents)
    }
}

/// Per-collection export. A failing collection is logged and reported as a
/// warning, and the stage continues; zero successful collections is fatal.
pub struct CollectionExport {
    fetcher: Arc<dyn DocumentFetcher>,
}

impl CollectionExport {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl ExportStrategy for CollectionExport {
    async fn export(
        &self,
        collections: &[String],
        dest_dir: &Path,
    ) -> Result<ExportReport, BackupError> {
        tokio::fs::create_dir_all(dest_dir).await.map_err(export_error)?;

        let mut report = ExportReport::default();
        for name in collections {
            match self.fetcher.fetch_collection(name).await {
                Ok(documents) => {
                    let path = dest_dir.join(format!("{name}.json"));
                    let payload = serde_json::to_vec_pretty(&documents).map_err(|e| {
                        BackupError::Export(format!(
                            "MongoDB export failed: could not serialize {name}: {e}"
                        ))
                    })?;
                    tokio::fs::write(&path, payload).await.map_err(export_error)?;

                    tracing::debug!(collection = %name, documents = documents.len(), "Exported collection");
                    report.documents += documents.len() as u64;
                    report.collections.push(name.clone());
                }
                Err(e) => {
                    tracing::warn!(collection = %name, error = %e, "Collection export failed, continuing");
                    report
                        .warnings
                        .push(format!("Failed to export collection {name}: {e}"));
                }
            }
        }

        if report.collections.is_empty() {
            return Err(BackupError::Export(NO_COLLECTIONS_ERROR.into()));
        }

        tracing::info!(
            collections = report.collections.len(),
            documents = report.documents,
            warnings = report.warnings.len(),
            "Collection export complete"
        );
        Ok(report)
    }
}

/// Whole-database export via a single `mongodump` invocation. One atomic
/// external call; any failure is fatal and no partial success exists.
pub struct DumpExport {
    uri: String,
    db: String,
}

impl DumpExport {
    pub fn new(uri: String, db: String) -> Self {
        Self { uri, db }
    }
}

#[async_trait]
impl ExportStrategy for DumpExport {
    async fn export(
        &self,
        collections: &[String],
        dest_dir: &Path,
    ) -> Result<ExportReport, BackupError> {
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| BackupError::Export(format!("MongoDB dump failed: {e}")))?;

        let output = Command::new("mongodump")
            .arg(format!("--uri={}", self.uri))
            .arg(format!("--db={}", self.db))
            .arg(format!("--out={}", dest_dir.display()))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| BackupError::Export(format!("MongoDB dump failed: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(BackupError::Export(format!(
                "MongoDB dump failed: {}",
                stderr.trim()
            )));
        }

        // mongodump writes its per-collection report to stderr
        let counts = parse_dump_report(&stderr, &self.db);
        let report = report_from_counts(counts, collections);
        if !report.warnings.is_empty() {
            tracing::warn!(warnings = ?report.warnings, "Dump report parsed to nothing");
        }

        tracing::info!(
            collections = report.collections.len(),
            documents = report.documents,
            "Database dump complete"
        );
        Ok(report)
    }
}

/// Stage report from the parsed counts. A dump that succeeded but whose
/// report parsed to nothing (empty database, report format drift) falls
/// back to the requested names with a warning instead of claiming success
/// over an empty collection set.
fn report_from_counts(counts: Vec<(String, u64)>, requested: &[String]) -> ExportReport {
    if counts.is_empty() {
        return ExportReport {
            collections: requested.to_vec(),
            documents: 0,
            warnings: vec![
                "mongodump reported no per-collection counts; recording the requested set".into(),
            ],
        };
    }
    ExportReport {
        documents: counts.iter().map(|(_, n)| n).sum(),
        collections: counts.into_iter().map(|(name, _)| name).collect(),
        warnings: Vec::new(),
    }
}

fn export_error(cause: impl std::fmt::Display) -> BackupError {
    BackupError::Export(format!("MongoDB export failed: {cause}"))
}

/// Pull `(collection, document count)` pairs out of a mongodump report.
/// Lines look like `2024-01-02T03:04:05  done dumping mydb.entries (50 documents)`.
pub fn parse_dump_report(report: &str, db: &str) -> Vec<(String, u64)> {
    let prefix = format!("{db}.");
    let mut counts = Vec::new();

    for line in report.lines() {
        let Some(rest) = line.split("done dumping ").nth(1) else {
            continue;
        };
        let mut parts = rest.splitn(2, ' ');
        let Some(name) = parts.next().and_then(|q| q.strip_prefix(prefix.as_str())) else {
            continue;
        };
        let count = parts
            .next()
            .and_then(|tail| tail.strip_prefix('('))
            .and_then(|tail| tail.split(' ').next())
            .and_then(|digits| digits.parse::<u64>().ok())
            .unwrap_or(0);
        counts.push((name.to_string(), count));
    }
    counts
}
