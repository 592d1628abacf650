//! The backup pipeline: export, archive, upload, report, record.
//!
//! One invocation owns one `BackupRun` and walks it forward through the
//! stages; any stage failure goes straight to the failure path, which still
//! reports to the thread, still cleans up, and still records an outcome.
//! Runs are never retried or deduplicated.

use crate::error::BackupError;
use crate::models::{BackupOutcome, BackupRequest, BackupRun, RunHistory};
use crate::services::archiver::{format_size, Archiver, CompressedArtifact};
use crate::services::exporter::ExportStrategy;
use crate::services::rate_limiter::{RateLimitDecision, RateLimiter};
use crate::services::reporter::{ProgressReporter, RunSummary};
use crate::services::uploader::ArtifactStore;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 32;
const ARTIFACT_PREFIX: &str = "nightscout-backup";

/// Completion notification for interested listeners.
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Completed(BackupOutcome),
    Failed(BackupOutcome),
}

/// Result of a manual trigger. `Throttled` means no run was started and
/// nothing was recorded.
#[derive(Debug)]
pub enum ManualTrigger {
    Completed(BackupOutcome),
    Throttled { retry_after: String },
}

pub struct BackupOrchestrator {
    exporter: Arc<dyn ExportStrategy>,
    archiver: Archiver,
    store: Arc<dyn ArtifactStore>,
    reporter: ProgressReporter,
    rate_limiter: RateLimiter,
    history: Mutex<RunHistory>,
    events: broadcast::Sender<BackupEvent>,
    backups_dir: PathBuf,
    default_collections: Vec<String>,
}

impl BackupOrchestrator {
    pub fn new(
        exporter: Arc<dyn ExportStrategy>,
        archiver: Archiver,
        store: Arc<dyn ArtifactStore>,
        reporter: ProgressReporter,
        rate_limiter: RateLimiter,
        backups_dir: PathBuf,
        default_collections: Vec<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            exporter,
            archiver,
            store,
            reporter,
            rate_limiter,
            history: Mutex::new(RunHistory::new()),
            events,
            backups_dir,
            default_collections,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    /// Defensive copy of the bounded run history, newest last.
    pub fn history(&self) -> Vec<BackupOutcome> {
        self.history.lock().unwrap().entries()
    }

    /// Manual trigger path: consult the rate limiter before any run state
    /// exists. Scheduled triggers call `run` directly and bypass it.
    pub async fn run_manual(
        &self,
        user_id: &str,
        collections: Option<Vec<String>>,
    ) -> ManualTrigger {
        match self.rate_limiter.check_and_record(user_id) {
            RateLimitDecision::Ok => {
                ManualTrigger::Completed(self.run(BackupRequest::manual(collections)).await)
            }
            decision @ RateLimitDecision::Throttled { .. } => {
                let retry_after = decision.retry_after().unwrap_or_default();
                tracing::info!(user_id = %user_id, retry_after = %retry_after, "Manual backup throttled");
                ManualTrigger::Throttled { retry_after }
            }
        }
    }

    /// Execute one full backup run. Always returns an outcome and always
    /// appends exactly one history entry.
    pub async fn run(&self, request: BackupRequest) -> BackupOutcome {
        let started = Utc::now();
        let mut run = BackupRun::new(started.format("%Y-%m-%d-%H-%M-%S").to_string(), started);
        let run_dir = self.backups_dir.join(&run.id);

        tracing::info!(run_id = %run.id, manual = request.is_manual, "Starting backup run");

        if request.wants_thread {
            match self.reporter.open_run(&run.id).await {
                Ok(thread_id) => {
                    self.reporter
                        .post_start(&thread_id, request.collections.as_deref())
                        .await;
                    run.thread_id = Some(thread_id);
                }
                Err(e) => {
                    tracing::warn!(run_id = %run.id, error = %e, "Could not open progress thread, continuing without one");
                }
            }
        }

        let result = self.execute_stages(&request, &mut run, &run_dir).await;

        // Unconditional cleanup of the per-run staging directory
        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(run_id = %run.id, error = %e, "Failed to remove staging directory");
            }
        }

        let duration_secs = (Utc::now() - started).num_seconds();
        let outcome = match result {
            Ok((artifact, url)) => {
                if let Some(thread_id) = &run.thread_id {
                    let summary = RunSummary {
                        collections: run.collections_processed.clone(),
                        documents: run.documents_processed,
                        duration_secs,
                        original_size: format_size(artifact.original_size),
                        compressed_size: format_size(artifact.compressed_size),
                        compression_ratio: artifact.ratio_label(),
                        compression_method: artifact.method.label().to_string(),
                        download_url: url.clone(),
                    };
                    self.reporter.post_success(thread_id, &summary).await;
                }
                tracing::info!(
                    run_id = %run.id,
                    collections = run.collections_processed.len(),
                    documents = run.documents_processed,
                    duration_secs,
                    url = %url,
                    "Backup run completed"
                );
                BackupOutcome {
                    success: true,
                    timestamp: started,
                    collections_processed: run.collections_processed.clone(),
                    documents_processed: run.documents_processed,
                    artifact_url: Some(url),
                    error_message: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Some(thread_id) = &run.thread_id {
                    self.reporter.post_failure(thread_id, &message).await;
                }
                tracing::error!(run_id = %run.id, error = %message, "Backup run failed");
                BackupOutcome {
                    success: false,
                    timestamp: started,
                    collections_processed: run.collections_processed.clone(),
                    documents_processed: run.documents_processed,
                    artifact_url: None,
                    error_message: Some(message),
                }
            }
        };

        self.record(outcome.clone());
        outcome
    }

    async fn execute_stages(
        &self,
        request: &BackupRequest,
        run: &mut BackupRun,
        run_dir: &std::path::Path,
    ) -> Result<(CompressedArtifact, String), BackupError> {
        let collections = request
            .collections
            .clone()
            .unwrap_or_else(|| self.default_collections.clone());

        // Export
        if let Some(thread_id) = &run.thread_id {
            self.reporter
                .post_progress(thread_id, "Exporting collections", None)
                .await;
        }
        let dump_dir = run_dir.join("dump");
        let report = self.exporter.export(&collections, &dump_dir).await?;
        for warning in &report.warnings {
            if let Some(thread_id) = &run.thread_id {
                self.reporter
                    .post_progress(thread_id, "Export warning", Some(warning))
                    .await;
            }
        }
        run.collections_processed = report.collections;
        run.documents_processed = report.documents;

        // Archive
        if let Some(thread_id) = &run.thread_id {
            self.reporter
                .post_progress(thread_id, "Creating archive", None)
                .await;
        }
        let dest_base = run_dir.join(format!("{ARTIFACT_PREFIX}-{}", run.id));
        let artifact = self.archiver.compress_dir(&dump_dir, &dest_base).await?;
        run.staged_artifact = Some(artifact.path.clone());

        // Upload
        if let Some(thread_id) = &run.thread_id {
            self.reporter
                .post_progress(thread_id, "Uploading to S3", None)
                .await;
        }
        let uploaded = self.store.upload(&artifact.path).await;
        if !uploaded.success {
            return Err(BackupError::Upload(
                uploaded.error.unwrap_or_else(|| "unknown error".into()),
            ));
        }

        Ok((artifact, uploaded.url.unwrap_or_default()))
    }

    fn record(&self, outcome: BackupOutcome) {
        self.history.lock().unwrap().push(outcome.clone());
        let event = if outcome.success {
            BackupEvent::Completed(outcome)
        } else {
            BackupEvent::Failed(outcome)
        };
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionMethod;
    use crate::services::exporter::{CollectionExport, DocumentFetcher, NO_COLLECTIONS_ERROR};
    use crate::services::reporter::ChatApi;
    use crate::services::uploader::{ArtifactInfo, UploadResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct MapFetcher {
        collections: HashMap<String, usize>,
    }

    #[async_trait]
    impl DocumentFetcher for MapFetcher {
        async fn fetch_collection(&self, name: &str) -> anyhow::Result<Vec<serde_json::Value>> {
            let count = *self
                .collections
                .get(name)
                .ok_or_else(|| anyhow::anyhow!("collection not found: {name}"))?;
            Ok((0..count).map(|i| serde_json::json!({ "_id": i })).collect())
        }
    }

    struct MemoryStore {
        uploads: AtomicUsize,
        fail_uploads: bool,
    }

    impl MemoryStore {
        fn new(fail_uploads: bool) -> Self {
            Self {
                uploads: AtomicUsize::new(0),
                fail_uploads,
            }
        }
    }

    #[async_trait]
    impl ArtifactStore for MemoryStore {
        async fn upload(&self, local_path: &Path) -> UploadResult {
            self.uploads.fetch_add(1, Ordering::SeqCst);
            if self.fail_uploads {
                return UploadResult {
                    success: false,
                    url: None,
                    key: None,
                    error: Some("connection reset".into()),
                };
            }
            let name = local_path.file_name().unwrap().to_string_lossy();
            UploadResult {
                success: true,
                url: Some(format!("https://bucket.s3.us-east-1.amazonaws.com/backups/{name}")),
                key: Some(format!("backups/{name}")),
                error: None,
            }
        }

        async fn remove(&self, _key: &str) {}

        async fn list_artifacts(&self) -> anyhow::Result<Vec<ArtifactInfo>> {
            Ok(Vec::new())
        }
    }

    struct RecordingChat {
        threads: std::sync::Mutex<Vec<String>>,
        messages: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingChat {
        fn new() -> Self {
            Self {
                threads: std::sync::Mutex::new(Vec::new()),
                messages: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatApi for RecordingChat {
        async fn create_thread(&self, _channel_id: &str, name: &str) -> anyhow::Result<String> {
            let mut threads = self.threads.lock().unwrap();
            threads.push(name.to_string());
            Ok(format!("thread-{}", threads.len() - 1))
        }

        async fn send_message(&self, _channel_id: &str, content: &str) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push(content.to_string());
            Ok(())
        }

        async fn delete_channel(&self, _channel_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn orchestrator(
        backups_dir: &Path,
        collections: &[(&str, usize)],
        chat: Arc<RecordingChat>,
        store: Arc<MemoryStore>,
        rate_limit_minutes: u64,
    ) -> BackupOrchestrator {
        let fetcher = MapFetcher {
            collections: collections
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
        };
        BackupOrchestrator::new(
            Arc::new(CollectionExport::new(Arc::new(fetcher))),
            Archiver::new(CompressionMethod::Gzip),
            store,
            ProgressReporter::new(chat, Some("chan-1".into()), CancellationToken::new()),
            RateLimiter::new(rate_limit_minutes),
            backups_dir.to_path_buf(),
            vec!["entries".into(), "treatments".into()],
        )
    }

    fn request(collections: &[&str], wants_thread: bool) -> BackupRequest {
        BackupRequest {
            collections: Some(collections.iter().map(|s| s.to_string()).collect()),
            wants_thread,
            is_manual: true,
        }
    }

    #[tokio::test]
    async fn test_successful_run_records_outcome_and_thread() {
        let tmp = TempDir::new().unwrap();
        let chat = Arc::new(RecordingChat::new());
        let store = Arc::new(MemoryStore::new(false));
        let orch = orchestrator(
            tmp.path(),
            &[("entries", 50), ("treatments", 15)],
            chat.clone(),
            store.clone(),
            0,
        );
        let mut events = orch.subscribe();

        let outcome = orch.run(request(&["entries", "treatments"], true)).await;

        assert!(outcome.success);
        assert_eq!(outcome.collections_processed, vec!["entries", "treatments"]);
        assert_eq!(outcome.documents_processed, 65);
        assert!(outcome.artifact_url.is_some());
        assert!(outcome.error_message.is_none());

        // Exactly one thread, start message names both collections
        let threads = chat.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert!(threads[0].starts_with("Backup "));
        let messages = chat.messages.lock().unwrap();
        assert!(messages[0].contains("entries, treatments"));

        assert_eq!(orch.history().len(), 1);
        assert!(matches!(events.try_recv().unwrap(), BackupEvent::Completed(_)));
    }

    #[tokio::test]
    async fn test_zero_collections_is_fatal_and_skips_upload() {
        let tmp = TempDir::new().unwrap();
        let chat = Arc::new(RecordingChat::new());
        let store = Arc::new(MemoryStore::new(false));
        let orch = orchestrator(tmp.path(), &[], chat, store.clone(), 0);

        let outcome = orch.run(request(&["entries"], false)).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error_message.as_deref(), Some(NO_COLLECTIONS_ERROR));
        assert!(outcome.artifact_url.is_none());
        assert_eq!(store.uploads.load(Ordering::SeqCst), 0);

        let history = orch.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_upload_failure_cleans_up_and_records_failure() {
        let tmp = TempDir::new().unwrap();
        let chat = Arc::new(RecordingChat::new());
        let store = Arc::new(MemoryStore::new(true));
        let orch = orchestrator(tmp.path(), &[("entries", 5)], chat.clone(), store, 0);

        let outcome = orch.run(request(&["entries"], true)).await;

        assert!(!outcome.success);
        let message = outcome.error_message.unwrap();
        assert!(message.starts_with("S3 upload failed:"), "got: {message}");

        // Staging directory removed despite the failure
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);

        // Failure surfaced to the thread
        let messages = chat.messages.lock().unwrap();
        assert!(messages
            .iter()
            .any(|m| m.contains("Error: S3 upload failed")));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let tmp = TempDir::new().unwrap();
        let chat = Arc::new(RecordingChat::new());
        let store = Arc::new(MemoryStore::new(false));
        let orch = orchestrator(tmp.path(), &[("entries", 1)], chat, store, 0);

        for _ in 0..12 {
            let _ = orch.run(request(&["entries"], false)).await;
        }
        assert_eq!(orch.history().len(), crate::models::MAX_HISTORY);
    }

    #[tokio::test]
    async fn test_manual_trigger_is_rate_limited() {
        let tmp = TempDir::new().unwrap();
        let chat = Arc::new(RecordingChat::new());
        let store = Arc::new(MemoryStore::new(false));
        let orch = orchestrator(tmp.path(), &[("entries", 1)], chat, store, 5);

        let first = orch.run_manual("u1", Some(vec!["entries".into()])).await;
        assert!(matches!(first, ManualTrigger::Completed(_)));

        let second = orch.run_manual("u1", Some(vec!["entries".into()])).await;
        match second {
            ManualTrigger::Throttled { retry_after } => {
                assert!(retry_after.ends_with('s'));
            }
            other => panic!("expected Throttled, got {other:?}"),
        }

        // Throttled call produced no history entry
        assert_eq!(orch.history().len(), 1);
    }

    #[tokio::test]
    async fn test_default_collections_used_when_unspecified() {
        let tmp = TempDir::new().unwrap();
        let chat = Arc::new(RecordingChat::new());
        let store = Arc::new(MemoryStore::new(false));
        let orch = orchestrator(
            tmp.path(),
            &[("entries", 2), ("treatments", 3)],
            chat.clone(),
            store,
            0,
        );

        let outcome = orch.run(BackupRequest::scheduled()).await;

        assert!(outcome.success);
        assert_eq!(outcome.documents_processed, 5);
        // Start message falls back to the default-set wording
        let messages = chat.messages.lock().unwrap();
        assert!(messages[0].contains("all default collections"));
    }
}
