//! Progress reporting into a chat thread, one thread per backup run.
//!
//! Every post swallows its own failure: reporting must never change a
//! backup's outcome. Threads schedule their own deletion after the retention
//! window through a task tied to the process shutdown token.

use crate::error::BackupError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Threads are deleted 7 days after creation, matching the S3 lifecycle
/// expiry of the download link they carry.
pub const THREAD_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Minimal chat-platform surface the reporter needs.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Create a thread under `channel_id`, returning the thread id.
    async fn create_thread(&self, channel_id: &str, name: &str) -> anyhow::Result<String>;
    async fn send_message(&self, channel_id: &str, content: &str) -> anyhow::Result<()>;
    async fn delete_channel(&self, channel_id: &str) -> anyhow::Result<()>;
}

/// Discord REST implementation.
pub struct DiscordApi {
    http: reqwest::Client,
    token: String,
}

const DISCORD_API: &str = "https://discord.com/api/v10";
const PRIVATE_THREAD: u8 = 12;

impl DiscordApi {
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }
}

#[async_trait]
impl ChatApi for DiscordApi {
    async fn create_thread(&self, channel_id: &str, name: &str) -> anyhow::Result<String> {
        let response = self
            .http
            .post(format!("{DISCORD_API}/channels/{channel_id}/threads"))
            .header("Authorization", self.auth())
            .json(&serde_json::json!({
                "name": name,
                "type": PRIVATE_THREAD,
                "auto_archive_duration": 10080,
                "invitable": false,
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        body.get("id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| anyhow::anyhow!("thread creation response had no id"))
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> anyhow::Result<()> {
        self.http
            .post(format!("{DISCORD_API}/channels/{channel_id}/messages"))
            .header("Authorization", self.auth())
            .json(&serde_json::json!({ "content": content }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> anyhow::Result<()> {
        self.http
            .delete(format!("{DISCORD_API}/channels/{channel_id}"))
            .header("Authorization", self.auth())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Everything the completion summary message needs.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub collections: Vec<String>,
    pub documents: u64,
    pub duration_secs: i64,
    pub original_size: String,
    pub compressed_size: String,
    pub compression_ratio: String,
    pub compression_method: String,
    pub download_url: String,
}

pub struct ProgressReporter {
    api: Arc<dyn ChatApi>,
    channel_id: Option<String>,
    retention: Duration,
    shutdown: CancellationToken,
}

impl ProgressReporter {
    pub fn new(api: Arc<dyn ChatApi>, channel_id: Option<String>, shutdown: CancellationToken) -> Self {
        Self {
            api,
            channel_id,
            retention: THREAD_RETENTION,
            shutdown,
        }
    }

    #[cfg(test)]
    fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Create this run's thread. Fails closed when no destination channel is
    /// configured; the run itself continues without a thread.
    pub async fn open_run(&self, run_id: &str) -> Result<String, BackupError> {
        let channel = self
            .channel_id
            .as_deref()
            .ok_or_else(|| BackupError::Config("no backup channel configured".into()))?;

        let thread_id = self
            .api
            .create_thread(channel, &format!("Backup {run_id}"))
            .await
            .map_err(|e| BackupError::Reporting(e.to_string()))?;

        tracing::info!(run_id = %run_id, thread_id = %thread_id, "Created backup thread");
        self.schedule_deletion(thread_id.clone());
        Ok(thread_id)
    }

    /// Delete the thread after the retention window. The task is cancelled
    /// with the process shutdown token; deletion failures are logged only.
    fn schedule_deletion(&self, thread_id: String) {
        let api = self.api.clone();
        let retention = self.retention;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(retention) => {
                    if let Err(e) = api.delete_channel(&thread_id).await {
                        tracing::warn!(thread_id = %thread_id, error = %e, "Failed to delete expired thread");
                    } else {
                        tracing::info!(thread_id = %thread_id, "Deleted expired backup thread");
                    }
                }
            }
        });
    }

    pub async fn post_start(&self, thread_id: &str, collections: Option<&[String]>) -> bool {
        let target = match collections {
            Some(names) if !names.is_empty() => names.join(", "),
            _ => "all default collections".to_string(),
        };
        self.post(thread_id, &format!("Starting backup of: {target}")).await
    }

    pub async fn post_progress(&self, thread_id: &str, stage: &str, detail: Option<&str>) -> bool {
        let content = match detail {
            Some(detail) => format!("{stage}: {detail}"),
            None => stage.to_string(),
        };
        self.post(thread_id, &content).await
    }

    pub async fn post_success(&self, thread_id: &str, summary: &RunSummary) -> bool {
        let content = format!(
            "Backup complete\n\
             Collections: {} ({})\n\
             Documents: {}\n\
             Duration: {}s\n\
             Size: {} -> {} ({} saved, {})\n\
             Download: {}\n\
             Link expires in 7 days per S3 lifecycle policy",
            summary.collections.len(),
            summary.collections.join(", "),
            summary.documents,
            summary.duration_secs,
            summary.original_size,
            summary.compressed_size,
            summary.compression_ratio,
            summary.compression_method,
            summary.download_url,
        );
        self.post(thread_id, &content).await
    }

    pub async fn post_failure(&self, thread_id: &str, error_text: &str) -> bool {
        self.post(thread_id, &format!("Error: {error_text}")).await
    }

    async fn post(&self, thread_id: &str, content: &str) -> bool {
        match self.api.send_message(thread_id, content).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, error = %e, "Failed to post progress update");
                false
            }
        }
    }
}
