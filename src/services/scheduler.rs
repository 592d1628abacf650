//! Nightly trigger for the backup pipeline.
//!
//! A one-minute polling loop with a last-fired calendar-date guard. The
//! guard makes firing idempotent per day, so a wakeup that lands late
//! (laptop resume, long previous run) still fires once instead of being
//! skipped or doubled.

use crate::models::BackupRequest;
use crate::services::orchestrator::BackupOrchestrator;
use chrono::{NaiveDate, NaiveTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Whether a scheduled run is due: past today's target time and not already
/// fired today. Invalid hour/minute never fires.
pub fn should_fire(
    today: NaiveDate,
    time: NaiveTime,
    hour: u32,
    minute: u32,
    last_fired: Option<NaiveDate>,
) -> bool {
    if last_fired == Some(today) {
        return false;
    }
    match NaiveTime::from_hms_opt(hour, minute, 0) {
        Some(target) => time >= target,
        None => false,
    }
}

pub struct NightlyScheduler {
    orchestrator: Arc<BackupOrchestrator>,
    hour: u32,
    minute: u32,
    shutdown: CancellationToken,
}

impl NightlyScheduler {
    pub fn new(
        orchestrator: Arc<BackupOrchestrator>,
        hour: u32,
        minute: u32,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            orchestrator,
            hour,
            minute,
            shutdown,
        }
    }

    /// Run the polling loop until the shutdown token fires. Runs execute
    /// inline, so a long backup simply delays the next poll; the date guard
    /// keeps that from causing a second run.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                hour = self.hour,
                minute = self.minute,
                "Nightly backup scheduler started"
            );
            let mut last_fired: Option<NaiveDate> = None;
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        tracing::info!("Nightly backup scheduler stopped");
                        break;
                    }
                    _ = tokio::time::sleep(POLL_INTERVAL) => {
                        let now = Utc::now();
                        if should_fire(now.date_naive(), now.time(), self.hour, self.minute, last_fired) {
                            last_fired = Some(now.date_naive());
                            tracing::info!("Nightly backup due, starting run");
                            let outcome = self.orchestrator.run(BackupRequest::scheduled()).await;
                            if !outcome.success {
                                tracing::error!(
                                    error = outcome.error_message.as_deref().unwrap_or("unknown"),
                                    "Nightly backup failed"
                                );
                            }
                        }
                    }
                }
            }
        })
    }
}
