use backup_bot_rs::config::{AppConfig, ExportStrategyKind};
use backup_bot_rs::services::archiver::Archiver;
use backup_bot_rs::services::exporter::{
    CollectionExport, DumpExport, ExportStrategy, MongoExportFetcher,
};
use backup_bot_rs::services::orchestrator::{BackupEvent, BackupOrchestrator};
use backup_bot_rs::services::rate_limiter::RateLimiter;
use backup_bot_rs::services::reporter::{DiscordApi, ProgressReporter};
use backup_bot_rs::services::scheduler::NightlyScheduler;
use backup_bot_rs::services::uploader::S3Store;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .init();

    tracing::info!(db = %config.mongo_db, bucket = %config.s3_bucket, "Starting backup bot");

    // Ensure the staging directory exists
    std::fs::create_dir_all(&config.backups_dir)?;

    let cancel = CancellationToken::new();

    // Storage, with a reachability probe up front
    let store = Arc::new(S3Store::new(&config).await);
    if !store.test_connection().await {
        tracing::warn!("S3 is unreachable; uploads will fail until it recovers");
    }

    let exporter: Arc<dyn ExportStrategy> = match config.export_strategy {
        ExportStrategyKind::Dump => Arc::new(DumpExport::new(
            config.mongo_uri.clone(),
            config.mongo_db.clone(),
        )),
        ExportStrategyKind::Collections => Arc::new(CollectionExport::new(Arc::new(
            MongoExportFetcher::new(config.mongo_uri.clone(), config.mongo_db.clone()),
        ))),
    };

    let reporter = ProgressReporter::new(
        Arc::new(DiscordApi::new(config.discord_token.clone())),
        config.backup_channel_id.clone(),
        cancel.clone(),
    );

    let orchestrator = Arc::new(BackupOrchestrator::new(
        exporter,
        Archiver::new(config.compression_method),
        store,
        reporter,
        RateLimiter::new(config.rate_limit_minutes),
        config.backups_dir.clone(),
        config.default_collections.clone(),
    ));

    // Log every completion, whatever the trigger
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BackupEvent::Completed(outcome)) => {
                    tracing::info!(
                        documents = outcome.documents_processed,
                        url = outcome.artifact_url.as_deref().unwrap_or(""),
                        "Backup completed"
                    );
                }
                Ok(BackupEvent::Failed(outcome)) => {
                    tracing::warn!(
                        error = outcome.error_message.as_deref().unwrap_or("unknown"),
                        "Backup failed"
                    );
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Backup event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let scheduler = if config.enable_nightly_backup {
        Some(
            NightlyScheduler::new(
                orchestrator.clone(),
                config.backup_hour,
                config.backup_minute,
                cancel.clone(),
            )
            .start(),
        )
    } else {
        tracing::info!("Nightly backup disabled by configuration");
        None
    };

    shutdown_signal().await;

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }
    tracing::info!("Backup bot stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
