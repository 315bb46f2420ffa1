//! services/sync/src/bootstrap.rs
//!
//! Wires the concrete adapters into a ready-to-use orchestrator from the
//! deployment configuration: SQLite pool and migrations, filesystem blob
//! store, ffmpeg chunker, and the OpenAI transcription client.

use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use sqlx::sqlite::SqlitePoolOptions;
use tracing::info;

use audiosync_core::ports::BlobStore;

use crate::adapters::{DbAdapter, FsBlobStore, OpenAiSttAdapter};
use crate::chunker::FfmpegChunker;
use crate::config::{Config, ConfigError};
use crate::error::{SyncError, SyncResult};
use crate::orchestrator::SyncOrchestrator;

/// Builds the sync core from configuration. The caller owns the returned
/// orchestrator; everything else hangs off it.
pub async fn build(config: &Config) -> SyncResult<Arc<SyncOrchestrator>> {
    info!("Connecting to database...");
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db = Arc::new(DbAdapter::new(pool));
    info!("Running database migrations...");
    db.run_migrations()
        .await
        .map_err(|e| SyncError::Database(sqlx::Error::Migrate(Box::new(e))))?;
    info!("Database migrations complete.");

    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(config.blob_root.clone()));

    let chunker = Arc::new(FfmpegChunker::new(
        config.work_dir.join("chunks"),
        config.sync.clone(),
        Some(blobs.clone()),
    ));

    let api_key = config
        .openai_api_key
        .as_ref()
        .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;
    let openai_client = Client::with_config(OpenAIConfig::new().with_api_key(api_key));
    let stt = Arc::new(OpenAiSttAdapter::new(
        openai_client,
        config.stt_model.clone(),
    ));

    Ok(SyncOrchestrator::new(
        db,
        blobs,
        stt,
        chunker,
        config.sync.clone(),
        config.work_dir.join("stage"),
    ))
}
