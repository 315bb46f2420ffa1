//! services/sync/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! Deployment settings are loaded from environment variables at startup (the
//! `.env` file is used for local development). The sync tunables live in
//! [`SyncConfig`], a plain struct passed into the orchestrator so tests can
//! tighten thresholds without touching the environment.

use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Tunables for the sync pipeline. The defaults are the design values; every
/// number here is a behaviour knob, not a deployment concern.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Hard provider request limit; exceeding it is a programming error.
    pub provider_max_bytes: u64,
    /// Target chunk size, kept slightly below `provider_max_bytes`.
    pub chunk_target_bytes: u64,
    /// Per-chunk duration clamp, seconds.
    pub chunk_duration_min_sec: f64,
    pub chunk_duration_max_sec: f64,
    /// Narration-rate heuristic used to size word-range audio extraction.
    pub narration_rate_wpm: u32,
    /// Word count of the very first progressive chunk.
    pub progressive_first_chunk_words: usize,
    /// Word count of every later progressive chunk.
    pub progressive_chunk_words: usize,
    /// Text overlap added on each side of a progressive chunk slice.
    pub progressive_overlap_words: usize,
    /// Schedule the next chunk when the reader is within this many words of
    /// the synced frontier.
    pub advance_threshold_words: usize,
    /// Seconds of audio transcribed by the initial alignment probe.
    pub initial_alignment_probe_sec: f64,
    /// Book prefix (in words) the probe is matched against.
    pub initial_alignment_search_words: usize,
    /// Matches at or below this confidence are discarded.
    pub anchor_confidence_floor: f64,
    /// Greedy anchor-selection spacing.
    pub anchor_min_gap_sec: f64,
    pub anchor_min_gap_chars: usize,
    /// Anchor merge collapse window.
    pub anchor_merge_window_sec: f64,
    pub anchor_merge_window_chars: usize,
    /// Minimum interval between version-less playback checkpoint writes.
    pub progress_debounce_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            provider_max_bytes: 25 * 1024 * 1024,
            chunk_target_bytes: 24 * 1024 * 1024,
            chunk_duration_min_sec: 60.0,
            chunk_duration_max_sec: 600.0,
            narration_rate_wpm: 150,
            progressive_first_chunk_words: 75,
            progressive_chunk_words: 1000,
            progressive_overlap_words: 100,
            advance_threshold_words: 500,
            initial_alignment_probe_sec: 45.0,
            initial_alignment_search_words: 5000,
            anchor_confidence_floor: 0.5,
            anchor_min_gap_sec: 30.0,
            anchor_min_gap_chars: 500,
            anchor_merge_window_sec: 1.0,
            anchor_merge_window_chars: 10,
            progress_debounce_ms: 5000,
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// Root directory of the filesystem blob store.
    pub blob_root: PathBuf,
    /// Scratch directory for staged audio and chunk working directories.
    pub work_dir: PathBuf,
    pub log_level: Level,
    pub openai_api_key: Option<String>,
    pub stt_model: String,
    pub sync: SyncConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let blob_root = std::env::var("BLOB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./blobs"));

        let work_dir = std::env::var("SYNC_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("audiosync"));

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let openai_api_key = std::env::var("OPENAI_API_KEY").ok();
        let stt_model = std::env::var("STT_MODEL").unwrap_or_else(|_| "whisper-1".to_string());

        let mut sync = SyncConfig::default();
        if let Ok(raw) = std::env::var("CHUNK_TARGET_BYTES") {
            sync.chunk_target_bytes = raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue("CHUNK_TARGET_BYTES".to_string(), e.to_string())
            })?;
        }
        if let Ok(raw) = std::env::var("NARRATION_RATE_WPM") {
            sync.narration_rate_wpm = raw.parse::<u32>().map_err(|e| {
                ConfigError::InvalidValue("NARRATION_RATE_WPM".to_string(), e.to_string())
            })?;
        }

        Ok(Self {
            database_url,
            blob_root,
            work_dir,
            log_level,
            openai_api_key,
            stt_model,
            sync,
        })
    }
}
