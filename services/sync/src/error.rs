//! services/sync/src/error.rs
//!
//! Defines the primary error type for the sync service.

use crate::config::ConfigError;
use audiosync_core::ports::PortError;

/// The primary error type for the sync service.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(PortError),

    /// Book manifest missing or unparsable.
    #[error("Invalid book archive: {0}")]
    InvalidArchive(String),

    /// A referenced asset was not found. Recovered inside the parser (the
    /// original reference is kept); this variant never escapes it.
    #[error("Missing asset: {0}")]
    AssetMissing(String),

    /// The uploaded audio container is not one the pipeline understands.
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// Post-segmentation byte check failed; fatal.
    #[error("Audio chunk of {bytes} bytes exceeds the {limit} byte limit")]
    ChunkTooLarge { bytes: u64, limit: u64 },

    /// The provider returned an error or a malformed body; fatal for the
    /// current chunk/session.
    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    /// The aligner found no anchors above the confidence floor.
    #[error("No alignment anchors above the confidence floor")]
    AlignmentEmpty,

    /// Ownership check failed; surfaced verbatim.
    #[error("Unauthorized")]
    Unauthorized,

    /// A record was missing at time of use; fatal for the session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Session deleted or externally cancelled. Not an error state; no
    /// `error` string is persisted for it.
    #[error("Cancelled")]
    Cancelled,

    /// Programming error; must surface with full context.
    #[error("Internal invariant violated: {0}")]
    InvariantViolated(String),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// Represents a standard Input/Output error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Cancellation is silent completion, never a persisted session error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

// Ownership and missing-record failures keep their identity when they cross
// the port boundary; everything else stays wrapped.
impl From<PortError> for SyncError {
    fn from(e: PortError) -> Self {
        match e {
            PortError::Unauthorized => Self::Unauthorized,
            PortError::NotFound(what) => Self::NotFound(what),
            other => Self::Port(other),
        }
    }
}

/// A convenience type alias for `Result<T, SyncError>`.
pub type SyncResult<T> = Result<T, SyncError>;
