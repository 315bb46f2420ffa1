//! crates/audiosync_core/src/domain.rs
//!
//! Defines the pure, core data structures for the sync engine.
//! These structs are independent of any database or transport format;
//! only the pieces that end up in JSON columns (chapters, anchors)
//! derive serde.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

//=========================================================================================
// Books
//=========================================================================================

/// A single chapter of a parsed book, expressed as a half-open character
/// range into the book's plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_char: usize,
    pub end_char: usize,
    pub word_count: usize,
}

/// A chapter rendered as standalone HTML with stylesheets and images
/// inlined, suitable for direct display in the reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotatedChapter {
    pub title: String,
    pub html: String,
}

/// The output of the book parser, before a record exists.
#[derive(Debug, Clone)]
pub struct ParsedBook {
    pub title: String,
    pub author: Option<String>,
    pub plain_text: String,
    pub chapters: Vec<Chapter>,
    pub annotated_chapters: Vec<AnnotatedChapter>,
}

/// A persisted book uploaded by a user.
///
/// `plain_text` is immutable once created; paragraph boundaries are exactly
/// the blank-line positions. `content_hash` (SHA-256 of the original bytes)
/// is unique per owner.
#[derive(Debug, Clone)]
pub struct Book {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub author: Option<String>,
    pub original_filename: String,
    pub plain_text: String,
    pub chapters: Vec<Chapter>,
    pub annotated_chapters: Vec<AnnotatedChapter>,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
}

/// The fields needed to create a [`Book`]; the store assigns id and
/// timestamps, and deduplicates on `(owner_id, content_hash)`.
#[derive(Debug, Clone)]
pub struct NewBook {
    pub owner_id: Uuid,
    pub title: String,
    pub author: Option<String>,
    pub original_filename: String,
    pub plain_text: String,
    pub chapters: Vec<Chapter>,
    pub annotated_chapters: Vec<AnnotatedChapter>,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
}

/// A partial update to a book. Re-parsing may refresh the annotated HTML
/// form, but never the plain text (chapter offsets are computed against it).
#[derive(Debug, Clone, Default)]
pub struct BookUpdate {
    pub title: Option<String>,
    pub author: Option<String>,
    pub annotated_chapters: Option<Vec<AnnotatedChapter>>,
}

//=========================================================================================
// Audiobooks
//=========================================================================================

/// Container/codec families the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    M4a,
    M4b,
    Wav,
    Ogg,
}

impl AudioFormat {
    /// Maps a file extension (without the dot, any case) to a format.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Mp3),
            "m4a" => Some(Self::M4a),
            "m4b" => Some(Self::M4b),
            "wav" => Some(Self::Wav),
            "ogg" => Some(Self::Ogg),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::M4b => "m4b",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
        }
    }

    /// Whether the transcription provider accepts this container directly.
    /// M4B must be re-encoded before upload.
    pub fn provider_native(&self) -> bool {
        !matches!(self, Self::M4b)
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unknown audio format '{s}'"))
    }
}

/// A persisted audiobook. `duration_sec` is always > 0 once accepted.
#[derive(Debug, Clone)]
pub struct Audiobook {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: Option<String>,
    pub filename: String,
    pub duration_sec: f64,
    pub format: AudioFormat,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub created_at: DateTime<Utc>,
}

/// The fields needed to create an [`Audiobook`].
#[derive(Debug, Clone)]
pub struct NewAudiobook {
    pub owner_id: Uuid,
    pub title: Option<String>,
    pub filename: String,
    pub duration_sec: f64,
    pub format: AudioFormat,
    pub blob_path: String,
    pub content_hash: String,
    pub byte_size: u64,
}

//=========================================================================================
// Sync sessions
//=========================================================================================

/// Lifecycle state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Processing,
    Paused,
    Complete,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown sync status '{other}'")),
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The pipeline step a processing session is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Extracting,
    Segmenting,
    Transcribing,
    Matching,
    Complete,
}

impl SyncStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extracting => "extracting",
            Self::Segmenting => "segmenting",
            Self::Transcribing => "transcribing",
            Self::Matching => "matching",
            Self::Complete => "complete",
        }
    }
}

impl std::str::FromStr for SyncStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extracting" => Ok(Self::Extracting),
            "segmenting" => Ok(Self::Segmenting),
            "transcribing" => Ok(Self::Transcribing),
            "matching" => Ok(Self::Matching),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown sync step '{other}'")),
        }
    }
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a session syncs the whole book eagerly or one word window at a
/// time as the reader advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Progressive,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Progressive => "progressive",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "progressive" => Ok(Self::Progressive),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time→text assertion: at `audio_time` seconds the narrator is at
/// character `char_index` of the book's plain text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncAnchor {
    pub audio_time: f64,
    pub char_index: usize,
    pub confidence: f64,
}

/// The stateful record coupling one book to one audiobook for one owner.
#[derive(Debug, Clone)]
pub struct SyncSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub book_id: Uuid,
    pub audio_id: Uuid,
    pub status: SyncStatus,
    pub current_step: SyncStep,
    pub progress: u8,
    pub sync_mode: SyncMode,
    pub word_chunk_size: usize,
    pub synced_up_to_word: usize,
    pub total_chunks: usize,
    pub current_chunk: usize,
    pub sync_anchors: Vec<SyncAnchor>,
    pub progress_version: i64,
    pub playback_position_sec: f64,
    pub playback_progress: f64,
    pub playback_updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncSession {
    /// A freshly created session: `pending`, at the start of the pipeline,
    /// with no anchors and no playback state.
    pub fn new_pending(new: NewSession, id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: new.owner_id,
            book_id: new.book_id,
            audio_id: new.audio_id,
            status: SyncStatus::Pending,
            current_step: SyncStep::Extracting,
            progress: 0,
            sync_mode: new.sync_mode,
            word_chunk_size: new.word_chunk_size,
            synced_up_to_word: 0,
            total_chunks: 0,
            current_chunk: 0,
            sync_anchors: Vec::new(),
            progress_version: 0,
            playback_position_sec: 0.0,
            playback_progress: 0.0,
            playback_updated_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The fields needed to create a [`SyncSession`]; everything else starts at
/// its zero value with `status = pending`, `current_step = extracting`.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub owner_id: Uuid,
    pub book_id: Uuid,
    pub audio_id: Uuid,
    pub sync_mode: SyncMode,
    pub word_chunk_size: usize,
}

/// A partial update applied atomically to a session row.
///
/// `None` fields are left untouched. The store also guarantees that
/// `synced_up_to_word` and `progress_version` never move backwards and
/// stamps `updated_at` on every patch.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SyncStatus>,
    pub current_step: Option<SyncStep>,
    pub progress: Option<u8>,
    pub synced_up_to_word: Option<usize>,
    pub total_chunks: Option<usize>,
    pub current_chunk: Option<usize>,
    pub sync_anchors: Option<Vec<SyncAnchor>>,
    pub progress_version: Option<i64>,
    pub playback_position_sec: Option<f64>,
    pub playback_progress: Option<f64>,
    pub playback_updated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub clear_error: bool,
}

impl SessionPatch {
    /// Applies the patch in place. Both store backends route every write
    /// through this so the monotonicity rules hold everywhere:
    /// `synced_up_to_word` and `progress_version` never decrease, and
    /// `updated_at` is always stamped.
    pub fn apply_to(&self, session: &mut SyncSession, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(step) = self.current_step {
            session.current_step = step;
        }
        if let Some(progress) = self.progress {
            session.progress = progress.min(100);
        }
        if let Some(word) = self.synced_up_to_word {
            session.synced_up_to_word = session.synced_up_to_word.max(word);
        }
        if let Some(total) = self.total_chunks {
            session.total_chunks = total;
        }
        if let Some(current) = self.current_chunk {
            session.current_chunk = current;
        }
        if let Some(anchors) = &self.sync_anchors {
            session.sync_anchors = anchors.clone();
        }
        if let Some(version) = self.progress_version {
            session.progress_version = session.progress_version.max(version);
        }
        if let Some(position) = self.playback_position_sec {
            session.playback_position_sec = position;
        }
        if let Some(progress) = self.playback_progress {
            session.playback_progress = progress.clamp(0.0, 100.0);
        }
        if let Some(at) = self.playback_updated_at {
            session.playback_updated_at = Some(at);
        }
        if self.clear_error {
            session.error = None;
        } else if let Some(error) = &self.error {
            session.error = Some(error.clone());
        }
        session.updated_at = now;
    }
}

//=========================================================================================
// Transient pipeline values
//=========================================================================================

/// One transcription-ready piece of the source audio. Lifetime is scoped to
/// a single transcription attempt; released on success and failure alike.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub path: PathBuf,
    pub start_time: f64,
    pub duration: f64,
    pub byte_size: u64,
    /// Set when the chunk was uploaded to the blob store and the local copy
    /// removed.
    pub blob_path: Option<String>,
}

/// What `ffprobe` could learn about a source file.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioProbe {
    pub duration_sec: Option<f64>,
    pub byte_size: u64,
    pub bytes_per_sec: Option<f64>,
}

/// A timestamped piece of a provider transcription.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// A provider transcription of one audio chunk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    pub text: String,
    pub duration: Option<f64>,
    pub segments: Vec<TranscriptSegment>,
}
