//! crates/audiosync_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the sync engine's core logic.
//! These traits form the boundary of the hexagonal architecture, allowing the
//! core to be independent of specific external implementations like databases,
//! object stores, ffmpeg, or the transcription provider.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use uuid::Uuid;

use crate::domain::{
    Audiobook, AudioChunk, AudioFormat, AudioProbe, Book, BookUpdate, NewAudiobook, NewBook,
    NewSession, SessionPatch, SyncSession, Transcript,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services
/// (e.g., database, object store, subprocess, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
    #[error("Unauthorized")]
    Unauthorized,
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Session Store
//=========================================================================================

#[async_trait]
pub trait SessionStore: Send + Sync {
    // --- Books ---

    /// Creates a book, or returns the existing record when the owner already
    /// uploaded identical bytes (`content_hash` dedupe).
    async fn create_book(&self, book: NewBook) -> PortResult<Book>;

    async fn find_book_by_hash(&self, owner: Uuid, hash: &str) -> PortResult<Option<Book>>;

    async fn get_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<Book>;

    /// Applies a partial update. Re-parsing may refresh the annotated HTML
    /// but the plain text is immutable once created.
    async fn update_book(&self, owner: Uuid, book_id: Uuid, update: BookUpdate) -> PortResult<Book>;

    async fn delete_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<()>;

    async fn list_books_by_owner(&self, owner: Uuid) -> PortResult<Vec<Book>>;

    // --- Audiobooks ---

    async fn create_audiobook(&self, audio: NewAudiobook) -> PortResult<Audiobook>;

    async fn find_audiobook_by_hash(&self, owner: Uuid, hash: &str)
        -> PortResult<Option<Audiobook>>;

    async fn get_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<Audiobook>;

    async fn update_audiobook(
        &self,
        owner: Uuid,
        audio_id: Uuid,
        title: Option<String>,
    ) -> PortResult<Audiobook>;

    async fn delete_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<()>;

    async fn list_audiobooks_by_owner(&self, owner: Uuid) -> PortResult<Vec<Audiobook>>;

    // --- Sync sessions ---

    async fn create_session(&self, session: NewSession) -> PortResult<SyncSession>;

    async fn get_session(&self, owner: Uuid, session_id: Uuid) -> PortResult<SyncSession>;

    /// Atomic on the session row; always stamps `updated_at = now` and keeps
    /// `synced_up_to_word` / `progress_version` monotone non-decreasing.
    async fn update_session(
        &self,
        owner: Uuid,
        session_id: Uuid,
        patch: SessionPatch,
    ) -> PortResult<SyncSession>;

    async fn find_session_by_pair(
        &self,
        owner: Uuid,
        book_id: Uuid,
        audio_id: Uuid,
    ) -> PortResult<Option<SyncSession>>;

    async fn list_sessions_by_owner(&self, owner: Uuid) -> PortResult<Vec<SyncSession>>;

    async fn delete_session(&self, owner: Uuid, session_id: Uuid) -> PortResult<()>;

    /// Cascade used when a book is deleted.
    async fn delete_sessions_by_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<()>;

    /// Cascade used when an audiobook is deleted.
    async fn delete_sessions_by_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<()>;
}

//=========================================================================================
// Blob Store
//=========================================================================================

/// A stream of byte chunks from the blob store.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Metadata for a stored blob.
#[derive(Debug, Clone, Copy)]
pub struct BlobStat {
    pub size: u64,
}

/// Minimal get/put/stream/delete over opaque content-addressed blobs.
/// Paths are opaque to the core apart from the temp-chunk convention
/// `<private>/temp_chunks/<session_id>/chunk_<i>.<ext>`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes) -> PortResult<()>;

    async fn get(&self, path: &str) -> PortResult<ByteStream>;

    /// Byte-range read, used for streaming audio to the reader.
    /// `len = None` reads to the end of the blob.
    async fn get_range(&self, path: &str, start: u64, len: Option<u64>) -> PortResult<ByteStream>;

    async fn stat(&self, path: &str) -> PortResult<BlobStat>;

    async fn delete(&self, path: &str) -> PortResult<()>;

    /// Stages a blob to a local file so subprocess tooling can seek in it.
    async fn download_to(&self, path: &str, dest: &Path) -> PortResult<()>;
}

//=========================================================================================
// Transcription Provider
//=========================================================================================

/// Typed wrapper over the external speech-to-text call. Accepts opaque audio
/// bytes below the provider size limit and returns text with per-segment
/// start/end timestamps. No retries happen here; the orchestrator decides
/// retry policy.
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> PortResult<Transcript>;
}

//=========================================================================================
// Audio Segmenter
//=========================================================================================

/// Options for a whole-file chunking run.
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    pub format: AudioFormat,
    /// Upload each produced chunk to the blob store and delete the local copy.
    pub use_blob_store: bool,
    /// Cap the very first chunk at 120 s so a progressive session can start
    /// within seconds even for very long books.
    pub progressive_first_chunk: bool,
}

/// Splits source audio into transcription-ready pieces under the provider
/// size limit. Backed by ffmpeg in production and by fixtures in tests.
#[async_trait]
pub trait AudioSegmenter: Send + Sync {
    /// Duration / bitrate probe of a local file.
    async fn probe(&self, src: &Path) -> PortResult<AudioProbe>;

    /// Splits `src` into consecutive chunks, each at most the configured
    /// target byte size, in start-time order.
    async fn chunk_file(
        &self,
        src: &Path,
        session_tag: &str,
        opts: ChunkOptions,
    ) -> PortResult<Vec<AudioChunk>>;

    /// Extracts `[start, start + duration)` from `src` into a single chunk,
    /// re-encoding when the source format is not provider-native.
    async fn extract_time_range(
        &self,
        src: &Path,
        start: f64,
        duration: f64,
        format: AudioFormat,
        session_tag: &str,
        label: &str,
    ) -> PortResult<AudioChunk>;

    /// Releases every chunk (blob-store or local) and removes the
    /// session-scoped working directory. Idempotent.
    async fn cleanup_chunks(&self, session_tag: &str, chunks: &[AudioChunk]) -> PortResult<()>;

    /// The session-scoped scratch directory chunks are written to.
    fn work_dir(&self, session_tag: &str) -> PathBuf;
}
