//! services/sync/src/orchestrator.rs
//!
//! Owns sync-session state: the status machine, the full-book pipeline, the
//! progressive chunk scheduler with its initial-alignment probe, playback
//! checkpointing, auto-advance, and cleanup.
//!
//! Each session is driven by one logically single-threaded task. Within a
//! session the pipeline steps run strictly in order; across sessions tasks
//! run in parallel and the only shared mutable state is the session row,
//! guarded by the store's atomic `update_session`. Cancellation uses a
//! per-session token observed at every suspension point; progressive
//! advance requests flow through a bounded channel so at most one chunk is
//! ever in flight per session.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use audiosync_core::domain::{
    Audiobook, AudioChunk, AudioFormat, Book, NewAudiobook, NewBook, NewSession, SessionPatch,
    SyncAnchor, SyncMode, SyncSession, SyncStatus, SyncStep, Transcript, TranscriptSegment,
};
use audiosync_core::ports::{
    AudioSegmenter, BlobStore, ChunkOptions, SessionStore, TranscriptionService,
};

use crate::aligner::FuzzyAligner;
use crate::anchors::{merge_anchors, select_anchors, AnchorCurve};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::parser;
use crate::text::WordMap;

/// Book-keeping for one running session task.
struct SessionHandle {
    cancel: CancellationToken,
    /// Progressive sessions only: the advance-request channel. Capacity 1,
    /// so a pending request doubles as the "advance in flight" flag.
    advance_tx: Option<mpsc::Sender<()>>,
}

/// Drives the Chunker → Transcription → Aligner pipeline and owns every
/// sync session's lifecycle.
pub struct SyncOrchestrator {
    store: Arc<dyn SessionStore>,
    blobs: Arc<dyn BlobStore>,
    stt: Arc<dyn TranscriptionService>,
    segmenter: Arc<dyn AudioSegmenter>,
    config: SyncConfig,
    /// Root for per-session staging directories (`stage_<id>`).
    stage_root: PathBuf,
    tasks: Mutex<HashMap<Uuid, SessionHandle>>,
    /// Handle back to the owning `Arc`, used to hand session tasks an owned
    /// reference.
    self_ref: Weak<Self>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        blobs: Arc<dyn BlobStore>,
        stt: Arc<dyn TranscriptionService>,
        segmenter: Arc<dyn AudioSegmenter>,
        config: SyncConfig,
        stage_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            store,
            blobs,
            stt,
            segmenter,
            config,
            stage_root,
            tasks: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    //=====================================================================================
    // Ingestion
    //=====================================================================================

    /// Parses and publishes a book. Re-uploading identical bytes returns the
    /// existing record without touching the blob store again.
    pub async fn upload_book(&self, owner: Uuid, filename: &str, bytes: Vec<u8>) -> SyncResult<Book> {
        let hash = parser::content_hash(&bytes);
        if let Some(existing) = self.store.find_book_by_hash(owner, &hash).await? {
            info!(book_id = %existing.id, "duplicate book upload, returning existing record");
            return Ok(existing);
        }

        let byte_size = bytes.len() as u64;
        let parse_input = bytes.clone();
        let parsed = tokio::task::spawn_blocking(move || parser::parse_epub(&parse_input))
            .await
            .map_err(|e| SyncError::InvariantViolated(format!("parser task failed: {e}")))??;

        let blob_path = format!("books/{owner}/{hash}.epub");
        self.blobs.put(&blob_path, Bytes::from(bytes)).await?;

        let book = self
            .store
            .create_book(NewBook {
                owner_id: owner,
                title: parsed.title,
                author: parsed.author,
                original_filename: filename.to_string(),
                plain_text: parsed.plain_text,
                chapters: parsed.chapters,
                annotated_chapters: parsed.annotated_chapters,
                blob_path,
                content_hash: hash,
                byte_size,
            })
            .await?;
        info!(book_id = %book.id, title = %book.title, "book published");
        Ok(book)
    }

    /// Publishes an audiobook. Duration comes from a probe of the uploaded
    /// bytes, falling back to the caller's hint when probing fails.
    pub async fn upload_audiobook(
        &self,
        owner: Uuid,
        filename: &str,
        bytes: Vec<u8>,
        duration_hint: Option<f64>,
    ) -> SyncResult<Audiobook> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let format = AudioFormat::from_extension(ext)
            .ok_or_else(|| SyncError::UnsupportedFormat(filename.to_string()))?;

        let hash = parser::content_hash(&bytes);
        if let Some(existing) = self.store.find_audiobook_by_hash(owner, &hash).await? {
            info!(audio_id = %existing.id, "duplicate audio upload, returning existing record");
            return Ok(existing);
        }
        let byte_size = bytes.len() as u64;

        // Stage locally so ffprobe can inspect the container.
        let staged = self.stage_root.join("uploads").join(format!("{hash}.{ext}"));
        if let Some(parent) = staged.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&staged, &bytes).await?;
        let probed = self.segmenter.probe(&staged).await.ok();
        tokio::fs::remove_file(&staged).await.ok();

        let duration_sec = probed
            .and_then(|p| p.duration_sec)
            .or(duration_hint)
            .filter(|d| *d > 0.0)
            .ok_or_else(|| {
                SyncError::UnsupportedFormat(format!("cannot determine duration of {filename}"))
            })?;

        let blob_path = format!("audio/{owner}/{hash}.{ext}");
        self.blobs.put(&blob_path, Bytes::from(bytes)).await?;

        let audio = self
            .store
            .create_audiobook(NewAudiobook {
                owner_id: owner,
                title: None,
                filename: filename.to_string(),
                duration_sec,
                format,
                blob_path,
                content_hash: hash,
                byte_size,
            })
            .await?;
        info!(audio_id = %audio.id, duration_sec, "audiobook published");
        Ok(audio)
    }

    /// Deletes a book, its blob, and every session referencing it.
    pub async fn delete_book(&self, owner: Uuid, book_id: Uuid) -> SyncResult<()> {
        let book = self.store.get_book(owner, book_id).await?;
        self.cancel_sessions_matching(owner, |s| s.book_id == book_id)
            .await?;
        self.store.delete_sessions_by_book(owner, book_id).await?;
        self.blobs.delete(&book.blob_path).await.ok();
        self.store.delete_book(owner, book_id).await?;
        Ok(())
    }

    /// Deletes an audiobook, its blob, and every session referencing it.
    pub async fn delete_audiobook(&self, owner: Uuid, audio_id: Uuid) -> SyncResult<()> {
        let audio = self.store.get_audiobook(owner, audio_id).await?;
        self.cancel_sessions_matching(owner, |s| s.audio_id == audio_id)
            .await?;
        self.store
            .delete_sessions_by_audiobook(owner, audio_id)
            .await?;
        self.blobs.delete(&audio.blob_path).await.ok();
        self.store.delete_audiobook(owner, audio_id).await?;
        Ok(())
    }

    async fn cancel_sessions_matching(
        &self,
        owner: Uuid,
        matches: impl Fn(&SyncSession) -> bool,
    ) -> SyncResult<()> {
        let sessions = self.store.list_sessions_by_owner(owner).await?;
        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        for session in sessions.iter().filter(|s| matches(s)) {
            if let Some(handle) = tasks.remove(&session.id) {
                handle.cancel.cancel();
            }
        }
        Ok(())
    }

    //=====================================================================================
    // Session lifecycle
    //=====================================================================================

    /// Creates a sync session for a `(book, audiobook)` pair, or returns the
    /// live session that already couples them for this owner.
    pub async fn create_session(
        &self,
        owner: Uuid,
        book_id: Uuid,
        audio_id: Uuid,
        mode: SyncMode,
        word_chunk_size: Option<usize>,
    ) -> SyncResult<SyncSession> {
        self.store.get_book(owner, book_id).await?;
        self.store.get_audiobook(owner, audio_id).await?;

        if let Some(existing) = self
            .store
            .find_session_by_pair(owner, book_id, audio_id)
            .await?
        {
            return Ok(existing);
        }

        let session = self
            .store
            .create_session(NewSession {
                owner_id: owner,
                book_id,
                audio_id,
                sync_mode: mode,
                word_chunk_size: word_chunk_size.unwrap_or(self.config.progressive_chunk_words),
            })
            .await?;
        info!(session_id = %session.id, mode = %mode, "sync session created");
        Ok(session)
    }

    /// `pending → processing`: spawns the session task for its mode.
    pub async fn start_sync(&self, owner: Uuid, session_id: Uuid) -> SyncResult<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        match session.status {
            SyncStatus::Pending => {}
            SyncStatus::Processing => return Ok(session),
            other => {
                return Err(SyncError::InvariantViolated(format!(
                    "cannot start a session in status '{other}'"
                )))
            }
        }

        let session = self
            .store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SyncStatus::Processing),
                    ..SessionPatch::default()
                },
            )
            .await?;
        self.spawn_session(owner, &session);
        Ok(session)
    }

    /// Progressive only: stops scheduling further chunks. The chunk in
    /// flight (if any) completes normally. Pausing a paused session is a
    /// no-op returning the current session.
    pub async fn pause(&self, owner: Uuid, session_id: Uuid) -> SyncResult<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.sync_mode != SyncMode::Progressive {
            return Err(SyncError::InvariantViolated(
                "pause is only valid for progressive sessions".to_string(),
            ));
        }
        match session.status {
            SyncStatus::Paused => Ok(session),
            SyncStatus::Processing => Ok(self
                .store
                .update_session(
                    owner,
                    session_id,
                    SessionPatch {
                        status: Some(SyncStatus::Paused),
                        ..SessionPatch::default()
                    },
                )
                .await?),
            other => Err(SyncError::InvariantViolated(format!(
                "cannot pause a session in status '{other}'"
            ))),
        }
    }

    /// `paused → processing`; schedules exactly one chunk from the
    /// persisted frontier.
    pub async fn resume(&self, owner: Uuid, session_id: Uuid) -> SyncResult<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.status != SyncStatus::Paused {
            return Err(SyncError::InvariantViolated(format!(
                "cannot resume a session in status '{}'",
                session.status
            )));
        }
        let updated = self
            .store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SyncStatus::Processing),
                    ..SessionPatch::default()
                },
            )
            .await?;
        self.ensure_worker(owner, &updated);
        self.request_advance(session_id);
        Ok(updated)
    }

    /// `error → pending → processing`: clears the failure state and
    /// restarts the pipeline. Committed anchors and the synced frontier are
    /// left untouched.
    pub async fn retry(&self, owner: Uuid, session_id: Uuid) -> SyncResult<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.status != SyncStatus::Error {
            return Err(SyncError::InvariantViolated(format!(
                "retry requires an errored session, not '{}'",
                session.status
            )));
        }
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    status: Some(SyncStatus::Pending),
                    current_step: Some(SyncStep::Extracting),
                    progress: Some(0),
                    current_chunk: Some(0),
                    clear_error: true,
                    ..SessionPatch::default()
                },
            )
            .await?;
        self.start_sync(owner, session_id).await
    }

    /// Cancels any in-flight work for the session and removes the row.
    /// In-flight operations observe cancellation at their next suspension
    /// point and release temporary files on the way out.
    pub async fn delete_session(&self, owner: Uuid, session_id: Uuid) -> SyncResult<()> {
        self.store.get_session(owner, session_id).await?;
        if let Some(handle) = self
            .tasks
            .lock()
            .expect("task registry poisoned")
            .remove(&session_id)
        {
            handle.cancel.cancel();
        }
        self.store.delete_session(owner, session_id).await?;
        info!(%session_id, "sync session deleted");
        Ok(())
    }

    /// Interpolated text position for an audio time.
    pub async fn position_at(&self, owner: Uuid, session_id: Uuid, t: f64) -> SyncResult<usize> {
        let session = self.store.get_session(owner, session_id).await?;
        Ok(AnchorCurve::new(session.sync_anchors).position_for(t))
    }

    //=====================================================================================
    // Playback checkpointing and auto-advance
    //=====================================================================================

    /// Records a playback position report.
    ///
    /// Out-of-range positions are ignored. A report carrying a
    /// `progress_version` newer than the stored one always writes; a
    /// version-less report inside the debounce window of the previous write
    /// is skipped. For progressive sessions the report also drives
    /// auto-advance: when the reader is within the advance threshold of the
    /// synced frontier, the next chunk is scheduled.
    pub async fn report_playback(
        &self,
        owner: Uuid,
        session_id: Uuid,
        position_sec: f64,
        duration: Option<f64>,
        progress_version: Option<i64>,
    ) -> SyncResult<SyncSession> {
        let session = self.store.get_session(owner, session_id).await?;
        let audio = self.store.get_audiobook(owner, session.audio_id).await?;
        let duration = duration.unwrap_or(audio.duration_sec);

        if !(0.0..=duration).contains(&position_sec) {
            warn!(
                %session_id,
                position_sec, duration, "ignoring out-of-range playback report"
            );
            return Ok(session);
        }

        // Versioned reports always land (the store keeps the version
        // monotone); only version-less ones are debounced.
        let now = Utc::now();
        if progress_version.is_none() {
            if let Some(last) = session.playback_updated_at {
                let elapsed_ms = now.signed_duration_since(last).num_milliseconds();
                if elapsed_ms >= 0 && (elapsed_ms as u64) < self.config.progress_debounce_ms {
                    return Ok(session);
                }
            }
        }

        let playback_progress = if duration > 0.0 {
            100.0 * position_sec / duration
        } else {
            0.0
        };
        let updated = self
            .store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    playback_position_sec: Some(position_sec),
                    playback_progress: Some(playback_progress),
                    playback_updated_at: Some(now),
                    progress_version,
                    ..SessionPatch::default()
                },
            )
            .await?;

        if updated.sync_mode == SyncMode::Progressive && updated.status == SyncStatus::Processing {
            let book = self.store.get_book(owner, updated.book_id).await?;
            let current_char =
                AnchorCurve::new(updated.sync_anchors.clone()).position_for(position_sec);
            let current_word = WordMap::new(&book.plain_text).word_for_char(current_char);
            if current_word + self.config.advance_threshold_words >= updated.synced_up_to_word {
                self.request_advance(session_id);
            }
        }
        Ok(updated)
    }

    /// Queues an advance request for a progressive session. At most one
    /// request is ever pending; extras are dropped until the worker drains
    /// the channel, which only happens when the frontier work runs.
    pub fn request_advance(&self, session_id: Uuid) {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        if let Some(tx) = tasks.get(&session_id).and_then(|h| h.advance_tx.as_ref()) {
            // Full just means an advance is already queued.
            let _ = tx.try_send(());
        }
    }

    //=====================================================================================
    // Session tasks
    //=====================================================================================

    fn spawn_session(&self, owner: Uuid, session: &SyncSession) {
        let Some(this) = self.self_ref.upgrade() else {
            // The orchestrator is being dropped; nothing to run the task.
            return;
        };
        let cancel = CancellationToken::new();
        let session_id = session.id;
        match session.sync_mode {
            SyncMode::Full => {
                self.register(session_id, cancel.clone(), None);
                tokio::spawn(async move {
                    this.run_full(owner, session_id, cancel).await;
                });
            }
            SyncMode::Progressive => {
                let (tx, rx) = mpsc::channel(1);
                self.register(session_id, cancel.clone(), Some(tx));
                tokio::spawn(async move {
                    this.run_progressive(owner, session_id, cancel, rx).await;
                });
            }
        }
    }

    fn register(&self, session_id: Uuid, cancel: CancellationToken, advance_tx: Option<mpsc::Sender<()>>) {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .insert(session_id, SessionHandle { cancel, advance_tx });
    }

    fn unregister(&self, session_id: Uuid) {
        self.tasks
            .lock()
            .expect("task registry poisoned")
            .remove(&session_id);
    }

    /// Respawns the progressive worker when it is gone (after an error or a
    /// process restart). No-op while a live worker still holds the channel.
    fn ensure_worker(&self, owner: Uuid, session: &SyncSession) {
        let alive = {
            let tasks = self.tasks.lock().expect("task registry poisoned");
            tasks
                .get(&session.id)
                .and_then(|h| h.advance_tx.as_ref())
                .map(|tx| !tx.is_closed())
                .unwrap_or(false)
        };
        if !alive {
            self.spawn_session(owner, session);
        }
    }

    async fn finish(&self, owner: Uuid, session_id: Uuid, result: SyncResult<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                info!(%session_id, "sync cancelled");
            }
            Err(e) => {
                error!(%session_id, error = %e, "sync failed");
                let patch = SessionPatch {
                    status: Some(SyncStatus::Error),
                    error: Some(e.to_string()),
                    ..SessionPatch::default()
                };
                if let Err(persist_err) = self.store.update_session(owner, session_id, patch).await
                {
                    error!(%session_id, error = %persist_err, "failed to persist session error");
                }
            }
        }
    }

    fn ensure_not_cancelled(&self, cancel: &CancellationToken) -> SyncResult<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    async fn checkpoint(
        &self,
        owner: Uuid,
        session_id: Uuid,
        step: SyncStep,
        progress: u8,
    ) -> SyncResult<()> {
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    current_step: Some(step),
                    progress: Some(progress),
                    ..SessionPatch::default()
                },
            )
            .await?;
        Ok(())
    }

    fn session_stage_dir(&self, session_id: Uuid) -> PathBuf {
        self.stage_root.join(format!("stage_{session_id}"))
    }

    /// Downloads the audiobook to the session's staging directory so the
    /// segmenter can seek in it.
    async fn stage_audio(
        &self,
        audio: &Audiobook,
        stage_dir: &Path,
        cancel: &CancellationToken,
    ) -> SyncResult<PathBuf> {
        self.ensure_not_cancelled(cancel)?;
        tokio::fs::create_dir_all(stage_dir).await?;
        let name = Path::new(&audio.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("audio.{}", audio.format));
        let local = stage_dir.join(name);
        if tokio::fs::metadata(&local).await.is_err() {
            self.blobs.download_to(&audio.blob_path, &local).await?;
        }
        Ok(local)
    }

    async fn read_chunk_bytes(&self, chunk: &AudioChunk) -> SyncResult<Vec<u8>> {
        match &chunk.blob_path {
            Some(blob_path) => {
                let mut stream = self.blobs.get(blob_path).await?;
                let mut out = Vec::with_capacity(chunk.byte_size as usize);
                while let Some(piece) = stream.next().await {
                    out.extend_from_slice(&piece?);
                }
                Ok(out)
            }
            None => Ok(tokio::fs::read(&chunk.path).await?),
        }
    }

    /// Sends one chunk to the provider, optionally retrying once. Enforces
    /// the provider byte limit; exceeding it here is a programming error in
    /// the chunker, not a recoverable condition.
    async fn transcribe_chunk(
        &self,
        chunk: &AudioChunk,
        cancel: &CancellationToken,
        retry_once: bool,
    ) -> SyncResult<Transcript> {
        let bytes = self.read_chunk_bytes(chunk).await?;
        if bytes.len() as u64 > self.config.provider_max_bytes {
            return Err(SyncError::InvariantViolated(format!(
                "chunk {} is {} bytes, above the provider limit {}",
                chunk.path.display(),
                bytes.len(),
                self.config.provider_max_bytes
            )));
        }
        let filename = chunk
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chunk.mp3".to_string());

        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            result = self.stt.transcribe(bytes.clone(), &filename) => result,
        };
        match first {
            Ok(transcript) => Ok(transcript),
            Err(e) if retry_once => {
                warn!(chunk = %chunk.path.display(), error = %e, "transcription failed, retrying once");
                tokio::select! {
                    _ = cancel.cancelled() => Err(SyncError::Cancelled),
                    result = self.stt.transcribe(bytes, &filename) => {
                        result.map_err(|e| SyncError::TranscriptionFailed(e.to_string()))
                    }
                }
            }
            Err(e) => Err(SyncError::TranscriptionFailed(e.to_string())),
        }
    }

    //=====================================================================================
    // Full-book pipeline
    //=====================================================================================

    async fn run_full(self: Arc<Self>, owner: Uuid, session_id: Uuid, cancel: CancellationToken) {
        let stage_dir = self.session_stage_dir(session_id);
        let mut chunks: Vec<AudioChunk> = Vec::new();
        let result = self
            .full_pipeline(owner, session_id, &cancel, &stage_dir, &mut chunks)
            .await;

        // Temporary files go away on success, failure, and cancellation alike.
        let tag = session_id.to_string();
        if let Err(e) = self.segmenter.cleanup_chunks(&tag, &chunks).await {
            warn!(%session_id, error = %e, "chunk cleanup failed");
        }
        tokio::fs::remove_dir_all(&stage_dir).await.ok();

        self.unregister(session_id);
        self.finish(owner, session_id, result).await;
    }

    async fn full_pipeline(
        &self,
        owner: Uuid,
        session_id: Uuid,
        cancel: &CancellationToken,
        stage_dir: &Path,
        chunks_out: &mut Vec<AudioChunk>,
    ) -> SyncResult<()> {
        let tag = session_id.to_string();

        self.checkpoint(owner, session_id, SyncStep::Extracting, 10).await?;
        let session = self.store.get_session(owner, session_id).await?;
        let book = self.store.get_book(owner, session.book_id).await?;
        let audio = self.store.get_audiobook(owner, session.audio_id).await?;

        self.checkpoint(owner, session_id, SyncStep::Segmenting, 20).await?;
        let local_audio = self.stage_audio(&audio, stage_dir, cancel).await?;

        self.checkpoint(owner, session_id, SyncStep::Transcribing, 30).await?;
        self.ensure_not_cancelled(cancel)?;
        let chunks = self
            .segmenter
            .chunk_file(
                &local_audio,
                &tag,
                ChunkOptions {
                    format: audio.format,
                    use_blob_store: false,
                    progressive_first_chunk: false,
                },
            )
            .await?;
        chunks_out.extend(chunks.iter().cloned());
        let total = chunks.len().max(1);
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    total_chunks: Some(chunks.len()),
                    current_chunk: Some(0),
                    ..SessionPatch::default()
                },
            )
            .await?;
        info!(%session_id, chunks = chunks.len(), "transcribing audio");

        // Sequential on purpose: provider rate limits dominate, concurrency
        // buys nothing here.
        let mut all_segments: Vec<TranscriptSegment> = Vec::new();
        for (index, chunk) in chunks.iter().enumerate() {
            self.ensure_not_cancelled(cancel)?;
            let transcript = self.transcribe_chunk(chunk, cancel, true).await?;
            if transcript.segments.is_empty() {
                return Err(SyncError::TranscriptionFailed(format!(
                    "provider returned no segments for chunk {}/{}",
                    index + 1,
                    chunks.len()
                )));
            }
            all_segments.extend(transcript.segments.into_iter().map(|s| TranscriptSegment {
                start: s.start + chunk.start_time,
                end: s.end + chunk.start_time,
                text: s.text,
            }));
            let progress = 35 + (35 * (index + 1) / total) as u8;
            self.store
                .update_session(
                    owner,
                    session_id,
                    SessionPatch {
                        current_chunk: Some(index + 1),
                        progress: Some(progress),
                        ..SessionPatch::default()
                    },
                )
                .await?;
        }

        self.checkpoint(owner, session_id, SyncStep::Matching, 75).await?;
        let raw = {
            let config = self.config.clone();
            let plain_text = book.plain_text.clone();
            tokio::task::spawn_blocking(move || {
                FuzzyAligner::new(&config).align(&plain_text, &all_segments)
            })
            .await
            .map_err(|e| SyncError::InvariantViolated(format!("aligner task failed: {e}")))?
        };
        if raw.is_empty() {
            warn!(%session_id, "aligner found no anchors above the floor; emitting synthetic endpoints only");
        }
        let final_anchors =
            select_anchors(&raw, audio.duration_sec, book.plain_text.len(), &self.config);

        self.ensure_not_cancelled(cancel)?;
        let total_words = WordMap::new(&book.plain_text).word_count();
        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    sync_anchors: Some(final_anchors),
                    synced_up_to_word: Some(total_words),
                    status: Some(SyncStatus::Complete),
                    current_step: Some(SyncStep::Complete),
                    progress: Some(100),
                    ..SessionPatch::default()
                },
            )
            .await?;
        info!(%session_id, "full sync complete");
        Ok(())
    }

    //=====================================================================================
    // Progressive pipeline
    //=====================================================================================

    async fn run_progressive(
        self: Arc<Self>,
        owner: Uuid,
        session_id: Uuid,
        cancel: CancellationToken,
        mut advance_rx: mpsc::Receiver<()>,
    ) {
        let stage_dir = self.session_stage_dir(session_id);
        let result = self
            .progressive_loop(owner, session_id, &cancel, &stage_dir, &mut advance_rx)
            .await;

        let tag = session_id.to_string();
        if let Err(e) = self.segmenter.cleanup_chunks(&tag, &[]).await {
            warn!(%session_id, error = %e, "chunk cleanup failed");
        }
        tokio::fs::remove_dir_all(&stage_dir).await.ok();

        self.unregister(session_id);
        self.finish(owner, session_id, result).await;
    }

    async fn progressive_loop(
        &self,
        owner: Uuid,
        session_id: Uuid,
        cancel: &CancellationToken,
        stage_dir: &Path,
        advance_rx: &mut mpsc::Receiver<()>,
    ) -> SyncResult<()> {
        let session = self.store.get_session(owner, session_id).await?;
        let book = self.store.get_book(owner, session.book_id).await?;
        let audio = self.store.get_audiobook(owner, session.audio_id).await?;
        let word_map = WordMap::new(&book.plain_text);
        let total_words = word_map.word_count();

        if total_words == 0 {
            // A cover-only book has nothing to align; the session still
            // succeeds with zero anchors.
            self.store
                .update_session(
                    owner,
                    session_id,
                    SessionPatch {
                        status: Some(SyncStatus::Complete),
                        current_step: Some(SyncStep::Complete),
                        progress: Some(100),
                        ..SessionPatch::default()
                    },
                )
                .await?;
            return Ok(());
        }

        self.checkpoint(owner, session_id, SyncStep::Extracting, 10).await?;
        let local_audio = self.stage_audio(&audio, stage_dir, cancel).await?;

        // A fresh session runs the probe and the latency-sized first chunk;
        // a respawned worker (resume/retry) continues from the frontier.
        if session.sync_anchors.is_empty() && session.synced_up_to_word == 0 {
            self.checkpoint(owner, session_id, SyncStep::Segmenting, 15).await?;
            let seed = self
                .initial_alignment_probe(&book, &audio, &local_audio, &session_id.to_string(), cancel)
                .await?;
            let start_word = word_map.word_for_char(seed.char_index);
            self.store
                .update_session(
                    owner,
                    session_id,
                    SessionPatch {
                        sync_anchors: Some(vec![seed]),
                        synced_up_to_word: Some(start_word),
                        current_step: Some(SyncStep::Transcribing),
                        progress: Some(20),
                        ..SessionPatch::default()
                    },
                )
                .await?;

            self.sync_word_chunk(
                owner,
                session_id,
                &book,
                &audio,
                &local_audio,
                &word_map,
                start_word,
                self.config.progressive_first_chunk_words,
                Some(seed.audio_time),
                cancel,
            )
            .await?;
        }

        loop {
            let session = self.store.get_session(owner, session_id).await?;
            if session.status == SyncStatus::Complete {
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                request = advance_rx.recv() => {
                    if request.is_none() {
                        // The handle was dropped; the session is going away.
                        return Ok(());
                    }
                    // Collapse any pile-up of reports into one chunk.
                    while advance_rx.try_recv().is_ok() {}

                    let session = self.store.get_session(owner, session_id).await?;
                    if session.status != SyncStatus::Processing {
                        continue;
                    }
                    let frontier = session.synced_up_to_word;
                    let known_start = if session.sync_anchors.is_empty() {
                        None
                    } else {
                        Some(
                            AnchorCurve::new(session.sync_anchors.clone())
                                .time_for(word_map.char_for_word(frontier)),
                        )
                    };
                    self.sync_word_chunk(
                        owner,
                        session_id,
                        &book,
                        &audio,
                        &local_audio,
                        &word_map,
                        frontier,
                        session.word_chunk_size,
                        known_start,
                        cancel,
                    )
                    .await?;
                }
            }
        }
    }

    /// Transcribes the first seconds of audio and matches each segment
    /// independently against the book's opening words, absorbing narrator
    /// intros and publisher front matter that have no counterpart in the
    /// text. Falls back to an explicit `(0, 0)` anchor when nothing clears
    /// the confidence floor.
    async fn initial_alignment_probe(
        &self,
        book: &Book,
        audio: &Audiobook,
        local_audio: &Path,
        tag: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncAnchor> {
        let word_map = WordMap::new(&book.plain_text);
        let (_, prefix_end) =
            word_map.char_range(0, self.config.initial_alignment_search_words);
        let prefix = &book.plain_text[..prefix_end];

        self.ensure_not_cancelled(cancel)?;
        let probe_sec = self
            .config
            .initial_alignment_probe_sec
            .min(audio.duration_sec);
        let chunk = self
            .segmenter
            .extract_time_range(local_audio, 0.0, probe_sec, audio.format, tag, "probe")
            .await?;

        let outcome = async {
            let transcript = self.transcribe_chunk(&chunk, cancel, false).await?;
            let aligner = FuzzyAligner::new(&self.config);
            Ok::<_, SyncError>(
                aligner
                    .align(prefix, &transcript.segments)
                    .into_iter()
                    .max_by(|a, b| a.confidence.total_cmp(&b.confidence)),
            )
        }
        .await;
        tokio::fs::remove_file(&chunk.path).await.ok();

        match outcome? {
            Some(best) => {
                info!(
                    audio_time = best.audio_time,
                    char_index = best.char_index,
                    confidence = best.confidence,
                    "initial alignment probe matched"
                );
                Ok(best)
            }
            None => {
                warn!("initial alignment probe found no acceptable match, anchoring at the start");
                Ok(SyncAnchor {
                    audio_time: 0.0,
                    char_index: 0,
                    confidence: 0.0,
                })
            }
        }
    }

    /// Aligns one window of book words against its (estimated) audio range.
    /// Returns `false` without mutation when the session is paused or the
    /// requested range is empty.
    #[allow(clippy::too_many_arguments)]
    async fn sync_word_chunk(
        &self,
        owner: Uuid,
        session_id: Uuid,
        book: &Book,
        audio: &Audiobook,
        local_audio: &Path,
        word_map: &WordMap,
        word_start: usize,
        word_count: usize,
        known_audio_start: Option<f64>,
        cancel: &CancellationToken,
    ) -> SyncResult<bool> {
        let session = self.store.get_session(owner, session_id).await?;
        if session.status == SyncStatus::Paused {
            return Ok(false);
        }
        let total_words = word_map.word_count();
        if word_start >= total_words || word_count == 0 {
            return Ok(false);
        }
        let word_end = (word_start + word_count).min(total_words);

        // The text slice gets an overlap on each side so the aligner has
        // context at chunk boundaries.
        let overlap = self.config.progressive_overlap_words;
        let slice_start_word = word_start.saturating_sub(overlap);
        let slice_end_word = (word_end + overlap).min(total_words);
        let (slice_start, slice_end) = word_map.char_range(slice_start_word, slice_end_word);
        let slice = &book.plain_text[slice_start..slice_end];

        // Audio range from the known start, or the narration-rate estimator.
        let rate_wps = self.config.narration_rate_wpm as f64 / 60.0;
        let start_time = known_audio_start
            .unwrap_or(word_start as f64 / rate_wps)
            .clamp(0.0, audio.duration_sec);
        let duration = ((word_count as f64) / rate_wps).min(audio.duration_sec - start_time);
        if duration <= 0.0 {
            return Ok(false);
        }

        self.ensure_not_cancelled(cancel)?;
        let tag = session_id.to_string();
        let label = format!("wchunk_{word_start}");
        let chunk = self
            .segmenter
            .extract_time_range(local_audio, start_time, duration, audio.format, &tag, &label)
            .await?;

        let outcome = self
            .commit_word_chunk(
                owner, session_id, slice, slice_start, word_end, total_words, &chunk, cancel,
            )
            .await;
        // The chunk is scoped to this attempt; release it on every path.
        tokio::fs::remove_file(&chunk.path).await.ok();
        outcome?;
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_word_chunk(
        &self,
        owner: Uuid,
        session_id: Uuid,
        slice: &str,
        slice_start: usize,
        word_end: usize,
        total_words: usize,
        chunk: &AudioChunk,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let transcript = self.transcribe_chunk(chunk, cancel, false).await?;

        // Chunk-relative timestamps become absolute before matching.
        let shifted: Vec<TranscriptSegment> = transcript
            .segments
            .into_iter()
            .map(|s| TranscriptSegment {
                start: s.start + chunk.start_time,
                end: s.end + chunk.start_time,
                text: s.text,
            })
            .collect();

        let aligner = FuzzyAligner::new(&self.config);
        let fresh: Vec<SyncAnchor> = aligner
            .align(slice, &shifted)
            .into_iter()
            .map(|a| SyncAnchor {
                char_index: a.char_index + slice_start,
                ..a
            })
            .collect();

        self.ensure_not_cancelled(cancel)?;
        let session = self.store.get_session(owner, session_id).await?;
        let merged = merge_anchors(&session.sync_anchors, &fresh, &self.config);

        let frontier = session.synced_up_to_word.max(word_end);
        let complete = frontier >= total_words;
        let progress = if complete {
            100
        } else {
            (100 * frontier / total_words) as u8
        };

        self.store
            .update_session(
                owner,
                session_id,
                SessionPatch {
                    sync_anchors: Some(merged),
                    synced_up_to_word: Some(frontier),
                    progress: Some(progress),
                    status: complete.then_some(SyncStatus::Complete),
                    current_step: Some(if complete {
                        SyncStep::Complete
                    } else {
                        SyncStep::Matching
                    }),
                    ..SessionPatch::default()
                },
            )
            .await?;
        info!(
            %session_id,
            frontier,
            anchors = fresh.len(),
            complete,
            "word chunk committed"
        );
        Ok(())
    }
}
