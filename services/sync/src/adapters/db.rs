//! services/sync/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete
//! implementation of the `SessionStore` port from the `core` crate. It
//! handles all interactions with the SQLite database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use audiosync_core::domain::{
    Audiobook, AudioFormat, Book, BookUpdate, NewAudiobook, NewBook, NewSession, SessionPatch,
    SyncSession,
};
use audiosync_core::ports::{PortError, PortResult, SessionStore};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `SessionStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: SqlitePool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn unexpected(e: impl std::fmt::Display) -> PortError {
    PortError::Unexpected(e.to_string())
}

fn parse_uuid(raw: &str) -> PortResult<Uuid> {
    raw.parse::<Uuid>().map_err(unexpected)
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> PortResult<T> {
    serde_json::from_str(raw).map_err(unexpected)
}

fn to_json<T: serde::Serialize>(value: &T) -> PortResult<String> {
    serde_json::to_string(value).map_err(unexpected)
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct BookRecord {
    id: String,
    owner_id: String,
    title: String,
    author: Option<String>,
    original_filename: String,
    plain_text: String,
    chapters: String,
    annotated_chapters: String,
    blob_path: String,
    content_hash: String,
    byte_size: i64,
    created_at: DateTime<Utc>,
}

impl BookRecord {
    fn to_domain(self) -> PortResult<Book> {
        Ok(Book {
            id: parse_uuid(&self.id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            title: self.title,
            author: self.author,
            original_filename: self.original_filename,
            plain_text: self.plain_text,
            chapters: parse_json(&self.chapters)?,
            annotated_chapters: parse_json(&self.annotated_chapters)?,
            blob_path: self.blob_path,
            content_hash: self.content_hash,
            byte_size: self.byte_size as u64,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct AudiobookRecord {
    id: String,
    owner_id: String,
    title: Option<String>,
    filename: String,
    duration_sec: f64,
    format: String,
    blob_path: String,
    content_hash: String,
    byte_size: i64,
    created_at: DateTime<Utc>,
}

impl AudiobookRecord {
    fn to_domain(self) -> PortResult<Audiobook> {
        Ok(Audiobook {
            id: parse_uuid(&self.id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            title: self.title,
            filename: self.filename,
            duration_sec: self.duration_sec,
            format: self.format.parse::<AudioFormat>().map_err(unexpected)?,
            blob_path: self.blob_path,
            content_hash: self.content_hash,
            byte_size: self.byte_size as u64,
            created_at: self.created_at,
        })
    }
}

#[derive(FromRow)]
struct SessionRecord {
    id: String,
    owner_id: String,
    book_id: String,
    audio_id: String,
    status: String,
    current_step: String,
    progress: i64,
    sync_mode: String,
    word_chunk_size: i64,
    synced_up_to_word: i64,
    total_chunks: i64,
    current_chunk: i64,
    sync_anchors: String,
    progress_version: i64,
    playback_position_sec: f64,
    playback_progress: f64,
    playback_updated_at: Option<DateTime<Utc>>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SessionRecord {
    fn to_domain(self) -> PortResult<SyncSession> {
        Ok(SyncSession {
            id: parse_uuid(&self.id)?,
            owner_id: parse_uuid(&self.owner_id)?,
            book_id: parse_uuid(&self.book_id)?,
            audio_id: parse_uuid(&self.audio_id)?,
            status: self.status.parse().map_err(unexpected)?,
            current_step: self.current_step.parse().map_err(unexpected)?,
            progress: self.progress.clamp(0, 100) as u8,
            sync_mode: self.sync_mode.parse().map_err(unexpected)?,
            word_chunk_size: self.word_chunk_size as usize,
            synced_up_to_word: self.synced_up_to_word as usize,
            total_chunks: self.total_chunks as usize,
            current_chunk: self.current_chunk as usize,
            sync_anchors: parse_json(&self.sync_anchors)?,
            progress_version: self.progress_version,
            playback_position_sec: self.playback_position_sec,
            playback_progress: self.playback_progress,
            playback_updated_at: self.playback_updated_at,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const BOOK_COLUMNS: &str = "id, owner_id, title, author, original_filename, plain_text, \
     chapters, annotated_chapters, blob_path, content_hash, byte_size, created_at";
const AUDIO_COLUMNS: &str = "id, owner_id, title, filename, duration_sec, format, blob_path, \
     content_hash, byte_size, created_at";
const SESSION_COLUMNS: &str = "id, owner_id, book_id, audio_id, status, current_step, progress, \
     sync_mode, word_chunk_size, synced_up_to_word, total_chunks, current_chunk, sync_anchors, \
     progress_version, playback_position_sec, playback_progress, playback_updated_at, error, \
     created_at, updated_at";

impl DbAdapter {
    async fn fetch_book(&self, book_id: Uuid) -> PortResult<Book> {
        let record = sqlx::query_as::<_, BookRecord>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE id = ?"
        ))
        .bind(book_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound("Book not found".to_string()))?;
        record.to_domain()
    }

    async fn fetch_audiobook(&self, audio_id: Uuid) -> PortResult<Audiobook> {
        let record = sqlx::query_as::<_, AudiobookRecord>(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audiobooks WHERE id = ?"
        ))
        .bind(audio_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound("Audiobook not found".to_string()))?;
        record.to_domain()
    }
}

fn check_owner(record_owner: Uuid, owner: Uuid) -> PortResult<()> {
    if record_owner != owner {
        return Err(PortError::Unauthorized);
    }
    Ok(())
}

//=========================================================================================
// `SessionStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl SessionStore for DbAdapter {
    async fn create_book(&self, book: NewBook) -> PortResult<Book> {
        if let Some(existing) = self
            .find_book_by_hash(book.owner_id, &book.content_hash)
            .await?
        {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO books (id, owner_id, title, author, original_filename, plain_text, \
             chapters, annotated_chapters, blob_path, content_hash, byte_size, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(book.owner_id.to_string())
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.original_filename)
        .bind(&book.plain_text)
        .bind(to_json(&book.chapters)?)
        .bind(to_json(&book.annotated_chapters)?)
        .bind(&book.blob_path)
        .bind(&book.content_hash)
        .bind(book.byte_size as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        self.fetch_book(id).await
    }

    async fn find_book_by_hash(&self, owner: Uuid, hash: &str) -> PortResult<Option<Book>> {
        let record = sqlx::query_as::<_, BookRecord>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE owner_id = ? AND content_hash = ?"
        ))
        .bind(owner.to_string())
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(BookRecord::to_domain).transpose()
    }

    async fn get_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<Book> {
        let book = self.fetch_book(book_id).await?;
        check_owner(book.owner_id, owner)?;
        Ok(book)
    }

    async fn update_book(&self, owner: Uuid, book_id: Uuid, update: BookUpdate) -> PortResult<Book> {
        let book = self.get_book(owner, book_id).await?;
        let title = update.title.unwrap_or(book.title);
        let author = update.author.or(book.author);
        let annotated = update
            .annotated_chapters
            .unwrap_or(book.annotated_chapters);

        sqlx::query("UPDATE books SET title = ?, author = ?, annotated_chapters = ? WHERE id = ?")
            .bind(&title)
            .bind(&author)
            .bind(to_json(&annotated)?)
            .bind(book_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;

        self.fetch_book(book_id).await
    }

    async fn delete_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<()> {
        let book = self.fetch_book(book_id).await?;
        check_owner(book.owner_id, owner)?;
        sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(book_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn list_books_by_owner(&self, owner: Uuid) -> PortResult<Vec<Book>> {
        let records = sqlx::query_as::<_, BookRecord>(&format!(
            "SELECT {BOOK_COLUMNS} FROM books WHERE owner_id = ? ORDER BY created_at ASC"
        ))
        .bind(owner.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(BookRecord::to_domain).collect()
    }

    async fn create_audiobook(&self, audio: NewAudiobook) -> PortResult<Audiobook> {
        if let Some(existing) = self
            .find_audiobook_by_hash(audio.owner_id, &audio.content_hash)
            .await?
        {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO audiobooks (id, owner_id, title, filename, duration_sec, format, \
             blob_path, content_hash, byte_size, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(audio.owner_id.to_string())
        .bind(&audio.title)
        .bind(&audio.filename)
        .bind(audio.duration_sec)
        .bind(audio.format.as_str())
        .bind(&audio.blob_path)
        .bind(&audio.content_hash)
        .bind(audio.byte_size as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;

        self.fetch_audiobook(id).await
    }

    async fn find_audiobook_by_hash(
        &self,
        owner: Uuid,
        hash: &str,
    ) -> PortResult<Option<Audiobook>> {
        let record = sqlx::query_as::<_, AudiobookRecord>(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audiobooks WHERE owner_id = ? AND content_hash = ?"
        ))
        .bind(owner.to_string())
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(AudiobookRecord::to_domain).transpose()
    }

    async fn get_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<Audiobook> {
        let audio = self.fetch_audiobook(audio_id).await?;
        check_owner(audio.owner_id, owner)?;
        Ok(audio)
    }

    async fn update_audiobook(
        &self,
        owner: Uuid,
        audio_id: Uuid,
        title: Option<String>,
    ) -> PortResult<Audiobook> {
        let audio = self.get_audiobook(owner, audio_id).await?;
        let title = title.or(audio.title);
        sqlx::query("UPDATE audiobooks SET title = ? WHERE id = ?")
            .bind(&title)
            .bind(audio_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        self.fetch_audiobook(audio_id).await
    }

    async fn delete_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<()> {
        let audio = self.fetch_audiobook(audio_id).await?;
        check_owner(audio.owner_id, owner)?;
        sqlx::query("DELETE FROM audiobooks WHERE id = ?")
            .bind(audio_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn list_audiobooks_by_owner(&self, owner: Uuid) -> PortResult<Vec<Audiobook>> {
        let records = sqlx::query_as::<_, AudiobookRecord>(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audiobooks WHERE owner_id = ? ORDER BY created_at ASC"
        ))
        .bind(owner.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records
            .into_iter()
            .map(AudiobookRecord::to_domain)
            .collect()
    }

    async fn create_session(&self, session: NewSession) -> PortResult<SyncSession> {
        let record = SyncSession::new_pending(session, Uuid::new_v4(), Utc::now());
        sqlx::query(
            "INSERT INTO sync_sessions (id, owner_id, book_id, audio_id, status, current_step, \
             progress, sync_mode, word_chunk_size, synced_up_to_word, total_chunks, \
             current_chunk, sync_anchors, progress_version, playback_position_sec, \
             playback_progress, playback_updated_at, error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.owner_id.to_string())
        .bind(record.book_id.to_string())
        .bind(record.audio_id.to_string())
        .bind(record.status.as_str())
        .bind(record.current_step.as_str())
        .bind(record.progress as i64)
        .bind(record.sync_mode.as_str())
        .bind(record.word_chunk_size as i64)
        .bind(record.synced_up_to_word as i64)
        .bind(record.total_chunks as i64)
        .bind(record.current_chunk as i64)
        .bind(to_json(&record.sync_anchors)?)
        .bind(record.progress_version)
        .bind(record.playback_position_sec)
        .bind(record.playback_progress)
        .bind(record.playback_updated_at)
        .bind(&record.error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        Ok(record)
    }

    async fn get_session(&self, owner: Uuid, session_id: Uuid) -> PortResult<SyncSession> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = ?"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound("Sync session not found".to_string()))?;
        let session = record.to_domain()?;
        check_owner(session.owner_id, owner)?;
        Ok(session)
    }

    async fn update_session(
        &self,
        owner: Uuid,
        session_id: Uuid,
        patch: SessionPatch,
    ) -> PortResult<SyncSession> {
        // Read-modify-write inside one transaction so the patch is atomic on
        // the session row; SQLite serializes the writers.
        let mut tx = self.pool.begin().await.map_err(unexpected)?;

        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = ?"
        ))
        .bind(session_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unexpected)?
        .ok_or_else(|| PortError::NotFound("Sync session not found".to_string()))?;

        let mut session = record.to_domain()?;
        check_owner(session.owner_id, owner)?;
        patch.apply_to(&mut session, Utc::now());

        sqlx::query(
            "UPDATE sync_sessions SET status = ?, current_step = ?, progress = ?, \
             synced_up_to_word = ?, total_chunks = ?, current_chunk = ?, sync_anchors = ?, \
             progress_version = ?, playback_position_sec = ?, playback_progress = ?, \
             playback_updated_at = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(session.status.as_str())
        .bind(session.current_step.as_str())
        .bind(session.progress as i64)
        .bind(session.synced_up_to_word as i64)
        .bind(session.total_chunks as i64)
        .bind(session.current_chunk as i64)
        .bind(to_json(&session.sync_anchors)?)
        .bind(session.progress_version)
        .bind(session.playback_position_sec)
        .bind(session.playback_progress)
        .bind(session.playback_updated_at)
        .bind(&session.error)
        .bind(session.updated_at)
        .bind(session_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(unexpected)?;

        tx.commit().await.map_err(unexpected)?;
        Ok(session)
    }

    async fn find_session_by_pair(
        &self,
        owner: Uuid,
        book_id: Uuid,
        audio_id: Uuid,
    ) -> PortResult<Option<SyncSession>> {
        let record = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions \
             WHERE owner_id = ? AND book_id = ? AND audio_id = ?"
        ))
        .bind(owner.to_string())
        .bind(book_id.to_string())
        .bind(audio_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unexpected)?;
        record.map(SessionRecord::to_domain).transpose()
    }

    async fn list_sessions_by_owner(&self, owner: Uuid) -> PortResult<Vec<SyncSession>> {
        let records = sqlx::query_as::<_, SessionRecord>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE owner_id = ? \
             ORDER BY created_at ASC"
        ))
        .bind(owner.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(unexpected)?;
        records.into_iter().map(SessionRecord::to_domain).collect()
    }

    async fn delete_session(&self, owner: Uuid, session_id: Uuid) -> PortResult<()> {
        // Reuses the ownership check in get_session.
        self.get_session(owner, session_id).await?;
        sqlx::query("DELETE FROM sync_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn delete_sessions_by_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<()> {
        sqlx::query("DELETE FROM sync_sessions WHERE owner_id = ? AND book_id = ?")
            .bind(owner.to_string())
            .bind(book_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }

    async fn delete_sessions_by_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<()> {
        sqlx::query("DELETE FROM sync_sessions WHERE owner_id = ? AND audio_id = ?")
            .bind(owner.to_string())
            .bind(audio_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(())
    }
}
