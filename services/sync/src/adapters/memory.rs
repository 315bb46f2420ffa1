//! services/sync/src/adapters/memory.rs
//!
//! In-memory implementation of the `SessionStore` port. Behaviourally
//! identical to the SQL adapter (ownership checks, hash dedupe, patch
//! monotonicity) so tests can swap it in without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use audiosync_core::domain::{
    Audiobook, Book, BookUpdate, NewAudiobook, NewBook, NewSession, SessionPatch, SyncSession,
};
use audiosync_core::ports::{PortError, PortResult, SessionStore};

#[derive(Default)]
struct State {
    books: HashMap<Uuid, Book>,
    audiobooks: HashMap<Uuid, Audiobook>,
    sessions: HashMap<Uuid, SyncSession>,
}

/// A `SessionStore` held entirely in process memory.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn owned<'a, T>(record: Option<&'a T>, owner: Uuid, owner_of: impl Fn(&T) -> Uuid, what: &str)
    -> PortResult<&'a T>
{
    match record {
        None => Err(PortError::NotFound(format!("{what} not found"))),
        Some(record) if owner_of(record) != owner => Err(PortError::Unauthorized),
        Some(record) => Ok(record),
    }
}

#[async_trait]
impl SessionStore for InMemoryStore {
    async fn create_book(&self, book: NewBook) -> PortResult<Book> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .books
            .values()
            .find(|b| b.owner_id == book.owner_id && b.content_hash == book.content_hash)
        {
            return Ok(existing.clone());
        }
        let record = Book {
            id: Uuid::new_v4(),
            owner_id: book.owner_id,
            title: book.title,
            author: book.author,
            original_filename: book.original_filename,
            plain_text: book.plain_text,
            chapters: book.chapters,
            annotated_chapters: book.annotated_chapters,
            blob_path: book.blob_path,
            content_hash: book.content_hash,
            byte_size: book.byte_size,
            created_at: Utc::now(),
        };
        state.books.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_book_by_hash(&self, owner: Uuid, hash: &str) -> PortResult<Option<Book>> {
        let state = self.state.read().await;
        Ok(state
            .books
            .values()
            .find(|b| b.owner_id == owner && b.content_hash == hash)
            .cloned())
    }

    async fn get_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<Book> {
        let state = self.state.read().await;
        owned(state.books.get(&book_id), owner, |b| b.owner_id, "Book").cloned()
    }

    async fn update_book(&self, owner: Uuid, book_id: Uuid, update: BookUpdate) -> PortResult<Book> {
        let mut state = self.state.write().await;
        owned(state.books.get(&book_id), owner, |b| b.owner_id, "Book")?;
        let book = state.books.get_mut(&book_id).expect("checked above");
        if let Some(title) = update.title {
            book.title = title;
        }
        if let Some(author) = update.author {
            book.author = Some(author);
        }
        if let Some(chapters) = update.annotated_chapters {
            book.annotated_chapters = chapters;
        }
        Ok(book.clone())
    }

    async fn delete_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<()> {
        let mut state = self.state.write().await;
        owned(state.books.get(&book_id), owner, |b| b.owner_id, "Book")?;
        state.books.remove(&book_id);
        Ok(())
    }

    async fn list_books_by_owner(&self, owner: Uuid) -> PortResult<Vec<Book>> {
        let state = self.state.read().await;
        let mut books: Vec<Book> = state
            .books
            .values()
            .filter(|b| b.owner_id == owner)
            .cloned()
            .collect();
        books.sort_by_key(|b| b.created_at);
        Ok(books)
    }

    async fn create_audiobook(&self, audio: NewAudiobook) -> PortResult<Audiobook> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .audiobooks
            .values()
            .find(|a| a.owner_id == audio.owner_id && a.content_hash == audio.content_hash)
        {
            return Ok(existing.clone());
        }
        let record = Audiobook {
            id: Uuid::new_v4(),
            owner_id: audio.owner_id,
            title: audio.title,
            filename: audio.filename,
            duration_sec: audio.duration_sec,
            format: audio.format,
            blob_path: audio.blob_path,
            content_hash: audio.content_hash,
            byte_size: audio.byte_size,
            created_at: Utc::now(),
        };
        state.audiobooks.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find_audiobook_by_hash(
        &self,
        owner: Uuid,
        hash: &str,
    ) -> PortResult<Option<Audiobook>> {
        let state = self.state.read().await;
        Ok(state
            .audiobooks
            .values()
            .find(|a| a.owner_id == owner && a.content_hash == hash)
            .cloned())
    }

    async fn get_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<Audiobook> {
        let state = self.state.read().await;
        owned(
            state.audiobooks.get(&audio_id),
            owner,
            |a| a.owner_id,
            "Audiobook",
        )
        .cloned()
    }

    async fn update_audiobook(
        &self,
        owner: Uuid,
        audio_id: Uuid,
        title: Option<String>,
    ) -> PortResult<Audiobook> {
        let mut state = self.state.write().await;
        owned(
            state.audiobooks.get(&audio_id),
            owner,
            |a| a.owner_id,
            "Audiobook",
        )?;
        let audio = state.audiobooks.get_mut(&audio_id).expect("checked above");
        if let Some(title) = title {
            audio.title = Some(title);
        }
        Ok(audio.clone())
    }

    async fn delete_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<()> {
        let mut state = self.state.write().await;
        owned(
            state.audiobooks.get(&audio_id),
            owner,
            |a| a.owner_id,
            "Audiobook",
        )?;
        state.audiobooks.remove(&audio_id);
        Ok(())
    }

    async fn list_audiobooks_by_owner(&self, owner: Uuid) -> PortResult<Vec<Audiobook>> {
        let state = self.state.read().await;
        let mut audiobooks: Vec<Audiobook> = state
            .audiobooks
            .values()
            .filter(|a| a.owner_id == owner)
            .cloned()
            .collect();
        audiobooks.sort_by_key(|a| a.created_at);
        Ok(audiobooks)
    }

    async fn create_session(&self, session: NewSession) -> PortResult<SyncSession> {
        let mut state = self.state.write().await;
        let record = SyncSession::new_pending(session, Uuid::new_v4(), Utc::now());
        state.sessions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_session(&self, owner: Uuid, session_id: Uuid) -> PortResult<SyncSession> {
        let state = self.state.read().await;
        owned(
            state.sessions.get(&session_id),
            owner,
            |s| s.owner_id,
            "Sync session",
        )
        .cloned()
    }

    async fn update_session(
        &self,
        owner: Uuid,
        session_id: Uuid,
        patch: SessionPatch,
    ) -> PortResult<SyncSession> {
        let mut state = self.state.write().await;
        owned(
            state.sessions.get(&session_id),
            owner,
            |s| s.owner_id,
            "Sync session",
        )?;
        let session = state.sessions.get_mut(&session_id).expect("checked above");
        patch.apply_to(session, Utc::now());
        Ok(session.clone())
    }

    async fn find_session_by_pair(
        &self,
        owner: Uuid,
        book_id: Uuid,
        audio_id: Uuid,
    ) -> PortResult<Option<SyncSession>> {
        let state = self.state.read().await;
        Ok(state
            .sessions
            .values()
            .find(|s| s.owner_id == owner && s.book_id == book_id && s.audio_id == audio_id)
            .cloned())
    }

    async fn list_sessions_by_owner(&self, owner: Uuid) -> PortResult<Vec<SyncSession>> {
        let state = self.state.read().await;
        let mut sessions: Vec<SyncSession> = state
            .sessions
            .values()
            .filter(|s| s.owner_id == owner)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete_session(&self, owner: Uuid, session_id: Uuid) -> PortResult<()> {
        let mut state = self.state.write().await;
        owned(
            state.sessions.get(&session_id),
            owner,
            |s| s.owner_id,
            "Sync session",
        )?;
        state.sessions.remove(&session_id);
        Ok(())
    }

    async fn delete_sessions_by_book(&self, owner: Uuid, book_id: Uuid) -> PortResult<()> {
        let mut state = self.state.write().await;
        state
            .sessions
            .retain(|_, s| !(s.owner_id == owner && s.book_id == book_id));
        Ok(())
    }

    async fn delete_sessions_by_audiobook(&self, owner: Uuid, audio_id: Uuid) -> PortResult<()> {
        let mut state = self.state.write().await;
        state
            .sessions
            .retain(|_, s| !(s.owner_id == owner && s.audio_id == audio_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiosync_core::domain::{AudioFormat, SyncMode};

    fn new_book(owner: Uuid, hash: &str) -> NewBook {
        NewBook {
            owner_id: owner,
            title: "Book".to_string(),
            author: None,
            original_filename: "book.epub".to_string(),
            plain_text: "one two three".to_string(),
            chapters: Vec::new(),
            annotated_chapters: Vec::new(),
            blob_path: "books/x".to_string(),
            content_hash: hash.to_string(),
            byte_size: 3,
        }
    }

    fn new_audio(owner: Uuid, hash: &str) -> NewAudiobook {
        NewAudiobook {
            owner_id: owner,
            title: None,
            filename: "book.mp3".to_string(),
            duration_sec: 3600.0,
            format: AudioFormat::Mp3,
            blob_path: "audio/x".to_string(),
            content_hash: hash.to_string(),
            byte_size: 100,
        }
    }

    #[tokio::test]
    async fn duplicate_book_upload_returns_existing_record() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let first = store.create_book(new_book(owner, "h1")).await.unwrap();
        let second = store.create_book(new_book(owner, "h1")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_books_by_owner(owner).await.unwrap().len(), 1);

        // A different owner with the same hash gets their own record.
        let other = store
            .create_book(new_book(Uuid::new_v4(), "h1"))
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn ownership_is_enforced() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let book = store.create_book(new_book(owner, "h1")).await.unwrap();

        match store.get_book(Uuid::new_v4(), book.id).await {
            Err(PortError::Unauthorized) => {}
            other => panic!("expected Unauthorized, got {other:?}"),
        }
        match store.get_book(owner, Uuid::new_v4()).await {
            Err(PortError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_patches_are_monotone() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let session = store
            .create_session(NewSession {
                owner_id: owner,
                book_id: Uuid::new_v4(),
                audio_id: Uuid::new_v4(),
                sync_mode: SyncMode::Progressive,
                word_chunk_size: 1000,
            })
            .await
            .unwrap();

        let updated = store
            .update_session(
                owner,
                session.id,
                SessionPatch {
                    synced_up_to_word: Some(2000),
                    progress_version: Some(5),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.synced_up_to_word, 2000);
        assert_eq!(updated.progress_version, 5);

        // Regressions are ignored, other fields still apply.
        let regressed = store
            .update_session(
                owner,
                session.id,
                SessionPatch {
                    synced_up_to_word: Some(1500),
                    progress_version: Some(3),
                    playback_position_sec: Some(12.5),
                    ..SessionPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(regressed.synced_up_to_word, 2000);
        assert_eq!(regressed.progress_version, 5);
        assert!((regressed.playback_position_sec - 12.5).abs() < f64::EPSILON);
        assert!(regressed.updated_at >= updated.updated_at);
    }

    #[tokio::test]
    async fn cascades_remove_sessions() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let book = store.create_book(new_book(owner, "h1")).await.unwrap();
        let audio = store.create_audiobook(new_audio(owner, "h2")).await.unwrap();
        let session = store
            .create_session(NewSession {
                owner_id: owner,
                book_id: book.id,
                audio_id: audio.id,
                sync_mode: SyncMode::Full,
                word_chunk_size: 1000,
            })
            .await
            .unwrap();

        assert!(store
            .find_session_by_pair(owner, book.id, audio.id)
            .await
            .unwrap()
            .is_some());

        store.delete_sessions_by_book(owner, book.id).await.unwrap();
        assert!(matches!(
            store.get_session(owner, session.id).await,
            Err(PortError::NotFound(_))
        ));
    }
}
