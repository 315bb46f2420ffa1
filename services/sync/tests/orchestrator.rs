//! End-to-end pipeline tests over swapped-in backends: in-memory store,
//! filesystem blob store in a tempdir, a scripted transcription provider,
//! and a fake segmenter that fabricates chunk files instead of running
//! ffmpeg.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use audiosync_core::domain::{
    AudioChunk, AudioFormat, AudioProbe, SyncMode, SyncSession, SyncStatus, Transcript,
    TranscriptSegment,
};
use audiosync_core::ports::{
    AudioSegmenter, ChunkOptions, PortError, PortResult, TranscriptionService,
};
use sync_service::adapters::{FsBlobStore, InMemoryStore};
use sync_service::config::SyncConfig;
use sync_service::orchestrator::SyncOrchestrator;
use sync_service::text::WordMap;

//=========================================================================================
// Fakes
//=========================================================================================

/// Returns canned transcripts in order; errors once the script runs out.
struct ScriptedStt {
    responses: Mutex<VecDeque<PortResult<Transcript>>>,
}

impl ScriptedStt {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(VecDeque::new()),
        })
    }

    fn push(&self, transcript: Transcript) {
        self.responses.lock().unwrap().push_back(Ok(transcript));
    }

    fn push_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(PortError::Unexpected(message.to_string())));
    }
}

#[async_trait]
impl TranscriptionService for ScriptedStt {
    async fn transcribe(&self, _audio: Vec<u8>, _filename: &str) -> PortResult<Transcript> {
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PortError::Unexpected("transcript script exhausted".into())))
    }
}

/// Fabricates chunk files without touching ffmpeg.
struct FakeSegmenter {
    root: PathBuf,
    duration_sec: f64,
    /// `(start, duration)` plan returned by `chunk_file`.
    chunk_plan: Vec<(f64, f64)>,
}

impl FakeSegmenter {
    fn new(root: PathBuf, duration_sec: f64, chunk_plan: Vec<(f64, f64)>) -> Arc<Self> {
        Arc::new(Self {
            root,
            duration_sec,
            chunk_plan,
        })
    }

    async fn write_chunk(&self, tag: &str, name: &str) -> PathBuf {
        let dir = self.work_dir(tag);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, b"fake-audio").await.unwrap();
        path
    }
}

#[async_trait]
impl AudioSegmenter for FakeSegmenter {
    async fn probe(&self, _src: &Path) -> PortResult<AudioProbe> {
        Ok(AudioProbe {
            duration_sec: Some(self.duration_sec),
            byte_size: 1000,
            bytes_per_sec: Some(16_000.0),
        })
    }

    async fn chunk_file(
        &self,
        _src: &Path,
        session_tag: &str,
        _opts: ChunkOptions,
    ) -> PortResult<Vec<AudioChunk>> {
        let mut chunks = Vec::new();
        for (index, (start, duration)) in self.chunk_plan.iter().enumerate() {
            let path = self
                .write_chunk(session_tag, &format!("chunk_{index}.mp3"))
                .await;
            chunks.push(AudioChunk {
                path,
                start_time: *start,
                duration: *duration,
                byte_size: 10,
                blob_path: None,
            });
        }
        Ok(chunks)
    }

    async fn extract_time_range(
        &self,
        _src: &Path,
        start: f64,
        duration: f64,
        _format: AudioFormat,
        session_tag: &str,
        label: &str,
    ) -> PortResult<AudioChunk> {
        let path = self
            .write_chunk(session_tag, &format!("{label}.mp3"))
            .await;
        Ok(AudioChunk {
            path,
            start_time: start,
            duration,
            byte_size: 10,
            blob_path: None,
        })
    }

    async fn cleanup_chunks(&self, session_tag: &str, chunks: &[AudioChunk]) -> PortResult<()> {
        for chunk in chunks {
            tokio::fs::remove_file(&chunk.path).await.ok();
        }
        tokio::fs::remove_dir_all(self.work_dir(session_tag))
            .await
            .ok();
        Ok(())
    }

    fn work_dir(&self, session_tag: &str) -> PathBuf {
        self.root.join(format!("chunks_{session_tag}"))
    }
}

//=========================================================================================
// Fixture helpers
//=========================================================================================

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<InMemoryStore>,
    stt: Arc<ScriptedStt>,
    segmenter: Arc<FakeSegmenter>,
    orchestrator: Arc<SyncOrchestrator>,
    owner: Uuid,
}

fn fixture(duration_sec: f64, chunk_plan: Vec<(f64, f64)>) -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let blobs = Arc::new(FsBlobStore::new(dir.path().join("blobs")));
    let stt = ScriptedStt::new();
    let segmenter = FakeSegmenter::new(dir.path().join("work"), duration_sec, chunk_plan);
    let orchestrator = SyncOrchestrator::new(
        store.clone(),
        blobs,
        stt.clone(),
        segmenter.clone(),
        SyncConfig::default(),
        dir.path().join("stage"),
    );
    Fixture {
        _dir: dir,
        store,
        stt,
        segmenter,
        orchestrator,
        owner: Uuid::new_v4(),
    }
}

/// A minimal EPUB with the given paragraphs as one chapter.
fn epub_with_paragraphs(paragraphs: &[String]) -> Vec<u8> {
    let opf = r#"<package>
  <metadata><dc:title>Fixture Book</dc:title></metadata>
  <manifest><item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/></manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#;
    let mut body = String::from("<html><body><h1>Chapter One</h1>\n");
    for p in paragraphs {
        body.push_str(&format!("<p>{p}</p>\n"));
    }
    body.push_str("</body></html>");

    let cursor = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(cursor);
    let options = zip::write::SimpleFileOptions::default();
    writer.start_file("content.opf", options).unwrap();
    writer.write_all(opf.as_bytes()).unwrap();
    writer.start_file("ch1.xhtml", options).unwrap();
    writer.write_all(body.as_bytes()).unwrap();
    writer.finish().unwrap().into_inner()
}

/// `word_count` generated words split into 50-word paragraphs.
fn generated_epub(word_count: usize) -> Vec<u8> {
    let paragraphs: Vec<String> = (0..word_count)
        .map(|i| format!("word{i:05}"))
        .collect::<Vec<_>>()
        .chunks(50)
        .map(|chunk| chunk.join(" "))
        .collect();
    epub_with_paragraphs(&paragraphs)
}

/// Builds transcript segments covering `[word_start, word_end)` of the
/// plain text in `frag_words`-sized pieces, with chunk-relative timestamps
/// derived from `sec_per_word`.
fn segments_for(
    plain: &str,
    map: &WordMap,
    word_start: usize,
    word_end: usize,
    frag_words: usize,
    step_words: usize,
    sec_per_word: f64,
) -> Vec<TranscriptSegment> {
    let mut segments = Vec::new();
    let mut w = word_start;
    while w < word_end {
        let end = (w + frag_words).min(word_end);
        let (char_start, char_end) = map.char_range(w, end);
        let rel = (w - word_start) as f64 * sec_per_word;
        segments.push(TranscriptSegment {
            start: rel,
            end: rel + frag_words as f64 * sec_per_word,
            text: plain[char_start..char_end].to_string(),
        });
        w += step_words;
    }
    segments
}

fn transcript(segments: Vec<TranscriptSegment>) -> Transcript {
    let duration = segments.last().map(|s| s.end);
    Transcript {
        text: segments.iter().map(|s| s.text.as_str()).collect::<Vec<_>>().join(" "),
        duration,
        segments,
    }
}

/// Polls the session until the predicate holds or the timeout trips.
async fn wait_for(
    fx: &Fixture,
    session_id: Uuid,
    what: &str,
    predicate: impl Fn(&SyncSession) -> bool,
) -> SyncSession {
    use audiosync_core::ports::SessionStore;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let session = fx
            .store
            .get_session(fx.owner, session_id)
            .await
            .unwrap_or_else(|e| panic!("session lookup failed while waiting for {what}: {e}"));
        if predicate(&session) {
            return session;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "timed out waiting for {what}; status={} progress={} frontier={} error={:?}",
                session.status, session.progress, session.synced_up_to_word, session.error
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

//=========================================================================================
// Scenarios
//=========================================================================================

#[tokio::test]
async fn happy_full_sync_produces_a_complete_curve() {
    // 12,000 words narrated over 3600 s in six 600 s chunks.
    let fx = fixture(3600.0, (0..6).map(|i| (i as f64 * 600.0, 600.0)).collect());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(12_000))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![0u8; 2000], None)
        .await
        .unwrap();
    assert!((audio.duration_sec - 3600.0).abs() < f64::EPSILON);

    let map = WordMap::new(&book.plain_text);
    // Chapter heading adds a couple of words; keep the word→time mapping on
    // the generated words only for simplicity.
    for chunk_index in 0..6 {
        let w0 = chunk_index * 2000;
        fx.stt.push(transcript(segments_for(
            &book.plain_text,
            &map,
            w0,
            w0 + 2000,
            8,
            200,
            0.3,
        )));
    }

    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Full, None)
        .await
        .unwrap();
    fx.orchestrator
        .start_sync(fx.owner, session.id)
        .await
        .unwrap();

    let done = wait_for(&fx, session.id, "full sync completion", |s| {
        s.status == SyncStatus::Complete
    })
    .await;

    assert_eq!(done.progress, 100);
    assert!(done.sync_anchors.len() >= 2);
    let first = done.sync_anchors.first().unwrap();
    let last = done.sync_anchors.last().unwrap();
    assert!((0.0..=60.0).contains(&first.audio_time));
    assert!((3540.0..=3600.0).contains(&last.audio_time));
    // The curve is time-ordered with no collapsible pairs.
    for pair in done.sync_anchors.windows(2) {
        assert!(pair[0].audio_time <= pair[1].audio_time);
        assert!(
            (pair[1].audio_time - pair[0].audio_time).abs() >= 1.0
                || pair[1].char_index.abs_diff(pair[0].char_index) >= 10
        );
    }
    // Temporary artifacts are gone.
    assert!(!fx.segmenter.work_dir(&session.id.to_string()).exists());
}

#[tokio::test]
async fn progressive_probe_absorbs_a_publisher_intro() {
    let fx = fixture(3600.0, Vec::new());
    let text: Vec<String> = vec![
        "Chapter One. The old library stood at the end of the lane, silent and patient."
            .to_string(),
        (0..2000)
            .map(|i| format!("word{i:05}"))
            .collect::<Vec<_>>()
            .join(" "),
    ];
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", epub_with_paragraphs(&text))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![1u8; 500], None)
        .await
        .unwrap();

    // Probe transcript: 32 s of publisher narration absent from the book,
    // then the real opening.
    fx.stt.push(transcript(vec![
        TranscriptSegment {
            start: 0.0,
            end: 30.0,
            text: "this recording is presented by example audio productions all rights reserved"
                .to_string(),
        },
        TranscriptSegment {
            start: 32.0,
            end: 40.0,
            text: "chapter one the old library stood at the end of the lane".to_string(),
        },
    ]));
    // First word chunk (75 words from the probe anchor).
    let map = WordMap::new(&book.plain_text);
    fx.stt.push(transcript(segments_for(
        &book.plain_text,
        &map,
        0,
        75,
        8,
        8,
        0.4,
    )));

    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Progressive, None)
        .await
        .unwrap();
    fx.orchestrator
        .start_sync(fx.owner, session.id)
        .await
        .unwrap();

    let synced = wait_for(&fx, session.id, "first progressive chunk", |s| {
        s.synced_up_to_word >= 75
    })
    .await;

    // The probe anchor skipped the intro: audio time in the 30–45 s range,
    // text position within the first 200 characters.
    let probe_anchor = synced
        .sync_anchors
        .iter()
        .find(|a| (30.0..=45.0).contains(&a.audio_time) && a.char_index < 200)
        .unwrap_or_else(|| panic!("no intro-absorbing anchor in {:?}", synced.sync_anchors));
    assert!(probe_anchor.confidence > 0.5);
}

#[tokio::test]
async fn pause_refuses_advances_and_resume_schedules_one_chunk() {
    let fx = fixture(3600.0, Vec::new());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(300))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![2u8; 500], None)
        .await
        .unwrap();

    let map = WordMap::new(&book.plain_text);
    let total = map.word_count();
    // Probe match at the very start.
    fx.stt.push(transcript(segments_for(
        &book.plain_text,
        &map,
        0,
        20,
        10,
        10,
        0.4,
    )));
    // First chunk: words 0..75.
    fx.stt.push(transcript(segments_for(
        &book.plain_text,
        &map,
        0,
        75,
        8,
        8,
        0.4,
    )));
    // Resume chunk: words 75..175.
    fx.stt.push(transcript(segments_for(
        &book.plain_text,
        &map,
        75,
        175.min(total),
        8,
        8,
        0.4,
    )));

    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Progressive, Some(100))
        .await
        .unwrap();
    fx.orchestrator
        .start_sync(fx.owner, session.id)
        .await
        .unwrap();
    wait_for(&fx, session.id, "first progressive chunk", |s| {
        s.synced_up_to_word >= 75
    })
    .await;

    let paused = fx.orchestrator.pause(fx.owner, session.id).await.unwrap();
    assert_eq!(paused.status, SyncStatus::Paused);
    // Pausing again is a no-op returning the current session.
    let paused_again = fx.orchestrator.pause(fx.owner, session.id).await.unwrap();
    assert_eq!(paused_again.status, SyncStatus::Paused);

    // Advance requests while paused are refused: the frontier stays put.
    fx.orchestrator.request_advance(session.id);
    tokio::time::sleep(Duration::from_millis(300)).await;
    let still = wait_for(&fx, session.id, "paused frontier", |_| true).await;
    assert_eq!(still.synced_up_to_word, 75);
    assert_eq!(still.status, SyncStatus::Paused);

    // Resume schedules exactly one chunk from the persisted frontier.
    let resumed = fx.orchestrator.resume(fx.owner, session.id).await.unwrap();
    assert_eq!(resumed.status, SyncStatus::Processing);
    let advanced = wait_for(&fx, session.id, "post-resume chunk", |s| {
        s.synced_up_to_word >= 175.min(total)
    })
    .await;
    assert_eq!(advanced.synced_up_to_word, 175.min(total));
}

#[tokio::test]
async fn duplicate_book_upload_reuses_the_record() {
    let fx = fixture(3600.0, Vec::new());
    let bytes = generated_epub(200);
    let first = fx
        .orchestrator
        .upload_book(fx.owner, "a.epub", bytes.clone())
        .await
        .unwrap();
    let second = fx
        .orchestrator
        .upload_book(fx.owner, "b.epub", bytes)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    use audiosync_core::ports::SessionStore;
    assert_eq!(
        fx.store.list_books_by_owner(fx.owner).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn empty_segments_fail_the_session_and_retry_restarts() {
    let fx = fixture(1800.0, (0..3).map(|i| (i as f64 * 600.0, 600.0)).collect());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(3000))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![3u8; 500], None)
        .await
        .unwrap();

    let map = WordMap::new(&book.plain_text);
    // Chunks 1 and 2 transcribe fine, chunk 3 comes back empty.
    for chunk_index in 0..2 {
        let w0 = chunk_index * 1000;
        fx.stt.push(transcript(segments_for(
            &book.plain_text,
            &map,
            w0,
            w0 + 1000,
            8,
            150,
            0.6,
        )));
    }
    fx.stt.push(Transcript::default());

    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Full, None)
        .await
        .unwrap();
    fx.orchestrator
        .start_sync(fx.owner, session.id)
        .await
        .unwrap();

    let failed = wait_for(&fx, session.id, "session failure", |s| {
        s.status == SyncStatus::Error
    })
    .await;
    let message = failed.error.clone().unwrap_or_default();
    assert!(message.contains("no segments"), "unexpected error: {message}");

    // Retry restarts from scratch and succeeds with a full script.
    for chunk_index in 0..3 {
        let w0 = chunk_index * 1000;
        fx.stt.push(transcript(segments_for(
            &book.plain_text,
            &map,
            w0,
            w0 + 1000,
            8,
            150,
            0.6,
        )));
    }
    fx.orchestrator.retry(fx.owner, session.id).await.unwrap();
    let done = wait_for(&fx, session.id, "retried completion", |s| {
        s.status == SyncStatus::Complete
    })
    .await;
    assert_eq!(done.progress, 100);
    assert!(done.error.is_none());
}

#[tokio::test]
async fn playback_reports_checkpoint_and_respect_versioning() {
    let fx = fixture(3600.0, Vec::new());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(200))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![4u8; 500], None)
        .await
        .unwrap();
    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Full, None)
        .await
        .unwrap();

    let updated = fx
        .orchestrator
        .report_playback(fx.owner, session.id, 900.0, None, Some(3))
        .await
        .unwrap();
    assert!((updated.playback_position_sec - 900.0).abs() < f64::EPSILON);
    assert!((updated.playback_progress - 25.0).abs() < 1e-9);
    assert_eq!(updated.progress_version, 3);

    // A stale version still moves the position but never the version.
    let stale = fx
        .orchestrator
        .report_playback(fx.owner, session.id, 1000.0, None, Some(1))
        .await
        .unwrap();
    assert_eq!(stale.progress_version, 3);
    assert!((stale.playback_position_sec - 1000.0).abs() < f64::EPSILON);

    // Out-of-range positions are ignored outright.
    let ignored = fx
        .orchestrator
        .report_playback(fx.owner, session.id, 9999.0, None, Some(9))
        .await
        .unwrap();
    assert!((ignored.playback_position_sec - 1000.0).abs() < f64::EPSILON);
    assert_eq!(ignored.progress_version, 3);

    // A version-less report inside the debounce window is skipped.
    let debounced = fx
        .orchestrator
        .report_playback(fx.owner, session.id, 1010.0, None, None)
        .await
        .unwrap();
    assert!((debounced.playback_position_sec - 1000.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn sessions_deduplicate_by_pair_and_enforce_ownership() {
    let fx = fixture(3600.0, Vec::new());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(200))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![5u8; 500], None)
        .await
        .unwrap();

    let first = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Progressive, None)
        .await
        .unwrap();
    let second = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Progressive, None)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    // A stranger cannot touch the pair at all.
    let stranger = Uuid::new_v4();
    let denied = fx
        .orchestrator
        .create_session(stranger, book.id, audio.id, SyncMode::Full, None)
        .await;
    assert!(matches!(
        denied,
        Err(sync_service::error::SyncError::Unauthorized)
    ));
    assert!(matches!(
        fx.orchestrator.pause(stranger, first.id).await,
        Err(sync_service::error::SyncError::Unauthorized)
    ));
}

#[tokio::test]
async fn deleting_a_book_cascades_to_sessions() {
    let fx = fixture(3600.0, Vec::new());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(200))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![6u8; 500], None)
        .await
        .unwrap();
    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Progressive, None)
        .await
        .unwrap();

    fx.orchestrator.delete_book(fx.owner, book.id).await.unwrap();

    use audiosync_core::ports::SessionStore;
    assert!(matches!(
        fx.store.get_session(fx.owner, session.id).await,
        Err(PortError::NotFound(_))
    ));
    assert!(matches!(
        fx.store.get_book(fx.owner, book.id).await,
        Err(PortError::NotFound(_))
    ));
}

#[tokio::test]
async fn advance_requests_after_completion_are_ignored() {
    let fx = fixture(3600.0, Vec::new());
    let book = fx
        .orchestrator
        .upload_book(fx.owner, "book.epub", generated_epub(60))
        .await
        .unwrap();
    let audio = fx
        .orchestrator
        .upload_audiobook(fx.owner, "book.mp3", vec![7u8; 500], None)
        .await
        .unwrap();

    let map = WordMap::new(&book.plain_text);
    let total = map.word_count();
    fx.stt.push(transcript(segments_for(
        &book.plain_text,
        &map,
        0,
        20,
        10,
        10,
        0.4,
    )));
    // The 75-word first chunk covers the whole 60-word book.
    fx.stt.push(transcript(segments_for(
        &book.plain_text,
        &map,
        0,
        total,
        8,
        8,
        0.4,
    )));

    let session = fx
        .orchestrator
        .create_session(fx.owner, book.id, audio.id, SyncMode::Progressive, None)
        .await
        .unwrap();
    fx.orchestrator
        .start_sync(fx.owner, session.id)
        .await
        .unwrap();

    let done = wait_for(&fx, session.id, "tiny book completion", |s| {
        s.status == SyncStatus::Complete
    })
    .await;
    assert_eq!(done.synced_up_to_word, total);
    assert_eq!(done.progress, 100);

    // The worker has gone away; further advances change nothing.
    fx.orchestrator.request_advance(session.id);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = wait_for(&fx, session.id, "post-completion state", |_| true).await;
    assert_eq!(after.status, SyncStatus::Complete);
    assert_eq!(after.synced_up_to_word, total);
}
