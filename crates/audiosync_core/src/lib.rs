pub mod domain;
pub mod ports;

pub use domain::{
    AnnotatedChapter, Audiobook, AudioChunk, AudioFormat, AudioProbe, Book, BookUpdate, Chapter,
    NewAudiobook, NewBook, NewSession, ParsedBook, SessionPatch, SyncAnchor, SyncMode, SyncSession,
    SyncStatus, SyncStep, Transcript, TranscriptSegment,
};
pub use ports::{
    AudioSegmenter, BlobStat, BlobStore, ByteStream, ChunkOptions, PortError, PortResult,
    SessionStore, TranscriptionService,
};
