//! services/sync/src/chunker.rs
//!
//! Splits source audio into transcription-ready pieces, each guaranteed to
//! stay below the provider size limit. Uses `ffprobe` to size segments and
//! `ffmpeg` to extract them, re-encoding containers the provider cannot
//! accept natively (M4B → MP3 128 kbit/s) and codec-copying everything else.
//!
//! Working files live in a per-session directory (`chunks_<session>`), so
//! concurrent sessions never collide. `cleanup_chunks` is idempotent and
//! releases blob-store copies as well as local files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, info, warn};

use audiosync_core::domain::{AudioChunk, AudioFormat, AudioProbe};
use audiosync_core::ports::{AudioSegmenter, BlobStore, ChunkOptions, PortError, PortResult};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// Cap on the very first chunk of a progressive session.
const FIRST_CHUNK_CAP_SEC: f64 = 120.0;
/// Segment length used when the source duration is unknown.
const FALLBACK_SEGMENT_SEC: f64 = 300.0;
/// Safety cap on the unknown-duration extraction loop.
const MAX_FALLBACK_SEGMENTS: usize = 500;
/// An extracted segment below this size means end of stream.
const MIN_SEGMENT_BYTES: u64 = 1024;
/// Deadline for codec-copy extraction.
const COPY_TIMEOUT_SEC: f64 = 120.0;

/// ffmpeg-backed implementation of the [`AudioSegmenter`] port.
pub struct FfmpegChunker {
    work_root: PathBuf,
    config: SyncConfig,
    blobs: Option<Arc<dyn BlobStore>>,
}

impl FfmpegChunker {
    pub fn new(work_root: PathBuf, config: SyncConfig, blobs: Option<Arc<dyn BlobStore>>) -> Self {
        Self {
            work_root,
            config,
            blobs,
        }
    }

    /// Blob-store location for a temporary chunk.
    fn blob_chunk_path(session_tag: &str, name: &str) -> String {
        format!("private/temp_chunks/{session_tag}/{name}")
    }

    async fn probe_inner(&self, src: &Path) -> SyncResult<AudioProbe> {
        let byte_size = tokio::fs::metadata(src).await?.len();

        let output = Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "format=duration,bit_rate", "-of", "json"])
            .arg(src)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SyncError::Io(std::io::Error::other(format!(
                "ffprobe failed for {}: {}",
                src.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| SyncError::Io(std::io::Error::other(format!("ffprobe output: {e}"))))?;
        let format = &parsed["format"];
        let duration_sec = format["duration"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|d| *d > 0.0);
        let bit_rate = format["bit_rate"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|b| *b > 0.0);

        let bytes_per_sec = bit_rate
            .map(|b| b / 8.0)
            .or_else(|| duration_sec.map(|d| byte_size as f64 / d));

        Ok(AudioProbe {
            duration_sec,
            byte_size,
            bytes_per_sec,
        })
    }

    /// Runs one ffmpeg extraction under its deadline.
    async fn extract_segment(
        &self,
        src: &Path,
        start: f64,
        duration: f64,
        out: &Path,
        reencode: bool,
    ) -> SyncResult<u64> {
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"])
            .arg("-ss")
            .arg(format!("{start:.3}"))
            .arg("-t")
            .arg(format!("{duration:.3}"))
            .arg("-i")
            .arg(src);
        if reencode {
            // Strip cover art / subtitle / data tracks; books ship with all
            // three. Channel layout is preserved.
            cmd.args(["-vn", "-sn", "-dn", "-map", "0:a:0"])
                .args(["-codec:a", "libmp3lame", "-b:a", "128k"]);
        } else {
            cmd.args(["-vn", "-codec:a", "copy"]);
        }
        cmd.arg(out);
        cmd.kill_on_drop(true);

        let deadline = if reencode {
            (2.0 * duration).max(60.0)
        } else {
            COPY_TIMEOUT_SEC
        };
        let output = tokio::time::timeout(Duration::from_secs_f64(deadline), cmd.output())
            .await
            .map_err(|_| {
                SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("ffmpeg exceeded {deadline:.0}s extracting {}", out.display()),
                ))
            })??;

        if !output.status.success() {
            return Err(SyncError::Io(std::io::Error::other(format!(
                "ffmpeg failed extracting {}: {}",
                out.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ))));
        }

        Ok(tokio::fs::metadata(out).await?.len())
    }

    fn verify_chunk_size(&self, bytes: u64) -> SyncResult<()> {
        if bytes > self.config.chunk_target_bytes {
            return Err(SyncError::ChunkTooLarge {
                bytes,
                limit: self.config.chunk_target_bytes,
            });
        }
        Ok(())
    }

    /// Uploads a freshly extracted chunk and removes the local copy.
    async fn maybe_upload(
        &self,
        session_tag: &str,
        chunk: &mut AudioChunk,
        use_blob_store: bool,
    ) -> SyncResult<()> {
        let Some(blobs) = self.blobs.as_ref().filter(|_| use_blob_store) else {
            return Ok(());
        };
        let name = chunk
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chunk".to_string());
        let blob_path = Self::blob_chunk_path(session_tag, &name);
        let bytes = tokio::fs::read(&chunk.path).await?;
        blobs
            .put(&blob_path, Bytes::from(bytes))
            .await
            .map_err(SyncError::Port)?;
        tokio::fs::remove_file(&chunk.path).await.ok();
        chunk.blob_path = Some(blob_path);
        Ok(())
    }

    async fn chunk_file_inner(
        &self,
        src: &Path,
        session_tag: &str,
        opts: ChunkOptions,
    ) -> SyncResult<Vec<AudioChunk>> {
        let byte_size = tokio::fs::metadata(src).await?.len();

        // Already acceptable to the provider as-is (the segmentation target
        // below is deliberately smaller): describe the original, no copy and
        // no probe. Timestamp shifting only needs `start_time`, which is 0
        // for the whole file, so the duration can stay unknown.
        if byte_size <= self.config.provider_max_bytes {
            return Ok(vec![AudioChunk {
                path: src.to_path_buf(),
                start_time: 0.0,
                duration: 0.0,
                byte_size,
                blob_path: None,
            }]);
        }

        let work = self.work_dir(session_tag);
        tokio::fs::create_dir_all(&work).await?;

        let reencode = !opts.format.provider_native();
        let ext = if reencode { "mp3" } else { opts.format.as_str() };

        let probe = self.probe_inner(src).await.unwrap_or(AudioProbe {
            byte_size,
            ..AudioProbe::default()
        });

        let mut chunks: Vec<AudioChunk> = Vec::new();
        match probe.duration_sec {
            Some(total) => {
                let bytes_per_sec = probe
                    .bytes_per_sec
                    .unwrap_or(byte_size as f64 / total);
                let first_cap =
                    (opts.progressive_first_chunk && reencode).then_some(FIRST_CHUNK_CAP_SEC);
                let plan = plan_segments(
                    total,
                    bytes_per_sec,
                    self.config.chunk_target_bytes,
                    self.config.chunk_duration_min_sec,
                    self.config.chunk_duration_max_sec,
                    first_cap,
                );
                info!(
                    total_sec = total,
                    segments = plan.len(),
                    reencode,
                    "chunking audio"
                );
                for (index, (start, duration)) in plan.into_iter().enumerate() {
                    let out = work.join(format!("chunk_{index}.{ext}"));
                    let size = self
                        .extract_segment(src, start, duration, &out, reencode)
                        .await?;
                    self.verify_chunk_size(size)?;
                    let mut chunk = AudioChunk {
                        path: out,
                        start_time: start,
                        duration,
                        byte_size: size,
                        blob_path: None,
                    };
                    self.maybe_upload(session_tag, &mut chunk, opts.use_blob_store)
                        .await?;
                    chunks.push(chunk);
                }
            }
            None => {
                // Duration unknown: pull fixed segments until the stream runs
                // dry or the safety cap trips.
                warn!(src = %src.display(), "source duration unknown, using fixed segments");
                for index in 0..MAX_FALLBACK_SEGMENTS {
                    let start = index as f64 * FALLBACK_SEGMENT_SEC;
                    let out = work.join(format!("chunk_{index}.{ext}"));
                    let size = self
                        .extract_segment(src, start, FALLBACK_SEGMENT_SEC, &out, reencode)
                        .await?;
                    if size < MIN_SEGMENT_BYTES {
                        tokio::fs::remove_file(&out).await.ok();
                        break;
                    }
                    self.verify_chunk_size(size)?;
                    let mut chunk = AudioChunk {
                        path: out,
                        start_time: start,
                        duration: FALLBACK_SEGMENT_SEC,
                        byte_size: size,
                        blob_path: None,
                    };
                    self.maybe_upload(session_tag, &mut chunk, opts.use_blob_store)
                        .await?;
                    chunks.push(chunk);
                }
            }
        }

        Ok(chunks)
    }

    async fn extract_time_range_inner(
        &self,
        src: &Path,
        start: f64,
        duration: f64,
        format: AudioFormat,
        session_tag: &str,
        label: &str,
    ) -> SyncResult<AudioChunk> {
        let work = self.work_dir(session_tag);
        tokio::fs::create_dir_all(&work).await?;

        let reencode = !format.provider_native();
        let ext = if reencode { "mp3" } else { format.as_str() };
        let out = work.join(format!("{label}.{ext}"));

        let size = self
            .extract_segment(src, start, duration, &out, reencode)
            .await?;
        self.verify_chunk_size(size)?;

        Ok(AudioChunk {
            path: out,
            start_time: start,
            duration,
            byte_size: size,
            blob_path: None,
        })
    }
}

/// Computes `(start, duration)` pairs covering `[0, total)` with the
/// byte-derived per-chunk duration clamped into the configured range, and
/// an optional cap on the first segment.
pub fn plan_segments(
    total_duration: f64,
    bytes_per_sec: f64,
    target_bytes: u64,
    clamp_min_sec: f64,
    clamp_max_sec: f64,
    first_chunk_cap: Option<f64>,
) -> Vec<(f64, f64)> {
    let per_chunk = (target_bytes as f64 / bytes_per_sec).clamp(clamp_min_sec, clamp_max_sec);

    let mut plan = Vec::new();
    let mut start = 0.0;
    while start < total_duration {
        let mut duration = per_chunk;
        if plan.is_empty() {
            if let Some(cap) = first_chunk_cap {
                duration = duration.min(cap);
            }
        }
        duration = duration.min(total_duration - start);
        plan.push((start, duration));
        start += duration;
    }
    plan
}

//=========================================================================================
// AudioSegmenter port
//=========================================================================================

fn to_port(err: SyncError) -> PortError {
    match err {
        SyncError::NotFound(what) => PortError::NotFound(what),
        SyncError::Port(port) => port,
        other => PortError::Unexpected(other.to_string()),
    }
}

#[async_trait]
impl AudioSegmenter for FfmpegChunker {
    async fn probe(&self, src: &Path) -> PortResult<AudioProbe> {
        self.probe_inner(src).await.map_err(to_port)
    }

    async fn chunk_file(
        &self,
        src: &Path,
        session_tag: &str,
        opts: ChunkOptions,
    ) -> PortResult<Vec<AudioChunk>> {
        self.chunk_file_inner(src, session_tag, opts)
            .await
            .map_err(to_port)
    }

    async fn extract_time_range(
        &self,
        src: &Path,
        start: f64,
        duration: f64,
        format: AudioFormat,
        session_tag: &str,
        label: &str,
    ) -> PortResult<AudioChunk> {
        self.extract_time_range_inner(src, start, duration, format, session_tag, label)
            .await
            .map_err(to_port)
    }

    async fn cleanup_chunks(&self, session_tag: &str, chunks: &[AudioChunk]) -> PortResult<()> {
        for chunk in chunks {
            if let (Some(blob_path), Some(blobs)) = (chunk.blob_path.as_ref(), self.blobs.as_ref())
            {
                if let Err(e) = blobs.delete(blob_path).await {
                    debug!(blob_path, error = %e, "temp chunk already gone");
                }
            }
            tokio::fs::remove_file(&chunk.path).await.ok();
        }
        tokio::fs::remove_dir_all(self.work_dir(session_tag)).await.ok();
        Ok(())
    }

    fn work_dir(&self, session_tag: &str) -> PathBuf {
        self.work_root.join(format!("chunks_{session_tag}"))
    }
}
