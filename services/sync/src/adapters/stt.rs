//! services/sync/src/adapters/stt.rs
//!
//! This module contains the adapter for OpenAI's Speech-to-Text (Whisper)
//! service. It implements the `TranscriptionService` port from the `core`
//! crate, requesting the verbose JSON form so per-segment timestamps come
//! back with the text.

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{AudioInput, AudioResponseFormat, CreateTranscriptionRequest},
    Client,
};
use async_trait::async_trait;

use audiosync_core::domain::{Transcript, TranscriptSegment};
use audiosync_core::ports::{PortError, PortResult, TranscriptionService};

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `TranscriptionService` port using the
/// OpenAI Whisper API.
#[derive(Clone)]
pub struct OpenAiSttAdapter {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiSttAdapter {
    /// Creates a new `OpenAiSttAdapter`.
    pub fn new(client: Client<OpenAIConfig>, model: String) -> Self {
        Self { client, model }
    }
}

//=========================================================================================
// `TranscriptionService` Trait Implementation
//=========================================================================================

#[async_trait]
impl TranscriptionService for OpenAiSttAdapter {
    /// Transcribes one audio chunk with segment-level timestamps.
    async fn transcribe(&self, audio: Vec<u8>, filename: &str) -> PortResult<Transcript> {
        let input = AudioInput::from_vec_u8(filename.to_string(), audio);

        let request = CreateTranscriptionRequest {
            file: input,
            model: self.model.clone(),
            response_format: Some(AudioResponseFormat::VerboseJson),
            ..Default::default()
        };

        // Call the API and manually map the error, which respects the orphan rule.
        let response = self
            .client
            .audio()
            .transcribe_verbose_json(request)
            .await
            .map_err(|e: OpenAIError| PortError::Unexpected(e.to_string()))?;

        let segments: Vec<TranscriptSegment> = response
            .segments
            .unwrap_or_default()
            .into_iter()
            .map(|s| TranscriptSegment {
                start: f64::from(s.start),
                end: f64::from(s.end),
                text: s.text,
            })
            .collect();

        // Some responses omit a usable duration; fall back to the last
        // segment's end.
        let duration = if response.duration > 0.0 {
            Some(f64::from(response.duration))
        } else {
            segments.last().map(|s| s.end)
        };

        Ok(Transcript {
            text: response.text,
            duration,
            segments,
        })
    }
}
