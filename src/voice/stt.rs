//! Speech-to-text (STT) processing

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::capture::samples_to_wav;
use crate::{Error, Result};

/// Turns a finite audio buffer into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe mono samples, hinting the spoken language
    ///
    /// An empty string means nothing intelligible was said.
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails
    async fn transcribe(&self, samples: &[f32], sample_rate: u32, language: &str)
    -> Result<String>;
}

/// Wire dialect of the local Whisper server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WhisperApi {
    /// whisper.cpp `server` example (`POST /inference`)
    WhisperCpp,
    /// OpenAI-compatible servers (`POST /v1/audio/transcriptions`)
    OpenAi,
}

impl WhisperApi {
    const fn path(self) -> &'static str {
        match self {
            Self::WhisperCpp => "/inference",
            Self::OpenAi => "/v1/audio/transcriptions",
        }
    }
}

impl std::str::FromStr for WhisperApi {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "whisper-cpp" | "whisper.cpp" | "whispercpp" => Ok(Self::WhisperCpp),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::Config(format!(
                "unknown whisper api '{other}' (expected whisper-cpp or openai)"
            ))),
        }
    }
}

impl std::fmt::Display for WhisperApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WhisperCpp => f.write_str("whisper-cpp"),
            Self::OpenAi => f.write_str("openai"),
        }
    }
}

/// Transcription response, either flat text or segments
#[derive(Debug, Default, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    segments: Option<Vec<Segment>>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    text: String,
}

impl TranscriptionResponse {
    fn into_transcript(self) -> String {
        match self.segments {
            Some(segments) if !segments.is_empty() => segments
                .iter()
                .map(|s| s.text.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
            _ => self.text.unwrap_or_default().trim().to_string(),
        }
    }
}

/// Client for a local Whisper server
pub struct WhisperClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api: WhisperApi,
}

impl WhisperClient {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, model: String, api: WhisperApi) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api,
        })
    }

    fn form(&self, wav: Vec<u8>, language: &str) -> Result<reqwest::multipart::Form> {
        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("response_format", "json");

        form = match self.api {
            WhisperApi::WhisperCpp => form.text("temperature", "0.0"),
            WhisperApi::OpenAi => form.text("model", self.model.clone()),
        };

        if !language.is_empty() {
            form = form.text("language", language.to_string());
        }

        Ok(form)
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
        language: &str,
    ) -> Result<String> {
        let wav = samples_to_wav(samples, sample_rate)?;
        tracing::debug!(
            audio_bytes = wav.len(),
            api = %self.api,
            "starting transcription"
        );

        let url = format!("{}{}", self.base_url, self.api.path());
        let response = self
            .client
            .post(&url)
            .multipart(self.form(wav, language)?)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %url, "whisper request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "whisper server error");
            return Err(Error::Stt(format!("whisper server error {status}: {body}")));
        }

        let result: TranscriptionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription");
            e
        })?;

        let transcript = result.into_transcript();
        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}
