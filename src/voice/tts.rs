//! Text-to-speech (TTS) processing
//!
//! Both backends drive Piper and hand back decoded PCM: [`PiperProcess`]
//! spawns the executable per request, [`PiperServer`] talks to a running
//! Piper HTTP server.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::capture::{samples_to_wav, wav_to_samples};
use crate::{Error, Result};

/// Name of the Piper binary on this platform
pub const PIPER_BINARY: &str = if cfg!(windows) { "piper.exe" } else { "piper" };

/// Decoded synthesizer output
#[derive(Debug, Clone, PartialEq)]
pub struct Speech {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Speech {
    /// Whether the synthesizer produced no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Write the waveform as a 16-bit mono WAV file
    ///
    /// # Errors
    ///
    /// Returns error if encoding or writing fails
    pub fn save_wav(&self, path: &Path) -> Result<()> {
        let wav = samples_to_wav(&self.samples, self.sample_rate)?;
        std::fs::write(path, wav)?;
        tracing::info!(path = %path.display(), "speech saved");
        Ok(())
    }
}

/// Turns text into a waveform
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`
    ///
    /// # Errors
    ///
    /// Returns error if the voice or runtime is unavailable
    async fn synthesize(&self, text: &str) -> Result<Speech>;
}

/// TTS backend selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsBackend {
    /// Spawn the Piper executable
    Process,
    /// Call a Piper HTTP server
    Server,
}

impl std::str::FromStr for TtsBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" | "executable" => Ok(Self::Process),
            "server" | "http" => Ok(Self::Server),
            other => Err(Error::Config(format!(
                "unknown tts backend '{other}' (expected process or server)"
            ))),
        }
    }
}

impl std::fmt::Display for TtsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Find the Piper executable
///
/// Looks for the nested `piper/piper` layout of the release archive first,
/// then a binary directly in `dir`, then `piper` on `PATH`.
///
/// # Errors
///
/// Returns error if no executable is found
pub fn resolve_piper_executable(dir: &Path) -> Result<PathBuf> {
    let candidates = [dir.join("piper").join(PIPER_BINARY), dir.join(PIPER_BINARY)];

    if let Some(found) = candidates.into_iter().find(|p| p.is_file()) {
        return Ok(found);
    }

    which::which("piper").map_err(|_| {
        Error::Config(format!(
            "piper executable not found in {} or on PATH",
            dir.display()
        ))
    })
}

/// Path of a voice model under the Piper directory
#[must_use]
pub fn voice_model_path(dir: &Path, voice: &str) -> PathBuf {
    dir.join("voices").join(format!("{voice}.onnx"))
}

/// Piper executable driven as a subprocess
#[derive(Debug, Clone)]
pub struct PiperProcess {
    executable: PathBuf,
    model: PathBuf,
}

impl PiperProcess {
    /// Create a backend for an executable and voice model
    ///
    /// # Errors
    ///
    /// Returns error if either file is missing
    pub fn new(executable: PathBuf, model: PathBuf) -> Result<Self> {
        if !executable.is_file() {
            return Err(Error::Config(format!(
                "piper executable not found: {}",
                executable.display()
            )));
        }
        if !model.is_file() {
            return Err(Error::Config(format!(
                "voice model not found: {}",
                model.display()
            )));
        }

        tracing::info!(
            voice = model.file_stem().and_then(|s| s.to_str()).unwrap_or_default(),
            "piper process backend ready"
        );

        Ok(Self { executable, model })
    }

    /// Run Piper and leave the WAV at `output`
    ///
    /// # Errors
    ///
    /// Returns error if Piper cannot be spawned or exits non-zero
    pub async fn synthesize_to_file(&self, text: &str, output: &Path) -> Result<()> {
        tracing::debug!(chars = text.len(), "running piper");

        let mut child = tokio::process::Command::new(&self.executable)
            .arg("--model")
            .arg(&self.model)
            .arg("--output_file")
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tts(format!("failed to start piper: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(status = %output.status, stderr = %stderr.trim(), "piper failed");
            return Err(Error::Tts(format!("piper failed: {}", stderr.trim())));
        }

        Ok(())
    }
}

#[async_trait]
impl Synthesizer for PiperProcess {
    async fn synthesize(&self, text: &str) -> Result<Speech> {
        let file = tempfile::Builder::new()
            .prefix("murmur-")
            .suffix(".wav")
            .tempfile()?;

        self.synthesize_to_file(text, file.path()).await?;

        let wav = tokio::fs::read(file.path()).await?;
        let (samples, sample_rate) =
            wav_to_samples(&wav).map_err(|e| Error::Tts(e.to_string()))?;

        tracing::debug!(samples = samples.len(), sample_rate, "speech generated");
        Ok(Speech {
            samples,
            sample_rate,
        })
    }
}

/// Piper HTTP server backend
pub struct PiperServer {
    client: reqwest::Client,
    base_url: String,
    voice: String,
}

impl PiperServer {
    /// Create a client for the server at `base_url`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: &str, voice: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            voice,
        })
    }
}

#[async_trait]
impl Synthesizer for PiperServer {
    async fn synthesize(&self, text: &str) -> Result<Speech> {
        #[derive(serde::Serialize)]
        struct SynthesizeRequest<'a> {
            text: &'a str,
            voice: &'a str,
        }

        let response = self
            .client
            .post(&self.base_url)
            .json(&SynthesizeRequest {
                text,
                voice: &self.voice,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("piper server error {status}: {body}")));
        }

        let wav = response.bytes().await?;
        let (samples, sample_rate) =
            wav_to_samples(&wav).map_err(|e| Error::Tts(e.to_string()))?;

        Ok(Speech {
            samples,
            sample_rate,
        })
    }
}
