//! TOML configuration file loading
//!
//! Supports `~/.config/murmur/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MurmurConfigFile {
    /// Ollama chat server
    #[serde(default)]
    pub ollama: OllamaFileConfig,

    /// Whisper transcription server
    #[serde(default)]
    pub whisper: WhisperFileConfig,

    /// Piper text-to-speech
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Microphone settings
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Speech gate settings
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Conversation mode
    #[serde(default)]
    pub mode: ModeFileConfig,

    /// Default log filter (e.g. "warn", "murmur=debug")
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OllamaFileConfig {
    pub url: Option<String>,
    pub model: Option<String>,
    pub stream: Option<bool>,
    pub system_prompt: Option<String>,
    pub max_history: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WhisperFileConfig {
    pub url: Option<String>,
    /// "whisper-cpp" or "openai"
    pub api: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "process" or "server"
    pub backend: Option<String>,
    pub voice: Option<String>,
    pub piper_dir: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub record_seconds: Option<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub enabled: Option<bool>,
    /// "energy" or "silero"
    pub detector: Option<String>,
    pub silero_model: Option<String>,
    pub threshold: Option<f32>,
    pub min_speech_frames: Option<usize>,
    pub silence_frames: Option<usize>,
    pub max_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModeFileConfig {
    pub continuous: Option<bool>,
    pub text: Option<bool>,
    pub turn_pause_ms: Option<u64>,
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the TOML is malformed or a field has the wrong type
pub fn parse_config_file(content: &str) -> Result<MurmurConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file from the standard path
///
/// Returns `MurmurConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> MurmurConfigFile {
    config_file_path().map_or_else(MurmurConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
pub fn load_config_file_from(path: &Path) -> MurmurConfigFile {
    if !path.exists() {
        return MurmurConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                MurmurConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            MurmurConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/murmur/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("murmur").join("config.toml"))
}
