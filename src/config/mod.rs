//! Configuration management
//!
//! Built once at startup with precedence environment > TOML file > default;
//! CLI flags are applied on top in `main`. Values are validated here so a
//! bad setting fails before any device or server is touched.

pub mod file;

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::history::DEFAULT_MAX_HISTORY;
use crate::voice::{DetectorKind, GateParams, TtsBackend, WhisperApi};
use crate::{Error, Result};

pub use file::{MurmurConfigFile, config_file_path, load_config_file};

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Keep responses concise and natural.";

/// Ollama chat server settings
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
    pub stream: bool,
    pub system_prompt: String,
    pub max_history: usize,
}

/// Whisper server settings
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub url: String,
    pub api: WhisperApi,
    pub model: String,
    pub language: String,
}

/// Piper settings
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub backend: TtsBackend,
    pub voice: String,
    pub piper_dir: PathBuf,
    pub url: String,
}

/// Microphone settings
#[derive(Debug, Clone, Copy)]
pub struct AudioConfig {
    pub record_seconds: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Speech gate settings
#[derive(Debug, Clone)]
pub struct VadConfig {
    pub enabled: bool,
    pub detector: DetectorKind,
    pub silero_model: PathBuf,
    pub threshold: f32,
    pub min_speech_frames: usize,
    pub silence_frames: usize,
    pub max_seconds: u64,
}

impl VadConfig {
    /// Gate thresholds for these settings
    #[must_use]
    pub fn gate_params(&self) -> GateParams {
        GateParams {
            threshold: self.threshold,
            min_speech_frames: self.min_speech_frames,
            silence_frames: self.silence_frames,
            max_duration: Duration::from_secs(self.max_seconds),
            ..GateParams::default()
        }
    }
}

/// Conversation mode
#[derive(Debug, Clone, Copy)]
pub struct ModeConfig {
    pub continuous: bool,
    pub text: bool,
    /// Speak replies aloud
    pub speech: bool,
    pub turn_pause: Duration,
}

/// Resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub ollama: OllamaConfig,
    pub whisper: WhisperConfig,
    pub tts: TtsConfig,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub mode: ModeConfig,
    pub log_level: String,
}

/// Typed reads over a key lookup
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(key)
            .map(|v| {
                v.trim()
                    .parse()
                    .map_err(|e| Error::Config(format!("invalid {key} '{v}': {e}")))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        self.string(key)
            .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(Error::Config(format!("invalid {key} '{v}': expected true or false"))),
            })
            .transpose()
    }
}

impl Config {
    /// Load from the process environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if any value is invalid
    pub fn load() -> Result<Self> {
        Self::from_sources(|key| std::env::var(key).ok(), file::load_config_file())
    }

    /// Build from an arbitrary key lookup and a parsed config file
    ///
    /// # Errors
    ///
    /// Returns error if any value is invalid
    pub fn from_sources<F>(lookup: F, fc: MurmurConfigFile) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let ollama = OllamaConfig {
            url: env
                .string("OLLAMA_URL")
                .or(fc.ollama.url)
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: env
                .string("OLLAMA_MODEL")
                .or(fc.ollama.model)
                .unwrap_or_else(|| "llama3.2:3b".to_string()),
            stream: env.flag("OLLAMA_STREAM")?.or(fc.ollama.stream).unwrap_or(false),
            system_prompt: env
                .string("SYSTEM_PROMPT")
                .or(fc.ollama.system_prompt)
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_history: env
                .parsed("MAX_HISTORY")?
                .or(fc.ollama.max_history)
                .unwrap_or(DEFAULT_MAX_HISTORY),
        };

        let whisper = WhisperConfig {
            url: env
                .string("WHISPER_URL")
                .or(fc.whisper.url)
                .unwrap_or_else(|| "http://localhost:8080".to_string()),
            api: env
                .string("WHISPER_API")
                .or(fc.whisper.api)
                .map(|v| v.parse::<WhisperApi>())
                .transpose()?
                .unwrap_or(WhisperApi::WhisperCpp),
            model: env
                .string("WHISPER_MODEL")
                .or(fc.whisper.model)
                .unwrap_or_else(|| "base".to_string()),
            language: env
                .string("WHISPER_LANGUAGE")
                .or(fc.whisper.language)
                .unwrap_or_else(|| "en".to_string()),
        };

        let piper_dir = env
            .string("PIPER_DIR")
            .or(fc.tts.piper_dir)
            .map_or_else(|| PathBuf::from("piper"), PathBuf::from);

        let tts = TtsConfig {
            backend: env
                .string("TTS_BACKEND")
                .or(fc.tts.backend)
                .map(|v| v.parse::<TtsBackend>())
                .transpose()?
                .unwrap_or(TtsBackend::Process),
            voice: env
                .string("PIPER_VOICE")
                .or(fc.tts.voice)
                .unwrap_or_else(|| "en_US-lessac-medium".to_string()),
            piper_dir,
            url: env
                .string("PIPER_URL")
                .or(fc.tts.url)
                .unwrap_or_else(|| "http://localhost:5000".to_string()),
        };

        let audio = AudioConfig {
            record_seconds: env
                .parsed("RECORD_SECONDS")?
                .or(fc.audio.record_seconds)
                .unwrap_or(5),
            sample_rate: env
                .parsed("SAMPLE_RATE")?
                .or(fc.audio.sample_rate)
                .unwrap_or(16_000),
            channels: env.parsed("CHANNELS")?.or(fc.audio.channels).unwrap_or(1),
        };

        let vad = VadConfig {
            enabled: env.flag("USE_VAD")?.or(fc.vad.enabled).unwrap_or(false),
            detector: env
                .string("VAD_DETECTOR")
                .or(fc.vad.detector)
                .map(|v| v.parse::<DetectorKind>())
                .transpose()?
                .unwrap_or(DetectorKind::Energy),
            silero_model: env
                .string("SILERO_MODEL")
                .or(fc.vad.silero_model)
                .map_or_else(|| PathBuf::from("models").join("silero_vad.onnx"), PathBuf::from),
            threshold: env
                .parsed("VAD_THRESHOLD")?
                .or(fc.vad.threshold)
                .unwrap_or(0.5),
            min_speech_frames: env
                .parsed("VAD_MIN_SPEECH_FRAMES")?
                .or(fc.vad.min_speech_frames)
                .unwrap_or(5),
            silence_frames: env
                .parsed("VAD_SILENCE_FRAMES")?
                .or(fc.vad.silence_frames)
                .unwrap_or(30),
            max_seconds: env
                .parsed("VAD_MAX_SECONDS")?
                .or(fc.vad.max_seconds)
                .unwrap_or(30),
        };

        let mode = ModeConfig {
            continuous: env
                .flag("CONTINUOUS_MODE")?
                .or(fc.mode.continuous)
                .unwrap_or(false),
            text: env.flag("TEXT_MODE")?.or(fc.mode.text).unwrap_or(false),
            speech: true,
            turn_pause: Duration::from_millis(
                env.parsed("TURN_PAUSE_MS")?
                    .or(fc.mode.turn_pause_ms)
                    .unwrap_or(500),
            ),
        };

        let log_level = env
            .string("LOG_LEVEL")
            .or(fc.log_level)
            .unwrap_or_else(|| "warn".to_string());

        let config = Self {
            ollama,
            whisper,
            tts,
            audio,
            vad,
            mode,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("OLLAMA_URL", &self.ollama.url),
            ("WHISPER_URL", &self.whisper.url),
            ("PIPER_URL", &self.tts.url),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| Error::Config(format!("invalid {key} '{value}': {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::Config(format!(
                    "invalid {key} '{value}': expected http or https"
                )));
            }
        }

        if self.audio.sample_rate == 0 {
            return Err(Error::Config("SAMPLE_RATE must be positive".to_string()));
        }
        if self.audio.channels == 0 {
            return Err(Error::Config("CHANNELS must be at least 1".to_string()));
        }
        if self.audio.record_seconds == 0 {
            return Err(Error::Config("RECORD_SECONDS must be positive".to_string()));
        }
        if self.ollama.max_history == 0 {
            return Err(Error::Config("MAX_HISTORY must be at least 1".to_string()));
        }
        if !(0.0..=1.0).contains(&self.vad.threshold) {
            return Err(Error::Config(format!(
                "VAD_THRESHOLD must be between 0 and 1, got {}",
                self.vad.threshold
            )));
        }
        if self.vad.min_speech_frames == 0 || self.vad.silence_frames == 0 {
            return Err(Error::Config(
                "VAD_MIN_SPEECH_FRAMES and VAD_SILENCE_FRAMES must be at least 1".to_string(),
            ));
        }
        if self.vad.max_seconds == 0 {
            return Err(Error::Config("VAD_MAX_SECONDS must be positive".to_string()));
        }
        if self.vad.enabled && self.audio.sample_rate != crate::voice::SAMPLE_RATE {
            return Err(Error::Config(format!(
                "the speech gate needs SAMPLE_RATE={}, got {}",
                crate::voice::SAMPLE_RATE,
                self.audio.sample_rate
            )));
        }

        Ok(())
    }

    /// Voice model path for the process backend
    #[must_use]
    pub fn voice_model_path(&self) -> PathBuf {
        crate::voice::voice_model_path(&self.tts.piper_dir, &self.tts.voice)
    }
}
