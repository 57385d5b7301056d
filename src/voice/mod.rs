//! Voice processing module
//!
//! Handles microphone capture, speech gating, transcription, synthesis and
//! playback.

mod capture;
mod detector;
mod frame;
mod gate;
mod microphone;
mod playback;
mod stt;
mod tts;

pub use capture::{
    AudioCapture, CaptureConfig, DEFAULT_QUEUE_FRAMES, FramePuller, FrameProducer, FrameSource,
    FrameStream, NextFrame, samples_to_wav, wav_to_samples,
};
#[cfg(feature = "silero")]
pub use detector::SileroDetector;
pub use detector::{DetectorKind, EnergyDetector, SpeechDetector, calculate_rms};
pub use frame::{AudioFrame, FRAME_SAMPLES, Fit, SAMPLE_RATE, Utterance};
pub use gate::{Captured, GateParams, GateState, GateStats, GateStop, SpeechGate, Step};
pub use microphone::{Microphone, VoiceInput};
pub use playback::{AudioPlayback, Speaker, resample_audio};
pub use stt::{Transcriber, WhisperApi, WhisperClient};
pub use tts::{
    PIPER_BINARY, PiperProcess, PiperServer, Speech, Synthesizer, TtsBackend,
    resolve_piper_executable, voice_model_path,
};
