//! Shared test utilities
//!
//! Scripted stand-ins for the microphone, servers and speaker so the
//! conversation loop can be driven without audio hardware or network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use murmur::voice::{
    AudioFrame, Captured, FRAME_SAMPLES, FramePuller, GateStats, GateStop, NextFrame,
    SAMPLE_RATE, Speaker, Speech, SpeechDetector, Synthesizer, Transcriber, Utterance, VoiceInput,
};
use murmur::{Error, Exchange, Prompter, Responder, Result};

/// Generate sine wave audio samples
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

/// Generate silence
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_silence(duration_secs: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    vec![0.0; num_samples]
}

/// Exactly `frames` detector frames of a 440 Hz tone
#[allow(clippy::cast_precision_loss)]
pub fn tone_frames(frames: usize, amplitude: f32) -> Vec<f32> {
    (0..frames * FRAME_SAMPLES)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect()
}

/// Exactly `frames` detector frames of silence
pub fn silence_frames(frames: usize) -> Vec<f32> {
    vec![0.0; frames * FRAME_SAMPLES]
}

/// A detector-sized frame filled with `value`
pub fn frame_of(value: f32) -> AudioFrame {
    AudioFrame::mono(vec![value; FRAME_SAMPLES])
}

/// A non-empty utterance of `frames` frames
pub fn utterance(frames: usize) -> Utterance {
    let mut utterance = Utterance::new();
    for _ in 0..frames {
        utterance.push(frame_of(0.1));
    }
    utterance
}

/// Captured audio as the gate would hand it over
pub fn captured(utterance: Utterance, stop: GateStop) -> Captured {
    Captured {
        utterance,
        stop,
        stats: GateStats::default(),
    }
}

/// Frame puller over a fixed script; `None` entries time out
pub struct ScriptedFrames {
    script: VecDeque<Option<Result<AudioFrame>>>,
    pace: Duration,
}

impl ScriptedFrames {
    pub fn new(frames: impl IntoIterator<Item = AudioFrame>) -> Self {
        Self {
            script: frames.into_iter().map(|f| Some(Ok(f))).collect(),
            pace: Duration::ZERO,
        }
    }

    /// Deliver frames no faster than one per `pace`, like a real device
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Append a device error
    pub fn then_error(mut self, message: &str) -> Self {
        self.script
            .push_back(Some(Err(Error::Audio(message.to_string()))));
        self
    }
}

impl FramePuller for ScriptedFrames {
    fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame> {
        match self.script.pop_front() {
            Some(Some(Ok(frame))) => {
                if !self.pace.is_zero() {
                    std::thread::sleep(self.pace.min(timeout));
                }
                Ok(NextFrame::Frame(frame))
            }
            Some(Some(Err(e))) => Err(e),
            Some(None) | None => {
                std::thread::sleep(timeout);
                Ok(NextFrame::Timeout)
            }
        }
    }
}

/// Detector replaying a probability per frame, then a fallback
pub struct ScriptedDetector {
    probabilities: VecDeque<Result<f32>>,
    fallback: f32,
}

impl ScriptedDetector {
    pub fn new(probabilities: impl IntoIterator<Item = f32>) -> Self {
        Self {
            probabilities: probabilities.into_iter().map(Ok).collect(),
            fallback: 0.0,
        }
    }

    pub fn then_fail(mut self) -> Self {
        self.probabilities
            .push_back(Err(Error::Vad("model crashed".to_string())));
        self
    }
}

impl SpeechDetector for ScriptedDetector {
    fn speech_probability(&mut self, _frame: &[f32]) -> Result<f32> {
        self.probabilities.pop_front().unwrap_or(Ok(self.fallback))
    }
}

/// Prompter replaying typed lines; end of script is end of input
#[derive(Clone, Default)]
pub struct ScriptedPrompter {
    lines: Arc<Mutex<VecDeque<String>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedPrompter {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines.iter().map(ToString::to_string).collect())),
            prompts: Arc::default(),
        }
    }

    /// Prompts shown so far
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn read_line(&mut self, prompt: &str) -> Result<Option<String>> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.lines.lock().unwrap().pop_front())
    }
}

/// How the mock responder answers
#[derive(Clone)]
pub enum Reply {
    Text(String),
    Timeout,
    Refused,
}

/// Responder replaying scripted replies and recording requests
#[derive(Clone, Default)]
pub struct MockResponder {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    calls: Arc<Mutex<Vec<(Vec<Exchange>, String)>>>,
}

impl MockResponder {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            calls: Arc::default(),
        }
    }

    pub fn answering(text: &str) -> Self {
        Self::new(vec![Reply::Text(text.to_string())])
    }

    /// Context and prompt of every call so far
    pub fn calls(&self) -> Vec<(Vec<Exchange>, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Responder for MockResponder {
    async fn respond(&self, context: &[Exchange], prompt: &str) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((context.to_vec(), prompt.to_string()));

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::Text("ok".to_string()));

        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Timeout => Err(Error::ResponderTimeout),
            Reply::Refused => Err(Error::Responder("connection refused".to_string())),
        }
    }
}

/// Voice input replaying captures; exhausted script reports cancellation
#[derive(Clone, Default)]
pub struct MockVoice {
    captures: Arc<Mutex<VecDeque<Captured>>>,
}

impl MockVoice {
    pub fn new(captures: Vec<Captured>) -> Self {
        Self {
            captures: Arc::new(Mutex::new(captures.into())),
        }
    }
}

#[async_trait]
impl VoiceInput for MockVoice {
    async fn listen(&self, _cancel: &CancellationToken) -> Result<Captured> {
        Ok(self
            .captures
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| captured(Utterance::new(), GateStop::Cancelled)))
    }
}

/// Transcriber replaying transcripts
#[derive(Clone, Default)]
pub struct MockTranscriber {
    transcripts: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<Mutex<usize>>,
}

impl MockTranscriber {
    pub fn new(transcripts: &[&str]) -> Self {
        Self {
            transcripts: Arc::new(Mutex::new(
                transcripts.iter().map(ToString::to_string).collect(),
            )),
            calls: Arc::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _samples: &[f32], _sample_rate: u32, _language: &str) -> Result<String> {
        *self.calls.lock().unwrap() += 1;
        Ok(self.transcripts.lock().unwrap().pop_front().unwrap_or_default())
    }
}

/// Synthesizer producing a short tone, or failing
#[derive(Clone, Default)]
pub struct MockSynthesizer {
    fail: bool,
    texts: Arc<Mutex<Vec<String>>>,
}

impl MockSynthesizer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            texts: Arc::default(),
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Speech> {
        self.texts.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(Error::Tts("voice model not found".to_string()));
        }
        Ok(Speech {
            samples: generate_sine_samples(440.0, 0.1, 0.3),
            sample_rate: SAMPLE_RATE,
        })
    }
}

/// Speaker recording what it was asked to play
#[derive(Clone, Default)]
pub struct MockSpeaker {
    played: Arc<Mutex<Vec<Speech>>>,
}

impl MockSpeaker {
    pub fn played(&self) -> Vec<Speech> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl Speaker for MockSpeaker {
    async fn play(&self, speech: Speech) -> Result<()> {
        self.played.lock().unwrap().push(speech);
        Ok(())
    }
}
