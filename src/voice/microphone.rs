//! Voice input: microphone plus optional speech gate

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::capture::FrameSource;
use super::detector::SpeechDetector;
use super::frame::Utterance;
use super::gate::{Captured, GateParams, GateState, GateStats, GateStop, SpeechGate};
use crate::{Error, Result};

/// Source of spoken utterances
#[async_trait]
pub trait VoiceInput: Send + Sync {
    /// Capture one utterance
    ///
    /// An empty utterance means no speech was detected.
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened
    async fn listen(&self, cancel: &CancellationToken) -> Result<Captured>;
}

enum ListenMode {
    Fixed(Duration),
    Gated {
        params: GateParams,
        detector: Arc<Mutex<Box<dyn SpeechDetector>>>,
    },
}

/// Default microphone, recording for a fixed time or until the speaker pauses
pub struct Microphone {
    source: FrameSource,
    mode: ListenMode,
    on_progress: Option<fn(GateState)>,
}

impl Microphone {
    /// Record a fixed number of seconds per turn
    #[must_use]
    pub const fn fixed(source: FrameSource, duration: Duration) -> Self {
        Self {
            source,
            mode: ListenMode::Fixed(duration),
            on_progress: None,
        }
    }

    /// Record until the speech gate closes
    #[must_use]
    pub fn gated(
        source: FrameSource,
        params: GateParams,
        detector: Box<dyn SpeechDetector>,
    ) -> Self {
        Self {
            source,
            mode: ListenMode::Gated {
                params,
                detector: Arc::new(Mutex::new(detector)),
            },
            on_progress: None,
        }
    }

    /// Show gate progress while listening
    #[must_use]
    pub const fn with_progress(mut self, f: fn(GateState)) -> Self {
        self.on_progress = Some(f);
        self
    }
}

#[async_trait]
impl VoiceInput for Microphone {
    async fn listen(&self, cancel: &CancellationToken) -> Result<Captured> {
        let source = self.source.clone();

        let task = match &self.mode {
            ListenMode::Fixed(duration) => {
                let duration = *duration;
                let cancel = cancel.clone();
                tokio::task::spawn_blocking(move || {
                    let sample_rate = source.config().sample_rate;
                    let (samples, completed) = source.record(duration, &cancel)?;
                    Ok(Captured {
                        utterance: Utterance::from_samples(samples, sample_rate),
                        stop: if completed {
                            GateStop::MaxDuration
                        } else {
                            GateStop::Cancelled
                        },
                        stats: GateStats::default(),
                    })
                })
            }
            ListenMode::Gated { params, detector } => {
                let params = *params;
                let detector = Arc::clone(detector);
                let cancel = cancel.clone();
                let on_progress = self.on_progress;

                tokio::task::spawn_blocking(move || {
                    let mut frames = source.open()?;
                    let mut detector = detector
                        .lock()
                        .map_err(|_| Error::Vad("detector lock poisoned".to_string()))?;

                    let mut gate = SpeechGate::new(params);
                    if let Some(f) = on_progress {
                        gate = gate.with_progress(f);
                    }

                    // Stream drops at the end of this closure on every path
                    Ok(gate.run(&mut frames, &mut **detector, &cancel))
                })
            }
        };

        task.await
            .map_err(|e| Error::Audio(format!("capture task failed: {e}")))?
    }
}
