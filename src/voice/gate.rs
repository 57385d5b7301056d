//! Speech gate - decides where an utterance starts and ends
//!
//! ```text
//!   Idle ──start──▶ Listening ──p > threshold──▶ Speaking ◀──p > threshold──┐
//!                                                   │                        │
//!                          p ≤ threshold and ≥ min speech frames             │
//!                                                   ▼                        │
//!                                            TrailingSilence ────────────────┘
//!                                                   │
//!                                  silence_frames consecutive quiet frames
//!                                                   ▼
//!                                                 Idle (utterance emitted)
//! ```
//!
//! Independently of state, the gate force-finalizes once `max_duration` has
//! elapsed since the stream started.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::capture::{FramePuller, NextFrame};
use super::detector::SpeechDetector;
use super::frame::{AudioFrame, FRAME_SAMPLES, Fit, Utterance};

/// Speech gate state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Not started
    Idle,
    /// Stream running, no speech confirmed yet
    Listening,
    /// Speech confirmed, accumulating
    Speaking,
    /// Speech seen, counting quiet frames toward the stop
    TrailingSilence,
}

/// Tunable gate thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateParams {
    /// Probability a frame must exceed to count as speech
    pub threshold: f32,
    /// Speech frames required before silence is counted
    pub min_speech_frames: usize,
    /// Consecutive quiet frames that end the utterance
    pub silence_frames: usize,
    /// Hard cap on listening time
    pub max_duration: Duration,
    /// Samples per frame handed to the detector
    pub frame_size: usize,
    /// No frames for this long means the device stalled
    pub stall_timeout: Duration,
    /// Granularity of queue reads, bounds how long cancellation takes
    pub poll_interval: Duration,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_frames: 5,
            silence_frames: 30,
            max_duration: Duration::from_secs(30),
            frame_size: FRAME_SAMPLES,
            stall_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Why the gate stopped collecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateStop {
    /// Trailing silence reached the threshold
    Silence,
    /// Listening time hit the hard cap
    MaxDuration,
    /// The speech detector failed on a frame
    DetectorFailed(String),
    /// The audio device reported an error
    DeviceFailed(String),
    /// No frames arrived within the stall timeout
    Stalled,
    /// Interrupted by the user
    Cancelled,
}

impl GateStop {
    /// Whether this stop should be surfaced as a warning
    #[must_use]
    pub const fn is_abnormal(&self) -> bool {
        matches!(
            self,
            Self::DetectorFailed(_) | Self::DeviceFailed(_) | Self::Stalled
        )
    }
}

/// Outcome of feeding one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Keep feeding frames
    Continue,
    /// Stop and finalize the utterance
    Finalize(GateStop),
}

/// Frame accounting for one capture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub frames: usize,
    pub speech_frames: usize,
    pub padded_frames: usize,
    pub truncated_frames: usize,
}

/// A finalized capture
#[derive(Debug)]
pub struct Captured {
    pub utterance: Utterance,
    pub stop: GateStop,
    pub stats: GateStats,
}

type ProgressFn = Box<dyn FnMut(GateState) + Send>;

/// VAD state machine over a frame stream
pub struct SpeechGate {
    params: GateParams,
    state: GateState,
    utterance: Utterance,
    silence_run: usize,
    stats: GateStats,
    on_progress: Option<ProgressFn>,
}

impl SpeechGate {
    #[must_use]
    pub fn new(params: GateParams) -> Self {
        Self {
            params,
            state: GateState::Idle,
            utterance: Utterance::new(),
            silence_run: 0,
            stats: GateStats::default(),
            on_progress: None,
        }
    }

    /// Report periodic progress (every 20 listening, 5 speech or 5 quiet frames)
    #[must_use]
    pub fn with_progress(mut self, f: impl FnMut(GateState) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    #[must_use]
    pub const fn state(&self) -> GateState {
        self.state
    }

    #[must_use]
    pub const fn stats(&self) -> &GateStats {
        &self.stats
    }

    /// Consecutive quiet frames counted toward the stop
    #[must_use]
    pub const fn silence_run(&self) -> usize {
        self.silence_run
    }

    /// Begin a new utterance
    pub fn start(&mut self) {
        self.state = GateState::Listening;
        self.utterance = Utterance::new();
        self.silence_run = 0;
        self.stats = GateStats::default();
    }

    /// Feed one classified frame
    ///
    /// `elapsed` is the time since the stream started; once it reaches the
    /// hard cap the frame is not consumed and the gate asks to finalize.
    pub fn advance(&mut self, frame: AudioFrame, probability: f32, elapsed: Duration) -> Step {
        if self.state == GateState::Idle {
            self.start();
        }
        if elapsed >= self.params.max_duration {
            return Step::Finalize(GateStop::MaxDuration);
        }

        self.stats.frames += 1;
        let is_speech = probability > self.params.threshold;

        match self.state {
            GateState::Idle | GateState::Listening => {
                if is_speech {
                    tracing::debug!(probability, "speech started");
                    self.state = GateState::Speaking;
                    self.stats.speech_frames = 1;
                    self.silence_run = 0;
                    self.utterance.push(frame);
                } else if self.stats.frames % 20 == 0 {
                    self.progress();
                }
            }
            GateState::Speaking => {
                self.utterance.push(frame);
                if is_speech {
                    self.stats.speech_frames += 1;
                    self.silence_run = 0;
                    if self.stats.speech_frames % 5 == 0 {
                        self.progress();
                    }
                } else if self.stats.speech_frames >= self.params.min_speech_frames {
                    self.state = GateState::TrailingSilence;
                    return self.count_silence();
                }
            }
            GateState::TrailingSilence => {
                self.utterance.push(frame);
                if is_speech {
                    self.state = GateState::Speaking;
                    self.stats.speech_frames += 1;
                    self.silence_run = 0;
                } else {
                    return self.count_silence();
                }
            }
        }

        Step::Continue
    }

    fn count_silence(&mut self) -> Step {
        self.silence_run += 1;
        if self.silence_run % 5 == 0 {
            self.progress();
        }
        if self.silence_run >= self.params.silence_frames.max(1) {
            tracing::debug!(silence_frames = self.silence_run, "silence detected after speech");
            return Step::Finalize(GateStop::Silence);
        }
        Step::Continue
    }

    fn progress(&mut self) {
        let state = self.state;
        if let Some(f) = self.on_progress.as_mut() {
            f(state);
        }
    }

    /// Hand over the collected audio and return to idle
    pub fn finish(&mut self, stop: GateStop) -> Captured {
        self.state = GateState::Idle;
        self.silence_run = 0;
        Captured {
            utterance: std::mem::take(&mut self.utterance),
            stop,
            stats: std::mem::take(&mut self.stats),
        }
    }

    /// Pull frames until the utterance ends
    ///
    /// Never fails: detector and device errors finalize with whatever was
    /// collected and are reported through [`Captured::stop`].
    pub fn run(
        &mut self,
        frames: &mut dyn FramePuller,
        detector: &mut dyn SpeechDetector,
        cancel: &CancellationToken,
    ) -> Captured {
        self.start();
        detector.reset();

        let started = Instant::now();
        let mut last_frame = started;

        let stop = loop {
            if cancel.is_cancelled() {
                break GateStop::Cancelled;
            }

            let elapsed = started.elapsed();
            let Some(remaining) = self.params.max_duration.checked_sub(elapsed) else {
                break GateStop::MaxDuration;
            };
            if remaining.is_zero() {
                break GateStop::MaxDuration;
            }

            let mut frame = match frames.next_frame(self.params.poll_interval.min(remaining)) {
                Ok(NextFrame::Frame(frame)) => frame,
                Ok(NextFrame::Timeout) => {
                    if last_frame.elapsed() >= self.params.stall_timeout {
                        tracing::warn!("audio queue timeout");
                        break GateStop::Stalled;
                    }
                    continue;
                }
                Err(e) => break GateStop::DeviceFailed(e.to_string()),
            };
            last_frame = Instant::now();

            match frame.fit_to(self.params.frame_size) {
                Fit::Exact => {}
                Fit::Padded => self.stats.padded_frames += 1,
                Fit::Truncated => self.stats.truncated_frames += 1,
            }

            let probability = match detector.speech_probability(frame.samples()) {
                Ok(p) => p,
                Err(e) => break GateStop::DetectorFailed(e.to_string()),
            };

            if let Step::Finalize(stop) = self.advance(frame, probability, started.elapsed()) {
                break stop;
            }
        };

        if stop.is_abnormal() {
            tracing::warn!(?stop, "speech gate aborted, keeping collected audio");
        }

        let captured = self.finish(stop);
        tracing::info!(
            stop = ?captured.stop,
            frames = captured.stats.frames,
            speech_frames = captured.stats.speech_frames,
            seconds = captured.utterance.duration_secs(),
            "capture finalized"
        );
        captured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: Duration = Duration::from_millis(32);

    fn frame() -> AudioFrame {
        AudioFrame::mono(vec![0.0; FRAME_SAMPLES])
    }

    fn at(i: u32) -> Duration {
        FRAME * i
    }

    #[test]
    fn test_starts_in_idle() {
        let gate = SpeechGate::new(GateParams::default());
        assert_eq!(gate.state(), GateState::Idle);
    }

    #[test]
    fn test_quiet_frames_stay_listening() {
        let mut gate = SpeechGate::new(GateParams::default());
        gate.start();

        for i in 0..50 {
            assert_eq!(gate.advance(frame(), 0.1, at(i)), Step::Continue);
        }
        assert_eq!(gate.state(), GateState::Listening);
        assert!(gate.finish(GateStop::MaxDuration).utterance.is_empty());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut gate = SpeechGate::new(GateParams::default());
        gate.start();

        gate.advance(frame(), 0.5, at(0));
        assert_eq!(gate.state(), GateState::Listening);

        gate.advance(frame(), 0.51, at(1));
        assert_eq!(gate.state(), GateState::Speaking);
    }

    #[test]
    fn test_resumed_speech_resets_silence() {
        let mut gate = SpeechGate::new(GateParams::default());
        gate.start();

        for i in 0..5 {
            gate.advance(frame(), 0.9, at(i));
        }
        for i in 5..15 {
            gate.advance(frame(), 0.1, at(i));
        }
        assert_eq!(gate.state(), GateState::TrailingSilence);
        assert_eq!(gate.silence_run(), 10);

        gate.advance(frame(), 0.9, at(15));
        assert_eq!(gate.state(), GateState::Speaking);
        assert_eq!(gate.silence_run(), 0);
    }

    #[test]
    fn test_progress_callback_fires() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let mut gate = SpeechGate::new(GateParams::default()).with_progress(move |_| {
            seen.fetch_add(1, Ordering::Relaxed);
        });
        gate.start();

        for i in 0..40 {
            gate.advance(frame(), 0.0, at(i));
        }
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }
}
