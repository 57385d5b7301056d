//! Fixed-size audio frames fed to the speech gate

/// Sample rate for speech capture (16kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples per detector frame (32ms at 16kHz)
pub const FRAME_SAMPLES: usize = 512;

/// A slice of mono audio tagged with its format
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

/// How a frame was brought to the detector length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Already the right length
    Exact,
    /// Zero-padded at the end
    Padded,
    /// Extra samples cut off the end
    Truncated,
}

impl AudioFrame {
    /// Create a frame from samples
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Create a mono 16kHz frame
    #[must_use]
    pub const fn mono(samples: Vec<f32>) -> Self {
        Self::new(samples, SAMPLE_RATE, 1)
    }

    /// Zero-pad or truncate to exactly `len` samples
    pub fn fit_to(&mut self, len: usize) -> Fit {
        match self.samples.len().cmp(&len) {
            std::cmp::Ordering::Equal => Fit::Exact,
            std::cmp::Ordering::Less => {
                self.samples.resize(len, 0.0);
                Fit::Padded
            }
            std::cmp::Ordering::Greater => {
                self.samples.truncate(len);
                Fit::Truncated
            }
        }
    }

    /// Frame samples
    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Consume the frame, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }
}

/// Audio collected between gate-open and gate-close
#[derive(Debug, Clone, Default)]
pub struct Utterance {
    frames: Vec<AudioFrame>,
}

impl Utterance {
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Build an utterance from one continuous buffer
    #[must_use]
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        if samples.is_empty() {
            return Self::new();
        }
        Self {
            frames: vec![AudioFrame::new(samples, sample_rate, 1)],
        }
    }

    pub fn push(&mut self, frame: AudioFrame) {
        self.frames.push(frame);
    }

    /// Collected frames in capture order
    #[must_use]
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    /// Whether no audio was collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.iter().all(AudioFrame::is_empty)
    }

    /// Total number of samples
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(AudioFrame::len).sum()
    }

    /// Sample rate of the collected audio
    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.frames.first().map_or(SAMPLE_RATE, AudioFrame::sample_rate)
    }

    /// Duration in seconds
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration_secs(&self) -> f32 {
        self.sample_count() as f32 / self.sample_rate() as f32
    }

    /// Flatten into one contiguous buffer
    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.sample_count());
        for frame in self.frames {
            out.extend(frame.into_samples());
        }
        out
    }
}
