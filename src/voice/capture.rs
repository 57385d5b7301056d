//! Audio capture from microphone
//!
//! Two modes: [`FrameSource::record`] blocks for a fixed duration and returns
//! one buffer, [`FrameSource::open`] streams fixed-size frames through a
//! bounded queue that keeps the newest frames when the consumer falls behind.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tokio_util::sync::CancellationToken;

use super::frame::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};
use crate::{Error, Result};

/// Frames buffered between the audio callback and the gate (~2s at 512/16kHz)
pub const DEFAULT_QUEUE_FRAMES: usize = 64;

/// Slice length for cancellable waits
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Microphone stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub queue_frames: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: 1,
            frame_size: FRAME_SAMPLES,
            queue_frames: DEFAULT_QUEUE_FRAMES,
        }
    }
}

/// Result of waiting for the next frame
#[derive(Debug)]
pub enum NextFrame {
    /// A full frame in production order
    Frame(AudioFrame),
    /// Nothing arrived within the timeout
    Timeout,
}

/// Anything the speech gate can pull frames from
pub trait FramePuller {
    /// Wait up to `timeout` for the next frame
    ///
    /// # Errors
    ///
    /// Returns error if the device failed or the stream closed
    fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame>;
}

/// Producer half of the frame queue, owned by the audio callback
pub struct FrameProducer {
    tx: Sender<AudioFrame>,
    overflow: Receiver<AudioFrame>,
    errors: Sender<String>,
    pending: Vec<f32>,
    frame_size: usize,
    sample_rate: u32,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

impl FrameProducer {
    /// Push interleaved samples straight from the device
    ///
    /// Channels are averaged to mono and re-chunked into frames of exactly
    /// `frame_size` samples; a partial tail waits for the next call.
    pub fn push_interleaved(&mut self, data: &[f32]) {
        if self.channels <= 1 {
            self.pending.extend_from_slice(data);
        } else {
            #[allow(clippy::cast_precision_loss)]
            let scale = 1.0 / self.channels as f32;
            self.pending.extend(
                data.chunks(self.channels)
                    .map(|c| c.iter().sum::<f32>() * scale),
            );
        }

        while self.pending.len() >= self.frame_size {
            let samples: Vec<f32> = self.pending.drain(..self.frame_size).collect();
            self.offer(AudioFrame::new(samples, self.sample_rate, 1));
        }
    }

    /// Handle for forwarding device errors to the consumer
    #[must_use]
    pub fn error_sender(&self) -> Sender<String> {
        self.errors.clone()
    }

    fn offer(&self, frame: AudioFrame) {
        match self.tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(frame)) => {
                // Drop oldest, keep newest
                if self.overflow.try_recv().is_ok() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                if self.tx.try_send(frame).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

/// Consumer half of the frame queue
///
/// Holds the device stream (if any) so the OS handle is released when this
/// is dropped, on every exit path.
pub struct FrameStream {
    rx: Receiver<AudioFrame>,
    errors: Receiver<String>,
    dropped: Arc<AtomicU64>,
    stream: Option<Stream>,
}

impl FrameStream {
    /// Create a detached producer/consumer pair with no device attached
    #[must_use]
    pub fn channel(config: &CaptureConfig) -> (FrameProducer, Self) {
        let (tx, rx) = crossbeam_channel::bounded(config.queue_frames.max(1));
        let (err_tx, err_rx) = crossbeam_channel::unbounded();
        let dropped = Arc::new(AtomicU64::new(0));

        let producer = FrameProducer {
            tx,
            overflow: rx.clone(),
            errors: err_tx,
            pending: Vec::with_capacity(config.frame_size * 2),
            frame_size: config.frame_size.max(1),
            sample_rate: config.sample_rate,
            channels: usize::from(config.channels.max(1)),
            dropped: Arc::clone(&dropped),
        };

        let stream = Self {
            rx,
            errors: err_rx,
            dropped,
            stream: None,
        };

        (producer, stream)
    }

    /// Frames dropped so far because the queue was full
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FramePuller for FrameStream {
    fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame> {
        if let Ok(err) = self.errors.try_recv() {
            return Err(Error::Audio(err));
        }

        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(NextFrame::Frame(frame)),
            Err(RecvTimeoutError::Timeout) => match self.errors.try_recv() {
                Ok(err) => Err(Error::Audio(err)),
                Err(_) => Ok(NextFrame::Timeout),
            },
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Audio("audio stream closed".to_string()))
            }
        }
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!(dropped_frames = self.dropped_frames(), "audio stream closed");
        }
    }
}

/// Opens microphone streams with a fixed configuration
#[derive(Debug, Clone)]
pub struct FrameSource {
    config: CaptureConfig,
    stream_config: StreamConfig,
}

impl FrameSource {
    /// Check the default input device supports `config`
    ///
    /// # Errors
    ///
    /// Returns error if no input device or no matching stream config exists
    pub fn new(config: CaptureConfig) -> Result<Self> {
        let stream_config = input_stream_config(config.sample_rate, config.channels)?;
        Ok(Self {
            config,
            stream_config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Start a streaming capture
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started
    pub fn open(&self) -> Result<FrameStream> {
        let device = default_input_device()?;
        let (mut producer, mut frames) = FrameStream::channel(&self.config);
        let errors = producer.error_sender();

        let stream = device
            .build_input_stream(
                &self.stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    producer.push_interleaved(data);
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    let _ = errors.send(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        frames.stream = Some(stream);

        tracing::debug!(
            sample_rate = self.config.sample_rate,
            frame_size = self.config.frame_size,
            "audio stream opened"
        );
        Ok(frames)
    }

    /// Record for a fixed duration and return mono samples
    ///
    /// Record for `duration`, or until `cancel` fires
    ///
    /// Returns the samples and whether the full duration elapsed.
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn record(&self, duration: Duration, cancel: &CancellationToken) -> Result<(Vec<f32>, bool)> {
        let mut capture = AudioCapture::with_config(self.config.sample_rate, self.config.channels)?;
        capture.start()?;
        let completed = wait_cancellable(duration, cancel);
        capture.stop();

        let mut samples = capture.take_buffer();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wanted = (f64::from(self.config.sample_rate) * duration.as_secs_f64()) as usize;
        samples.truncate(wanted);

        tracing::info!(samples = samples.len(), completed, "recording complete");
        Ok((samples, completed))
    }
}

/// Captures audio from the default input device into a shared buffer
pub struct AudioCapture {
    config: StreamConfig,
    sample_rate: u32,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCapture {
    /// Create a capture instance for a given rate and channel count
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn with_config(sample_rate: u32, channels: u16) -> Result<Self> {
        let config = input_stream_config(sample_rate, channels)?;

        Ok(Self {
            config,
            sample_rate,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start capturing audio
    ///
    /// # Errors
    ///
    /// Returns error if capture fails
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let device = default_input_device()?;
        let channels = usize::from(self.config.channels.max(1));

        let stream = device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        if channels == 1 {
                            buf.extend_from_slice(data);
                        } else {
                            #[allow(clippy::cast_precision_loss)]
                            let scale = 1.0 / channels as f32;
                            buf.extend(data.chunks(channels).map(|c| c.iter().sum::<f32>() * scale));
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    /// Get captured audio buffer and clear it
    #[must_use]
    pub fn take_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default()
    }

    /// Get captured audio buffer without clearing
    #[must_use]
    pub fn peek_buffer(&self) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|buf| buf.clone())
            .unwrap_or_default()
    }

    /// Clear the audio buffer
    pub fn clear_buffer(&self) {
        if let Ok(mut buf) = self.buffer.lock() {
            buf.clear();
        }
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sleep for `duration` in short slices; false if `cancel` fired first
pub(crate) fn wait_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(WAIT_SLICE.min(deadline - now));
    }
}

/// Whether a device config can deliver f32 frames at this rate and layout
fn accepts_f32_input(range: &SupportedStreamConfigRange, sample_rate: u32, channels: u16) -> bool {
    range.sample_format() == SampleFormat::F32
        && range.channels() == channels
        && range.min_sample_rate() <= SampleRate(sample_rate)
        && range.max_sample_rate() >= SampleRate(sample_rate)
}

fn default_input_device() -> Result<cpal::Device> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))
}

fn input_stream_config(sample_rate: u32, channels: u16) -> Result<StreamConfig> {
    let device = default_input_device()?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| accepts_f32_input(c, sample_rate, channels))
        .ok_or_else(|| {
            Error::Audio(format!(
                "no f32 input config for {sample_rate} Hz with {channels} channel(s)"
            ))
        })?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio input resolved"
    );

    Ok(config)
}

/// Convert f32 samples to 16-bit mono WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Decode WAV bytes to mono f32 samples and their sample rate
///
/// # Errors
///
/// Returns error if the data is not a readable WAV file
#[allow(clippy::cast_precision_loss)]
pub fn wav_to_samples(wav: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::new(std::io::Cursor::new(wav)).map_err(|e| Error::Audio(e.to_string()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << spec.bits_per_sample.saturating_sub(1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        let scale = 1.0 / channels as f32;
        interleaved
            .chunks(channels)
            .map(|c| c.iter().sum::<f32>() * scale)
            .collect()
    };

    Ok((samples, spec.sample_rate))
}
