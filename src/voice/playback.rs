//! Audio playback to speakers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};

use super::tts::Speech;
use crate::{Error, Result};

/// Plays synthesized speech
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Play to completion
    ///
    /// # Errors
    ///
    /// Returns error if the output device fails
    async fn play(&self, speech: Speech) -> Result<()>;
}

/// Plays audio to the default output device
#[derive(Debug, Default, Clone, Copy)]
pub struct AudioPlayback;

impl AudioPlayback {
    /// Create a new audio playback instance
    ///
    /// # Errors
    ///
    /// Returns error if there is no output device
    pub fn new() -> Result<Self> {
        let device = default_output_device()?;
        tracing::debug!(
            device = device.name().unwrap_or_default(),
            "audio playback initialized"
        );
        Ok(Self)
    }

    /// Play a sine tone, blocking until done
    ///
    /// # Errors
    ///
    /// Returns error if playback fails
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn play_tone_blocking(frequency: f32, seconds: f32, sample_rate: u32) -> Result<()> {
        let count = (sample_rate as f32 * seconds) as usize;
        let samples = (0..count)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                0.3 * (2.0 * std::f32::consts::PI * frequency * t).sin()
            })
            .collect();

        play_blocking(samples, sample_rate)
    }
}

#[async_trait]
impl Speaker for AudioPlayback {
    async fn play(&self, speech: Speech) -> Result<()> {
        let Speech {
            samples,
            sample_rate,
        } = speech;

        tokio::task::spawn_blocking(move || play_blocking(samples, sample_rate))
            .await
            .map_err(|e| Error::Audio(format!("playback task failed: {e}")))?
    }
}

fn default_output_device() -> Result<cpal::Device> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::Audio("no output device available".to_string()))
}

/// Output config running natively at `sample_rate`, mono preferred
fn native_output_config(device: &cpal::Device, sample_rate: u32) -> Option<StreamConfig> {
    let supports = |channels: u16| {
        device
            .supported_output_configs()
            .ok()?
            .find(|c| accepts_f32_output(c, sample_rate, channels))
    };

    supports(1)
        .or_else(|| supports(2))
        .map(|c| c.with_sample_rate(SampleRate(sample_rate)).config())
}

fn accepts_f32_output(range: &SupportedStreamConfigRange, sample_rate: u32, channels: u16) -> bool {
    let rate = SampleRate(sample_rate);
    range.sample_format() == SampleFormat::F32
        && range.channels() == channels
        && range.min_sample_rate() <= rate
        && range.max_sample_rate() >= rate
}

/// Play samples in a blocking manner
fn play_blocking(samples: Vec<f32>, sample_rate: u32) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let device = default_output_device()?;

    let (config, samples) = if let Some(config) = native_output_config(&device, sample_rate) {
        (config, samples)
    } else {
        let default = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        if default.sample_format() != SampleFormat::F32 {
            return Err(Error::Audio(format!(
                "output device has no f32 config (default is {})",
                default.sample_format()
            )));
        }
        let config = default.config();
        tracing::debug!(
            from = sample_rate,
            to = config.sample_rate.0,
            "resampling for playback"
        );
        let resampled = resample_audio(&samples, sample_rate, config.sample_rate.0)?;
        (config, resampled)
    };

    let channels = usize::from(config.channels.max(1));
    let output_rate = config.sample_rate.0;
    let sample_count = samples.len();

    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicBool::new(false));

    let stream = {
        let samples = Arc::clone(&samples);
        let position = Arc::clone(&position);
        let finished = Arc::clone(&finished);

        device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.get(pos).copied().unwrap_or_else(|| {
                            finished.store(true, Ordering::Relaxed);
                            0.0
                        });
                        frame.fill(sample);
                        if pos < samples.len() {
                            pos += 1;
                        }
                    }
                    position.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?
    };

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    // Poll for completion with timeout
    let duration_ms = (sample_count as u64 * 1000) / u64::from(output_rate.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);
    let start = Instant::now();

    while !finished.load(Ordering::Relaxed) {
        if start.elapsed() > timeout {
            tracing::warn!("playback did not finish in time");
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    // Let the device drain its buffer
    std::thread::sleep(Duration::from_millis(100));

    drop(stream);
    tracing::debug!(samples = sample_count, "playback complete");

    Ok(())
}

/// Resample audio using rubato
///
/// The final partial chunk is zero-padded and the output trimmed back to
/// the expected length, so no trailing audio is lost.
///
/// # Errors
///
/// Returns error if the resampler cannot be built
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize + chunk_size);

    for chunk in input.chunks(chunk_size) {
        let mut block = chunk.to_vec();
        block.resize(chunk_size, 0.0);
        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend_from_slice(&result[0]);
    }

    // Flush the resampler delay
    let delay = resampler.output_delay();
    let expected = (samples.len() as f64 * f64::from(to_rate) / f64::from(from_rate)) as usize;
    let end = (delay + expected).min(output.len());
    let start = delay.min(end);

    Ok(output[start..end].iter().map(|&s| s as f32).collect())
}
