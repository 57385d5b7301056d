//! Per-frame speech probability
//!
//! The gate treats the detector as a black box returning a probability in
//! `[0.0, 1.0]`. [`EnergyDetector`] is always available; the Silero model is
//! behind the `silero` feature.

use std::path::Path;

use crate::{Error, Result};

/// Classifies audio frames as speech or not
pub trait SpeechDetector: Send {
    /// Speech probability for one frame of detector-sized samples
    ///
    /// # Errors
    ///
    /// Returns error if inference fails
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32>;

    /// Forget state carried between frames
    fn reset(&mut self) {}
}

/// RMS energy where the probability crosses 0.5
const DEFAULT_ENERGY_MIDPOINT: f32 = 0.02;

/// Energy-based detector
///
/// Maps RMS energy onto a probability with `rms / (rms + midpoint)`, so a
/// frame at the midpoint energy scores exactly 0.5.
#[derive(Debug, Clone, Copy)]
pub struct EnergyDetector {
    midpoint: f32,
}

impl EnergyDetector {
    #[must_use]
    pub const fn new(midpoint: f32) -> Self {
        Self { midpoint }
    }
}

impl Default for EnergyDetector {
    fn default() -> Self {
        Self::new(DEFAULT_ENERGY_MIDPOINT)
    }
}

impl SpeechDetector for EnergyDetector {
    fn speech_probability(&mut self, frame: &[f32]) -> Result<f32> {
        let rms = calculate_rms(frame);
        if rms <= 0.0 {
            return Ok(0.0);
        }
        Ok(rms / (rms + self.midpoint))
    }
}

/// Which detector backs the speech gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Energy,
    Silero,
}

impl DetectorKind {
    /// Construct the detector
    ///
    /// # Errors
    ///
    /// Returns error if the Silero model cannot be loaded or the crate was
    /// built without the `silero` feature
    pub fn build(self, silero_model: &Path) -> Result<Box<dyn SpeechDetector>> {
        match self {
            Self::Energy => Ok(Box::new(EnergyDetector::default())),
            #[cfg(feature = "silero")]
            Self::Silero => Ok(Box::new(SileroDetector::from_path(silero_model)?)),
            #[cfg(not(feature = "silero"))]
            Self::Silero => Err(Error::Config(format!(
                "silero detector requested ({}) but murmur was built without the `silero` feature",
                silero_model.display()
            ))),
        }
    }
}

impl std::str::FromStr for DetectorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "energy" | "rms" => Ok(Self::Energy),
            "silero" => Ok(Self::Silero),
            other => Err(Error::Config(format!(
                "unknown vad detector '{other}' (expected energy or silero)"
            ))),
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Energy => f.write_str("energy"),
            Self::Silero => f.write_str("silero"),
        }
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

#[cfg(feature = "silero")]
pub use silero::SileroDetector;

#[cfg(feature = "silero")]
mod silero {
    use std::path::Path;

    use ndarray::{Array1, Array2, Array3, Ix3};
    use ort::session::Session;
    use ort::value::Tensor;

    use super::SpeechDetector;
    use crate::voice::frame::{FRAME_SAMPLES, SAMPLE_RATE};
    use crate::{Error, Result};

    /// Samples from the previous frame prepended to each input
    const CONTEXT_SAMPLES: usize = 64;

    const INPUT_SIZE: usize = FRAME_SAMPLES + CONTEXT_SAMPLES;

    /// LSTM hidden state size
    const STATE_SIZE: usize = 128;

    /// Silero VAD v5 running on ONNX Runtime
    ///
    /// Expects 512-sample frames at 16kHz.
    pub struct SileroDetector {
        session: Session,
        state: Array3<f32>,
        context: Vec<f32>,
    }

    impl SileroDetector {
        /// Load the model from a local ONNX file
        ///
        /// # Errors
        ///
        /// Returns error if the model cannot be loaded
        pub fn from_path(model_path: &Path) -> Result<Self> {
            let session = Session::builder()
                .and_then(|b| b.with_intra_threads(1))
                .and_then(|b| b.commit_from_file(model_path))
                .map_err(|e| Error::Vad(format!("failed to load {}: {e}", model_path.display())))?;

            tracing::info!(path = %model_path.display(), "silero model loaded");

            Ok(Self {
                session,
                state: Array3::<f32>::zeros((2, 1, STATE_SIZE)),
                context: vec![0.0; CONTEXT_SAMPLES],
            })
        }

        fn infer(&mut self, frame: &[f32]) -> std::result::Result<f32, String> {
            let mut input = Vec::with_capacity(INPUT_SIZE);
            input.extend_from_slice(&self.context);
            input.extend_from_slice(frame);
            self.context
                .copy_from_slice(&frame[FRAME_SAMPLES - CONTEXT_SAMPLES..]);

            let input = Array2::from_shape_vec((1, INPUT_SIZE), input).map_err(|e| e.to_string())?;
            let input = Tensor::from_array(input).map_err(|e| e.to_string())?;
            let state = Tensor::from_array(self.state.clone()).map_err(|e| e.to_string())?;
            let sr = Tensor::from_array(Array1::from_vec(vec![i64::from(SAMPLE_RATE)]))
                .map_err(|e| e.to_string())?;

            let outputs = self
                .session
                .run(ort::inputs![
                    "input" => input,
                    "state" => state,
                    "sr" => sr,
                ])
                .map_err(|e| e.to_string())?;

            let probability = outputs["output"]
                .try_extract_array::<f32>()
                .map_err(|e| e.to_string())?
                .iter()
                .next()
                .copied()
                .unwrap_or(0.0);

            self.state = outputs["stateN"]
                .try_extract_array::<f32>()
                .map_err(|e| e.to_string())?
                .to_owned()
                .into_dimensionality::<Ix3>()
                .map_err(|e| e.to_string())?;

            Ok(probability)
        }
    }

    impl SpeechDetector for SileroDetector {
        fn speech_probability(&mut self, frame: &[f32]) -> Result<f32> {
            if frame.len() != FRAME_SAMPLES {
                return Err(Error::Vad(format!(
                    "expected {FRAME_SAMPLES} samples, got {}",
                    frame.len()
                )));
            }
            self.infer(frame).map_err(Error::Vad)
        }

        fn reset(&mut self) {
            self.state = Array3::<f32>::zeros((2, 1, STATE_SIZE));
            self.context = vec![0.0; CONTEXT_SAMPLES];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_energy_calculation() {
        let silence = vec![0.0f32; 100];
        assert!(calculate_rms(&silence) < 0.001);

        let loud = vec![0.5f32; 100];
        assert!(calculate_rms(&loud) > 0.4);
    }

    #[test]
    fn test_energy_detector_thresholds() {
        let mut detector = EnergyDetector::default();

        assert!(detector.speech_probability(&[0.0; 512]).unwrap() < 0.01);
        assert!(detector.speech_probability(&[0.3; 512]).unwrap() > 0.9);

        let at_midpoint = detector.speech_probability(&[0.02; 512]).unwrap();
        assert!((at_midpoint - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_detector_kind_parsing() {
        assert_eq!("Energy".parse::<DetectorKind>().unwrap(), DetectorKind::Energy);
        assert_eq!("silero".parse::<DetectorKind>().unwrap(), DetectorKind::Silero);
        assert!("webrtc".parse::<DetectorKind>().is_err());
    }

    #[test]
    fn test_energy_kind_builds() {
        let mut detector = DetectorKind::Energy.build(Path::new("unused.onnx")).unwrap();
        assert!(detector.speech_probability(&[0.0; 512]).unwrap() < 0.01);
    }
}
