//! Voice activity detection using energy-based analysis.
//!
//! The detector is driven with fixed-size windows (512 samples at 16 kHz =
//! 32 ms) and reports a `start`/`end`/`none` decision per window. RMS energy
//! thresholding with silence hangover; a Silero ONNX model can slot in behind
//! the same window contract later.

use crate::config::VadConfig;

/// Per-window state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// No state change in this window.
    None,
    /// Speech began in this window.
    Start,
    /// Trailing silence crossed the dwell; the segment ended here.
    End,
}

/// Full per-window detector output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadOutput {
    /// State transition for this window.
    pub event: VadEvent,
    /// Whether this window was classified as speech.
    pub is_speech: bool,
    /// RMS energy of the window.
    pub rms: f32,
}

/// Streaming voice activity detector.
pub struct StreamingVad {
    threshold: f32,
    in_speech: bool,
    silence_windows: usize,
    silence_windows_threshold: usize,
    window_samples: usize,
}

impl StreamingVad {
    pub fn new(config: &VadConfig) -> Self {
        let window_ms = config.window_samples as u64 * 1_000 / config.sample_rate.max(1) as u64;
        let silence_windows_threshold =
            (config.min_silence_duration_ms as u64).div_ceil(window_ms.max(1)) as usize;
        Self {
            threshold: config.threshold,
            in_speech: false,
            silence_windows: 0,
            silence_windows_threshold,
            window_samples: config.window_samples,
        }
    }

    /// Window size in samples this detector expects.
    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    /// Whether the detector is currently inside a speech segment.
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    /// Classify one fixed-size window.
    pub fn process_window(&mut self, window: &[f32]) -> VadOutput {
        let rms = compute_rms(window);
        let is_speech = rms > self.threshold;

        let event = if is_speech {
            self.silence_windows = 0;
            if self.in_speech {
                VadEvent::None
            } else {
                self.in_speech = true;
                VadEvent::Start
            }
        } else if self.in_speech {
            self.silence_windows += 1;
            if self.silence_windows >= self.silence_windows_threshold {
                self.in_speech = false;
                self.silence_windows = 0;
                VadEvent::End
            } else {
                VadEvent::None
            }
        } else {
            VadEvent::None
        };

        VadOutput {
            event,
            is_speech,
            rms,
        }
    }

    /// Reset to idle, dropping any in-progress segment state.
    pub fn reset(&mut self) {
        self.in_speech = false;
        self.silence_windows = 0;
    }
}

/// Effective energy threshold after applying a conversation's
/// `vad_aggressiveness` override (0 = most sensitive, 3 = least).
pub fn threshold_for(config: &VadConfig, aggressiveness: Option<u8>) -> f32 {
    match aggressiveness {
        Some(0) => config.threshold * 0.5,
        Some(2) => config.threshold * 2.0,
        Some(3) => config.threshold * 4.0,
        // Level 1 and unset both mean the configured baseline.
        _ => config.threshold,
    }
}

/// RMS energy of a sample window.
pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
