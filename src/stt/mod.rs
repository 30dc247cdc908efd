//! Speech-to-text: the ASR operator contract and its local engine.
//!
//! The ASR operator accepts a contiguous mono f32 buffer at 16 kHz and
//! returns timed text entries plus language info. Inference is CPU-bound and
//! synchronous; callers run it on the blocking thread pool so the cooperative
//! scheduler stays responsive to cancellation. One engine is loaded per
//! worker process and shared across conversations.

pub mod processor;
pub mod worker;

use std::sync::Arc;

use crate::config::SttConfig;
use crate::error::Result;

/// One timed entry of recognized text.
#[derive(Debug, Clone, PartialEq)]
pub struct AsrWord {
    pub text: String,
    pub start_s: f32,
    pub end_s: f32,
}

/// Full result of one transcription call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AsrResult {
    pub words: Vec<AsrWord>,
    pub language: Option<String>,
}

impl AsrResult {
    /// Concatenate entries into transcript text with normalized spacing.
    pub fn text(&self) -> String {
        let joined = self
            .words
            .iter()
            .map(|w| w.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        joined.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Black-box ASR operator. Implementations are blocking and thread-safe.
pub trait AsrEngine: Send + Sync {
    /// Transcribe a contiguous mono buffer.
    ///
    /// # Errors
    ///
    /// Returns an ASR error when inference fails; the conversation continues
    /// with an error transcript.
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<AsrResult>;
}

/// Convert raw PCM s16le bytes to f32 samples in \[-1, 1\].
///
/// An odd trailing byte is dropped (a partial sample cannot be decoded).
pub fn pcm_s16le_to_f32(pcm: &[u8]) -> Vec<f32> {
    let usable = pcm.len() - (pcm.len() % 2);
    pcm[..usable]
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32_768.0)
        .collect()
}

/// Build the configured ASR engine.
///
/// # Errors
///
/// Process-fatal config error when no engine is available (missing model file
/// or the crate was built without the `whisper` feature).
pub fn build_engine(config: &SttConfig) -> Result<Arc<dyn AsrEngine>> {
    #[cfg(feature = "whisper")]
    {
        return Ok(Arc::new(whisper::WhisperAsr::load(config)?));
    }
    #[cfg(not(feature = "whisper"))]
    {
        let _ = config;
        Err(crate::error::PlatformError::Config(
            "no ASR engine compiled in; rebuild with `--features whisper`".to_owned(),
        ))
    }
}

#[cfg(feature = "whisper")]
mod whisper {
    //! Local whisper.cpp engine via `whisper-rs`.

    use std::sync::Mutex;

    use tracing::info;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    use super::{AsrEngine, AsrResult, AsrWord};
    use crate::config::SttConfig;
    use crate::error::{PlatformError, Result};

    pub struct WhisperAsr {
        ctx: Mutex<WhisperContext>,
        language: String,
    }

    // SAFETY: WhisperContext is safe to use across threads when access is
    // serialized; the Mutex provides that.
    unsafe impl Send for WhisperAsr {}
    unsafe impl Sync for WhisperAsr {}

    impl WhisperAsr {
        /// Load a GGML whisper model from disk.
        pub fn load(config: &SttConfig) -> Result<Self> {
            if config.model_path.is_empty() {
                return Err(PlatformError::Config(
                    "stt.model_path is required for the whisper engine".to_owned(),
                ));
            }
            if !std::path::Path::new(&config.model_path).exists() {
                return Err(PlatformError::Config(format!(
                    "whisper model not found: {}",
                    config.model_path
                )));
            }
            let ctx = WhisperContext::new_with_params(
                &config.model_path,
                WhisperContextParameters::default(),
            )
            .map_err(|e| PlatformError::Asr(format!("failed to load whisper model: {e}")))?;
            info!(model = %config.model_path, "whisper model loaded");
            Ok(Self {
                ctx: Mutex::new(ctx),
                language: config.language.clone(),
            })
        }
    }

    impl AsrEngine for WhisperAsr {
        fn transcribe(&self, samples: &[f32], _sample_rate: u32) -> Result<AsrResult> {
            let ctx = self
                .ctx
                .lock()
                .map_err(|_| PlatformError::Asr("whisper context poisoned".to_owned()))?;
            let mut state = ctx
                .create_state()
                .map_err(|e| PlatformError::Asr(format!("failed to create state: {e}")))?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(Some(&self.language));
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);

            state
                .full(params, samples)
                .map_err(|e| PlatformError::Asr(format!("inference failed: {e}")))?;

            let segments = state
                .full_n_segments()
                .map_err(|e| PlatformError::Asr(format!("segment count failed: {e}")))?;
            let mut words = Vec::new();
            for i in 0..segments {
                let text = state
                    .full_get_segment_text(i)
                    .map_err(|e| PlatformError::Asr(format!("segment text failed: {e}")))?;
                // Segment timestamps are centiseconds.
                let start_s = state.full_get_segment_t0(i).unwrap_or(0) as f32 / 100.0;
                let end_s = state.full_get_segment_t1(i).unwrap_or(0) as f32 / 100.0;
                words.push(AsrWord {
                    text: text.trim().to_owned(),
                    start_s,
                    end_s,
                });
            }

            Ok(AsrResult {
                words,
                language: Some(self.language.clone()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_conversion_scales_and_truncates() {
        // i16::MIN, 0, i16::MAX and one stray byte.
        let pcm = [0x00, 0x80, 0x00, 0x00, 0xFF, 0x7F, 0x42];
        let samples = pcm_s16le_to_f32(&pcm);
        assert_eq!(samples.len(), 3);
        assert!((samples[0] + 1.0).abs() < 1e-6);
        assert_eq!(samples[1], 0.0);
        assert!((samples[2] - (32_767.0 / 32_768.0)).abs() < 1e-6);
    }

    #[test]
    fn result_text_joins_and_normalizes() {
        let result = AsrResult {
            words: vec![
                AsrWord {
                    text: " bonjour".to_owned(),
                    start_s: 0.0,
                    end_s: 0.4,
                },
                AsrWord {
                    text: "".to_owned(),
                    start_s: 0.4,
                    end_s: 0.4,
                },
                AsrWord {
                    text: "tout  le monde ".to_owned(),
                    start_s: 0.5,
                    end_s: 1.1,
                },
            ],
            language: Some("fr".to_owned()),
        };
        assert_eq!(result.text(), "bonjour tout le monde");
    }
}
