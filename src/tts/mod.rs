//! Text-to-speech backends.
//!
//! One backend is selected at startup; both stream raw audio bytes and honor
//! a stop flag between chunks so barge-in halts synthesis promptly. Piper
//! runs as a local subprocess emitting raw PCM on stdout; ElevenLabs streams
//! PCM over HTTP.

pub mod worker;

use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::config::{TtsConfig, TtsProvider};
use crate::error::{PlatformError, Result};
use crate::messages::AudioEncoding;

/// Stream of synthesized audio bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Output format advertised in `audio_stream_start` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width: Option<u16>,
}

/// The synthesis backend selected by configuration.
pub enum SpeechSynthesizer {
    Piper(PiperBackend),
    ElevenLabs(ElevenLabsBackend),
}

impl SpeechSynthesizer {
    /// Build the configured backend.
    ///
    /// # Errors
    ///
    /// Process-fatal config error when the selected provider is unusable
    /// (missing executable, missing API key).
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        match config.provider {
            TtsProvider::Piper => Ok(Self::Piper(PiperBackend::new(config)?)),
            TtsProvider::ElevenLabs => Ok(Self::ElevenLabs(ElevenLabsBackend::new(config)?)),
        }
    }

    /// Format of the chunks this backend produces.
    pub fn format(&self) -> AudioFormat {
        match self {
            Self::Piper(backend) => backend.format(),
            Self::ElevenLabs(backend) => backend.format(),
        }
    }

    /// Start synthesizing one text item.
    ///
    /// The returned stream yields audio byte chunks; `stop` is checked
    /// between chunks and ends the stream early without error.
    ///
    /// # Errors
    ///
    /// Returns a TTS error when synthesis cannot start (bad voice, provider
    /// rejection); mid-stream failures surface as stream items.
    pub async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
        stop: Arc<AtomicBool>,
    ) -> Result<ByteStream> {
        match self {
            Self::Piper(backend) => backend.synthesize(text, voice_id, stop).await,
            Self::ElevenLabs(backend) => backend.synthesize(text, voice_id, stop).await,
        }
    }
}

/// Local Piper subprocess backend.
pub struct PiperBackend {
    executable: String,
    voices_dir: String,
    default_voice: String,
    format: AudioFormat,
}

impl PiperBackend {
    fn new(config: &TtsConfig) -> Result<Self> {
        Ok(Self {
            executable: config.piper.executable_path.clone(),
            voices_dir: config.piper.voices_dir.clone(),
            default_voice: config.piper.default_voice.clone(),
            // Piper emits PCM at the voice's native rate; the envelope
            // advertises that, not the platform-wide output rate.
            format: AudioFormat {
                encoding: AudioEncoding::PcmS16le,
                sample_rate: config.piper.native_sample_rate,
                channels: config.channels,
                sample_width: Some(config.sample_width),
            },
        })
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn resolve_voice(&self, voice_id: Option<&str>) -> Result<std::path::PathBuf> {
        let selected = voice_id.unwrap_or(&self.default_voice);
        let mut path = if std::path::Path::new(selected).is_absolute() {
            std::path::PathBuf::from(selected)
        } else {
            std::path::Path::new(&self.voices_dir).join(selected)
        };
        if path.extension().is_none_or(|ext| ext != "onnx") {
            path.set_extension("onnx");
        }
        if !path.exists() {
            return Err(PlatformError::Tts(format!(
                "voice model not found: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
        stop: Arc<AtomicBool>,
    ) -> Result<ByteStream> {
        let voice_path = self.resolve_voice(voice_id)?;
        info!(
            "piper synthesizing with {}: \"{}...\"",
            voice_path.display(),
            text.chars().take(40).collect::<String>()
        );

        let mut child = tokio::process::Command::new(&self.executable)
            .arg("--model")
            .arg(&voice_path)
            .arg("--output-raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlatformError::Tts(format!("failed to spawn piper: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| PlatformError::Tts(format!("failed to write piper stdin: {e}")))?;
            // Dropping stdin closes it so piper sees EOF and synthesizes.
        }

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlatformError::Tts("piper stdout unavailable".to_owned()))?;

        let stream = async_stream::try_stream! {
            let mut buf = vec![0u8; 4096];
            loop {
                if stop.load(Ordering::Relaxed) {
                    info!("piper synthesis stopped mid-stream");
                    let _ = child.start_kill();
                    break;
                }
                let n = stdout
                    .read(&mut buf)
                    .await
                    .map_err(|e| PlatformError::Tts(format!("piper read failed: {e}")))?;
                if n == 0 {
                    let status = child
                        .wait()
                        .await
                        .map_err(|e| PlatformError::Tts(format!("piper wait failed: {e}")))?;
                    if !status.success() && !stop.load(Ordering::Relaxed) {
                        Err(PlatformError::Tts(format!("piper exited with {status}")))?;
                    }
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };
        Ok(Box::pin(stream))
    }
}

/// ElevenLabs streaming HTTP backend.
pub struct ElevenLabsBackend {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    default_voice_id: String,
    model_id: String,
    format: AudioFormat,
}

impl ElevenLabsBackend {
    fn new(config: &TtsConfig) -> Result<Self> {
        if config.elevenlabs.api_key.is_empty() {
            return Err(PlatformError::Config(
                "ElevenLabs API key is required for the elevenlabs provider".to_owned(),
            ));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            api_key: config.elevenlabs.api_key.clone(),
            base_url: config.elevenlabs.base_url.clone(),
            default_voice_id: config.elevenlabs.default_voice_id.clone(),
            model_id: config.elevenlabs.model_id.clone(),
            format: AudioFormat {
                encoding: AudioEncoding::PcmS16le,
                sample_rate: config.sample_rate,
                channels: config.channels,
                sample_width: Some(config.sample_width),
            },
        })
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_id: Option<&str>,
        stop: Arc<AtomicBool>,
    ) -> Result<ByteStream> {
        let voice = voice_id.unwrap_or(&self.default_voice_id);
        let url = format!(
            "{}/v1/text-to-speech/{}/stream",
            self.base_url.trim_end_matches('/'),
            voice
        );
        let output_format = format!("pcm_{}", self.format.sample_rate);

        let response = self
            .http
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .query(&[("output_format", output_format.as_str())])
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model_id,
            }))
            .send()
            .await
            .map_err(|e| PlatformError::Tts(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PlatformError::Tts(format!(
                "provider returned {status}: {detail}"
            )));
        }

        let mut body = response.bytes_stream();
        let stream = async_stream::try_stream! {
            while let Some(chunk) = body.next().await {
                if stop.load(Ordering::Relaxed) {
                    warn!("elevenlabs synthesis stopped mid-stream");
                    break;
                }
                let chunk = chunk
                    .map_err(|e| PlatformError::Tts(format!("stream failed: {e}")))?;
                if !chunk.is_empty() {
                    yield chunk;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlatformConfig;

    #[test]
    fn elevenlabs_requires_api_key() {
        let config = PlatformConfig::default().tts;
        assert!(matches!(
            ElevenLabsBackend::new(&config),
            Err(PlatformError::Config(_))
        ));
    }

    #[test]
    fn piper_voice_resolution_appends_extension() {
        let dir = tempfile::tempdir().unwrap();
        let voice = dir.path().join("fr_FR-siwis-medium.onnx");
        std::fs::write(&voice, b"model").unwrap();

        let mut config = PlatformConfig::default().tts;
        config.piper.voices_dir = dir.path().to_string_lossy().into_owned();
        let backend = PiperBackend::new(&config).unwrap();

        let resolved = backend.resolve_voice(Some("fr_FR-siwis-medium")).unwrap();
        assert_eq!(resolved, voice);
        assert!(backend.resolve_voice(Some("missing-voice")).is_err());
    }

    #[test]
    fn formats_declare_pcm() {
        let mut config = PlatformConfig::default().tts;
        config.elevenlabs.api_key = "key".to_owned();
        let backend = ElevenLabsBackend::new(&config).unwrap();
        let format = backend.format();
        assert_eq!(format.encoding, AudioEncoding::PcmS16le);
        assert_eq!(format.sample_rate, 24_000);
        assert_eq!(format.sample_width, Some(2));
    }
}
