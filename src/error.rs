//! Error types for the spoken-dialog platform.

/// Top-level error type shared by all worker roles.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Voice activity detection error.
    #[error("VAD error: {0}")]
    Vad(String),

    /// Speech-to-text transcription error.
    #[error("ASR error: {0}")]
    Asr(String),

    /// Language model streaming or protocol error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech synthesis error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Tool dispatch error.
    #[error("tool error: {0}")]
    Tool(String),

    /// Message bus publish/subscribe error.
    #[error("bus error: {0}")]
    Bus(String),

    /// Keystore read/write error.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Gateway session error.
    #[error("gateway error: {0}")]
    Gateway(String),

    /// Malformed wire payload (bus or client).
    #[error("codec error: {0}")]
    Codec(String),

    /// Channel send/receive error between tasks.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for PlatformError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<redis::RedisError> for PlatformError {
    fn from(e: redis::RedisError) -> Self {
        Self::Bus(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PlatformError>;
