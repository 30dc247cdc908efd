//! Configuration for the platform workers.
//!
//! Every worker role builds a [`PlatformConfig`] from compiled defaults and
//! then applies environment overrides (`COLLOQUY_*`). Each worker only reads
//! the sections relevant to its role; the broker and topic sections are shared
//! by all four.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Top-level configuration shared by all worker roles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Broker/keystore connection settings.
    pub broker: BrokerConfig,
    /// Bus topic names.
    pub topics: TopicsConfig,
    /// Keystore key prefixes and TTLs.
    pub keys: KeysConfig,
    /// Gateway listener settings.
    pub gateway: GatewayConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Speech-to-text settings.
    pub stt: SttConfig,
    /// Language model settings.
    pub llm: LlmConfig,
    /// Text-to-speech settings.
    pub tts: TtsConfig,
}

impl PlatformConfig {
    /// Build the configuration from defaults plus `COLLOQUY_*` environment
    /// overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        env_string("COLLOQUY_BROKER_URL", &mut self.broker.url);

        env_string("COLLOQUY_TOPIC_AUDIO_IN", &mut self.topics.audio_in);
        env_string("COLLOQUY_TOPIC_TRANSCRIPTS", &mut self.topics.transcripts);
        env_string("COLLOQUY_TOPIC_LLM_TOKENS", &mut self.topics.llm_tokens);
        env_string("COLLOQUY_TOPIC_TOOL_EVENTS", &mut self.topics.tool_events);
        env_string("COLLOQUY_TOPIC_TTS_REQUEST", &mut self.topics.tts_request);
        env_string("COLLOQUY_TOPIC_TTS_CONTROL", &mut self.topics.tts_control);
        env_string("COLLOQUY_TOPIC_BARGE_IN", &mut self.topics.barge_in);
        env_string(
            "COLLOQUY_TOPIC_AUDIO_OUT_PREFIX",
            &mut self.topics.audio_out_prefix,
        );
        env_string(
            "COLLOQUY_TOPIC_CONNECTION_EVENTS",
            &mut self.topics.connection_events,
        );
        env_string("COLLOQUY_TOPIC_TOOL_REQUEST", &mut self.topics.tool_request);
        env_string(
            "COLLOQUY_TOPIC_TOOL_RESPONSE",
            &mut self.topics.tool_response,
        );

        env_string("COLLOQUY_KEY_CONFIG_PREFIX", &mut self.keys.config_prefix);
        env_string("COLLOQUY_KEY_HISTORY_PREFIX", &mut self.keys.history_prefix);
        env_string(
            "COLLOQUY_KEY_TTS_ACTIVE_PREFIX",
            &mut self.keys.tts_active_prefix,
        );
        env_parse(
            "COLLOQUY_CONVERSATION_TTL_S",
            &mut self.keys.conversation_ttl_s,
        );

        env_string("COLLOQUY_GATEWAY_BIND", &mut self.gateway.bind_addr);
        env_opt_string("COLLOQUY_GATEWAY_AUTH_TOKEN", &mut self.gateway.auth_token);

        env_parse("COLLOQUY_VAD_THRESHOLD", &mut self.vad.threshold);
        env_parse(
            "COLLOQUY_VAD_MIN_SILENCE_MS",
            &mut self.vad.min_silence_duration_ms,
        );
        env_parse("COLLOQUY_VAD_SPEECH_PAD_MS", &mut self.vad.speech_pad_ms);
        env_parse(
            "COLLOQUY_VAD_MIN_SPEECH_MS",
            &mut self.vad.min_speech_duration_ms,
        );

        env_string("COLLOQUY_STT_MODEL_PATH", &mut self.stt.model_path);
        env_string("COLLOQUY_STT_LANGUAGE", &mut self.stt.language);
        env_string("COLLOQUY_STT_DEVICE", &mut self.stt.device);
        env_string("COLLOQUY_STT_COMPUTE_TYPE", &mut self.stt.compute_type);
        env_parse(
            "COLLOQUY_STT_PARTIAL_INTERVAL_MS",
            &mut self.stt.partial_interval_ms,
        );
        env_parse(
            "COLLOQUY_STT_INACTIVITY_TIMEOUT_S",
            &mut self.stt.processor_inactivity_timeout_s,
        );

        env_string("COLLOQUY_LLM_API_URL", &mut self.llm.api_url);
        env_string("COLLOQUY_LLM_API_KEY", &mut self.llm.api_key);
        env_string("COLLOQUY_LLM_MODEL", &mut self.llm.model);
        env_parse("COLLOQUY_LLM_TEMPERATURE", &mut self.llm.temperature);
        env_parse("COLLOQUY_LLM_MAX_TOKENS", &mut self.llm.max_tokens);
        env_parse(
            "COLLOQUY_LLM_MAX_HISTORY_TURNS",
            &mut self.llm.max_history_turns,
        );
        env_string("COLLOQUY_LLM_SYSTEM_PROMPT", &mut self.llm.system_prompt);
        env_opt_string("COLLOQUY_TTS_DEFAULT_VOICE", &mut self.llm.default_voice_id);

        if let Ok(raw) = std::env::var("COLLOQUY_TTS_PROVIDER") {
            match raw.parse() {
                Ok(provider) => self.tts.provider = provider,
                Err(()) => tracing::warn!("ignoring unknown TTS provider '{raw}'"),
            }
        }
        env_string("COLLOQUY_PIPER_EXECUTABLE", &mut self.tts.piper.executable_path);
        env_string("COLLOQUY_PIPER_VOICES_DIR", &mut self.tts.piper.voices_dir);
        env_string(
            "COLLOQUY_PIPER_DEFAULT_VOICE",
            &mut self.tts.piper.default_voice,
        );
        env_parse(
            "COLLOQUY_PIPER_NATIVE_SAMPLE_RATE",
            &mut self.tts.piper.native_sample_rate,
        );
        env_string(
            "COLLOQUY_ELEVENLABS_API_KEY",
            &mut self.tts.elevenlabs.api_key,
        );
        env_string(
            "COLLOQUY_ELEVENLABS_BASE_URL",
            &mut self.tts.elevenlabs.base_url,
        );
        env_string(
            "COLLOQUY_ELEVENLABS_DEFAULT_VOICE",
            &mut self.tts.elevenlabs.default_voice_id,
        );
        env_parse("COLLOQUY_TTS_SAMPLE_RATE", &mut self.tts.sample_rate);
        env_parse("COLLOQUY_TTS_IDLE_SHUTDOWN_S", &mut self.tts.idle_shutdown_s);
    }
}

/// Broker/keystore connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Redis connection URL (credentials go in the URL).
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_owned(),
        }
    }
}

/// Bus topic names. The listed values are defaults; every name is
/// configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// Inbound client audio frames (binary: uuid + PCM).
    pub audio_in: String,
    /// Partial/final transcript events.
    pub transcripts: String,
    /// Assistant token deltas.
    pub llm_tokens: String,
    /// Tool status transitions.
    pub tool_events: String,
    /// Sentence-sized synthesis requests.
    pub tts_request: String,
    /// TTS control commands (stop).
    pub tts_control: String,
    /// Barge-in notifications.
    pub barge_in: String,
    /// Per-conversation synthesized audio; the conversation id is appended.
    pub audio_out_prefix: String,
    /// Gateway connection lifecycle events.
    pub connection_events: String,
    /// Client-side tool invocation requests.
    pub tool_request: String,
    /// Client-side tool invocation responses.
    pub tool_response: String,
}

impl TopicsConfig {
    /// Full output topic name for one conversation.
    pub fn audio_out(&self, conversation_id: uuid::Uuid) -> String {
        format!("{}{}", self.audio_out_prefix, conversation_id)
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            audio_in: "audio.in".to_owned(),
            transcripts: "transcripts".to_owned(),
            llm_tokens: "llm.tokens".to_owned(),
            tool_events: "tool.events".to_owned(),
            tts_request: "tts.request".to_owned(),
            tts_control: "tts.control".to_owned(),
            barge_in: "barge_in".to_owned(),
            audio_out_prefix: "audio.out.".to_owned(),
            connection_events: "connection.events".to_owned(),
            tool_request: "tool.request".to_owned(),
            tool_response: "tool.response".to_owned(),
        }
    }
}

/// Keystore key prefixes and conversation data TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Per-conversation config overrides (no TTL).
    pub config_prefix: String,
    /// Conversation history blobs (conversation TTL).
    pub history_prefix: String,
    /// TTS-active sentinel flags (short TTL, owned by the TTS worker).
    pub tts_active_prefix: String,
    /// TTL for conversation history, in seconds.
    pub conversation_ttl_s: u64,
}

impl KeysConfig {
    pub fn config_key(&self, conversation_id: uuid::Uuid) -> String {
        format!("{}{}", self.config_prefix, conversation_id)
    }

    pub fn history_key(&self, conversation_id: uuid::Uuid) -> String {
        format!("{}{}", self.history_prefix, conversation_id)
    }

    pub fn tts_active_key(&self, conversation_id: uuid::Uuid) -> String {
        format!("{}{}", self.tts_active_prefix, conversation_id)
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            config_prefix: "conversation_config:".to_owned(),
            history_prefix: "conversation_history:".to_owned(),
            tts_active_prefix: "tts_active_state:".to_owned(),
            conversation_ttl_s: 86_400,
        }
    }
}

/// Gateway listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address for the WebSocket + admin listener.
    pub bind_addr: String,
    /// Static bearer token for admission. `None` disables the check.
    pub auth_token: Option<String>,
    /// Grace period for sibling session tasks after one unit terminates.
    pub shutdown_grace_ms: u64,
    /// Transient broker error retries per forwarder before the session dies.
    pub forwarder_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".to_owned(),
            auth_token: None,
            shutdown_grace_ms: 2_000,
            forwarder_retries: 3,
        }
    }
}

/// Voice activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech classification per window.
    ///
    /// Values for f32 samples in \[-1, 1\]:
    ///   - 0.005: very sensitive (picks up quiet speech and some noise)
    ///   - 0.015: normal sensitivity (default)
    ///   - 0.03:  reduced sensitivity (noisy rooms)
    pub threshold: f32,
    /// Fixed VAD window size in samples (512 @ 16 kHz = 32 ms).
    pub window_samples: usize,
    /// Trailing silence (ms) that ends a speech segment.
    pub min_silence_duration_ms: u32,
    /// Pre-roll kept before the trigger so the onset isn't clipped (ms).
    pub speech_pad_ms: u32,
    /// Minimum voiced audio (ms) for an utterance to count as proper speech.
    pub min_speech_duration_ms: u32,
    /// Expected input sample rate in Hz.
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.015,
            window_samples: 512,
            min_silence_duration_ms: 2_500,
            speech_pad_ms: 150,
            min_speech_duration_ms: 750,
            sample_rate: 16_000,
        }
    }
}

/// Speech-to-text settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Path to the ASR model on disk (GGML file for the whisper engine).
    pub model_path: String,
    /// Transcription language hint.
    pub language: String,
    /// Device for local inference ("cpu", "cuda").
    pub device: String,
    /// Compute type for local inference ("int8", "float16").
    pub compute_type: String,
    /// Minimum interval between partial transcripts (ms); 0 disables partials.
    pub partial_interval_ms: u64,
    /// Idle seconds before a conversation's processor is disposed.
    pub processor_inactivity_timeout_s: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            language: "fr".to_owned(),
            device: "cpu".to_owned(),
            compute_type: "int8".to_owned(),
            partial_interval_ms: 300,
            processor_inactivity_timeout_s: 120,
        }
    }
}

/// Language model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible chat completions server.
    pub api_url: String,
    /// Bearer token for the API; empty for local servers.
    pub api_key: String,
    /// Default model name; per-conversation config may override.
    pub model: String,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Default response token cap.
    pub max_tokens: u32,
    /// Turns of history kept (user + assistant pairs), system prompt excluded.
    pub max_history_turns: usize,
    /// System prompt seeded into every new conversation.
    pub system_prompt: String,
    /// Maximum tool-call iterations per assistant turn.
    pub max_tool_recursion: u32,
    /// Hard timeout for client-routed tool calls, in seconds.
    pub tool_timeout_s: u64,
    /// Default TTS voice attached to synthesis requests.
    pub default_voice_id: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:11434/v1".to_owned(),
            api_key: String::new(),
            model: "gemma3".to_owned(),
            temperature: 0.7,
            max_tokens: 1_000,
            max_history_turns: 10,
            system_prompt: "You are a helpful voice assistant. Keep answers short \
                            and conversational, and never produce Markdown or HTML."
                .to_owned(),
            max_tool_recursion: 5,
            tool_timeout_s: 30,
            default_voice_id: None,
        }
    }
}

/// Which synthesis backend the TTS worker runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsProvider {
    /// Local Piper subprocess, raw PCM on stdout.
    #[default]
    Piper,
    /// ElevenLabs streaming HTTP API.
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "piper" => Ok(Self::Piper),
            "elevenlabs" => Ok(Self::ElevenLabs),
            _ => Err(()),
        }
    }
}

/// Piper backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PiperConfig {
    /// Path to the piper executable.
    pub executable_path: String,
    /// Directory holding `.onnx` voice models.
    pub voices_dir: String,
    /// Voice model used when a request carries no voice id.
    pub default_voice: String,
    /// Sample rate Piper produces natively.
    pub native_sample_rate: u32,
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            executable_path: "piper".to_owned(),
            voices_dir: "voices".to_owned(),
            default_voice: "fr_FR-siwis-medium.onnx".to_owned(),
            native_sample_rate: 22_050,
        }
    }
}

/// ElevenLabs backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsConfig {
    /// API key. Required when this provider is selected.
    pub api_key: String,
    /// API base URL; overridable for tests.
    pub base_url: String,
    /// Voice used when a request carries no voice id.
    pub default_voice_id: String,
    /// Model id sent with every synthesis request.
    pub model_id: String,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.elevenlabs.io".to_owned(),
            default_voice_id: "pNInz6obpgDQGcFmaJgB".to_owned(),
            model_id: "eleven_multilingual_v2".to_owned(),
        }
    }
}

/// Text-to-speech worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Selected synthesis backend.
    pub provider: TtsProvider,
    /// Piper backend settings.
    pub piper: PiperConfig,
    /// ElevenLabs backend settings.
    pub elevenlabs: ElevenLabsConfig,
    /// Output sample rate advertised in stream-start envelopes.
    pub sample_rate: u32,
    /// Output channel count.
    pub channels: u16,
    /// Bytes per output sample (2 = s16le).
    pub sample_width: u16,
    /// Bus chunk size in bytes; synthesized audio is re-chunked to this so the
    /// stop flag acts with bounded latency.
    pub chunk_bytes: usize,
    /// TTL of the TTS-active sentinel, refreshed per queue item.
    pub active_ttl_s: u64,
    /// Idle seconds before a conversation's processor task shuts down.
    pub idle_shutdown_s: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::default(),
            piper: PiperConfig::default(),
            elevenlabs: ElevenLabsConfig::default(),
            sample_rate: 24_000,
            channels: 1,
            sample_width: 2,
            chunk_bytes: 4_096,
            active_ttl_s: 60,
            idle_shutdown_s: 60,
        }
    }
}

fn env_string(key: &str, target: &mut String) {
    if let Ok(value) = std::env::var(key) {
        *target = value;
    }
}

fn env_opt_string(key: &str, target: &mut Option<String>) {
    if let Ok(value) = std::env::var(key)
        && !value.is_empty()
    {
        *target = Some(value);
    }
}

fn env_parse<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("ignoring unparseable value for {key}: '{raw}'"),
        }
    }
}
