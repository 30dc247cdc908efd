//! Wire payloads passed between pipeline stages over the bus, plus the
//! messages forwarded to clients.
//!
//! Every payload carries its conversation id; receivers drop mismatched ids.
//! JSON payloads are internally tagged with a `type` field (`command` for TTS
//! control) so unknown event kinds fail deserialization and can be logged and
//! dropped at the worker boundary. Audio travels as raw binary frames
//! ([`AudioFrame`]), never inside JSON.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PlatformError, Result};
use crate::history::ChatRole;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A chunk of client audio on the bus: 16-byte conversation id followed by
/// raw PCM (16 kHz mono s16le inbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub conversation_id: Uuid,
    pub pcm: Bytes,
}

impl AudioFrame {
    pub fn new(conversation_id: Uuid, pcm: Bytes) -> Self {
        Self {
            conversation_id,
            pcm,
        }
    }

    /// Serialize to the binary bus layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.pcm.len());
        buf.extend_from_slice(self.conversation_id.as_bytes());
        buf.extend_from_slice(&self.pcm);
        buf.freeze()
    }

    /// Parse a frame from the binary bus layout.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::Codec`] when the payload is shorter than the
    /// id prefix.
    pub fn decode(payload: Bytes) -> Result<Self> {
        if payload.len() < 16 {
            return Err(PlatformError::Codec(format!(
                "audio frame too short: {} bytes",
                payload.len()
            )));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&payload[..16]);
        Ok(Self {
            conversation_id: Uuid::from_bytes(id),
            pcm: payload.slice(16..),
        })
    }
}

/// Transcript events on the `transcripts` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    PartialTranscript {
        conversation_id: Uuid,
        transcript: String,
        timestamp_ms: i64,
        is_final: bool,
    },
    FinalTranscript {
        conversation_id: Uuid,
        transcript: String,
        timestamp_ms: i64,
        is_final: bool,
    },
}

impl TranscriptEvent {
    pub fn partial(conversation_id: Uuid, transcript: String, timestamp_ms: i64) -> Self {
        Self::PartialTranscript {
            conversation_id,
            transcript,
            timestamp_ms,
            is_final: false,
        }
    }

    pub fn finalized(conversation_id: Uuid, transcript: String, timestamp_ms: i64) -> Self {
        Self::FinalTranscript {
            conversation_id,
            transcript,
            timestamp_ms,
            is_final: true,
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::PartialTranscript {
                conversation_id, ..
            }
            | Self::FinalTranscript {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn transcript(&self) -> &str {
        match self {
            Self::PartialTranscript { transcript, .. }
            | Self::FinalTranscript { transcript, .. } => transcript,
        }
    }

    pub fn timestamp_ms(&self) -> i64 {
        match self {
            Self::PartialTranscript { timestamp_ms, .. }
            | Self::FinalTranscript { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::FinalTranscript { .. })
    }
}

/// Assistant token delta on the `llm.tokens` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenEvent {
    Token {
        role: ChatRole,
        content: String,
        conversation_id: Uuid,
    },
}

impl TokenEvent {
    pub fn assistant(conversation_id: Uuid, content: String) -> Self {
        Self::Token {
            role: ChatRole::Assistant,
            content,
            conversation_id,
        }
    }
}

/// Tool execution lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Tool status transition on the `tool.events` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolEvent {
    Tool {
        name: String,
        status: ToolStatus,
        conversation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
    },
}

/// One sentence-sized synthesis request on the `tts.request` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TtsRequest {
    pub conversation_id: Uuid,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

/// Commands on the `tts.control` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum TtsControl {
    StopTts { conversation_id: Uuid },
}

/// Barge-in signal on the `barge_in` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BargeInEvent {
    BargeInDetected {
        conversation_id: Uuid,
        timestamp_ms: i64,
    },
}

impl BargeInEvent {
    pub fn now(conversation_id: Uuid) -> Self {
        Self::BargeInDetected {
            conversation_id,
            timestamp_ms: now_ms(),
        }
    }

    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::BargeInDetected {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// Encoding of synthesized audio chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    PcmS16le,
    Mp3,
}

/// Control envelopes framing binary chunks on `audio.out.{conversation_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioStreamEvent {
    AudioStreamStart {
        conversation_id: Uuid,
        format: AudioEncoding,
        sample_rate: u32,
        channels: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sample_width: Option<u16>,
    },
    AudioStreamEnd {
        conversation_id: Uuid,
        chunk_count: u64,
    },
    AudioStreamError {
        conversation_id: Uuid,
        error: String,
    },
}

impl AudioStreamEvent {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::AudioStreamStart {
                conversation_id, ..
            }
            | Self::AudioStreamEnd {
                conversation_id, ..
            }
            | Self::AudioStreamError {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

/// Gateway connection lifecycle events on `connection.events`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    ConnectionDisconnected {
        conversation_id: Uuid,
        reason: String,
    },
}

/// Client-routed tool invocation on the `tool.request` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToolRequest {
    ToolRequest {
        conversation_id: Uuid,
        tool_call_id: String,
        tool_name: String,
        /// JSON-encoded arguments, forwarded verbatim from the LLM.
        arguments: String,
        timeout_ms: u64,
    },
}

/// Client tool result on the `tool.response` topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToolResponse {
    ToolResponse {
        tool_call_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// First message on every client connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    SystemEvent {
        event: String,
        conversation_id: Uuid,
    },
}

impl SystemEvent {
    pub fn conversation_started(conversation_id: Uuid) -> Self {
        Self::SystemEvent {
            event: "conversation_started".to_owned(),
            conversation_id,
        }
    }
}

/// Barge-in notice forwarded to the client by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BargeInNotification {
    BargeInNotification {
        conversation_id: Uuid,
        timestamp_ms: i64,
    },
}
