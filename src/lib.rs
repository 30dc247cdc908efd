//! Colloquy: real-time bidirectional spoken-dialog platform.
//!
//! A client streams microphone audio over a persistent WebSocket; the platform
//! returns live partial/final transcripts, streaming assistant tokens, tool
//! execution status and synthesized speech, all correlated by conversation id.
//!
//! # Architecture
//!
//! Four worker roles share a pub/sub broker and a TTL'd key-value store:
//! - **Gateway**: terminates the client duplex channel and bridges it to the bus
//! - **VAD/STT worker**: segments speech, emits transcripts, raises barge-in
//! - **Orchestrator**: conversation history + streaming LLM generation + tools
//! - **TTS worker**: per-conversation serialized synthesis queues
//!
//! Each role is independently runnable (`src/bin/`) and horizontally scalable;
//! conversation affinity is carried by the conversation id on every payload.

pub mod bus;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod history;
pub mod messages;
pub mod orchestrator;
pub mod stt;
pub mod tts;
pub mod vad;

pub use config::PlatformConfig;
pub use error::{PlatformError, Result};
