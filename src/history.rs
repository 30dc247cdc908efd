//! Conversation history: the message model and its keystore persistence.
//!
//! History lives as one JSON blob under `conversation_history:{id}` so every
//! worker can read it, but all writes are mediated by the orchestrator (one
//! turn at a time per conversation). Entries are immutable once appended;
//! trimming drops the oldest non-system entries, never reorders.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::KeyValueStore;
use crate::config::KeysConfig;
use crate::error::Result;

/// Role of a history entry, in the chat-completations wire vocabulary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the assistant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: ToolFunction,
}

/// Function name plus JSON-encoded arguments (verbatim from the LLM).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFunction {
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    pub fn function(id: String, name: String, arguments: String) -> Self {
        Self {
            id,
            call_type: "function".to_owned(),
            function: ToolFunction { name, arguments },
        }
    }
}

/// One entry in conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message; `content` is `None` for tool-call-only turns.
    pub fn assistant(content: Option<String>, tool_calls: Option<Vec<ToolCall>>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Result of one tool call, correlated by `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content_json: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content_json.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }
}

/// Keystore-backed history access with the conversation TTL.
#[derive(Clone)]
pub struct HistoryStore {
    kv: Arc<dyn KeyValueStore>,
    keys: KeysConfig,
}

impl HistoryStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, keys: KeysConfig) -> Self {
        Self { kv, keys }
    }

    /// Load a conversation's history; missing or undecodable blobs yield an
    /// empty history so the conversation can continue.
    pub async fn load(&self, conversation_id: Uuid) -> Result<Vec<ChatMessage>> {
        let key = self.keys.history_key(conversation_id);
        match self.kv.get(&key).await? {
            Some(blob) => match serde_json::from_slice(&blob) {
                Ok(history) => Ok(history),
                Err(e) => {
                    tracing::error!("undecodable history blob for {conversation_id}: {e}");
                    Ok(Vec::new())
                }
            },
            None => Ok(Vec::new()),
        }
    }

    /// Persist the history with the configured conversation TTL.
    pub async fn save(&self, conversation_id: Uuid, history: &[ChatMessage]) -> Result<()> {
        let key = self.keys.history_key(conversation_id);
        let blob = serde_json::to_vec(history)?;
        self.kv
            .set_with_ttl(
                &key,
                Bytes::from(blob),
                Duration::from_secs(self.keys.conversation_ttl_s),
            )
            .await
    }
}

/// Trim history to the newest `max_turns` turns (two entries per turn),
/// always keeping a leading system message. Order is preserved.
pub fn trim_history(history: &mut Vec<ChatMessage>, max_turns: usize) {
    if max_turns == 0 {
        return;
    }
    let max_entries = max_turns * 2;
    let has_system = history
        .first()
        .is_some_and(|m| m.role == ChatRole::System);
    let head = usize::from(has_system);
    let body_len = history.len() - head;
    if body_len > max_entries {
        let drain_end = history.len() - max_entries;
        history.drain(head..drain_end);
    }
}
