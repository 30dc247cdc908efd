//! Tool dispatch: the executor seam and its two implementations.
//!
//! Tool arguments arrive as JSON-encoded strings from the LLM and results go
//! back as JSON strings in `tool`-role messages. Dispatch outcomes are always
//! well-formed: failures come back as `{"error": ...}` content so the model
//! can recover, never as a broken turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{MessageBus, publish_json};
use crate::config::{LlmConfig, TopicsConfig};
use crate::error::Result;
use crate::messages::{ClientToolRequest, ClientToolResponse};

/// Outcome of one tool dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDispatch {
    /// JSON-encoded result content for the tool-role message.
    pub content: String,
    /// Whether the call failed (drives the `failed` status event).
    pub failed: bool,
}

impl ToolDispatch {
    pub fn ok(result: &Value) -> Self {
        Self {
            content: result.to_string(),
            failed: false,
        }
    }

    pub fn error(message: impl AsRef<str>) -> Self {
        Self {
            content: json!({ "error": message.as_ref() }).to_string(),
            failed: true,
        }
    }
}

/// Abstract tool dispatcher used by the turn engine.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute one call; must not panic and must always return a well-formed
    /// outcome.
    async fn dispatch(
        &self,
        call_id: &str,
        name: &str,
        arguments_json: &str,
        conversation_id: Uuid,
    ) -> ToolDispatch;

    /// Tool schemas advertised to the LLM (chat-completions `tools` format).
    fn schemas(&self) -> Vec<Value>;
}

/// Handler signature for in-process tools.
pub type ToolHandler =
    Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

struct BuiltinTool {
    schema: Value,
    handler: ToolHandler,
}

/// Routes calls to in-process handlers, falling back to client-side dispatch
/// over the bus for unregistered names.
pub struct ToolRouter {
    builtin: HashMap<String, BuiltinTool>,
    bus: Arc<dyn MessageBus>,
    topics: TopicsConfig,
    timeout: Duration,
}

impl ToolRouter {
    pub fn new(bus: Arc<dyn MessageBus>, topics: TopicsConfig, llm: &LlmConfig) -> Self {
        Self {
            builtin: HashMap::new(),
            bus,
            topics,
            timeout: Duration::from_secs(llm.tool_timeout_s),
        }
    }

    /// Register an in-process tool. `schema` is the full chat-completions
    /// tool definition (`{"type":"function","function":{...}}`).
    pub fn register(
        &mut self,
        name: impl Into<String>,
        schema: Value,
        handler: ToolHandler,
    ) -> &mut Self {
        self.builtin
            .insert(name.into(), BuiltinTool { schema, handler });
        self
    }

    async fn dispatch_builtin(&self, tool: &BuiltinTool, name: &str, arguments: &str) -> ToolDispatch {
        let parsed: Value = match serde_json::from_str(arguments) {
            Ok(value) => value,
            Err(_) => return ToolDispatch::error("invalid JSON arguments for tool"),
        };
        match (tool.handler)(parsed) {
            Ok(result) => ToolDispatch::ok(&result),
            Err(message) => {
                warn!("builtin tool '{name}' failed: {message}");
                ToolDispatch::error(message)
            }
        }
    }

    /// Route a call to the connected client and wait for the correlated
    /// response, subject to the hard timeout.
    async fn dispatch_client(
        &self,
        call_id: &str,
        name: &str,
        arguments: &str,
        conversation_id: Uuid,
    ) -> Result<ToolDispatch> {
        // Subscribe before publishing so the response cannot race past us.
        let mut responses = self.bus.subscribe(&self.topics.tool_response).await?;

        let request = ClientToolRequest::ToolRequest {
            conversation_id,
            tool_call_id: call_id.to_owned(),
            tool_name: name.to_owned(),
            arguments: arguments.to_owned(),
            timeout_ms: self.timeout.as_millis() as u64,
        };
        publish_json(self.bus.as_ref(), &self.topics.tool_request, &request).await?;
        info!("dispatched client tool '{name}' for {conversation_id} (call {call_id})");

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => {
                    warn!("client tool call {call_id} timed out after {:?}", self.timeout);
                    return Ok(ToolDispatch::error(format!(
                        "client tool call timed out after {} seconds",
                        self.timeout.as_secs()
                    )));
                }
                payload = responses.next() => {
                    let Some(payload) = payload else {
                        return Ok(ToolDispatch::error("tool response channel closed"));
                    };
                    let Ok(ClientToolResponse::ToolResponse {
                        tool_call_id,
                        success,
                        result,
                        error,
                    }) = serde_json::from_slice(&payload)
                    else {
                        continue;
                    };
                    if tool_call_id != call_id {
                        continue;
                    }
                    return Ok(if success {
                        ToolDispatch::ok(&result.unwrap_or(Value::Null))
                    } else {
                        ToolDispatch::error(
                            error.unwrap_or_else(|| "unknown client tool error".to_owned()),
                        )
                    });
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ToolExecutor for ToolRouter {
    async fn dispatch(
        &self,
        call_id: &str,
        name: &str,
        arguments_json: &str,
        conversation_id: Uuid,
    ) -> ToolDispatch {
        if let Some(tool) = self.builtin.get(name) {
            return self.dispatch_builtin(tool, name, arguments_json).await;
        }
        match self
            .dispatch_client(call_id, name, arguments_json, conversation_id)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("client dispatch for '{name}' failed: {e}");
                ToolDispatch::error(format!("failed to execute tool '{name}'"))
            }
        }
    }

    fn schemas(&self) -> Vec<Value> {
        let mut schemas: Vec<Value> = self
            .builtin
            .values()
            .map(|tool| tool.schema.clone())
            .collect();
        // Deterministic order for the provider request body.
        schemas.sort_by_key(|s| s["function"]["name"].as_str().unwrap_or("").to_owned());
        schemas
    }
}

/// Chat-completions schema for a function tool.
pub fn function_schema(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        }
    })
}
