//! Streaming client for OpenAI-compatible chat completions servers.
//!
//! Supports any server implementing the chat completions API with SSE
//! streaming (Ollama, vLLM, llama.cpp server, hosted providers). A single
//! generation yields token deltas and/or fully assembled tool calls; tool
//! call fragments arrive spread over many deltas and are assembled by index
//! until the stream signals a terminal `finish_reason`.

use std::collections::BTreeMap;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::{PlatformError, Result};
use crate::history::{ChatMessage, ToolCall};

/// One element of a generation stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    /// Assistant text delta.
    Token(String),
    /// A fully assembled tool call.
    ToolCall(ToolCall),
}

/// Effective sampling parameters for one generation (defaults merged with
/// per-conversation overrides).
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Streaming LLM client; cheap to clone, holds a connection pool.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Start a streaming generation.
    ///
    /// Returns a channel of events; the stream task ends it after the final
    /// delta or on error. Dropping the receiver aborts the HTTP stream, which
    /// is how cancellation propagates to the provider.
    ///
    /// # Errors
    ///
    /// Returns an LLM error when the request cannot be built or sent.
    pub async fn stream_generation(
        &self,
        history: &[ChatMessage],
        tools: &[Value],
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
        let mut body = serde_json::json!({
            "model": params.model,
            "messages": history,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
            body["tool_choice"] = Value::String("auto".to_owned());
        }

        let url = format!(
            "{}/chat/completions",
            self.config.api_url.trim_end_matches('/')
        );
        let mut request = self.http.post(&url).json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PlatformError::Llm(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PlatformError::Llm(format!(
                "provider returned {status}: {detail}"
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = SseLineBuffer::default();
            let mut assembler = ToolCallAssembler::default();

            'stream: while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(PlatformError::Llm(format!("stream failed: {e}"))))
                            .await;
                        return;
                    }
                };
                for data in lines.push(&chunk) {
                    if data == "[DONE]" {
                        break 'stream;
                    }
                    let events = match parse_chunk(&data, &mut assembler) {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("skipping malformed stream chunk: {e}");
                            continue;
                        }
                    };
                    for event in events {
                        if tx.send(Ok(event)).await.is_err() {
                            // Receiver dropped: generation was cancelled.
                            debug!("generation receiver dropped; aborting stream");
                            return;
                        }
                    }
                }
            }

            // Providers that close the stream without a terminal finish_reason
            // still owe us any fully assembled calls.
            for call in assembler.flush() {
                if tx.send(Ok(LlmEvent::ToolCall(call))).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Merged generation parameters for one conversation.
    pub fn params_with_overrides(
        &self,
        model: Option<&str>,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> GenerationParams {
        GenerationParams {
            model: model.unwrap_or(&self.config.model).to_owned(),
            temperature: temperature.unwrap_or(self.config.temperature),
            max_tokens: max_tokens.unwrap_or(self.config.max_tokens),
        }
    }
}

/// Parse one SSE `data:` payload into stream events.
fn parse_chunk(data: &str, assembler: &mut ToolCallAssembler) -> Result<Vec<LlmEvent>> {
    let chunk: Value = serde_json::from_str(data)?;
    let Some(choice) = chunk["choices"].get(0) else {
        return Ok(Vec::new());
    };

    let mut events = Vec::new();
    let delta = &choice["delta"];

    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        for tc in tool_calls {
            assembler.apply(tc);
        }
    }

    // Terminal states flush whatever calls are fully assembled; text that
    // follows a tool_calls finish still arrives as ordinary deltas.
    if matches!(
        choice["finish_reason"].as_str(),
        Some("tool_calls" | "stop" | "length")
    ) {
        events.extend(assembler.flush().into_iter().map(LlmEvent::ToolCall));
    }

    if let Some(content) = delta["content"].as_str()
        && !content.is_empty()
    {
        events.push(LlmEvent::Token(content.to_owned()));
    }

    Ok(events)
}

/// Splits an SSE byte stream into complete `data:` payloads.
#[derive(Default)]
struct SseLineBuffer {
    partial: String,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let line = self.partial[..pos].trim_end_matches('\r').to_owned();
            self.partial.drain(..=pos);
            if let Some(data) = line.strip_prefix("data: ") {
                out.push(data.to_owned());
            } else if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_owned());
            }
        }
        out
    }
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Assembles tool-call fragments spread over stream deltas, keyed by index.
#[derive(Default)]
struct ToolCallAssembler {
    partial: BTreeMap<u64, PartialCall>,
}

impl ToolCallAssembler {
    fn apply(&mut self, delta: &Value) {
        let index = delta["index"].as_u64().unwrap_or(0);
        let entry = self.partial.entry(index).or_default();
        if let Some(id) = delta["id"].as_str() {
            entry.id = Some(id.to_owned());
        }
        if let Some(name) = delta["function"]["name"].as_str() {
            entry.name = Some(name.to_owned());
        }
        if let Some(arguments) = delta["function"]["arguments"].as_str() {
            entry.arguments.push_str(arguments);
        }
    }

    /// Drain every call that has both an id and a name, in index order.
    fn flush(&mut self) -> Vec<ToolCall> {
        let partial = std::mem::take(&mut self.partial);
        let mut calls = Vec::new();
        for (_, entry) in partial {
            match (entry.id, entry.name) {
                (Some(id), Some(name)) => {
                    // Arguments that aren't valid JSON are forwarded verbatim;
                    // the executor reports the parse problem to the model.
                    if serde_json::from_str::<Value>(&entry.arguments).is_err() {
                        warn!(
                            "tool call {id} ({name}) arguments are not valid JSON; forwarding raw"
                        );
                    }
                    calls.push(ToolCall::function(id, name, entry.arguments));
                }
                (id, name) => {
                    warn!("dropping incomplete tool call fragment (id={id:?}, name={name:?})");
                }
            }
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(lines: &[&str]) -> Vec<String> {
        let mut buffer = SseLineBuffer::default();
        let joined = lines.join("\n") + "\n";
        buffer.push(joined.as_bytes())
    }

    #[test]
    fn sse_buffer_handles_split_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let out = buffer.push(b":1}\n\ndata: [DONE]\n");
        assert_eq!(out, vec![r#"{"a":1}"#.to_owned(), "[DONE]".to_owned()]);
    }

    #[test]
    fn sse_buffer_ignores_non_data_lines() {
        let out = sse(&["event: ping", ": keep-alive", "data: {\"x\":1}"]);
        assert_eq!(out, vec![r#"{"x":1}"#.to_owned()]);
    }

    #[test]
    fn token_deltas_parse() {
        let mut assembler = ToolCallAssembler::default();
        let events = parse_chunk(
            r#"{"choices":[{"delta":{"content":"Bonjour"},"finish_reason":null}]}"#,
            &mut assembler,
        )
        .unwrap();
        assert_eq!(events, vec![LlmEvent::Token("Bonjour".to_owned())]);
    }

    #[test]
    fn tool_call_assembles_across_deltas() {
        let mut assembler = ToolCallAssembler::default();

        let chunks = [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_weather","arguments":""}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"location\":"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"Paris\"}"}}]},"finish_reason":null}]}"#,
        ];
        for chunk in &chunks[..] {
            assert!(parse_chunk(chunk, &mut assembler).unwrap().is_empty());
        }

        let events = parse_chunk(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            &mut assembler,
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            LlmEvent::ToolCall(call) => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.function.name, "get_weather");
                assert_eq!(call.function.arguments, r#"{"location":"Paris"}"#);
            }
            other => panic!("expected tool call, got {other:?}"),
        }

        // Flushed calls are not yielded twice by a later terminal chunk.
        let events = parse_chunk(
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            &mut assembler,
        )
        .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn parallel_tool_calls_flush_in_index_order() {
        let mut assembler = ToolCallAssembler::default();
        for chunk in [
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"b","arguments":"{}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"a","arguments":"{}"}}]},"finish_reason":null}]}"#,
        ] {
            assert!(parse_chunk(chunk, &mut assembler).unwrap().is_empty());
        }
        let calls = assembler.flush();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn non_json_arguments_are_forwarded_verbatim() {
        let mut assembler = ToolCallAssembler::default();
        assembler.apply(&serde_json::json!({
            "index": 0, "id": "call_1",
            "function": {"name": "echo", "arguments": "not json"}
        }));
        let calls = assembler.flush();
        assert_eq!(calls[0].function.arguments, "not json");
    }
}
