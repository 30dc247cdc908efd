//! One assistant turn: LLM streaming, tool dispatch, sentence-by-sentence
//! TTS emission and history persistence.
//!
//! Per conversation at most one turn runs at a time; the caller serializes
//! turns behind a per-conversation lock and hands each turn a cancellation
//! token that fires on barge-in or when a newer transcript arrives. The token
//! is checked on every stream event, so no token is published more than one
//! event after cancellation.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{MessageBus, publish_json};
use crate::config::PlatformConfig;
use crate::conversation::ConversationConfigStore;
use crate::error::Result;
use crate::history::{ChatMessage, HistoryStore, ToolCall, trim_history};
use crate::messages::{TokenEvent, ToolEvent, ToolStatus, TtsRequest};
use crate::orchestrator::llm::{LlmClient, LlmEvent};
use crate::orchestrator::segmenter::SentenceSegmenter;
use crate::orchestrator::tools::ToolExecutor;

/// Sentence spoken when the tool-recursion cap is hit.
const TOOL_LIMIT_SENTENCE: &str = "[Tool processing limit reached]";

/// Assistant text substituted when the provider fails mid-turn.
const LLM_ERROR_SENTENCE: &str = "[error] I could not generate a response.";

/// Everything a turn needs, shared across conversations.
pub struct TurnContext {
    pub bus: Arc<dyn MessageBus>,
    pub history: HistoryStore,
    pub conversation_config: ConversationConfigStore,
    pub llm: LlmClient,
    pub tools: Arc<dyn ToolExecutor>,
    pub config: Arc<PlatformConfig>,
}

impl TurnContext {
    async fn send_sentence(&self, conversation_id: Uuid, text: &str, voice_id: &Option<String>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let request = TtsRequest {
            conversation_id,
            text: text.to_owned(),
            voice_id: voice_id.clone(),
            options: None,
        };
        if let Err(e) =
            publish_json(self.bus.as_ref(), &self.config.topics.tts_request, &request).await
        {
            warn!("failed to publish TTS request for {conversation_id}: {e}");
        }
    }

    async fn publish_tool_status(
        &self,
        conversation_id: Uuid,
        call: &ToolCall,
        status: ToolStatus,
        result: Option<serde_json::Value>,
    ) {
        let event = ToolEvent::Tool {
            name: call.function.name.clone(),
            status,
            conversation_id,
            tool_id: Some(call.id.clone()),
            result,
        };
        if let Err(e) =
            publish_json(self.bus.as_ref(), &self.config.topics.tool_events, &event).await
        {
            warn!("failed to publish tool event for {conversation_id}: {e}");
        }
    }
}

/// Conduct one assistant turn for a final transcript.
///
/// Returns after history is persisted; a cancelled turn still persists
/// whatever assistant text was generated before the interruption.
///
/// # Errors
///
/// Returns keystore errors only; provider and tool failures are converted to
/// user-visible turn content.
pub async fn run_turn(
    ctx: &TurnContext,
    conversation_id: Uuid,
    user_text: String,
    cancel: CancellationToken,
) -> Result<()> {
    info!("processing turn for {conversation_id}: \"{user_text}\"");

    let overrides = ctx.conversation_config.load(conversation_id).await?;
    let mut history = ctx.history.load(conversation_id).await?;
    if history.is_empty() {
        history.push(ChatMessage::system(ctx.config.llm.system_prompt.clone()));
    }
    history.push(ChatMessage::user(user_text));
    trim_history(&mut history, ctx.config.llm.max_history_turns);

    let params = ctx.llm.params_with_overrides(
        overrides.llm_model_name.as_deref(),
        overrides.llm_temperature,
        overrides.llm_max_tokens,
    );
    let voice_id = overrides
        .tts_voice_id
        .clone()
        .or_else(|| ctx.config.llm.default_voice_id.clone());
    let schemas = ctx.tools.schemas();

    let mut recursion = 0;
    loop {
        let outcome =
            stream_one_generation(ctx, conversation_id, &history, &schemas, &params, &voice_id, &cancel)
                .await;

        let StreamOutcome {
            content,
            tool_calls,
            interrupted,
            failed,
        } = outcome;

        if interrupted {
            // Partially generated text is still part of the record; nothing
            // more is spoken for this turn. Unanswered tool calls are dropped
            // so the history never carries a call without its result.
            if !content.is_empty() {
                history.push(ChatMessage::assistant(Some(content), None));
            }
            info!("turn for {conversation_id} interrupted");
            break;
        }

        if failed {
            history.push(ChatMessage::assistant(Some(LLM_ERROR_SENTENCE.to_owned()), None));
            break;
        }

        if tool_calls.is_empty() {
            if !content.is_empty() {
                history.push(ChatMessage::assistant(Some(content), None));
            }
            break;
        }

        history.push(ChatMessage::assistant(
            (!content.is_empty()).then_some(content),
            Some(tool_calls.clone()),
        ));

        for call in &tool_calls {
            if cancel.is_cancelled() {
                // Every recorded call still gets a result so the history
                // never carries a call without one.
                history.push(ChatMessage::tool_result(
                    &call.id,
                    &call.function.name,
                    r#"{"error":"cancelled"}"#,
                ));
                continue;
            }
            let outcome = ctx
                .tools
                .dispatch(
                    &call.id,
                    &call.function.name,
                    &call.function.arguments,
                    conversation_id,
                )
                .await;
            let status = if outcome.failed {
                ToolStatus::Failed
            } else {
                ToolStatus::Completed
            };
            let result_value = serde_json::from_str(&outcome.content).ok();
            ctx.publish_tool_status(conversation_id, call, status, result_value)
                .await;
            history.push(ChatMessage::tool_result(
                &call.id,
                &call.function.name,
                outcome.content,
            ));
        }

        if cancel.is_cancelled() {
            break;
        }

        recursion += 1;
        if recursion >= ctx.config.llm.max_tool_recursion {
            warn!("tool recursion cap reached for {conversation_id}");
            ctx.send_sentence(conversation_id, TOOL_LIMIT_SENTENCE, &voice_id)
                .await;
            break;
        }
    }

    trim_history(&mut history, ctx.config.llm.max_history_turns);
    ctx.history.save(conversation_id, &history).await?;
    Ok(())
}

struct StreamOutcome {
    content: String,
    tool_calls: Vec<ToolCall>,
    interrupted: bool,
    failed: bool,
}

async fn stream_one_generation(
    ctx: &TurnContext,
    conversation_id: Uuid,
    history: &[ChatMessage],
    schemas: &[serde_json::Value],
    params: &crate::orchestrator::llm::GenerationParams,
    voice_id: &Option<String>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    let mut outcome = StreamOutcome {
        content: String::new(),
        tool_calls: Vec::new(),
        interrupted: false,
        failed: false,
    };

    let mut events = match ctx.llm.stream_generation(history, schemas, params).await {
        Ok(events) => events,
        Err(e) => {
            warn!("generation failed to start for {conversation_id}: {e}");
            publish_error_turn(ctx, conversation_id, voice_id).await;
            outcome.failed = true;
            return outcome;
        }
    };

    let mut segmenter = SentenceSegmenter::new();

    loop {
        // Cancellation wins over a ready event so no token is published
        // after a barge-in.
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                outcome.interrupted = true;
                segmenter.clear();
                break;
            }
            event = events.recv() => event,
        };

        match event {
            Some(Ok(LlmEvent::Token(delta))) => {
                outcome.content.push_str(&delta);
                let token = TokenEvent::assistant(conversation_id, delta.clone());
                if let Err(e) =
                    publish_json(ctx.bus.as_ref(), &ctx.config.topics.llm_tokens, &token).await
                {
                    warn!("failed to publish token for {conversation_id}: {e}");
                }
                for sentence in segmenter.push(&delta) {
                    ctx.send_sentence(conversation_id, &sentence, voice_id).await;
                }
            }
            Some(Ok(LlmEvent::ToolCall(call))) => {
                // Speak what precedes the call before it executes.
                if let Some(residual) = segmenter.flush() {
                    ctx.send_sentence(conversation_id, &residual, voice_id).await;
                }
                ctx.publish_tool_status(conversation_id, &call, ToolStatus::Running, None)
                    .await;
                outcome.tool_calls.push(call);
            }
            Some(Err(e)) => {
                warn!("generation stream failed for {conversation_id}: {e}");
                publish_error_turn(ctx, conversation_id, voice_id).await;
                outcome.failed = true;
                break;
            }
            None => break,
        }
    }

    if !outcome.interrupted
        && !outcome.failed
        && let Some(residual) = segmenter.flush()
    {
        ctx.send_sentence(conversation_id, &residual, voice_id).await;
    }

    outcome
}

async fn publish_error_turn(ctx: &TurnContext, conversation_id: Uuid, voice_id: &Option<String>) {
    let token = TokenEvent::assistant(conversation_id, LLM_ERROR_SENTENCE.to_owned());
    let _ = publish_json(ctx.bus.as_ref(), &ctx.config.topics.llm_tokens, &token).await;
    ctx.send_sentence(conversation_id, LLM_ERROR_SENTENCE, voice_id)
        .await;
}
