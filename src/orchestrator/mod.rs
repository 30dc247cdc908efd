//! LLM orchestrator worker.
//!
//! Subscribes to final transcripts and barge-in events, keeps one turn in
//! flight per conversation, and owns all history writes. Starting a new turn
//! cancels the prior one; a barge-in cancels generation and tells the TTS
//! worker to stop.

pub mod llm;
pub mod segmenter;
pub mod tools;
pub mod turn;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::publish_json;
use crate::error::{PlatformError, Result};
use crate::messages::{BargeInEvent, TranscriptEvent, TtsControl};
use crate::orchestrator::turn::{TurnContext, run_turn};

/// Per-conversation turn bookkeeping.
struct ConversationState {
    /// Serializes turns so history writes never interleave.
    turn_lock: Arc<tokio::sync::Mutex<()>>,
    /// Cancels the currently active (or pending) turn.
    cancel: CancellationToken,
    /// Identifies the active turn so finished tasks only clean up themselves.
    seq: u64,
    /// The last final transcript accepted, for duplicate-delivery suppression.
    last_final: Option<(i64, String)>,
}

/// The orchestrator worker role.
pub struct Orchestrator {
    ctx: Arc<TurnContext>,
    conversations: Arc<Mutex<HashMap<Uuid, ConversationState>>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl Orchestrator {
    pub fn new(ctx: TurnContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            conversations: Arc::new(Mutex::new(HashMap::new())),
            next_seq: std::sync::atomic::AtomicU64::new(1),
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns a bus error when the subscriptions cannot be established.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let topics = &self.ctx.config.topics;
        let mut transcripts = self.ctx.bus.subscribe(&topics.transcripts).await?;
        let mut barge_ins = self.ctx.bus.subscribe(&topics.barge_in).await?;
        info!("orchestrator listening on '{}'", topics.transcripts);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                payload = transcripts.next() => {
                    let Some(payload) = payload else {
                        return Err(PlatformError::Bus("transcript subscription ended".to_owned()));
                    };
                    match serde_json::from_slice::<TranscriptEvent>(&payload) {
                        Ok(event) => self.handle_transcript(event),
                        Err(e) => debug!("ignoring unrecognized transcript payload: {e}"),
                    }
                }
                payload = barge_ins.next() => {
                    let Some(payload) = payload else {
                        return Err(PlatformError::Bus("barge-in subscription ended".to_owned()));
                    };
                    match serde_json::from_slice::<BargeInEvent>(&payload) {
                        Ok(event) => self.handle_barge_in(event.conversation_id()).await,
                        Err(e) => debug!("ignoring unrecognized barge-in payload: {e}"),
                    }
                }
            }
        }

        // Cancel in-flight turns so they persist partial history and exit.
        let states = self
            .conversations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for state in states.values() {
            state.cancel.cancel();
        }
        info!("orchestrator shut down");
        Ok(())
    }

    fn handle_transcript(&self, event: TranscriptEvent) {
        if !event.is_final() {
            debug!("skipping partial transcript for LLM");
            return;
        }
        let conversation_id = event.conversation_id();
        let text = event.transcript().trim().to_owned();
        if text.is_empty() {
            return;
        }

        let seq = self
            .next_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let (turn_lock, cancel) = {
            let mut states = self
                .conversations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let state = states.entry(conversation_id).or_insert_with(|| {
                ConversationState {
                    turn_lock: Arc::new(tokio::sync::Mutex::new(())),
                    cancel: CancellationToken::new(),
                    seq: 0,
                    last_final: None,
                }
            });

            // Duplicate bus delivery of the same final produces one append.
            let key = (event.timestamp_ms(), text.clone());
            if state.last_final.as_ref() == Some(&key) {
                debug!("duplicate final transcript for {conversation_id}; skipping");
                return;
            }
            state.last_final = Some(key);

            // A new transcript before the prior turn completed cancels it.
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.seq = seq;
            (state.turn_lock.clone(), state.cancel.clone())
        };

        let ctx = self.ctx.clone();
        let conversations = self.conversations.clone();
        tokio::spawn(async move {
            // Wait for the previous turn to finish persisting.
            let _guard = turn_lock.lock().await;
            if cancel.is_cancelled() {
                return;
            }
            if let Err(e) = run_turn(&ctx, conversation_id, text, cancel).await {
                warn!("turn failed for {conversation_id}: {e}");
            }
            let mut states = conversations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = states.get(&conversation_id)
                && state.seq == seq
            {
                // Keep the dedup memory, drop the spent token.
                state.cancel.cancel();
            }
        });
    }

    async fn handle_barge_in(&self, conversation_id: Uuid) {
        info!("barge-in for {conversation_id}: cancelling generation and TTS");
        {
            let states = self
                .conversations
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(state) = states.get(&conversation_id) {
                state.cancel.cancel();
            }
        }
        let stop = TtsControl::StopTts { conversation_id };
        if let Err(e) = publish_json(
            self.ctx.bus.as_ref(),
            &self.ctx.config.topics.tts_control,
            &stop,
        )
        .await
        {
            warn!("failed to publish stop_tts for {conversation_id}: {e}");
        }
    }
}
