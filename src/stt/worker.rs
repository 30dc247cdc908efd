//! VAD/STT worker: routes `audio.in` frames to per-conversation actors.
//!
//! Each conversation gets a lightweight actor owning its
//! [`AudioProcessor`](crate::stt::processor::AudioProcessor) and addressed by
//! a mailbox; the registry maps conversation id → mailbox and only
//! synchronizes on insert/remove. Actors dispose themselves after an
//! inactivity timeout and are respawned on demand. ASR inference runs on the
//! blocking thread pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{KeyValueStore, MessageBus, publish_json};
use crate::config::PlatformConfig;
use crate::conversation::ConversationConfigStore;
use crate::error::{PlatformError, Result};
use crate::messages::{AudioFrame, BargeInEvent, ConnectionEvent, TranscriptEvent, now_ms};
use crate::stt::AsrEngine;
use crate::stt::processor::{AudioProcessor, ProcessorEvent};

/// Mailbox depth per conversation actor.
const MAILBOX_DEPTH: usize = 64;

/// Transcript text published when ASR fails mid-conversation.
const ASR_ERROR_TRANSCRIPT: &str = "[transcription error]";

enum ActorMessage {
    Audio(Bytes),
    Shutdown,
}

/// The VAD/STT worker role.
pub struct SttWorker {
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KeyValueStore>,
    engine: Arc<dyn AsrEngine>,
    config: Arc<PlatformConfig>,
}

impl SttWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KeyValueStore>,
        engine: Arc<dyn AsrEngine>,
        config: PlatformConfig,
    ) -> Self {
        Self {
            bus,
            kv,
            engine,
            config: Arc::new(config),
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns a bus error when the initial subscriptions cannot be
    /// established (process-fatal; the supervisor restarts the worker).
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut audio = self.bus.subscribe(&self.config.topics.audio_in).await?;
        let mut connections = self
            .bus
            .subscribe(&self.config.topics.connection_events)
            .await?;
        info!(
            topic = %self.config.topics.audio_in,
            "VAD/STT worker listening"
        );

        let mut actors: HashMap<Uuid, mpsc::Sender<ActorMessage>> = HashMap::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                frame = audio.next() => {
                    let Some(payload) = frame else {
                        return Err(PlatformError::Bus("audio.in subscription ended".to_owned()));
                    };
                    self.route_frame(payload, &mut actors).await;
                }
                event = connections.next() => {
                    let Some(payload) = event else {
                        return Err(PlatformError::Bus(
                            "connection.events subscription ended".to_owned(),
                        ));
                    };
                    handle_connection_event(&payload, &mut actors).await;
                }
            }
        }

        info!("VAD/STT worker shutting down ({} active actors)", actors.len());
        for (_, mailbox) in actors.drain() {
            let _ = mailbox.try_send(ActorMessage::Shutdown);
        }
        Ok(())
    }

    async fn route_frame(
        &self,
        payload: Bytes,
        actors: &mut HashMap<Uuid, mpsc::Sender<ActorMessage>>,
    ) {
        let frame = match AudioFrame::decode(payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping malformed audio frame: {e}");
                return;
            }
        };
        if frame.pcm.is_empty() {
            return;
        }

        let id = frame.conversation_id;
        let mailbox = actors.entry(id).or_insert_with(|| self.spawn_actor(id));
        if mailbox.send(ActorMessage::Audio(frame.pcm.clone())).await.is_err() {
            // The actor timed out and exited; replace it and retry once.
            debug!("respawning audio processor for {id}");
            let mailbox = self.spawn_actor(id);
            if mailbox.send(ActorMessage::Audio(frame.pcm)).await.is_err() {
                error!("fresh audio processor for {id} rejected its first frame");
            }
            actors.insert(id, mailbox);
        }
    }

    fn spawn_actor(&self, conversation_id: Uuid) -> mpsc::Sender<ActorMessage> {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        let actor = ConversationActor {
            conversation_id,
            bus: self.bus.clone(),
            kv: self.kv.clone(),
            engine: self.engine.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(actor.run(rx));
        tx
    }
}

async fn handle_connection_event(
    payload: &Bytes,
    actors: &mut HashMap<Uuid, mpsc::Sender<ActorMessage>>,
) {
    match serde_json::from_slice::<ConnectionEvent>(payload) {
        Ok(ConnectionEvent::ConnectionDisconnected {
            conversation_id,
            reason,
        }) => {
            if let Some(mailbox) = actors.remove(&conversation_id) {
                info!("disposing audio processor for {conversation_id} ({reason})");
                let _ = mailbox.send(ActorMessage::Shutdown).await;
            }
        }
        Err(e) => debug!("ignoring unrecognized connection event: {e}"),
    }
}

/// One conversation's processing task.
struct ConversationActor {
    conversation_id: Uuid,
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KeyValueStore>,
    engine: Arc<dyn AsrEngine>,
    config: Arc<PlatformConfig>,
}

impl ConversationActor {
    async fn run(self, mut mailbox: mpsc::Receiver<ActorMessage>) {
        let id = self.conversation_id;
        info!("audio processor started for {id}");

        // The conversation's VAD aggressiveness override is read once at
        // spawn; later changes apply when the actor is next recreated.
        let aggressiveness = ConversationConfigStore::new(
            self.kv.clone(),
            self.config.keys.clone(),
        )
        .load(id)
        .await
        .map(|c| c.vad_aggressiveness)
        .unwrap_or_default();

        let mut processor = AudioProcessor::new(
            &self.config.vad,
            aggressiveness,
            Duration::from_millis(self.config.stt.partial_interval_ms),
        );
        let inactivity = Duration::from_secs(self.config.stt.processor_inactivity_timeout_s);
        let mut barge_in_signaled = false;

        loop {
            let deadline = Instant::now() + inactivity;
            let message = tokio::select! {
                msg = mailbox.recv() => msg,
                _ = tokio::time::sleep_until(deadline) => {
                    info!("audio processor for {id} idle for {inactivity:?}; disposing");
                    break;
                }
            };

            match message {
                Some(ActorMessage::Audio(pcm)) => {
                    let events = processor.push_pcm(&pcm);
                    for event in events {
                        self.handle_event(event, &mut barge_in_signaled).await;
                    }
                }
                Some(ActorMessage::Shutdown) | None => break,
            }
        }
    }

    async fn handle_event(&self, event: ProcessorEvent, barge_in_signaled: &mut bool) {
        let id = self.conversation_id;
        match event {
            ProcessorEvent::ProperSpeechStart => {
                if *barge_in_signaled {
                    return;
                }
                let tts_active = self
                    .kv
                    .exists(&self.config.keys.tts_active_key(id))
                    .await
                    .unwrap_or(false);
                if tts_active {
                    info!("barge-in detected for {id}");
                    if let Err(e) = publish_json(
                        self.bus.as_ref(),
                        &self.config.topics.barge_in,
                        &BargeInEvent::now(id),
                    )
                    .await
                    {
                        error!("failed to publish barge-in for {id}: {e}");
                    } else {
                        *barge_in_signaled = true;
                    }
                }
            }
            ProcessorEvent::PartialReady(samples) => {
                match self.transcribe(samples).await {
                    Ok(text) if !text.is_empty() => {
                        let event =
                            TranscriptEvent::partial(id, text, now_ms());
                        if let Err(e) = publish_json(
                            self.bus.as_ref(),
                            &self.config.topics.transcripts,
                            &event,
                        )
                        .await
                        {
                            error!("failed to publish partial transcript for {id}: {e}");
                        }
                    }
                    Ok(_) => {}
                    // Partial failures are silent; the final attempt decides.
                    Err(e) => debug!("partial transcription failed for {id}: {e}"),
                }
            }
            ProcessorEvent::UtteranceComplete(samples) => {
                let duration_s = samples.len() as f32 / self.config.vad.sample_rate as f32;
                let text = match self.transcribe(samples).await {
                    Ok(text) => text,
                    Err(e) => {
                        error!("transcription failed for {id}: {e}");
                        ASR_ERROR_TRANSCRIPT.to_owned()
                    }
                };
                if !text.is_empty() {
                    info!("final transcript for {id} ({duration_s:.1}s audio): \"{text}\"");
                    let event = TranscriptEvent::finalized(id, text, now_ms());
                    if let Err(e) = publish_json(
                        self.bus.as_ref(),
                        &self.config.topics.transcripts,
                        &event,
                    )
                    .await
                    {
                        error!("failed to publish final transcript for {id}: {e}");
                    }
                }
                // One barge-in per utterance; re-arm once the utterance closed.
                *barge_in_signaled = false;
            }
            ProcessorEvent::FalseStart { voiced_ms } => {
                debug!("false speech detection for {id} ({voiced_ms} ms voiced)");
            }
        }
    }

    async fn transcribe(&self, samples: Vec<f32>) -> Result<String> {
        let engine = self.engine.clone();
        let sample_rate = self.config.vad.sample_rate;
        let result = tokio::task::spawn_blocking(move || engine.transcribe(&samples, sample_rate))
            .await
            .map_err(|e| PlatformError::Asr(format!("ASR task panicked: {e}")))??;
        Ok(result.text())
    }
}
