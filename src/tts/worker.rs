//! TTS worker: per-conversation FIFO synthesis queues.
//!
//! Each conversation gets a lazily started processor task that drains its
//! queue one item at a time, publishing an `audio_stream_start` envelope,
//! re-chunked audio bytes and a terminal envelope per item. A control or
//! barge-in message cancels the processor: the current item's stop flag is
//! set, the queue is drained and the processor exits. Processors shut down
//! on their own after an idle interval.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{KeyValueStore, MessageBus, publish_json};
use crate::config::PlatformConfig;
use crate::error::{PlatformError, Result};
use crate::messages::{AudioStreamEvent, BargeInEvent, TtsControl, TtsRequest};
use crate::tts::SpeechSynthesizer;

struct ProcessorHandle {
    queue: mpsc::UnboundedSender<TtsRequest>,
    cancel: CancellationToken,
}

/// The TTS worker role.
pub struct TtsWorker {
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KeyValueStore>,
    synthesizer: Arc<SpeechSynthesizer>,
    config: Arc<PlatformConfig>,
}

impl TtsWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KeyValueStore>,
        synthesizer: SpeechSynthesizer,
        config: PlatformConfig,
    ) -> Self {
        Self {
            bus,
            kv,
            synthesizer: Arc::new(synthesizer),
            config: Arc::new(config),
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns a bus error when the subscriptions cannot be established.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let topics = &self.config.topics;
        let mut requests = self.bus.subscribe(&topics.tts_request).await?;
        let mut control = self.bus.subscribe(&topics.tts_control).await?;
        let mut barge_in = self.bus.subscribe(&topics.barge_in).await?;
        info!("TTS worker listening on '{}'", topics.tts_request);

        let mut processors: HashMap<Uuid, ProcessorHandle> = HashMap::new();

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                payload = requests.next() => {
                    let Some(payload) = payload else {
                        return Err(PlatformError::Bus("tts.request subscription ended".to_owned()));
                    };
                    match serde_json::from_slice::<TtsRequest>(&payload) {
                        Ok(request) => self.enqueue(request, &mut processors),
                        Err(e) => debug!("ignoring unrecognized TTS request: {e}"),
                    }
                }
                payload = control.next() => {
                    let Some(payload) = payload else {
                        return Err(PlatformError::Bus("tts.control subscription ended".to_owned()));
                    };
                    match serde_json::from_slice::<TtsControl>(&payload) {
                        Ok(TtsControl::StopTts { conversation_id }) => {
                            stop_conversation(conversation_id, &mut processors);
                        }
                        Err(e) => debug!("ignoring unrecognized TTS control: {e}"),
                    }
                }
                payload = barge_in.next() => {
                    let Some(payload) = payload else {
                        return Err(PlatformError::Bus("barge_in subscription ended".to_owned()));
                    };
                    match serde_json::from_slice::<BargeInEvent>(&payload) {
                        Ok(event) => stop_conversation(event.conversation_id(), &mut processors),
                        Err(e) => debug!("ignoring unrecognized barge-in payload: {e}"),
                    }
                }
            }
        }

        info!("TTS worker shutting down ({} processors)", processors.len());
        for (_, handle) in processors.drain() {
            handle.cancel.cancel();
        }
        Ok(())
    }

    fn enqueue(&self, request: TtsRequest, processors: &mut HashMap<Uuid, ProcessorHandle>) {
        if request.text.trim().is_empty() {
            return;
        }
        let id = request.conversation_id;
        let handle = processors.entry(id).or_insert_with(|| self.spawn_processor(id));
        if handle.queue.send(request.clone()).is_err() {
            // The processor idled out; start a fresh one and retry.
            debug!("respawning TTS processor for {id}");
            let handle = self.spawn_processor(id);
            if handle.queue.send(request).is_err() {
                error!("fresh TTS processor for {id} rejected its first item");
            }
            processors.insert(id, handle);
        }
    }

    fn spawn_processor(&self, conversation_id: Uuid) -> ProcessorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let processor = ConversationProcessor {
            conversation_id,
            bus: self.bus.clone(),
            kv: self.kv.clone(),
            synthesizer: self.synthesizer.clone(),
            config: self.config.clone(),
            cancel: cancel.clone(),
        };
        tokio::spawn(processor.run(rx));
        ProcessorHandle { queue: tx, cancel }
    }
}

fn stop_conversation(conversation_id: Uuid, processors: &mut HashMap<Uuid, ProcessorHandle>) {
    if let Some(handle) = processors.remove(&conversation_id) {
        info!("stopping TTS for {conversation_id}");
        handle.cancel.cancel();
    } else {
        debug!("stop for {conversation_id} with no active processor");
    }
}

/// Drains one conversation's queue, one item at a time.
struct ConversationProcessor {
    conversation_id: Uuid,
    bus: Arc<dyn MessageBus>,
    kv: Arc<dyn KeyValueStore>,
    synthesizer: Arc<SpeechSynthesizer>,
    config: Arc<PlatformConfig>,
    cancel: CancellationToken,
}

impl ConversationProcessor {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<TtsRequest>) {
        let id = self.conversation_id;
        let idle = Duration::from_secs(self.config.tts.idle_shutdown_s);
        info!("TTS processor started for {id}");

        loop {
            let deadline = Instant::now() + idle;
            let request = tokio::select! {
                () = self.cancel.cancelled() => {
                    let mut dropped = 0;
                    while queue.try_recv().is_ok() {
                        dropped += 1;
                    }
                    info!("TTS processor for {id} cancelled ({dropped} queued items dropped)");
                    break;
                }
                request = queue.recv() => request,
                _ = tokio::time::sleep_until(deadline) => {
                    info!("TTS processor for {id} idle for {idle:?}; shutting down");
                    break;
                }
            };

            let Some(request) = request else { break };
            self.set_active(true).await;
            self.process_item(request).await;
            self.set_active(false).await;
        }

        self.set_active(false).await;
        info!("TTS processor for {id} fully shut down");
    }

    async fn set_active(&self, active: bool) {
        let key = self.config.keys.tts_active_key(self.conversation_id);
        let result = if active {
            self.kv
                .set_with_ttl(
                    &key,
                    Bytes::from_static(b"1"),
                    Duration::from_secs(self.config.tts.active_ttl_s),
                )
                .await
        } else {
            self.kv.delete(&key).await
        };
        if let Err(e) = result {
            error!(
                "failed to update TTS-active flag for {}: {e}",
                self.conversation_id
            );
        }
    }

    async fn process_item(&self, request: TtsRequest) {
        let id = self.conversation_id;
        let topic = self.config.topics.audio_out(id);
        let format = self.synthesizer.format();

        let start = AudioStreamEvent::AudioStreamStart {
            conversation_id: id,
            format: format.encoding,
            sample_rate: format.sample_rate,
            channels: format.channels,
            sample_width: format.sample_width,
        };
        if let Err(e) = publish_json(self.bus.as_ref(), &topic, &start).await {
            error!("failed to publish stream start for {id}: {e}");
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stream = self
            .synthesizer
            .synthesize(&request.text, request.voice_id.as_deref(), stop.clone())
            .await;

        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                error!("synthesis failed to start for {id}: {e}");
                self.publish_stream_error(&topic, "synthesis failed").await;
                return;
            }
        };

        let chunk_bytes = self.config.tts.chunk_bytes.max(1);
        let mut pending = BytesMut::new();
        let mut chunk_count: u64 = 0;
        let mut errored = false;

        loop {
            let item = tokio::select! {
                () = self.cancel.cancelled() => {
                    stop.store(true, Ordering::Relaxed);
                    break;
                }
                item = stream.next() => item,
            };
            let Some(item) = item else { break };
            match item {
                Ok(bytes) => {
                    pending.extend_from_slice(&bytes);
                    while pending.len() >= chunk_bytes {
                        if self.cancel.is_cancelled() {
                            stop.store(true, Ordering::Relaxed);
                            break;
                        }
                        let chunk = pending.split_to(chunk_bytes).freeze();
                        if self.publish_chunk(&topic, chunk).await {
                            chunk_count += 1;
                        } else {
                            errored = true;
                            break;
                        }
                    }
                    if errored || self.cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    error!("synthesis stream failed for {id}: {e}");
                    self.publish_stream_error(&topic, "TTS synthesis failed for item")
                        .await;
                    return;
                }
            }
        }

        if self.cancel.is_cancelled() {
            // Stopped mid-item: suppress the normal end envelope.
            warn!("TTS item for {id} stopped after {chunk_count} chunks");
            return;
        }
        if errored {
            self.publish_stream_error(&topic, "audio publish failed").await;
            return;
        }

        if !pending.is_empty()
            && self.publish_chunk(&topic, pending.freeze()).await
        {
            chunk_count += 1;
        }

        let end = AudioStreamEvent::AudioStreamEnd {
            conversation_id: id,
            chunk_count,
        };
        if let Err(e) = publish_json(self.bus.as_ref(), &topic, &end).await {
            error!("failed to publish stream end for {id}: {e}");
        }
        debug!("TTS item for {id} finished with {chunk_count} chunks");
    }

    async fn publish_chunk(&self, topic: &str, chunk: Bytes) -> bool {
        match self.bus.publish(topic, chunk).await {
            Ok(_) => true,
            Err(e) => {
                error!("failed to publish audio chunk for {}: {e}", self.conversation_id);
                false
            }
        }
    }

    async fn publish_stream_error(&self, topic: &str, message: &str) {
        let event = AudioStreamEvent::AudioStreamError {
            conversation_id: self.conversation_id,
            error: message.to_owned(),
        };
        if let Err(e) = publish_json(self.bus.as_ref(), topic, &event).await {
            error!(
                "failed to publish stream error for {}: {e}",
                self.conversation_id
            );
        }
    }
}
