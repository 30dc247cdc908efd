//! Gateway: terminates client WebSocket sessions and bridges them to the bus.
//!
//! Per session, six logical work units run concurrently under one
//! cancellation parent: an inbound reader publishing audio frames to
//! `audio.in`, and five outbound forwarders (transcripts, tokens, tool
//! events, barge-in, per-conversation audio). A socket writer task serializes
//! their sends. When any unit observes client closure or an unrecoverable
//! error, the whole session is cancelled and torn down within a bounded
//! grace period.

pub mod admin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{KeyValueStore, MessageBus, Subscription, publish_json};
use crate::config::PlatformConfig;
use crate::conversation::ConversationConfigStore;
use crate::error::{PlatformError, Result};
use crate::messages::{
    AudioFrame, AudioStreamEvent, BargeInEvent, BargeInNotification, ClientToolResponse,
    ConnectionEvent, SystemEvent, TokenEvent, ToolEvent, TranscriptEvent,
};

/// Outbound socket queue depth per session.
const OUTBOUND_QUEUE: usize = 256;

/// Shared state behind the axum router.
pub struct GatewayState {
    pub bus: Arc<dyn MessageBus>,
    pub kv: Arc<dyn KeyValueStore>,
    pub conversation_config: ConversationConfigStore,
    pub config: Arc<PlatformConfig>,
}

impl GatewayState {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        kv: Arc<dyn KeyValueStore>,
        config: PlatformConfig,
    ) -> Self {
        let conversation_config = ConversationConfigStore::new(kv.clone(), config.keys.clone());
        Self {
            bus,
            kv,
            conversation_config,
            config: Arc::new(config),
        }
    }
}

/// Build the gateway router (WebSocket endpoint + admin surface).
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws/audio", get(ws_upgrade))
        .route(
            "/conversations/{conversation_id}/config",
            get(admin::get_config).post(admin::update_config),
        )
        .route("/health", get(admin::health))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
///
/// # Errors
///
/// Process-fatal when the listener cannot bind.
pub async fn serve(state: Arc<GatewayState>, shutdown: CancellationToken) -> Result<()> {
    let addr = state.config.gateway.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PlatformError::Gateway(format!("cannot bind {addr}: {e}")))?;
    info!("gateway listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| PlatformError::Gateway(format!("server failed: {e}")))
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(expected) = state.config.gateway.auth_token.as_deref() {
        let header_token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let query_token = params.get("token").map(String::as_str);
        if header_token != Some(expected) && query_token != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_session(state, socket))
}

async fn handle_session(state: Arc<GatewayState>, socket: WebSocket) {
    let conversation_id = Uuid::new_v4();
    info!("session established, assigned conversation {conversation_id}");

    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();

    let started = SystemEvent::conversation_started(conversation_id);
    let Ok(first) = serde_json::to_string(&started) else {
        return;
    };
    if out_tx.send(Message::Text(first.into())).await.is_err() {
        return;
    }

    let mut units = JoinSet::new();

    units.spawn(socket_writer(sink, out_rx, cancel.clone()));
    units.spawn(inbound_reader(
        state.clone(),
        stream,
        conversation_id,
        cancel.clone(),
    ));

    let topics = &state.config.topics;
    for forwarder in [
        ForwardTopic::Transcripts(topics.transcripts.clone()),
        ForwardTopic::Tokens(topics.llm_tokens.clone()),
        ForwardTopic::ToolEvents(topics.tool_events.clone()),
        ForwardTopic::BargeIn(topics.barge_in.clone()),
        ForwardTopic::AudioOut(topics.audio_out(conversation_id)),
    ] {
        units.spawn(run_forwarder(
            state.clone(),
            forwarder,
            conversation_id,
            out_tx.clone(),
            cancel.clone(),
        ));
    }
    drop(out_tx);

    // First unit to finish takes the session down with it.
    let _ = units.join_next().await;
    cancel.cancel();
    let grace = Duration::from_millis(state.config.gateway.shutdown_grace_ms);
    if tokio::time::timeout(grace, async {
        while units.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("session {conversation_id} teardown exceeded {grace:?}; aborting units");
        units.abort_all();
    }

    let event = ConnectionEvent::ConnectionDisconnected {
        conversation_id,
        reason: "client_closed".to_owned(),
    };
    if let Err(e) = publish_json(
        state.bus.as_ref(),
        &state.config.topics.connection_events,
        &event,
    )
    .await
    {
        warn!("failed to publish disconnect event for {conversation_id}: {e}");
    }
    info!("session for {conversation_id} closed");
}

/// Serializes all outbound socket sends. A send failure is terminal for the
/// session.
async fn socket_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else { break };
        if sink.send(message).await.is_err() {
            debug!("client send failed; ending session");
            break;
        }
    }
    cancel.cancel();
    let _ = sink.close().await;
}

/// Reads client frames: binary PCM goes to `audio.in`; JSON tool responses
/// are forwarded to the tool response topic; anything else is logged and
/// dropped.
async fn inbound_reader(
    state: Arc<GatewayState>,
    mut stream: SplitStream<WebSocket>,
    conversation_id: Uuid,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Binary(data))) => {
                if data.is_empty() {
                    continue;
                }
                let frame = AudioFrame::new(conversation_id, Bytes::from(data));
                if let Err(e) = state
                    .bus
                    .publish(&state.config.topics.audio_in, frame.encode())
                    .await
                {
                    warn!("failed to publish audio for {conversation_id}: {e}");
                }
            }
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientToolResponse>(text.as_str()) {
                    Ok(response) => {
                        if let Err(e) = publish_json(
                            state.bus.as_ref(),
                            &state.config.topics.tool_response,
                            &response,
                        )
                        .await
                        {
                            warn!("failed to forward tool response for {conversation_id}: {e}");
                        }
                    }
                    Err(e) => debug!("ignoring client text message: {e}"),
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {} // ping/pong handled by axum
            Some(Err(e)) => {
                debug!("client read failed for {conversation_id}: {e}");
                break;
            }
        }
    }
    cancel.cancel();
}

enum ForwardTopic {
    Transcripts(String),
    Tokens(String),
    ToolEvents(String),
    BargeIn(String),
    AudioOut(String),
}

impl ForwardTopic {
    fn name(&self) -> &str {
        match self {
            Self::Transcripts(t)
            | Self::Tokens(t)
            | Self::ToolEvents(t)
            | Self::BargeIn(t)
            | Self::AudioOut(t) => t,
        }
    }
}

async fn run_forwarder(
    state: Arc<GatewayState>,
    topic: ForwardTopic,
    conversation_id: Uuid,
    out_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let subscription = subscribe_with_retry(
        state.bus.as_ref(),
        topic.name(),
        state.config.gateway.forwarder_retries,
        &cancel,
    )
    .await;
    let Some(mut subscription) = subscription else {
        cancel.cancel();
        return;
    };

    loop {
        let payload = tokio::select! {
            () = cancel.cancelled() => break,
            payload = subscription.next() => payload,
        };
        let Some(payload) = payload else {
            warn!("bus subscription '{}' ended", topic.name());
            break;
        };
        let Some(message) = filter_payload(&topic, conversation_id, payload) else {
            continue;
        };
        if out_tx.send(message).await.is_err() {
            break;
        }
    }
    cancel.cancel();
}

/// Map a bus payload to a client message, dropping mismatched conversation
/// ids and unrecognized events.
fn filter_payload(topic: &ForwardTopic, conversation_id: Uuid, payload: Bytes) -> Option<Message> {
    match topic {
        ForwardTopic::Transcripts(_) => {
            let event: TranscriptEvent = parse_logged(&payload)?;
            (event.conversation_id() == conversation_id).then(|| text_message(payload))
        }
        ForwardTopic::Tokens(_) => {
            let TokenEvent::Token {
                conversation_id: id,
                ..
            } = parse_logged(&payload)?;
            (id == conversation_id).then(|| text_message(payload))
        }
        ForwardTopic::ToolEvents(_) => {
            let ToolEvent::Tool {
                conversation_id: id,
                ..
            } = parse_logged(&payload)?;
            (id == conversation_id).then(|| text_message(payload))
        }
        ForwardTopic::BargeIn(_) => {
            let BargeInEvent::BargeInDetected {
                conversation_id: id,
                timestamp_ms,
            } = parse_logged(&payload)?;
            if id != conversation_id {
                return None;
            }
            let notification = BargeInNotification::BargeInNotification {
                conversation_id,
                timestamp_ms,
            };
            serde_json::to_string(&notification)
                .ok()
                .map(|s| Message::Text(s.into()))
        }
        ForwardTopic::AudioOut(_) => {
            // Envelopes are JSON; everything else on this topic is a raw
            // audio chunk in the declared format.
            if payload.first() == Some(&b'{')
                && let Ok(event) = serde_json::from_slice::<AudioStreamEvent>(&payload)
            {
                return (event.conversation_id() == conversation_id)
                    .then(|| text_message(payload));
            }
            Some(Message::Binary(payload))
        }
    }
}

fn text_message(payload: Bytes) -> Message {
    Message::Text(String::from_utf8_lossy(&payload).into_owned().into())
}

fn parse_logged<'a, T: serde::Deserialize<'a>>(payload: &'a [u8]) -> Option<T> {
    match serde_json::from_slice(payload) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("dropping unrecognized bus event: {e}");
            None
        }
    }
}

async fn subscribe_with_retry(
    bus: &dyn MessageBus,
    topic: &str,
    retries: u32,
    cancel: &CancellationToken,
) -> Option<Subscription> {
    let mut delay = Duration::from_millis(250);
    for attempt in 0..=retries {
        if cancel.is_cancelled() {
            return None;
        }
        match bus.subscribe(topic).await {
            Ok(subscription) => return Some(subscription),
            Err(e) if attempt < retries => {
                warn!("subscribe to '{topic}' failed (attempt {}): {e}", attempt + 1);
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => {
                warn!("subscribe to '{topic}' failed permanently: {e}");
                return None;
            }
        }
    }
    None
}
