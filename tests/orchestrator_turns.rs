//! Orchestrator integration tests: turns driven by a mock chat-completions
//! server over the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use colloquy::bus::{MemoryBroker, MessageBus, Subscription, publish_json};
use colloquy::config::PlatformConfig;
use colloquy::conversation::ConversationConfigStore;
use colloquy::history::{ChatRole, HistoryStore};
use colloquy::messages::{
    TokenEvent, ToolEvent, ToolStatus, TranscriptEvent, TtsControl, TtsRequest,
};
use colloquy::orchestrator::Orchestrator;
use colloquy::orchestrator::llm::LlmClient;
use colloquy::orchestrator::tools::{ToolRouter, function_schema};
use colloquy::orchestrator::turn::{TurnContext, run_turn};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn token_chunk(text: &str) -> Value {
    json!({"choices":[{"delta":{"content":text},"finish_reason":null}]})
}

fn stop_chunk() -> Value {
    json!({"choices":[{"delta":{},"finish_reason":"stop"}]})
}

fn weather_call_chunks() -> Vec<Value> {
    vec![
        json!({"choices":[{"delta":{"tool_calls":[
            {"index":0,"id":"call_1","type":"function",
             "function":{"name":"get_weather","arguments":"{\"location\":\"Paris\"}"}}
        ]},"finish_reason":null}]}),
        json!({"choices":[{"delta":{},"finish_reason":"tool_calls"}]}),
    ]
}

fn sse_body(chunks: &[Value]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

fn sse_response(chunks: &[Value]) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sse_body(chunks), "text/event-stream")
}

struct Harness {
    broker: Arc<MemoryBroker>,
    ctx: TurnContext,
    config: PlatformConfig,
}

async fn harness(server: &MockServer) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = PlatformConfig::default();
    config.llm.api_url = server.uri();

    let bus: Arc<dyn MessageBus> = broker.clone();
    let mut tools = ToolRouter::new(bus.clone(), config.topics.clone(), &config.llm);
    tools.register(
        "get_weather",
        function_schema(
            "get_weather",
            "Current weather conditions for a location",
            json!({"type":"object","properties":{"location":{"type":"string"}},"required":["location"]}),
        ),
        Arc::new(|args| {
            let location = args["location"].as_str().unwrap_or("unknown").to_owned();
            Ok(json!({"temperature":"25C","condition":"sunny","location":location}))
        }),
    );

    let ctx = TurnContext {
        bus,
        history: HistoryStore::new(broker.clone(), config.keys.clone()),
        conversation_config: ConversationConfigStore::new(broker.clone(), config.keys.clone()),
        llm: LlmClient::new(config.llm.clone()),
        tools: Arc::new(tools),
        config: Arc::new(config.clone()),
    };
    Harness {
        broker,
        ctx,
        config,
    }
}

async fn recv_json<T: serde::de::DeserializeOwned>(sub: &mut Subscription) -> T {
    let payload = tokio::time::timeout(RECV_TIMEOUT, sub.next())
        .await
        .expect("timed out waiting for bus event")
        .expect("subscription ended");
    serde_json::from_slice(&payload).expect("undecodable bus event")
}

async fn drain_json<T: serde::de::DeserializeOwned>(sub: &mut Subscription) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(payload)) =
        tokio::time::timeout(Duration::from_millis(200), sub.next()).await
    {
        if let Ok(value) = serde_json::from_slice(&payload) {
            out.push(value);
        }
    }
    out
}

#[tokio::test]
async fn hello_turn_streams_tokens_and_appends_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            token_chunk("Bonjour"),
            token_chunk(" tout le monde."),
            stop_chunk(),
        ]))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let id = Uuid::new_v4();
    let mut tokens = h.broker.subscribe(&h.config.topics.llm_tokens).await.unwrap();
    let mut tts = h.broker.subscribe(&h.config.topics.tts_request).await.unwrap();

    run_turn(&h.ctx, id, "bonjour".to_owned(), CancellationToken::new())
        .await
        .unwrap();

    // The appended assistant text equals the concatenation of token deltas.
    let deltas: Vec<TokenEvent> = drain_json(&mut tokens).await;
    let concatenated: String = deltas
        .iter()
        .map(|TokenEvent::Token { content, .. }| content.as_str())
        .collect();
    assert_eq!(concatenated, "Bonjour tout le monde.");

    let history = h.ctx.history.load(id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].role, ChatRole::System);
    assert_eq!(history[1].role, ChatRole::User);
    assert_eq!(history[1].content.as_deref(), Some("bonjour"));
    assert_eq!(history[2].role, ChatRole::Assistant);
    assert_eq!(history[2].content.as_deref(), Some("Bonjour tout le monde."));

    let requests: Vec<TtsRequest> = drain_json(&mut tts).await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].text, "Bonjour tout le monde.");
    assert_eq!(requests[0].conversation_id, id);
}

#[tokio::test]
async fn tool_call_turn_runs_to_completion() {
    let server = MockServer::start().await;
    // First generation requests the tool; the follow-up answers in text.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&weather_call_chunks()))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            token_chunk("Il fait beau à Paris."),
            stop_chunk(),
        ]))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let id = Uuid::new_v4();
    let mut tool_events = h.broker.subscribe(&h.config.topics.tool_events).await.unwrap();
    let mut tts = h.broker.subscribe(&h.config.topics.tts_request).await.unwrap();

    run_turn(
        &h.ctx,
        id,
        "quel temps fait-il à Paris".to_owned(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // Status order for the call id: running then completed with a result.
    let events: Vec<ToolEvent> = drain_json(&mut tool_events).await;
    let statuses: Vec<(ToolStatus, Option<Value>)> = events
        .iter()
        .map(|ToolEvent::Tool { status, result, .. }| (*status, result.clone()))
        .collect();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].0, ToolStatus::Running);
    assert_eq!(statuses[1].0, ToolStatus::Completed);
    assert_eq!(
        statuses[1].1.as_ref().map(|r| r["location"].clone()),
        Some(json!("Paris"))
    );

    // History: system, user, assistant-with-tool-call, tool result, assistant.
    let history = h.ctx.history.load(id).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[2].role, ChatRole::Assistant);
    let calls = history[2].tool_calls.as_ref().expect("tool calls recorded");
    assert_eq!(calls[0].function.name, "get_weather");
    assert_eq!(history[3].role, ChatRole::Tool);
    assert_eq!(history[3].tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(history[4].content.as_deref(), Some("Il fait beau à Paris."));

    let requests: Vec<TtsRequest> = drain_json(&mut tts).await;
    assert_eq!(requests.last().unwrap().text, "Il fait beau à Paris.");
}

#[tokio::test]
async fn tool_recursion_cap_speaks_limit_sentence() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&weather_call_chunks()))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let id = Uuid::new_v4();
    let mut tool_events = h.broker.subscribe(&h.config.topics.tool_events).await.unwrap();
    let mut tts = h.broker.subscribe(&h.config.topics.tts_request).await.unwrap();

    run_turn(&h.ctx, id, "météo".to_owned(), CancellationToken::new())
        .await
        .unwrap();

    let events: Vec<ToolEvent> = drain_json(&mut tool_events).await;
    let running = events
        .iter()
        .filter(|ToolEvent::Tool { status, .. }| *status == ToolStatus::Running)
        .count();
    assert_eq!(running, 5, "loop breaks after max_tool_recursion");

    let requests: Vec<TtsRequest> = drain_json(&mut tts).await;
    assert_eq!(
        requests.last().unwrap().text,
        "[Tool processing limit reached]"
    );
}

#[tokio::test]
async fn provider_failure_yields_error_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let id = Uuid::new_v4();
    let mut tts = h.broker.subscribe(&h.config.topics.tts_request).await.unwrap();

    run_turn(&h.ctx, id, "bonjour".to_owned(), CancellationToken::new())
        .await
        .unwrap();

    let history = h.ctx.history.load(id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history[2].content.as_deref().unwrap().starts_with("[error]"));

    let requests: Vec<TtsRequest> = drain_json(&mut tts).await;
    assert!(requests[0].text.starts_with("[error]"));
}

#[tokio::test]
async fn cancelled_turn_persists_partial_text_and_stops_speaking() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            token_chunk("Phrase un. Phrase deux"),
            stop_chunk(),
        ]))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let id = Uuid::new_v4();

    // Cancel before the turn starts streaming: partial content is whatever
    // was generated up to the cancellation check.
    let cancel = CancellationToken::new();
    cancel.cancel();
    run_turn(&h.ctx, id, "bonjour".to_owned(), cancel).await.unwrap();

    let history = h.ctx.history.load(id).await.unwrap();
    // System + user are always recorded; the interrupted generation produced
    // no content, so no assistant entry was appended.
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].role, ChatRole::User);
}

#[tokio::test]
async fn orchestrator_deduplicates_final_transcripts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[token_chunk("Salut."), stop_chunk()]))
        .mount(&server)
        .await;

    let h = harness(&server).await;
    let id = Uuid::new_v4();
    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(TurnContext {
        bus: h.ctx.bus.clone(),
        history: h.ctx.history.clone(),
        conversation_config: h.ctx.conversation_config.clone(),
        llm: h.ctx.llm.clone(),
        tools: h.ctx.tools.clone(),
        config: h.ctx.config.clone(),
    });
    let worker = tokio::spawn(orchestrator.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let event = TranscriptEvent::finalized(id, "bonjour".to_owned(), 1_700_000_000_000);
    publish_json(h.broker.as_ref(), &h.config.topics.transcripts, &event)
        .await
        .unwrap();
    publish_json(h.broker.as_ref(), &h.config.topics.transcripts, &event)
        .await
        .unwrap();

    // Let both deliveries land and the single turn complete.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let history = h.ctx.history.load(id).await.unwrap();
    let user_turns = history
        .iter()
        .filter(|m| m.role == ChatRole::User)
        .count();
    assert_eq!(user_turns, 1, "duplicate delivery appends once");

    shutdown.cancel();
    let _ = worker.await;
}

#[tokio::test]
async fn barge_in_publishes_stop_tts() {
    let server = MockServer::start().await;
    let h = harness(&server).await;
    let id = Uuid::new_v4();

    let mut control = h.broker.subscribe(&h.config.topics.tts_control).await.unwrap();
    let shutdown = CancellationToken::new();
    let orchestrator = Orchestrator::new(TurnContext {
        bus: h.ctx.bus.clone(),
        history: h.ctx.history.clone(),
        conversation_config: h.ctx.conversation_config.clone(),
        llm: h.ctx.llm.clone(),
        tools: h.ctx.tools.clone(),
        config: h.ctx.config.clone(),
    });
    let worker = tokio::spawn(orchestrator.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_json(
        h.broker.as_ref(),
        &h.config.topics.barge_in,
        &colloquy::messages::BargeInEvent::now(id),
    )
    .await
    .unwrap();

    let stop: TtsControl = recv_json(&mut control).await;
    assert_eq!(stop, TtsControl::StopTts { conversation_id: id });

    shutdown.cancel();
    let _ = worker.await;
}
