//! TTS worker integration tests: FIFO ordering, envelope pairing, the
//! TTS-active flag and cancellation, over the in-memory broker with a mock
//! streaming provider.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use colloquy::bus::{KeyValueStore, MemoryBroker, MessageBus, Subscription, publish_json};
use colloquy::config::{PlatformConfig, TtsProvider};
use colloquy::messages::{AudioStreamEvent, TtsControl, TtsRequest};
use colloquy::tts::SpeechSynthesizer;
use colloquy::tts::worker::TtsWorker;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Something observed on the per-conversation output topic.
#[derive(Debug)]
enum Observed {
    Envelope(AudioStreamEvent),
    Chunk(Bytes),
}

async fn next_observed(sub: &mut Subscription) -> Observed {
    let payload = tokio::time::timeout(RECV_TIMEOUT, sub.next())
        .await
        .expect("timed out waiting for audio.out traffic")
        .expect("subscription ended");
    classify(payload)
}

fn classify(payload: Bytes) -> Observed {
    if payload.first() == Some(&b'{')
        && let Ok(event) = serde_json::from_slice::<AudioStreamEvent>(&payload)
    {
        return Observed::Envelope(event);
    }
    Observed::Chunk(payload)
}

async fn drain_observed(sub: &mut Subscription, window: Duration) -> Vec<Observed> {
    let mut out = Vec::new();
    while let Ok(Some(payload)) = tokio::time::timeout(window, sub.next()).await {
        out.push(classify(payload));
    }
    out
}

struct Harness {
    broker: Arc<MemoryBroker>,
    config: PlatformConfig,
    kv: Arc<dyn KeyValueStore>,
    shutdown: CancellationToken,
}

async fn start_worker(server: &MockServer, chunk_bytes: usize) -> Harness {
    let broker = Arc::new(MemoryBroker::new());
    let mut config = PlatformConfig::default();
    config.tts.provider = TtsProvider::ElevenLabs;
    config.tts.elevenlabs.api_key = "test-key".to_owned();
    config.tts.elevenlabs.base_url = server.uri();
    config.tts.chunk_bytes = chunk_bytes;

    let synthesizer = SpeechSynthesizer::from_config(&config.tts).unwrap();
    let bus: Arc<dyn MessageBus> = broker.clone();
    let kv: Arc<dyn KeyValueStore> = broker.clone();
    let shutdown = CancellationToken::new();
    let worker = TtsWorker::new(bus, kv.clone(), synthesizer, config.clone());
    tokio::spawn(worker.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    Harness {
        broker,
        config,
        kv,
        shutdown,
    }
}

fn mock_voice(voice: &str, body: Vec<u8>) -> Mock {
    Mock::given(method("POST"))
        .and(path(format!("/v1/text-to-speech/{voice}/stream")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/octet-stream"))
}

fn request(id: Uuid, text: &str, voice: &str) -> TtsRequest {
    TtsRequest {
        conversation_id: id,
        text: text.to_owned(),
        voice_id: Some(voice.to_owned()),
        options: None,
    }
}

#[tokio::test]
async fn item_streams_start_chunks_end() {
    let server = MockServer::start().await;
    mock_voice("alice", vec![0xAA; 40]).mount(&server).await;

    let h = start_worker(&server, 16).await;
    let id = Uuid::new_v4();
    let mut out = h.broker.subscribe(&h.config.topics.audio_out(id)).await.unwrap();

    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_request,
        &request(id, "Bonjour.", "alice"),
    )
    .await
    .unwrap();

    match next_observed(&mut out).await {
        Observed::Envelope(AudioStreamEvent::AudioStreamStart {
            conversation_id,
            sample_rate,
            channels,
            sample_width,
            ..
        }) => {
            assert_eq!(conversation_id, id);
            assert_eq!(sample_rate, 24_000);
            assert_eq!(channels, 1);
            assert_eq!(sample_width, Some(2));
        }
        other => panic!("expected stream start, got {other:?}"),
    }

    // 40 bytes re-chunked at 16: two full chunks plus an 8-byte remainder.
    let mut chunks = Vec::new();
    let end = loop {
        match next_observed(&mut out).await {
            Observed::Chunk(chunk) => chunks.push(chunk),
            Observed::Envelope(event) => break event,
        }
    };
    assert_eq!(
        chunks.iter().map(Bytes::len).collect::<Vec<_>>(),
        vec![16, 16, 8]
    );
    match end {
        AudioStreamEvent::AudioStreamEnd {
            conversation_id,
            chunk_count,
        } => {
            assert_eq!(conversation_id, id);
            assert_eq!(chunk_count, 3);
        }
        other => panic!("expected stream end, got {other:?}"),
    }

    h.shutdown.cancel();
}

#[tokio::test]
async fn requests_synthesize_in_fifo_order() {
    let server = MockServer::start().await;
    mock_voice("alpha", vec![0x11; 24]).mount(&server).await;
    mock_voice("beta", vec![0x22; 24]).mount(&server).await;

    let h = start_worker(&server, 8).await;
    let id = Uuid::new_v4();
    let mut out = h.broker.subscribe(&h.config.topics.audio_out(id)).await.unwrap();

    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_request,
        &request(id, "Première phrase.", "alpha"),
    )
    .await
    .unwrap();
    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_request,
        &request(id, "Deuxième phrase.", "beta"),
    )
    .await
    .unwrap();

    let observed = drain_observed(&mut out, Duration::from_millis(500)).await;
    let chunk_bytes: Vec<u8> = observed
        .iter()
        .filter_map(|o| match o {
            Observed::Chunk(chunk) => Some(chunk[0]),
            Observed::Envelope(_) => None,
        })
        .collect();
    // Every chunk of the first request precedes every chunk of the second.
    assert_eq!(chunk_bytes, vec![0x11, 0x11, 0x11, 0x22, 0x22, 0x22]);

    // Envelope pairing: start/end for item one, then start/end for item two.
    let envelopes: Vec<&AudioStreamEvent> = observed
        .iter()
        .filter_map(|o| match o {
            Observed::Envelope(e) => Some(e),
            Observed::Chunk(_) => None,
        })
        .collect();
    assert_eq!(envelopes.len(), 4);
    assert!(matches!(envelopes[0], AudioStreamEvent::AudioStreamStart { .. }));
    assert!(matches!(envelopes[1], AudioStreamEvent::AudioStreamEnd { chunk_count: 3, .. }));
    assert!(matches!(envelopes[2], AudioStreamEvent::AudioStreamStart { .. }));
    assert!(matches!(envelopes[3], AudioStreamEvent::AudioStreamEnd { chunk_count: 3, .. }));

    h.shutdown.cancel();
}

#[tokio::test]
async fn active_flag_tracks_synthesis() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/text-to-speech/alice/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(vec![0xAAu8; 8], "application/octet-stream")
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let h = start_worker(&server, 8).await;
    let id = Uuid::new_v4();
    let key = h.config.keys.tts_active_key(id);
    let mut out = h.broker.subscribe(&h.config.topics.audio_out(id)).await.unwrap();

    assert!(!h.kv.exists(&key).await.unwrap());
    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_request,
        &request(id, "Bonjour.", "alice"),
    )
    .await
    .unwrap();

    // The flag is set before the start envelope goes out.
    match next_observed(&mut out).await {
        Observed::Envelope(AudioStreamEvent::AudioStreamStart { .. }) => {}
        other => panic!("expected stream start, got {other:?}"),
    }
    assert!(h.kv.exists(&key).await.unwrap());

    // Wait for the delayed body to stream and the item to finish.
    let observed = drain_observed(&mut out, Duration::from_secs(1)).await;
    assert!(
        observed
            .iter()
            .any(|o| matches!(o, Observed::Envelope(AudioStreamEvent::AudioStreamEnd { .. })))
    );
    assert!(!h.kv.exists(&key).await.unwrap());

    h.shutdown.cancel();
}

#[tokio::test]
async fn stop_command_drains_queue_and_suppresses_end() {
    let server = MockServer::start().await;
    // A slow first item keeps the processor busy while the stop arrives.
    Mock::given(method("POST"))
        .and(path("/v1/text-to-speech/slow/stream"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(vec![0x33u8; 64], "application/octet-stream")
                .set_delay(Duration::from_millis(600)),
        )
        .mount(&server)
        .await;
    mock_voice("fast", vec![0x44; 16]).mount(&server).await;

    let h = start_worker(&server, 16).await;
    let id = Uuid::new_v4();
    let mut out = h.broker.subscribe(&h.config.topics.audio_out(id)).await.unwrap();

    for text in ["Un.", "Deux.", "Trois."] {
        publish_json(
            h.broker.as_ref(),
            &h.config.topics.tts_request,
            &request(id, text, "slow"),
        )
        .await
        .unwrap();
    }

    // First item announced, then stop while its body is still delayed.
    match next_observed(&mut out).await {
        Observed::Envelope(AudioStreamEvent::AudioStreamStart { .. }) => {}
        other => panic!("expected stream start, got {other:?}"),
    }
    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_control,
        &TtsControl::StopTts {
            conversation_id: id,
        },
    )
    .await
    .unwrap();

    let observed = drain_observed(&mut out, Duration::from_millis(900)).await;
    assert!(
        !observed
            .iter()
            .any(|o| matches!(o, Observed::Envelope(AudioStreamEvent::AudioStreamStart { .. }))),
        "queued items must not start after a stop"
    );
    assert!(
        !observed
            .iter()
            .any(|o| matches!(o, Observed::Envelope(AudioStreamEvent::AudioStreamEnd { .. }))),
        "the stopped item publishes no normal end envelope"
    );

    // The flag is cleared once the processor exits.
    assert!(!h.kv.exists(&h.config.keys.tts_active_key(id)).await.unwrap());

    // A new request after the stop gets a fresh processor.
    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_request,
        &request(id, "Encore.", "fast"),
    )
    .await
    .unwrap();
    let observed = drain_observed(&mut out, Duration::from_secs(1)).await;
    assert!(
        observed
            .iter()
            .any(|o| matches!(o, Observed::Envelope(AudioStreamEvent::AudioStreamEnd { .. })))
    );

    h.shutdown.cancel();
}

#[tokio::test]
async fn provider_failure_publishes_stream_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/text-to-speech/broken/stream"))
        .respond_with(ResponseTemplate::new(500).set_body_string("provider down"))
        .mount(&server)
        .await;

    let h = start_worker(&server, 16).await;
    let id = Uuid::new_v4();
    let mut out = h.broker.subscribe(&h.config.topics.audio_out(id)).await.unwrap();

    publish_json(
        h.broker.as_ref(),
        &h.config.topics.tts_request,
        &request(id, "Bonjour.", "broken"),
    )
    .await
    .unwrap();

    match next_observed(&mut out).await {
        Observed::Envelope(AudioStreamEvent::AudioStreamStart { .. }) => {}
        other => panic!("expected stream start, got {other:?}"),
    }
    match next_observed(&mut out).await {
        Observed::Envelope(AudioStreamEvent::AudioStreamError {
            conversation_id, ..
        }) => assert_eq!(conversation_id, id),
        other => panic!("expected stream error, got {other:?}"),
    }

    h.shutdown.cancel();
}
