//! TTS worker binary.

use std::sync::Arc;

use colloquy::bus::{KeyValueStore, MessageBus, RedisBroker};
use colloquy::config::PlatformConfig;
use colloquy::tts::SpeechSynthesizer;
use colloquy::tts::worker::TtsWorker;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = PlatformConfig::from_env();

    // Backend misconfiguration (missing API key, unusable executable) is
    // fatal before the worker subscribes to anything.
    let synthesizer = SpeechSynthesizer::from_config(&config.tts).map_err(|e| {
        tracing::error!("TTS backend unavailable: {e}");
        anyhow::anyhow!("TTS backend unavailable: {e}")
    })?;

    let broker = Arc::new(RedisBroker::connect(&config.broker.url).await?);
    let bus: Arc<dyn MessageBus> = broker.clone();
    let kv: Arc<dyn KeyValueStore> = broker;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    TtsWorker::new(bus, kv, synthesizer, config)
        .run(shutdown)
        .await
        .map_err(|e| {
            tracing::error!("TTS worker exited with error: {e}");
            anyhow::anyhow!("TTS worker failed: {e}")
        })?;

    tracing::info!("TTS worker shut down cleanly");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        let mut term =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!("cannot install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
