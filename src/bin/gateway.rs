//! Gateway worker binary: WebSocket sessions + admin HTTP surface.

use std::sync::Arc;

use colloquy::bus::{KeyValueStore, MessageBus, RedisBroker};
use colloquy::config::PlatformConfig;
use colloquy::gateway::{GatewayState, serve};
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
    let broker = Arc::new(RedisBroker::connect(&config.broker.url).await?);
    let bus: Arc<dyn MessageBus> = broker.clone();
    let kv: Arc<dyn KeyValueStore> = broker;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let state = Arc::new(GatewayState::new(bus, kv, config));
    serve(state, shutdown).await.map_err(|e| {
        tracing::error!("gateway exited with error: {e}");
        anyhow::anyhow!("gateway failed: {e}")
    })?;

    tracing::info!("gateway shut down cleanly");
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
