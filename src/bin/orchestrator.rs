//! LLM orchestrator worker binary.

use std::sync::Arc;

use colloquy::bus::{KeyValueStore, MessageBus, RedisBroker};
use colloquy::config::PlatformConfig;
use colloquy::conversation::ConversationConfigStore;
use colloquy::history::HistoryStore;
use colloquy::orchestrator::Orchestrator;
use colloquy::orchestrator::llm::LlmClient;
use colloquy::orchestrator::tools::{ToolRouter, function_schema};
use colloquy::orchestrator::turn::TurnContext;
use serde_json::json;
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

    let mut tools = ToolRouter::new(bus.clone(), config.topics.clone(), &config.llm);
    register_builtin_tools(&mut tools);

    let ctx = TurnContext {
        bus: bus.clone(),
        history: HistoryStore::new(kv.clone(), config.keys.clone()),
        conversation_config: ConversationConfigStore::new(kv, config.keys.clone()),
        llm: LlmClient::new(config.llm.clone()),
        tools: Arc::new(tools),
        config: Arc::new(config),
    };

    Orchestrator::new(ctx).run(shutdown).await.map_err(|e| {
        tracing::error!("orchestrator exited with error: {e}");
        anyhow::anyhow!("orchestrator failed: {e}")
    })?;

    tracing::info!("orchestrator shut down cleanly");
    Ok(())
}

fn register_builtin_tools(tools: &mut ToolRouter) {
    tools.register(
        "get_weather",
        function_schema(
            "get_weather",
            "Current weather conditions for a location",
            json!({
                "type": "object",
                "properties": {
                    "location": { "type": "string", "description": "City name" }
                },
                "required": ["location"]
            }),
        ),
        Arc::new(|args| {
            let location = args["location"].as_str().unwrap_or("unknown").to_owned();
            Ok(json!({
                "temperature": "25C",
                "condition": "sunny",
                "location": location,
            }))
        }),
    );
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
