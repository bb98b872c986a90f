use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_llm::embedding::OpenAiEmbeddings;
use relay_llm::gateway::http::AppState;
use relay_llm::gateway::{GatewayConfig, SemanticCache};
use relay_llm::providers::{default_base_url, OpenAiCompatibleModel};
use relay_llm::types::ProviderId;

fn init_tracing(json_logs: bool) {
    let default_directive =
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::from_env();
    init_tracing(config.json_logs);

    let enabled = config.enabled_providers();
    if enabled.is_empty() {
        warn!("no provider credentials configured; /ready will report unavailable");
    }

    let mut state = AppState::new(&config);
    for provider in &enabled {
        let api_key = config.api_keys.get(provider).cloned().unwrap_or_default();
        let model = OpenAiCompatibleModel::new(*provider, default_base_url(*provider), api_key);
        state = state.with_model(Arc::new(model));
    }

    if config.cache.enabled {
        match config.api_keys.get(&ProviderId::OpenAi) {
            Some(api_key) => {
                let embedder = Arc::new(OpenAiEmbeddings::new(
                    api_key.clone(),
                    config.cache.embedding_model.clone(),
                    config.cache.embedding_dimensions,
                ));
                match SemanticCache::new(config.cache.clone(), embedder) {
                    Ok(cache) => {
                        if let Err(error) = cache.ensure_index().await {
                            warn!(%error, "vector index bootstrap failed; lookups will miss until redis recovers");
                        }
                        state = state.with_cache(cache);
                    }
                    Err(error) => warn!(%error, "semantic cache disabled"),
                }
            }
            None => warn!("semantic cache needs OPENAI_API_KEY for embeddings; disabled"),
        }
    }

    let app = relay_llm::gateway::http::router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, providers = ?enabled, "relay-gateway listening");

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received; draining in-flight requests");
            signal_token.cancel();
        }
    });

    // Stop accepting on the signal, drain in-flight work, and give up on
    // stragglers once the drain deadline passes.
    let drain = Duration::from_millis(config.shutdown_drain_ms);
    let graceful = shutdown.clone().cancelled_owned();
    tokio::select! {
        result = axum::serve(listener, app).with_graceful_shutdown(graceful) => result?,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(drain).await;
        } => {
            warn!(drain_ms = config.shutdown_drain_ms, "drain deadline exceeded; closing remaining connections");
        }
    }

    info!("shutdown complete");
    Ok(())
}
