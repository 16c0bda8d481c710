use std::sync::Arc;
use std::time::Duration;

use args::Args;
use backend::Backend as _;
use clap::Parser;
use gateway::GatewayState;
use ragdocs::{DocsIndex, DocsSearchTool};
use tokio_util::sync::CancellationToken;
use tools::ToolRegistry;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logger::init(&args.log);
    log::info!("toolgate {}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::from_env()?;
    config.validate()?;

    if args.config_check {
        log::info!("Configuration OK");
        return Ok(());
    }

    let backend = backend::from_config(&config.backend, None);

    if config.server.health_check_on_startup {
        match backend.health().await {
            Ok(()) => log::info!(
                "Backend '{}' is healthy at {} (model '{}')",
                backend.name(),
                config.backend.endpoint,
                config.backend.model
            ),
            Err(err) => log::warn!("Startup health check failed: {err}. Serving anyway; /health will report it."),
        }
    }

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(tools::EchoTool))?;

    let rag = if config.rag.enabled {
        match DocsIndex::open(config.rag.clone()).await {
            Ok(index) => {
                registry.register(Arc::new(DocsSearchTool::new(Arc::clone(&index))))?;
                log::info!("Documentation index ready ({} chunks)", index.chunk_count().await);
                Some(index)
            }
            Err(err) => {
                // Fail closed on the index, open on chat: the gateway
                // keeps serving without documentation search.
                log::error!("Documentation index unavailable: {err}. Continuing without search_docs.");
                None
            }
        }
    } else {
        None
    };

    let state = Arc::new(GatewayState::new(
        Arc::clone(&backend),
        Arc::new(registry),
        config.chat.clone(),
        rag.clone(),
    ));

    let updater = rag.as_ref().map(|index| Arc::clone(index).spawn_updater());
    let enricher = if config.rag.contextual_retrieval_enabled {
        rag.as_ref().map(|index| Arc::clone(index).spawn_enricher(Arc::clone(&backend)))
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received shutdown signal, shutting down gracefully...");
                shutdown.cancel();
            }
        });
    }

    let listen_address = format!("{}:{}", config.server.bind_host, config.server.bind_port);
    let listener = tokio::net::TcpListener::bind(&listen_address).await?;

    log::info!("Chat endpoint: http://{listen_address}/v1/chat/completions");

    let app = gateway::router(state);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.map_err(|e| anyhow::anyhow!("Server failed: {e}"))?;
        }
        _ = shutdown.cancelled() => {}
    }

    // Background tasks observe the flag between batches.
    if let Some(index) = &rag {
        index.shutdown();
    }

    for handle in [updater, enricher].into_iter().flatten() {
        if tokio::time::timeout(Duration::from_secs(10), handle).await.is_err() {
            log::warn!("Background task did not stop within 10s; exiting anyway");
        }
    }

    Ok(())
}
