//! Recruitment task server
//!
//! Runs the standard pipelines on an in-memory store behind the REST API.
//! Configuration comes from `RECRUIT_CONFIG` (TOML) and the environment.

use anyhow::Context;
use recruit_orchestrator::api::create_router;
use recruit_orchestrator::{AppConfig, InMemoryTaskStore, TaskSupervisor};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    tracing::info!("Loading server configuration...");
    let config = AppConfig::load().context("invalid configuration")?;

    tracing::info!(
        model = %config.llm.model,
        base_url = %config.llm.base_url,
        api_key_configured = !config.llm.api_key.is_empty(),
        max_concurrency = config.llm.max_concurrency,
        requests_per_minute = config.llm.requests_per_minute,
        workers = config.workers,
        task_timeout_secs = config.task_timeout_secs,
        "Configuration loaded"
    );
    if config.llm.api_key.is_empty() {
        tracing::warn!("LLM_API_KEY is not set; LLM steps will fail with LlmAuthError");
    }

    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_address()))?;

    let store = Arc::new(InMemoryTaskStore::new());
    let supervisor = Arc::new(
        TaskSupervisor::from_config(&config, store.clone()).context("cannot start supervisor")?,
    );

    let app = create_router(supervisor.clone(), Some(store));

    tracing::info!("Starting recruitment task server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("HTTP server stopped, draining task queue");
    supervisor.shutdown().await;
    tracing::info!("Recruitment task server shut down gracefully");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL-C signal, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, shutting down");
        }
    }
}
