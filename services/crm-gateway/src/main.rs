//! Multi-tenant CRM credential gateway
//!
//! Single-binary service that:
//! 1. Authenticates tenants by API key, enforcing quota and rate limits
//! 2. Resolves each tenant's upstream CRM credential (OAuth or static key)
//! 3. Dispatches named operations to the CRM API and meters usage
//! 4. Keeps OAuth tokens fresh in the background

mod admin;
mod api;
mod app;
mod config;
mod error;
mod metrics;
#[cfg(test)]
mod testutil;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::json;
use tenant_store::SqliteStore;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::{AppState, Gateway, spawn_limiter_cleanup};
use crate::config::Config;

/// How long in-flight requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the public router. The concurrency limit caps in-flight requests at
/// `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/oauth/authorize", get(api::authorize))
        .route("/oauth/callback", get(api::callback))
        .route("/v1/tenant", get(api::tenant_view))
        .route("/v1/operations/{name}", post(api::invoke_operation))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting crm-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let secrets = config.secrets().context("failed to resolve secrets")?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        environment = ?config.server.environment,
        database = %config.database.path.display(),
        upstream_url = %config.upstream.base_url,
        operations = config.operations.len(),
        "configuration loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.database.path)
            .with_context(|| format!("failed to open {}", config.database.path.display()))?,
    );

    let gateway = Gateway::build(&config, secrets, store, prometheus)?;

    let background = [
        tenant_access::spawn_refresh_task(
            gateway.tokens.clone(),
            config.limits.background_refresh_interval(),
        ),
        crm_auth::spawn_state_cleanup(
            gateway.states.clone(),
            config.limits.background_refresh_interval(),
        ),
        spawn_limiter_cleanup(gateway.limiter.clone(), config.limits.rate_window()),
    ];

    let public_app = build_router(gateway.app.clone(), config.server.max_connections);
    let admin_app = admin::build_admin_router(gateway.admin.clone());

    let public_listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin to {}", config.server.admin_addr))?;

    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // The drain timeout starts when the shutdown signal fires: both servers
    // are told to drain, then the drain is raced against DRAIN_TIMEOUT.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut public_rx = shutdown_rx.clone();
    let public_server = tokio::spawn(async move {
        axum::serve(public_listener, public_app)
            .with_graceful_shutdown(async move {
                let _ = public_rx.changed().await;
            })
            .await
    });
    let mut admin_rx = shutdown_rx;
    let admin_server = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(async move {
                let _ = admin_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    for task in &background {
        task.abort();
    }

    match tokio::time::timeout(DRAIN_TIMEOUT, async {
        (public_server.await, admin_server.await)
    })
    .await
    {
        Ok((public, admin)) => {
            for (name, outcome) in [("public", public), ("admin", admin)] {
                match outcome {
                    Ok(Ok(())) => info!(server = name, "drained"),
                    Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
                    Err(e) => error!(server = name, error = %e, "server task panicked"),
                }
            }
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness plus a few counters. Never touches tenant data.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "operations": state.dispatcher.catalog().len(),
    }))
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
