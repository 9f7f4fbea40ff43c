//! Code Assist gateway
//!
//! Single-binary Rust service that:
//! 1. Holds a multi-account OAuth credential pool on disk.
//! 2. Listens for incoming assistant requests and routes each one through
//!    the account pool to the upstream Code Assist API.
//! 3. Exposes a separate admin listener for pool management (merge/list/
//!    remove accounts), not reachable from the proxy surface.

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use account_auth::CredentialStore;
use account_pool::AccountManager;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use request_transform::PassthroughTransformer;
use router::{Endpoint, EndpointFallbackLoop, EndpointTier, RequestRouter};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::ProxyState;

/// Shared application state accessible from all proxy handlers.
#[derive(Clone)]
struct AppState {
    proxy: ProxyState,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting code-assist-gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config =
        Config::load(&config_path).with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_listen_addr = %config.server.admin_listen_addr,
        production_endpoint = %config.pool.production_endpoint,
        "configuration loaded"
    );

    let pool_path = match &config.pool.path {
        Some(p) => p.clone(),
        None => CredentialStore::default_path().context("could not determine account pool path")?,
    };
    info!(path = %pool_path.display(), "loading account pool");
    let store = Arc::new(CredentialStore::load(pool_path).await.context("failed to load account pool")?);
    store.clone().spawn_flush_task(account_auth::DEFAULT_FLUSH_INTERVAL);

    let accounts = Arc::new(AccountManager::new(store, config.router_config().max_backoff_ms));

    if config.refresh.proactive_token_refresh {
        let client = reqwest::Client::new();
        let buffer_ms = config.refresh.proactive_refresh_buffer_seconds * 1_000;
        let queue = Arc::new(account_pool::ProactiveRefreshQueue::new(accounts.clone(), client, buffer_ms));
        let check_interval = Duration::from_secs(config.refresh.proactive_refresh_check_interval_seconds);
        queue.spawn(check_interval);
        info!(buffer_ms, "proactive token refresh enabled");
    }

    let mut endpoints = Vec::new();
    if let Some(url) = &config.pool.sandbox_endpoint {
        endpoints.push(Endpoint {
            tier: EndpointTier::DailySandbox,
            base_url: url.clone(),
        });
    }
    if let Some(url) = &config.pool.autopush_endpoint {
        endpoints.push(Endpoint {
            tier: EndpointTier::Autopush,
            base_url: url.clone(),
        });
    }
    endpoints.push(Endpoint {
        tier: EndpointTier::Production,
        base_url: config.pool.production_endpoint.clone(),
    });
    let endpoints = Arc::new(EndpointFallbackLoop::new(endpoints));

    let transformer = Arc::new(PassthroughTransformer::new());
    let http_client = reqwest::Client::new();

    let request_router = Arc::new(RequestRouter::new(
        accounts.clone(),
        endpoints,
        transformer,
        http_client,
        config.router_config(),
    ));

    metrics::install_recorder();

    let proxy_state = ProxyState { router: request_router };
    let app_state = AppState { proxy: proxy_state };

    let proxy_app = Router::new()
        .route("/health", get(health_handler))
        .fallback(proxy_handler)
        .with_state(app_state);

    let admin_app = build_admin_router(AdminState::new(accounts));

    let proxy_listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.server.admin_listen_addr))?;

    info!(addr = %config.server.listen_addr, "proxy listening");
    info!(addr = %config.server.admin_listen_addr, "admin listening");

    let proxy_server = axum::serve(proxy_listener, proxy_app).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { proxy_server.await.context("proxy server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

/// Health endpoint: returns JSON with status and uptime.
async fn health_handler() -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        axum::Json(serde_json::json!({ "status": "healthy" })),
    )
}

/// Catch-all handler that routes all non-health requests through the pool.
async fn proxy_handler(State(state): State<AppState>, request: axum::http::Request<axum::body::Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let path = request.uri().path().to_string();
    let body = match axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024).await {
        Ok(b) => b,
        Err(e) => {
            return (
                axum::http::StatusCode::BAD_REQUEST,
                axum::Json(serde_json::json!({ "error": format!("failed to read request body: {e}") })),
            )
                .into_response();
        }
    };
    proxy::proxy_request(&state.proxy, &path, body, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
