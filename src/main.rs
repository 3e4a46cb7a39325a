use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod attachments;
mod auth;
mod cache;
mod catalog;
mod chat;
mod config;
mod error;
mod middleware;
mod ratelimit;
mod state;
mod store;
mod upstream;
mod usage;

pub use config::Config;
pub use error::ApiError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit /healthz and exit immediately.
    // This avoids needing any external tool (curl/wget) in the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_gateway=info,usage=info,tower_http=warn".into()),
        )
        .init();

    // Load config: optional TOML file + environment overlay
    let config_path = std::env::var("GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/chat-gateway/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!(
        port = config.gateway.port,
        router = %config.router.url,
        cache = config.cache.url.is_some(),
        markers = config.gateway.stream_markers_enabled,
        "chat-gateway starting"
    );
    if config.router.api_key.is_none() {
        warn!("ROUTER_API_KEY is not set — upstream calls will be unauthenticated");
    }
    if config.auth.idp_public_key.is_none() {
        warn!("IDP_PUBLIC_KEY is not set — all presented credentials will be rejected");
    }
    if let Some(dsn) = &config.gateway.error_sink_dsn {
        info!(sink = %redact_dsn(dsn), "error sink configured");
    }
    if config.stores.store_url.is_some() || config.stores.blob_url.is_some() {
        // The store traits are the seam for external persistence; this binary
        // ships the in-memory implementations.
        warn!("STORE_URL/BLOB_URL set but no external store is compiled in — using in-memory stores");
    }

    let config = Arc::new(config);
    let state = Arc::new(state::AppState::new(
        Arc::clone(&config),
        config_path.clone(),
        state::Stores::in_memory(),
    ));

    // Spawn hot-reload watcher — polls the config file every 5 seconds.
    // The rate-limit matrix and connection settings are fixed at startup;
    // runtime stream flags and the feature matrix pick up changes live.
    tokio::spawn(config_watcher(Arc::clone(&state)));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    info!(%addr, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = api::router(Arc::clone(&state))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            config.gateway.request_timeout_secs,
        )))
        // Browser clients call from the app origin; the gateway itself is
        // origin-agnostic.
        .layer(tower_http::cors::CorsLayer::permissive());

    tokio::select! {
        result = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("gateway server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `chat-gateway --healthcheck` from Docker HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("GATEWAY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Keep credentials out of startup logs when the DSN embeds them.
fn redact_dsn(dsn: &str) -> String {
    match dsn.split_once('@') {
        Some((_, host)) => format!("…@{host}"),
        None => dsn.to_string(),
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change.
///
/// Uses filesystem `mtime` for change detection — no inotify/kqueue
/// dependencies. Parse failures are logged and ignored; the running config
/// is unchanged.
async fn config_watcher(state: Arc<state::AppState>) {
    let path = &state.config_path;

    let mut last_mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();

    // Initial tick fires immediately; skip it so we don't reload on startup.
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Config::load(path) {
            Ok(new_cfg) => {
                state.replace_config(Arc::new(new_cfg));
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
