//! fsk-daemon entry point.
//!
//! Thin on purpose: tracing, config, service bootstrap, middleware and the
//! HTTP server. Handlers live in `routes.rs`, shared state in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use fsk_config::{load_layered_yaml, resolve_authority_secrets, ServiceConfig};
use fsk_daemon::{bootstrap, routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

const DEFAULT_CONFIG: &str = "config/defaults.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Dev convenience; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let cfg = load_config()?;
    let secrets = resolve_authority_secrets(&cfg)?;

    let service = Arc::new(bootstrap::open_service(&cfg, secrets).await?);
    info!(
        store = service.store_kind(),
        transport = service.transport_name(),
        data_dir = %cfg.data_dir.display(),
        "compliance service ready"
    );

    let shared = Arc::new(state::AppState::new(Arc::clone(&service)));
    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_status_forwarder(Arc::clone(&shared));
    let poller = service.start_poller(&cfg.poll);

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = match bind_addr_from_env() {
        Some(a) => a,
        None => cfg
            .daemon
            .addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid daemon.addr {:?}", cfg.daemon.addr))?,
    };
    info!("fsk-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    poller.shutdown().await;
    info!("fsk-daemon stopped");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// `FSK_CONFIG` holds a comma-separated list of YAML files merged in order.
/// Without it, `config/defaults.yaml` is used when present, else built-in
/// defaults.
fn load_config() -> anyhow::Result<ServiceConfig> {
    let paths: Vec<String> = match std::env::var("FSK_CONFIG") {
        Ok(v) => v
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) if std::path::Path::new(DEFAULT_CONFIG).exists() => vec![DEFAULT_CONFIG.to_string()],
        Err(_) => Vec::new(),
    };

    if paths.is_empty() {
        info!("no config files; using built-in defaults");
        let cfg = ServiceConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }

    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    let loaded = load_layered_yaml(&refs)?;
    info!(config_hash = %loaded.config_hash, files = ?paths, "config loaded");
    ServiceConfig::from_loaded(&loaded)
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("FSK_DAEMON_ADDR").ok()?.parse().ok()
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

/// CORS: allow only localhost origins (settings UI dev servers).
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
