mod analysis;
mod config;
mod conversation;
mod errors;
mod gateway;
mod presentation;
mod routes;
mod session;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::gateway::HttpGateway;
use crate::routes::build_router;
use crate::session::SessionRegistry;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting JobMatch API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize reasoning gateway client
    let gateway = Arc::new(HttpGateway::new(&config)?);
    info!(
        "Gateway client initialized ({}, timeout {:?})",
        config.gateway_url, config.gateway_timeout
    );

    // Build app state
    let sessions = Arc::new(SessionRegistry::new(gateway, config.gateway_timeout));
    sessions.spawn_pruner(config.session_idle_timeout);
    info!(
        "Idle sessions expire after {:?}",
        config.session_idle_timeout
    );
    let state = AppState {
        sessions,
        config: config.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: restrict origins once the UI host is fixed

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
