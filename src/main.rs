// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! tiergate API server
//!
//! Signs users in with Google and admits API requests according to their
//! subscription tier.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tiergate::{config::Config, spawn_store_gc, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often expired windows, states and tokens are swept from memory.
const STORE_GC_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging
    init_logging()?;

    // Load configuration from environment
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(
        port = config.port,
        environment = ?config.environment,
        state_backend = ?config.state_backend,
        trusted_proxy_hops = config.trusted_proxy_hops,
        "Starting tiergate API"
    );

    let port = config.port;
    let state = Arc::new(
        AppState::from_config(config)
            .await
            .context("Failed to initialize application state")?,
    );
    tracing::info!(guards = ?state.api_pipeline.guard_names(), "Admission pipeline ready");

    let _gc = spawn_store_gc(state.stores.clone(), STORE_GC_INTERVAL);

    // Build router
    let app = tiergate::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    // Peer addresses back the login throttle when no proxy header is trusted.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

/// Initialize structured JSON logging.
fn init_logging() -> anyhow::Result<()> {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tiergate=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with(format)
        .try_init()?;
    Ok(())
}
