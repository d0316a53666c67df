//! Stoa gateway server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (config.toml in current directory)
//! cargo run -p stoa-gateway --release
//!
//! # Run with custom config path
//! CONFIG=/path/to/config.toml cargo run -p stoa-gateway
//!
//! # Configure logging level
//! RUST_LOG=info cargo run -p stoa-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — Path to TOML configuration file (default: `config.toml`)
//! - `HOST` — Override bind address (default: `0.0.0.0`)
//! - `PORT` — Override port (default: `3001`)
//! - `RUST_LOG` — Log level filter (default: `info`)
//! - Secrets referenced by `$VAR` in the config file (e.g. `HF_TOKEN`)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use stoa_gateway::catalog::{CatalogStore, MemoryCatalog};
use stoa_gateway::config::GatewayConfig;
use stoa_gateway::dispatch::Dispatcher;
use stoa_gateway::embeddings::{Embedder, HttpEmbedder};
use stoa_gateway::http::{AppState, RouteLimiters, router};
use stoa_gateway::metrics::MetricsRecorder;
use stoa_gateway::payment::{HttpFacilitator, PaymentGate};
use stoa_gateway::ratelimit;
use stoa_gateway::search::QueryRanker;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Gateway failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = GatewayConfig::load()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        network = %config.facilitator.network,
        facilitator = %config.facilitator.url,
        "Loaded configuration"
    );

    let store: Arc<dyn CatalogStore> = Arc::new(MemoryCatalog::new());
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::from_config(&config.embeddings)?);

    let facilitator = Arc::new(HttpFacilitator::new(
        &config.facilitator.url,
        Duration::from_secs(config.facilitator.timeout_secs),
    )?);
    let gate = Arc::new(PaymentGate::new(
        facilitator,
        config.facilitator.network.clone(),
        config.usdc_asset()?,
        config.facilitator.challenge_timeout_secs,
    ));

    // Kick off the one-time facilitator probe; a failure here is logged
    // and retried on first use rather than aborting startup.
    gate.ensure_ready().await;
    if gate.ready() {
        tracing::info!("facilitator initialized");
    }

    let limiters = RouteLimiters::new(&config.limits);
    let state = AppState {
        store: Arc::clone(&store),
        embedder: Arc::clone(&embedder),
        ranker: Arc::new(QueryRanker::new(Arc::clone(&store), Arc::clone(&embedder))),
        gate: Arc::clone(&gate),
        dispatcher: Arc::new(Dispatcher::new(Duration::from_secs(
            config.dispatch.timeout_secs,
        ))),
        metrics: Arc::new(MetricsRecorder::new(
            Arc::clone(&store),
            config.explorer_tx_base.clone(),
        )),
        limiters: limiters.clone(),
        public_base_url: config.public_base_url.clone(),
    };

    // Background maintenance: sweep expired rate windows and stale replay
    // entries. Restart-loses-state is acceptable for both.
    let cancel = CancellationToken::new();
    let sweep_interval = Duration::from_secs(config.limits.sweep_interval_secs);
    let sweeper = tokio::spawn(ratelimit::sweep_loop(
        limiters.all(),
        sweep_interval,
        cancel.clone(),
    ));
    let replay_sweeper = tokio::spawn({
        let gate = Arc::clone(&gate);
        let cancel = cancel.clone();
        async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = gate
                            .replay_guard()
                            .sweep(stoa_gateway::catalog::now_millis(), gate.replay_ttl_ms());
                        if removed > 0 {
                            tracing::debug!(removed, "swept settled payment nonces");
                        }
                    }
                    () = cancel.cancelled() => return,
                }
            }
        }
    });

    let app = router(state).layer(TraceLayer::new_for_http()).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cancel.cancel();
    let _ = sweeper.await;
    let _ = replay_sweeper.await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM (Unix) to initiate graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl-C, shutting down..."),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl-C");
        tracing::info!("Received Ctrl-C, shutting down...");
    }
}
