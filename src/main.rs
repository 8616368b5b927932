#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # cc-executor
//!
//! WebSocket-fronted process-execution service: clients open one WebSocket
//! connection, get one session, and run CLI subprocesses one at a time
//! through a JSON-RPC 2.0 protocol (`execute` / `control` / `ping`), with
//! timeout estimation, output draining, and an external hook pipeline.
//!
//! Configuration is environment-only (`CC_EXECUTOR_*`, see `config.rs`);
//! there is no subcommand structure and no TOML file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use cc_executor::config::Config;
use cc_executor::hooks::HookConfig;
use cc_executor::registry::SessionRegistry;
use cc_executor::timing::TimingStore;
use cc_executor::ws::{self, AppState};

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            // Pre-tracing: the logger isn't initialized until the config that
            // configures it has loaded, so this goes straight to stderr.
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("cc-executor v{} starting", env!("CARGO_PKG_VERSION"));
    info!("listening on {}", config.listen_addr);

    let timing = Arc::new(TimingStore::new(
        config.timing_store_dsn.as_ref().map(PathBuf::from),
        config.history_ttl_s,
        config.history_samples_cap,
        config.stall_fraction_of_total,
        1.0,
        config.extreme_stall_timeout_s,
    ));
    timing.load().await;

    let hooks = match &config.hook_config_path {
        Some(path) => match HookConfig::load(path).await {
            Ok(hooks) => {
                info!(path = %path, "loaded hook configuration");
                Some(Arc::new(hooks))
            }
            Err(e) => {
                error!("failed to load hook configuration: {e}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let config = Arc::new(config);
    let registry = SessionRegistry::new(config.clone(), timing, hooks);

    let state = AppState {
        registry: registry.clone(),
        config: config.clone(),
        start_time: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(ws::health))
        .route("/ws/mcp", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {e}", config.listen_addr);
            std::process::exit(2);
        }
    };

    info!("server ready");

    // Periodic sweep: evict sessions that have been idle (no traffic, no
    // running execution) past the configured timeout.
    let sweep_registry = registry.clone();
    let idle_timeout_s = config.session_idle_timeout_s;
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            sweep_registry.sweep_idle(idle_timeout_s).await;
        }
    });

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!("server error: {e}");
        sweep_task.abort();
        std::process::exit(3);
    }

    info!("shutting down, cancelling running executions");
    sweep_task.abort();
    registry.close_all().await;
    info!("goodbye");
}
