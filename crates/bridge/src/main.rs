//! MCP Bridge
//!
//! Expose stdio-based MCP servers over the Streamable HTTP transport.

use bridge::config::{BridgeConfig, CliArgs};
use bridge::http::{self, AppState};
use bridge::proxy::{ProxyCore, ProxySettings};
use bridge::session::{SessionRegistry, SessionSettings};
use bridge::supervisor::{ProcessSupervisor, SupervisorSettings};
use clap::Parser;
use std::io::{IsTerminal as _, stdout};
use std::net::SocketAddr;
use std::sync::{Arc, atomic::AtomicU64};
use std::time::Instant;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();
    let config = BridgeConfig::load(cli)?;

    if config.cli.print_effective_config {
        let yaml = serde_yaml::to_string(&config.effective())?;
        print!("{yaml}");
        return Ok(());
    }

    init_logging(&config.settings.log_level);

    tracing::info!("Starting MCP Bridge v{}", VERSION);
    tracing::info!("Loaded {} server(s) from config", config.servers.len());

    let (supervisor, process_events) = ProcessSupervisor::new(SupervisorSettings {
        spawn_wait: config.settings.spawn_wait(),
        restart_delay: config.settings.restart_delay(),
        max_restart_attempts: config.settings.max_restart_attempts,
    });
    let (registry, registry_events) = SessionRegistry::new(SessionSettings {
        max_sessions: config.settings.max_sessions,
        session_timeout: config.settings.session_timeout(),
    });
    let proxy = ProxyCore::new(
        supervisor.clone(),
        registry.clone(),
        &config.servers,
        ProxySettings {
            request_timeout: config.settings.request_timeout(),
            batch_timeout: config.settings.batch_timeout(),
        },
    );

    // Cancellation token for graceful shutdown.
    let ct = CancellationToken::new();
    proxy.spawn_event_pump(process_events, registry_events, ct.child_token());
    registry.spawn_sweeper(ct.child_token());

    let state = Arc::new(AppState {
        proxy: proxy.clone(),
        cors: config.cors.clone(),
        auth: config.auth.clone(),
        sse_keep_alive: config.settings.sse_keep_alive(),
        event_ids: Default::default(),
        start_time: Instant::now(),
        version: VERSION,
        total_requests: AtomicU64::new(0),
        failed_requests: AtomicU64::new(0),
    });

    // CORS sits outside auth so preflights never need credentials.
    let router = http::create_router(state.clone());
    let router = http::with_optional_bearer_auth(router, state.clone());
    let router = http::with_cors(router, state.clone());
    let router = http::with_request_counting(router, state.clone());
    let app = http::with_tracing(router);

    let addr: SocketAddr = config.settings.bind.parse().map_err(|e| {
        anyhow::anyhow!("Invalid bind address '{}': {}", config.settings.bind, e)
    })?;

    tracing::info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let ct_serve = ct.clone();

    let server = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            ct_serve.cancelled().await;
        });
        if let Err(e) = server.await {
            tracing::error!(error = %e, "http server stopped with error");
        }
    });

    shutdown_signal().await;

    // Stop the listener and background tasks, close every session's SSE
    // streams, then take the subprocesses down directly.
    ct.cancel();
    registry.destroy_all();
    supervisor.kill_all().await;
    let _ = server.await;

    tracing::info!("Bridge shut down gracefully");
    Ok(())
}

/// Initialize logging based on the log level string.
fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    // Check if stdout is a TTY for format selection
    let is_tty = stdout().is_terminal();

    if is_tty {
        // Human-readable format for development
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    } else {
        // JSON format for production
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
