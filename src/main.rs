//! MCPLens - inspector backend for Model Context Protocol servers
//!
//! Main entry point: parses flags, builds the core singletons (hub,
//! elicitation broker, client manager, chat engine), registers preset
//! servers, and serves the HTTP edge until interrupted.
//!
//! Exit codes: `0` on clean shutdown, `1` on unrecoverable bootstrap
//! failure.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcplens::chat::ChatEngine;
use mcplens::cli::Cli;
use mcplens::config::PresetFile;
use mcplens::hub::elicitation::ElicitationBroker;
use mcplens::hub::EventHub;
use mcplens::manager::ClientManager;
use mcplens::server::{build_router, AppState};

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse_args();
    let settings = cli.settings();

    if let Err(e) = run(cli, settings).await {
        tracing::error!("bootstrap failed: {e:#}");
        eprintln!("mcplens: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, settings: mcplens::Settings) -> mcplens::Result<()> {
    let hub = Arc::new(EventHub::new());
    let broker = Arc::new(ElicitationBroker::new(Arc::clone(&hub)));
    let manager = ClientManager::new(settings.clone(), Arc::clone(&hub), broker);
    let engine = Arc::new(ChatEngine::new(Arc::clone(&manager), Arc::clone(&hub)));

    // Register preset servers before accepting traffic. Individual connect
    // failures are recorded on the records, not fatal.
    if let Some(path) = &cli.config {
        let presets = PresetFile::load(path)?;
        for (id, config) in presets.servers {
            manager
                .add_server(id.clone(), id.clone(), config)
                .await?;
            if let Err(e) = manager.connect(&id).await {
                tracing::warn!(server = %id, "preset server failed to connect: {e:#}");
            }
        }
    }

    let state = AppState::new(manager, engine, settings.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .map_err(|e| {
            mcplens::McpLensError::Config(format!(
                "cannot bind {}: {}",
                settings.bind_addr, e
            ))
        })?;

    tracing::info!(
        addr = %settings.bind_addr,
        web_mode = settings.web_mode,
        "mcplens listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| mcplens::McpLensError::Internal(format!("server error: {e}")))?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("interrupt received; shutting down");
}

/// Initialize tracing subscriber with environment filter
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcplens=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
