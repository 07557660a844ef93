//! # kiln
//!
//! Build web apps by chatting with an AI coding agent, with a live preview
//! of what it produces.
//!
//! This server provides:
//! - Chat turns driven through the agent CLI, streamed over SSE
//! - Per-project frontend/backend dev servers for the live preview
//! - File change notifications for the preview pane
//! - Scripted browser tests against the running preview
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Web UI     │────▶│  Axum HTTP   │────▶│  ChatService    │──▶ agent CLI
//! │  (static)   │     │  (api.rs)    │     │  (chat.rs)      │
//! └─────────────┘     └──────────────┘     └─────────────────┘
//!       ▲ SSE               │
//!       │                   ├──────────▶ PreviewManager ──▶ npm / uvicorn
//!       └───────────────────┤
//!                           ├──────────▶ WatchManager ───▶ notify
//!                           └──────────▶ TestDriver ─────▶ playwright
//! ```

mod agent;
mod api;
mod chat;
mod config;
mod doctor;
mod error;
mod ports;
mod preview;
mod process;
mod prompts;
mod protocol;
mod store;
mod testing;
mod watcher;

use axum::Router;
use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, process::ExitCode, sync::Arc, time::Duration};
use tokio::sync::watch;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::AppState;
use crate::config::Config;

/// How long open streams get to finish after shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "kiln", version, about = "Chat-driven web app builder with live preview")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web UI and API servers (default)
    Start(StartArgs),
    /// Check that the required external tools are installed
    Doctor,
}

#[derive(Args, Default)]
struct StartArgs {
    /// Port for the web UI
    #[arg(long)]
    port: Option<u16>,
    /// Port for the API server
    #[arg(long)]
    server_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();

    match cli.command.unwrap_or(Commands::Start(StartArgs::default())) {
        Commands::Doctor => {
            if doctor::run(&config).await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Start(args) => {
            if let Some(port) = args.port {
                config.ui_port = port;
            }
            if let Some(port) = args.server_port {
                config.api_port = port;
            }
            match start(config).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let ui_addr = SocketAddr::from(([0, 0, 0, 0], config.ui_port));
    let static_dir = config.static_dir.clone();

    let state = Arc::new(AppState::new(config)?);

    let api_app = api::router(state.clone());
    let ui_app = Router::new().fallback_service(ServeDir::new(&static_dir).append_index_html_on_directories(true));

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let ui_listener = tokio::net::TcpListener::bind(ui_addr).await?;
    info!("kiln v{} API listening on {}", env!("CARGO_PKG_VERSION"), api_addr);
    info!("Web UI on http://localhost:{} (serving {})", ui_addr.port(), static_dir.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_server = axum::serve(api_listener, api_app).with_graceful_shutdown(stopped(shutdown_rx.clone()));
    let ui_server = axum::serve(ui_listener, ui_app).with_graceful_shutdown(stopped(shutdown_rx));
    let api_task = tokio::spawn(async move { api_server.await });
    let ui_task = tokio::spawn(async move { ui_server.await });

    shutdown_signal().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    // Ends watch streams; dev servers must not outlive us
    state.shutdown().await;

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for (name, task) in [("API", api_task), ("UI", ui_task)] {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("{} server error: {}", name, e),
                Err(e) => error!("{} server task failed: {}", name, e),
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Open connections did not close within {}s", SHUTDOWN_GRACE.as_secs());
    }
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
