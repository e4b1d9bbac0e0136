//! Development backend speaking the relay wire protocol.
//!
//! Serves scripted replies at `/ws` so the chat client can be tried locally.

use anyhow::Context;
use chatrelay_chat::{config::Config, router::create_router, state::AppState};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::info;

#[derive(Parser, Debug)]
#[command(version, about = "Scripted backend for the chat relay")]
struct Cli {
    /// Address to listen on; overrides BIND_ADDRESS.
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Delay between reply frames, in milliseconds.
    #[arg(long, default_value_t = 5)]
    frame_interval_ms: u64,
    /// PCM blocks streamed for `audio:` prompts.
    #[arg(long, default_value_t = 60)]
    audio_chunks: u32,
}

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let app_state = Arc::new(AppState {
        frame_interval: Duration::from_millis(cli.frame_interval_ms),
        audio_chunks: cli.audio_chunks,
        ..AppState::default()
    });
    let app = create_router(app_state);

    let bind_address = cli.bind.unwrap_or(config.bind_address);
    info!(%bind_address, "Mock backend configured. Starting server...");
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
