//! Terminal chat client for the relay.
//!
//! Plain lines are sent as user messages. Commands:
//! `/approve <id>`, `/deny <id> [reason]`, `/interrupt [reason]`, `/quit`.
//! Ctrl+C cancels the turn being streamed.

use anyhow::Context;
use chatrelay_chat::{
    config::Config,
    conversation::{ChatSession, Exchange},
    playback::{LoggingSink, decode_wav_data_url, save_wav},
};
use chatrelay_core::{StreamChunk, UiChunk};
use chatrelay_realtime::RelayClient;
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "Chat with an agent backend over the relay")]
struct Cli {
    /// WebSocket endpoint; overrides RELAY_ENDPOINT.
    #[arg(long)]
    endpoint: Option<String>,
    /// Bearer token; overrides RELAY_AUTH_TOKEN.
    #[arg(long)]
    token: Option<String>,
    /// Directory where spoken replies are saved as WAV files.
    #[arg(long)]
    save_audio: Option<PathBuf>,
}

enum Input {
    Say(String),
    Approve(String),
    Deny(String, Option<String>),
    Interrupt(Option<String>),
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let Some(command) = line.strip_prefix('/') else {
        return Input::Say(line.to_string());
    };
    let mut words = command.splitn(3, char::is_whitespace);
    let name = words.next().unwrap_or_default();
    let first = words.next().map(str::to_string);
    let rest = words.next().map(str::trim).filter(|r| !r.is_empty()).map(str::to_string);
    match (name, first) {
        ("approve", Some(id)) => Input::Approve(id),
        ("deny", Some(id)) => Input::Deny(id, rest),
        ("interrupt", reason) => {
            let reason = match (reason, rest) {
                (Some(head), Some(tail)) => Some(format!("{head} {tail}")),
                (head, _) => head,
            };
            Input::Interrupt(reason)
        }
        ("quit", _) | ("exit", _) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

/// Prints one chunk of the streamed reply.
fn render(chunk: &StreamChunk, save_audio: Option<&PathBuf>, turn_id: &mut String) {
    let mut out = std::io::stdout();
    match chunk {
        StreamChunk::Ui(UiChunk::Start { message_id, .. }) => {
            if let Some(id) = message_id {
                turn_id.clone_from(id);
            }
            let _ = write!(out, "assistant> ");
        }
        StreamChunk::Ui(UiChunk::TextDelta { delta, .. }) => {
            let _ = write!(out, "{delta}");
        }
        StreamChunk::Ui(UiChunk::ToolInputAvailable { tool_name, input, .. }) => {
            let _ = write!(out, "\n[tool {tool_name} {input}]");
        }
        StreamChunk::Ui(UiChunk::ToolApprovalRequest { approval_id, .. }) => {
            let _ = write!(
                out,
                "\n[approval needed: /approve {approval_id} or /deny {approval_id} <reason>]"
            );
        }
        StreamChunk::Ui(UiChunk::ToolOutputAvailable { output, .. }) => {
            let _ = write!(out, "\n[tool output {output}]\n");
        }
        StreamChunk::Ui(UiChunk::ToolOutputError { error_text, .. }) => {
            let _ = write!(out, "\n[tool failed: {error_text}]\n");
        }
        StreamChunk::Ui(UiChunk::File { url, media_type, .. }) => match save_audio {
            Some(dir) => match decode_wav_data_url(url).map(|wav| save_wav(dir, turn_id, &wav)) {
                Some(Ok(path)) => {
                    let _ = write!(out, "\n[audio saved to {}]", path.display());
                }
                Some(Err(e)) => warn!(error = %e, "Failed to save audio."),
                None => debug!(%media_type, "File part is not WAV audio."),
            },
            None => {
                let _ = write!(out, "\n[{media_type} attachment]");
            }
        },
        StreamChunk::Ui(UiChunk::Error { error_text, .. }) => {
            let _ = write!(out, "\n[error: {error_text}]");
        }
        StreamChunk::Ui(UiChunk::Abort { .. }) => {
            let _ = write!(out, "\n[aborted]");
        }
        StreamChunk::Ui(UiChunk::Finish { .. }) => {
            let _ = writeln!(out);
        }
        _ => {}
    }
    let _ = out.flush();
}

/// Cancels `token` on Ctrl+C until the returned task is aborted.
fn cancel_on_ctrl_c(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    })
}

fn report(session: &ChatSession, exchange: Exchange) {
    if exchange.cancelled {
        println!("\n[cancelled]");
        session.interrupt(Some("cancelled by user".to_string()));
    }
    debug!(turns = exchange.turns, "Exchange finished.");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.relay_endpoint = endpoint;
    }
    if let Some(token) = cli.token {
        config.auth_token = Some(token.into());
    }

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    let mut relay_config = config
        .relay_config()
        .with_latency_callback(|rtt| debug!(rtt_ms = rtt.as_millis() as u64, "Keep-alive latency."));
    if cli.save_audio.is_some() {
        relay_config = relay_config.with_audio_sink(Arc::new(LoggingSink::default()));
    }
    info!(endpoint = %relay_config.endpoint, "Chat client configured.");

    let mut session = ChatSession::new(RelayClient::new(relay_config));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turn_id = String::from("turn");

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let cancel = CancellationToken::new();
        let watcher = cancel_on_ctrl_c(cancel.clone());
        let save_audio = cli.save_audio.as_ref();
        let on_chunk = |chunk: &StreamChunk| render(chunk, save_audio, &mut turn_id);

        let result = match parse_input(line) {
            Input::Say(text) => session.say(&text, Some(cancel), on_chunk).await.map(Some),
            Input::Approve(id) => {
                session
                    .answer_approval(&id, true, None, Some(cancel), on_chunk)
                    .await
            }
            Input::Deny(id, reason) => {
                session
                    .answer_approval(&id, false, reason, Some(cancel), on_chunk)
                    .await
            }
            Input::Interrupt(reason) => {
                session.interrupt(reason);
                Ok(None)
            }
            Input::Quit => {
                watcher.abort();
                break;
            }
            Input::Unknown(input) => {
                println!("unknown command: {input}");
                Ok(None)
            }
        };
        watcher.abort();

        match result {
            Ok(Some(exchange)) => report(&session, exchange),
            Ok(None) => {}
            Err(e) => println!("\n[relay error: {e}]"),
        }
        let pending = session.transcript().pending_approvals();
        if !pending.is_empty() {
            let ids: Vec<String> = pending.into_iter().map(|(id, _)| id).collect();
            println!("pending approvals: {}", ids.join(", "));
        }
    }

    session.close().await;
    info!("Chat client finished.");
    Ok(())
}
