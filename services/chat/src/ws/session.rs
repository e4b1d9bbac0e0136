//! One relay connection on the development backend.

use super::protocol::{self, Inbound};
use super::script;
use crate::state::AppState;
use anyhow::Result;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chatrelay_realtime::{ClientEvent, KeepAlive};
use futures_util::{
    SinkExt, StreamExt,
    stream::SplitSink,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Serves one client until it disconnects. Reply frames are paced by
/// `frame_interval` so that an `interrupt` can cut a reply short.
#[instrument(name = "relay_session", skip_all, fields(session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let session_id = Uuid::new_v4();
    tracing::Span::current().record("session_id", &session_id.to_string());
    info!("New relay connection.");

    let (mut socket_tx, mut socket_rx) = socket.split();
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut pace = tokio::time::interval(state.frame_interval.max(Duration::from_millis(1)));
    pace.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = socket_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_text(&text, &state, &mut socket_tx, &mut pending).await {
                        error!(error = ?e, "Failed to answer client message.");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Error receiving from client WebSocket.");
                    break;
                }
            },
            _ = pace.tick(), if !pending.is_empty() => {
                if let Some(frame) = pending.pop_front() {
                    if let Err(e) = socket_tx.send(Message::Text(frame.into())).await {
                        warn!(error = %e, "Failed to send frame; dropping connection.");
                        break;
                    }
                }
            }
        }
    }
    info!(undelivered = pending.len(), "Relay connection finished.");
}

async fn handle_text(
    text: &str,
    state: &AppState,
    socket_tx: &mut SplitSink<WebSocket, Message>,
    pending: &mut VecDeque<String>,
) -> Result<()> {
    let inbound = match protocol::decode(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "Ignoring undecodable client message.");
            return Ok(());
        }
    };

    match inbound {
        Inbound::KeepAlive(KeepAlive::Ping { timestamp }) => {
            let pong = serde_json::to_string(&KeepAlive::Pong { timestamp })?;
            socket_tx.send(Message::Text(pong.into())).await?;
        }
        Inbound::KeepAlive(KeepAlive::Pong { .. }) => {}
        Inbound::Event(ClientEvent::Message { messages }) => {
            if !pending.is_empty() {
                debug!(dropped = pending.len(), "New turn replaces an unfinished reply.");
                pending.clear();
            }
            info!(message_count = messages.len(), "Starting turn.");
            pending.extend(script::respond(&messages, state)?);
        }
        Inbound::Event(ClientEvent::Interrupt { reason }) => {
            info!(?reason, dropped = pending.len(), "Turn interrupted by client.");
            pending.clear();
            pending.extend(script::aborted()?);
        }
        Inbound::Event(event) => {
            debug!(kind = event.kind(), "Ignoring client event.");
        }
    }
    Ok(())
}
