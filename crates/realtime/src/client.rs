//! Connection and per-turn stream lifecycle.
//!
//! A [`RelayClient`] lazily opens one WebSocket connection and reuses it across
//! turns. A single spawned task owns the socket, the current [`TurnSink`], the
//! event dispatcher and the keep-alive timer; callers talk to it over a
//! command channel.

use crate::config::RelayConfig;
use crate::dispatch::EventDispatcher;
use crate::error::{RelayError, Result, SinkClosed};
use crate::event::{AudioAction, ClientEvent};
use crate::frame::{self, Frame, KeepAlive};
use chatrelay_core::{StreamChunk, UiMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const LARGE_PAYLOAD_WARN_BYTES: usize = 1_000_000;
const LARGE_PAYLOAD_ERROR_BYTES: usize = 5_000_000;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type TurnItem = Result<StreamChunk>;

/// Chunks of one turn. Ends after the turn completes; a terminal error is
/// delivered as the last item.
pub type ChunkStream = UnboundedReceiverStream<TurnItem>;

/// State of the relay's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Destination of every chunk produced during one turn.
pub struct TurnSink {
    id: u64,
    tx: Option<mpsc::UnboundedSender<TurnItem>>,
    cancel: Option<CancellationToken>,
}

impl TurnSink {
    pub fn new(id: u64, cancel: Option<CancellationToken>) -> (Self, ChunkStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                tx: Some(tx),
                cancel,
            },
            UnboundedReceiverStream::new(rx),
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    pub fn deliver(&mut self, chunk: StreamChunk) -> std::result::Result<(), SinkClosed> {
        let tx = self.tx.as_ref().ok_or(SinkClosed)?;
        if tx.send(Ok(chunk)).is_err() {
            self.tx = None;
            return Err(SinkClosed);
        }
        Ok(())
    }

    /// Delivers a terminal error and closes the sink.
    pub fn fail(&mut self, err: RelayError) -> std::result::Result<(), SinkClosed> {
        let tx = self.tx.take().ok_or(SinkClosed)?;
        tx.send(Err(err)).map_err(|_| SinkClosed)
    }

    /// Ends the stream. Errors when the sink was already closed on either end.
    pub fn close(&mut self) -> std::result::Result<(), SinkClosed> {
        match self.tx.take() {
            Some(tx) if !tx.is_closed() => Ok(()),
            _ => Err(SinkClosed),
        }
    }

    async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}

enum Command {
    BeginTurn { sink: TurnSink, payload: String },
    Send { kind: &'static str, payload: String },
    Close,
}

struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Client side of the bidirectional relay.
pub struct RelayClient {
    config: RelayConfig,
    connection: Option<ConnectionHandle>,
    state: Arc<watch::Sender<ConnectionState>>,
    next_turn: u64,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unconnected);
        Self {
            config,
            connection: None,
            state: Arc::new(state),
            next_turn: 0,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// State of the current connection, or of the last one once it is gone.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observes every state transition, including the ones made while a call
    /// such as [`RelayClient::send`] is still awaiting.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Starts a turn with the full conversation and returns its chunk stream.
    ///
    /// Opens the connection first when there is no usable one; only this
    /// connect step is awaited, bounded by the configured timeout. Any turn
    /// still streaming is closed before the new one is installed.
    pub async fn send(
        &mut self,
        messages: Vec<UiMessage>,
        cancel: Option<CancellationToken>,
    ) -> Result<ChunkStream> {
        let message_count = messages.len();
        let payload = frame::encode_event(&ClientEvent::Message { messages })?;
        log_payload_size(payload.len(), message_count);

        let commands = self.ensure_connected().await?;
        self.next_turn += 1;
        let (sink, stream) = TurnSink::new(self.next_turn, cancel);
        commands
            .send(Command::BeginTurn { sink, payload })
            .await
            .map_err(|_| RelayError::NotConnected)?;
        debug!(turn = self.next_turn, message_count, "turn started");
        Ok(stream)
    }

    /// Asks the backend to stop the current response.
    pub fn interrupt(&self, reason: Option<String>) {
        self.send_event(ClientEvent::Interrupt { reason });
    }

    pub fn start_audio_input(&self) {
        self.send_event(ClientEvent::AudioControl {
            action: AudioAction::Start,
        });
    }

    pub fn stop_audio_input(&self) {
        self.send_event(ClientEvent::AudioControl {
            action: AudioAction::Stop,
        });
    }

    /// Streams one block of microphone PCM, base64 encoded.
    pub fn send_audio_chunk(&self, audio: String, sample_rate: u32, channels: u16, bit_depth: u16) {
        self.send_event(ClientEvent::AudioChunk {
            audio,
            sample_rate,
            channels,
            bit_depth,
        });
    }

    /// Reports the output of a tool the client executed.
    pub fn send_tool_result(&self, tool_call_id: impl Into<String>, output: serde_json::Value) {
        self.send_event(ClientEvent::ToolResult {
            tool_call_id: tool_call_id.into(),
            output,
        });
    }

    /// Closes the connection. Does nothing when there is none.
    pub async fn close(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if !connection.task.is_finished() {
            self.state.send_replace(ConnectionState::Closing);
        }
        let _ = connection.commands.send(Command::Close).await;
        let mut task = connection.task;
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            warn!("relay connection did not shut down in time; aborting");
            task.abort();
            let _ = task.await;
        }
        self.state.send_replace(ConnectionState::Closed);
        info!("relay connection closed");
    }

    fn send_event(&self, event: ClientEvent) {
        let kind = event.kind();
        let Some(connection) = self
            .connection
            .as_ref()
            .filter(|c| self.state() == ConnectionState::Open && !c.task.is_finished())
        else {
            warn!(kind, "connection is not open; dropping client event");
            return;
        };
        let payload = match frame::encode_event(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(kind, error = %e, "failed to serialize client event");
                return;
            }
        };
        if let Err(e) = connection.commands.try_send(Command::Send { kind, payload }) {
            warn!(kind, error = %e, "could not queue client event");
        }
    }

    async fn ensure_connected(&mut self) -> Result<mpsc::Sender<Command>> {
        if let Some(connection) = &self.connection {
            if self.state() == ConnectionState::Open && !connection.task.is_finished() {
                return Ok(connection.commands.clone());
            }
        }
        if let Some(stale) = self.connection.take() {
            debug!(state = ?self.state(), "replacing unusable connection");
            stale.task.abort();
            // The old task must not publish over the new connection's state.
            let _ = stale.task.await;
        }

        let handle = Connection::open(&self.config, self.state.clone()).await?;
        let commands = handle.commands.clone();
        self.connection = Some(handle);
        Ok(commands)
    }
}

fn log_payload_size(bytes: usize, message_count: usize) {
    if bytes > LARGE_PAYLOAD_ERROR_BYTES {
        error!(bytes, message_count, "very large outbound payload; sending in full");
    } else if bytes > LARGE_PAYLOAD_WARN_BYTES {
        warn!(bytes, message_count, "large outbound payload");
    }
}

/// Periodic probe timer. At most one interval exists at a time.
struct KeepAliveTimer {
    period: Duration,
    interval: Option<Interval>,
}

impl KeepAliveTimer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    fn start(&mut self) {
        self.stop();
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.interval = Some(interval);
    }

    fn stop(&mut self) {
        self.interval = None;
    }

    async fn tick(&mut self) {
        match &mut self.interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }
}

async fn turn_cancelled(turn: &Option<TurnSink>) {
    match turn {
        Some(sink) => sink.cancelled().await,
        None => std::future::pending().await,
    }
}

/// The connection task's state.
struct Connection {
    writer: SplitSink<WsStream, Message>,
    reader: SplitStream<WsStream>,
    commands: mpsc::Receiver<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    turn: Option<TurnSink>,
    dispatcher: EventDispatcher,
    keepalive: KeepAliveTimer,
}

impl Connection {
    async fn open(
        config: &RelayConfig,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Result<ConnectionHandle> {
        let mut request = config.endpoint.as_str().into_client_request()?;
        if let Some(token) = &config.auth_token {
            let header: HeaderValue = format!("Bearer {}", token.expose_secret())
                .parse()
                .map_err(|_| RelayError::InvalidRequest("auth token is not a valid header value".into()))?;
            request.headers_mut().insert("Authorization", header);
        }

        info!(endpoint = %config.endpoint, "opening relay connection");
        state.send_replace(ConnectionState::Connecting);
        let stream = match tokio::time::timeout(config.connect_timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                error!(error = %e, "relay connection failed");
                state.send_replace(ConnectionState::Closed);
                return Err(e.into());
            }
            Err(_) => {
                error!(timeout = ?config.connect_timeout, "relay connection timed out");
                state.send_replace(ConnectionState::Closed);
                return Err(RelayError::ConnectTimeout(config.connect_timeout));
            }
        };
        state.send_replace(ConnectionState::Open);
        info!("relay connection open");

        let (writer, reader) = stream.split();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let connection = Connection {
            writer,
            reader,
            commands: command_rx,
            state,
            turn: None,
            dispatcher: EventDispatcher::new(config.audio_sink.clone(), config.on_latency.clone()),
            keepalive: KeepAliveTimer::new(config.keepalive_interval),
        };
        let span = info_span!("relay_connection", endpoint = %config.endpoint);
        let task = tokio::spawn(connection.run().instrument(span));

        Ok(ConnectionHandle {
            commands: command_tx,
            task,
        })
    }

    async fn run(mut self) {
        self.keepalive.start();
        loop {
            tokio::select! {
                msg = self.reader.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.on_text(&text),
                    Some(Ok(Message::Close(frame))) => {
                        self.on_remote_close(frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.on_transport_error(e.into());
                        break;
                    }
                    None => {
                        self.on_transport_error(RelayError::ConnectionLost("stream ended".into()));
                        break;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::BeginTurn { sink, payload }) => {
                        self.install_turn(sink);
                        if let Err(e) = self.write(payload).await {
                            self.on_transport_error(e);
                            break;
                        }
                    }
                    Some(Command::Send { kind, payload }) => {
                        debug!(kind, "sending client event");
                        if let Err(e) = self.write(payload).await {
                            self.on_transport_error(e);
                            break;
                        }
                    }
                    Some(Command::Close) | None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = self.keepalive.tick() => {
                    if let Err(e) = self.send_ping().await {
                        self.on_transport_error(e);
                        break;
                    }
                }
                _ = turn_cancelled(&self.turn) => {
                    info!("turn cancelled by caller");
                    self.complete_turn();
                }
            }
        }
        self.keepalive.stop();
        self.state.send_replace(ConnectionState::Closed);
        debug!("relay connection task finished");
    }

    fn on_text(&mut self, text: &str) {
        for frame in frame::parse_message(text) {
            match frame {
                Ok(Frame::Event(chunk)) => {
                    for out in self.dispatcher.dispatch(chunk) {
                        self.deliver(out);
                    }
                }
                Ok(Frame::Done) => self.complete_turn(),
                Ok(Frame::KeepAlive(KeepAlive::Pong { timestamp })) => {
                    self.dispatcher.pong(timestamp);
                }
                Ok(Frame::KeepAlive(KeepAlive::Ping { timestamp })) => {
                    debug!(timestamp, "ignoring keep-alive ping from backend");
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse frame");
                    self.fail_turn(e.into());
                }
            }
        }
    }

    fn deliver(&mut self, chunk: StreamChunk) {
        match &mut self.turn {
            Some(turn) => {
                if turn.deliver(chunk).is_err() {
                    debug!(turn = turn.id(), "turn consumer is gone; dropping chunk");
                }
            }
            None => debug!(kind = %chunk.kind(), "no active turn; dropping chunk"),
        }
    }

    /// Closes the previous sink, if any, before the new one becomes current.
    fn install_turn(&mut self, sink: TurnSink) {
        if let Some(mut previous) = self.turn.take() {
            match previous.close() {
                Ok(()) => debug!(turn = previous.id(), "closed previous turn sink"),
                Err(SinkClosed) => debug!(turn = previous.id(), "previous turn sink already closed"),
            }
            self.dispatcher.end_turn();
        }
        self.turn = Some(sink);
    }

    fn complete_turn(&mut self) {
        self.dispatcher.end_turn();
        if let Some(mut turn) = self.turn.take() {
            if turn.close().is_err() {
                debug!(turn = turn.id(), "turn sink already closed at completion");
            }
        }
    }

    fn fail_turn(&mut self, err: RelayError) {
        self.dispatcher.end_turn();
        match self.turn.take() {
            Some(mut turn) => {
                if turn.fail(err).is_err() {
                    debug!(turn = turn.id(), "turn sink already closed; error dropped");
                }
            }
            None => debug!(error = %err, "error outside of a turn"),
        }
    }

    fn on_remote_close(&mut self, frame: Option<CloseFrame<'static>>) {
        self.keepalive.stop();
        self.state.send_replace(ConnectionState::Closed);
        let clean = frame.as_ref().is_none_or(|f| f.code == CloseCode::Normal);
        info!(?frame, clean, "backend closed the connection");
        if clean {
            self.complete_turn();
        } else {
            let reason = frame.map(|f| f.reason.into_owned()).unwrap_or_default();
            self.fail_turn(RelayError::ConnectionLost(reason));
        }
    }

    fn on_transport_error(&mut self, err: RelayError) {
        self.keepalive.stop();
        self.state.send_replace(ConnectionState::Closed);
        error!(error = %err, "relay connection failed");
        self.fail_turn(err);
    }

    async fn shutdown(&mut self) {
        self.state.send_replace(ConnectionState::Closing);
        self.keepalive.stop();
        if let Err(e) = self.writer.send(Message::Close(None)).await {
            debug!(error = %e, "close frame not sent");
        }
        self.complete_turn();
    }

    async fn send_ping(&mut self) -> Result<()> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.dispatcher.latency_mut().mark_sent(timestamp);
        let ping = serde_json::to_string(&KeepAlive::Ping { timestamp })?;
        self.writer.send(Message::Text(ping)).await?;
        Ok(())
    }

    async fn write(&mut self, payload: String) -> Result<()> {
        self.writer.send(Message::Text(payload)).await?;
        Ok(())
    }
}
