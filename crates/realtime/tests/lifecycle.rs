use chatrelay_core::{StreamChunk, UiChunk, UiMessage};
use chatrelay_realtime::frame::{encode_done, encode_frame};
use chatrelay_realtime::{ConnectionState, KeepAlive, RelayClient, RelayConfig, RelayError};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const STEP: Duration = Duration::from_secs(5);

/// A scripted backend. The reply depends on the text of the last message.
struct Backend {
    url: String,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<String>>>,
}

impl Backend {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (count, log) = (connections.clone(), received.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, log.clone()));
            }
        });

        Self {
            url,
            connections,
            received,
        }
    }

    fn client(&self) -> RelayClient {
        RelayClient::new(RelayConfig::new(&self.url))
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

fn event(value: Value) -> String {
    encode_frame(&value.to_string())
}

fn reply(text: &str) -> String {
    [
        event(json!({"type": "start", "messageId": "a1"})),
        event(json!({"type": "text-start", "id": "t1"})),
        event(json!({"type": "text-delta", "id": "t1", "delta": text})),
        event(json!({"type": "text-end", "id": "t1"})),
        event(json!({"type": "finish"})),
        encode_done(),
    ]
    .concat()
}

async fn serve(stream: TcpStream, received: Arc<Mutex<Vec<String>>>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Text(text) = msg else { continue };

        if let Ok(KeepAlive::Ping { timestamp }) = serde_json::from_str(&text) {
            received.lock().unwrap().push("ping".into());
            let pong = serde_json::to_string(&KeepAlive::Pong { timestamp }).unwrap();
            let _ = ws.send(Message::Text(pong)).await;
            continue;
        }

        let payload = text.trim().strip_prefix("data:").unwrap().trim();
        let event_value: Value = serde_json::from_str(payload).unwrap();
        let kind = event_value["type"].as_str().unwrap().to_owned();
        received.lock().unwrap().push(kind.clone());

        match kind.as_str() {
            "message" => {
                let messages: Vec<UiMessage> =
                    serde_json::from_value(event_value["messages"].clone()).unwrap();
                let prompt = messages.last().map(UiMessage::text).unwrap_or_default();
                match prompt.as_str() {
                    "bad" => {
                        let _ = ws.send(Message::Text("data: {not json\n\n".into())).await;
                    }
                    "drop" => {
                        let partial = event(json!({"type": "text-delta", "id": "t1", "delta": "par"}));
                        let _ = ws.send(Message::Text(partial)).await;
                        return;
                    }
                    "bye" => {
                        let _ = ws.send(Message::Text(reply("bye").replace(&encode_done(), ""))).await;
                        let _ = ws.close(None).await;
                    }
                    "slow" => {
                        let first = event(json!({"type": "text-delta", "id": "t1", "delta": "thinking"}));
                        let _ = ws.send(Message::Text(first)).await;
                    }
                    other => {
                        // One frame per socket message.
                        for piece in reply(other).split_inclusive("\n\n") {
                            let _ = ws.send(Message::Text(piece.to_owned())).await;
                        }
                    }
                }
            }
            "interrupt" => {
                let aborted = [event(json!({"type": "abort"})), encode_done()].concat();
                let _ = ws.send(Message::Text(aborted)).await;
            }
            _ => {}
        }
    }
}

async fn collect(stream: chatrelay_realtime::ChunkStream) -> Vec<Result<StreamChunk, RelayError>> {
    tokio::time::timeout(STEP, stream.collect::<Vec<_>>())
        .await
        .expect("turn stream did not end")
}

fn text_of(items: &[Result<StreamChunk, RelayError>]) -> String {
    items
        .iter()
        .filter_map(|item| match item {
            Ok(StreamChunk::Ui(UiChunk::TextDelta { delta, .. })) => Some(delta.as_str()),
            _ => None,
        })
        .collect()
}

fn conversation(text: &str) -> Vec<UiMessage> {
    vec![UiMessage::user_text("u1", text)]
}

#[tokio::test]
async fn turn_streams_until_done_and_keeps_the_connection() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();

    let items = collect(client.send(conversation("hello"), None).await.unwrap()).await;
    assert!(items.iter().all(Result::is_ok));
    assert_eq!(text_of(&items), "hello");
    assert!(matches!(
        items.last(),
        Some(Ok(StreamChunk::Ui(UiChunk::Finish { .. })))
    ));
    assert_eq!(client.state(), ConnectionState::Open);

    let items = collect(client.send(conversation("again"), None).await.unwrap()).await;
    assert_eq!(text_of(&items), "again");
    assert_eq!(backend.connections(), 1);

    let mut states = client.watch_state();
    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::Closed);

    let items = collect(client.send(conversation("reopened"), None).await.unwrap()).await;
    assert_eq!(text_of(&items), "reopened");
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn parse_error_ends_the_turn_with_an_error() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();

    let items = collect(client.send(conversation("bad"), None).await.unwrap()).await;
    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(RelayError::Frame(_))));

    let items = collect(client.send(conversation("hello"), None).await.unwrap()).await;
    assert_eq!(text_of(&items), "hello");
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn dropped_connection_fails_the_turn_and_next_send_reconnects() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();

    let items = collect(client.send(conversation("drop"), None).await.unwrap()).await;
    assert_eq!(text_of(&items), "par");
    assert!(items.last().unwrap().is_err());
    assert_eq!(client.state(), ConnectionState::Closed);

    let items = collect(client.send(conversation("hello"), None).await.unwrap()).await;
    assert_eq!(text_of(&items), "hello");
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn clean_close_ends_the_turn_without_error() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();

    let items = collect(client.send(conversation("bye"), None).await.unwrap()).await;
    assert!(items.iter().all(Result::is_ok));
    assert_eq!(text_of(&items), "bye");
}

#[tokio::test]
async fn new_turn_closes_the_previous_stream() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();

    let mut first = client.send(conversation("slow"), None).await.unwrap();
    let head = tokio::time::timeout(STEP, first.next()).await.unwrap();
    assert!(matches!(head, Some(Ok(_))));

    let second = client.send(conversation("hello"), None).await.unwrap();
    assert!(collect(first).await.is_empty());
    assert_eq!(text_of(&collect(second).await), "hello");
}

#[tokio::test]
async fn cancellation_ends_only_the_turn() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();
    let cancel = CancellationToken::new();

    let mut stream = client
        .send(conversation("slow"), Some(cancel.clone()))
        .await
        .unwrap();
    assert!(tokio::time::timeout(STEP, stream.next()).await.unwrap().is_some());
    cancel.cancel();
    assert!(collect(stream).await.is_empty());
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn interrupt_is_sent_on_an_open_connection() {
    let backend = Backend::spawn().await;
    let mut client = backend.client();

    let mut stream = client.send(conversation("slow"), None).await.unwrap();
    assert!(tokio::time::timeout(STEP, stream.next()).await.unwrap().is_some());
    client.interrupt(Some("user stop".into()));

    let rest = collect(stream).await;
    assert!(matches!(rest.as_slice(), [Ok(StreamChunk::Ui(UiChunk::Abort { .. }))]));
    assert_eq!(backend.received(), vec!["message", "interrupt"]);
}

#[tokio::test]
async fn connect_times_out_when_handshake_never_completes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut client =
        RelayClient::new(RelayConfig::new(url).with_connect_timeout(Duration::from_millis(200)));
    let mut states = client.watch_state();
    assert_eq!(*states.borrow(), ConnectionState::Unconnected);

    let result = {
        let send = client.send(conversation("hello"), None);
        tokio::pin!(send);
        tokio::select! {
            _ = &mut send => panic!("send finished before the handshake timed out"),
            seen = states.wait_for(|state| *state == ConnectionState::Connecting) => {
                assert!(seen.is_ok());
            }
        }
        send.await
    };
    assert!(matches!(result, Err(RelayError::ConnectTimeout(_))));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn keepalive_reports_round_trip_latency() {
    let backend = Backend::spawn().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let config = RelayConfig::new(&backend.url)
        .with_keepalive_interval(Duration::from_millis(50))
        .with_latency_callback(move |rtt| {
            let _ = tx.send(rtt);
        });
    let mut client = RelayClient::new(config);

    collect(client.send(conversation("hello"), None).await.unwrap()).await;
    let rtt = tokio::time::timeout(STEP, rx.recv()).await.unwrap().unwrap();
    assert!(rtt < STEP);
    assert!(backend.received().contains(&"ping".to_owned()));
}
