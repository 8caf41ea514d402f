//! Duplex WebSocket client
//!
//! One client type serves both planes: in JSON mode inbound text frames are
//! parsed and handed to a [`JsonHandler`]; in binary mode inbound binary
//! frames go straight to a [`ByteSink`]. Outbound data goes through a FIFO
//! drained by the connection task one write at a time, so at most one write
//! is in flight and sends leave in the order they were queued.
//!
//! Each connection runs as a single task on the control runtime. Closing the
//! client cancels its token, which ends the task's continuations at the next
//! await point. There is no reconnection: a failed connection stays failed.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::AudioTransport;
use crate::config::ConnectionMode;
use crate::error::{ControlError, NetworkError};
use crate::protocol::Role;

/// Lifecycle of a connection. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Resolving = 1,
    Connecting = 2,
    Handshaking = 3,
    Open = 4,
    Closing = 5,
    Closed = 6,
    Failed = 7,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Resolving,
            2 => Self::Connecting,
            3 => Self::Handshaking,
            4 => Self::Open,
            5 => Self::Closing,
            6 => Self::Closed,
            _ => Self::Failed,
        }
    }

    /// Closed and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Atomic state cell shared by the client, its handles and its task
#[derive(Debug)]
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move along the connect chain. Refused once closing or terminal.
    fn advance(&self, next: ConnectionState) -> bool {
        self.transition(|current| {
            !(current.is_terminal() || current == ConnectionState::Closing)
        }, next)
    }

    fn begin_close(&self) -> bool {
        self.transition(|current| {
            !(current.is_terminal() || current == ConnectionState::Closing)
        }, ConnectionState::Closing)
    }

    fn finish(&self) {
        self.transition(|current| !current.is_terminal(), ConnectionState::Closed);
    }

    fn fail(&self) {
        self.transition(|current| !current.is_terminal(), ConnectionState::Failed);
    }

    fn transition(&self, allowed: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                allowed(ConnectionState::from_u8(raw)).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Receives parsed inbound JSON messages on a control connection.
///
/// Invoked synchronously on the connection task; errors are logged there and
/// never end the connection.
pub trait JsonHandler: Send + Sync {
    fn handle(&self, message: serde_json::Value) -> Result<(), ControlError>;
}

/// Receives raw inbound binary frames on an audio connection
pub type ByteSink = Arc<dyn Fn(Bytes) + Send + Sync>;

/// What the client does with inbound frames
#[derive(Clone)]
pub enum ClientMode {
    Json(Arc<dyn JsonHandler>),
    Binary(Option<ByteSink>),
}

impl ClientMode {
    fn kind(&self) -> ConnectionMode {
        match self {
            Self::Json(_) => ConnectionMode::Json,
            Self::Binary(_) => ConnectionMode::Binary,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Binary(Bytes),
}

impl Outbound {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(data) => Message::Binary(data.to_vec()),
        }
    }
}

#[derive(Debug, Default)]
struct ClientStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    parse_errors: AtomicU64,
}

/// Non-owning send handle to a connection.
///
/// Handles never keep the connection alive; once it closes, sends fail
/// with [`NetworkError::Closed`].
#[derive(Clone)]
pub struct ClientHandle {
    id: Role,
    mode: ConnectionMode,
    state: Arc<StateCell>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl ClientHandle {
    pub fn id(&self) -> Role {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Queue a JSON message on a JSON-mode connection
    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<(), NetworkError> {
        if self.mode != ConnectionMode::Json {
            return Err(NetworkError::WrongMode("json send on binary connection"));
        }
        let text = serde_json::to_string(message)
            .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
        self.enqueue(Outbound::Text(text))
    }

    /// Queue a binary frame on a binary-mode connection
    pub fn send_binary(&self, data: Bytes) -> Result<(), NetworkError> {
        if self.mode != ConnectionMode::Binary {
            return Err(NetworkError::WrongMode("binary send on json connection"));
        }
        self.enqueue(Outbound::Binary(data))
    }

    fn enqueue(&self, item: Outbound) -> Result<(), NetworkError> {
        let state = self.state.get();
        if state.is_terminal() || state == ConnectionState::Closing {
            return Err(NetworkError::Closed);
        }
        self.outbound.send(item).map_err(|_| NetworkError::Closed)
    }
}

impl AudioTransport for ClientHandle {
    fn send(&mut self, packet: &[u8]) -> Result<(), NetworkError> {
        self.send_binary(Bytes::copy_from_slice(packet))
    }

    fn describe(&self) -> String {
        format!("ws:{}", self.id)
    }
}

/// Owning side of one duplex connection
pub struct DuplexClient {
    id: Role,
    url: String,
    mode: ClientMode,
    state: Arc<StateCell>,
    stats: Arc<ClientStats>,
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DuplexClient {
    /// Create a client in `Disconnected`. Nothing happens until [`Self::run`].
    pub fn new(id: Role, url: impl Into<String>, mode: ClientMode) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            id,
            url: url.into(),
            mode,
            state: Arc::new(StateCell::new()),
            stats: Arc::new(ClientStats::default()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Role {
        self.id
    }

    /// Endpoint this client connects to
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode.kind()
    }

    /// Frames written to the socket
    pub fn frames_sent(&self) -> u64 {
        self.stats.frames_sent.load(Ordering::Relaxed)
    }

    /// Data frames read from the socket, control frames excluded
    pub fn frames_received(&self) -> u64 {
        self.stats.frames_received.load(Ordering::Relaxed)
    }

    /// Inbound text frames that were not valid JSON
    pub fn parse_errors(&self) -> u64 {
        self.stats.parse_errors.load(Ordering::Relaxed)
    }

    /// Non-owning send handle sharing this client's queue and state
    pub fn handle(&self) -> ClientHandle {
        ClientHandle {
            id: self.id,
            mode: self.mode.kind(),
            state: self.state.clone(),
            outbound: self.outbound.clone(),
        }
    }

    /// Start resolving, connecting and handshaking on `runtime`. Once open
    /// the task keeps reading until the connection closes or fails.
    /// Calling it again is a no-op.
    pub fn run(&self, runtime: &Handle) {
        let Some(outbound) = self.outbound_rx.lock().take() else {
            return;
        };
        let task = ConnectionTask {
            id: self.id,
            url: self.url.clone(),
            mode: self.mode.clone(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            outbound,
            cancel: self.cancel.clone(),
        };
        *self.task.lock() = Some(runtime.spawn(task.drive()));
    }

    /// Queue a JSON message; see [`ClientHandle::send_json`]
    pub fn send_json<T: Serialize>(&self, message: &T) -> Result<(), NetworkError> {
        self.handle().send_json(message)
    }

    /// Queue a binary frame; see [`ClientHandle::send_binary`]
    pub fn send_binary(&self, data: Bytes) -> Result<(), NetworkError> {
        self.handle().send_binary(data)
    }

    /// Request a graceful close. Safe to call repeatedly or before `run`.
    pub fn close(&self) {
        if self.state.begin_close() {
            debug!(connection = %self.id, "Closing connection");
        }
        self.cancel.cancel();
        if self.task.lock().is_none() {
            // never started, nothing will observe the token
            self.state.finish();
        }
    }
}

impl Drop for DuplexClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ConnectionTask {
    id: Role,
    url: String,
    mode: ClientMode,
    state: Arc<StateCell>,
    stats: Arc<ClientStats>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
}

enum Flow {
    Continue,
    PeerClosed,
}

impl ConnectionTask {
    async fn drive(mut self) {
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.state.finish();
                return;
            }
            result = establish(&self.url, &self.state) => result,
        };

        let socket = match connected {
            Ok(socket) => socket,
            Err(e) => {
                error!(connection = %self.id, url = %self.url, "Connection failed: {}", e);
                self.state.fail();
                return;
            }
        };
        if !self.state.advance(ConnectionState::Open) {
            self.state.finish();
            return;
        }
        info!(connection = %self.id, url = %self.url, "Connection open");

        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    // flush what was queued before the close request
                    while let Ok(item) = self.outbound.try_recv() {
                        if sink.send(item.into_message()).await.is_err() {
                            break;
                        }
                        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Err(e) = sink.close().await {
                        debug!(connection = %self.id, "Close handshake failed: {}", e);
                    }
                    self.state.finish();
                    info!(connection = %self.id, "Connection closed");
                    return;
                }
                frame = stream.next() => match frame {
                    Some(Ok(message)) => {
                        if let Flow::PeerClosed = self.deliver(message) {
                            info!(connection = %self.id, "Connection closed by peer");
                            self.state.finish();
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        error!(connection = %self.id, "Read failed: {}", e);
                        self.state.fail();
                        return;
                    }
                    None => {
                        info!(connection = %self.id, "Connection stream ended");
                        self.state.finish();
                        return;
                    }
                },
                Some(item) = self.outbound.recv() => {
                    if let Err(e) = sink.send(item.into_message()).await {
                        error!(connection = %self.id, "Write failed: {}", e);
                        self.state.fail();
                        return;
                    }
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn deliver(&self, message: Message) -> Flow {
        match message {
            Message::Close(_) => return Flow::PeerClosed,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Flow::Continue,
            _ => {}
        }
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match (&self.mode, message) {
            (ClientMode::Json(handler), Message::Text(text)) => {
                let value = match serde_json::from_str::<serde_json::Value>(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(connection = %self.id, "Dropping malformed JSON frame: {}", e);
                        return Flow::Continue;
                    }
                };
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(value))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(connection = %self.id, "Control message rejected: {}", e),
                    Err(_) => error!(connection = %self.id, "Control handler panicked"),
                }
            }
            (ClientMode::Binary(Some(sink)), Message::Binary(data)) => {
                let sink = sink.clone();
                if panic::catch_unwind(AssertUnwindSafe(|| sink(Bytes::from(data)))).is_err() {
                    error!(connection = %self.id, "Byte sink panicked");
                }
            }
            (ClientMode::Binary(None), Message::Binary(_)) => {}
            (_, other) => {
                debug!(connection = %self.id, "Ignoring {} frame", frame_kind(&other));
            }
        }
        Flow::Continue
    }
}

fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        _ => "control",
    }
}

/// Resolve, connect and handshake, recording each step in `state`
async fn establish(
    url: &str,
    state: &StateCell,
) -> Result<WebSocketStream<TcpStream>, NetworkError> {
    let uri: Uri = url
        .parse()
        .map_err(|e| NetworkError::InvalidEndpoint(format!("{url}: {e}")))?;
    match uri.scheme_str() {
        Some("ws") => {}
        other => {
            return Err(NetworkError::InvalidEndpoint(format!(
                "{url}: unsupported scheme {other:?}"
            )))
        }
    }
    let host = uri
        .host()
        .ok_or_else(|| NetworkError::InvalidEndpoint(format!("{url}: missing host")))?;
    let port = uri.port_u16().unwrap_or(80);

    state.advance(ConnectionState::Resolving);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::ResolveFailed(format!("{host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(NetworkError::ResolveFailed(format!("{host}: no addresses")));
    }

    state.advance(ConnectionState::Connecting);
    let stream = TcpStream::connect(&addrs[..])
        .await
        .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not set TCP_NODELAY: {}", e);
    }

    state.advance(ConnectionState::Handshaking);
    let (socket, _response) = tokio_tungstenite::client_async(url, stream)
        .await
        .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::test_support::spawn_ws_server;
    use axum::extract::ws::Message as ServerMessage;
    use std::time::Duration;
    use tokio::runtime::Runtime;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct Collect(Mutex<Vec<serde_json::Value>>);

    impl JsonHandler for Collect {
        fn handle(&self, message: serde_json::Value) -> Result<(), ControlError> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    async fn wait_for_state(client: &DuplexClient, wanted: ConnectionState) {
        timeout(WAIT, async {
            while client.state() != wanted {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {wanted:?}, stuck at {:?}", client.state()));
    }

    #[test]
    fn test_back_to_back_sends_keep_order() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut server = spawn_ws_server().await;
            let client = DuplexClient::new(
                Role::InputForward,
                server.url(),
                ClientMode::Json(Arc::new(Collect(Mutex::new(Vec::new())))),
            );
            client.run(&Handle::current());

            // queued before the first write can possibly complete
            for n in 1..=3 {
                client.send_json(&serde_json::json!({ "n": n })).unwrap();
            }

            for n in 1..=3 {
                let frame = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();
                let ServerMessage::Text(text) = frame else {
                    panic!("expected text frame");
                };
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["n"], n);
            }
            assert_eq!(client.frames_sent(), 3);

            client.close();
            wait_for_state(&client, ConnectionState::Closed).await;
        });
    }

    #[test]
    fn test_malformed_json_does_not_close() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let server = spawn_ws_server().await;
            let collected = Arc::new(Collect(Mutex::new(Vec::new())));
            let client = DuplexClient::new(
                Role::PresetControl,
                server.url(),
                ClientMode::Json(collected.clone()),
            );
            client.run(&Handle::current());
            wait_for_state(&client, ConnectionState::Open).await;

            server.push.send(ServerMessage::Text("{not json".into())).unwrap();
            server.push.send(ServerMessage::Text(r#"{"preset":"COLONY"}"#.into())).unwrap();

            timeout(WAIT, async {
                while collected.0.lock().is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();

            assert_eq!(client.state(), ConnectionState::Open);
            assert_eq!(client.parse_errors(), 1);
            assert_eq!(collected.0.lock()[0]["preset"], "COLONY");
            client.close();
        });
    }

    #[test]
    fn test_binary_mode_delivers_bytes() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut server = spawn_ws_server().await;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let sink: ByteSink = Arc::new(move |bytes| {
                let _ = tx.send(bytes);
            });
            let client = DuplexClient::new(Role::AiBass, server.url(), ClientMode::Binary(Some(sink)));
            client.run(&Handle::current());
            wait_for_state(&client, ConnectionState::Open).await;

            server.push.send(ServerMessage::Binary(vec![9, 8, 7])).unwrap();
            let bytes = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(&bytes[..], &[9, 8, 7]);

            client.send_binary(Bytes::from_static(&[1, 2])).unwrap();
            let frame = timeout(WAIT, server.received.recv()).await.unwrap().unwrap();
            assert!(matches!(frame, ServerMessage::Binary(data) if data == vec![1, 2]));

            assert!(matches!(
                client.send_json(&serde_json::json!({})),
                Err(NetworkError::WrongMode(_))
            ));
            client.close();
        });
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            // grab a free port, then release it so nothing is listening
            let port = {
                let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
                listener.local_addr().unwrap().port()
            };
            let client = DuplexClient::new(
                Role::ComposerOutput,
                format!("ws://127.0.0.1:{port}/ws"),
                ClientMode::Binary(None),
            );
            client.run(&Handle::current());
            wait_for_state(&client, ConnectionState::Failed).await;

            // close after failure does not resurrect the connection
            client.close();
            assert_eq!(client.state(), ConnectionState::Failed);
            assert!(matches!(
                client.send_binary(Bytes::from_static(&[0])),
                Err(NetworkError::Closed)
            ));
        });
    }

    #[test]
    fn test_close_is_idempotent() {
        let client = DuplexClient::new(Role::PresetControl, "ws://127.0.0.1:1/ws", ClientMode::Binary(None));
        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_invalid_scheme_fails() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let client = DuplexClient::new(Role::PresetControl, "http://localhost/ws", ClientMode::Binary(None));
            client.run(&Handle::current());
            wait_for_state(&client, ConnectionState::Failed).await;
        });
    }
}
