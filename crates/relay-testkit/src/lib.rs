//! In-process SocketCluster relay stub.
//!
//! Speaks just enough of the protocol for client tests: handshake, subscribe,
//! unsubscribe, publish fan-out, kick-out, heartbeats, and a silent mode
//! that stops all server-to-client traffic.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const STUB_PATH: &str = "/socketcluster/";

const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;
const HEARTBEAT_IDLE_POLL: Duration = Duration::from_millis(20);

struct StubConnection {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct StubState {
    ack_subscriptions: AtomicBool,
    silent: AtomicBool,
    ping_timeout_ms: AtomicU64,
    heartbeat_ms: AtomicU64,
    next_connection_id: AtomicU64,
    handshakes: AtomicUsize,
    pongs: AtomicUsize,
    legacy_pongs: AtomicUsize,
    connections: Mutex<Vec<StubConnection>>,
    subscribe_log: Mutex<Vec<String>>,
    unsubscribe_log: Mutex<Vec<String>>,
}

/// Relay stub bound to an ephemeral loopback port.
pub struct StubRelay {
    addr: SocketAddr,
    state: Arc<StubState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl StubRelay {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(StubState::default());
        state.ack_subscriptions.store(true, Ordering::SeqCst);
        state
            .ping_timeout_ms
            .store(DEFAULT_PING_TIMEOUT_MS, Ordering::SeqCst);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve_connection(stream, Arc::clone(&accept_state)));
                    }
                }
            }
        });

        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn path(&self) -> &'static str {
        STUB_PATH
    }

    /// Whether `#subscribe` requests receive an acknowledgment.
    pub fn set_ack_subscriptions(&self, ack: bool) {
        self.state.ack_subscriptions.store(ack, Ordering::SeqCst);
    }

    /// While silent the stub still reads client frames but sends nothing
    /// back except close frames.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// `pingTimeout` announced in handshake replies.
    pub fn set_ping_timeout_ms(&self, ms: u64) {
        self.state.ping_timeout_ms.store(ms, Ordering::SeqCst);
    }

    /// Interval of server `""` pings on every socket; `0` disables them.
    pub fn set_heartbeat_ms(&self, ms: u64) {
        self.state.heartbeat_ms.store(ms, Ordering::SeqCst);
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn pongs(&self) -> usize {
        self.state.pongs.load(Ordering::SeqCst)
    }

    pub fn legacy_pongs(&self) -> usize {
        self.state.legacy_pongs.load(Ordering::SeqCst)
    }

    /// Every channel name ever subscribed, in arrival order.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.state.subscribe_log.lock().await.clone()
    }

    pub async fn unsubscriptions(&self) -> Vec<String> {
        self.state.unsubscribe_log.lock().await.clone()
    }

    pub async fn subscribe_count(&self, channel: &str) -> usize {
        self.state
            .subscribe_log
            .lock()
            .await
            .iter()
            .filter(|name| name.as_str() == channel)
            .count()
    }

    /// Publish `data` on `channel`; returns how many sockets received it.
    pub async fn publish(&self, channel: &str, data: Value) -> usize {
        let frame = json!({
            "event": "#publish",
            "data": { "channel": channel, "data": data },
        })
        .to_string();
        let connections = self.state.connections.lock().await;
        connections
            .iter()
            .filter(|connection| connection.channels.contains(channel))
            .filter(|connection| {
                connection
                    .outbound
                    .send(Message::Text(frame.clone().into()))
                    .is_ok()
            })
            .count()
    }

    pub async fn kick_out(&self, channel: &str) {
        let frame = json!({
            "event": "#kickOut",
            "data": { "channel": channel, "message": "kicked by stub" },
        })
        .to_string();
        let mut connections = self.state.connections.lock().await;
        for connection in connections.iter_mut() {
            if connection.channels.remove(channel) {
                let _ = connection.outbound.send(Message::Text(frame.clone().into()));
            }
        }
    }

    /// Send a raw text frame to every connected socket.
    pub async fn send_raw(&self, text: &str) {
        for connection in self.state.connections.lock().await.iter() {
            let _ = connection.outbound.send(Message::Text(text.to_string().into()));
        }
    }

    /// Close every live socket from the server side.
    pub async fn drop_connections(&self) {
        let mut connections = self.state.connections.lock().await;
        for connection in connections.drain(..) {
            let _ = connection.outbound.send(Message::Close(None));
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.connections.lock().await.len()
    }

    /// Poll `check` until it returns true or `limit` elapses.
    pub async fn wait_until<F, Fut>(&self, limit: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if check().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for StubRelay {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<StubState>) {
    let Ok(socket) = accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let id = state.next_connection_id.fetch_add(1, Ordering::SeqCst);
    state.connections.lock().await.push(StubConnection {
        id,
        outbound: outbound_tx.clone(),
        channels: HashSet::new(),
    });

    let writer_state = Arc::clone(&state);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if !closing && writer_state.silent.load(Ordering::SeqCst) {
                continue;
            }
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let heartbeat_state = Arc::clone(&state);
    let heartbeat_tx = outbound_tx.clone();
    let heartbeat = tokio::spawn(async move {
        loop {
            let every = heartbeat_state.heartbeat_ms.load(Ordering::SeqCst);
            if every == 0 {
                tokio::time::sleep(HEARTBEAT_IDLE_POLL).await;
                continue;
            }
            tokio::time::sleep(Duration::from_millis(every)).await;
            if heartbeat_tx.send(Message::Text(String::new().into())).is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = source.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match text.as_str() {
            "" => {
                state.pongs.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            "#2" => {
                state.legacy_pongs.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            _ => {}
        }
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        let cid = frame.get("cid").and_then(Value::as_u64);
        match frame.get("event").and_then(Value::as_str) {
            Some("#handshake") => {
                state.handshakes.fetch_add(1, Ordering::SeqCst);
                let ping_timeout = state.ping_timeout_ms.load(Ordering::SeqCst);
                let reply = json!({
                    "rid": cid,
                    "data": { "id": format!("stub-{id}"), "pingTimeout": ping_timeout, "isAuthenticated": false },
                });
                let _ = outbound_tx.send(Message::Text(reply.to_string().into()));
            }
            Some("#subscribe") => {
                let Some(channel) = frame
                    .pointer("/data/channel")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    continue;
                };
                state.subscribe_log.lock().await.push(channel.clone());
                if let Some(connection) = state
                    .connections
                    .lock()
                    .await
                    .iter_mut()
                    .find(|connection| connection.id == id)
                {
                    connection.channels.insert(channel);
                }
                if state.ack_subscriptions.load(Ordering::SeqCst) {
                    let _ = outbound_tx.send(Message::Text(json!({ "rid": cid }).to_string().into()));
                }
            }
            Some("#unsubscribe") => {
                let Some(channel) = frame.get("data").and_then(Value::as_str).map(str::to_string)
                else {
                    continue;
                };
                state.unsubscribe_log.lock().await.push(channel.clone());
                if let Some(connection) = state
                    .connections
                    .lock()
                    .await
                    .iter_mut()
                    .find(|connection| connection.id == id)
                {
                    connection.channels.remove(&channel);
                }
                let _ = outbound_tx.send(Message::Text(json!({ "rid": cid }).to_string().into()));
            }
            _ => {}
        }
    }

    state
        .connections
        .lock()
        .await
        .retain(|connection| connection.id != id);
    heartbeat.abort();
    drop(outbound_tx);
    let _ = writer.await;
}
