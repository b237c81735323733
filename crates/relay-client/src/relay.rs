//! Single relay connection management.

use crate::channel::{Channel, ChannelSlot, ChannelState};
use crate::error::{ClientError, Result};
use crate::lifecycle::{
    ConnectionHealth, ConnectionLifecycle, DisconnectReason, ReconnectPolicy,
    classify_disconnect_reason,
};
use crate::protocol::{self, HandshakeAck, InboundFrame};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

pub const DEFAULT_HOSTNAME: &str = "socket.fleetbase.io";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_PATH: &str = "/socketcluster/";

/// Idle bound used when the handshake does not announce a `pingTimeout`.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(20);

const LIFECYCLE_EVENT_CAPACITY: usize = 64;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Connection-level lifecycle notifications, for diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting { attempt: u32 },
    Connected { socket_id: Option<String> },
    Disconnected { reason: DisconnectReason },
    Error { message: String },
    Reconnecting { attempt: u32, delay: Duration },
    Closed,
}

/// Where the relay lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub secure: bool,
}

impl Default for RelayEndpoint {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            secure: true,
        }
    }
}

impl RelayEndpoint {
    /// WebSocket URL for this endpoint.
    pub fn url(&self) -> Result<Url> {
        let hostname = self.hostname.trim();
        if hostname.is_empty() {
            return Err(ClientError::InvalidUrl("relay hostname is empty".to_string()));
        }
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = self.path.trim();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(Url::parse(&format!(
            "{scheme}://{hostname}:{}{path}",
            self.port
        ))?)
    }
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub endpoint: RelayEndpoint,
    pub connect_timeout: Duration,
    /// Bound on handshake and subscription acknowledgments.
    pub ack_timeout: Duration,
    /// Longest silence tolerated from the relay before the session is
    /// dropped, unless the handshake announces its own `pingTimeout`.
    pub ping_timeout: Duration,
    pub auto_reconnect: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: RelayEndpoint::default(),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(15),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn with_endpoint(endpoint: RelayEndpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }
}

enum PendingRequest {
    Subscribe { channel: String, slot_id: u64 },
    Unsubscribe { channel: String },
}

enum SessionEnd {
    Closed(String),
}

/// State shared between the public handle, channel handles, and the supervisor.
pub(crate) struct Shared {
    url: Url,
    config: RelayConfig,
    state: RwLock<ConnectionState>,
    writer: AsyncMutex<Option<WsWriter>>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    lifecycle: Mutex<ConnectionLifecycle>,
    next_cid: AtomicU64,
    next_slot_id: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

/// Relay connection with automatic reconnect and channel re-subscription.
pub struct RelayConnection {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    supervisor: AsyncMutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Validate the endpoint and start connecting in the background.
    ///
    /// Only URL problems are reported here. Network failures surface on
    /// [`RelayConnection::lifecycle_events`] and are retried with backoff.
    /// Must be called from within a tokio runtime.
    pub fn open(config: RelayConfig) -> Result<Self> {
        let url = config.endpoint.url()?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (events, _) = broadcast::channel(LIFECYCLE_EVENT_CAPACITY);
        let lifecycle = ConnectionLifecycle::new(config.reconnect.clone(), url.as_str());
        let shutdown = CancellationToken::new();
        let shared = Arc::new(Shared {
            url,
            config,
            state: RwLock::new(ConnectionState::Disconnected),
            writer: AsyncMutex::new(None),
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(lifecycle),
            next_cid: AtomicU64::new(1),
            next_slot_id: AtomicU64::new(1),
            events,
            shutdown: shutdown.clone(),
        });

        let task = tokio::spawn(supervise(Arc::clone(&shared), shutdown.clone()));

        Ok(Self {
            shared,
            shutdown,
            supervisor: AsyncMutex::new(Some(task)),
        })
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        self.shared.url.as_str()
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    pub fn health(&self) -> ConnectionHealth {
        self.shared.lifecycle().snapshot()
    }

    /// Stream of connection lifecycle events.
    pub fn lifecycle_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Names of the channels currently registered on this connection.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.channels().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a channel and request a subscription without waiting for the
    /// acknowledgment. While disconnected the request is deferred until the
    /// next successful handshake.
    pub async fn channel(&self, name: impl Into<String>) -> Result<Channel> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ClientError::Subscription(
                "channel name must not be empty".to_string(),
            ));
        }
        if self.shutdown.is_cancelled() || self.state().await == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }

        let channel = self.shared.register_channel(&self.shared, &name)?;
        if self.state().await == ConnectionState::Connected {
            self.shared.send_subscribe(&name).await;
        }
        Ok(channel)
    }

    /// Subscribe and wait (bounded by `ack_timeout`) for the relay to confirm.
    ///
    /// A channel whose confirmation does not arrive in time is returned in the
    /// `Degraded` state. Re-subscription is retried in the background with
    /// the reconnect backoff, and the channel turns `Live` once one succeeds.
    pub async fn subscribe(&self, name: impl Into<String>) -> Result<Channel> {
        let mut channel = self.channel(name).await?;
        match channel.wait_live(self.shared.config.ack_timeout).await {
            ChannelState::Live => {
                debug!(channel = channel.name(), relay = %self.shared.url, "channel live");
            }
            ChannelState::Closed => return Err(ClientError::Closed),
            state => {
                warn!(
                    channel = channel.name(),
                    relay = %self.shared.url,
                    state = ?state,
                    timeout_ms = self.shared.config.ack_timeout.as_millis() as u64,
                    "subscription not acknowledged; continuing degraded"
                );
            }
        }
        Ok(channel)
    }

    /// Stop reconnecting, close the socket, and end every channel stream.
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.supervisor.lock().await.take()
            && let Err(error) = task.await
        {
            warn!(relay = %self.shared.url, %error, "relay supervisor ended abnormally");
        }
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Shared {
    pub(crate) fn channels(&self) -> MutexGuard<'_, HashMap<String, ChannelSlot>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, ConnectionLifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_cid(&self) -> u64 {
        self.next_cid.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    fn register_channel(&self, this: &Arc<Self>, name: &str) -> Result<Channel> {
        let mut channels = self.channels();
        if channels.contains_key(name) {
            return Err(ClientError::AlreadySubscribed(name.to_string()));
        }
        let slot_id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let (slot, channel) = ChannelSlot::new(name, slot_id, Arc::downgrade(this));
        channels.insert(name.to_string(), slot);
        Ok(channel)
    }

    /// Forget a channel slot, but only the incarnation identified by `slot_id`.
    pub(crate) fn remove_slot(&self, name: &str, slot_id: u64) -> bool {
        let mut channels = self.channels();
        if channels.get(name).is_some_and(|slot| slot.id == slot_id) {
            channels.remove(name);
            return true;
        }
        false
    }

    pub(crate) fn update_slot_state(
        &self,
        name: &str,
        slot_id: Option<u64>,
        state: ChannelState,
        only_from: Option<ChannelState>,
    ) {
        let channels = self.channels();
        let Some(slot) = channels.get(name) else {
            return;
        };
        if slot_id.is_some_and(|id| id != slot.id) {
            return;
        }
        if only_from.is_some_and(|expected| *slot.state.borrow() != expected) {
            return;
        }
        slot.state.send_replace(state);
    }

    fn slot_state(&self, name: &str, slot_id: u64) -> Option<watch::Receiver<ChannelState>> {
        self.channels()
            .get(name)
            .filter(|slot| slot.id == slot_id)
            .map(|slot| slot.state.subscribe())
    }

    /// Start a backoff re-subscribe loop for a `Degraded` slot unless one is
    /// already running for it.
    pub(crate) fn schedule_resubscribe(self: &Arc<Self>, name: &str, slot_id: u64) {
        let token = {
            let mut channels = self.channels();
            let Some(slot) = channels.get_mut(name).filter(|slot| slot.id == slot_id) else {
                return;
            };
            if slot.retry.as_ref().is_some_and(|retry| !retry.is_cancelled()) {
                return;
            }
            let token = self.shutdown.child_token();
            slot.retry = Some(token.clone());
            token
        };
        tokio::spawn(retry_subscription(
            Arc::downgrade(self),
            name.to_string(),
            slot_id,
            token,
        ));
    }

    pub(crate) async fn send_unsubscribe(&self, name: &str) -> Result<()> {
        let cid = self.next_cid();
        let frame = protocol::unsubscribe_frame(cid, name)?;
        self.pending().insert(
            cid,
            PendingRequest::Unsubscribe {
                channel: name.to_string(),
            },
        );
        let result = self.send_text(frame).await;
        if result.is_err() {
            self.pending().remove(&cid);
        }
        result
    }

    async fn send_subscribe(&self, name: &str) {
        let Some(slot_id) = self.channels().get(name).map(|slot| slot.id) else {
            return;
        };
        let cid = self.next_cid();
        let frame = match protocol::subscribe_frame(cid, name) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(channel = name, %error, "unable to encode subscribe frame");
                return;
            }
        };
        self.pending().insert(
            cid,
            PendingRequest::Subscribe {
                channel: name.to_string(),
                slot_id,
            },
        );
        if let Err(error) = self.send_text(frame).await {
            self.pending().remove(&cid);
            debug!(channel = name, %error, "subscribe deferred until reconnect");
        }
    }

    async fn resubscribe_all(&self) {
        let names: Vec<String> = {
            let channels = self.channels();
            for slot in channels.values() {
                slot.state.send_replace(ChannelState::Pending);
            }
            channels.keys().cloned().collect()
        };
        for name in names {
            self.send_subscribe(&name).await;
        }
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    async fn handle_text(self: &Arc<Self>, text: &str) {
        match protocol::parse_frame(text) {
            Ok(Some(InboundFrame::Ping { legacy })) => {
                if let Err(error) = self.send_text(protocol::pong_text(legacy).to_string()).await {
                    debug!(relay = %self.url, %error, "unable to answer ping");
                }
            }
            Ok(Some(InboundFrame::Response { rid, error, .. })) => {
                self.resolve_request(rid, error);
            }
            Ok(Some(InboundFrame::Publish { channel, data })) => {
                self.route_publish(&channel, data);
            }
            Ok(Some(InboundFrame::KickOut { channel, message })) => {
                warn!(
                    relay = %self.url,
                    channel = channel.as_str(),
                    message = message.as_deref().unwrap_or_default(),
                    "relay kicked channel; re-subscribing after backoff"
                );
                let slot_id = self.channels().get(&channel).map(|slot| slot.id);
                if let Some(slot_id) = slot_id {
                    self.update_slot_state(&channel, Some(slot_id), ChannelState::Degraded, None);
                    self.schedule_resubscribe(&channel, slot_id);
                }
            }
            Ok(Some(InboundFrame::Event { event, .. })) => {
                debug!(relay = %self.url, event = event.as_str(), "ignoring relay event");
            }
            Ok(None) => {}
            Err(error) => {
                warn!(relay = %self.url, %error, "dropping malformed relay frame");
            }
        }
    }

    fn resolve_request(self: &Arc<Self>, rid: u64, error: Option<Value>) {
        let request = self.pending().remove(&rid);
        match request {
            Some(PendingRequest::Subscribe { channel, slot_id }) => match error {
                None => {
                    self.update_slot_state(&channel, Some(slot_id), ChannelState::Live, None);
                    debug!(relay = %self.url, channel = channel.as_str(), "subscription acknowledged");
                }
                Some(error) => {
                    self.update_slot_state(&channel, Some(slot_id), ChannelState::Degraded, None);
                    warn!(
                        relay = %self.url,
                        channel = channel.as_str(),
                        error = %error,
                        "relay rejected subscription"
                    );
                    self.schedule_resubscribe(&channel, slot_id);
                }
            },
            Some(PendingRequest::Unsubscribe { channel }) => {
                debug!(relay = %self.url, channel = channel.as_str(), "unsubscribe acknowledged");
            }
            None => {
                debug!(relay = %self.url, rid, "response for unknown request");
            }
        }
    }

    fn route_publish(&self, channel: &str, data: Value) {
        let mut channels = self.channels();
        let Some(slot) = channels.get(channel) else {
            debug!(relay = %self.url, channel, "no local subscriber for publication");
            return;
        };
        if slot.messages.send(data).is_err() {
            channels.remove(channel);
            debug!(relay = %self.url, channel, "channel receiver dropped; slot removed");
        }
    }

    async fn after_disconnect(&self) {
        self.writer.lock().await.take();
        self.set_state(ConnectionState::Disconnected).await;
        self.pending().clear();
        for slot in self.channels().values() {
            slot.state.send_replace(ChannelState::Pending);
        }
    }

    async fn teardown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!(relay = %self.url, %error, "close frame not delivered");
        }
        self.pending().clear();
        for (_, slot) in self.channels().drain() {
            slot.state.send_replace(ChannelState::Closed);
        }
        self.set_state(ConnectionState::Closed).await;
        self.emit(ConnectionEvent::Closed);
        info!(relay = %self.url, "relay connection closed");
    }
}

async fn supervise(shared: Arc<Shared>, shutdown: CancellationToken) {
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let attempt = shared.lifecycle().mark_connecting();
        shared.set_state(ConnectionState::Connecting).await;
        shared.emit(ConnectionEvent::Connecting { attempt });

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            outcome = run_session(&shared) => outcome,
        };

        let (reason, error) = match outcome {
            Ok(SessionEnd::Closed(detail)) => {
                info!(relay = %shared.url, detail = detail.as_str(), "relay session ended");
                (DisconnectReason::StreamClosed, Some(detail))
            }
            Err(error) => {
                let message = error.to_string();
                warn!(relay = %shared.url, error = message.as_str(), "relay session failed");
                shared.emit(ConnectionEvent::Error {
                    message: message.clone(),
                });
                (classify_disconnect_reason(&message), Some(message))
            }
        };

        shared.after_disconnect().await;
        shared.emit(ConnectionEvent::Disconnected { reason });

        if !shared.config.auto_reconnect {
            break;
        }

        let plan = shared.lifecycle().mark_disconnect(reason, error);
        shared.emit(ConnectionEvent::Reconnecting {
            attempt: plan.attempt,
            delay: plan.delay,
        });
        debug!(
            relay = %shared.url,
            attempt = plan.attempt,
            delay_ms = plan.delay.as_millis() as u64,
            reason = reason.as_str(),
            "scheduling reconnect"
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = sleep(plan.delay) => {}
        }
    }

    shared.teardown().await;
}

async fn run_session(shared: &Arc<Shared>) -> Result<SessionEnd> {
    let config = &shared.config;
    let (stream, _response) = timeout(config.connect_timeout, connect_async(shared.url.as_str()))
        .await
        .map_err(|_| {
            ClientError::Timeout(format!(
                "connection timeout after {:?}",
                config.connect_timeout
            ))
        })?
        .map_err(|error| ClientError::WebSocket(error.to_string()))?;

    let (mut writer, mut reader) = stream.split();
    let cid = shared.next_cid();
    writer
        .send(Message::Text(protocol::handshake_frame(cid)?.into()))
        .await
        .map_err(|error| ClientError::WebSocket(error.to_string()))?;

    let ack = timeout(
        config.ack_timeout,
        await_handshake(&mut reader, &mut writer, cid),
    )
    .await
    .map_err(|_| ClientError::Timeout(format!("handshake timeout after {:?}", config.ack_timeout)))??;

    *shared.writer.lock().await = Some(writer);
    shared.set_state(ConnectionState::Connected).await;
    shared.lifecycle().mark_live(ack.socket_id.clone());
    info!(
        relay = %shared.url,
        socket_id = ack.socket_id.as_deref().unwrap_or_default(),
        "relay connected"
    );
    shared.emit(ConnectionEvent::Connected {
        socket_id: ack.socket_id,
    });

    let idle = ack
        .ping_timeout_ms
        .filter(|ms| *ms > 0)
        .map_or(config.ping_timeout, Duration::from_millis);
    shared.resubscribe_all().await;
    read_loop(shared, &mut reader, idle).await
}

async fn await_handshake(
    reader: &mut WsReader,
    writer: &mut WsWriter,
    cid: u64,
) -> Result<HandshakeAck> {
    while let Some(frame) = reader.next().await {
        let frame = frame.map_err(|error| ClientError::WebSocket(error.to_string()))?;
        match frame {
            Message::Text(text) => match protocol::parse_frame(text.as_str())? {
                Some(InboundFrame::Ping { legacy }) => {
                    writer
                        .send(Message::Text(protocol::pong_text(legacy).to_string().into()))
                        .await
                        .map_err(|error| ClientError::WebSocket(error.to_string()))?;
                }
                Some(InboundFrame::Response { rid, data, error }) if rid == cid => {
                    if let Some(error) = error {
                        return Err(ClientError::Protocol(format!(
                            "handshake rejected: {error}"
                        )));
                    }
                    return Ok(HandshakeAck::from_response(data.as_ref()));
                }
                _ => {}
            },
            Message::Close(_) => {
                return Err(ClientError::Connection(
                    "relay closed during handshake".to_string(),
                ));
            }
            _ => {}
        }
    }
    Err(ClientError::Connection(
        "stream ended during handshake; closed".to_string(),
    ))
}

/// Route frames until the relay closes, errors, or stays silent for `idle`.
async fn read_loop(
    shared: &Arc<Shared>,
    reader: &mut WsReader,
    idle: Duration,
) -> Result<SessionEnd> {
    loop {
        let Ok(next) = timeout(idle, reader.next()).await else {
            return Err(ClientError::Timeout(format!(
                "no frame from relay within {}ms",
                idle.as_millis()
            )));
        };
        let Some(frame) = next else {
            return Ok(SessionEnd::Closed("relay stream ended".to_string()));
        };
        match frame {
            Ok(Message::Text(text)) => shared.handle_text(text.as_str()).await,
            Ok(Message::Close(frame)) => {
                let detail = frame
                    .map(|frame| format!("relay closed the stream: {}", frame.reason))
                    .unwrap_or_else(|| "relay closed the stream".to_string());
                return Ok(SessionEnd::Closed(detail));
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
            Err(error) => return Err(ClientError::WebSocket(error.to_string())),
        }
    }
}

/// Re-subscribe a `Degraded` slot with backoff until the relay acknowledges
/// it, the slot goes away, or the connection drops (reconnect re-subscribes
/// every slot on its own).
async fn retry_subscription(
    shared: Weak<Shared>,
    channel: String,
    slot_id: u64,
    cancel: CancellationToken,
) {
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        let (delay, ack_timeout) = {
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let seed = format!("{}#{channel}", shared.url);
            (
                shared.config.reconnect.delay_for(&seed, attempt),
                shared.config.ack_timeout,
            )
        };
        debug!(
            channel = channel.as_str(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling channel re-subscribe"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sleep(delay) => {}
        }

        let Some(strong) = shared.upgrade() else {
            break;
        };
        if *strong.state.read().await != ConnectionState::Connected {
            break;
        }
        let Some(mut state) = strong.slot_state(&channel, slot_id) else {
            break;
        };
        if *state.borrow() != ChannelState::Degraded {
            break;
        }
        strong.update_slot_state(
            &channel,
            Some(slot_id),
            ChannelState::Pending,
            Some(ChannelState::Degraded),
        );
        strong.send_subscribe(&channel).await;
        drop(strong);

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            outcome = timeout(
                ack_timeout,
                state.wait_for(|state| *state != ChannelState::Pending),
            ) => outcome.map(|reached| reached.map(|state| *state)),
        };
        match outcome {
            Ok(Ok(ChannelState::Degraded)) => {}
            Ok(Ok(ChannelState::Live)) => {
                info!(channel = channel.as_str(), attempt, "channel re-subscribed");
                break;
            }
            Ok(Ok(_) | Err(_)) => break,
            Err(_) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                if *shared.state.read().await != ConnectionState::Connected {
                    break;
                }
                shared.update_slot_state(
                    &channel,
                    Some(slot_id),
                    ChannelState::Degraded,
                    Some(ChannelState::Pending),
                );
            }
        }
    }
    cancel.cancel();
}
