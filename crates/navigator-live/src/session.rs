//! Live session: one relay connection, the driver's order channel, optional
//! chat channels, and the registry that fans updates out in-process.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use fleet_resources::{Driver, FleetApiClient, FleetApiError, Order, OrderLookup};
use relay_client::{
    ClientError, ListenOutcome, ListenerHandle, RelayConnection, spawn_lifecycle_logger,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LiveConfig;
use crate::events::{EventKind, chat_channel, driver_channel};
use crate::filter::{
    ChatEvent, ChatEventFilter, ChatHandler, OrderEventFilter, OrderHandler, spawn_chat_listener,
    spawn_order_listener,
};
use crate::notification::{NotificationSink, build_notification};
use crate::registry::EventRegistry;

/// Every resolved order, regardless of event name.
pub const ORDER_UPDATES_TOPIC: &str = "order_updates";
/// Every chat event, regardless of event name.
pub const CHAT_EVENTS_TOPIC: &str = "chat_events";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Relay(ClientError),
    #[error(transparent)]
    Fleet(#[from] FleetApiError),
    #[error("already watching channel {0}")]
    AlreadyWatching(String),
    #[error("live session is shut down")]
    ShutDown,
}

impl From<ClientError> for SessionError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::AlreadySubscribed(channel) => Self::AlreadyWatching(channel),
            ClientError::Closed => Self::ShutDown,
            other => Self::Relay(other),
        }
    }
}

/// Payload delivered to registry listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    Order { event: String, order: Order },
    Chat(ChatEvent),
}

struct SessionOrderHandler {
    driver: Driver,
    registry: EventRegistry<LiveUpdate>,
    sink: Arc<dyn NotificationSink>,
}

#[async_trait]
impl OrderHandler for SessionOrderHandler {
    async fn handle_order(&self, order: Order, event: &str) -> relay_client::Result<()> {
        let notify = EventKind::parse(event).is_some_and(EventKind::is_order_event);
        let notification = notify.then(|| build_notification(&order, &self.driver, event));

        let update = LiveUpdate::Order {
            event: event.to_string(),
            order,
        };
        let delivered = self.registry.emit(ORDER_UPDATES_TOPIC, &update)
            + if event.is_empty() {
                0
            } else {
                self.registry.emit(event, &update)
            };
        debug!(event, delivered, "order update emitted");

        if let Some(notification) = notification {
            self.sink.notify(notification).await?;
        }
        Ok(())
    }
}

struct SessionChatHandler {
    registry: EventRegistry<LiveUpdate>,
}

#[async_trait]
impl ChatHandler for SessionChatHandler {
    async fn handle_chat(&self, event: ChatEvent) -> relay_client::Result<()> {
        let name = event.kind.as_str();
        let update = LiveUpdate::Chat(event);
        let delivered =
            self.registry.emit(CHAT_EVENTS_TOPIC, &update) + self.registry.emit(name, &update);
        debug!(event = name, delivered, "chat update emitted");
        Ok(())
    }
}

/// Owns the relay connection and every listener started through it.
pub struct LiveSession {
    connection: RelayConnection,
    lookup: Arc<dyn OrderLookup>,
    sink: Arc<dyn NotificationSink>,
    registry: EventRegistry<LiveUpdate>,
    order_fetch_attempts: u32,
    cancel: CancellationToken,
    listeners: Mutex<Vec<ListenerHandle>>,
    lifecycle_logger: StdMutex<Option<JoinHandle<()>>>,
}

impl LiveSession {
    /// Open the relay connection and start lifecycle logging.
    pub fn start(
        config: LiveConfig,
        lookup: Arc<dyn OrderLookup>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, SessionError> {
        let connection = RelayConnection::open(config.relay)?;
        let cancel = CancellationToken::new();
        let logger = spawn_lifecycle_logger(
            connection.lifecycle_events(),
            connection.url().to_string(),
            cancel.child_token(),
        );
        info!(relay = connection.url(), "live session started");

        Ok(Self {
            connection,
            lookup,
            sink,
            registry: EventRegistry::new(),
            order_fetch_attempts: config.order_fetch_attempts,
            cancel,
            listeners: Mutex::new(Vec::new()),
            lifecycle_logger: StdMutex::new(Some(logger)),
        })
    }

    /// Like [`LiveSession::start`], resolving orders through the Fleetbase API.
    pub fn connect(config: LiveConfig, sink: Arc<dyn NotificationSink>) -> Result<Self, SessionError> {
        let lookup: Arc<dyn OrderLookup> = Arc::new(FleetApiClient::new(config.fleet.clone())?);
        Self::start(config, lookup, sink)
    }

    pub fn registry(&self) -> &EventRegistry<LiveUpdate> {
        &self.registry
    }

    pub fn connection(&self) -> &RelayConnection {
        &self.connection
    }

    /// Subscribe to the driver's order channel. Returns the channel name.
    pub async fn watch_driver(&self, driver: Driver) -> Result<String, SessionError> {
        self.ensure_running()?;
        let name = driver_channel(&driver.id);
        let channel = self.connection.subscribe(name.as_str()).await?;
        let handler = Arc::new(SessionOrderHandler {
            driver,
            registry: self.registry.clone(),
            sink: Arc::clone(&self.sink),
        });
        let filter = OrderEventFilter::new(Arc::clone(&self.lookup), handler)
            .with_fetch_attempts(self.order_fetch_attempts);
        let listener = spawn_order_listener(channel, filter, &self.cancel);
        push_listener(&mut *self.listeners.lock().await, listener);
        info!(channel = name.as_str(), "watching driver orders");
        Ok(name)
    }

    /// Subscribe to a chat channel. Returns the channel name.
    pub async fn watch_chat(&self, channel_id: &str) -> Result<String, SessionError> {
        self.ensure_running()?;
        let name = chat_channel(channel_id);
        let channel = self.connection.subscribe(name.as_str()).await?;
        let filter = ChatEventFilter::new(Arc::new(SessionChatHandler {
            registry: self.registry.clone(),
        }));
        let listener = spawn_chat_listener(channel, filter, &self.cancel);
        push_listener(&mut *self.listeners.lock().await, listener);
        info!(channel = name.as_str(), "watching chat channel");
        Ok(name)
    }

    /// Stop one watched channel.
    pub async fn unwatch(&self, channel: &str) -> Option<ListenOutcome> {
        let listener = {
            let mut listeners = self.listeners.lock().await;
            prune_finished(&mut listeners);
            let index = listeners.iter().position(|listener| listener.channel() == channel)?;
            listeners.swap_remove(index)
        };
        Some(listener.stop().await)
    }

    /// Channels whose listener is still running.
    pub async fn watched_channels(&self) -> Vec<String> {
        let mut listeners = self.listeners.lock().await;
        prune_finished(&mut listeners);
        listeners
            .iter()
            .map(|listener| listener.channel().to_string())
            .collect()
    }

    /// Stop every listener (unsubscribing its channel), then close the connection.
    pub async fn shutdown(&self) -> Vec<ListenOutcome> {
        let listeners: Vec<ListenerHandle> = self.listeners.lock().await.drain(..).collect();
        let mut outcomes = Vec::with_capacity(listeners.len());
        for listener in listeners {
            outcomes.push(listener.stop().await);
        }

        self.cancel.cancel();
        let logger = self
            .lifecycle_logger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.connection.close().await;
        if let Some(logger) = logger {
            let _ = logger.await;
        }
        self.registry.clear();
        info!(listeners = outcomes.len(), "live session shut down");
        outcomes
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::ShutDown);
        }
        Ok(())
    }
}

/// Forget listeners that ended on their own (channel closed or connection gone).
fn prune_finished(listeners: &mut Vec<ListenerHandle>) {
    listeners.retain(|listener| {
        let finished = listener.is_finished();
        if finished {
            debug!(channel = listener.channel(), "dropping finished listener");
        }
        !finished
    });
}

fn push_listener(listeners: &mut Vec<ListenerHandle>, listener: ListenerHandle) {
    prune_finished(listeners);
    listeners.push(listener);
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::LocalNotification;
    use std::sync::Mutex as TestMutex;

    #[derive(Default)]
    struct RecordingSink(TestMutex<Vec<LocalNotification>>);

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, notification: LocalNotification) -> relay_client::Result<()> {
            if let Ok(mut seen) = self.0.lock() {
                seen.push(notification);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn order_handler_emits_and_notifies_for_order_events() -> relay_client::Result<()> {
        let registry = EventRegistry::new();
        let sink = Arc::new(RecordingSink::default());
        let handler = SessionOrderHandler {
            driver: Driver::new("drv_1"),
            registry: registry.clone(),
            sink: sink.clone(),
        };

        let updates = Arc::new(TestMutex::new(Vec::new()));
        let collected = Arc::clone(&updates);
        let _all = registry.subscribe(ORDER_UPDATES_TOPIC, move |update: &LiveUpdate| {
            if let Ok(mut updates) = collected.lock() {
                updates.push(update.clone());
            }
        });
        let ready_hits = Arc::new(TestMutex::new(0_usize));
        let ready_counter = Arc::clone(&ready_hits);
        let _ready = registry.subscribe("order.ready", move |_update: &LiveUpdate| {
            if let Ok(mut hits) = ready_counter.lock() {
                *hits += 1;
            }
        });

        let order = Order::new("order_123").with_driver("drv_1");
        handler.handle_order(order.clone(), "order.ready").await?;
        handler.handle_order(order.clone(), "order.cancelled").await?;

        let updates = updates.lock().map(|updates| updates.clone()).unwrap_or_default();
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates.first(),
            Some(&LiveUpdate::Order {
                event: "order.ready".to_string(),
                order,
            })
        );
        assert_eq!(ready_hits.lock().map(|hits| *hits).unwrap_or_default(), 1);

        let notifications = sink.0.lock().map(|seen| seen.clone()).unwrap_or_default();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].message, "New order assigned order_123");
        Ok(())
    }

    #[test]
    fn relay_errors_map_to_session_errors() {
        assert!(matches!(
            SessionError::from(ClientError::AlreadySubscribed("driver.drv_1".to_string())),
            SessionError::AlreadyWatching(channel) if channel == "driver.drv_1"
        ));
        assert!(matches!(SessionError::from(ClientError::Closed), SessionError::ShutDown));
        assert!(matches!(
            SessionError::from(ClientError::NotConnected),
            SessionError::Relay(ClientError::NotConnected)
        ));
    }
}
