//! Channel message filters that turn raw envelopes into domain callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_resources::{Order, OrderLookup};
use relay_client::{Channel, ListenerHandle, MessageHandler, listen, listen_until};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::DEFAULT_ORDER_FETCH_ATTEMPTS;
use crate::events::{EventEnvelope, EventKind};

/// Receives orders resolved from channel envelopes.
#[async_trait]
pub trait OrderHandler: Send + Sync + 'static {
    async fn handle_order(&self, order: Order, event: &str) -> relay_client::Result<()>;
}

struct OrderCallback<F>(F);

#[async_trait]
impl<F> OrderHandler for OrderCallback<F>
where
    F: Fn(Order, &str) -> relay_client::Result<()> + Send + Sync + 'static,
{
    async fn handle_order(&self, order: Order, event: &str) -> relay_client::Result<()> {
        (self.0)(order, event)
    }
}

pub fn order_callback<F>(callback: F) -> Arc<dyn OrderHandler>
where
    F: Fn(Order, &str) -> relay_client::Result<()> + Send + Sync + 'static,
{
    Arc::new(OrderCallback(callback))
}

/// Resolves `order*` ids to full orders and forwards them to an [`OrderHandler`].
///
/// Payloads without a string `data.id` starting with `order` are dropped
/// without logging above trace. A failed fetch is retried while the error is
/// retryable and attempts remain, then logged and dropped.
pub struct OrderEventFilter<L: ?Sized, H: ?Sized> {
    lookup: Arc<L>,
    handler: Arc<H>,
    fetch_attempts: u32,
}

impl<L, H> OrderEventFilter<L, H>
where
    L: OrderLookup + ?Sized,
    H: OrderHandler + ?Sized,
{
    pub fn new(lookup: Arc<L>, handler: Arc<H>) -> Self {
        Self {
            lookup,
            handler,
            fetch_attempts: DEFAULT_ORDER_FETCH_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_fetch_attempts(mut self, attempts: u32) -> Self {
        self.fetch_attempts = attempts.max(1);
        self
    }

    async fn fetch(&self, channel: &str, order_id: &str, event: &str) -> Option<Order> {
        let attempts = self.fetch_attempts.max(1);
        for attempt in 1..=attempts {
            match self.lookup.find_order(order_id).await {
                Ok(order) => return Some(order),
                Err(error) if error.is_retryable() && attempt < attempts => {
                    debug!(channel, order_id, event, attempt, %error, "order fetch failed; retrying");
                }
                Err(error) => {
                    warn!(
                        channel,
                        order_id,
                        event,
                        attempt,
                        %error,
                        "order fetch failed; dropping event"
                    );
                    return None;
                }
            }
        }
        None
    }
}

#[async_trait]
impl<L, H> MessageHandler for OrderEventFilter<L, H>
where
    L: OrderLookup + ?Sized,
    H: OrderHandler + ?Sized,
{
    async fn handle(&self, channel: &str, message: Value) -> relay_client::Result<()> {
        let Some(envelope) = EventEnvelope::from_message(message) else {
            trace!(channel, "ignoring non-envelope message");
            return Ok(());
        };
        let Some(order_id) = envelope.order_id() else {
            trace!(channel, event = envelope.event.as_str(), "ignoring non-order payload");
            return Ok(());
        };

        let Some(order) = self.fetch(channel, order_id, &envelope.event).await else {
            return Ok(());
        };
        self.handler.handle_order(order, &envelope.event).await
    }
}

/// Run the order filter on `channel` until the returned handle is stopped.
pub fn on_order_event<L, H>(channel: Channel, lookup: Arc<L>, handler: Arc<H>) -> ListenerHandle
where
    L: OrderLookup + ?Sized,
    H: OrderHandler + ?Sized,
{
    listen(channel, Arc::new(OrderEventFilter::new(lookup, handler)))
}

/// Chat envelope whose event is part of the chat taxonomy.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub kind: EventKind,
    pub channel: String,
    pub data: Value,
}

#[async_trait]
pub trait ChatHandler: Send + Sync + 'static {
    async fn handle_chat(&self, event: ChatEvent) -> relay_client::Result<()>;
}

pub struct ChatEventFilter<H: ?Sized> {
    handler: Arc<H>,
}

impl<H: ChatHandler + ?Sized> ChatEventFilter<H> {
    pub fn new(handler: Arc<H>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: ChatHandler + ?Sized> MessageHandler for ChatEventFilter<H> {
    async fn handle(&self, channel: &str, message: Value) -> relay_client::Result<()> {
        let Some(envelope) = EventEnvelope::from_message(message) else {
            trace!(channel, "ignoring non-envelope message");
            return Ok(());
        };
        let Some(kind) = envelope.kind().filter(|kind| kind.is_chat_event()) else {
            trace!(channel, event = envelope.event.as_str(), "ignoring non-chat event");
            return Ok(());
        };
        self.handler
            .handle_chat(ChatEvent {
                kind,
                channel: channel.to_string(),
                data: envelope.data,
            })
            .await
    }
}

pub fn on_chat_event<H>(channel: Channel, handler: Arc<H>) -> ListenerHandle
where
    H: ChatHandler + ?Sized,
{
    listen(channel, Arc::new(ChatEventFilter::new(handler)))
}

/// Order filter listener that also stops when `parent` is cancelled.
pub(crate) fn spawn_order_listener<L, H>(
    channel: Channel,
    filter: OrderEventFilter<L, H>,
    parent: &CancellationToken,
) -> ListenerHandle
where
    L: OrderLookup + ?Sized,
    H: OrderHandler + ?Sized,
{
    listen_until(channel, Arc::new(filter), parent)
}

pub(crate) fn spawn_chat_listener<H>(
    channel: Channel,
    filter: ChatEventFilter<H>,
    parent: &CancellationToken,
) -> ListenerHandle
where
    H: ChatHandler + ?Sized,
{
    listen_until(channel, Arc::new(filter), parent)
}
