//! Per-channel listener tasks that feed messages to a handler.

use crate::channel::Channel;
use crate::error::Result;
use crate::relay::ConnectionEvent;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receives every message published on a channel.
///
/// An error (or panic) from one invocation is logged and the listener moves
/// on to the next message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, channel: &str, message: Value) -> Result<()>;
}

struct CallbackHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for CallbackHandler<F>
where
    F: Fn(&str, Value) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, channel: &str, message: Value) -> Result<()> {
        (self.0)(channel, message)
    }
}

/// Adapt a plain closure into a [`MessageHandler`].
pub fn callback_handler<F>(callback: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&str, Value) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(CallbackHandler(callback))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    ChannelClosed,
}

/// Summary returned when a listener finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOutcome {
    pub channel: String,
    pub reason: StopReason,
    pub delivered: u64,
    pub failed: u64,
}

/// Handle to a running listener. Dropping it cancels the listener.
pub struct ListenerHandle {
    channel: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<ListenOutcome>>,
}

impl ListenerHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Cancel the listener, unsubscribe its channel, and wait for it to exit.
    pub async fn stop(mut self) -> ListenOutcome {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the listener to end on its own (channel closed or parent cancelled).
    pub async fn finished(mut self) -> ListenOutcome {
        self.join().await
    }

    async fn join(&mut self) -> ListenOutcome {
        let fallback = ListenOutcome {
            channel: self.channel.clone(),
            reason: StopReason::Cancelled,
            delivered: 0,
            failed: 0,
        };
        let Some(task) = self.task.take() else {
            return fallback;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(channel = self.channel.as_str(), %error, "listener task ended abnormally");
                fallback
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn a task that delivers every message on `channel` to `handler`, in order.
pub fn listen(channel: Channel, handler: Arc<dyn MessageHandler>) -> ListenerHandle {
    listen_until(channel, handler, &CancellationToken::new())
}

/// Like [`listen`], but the listener also stops when `parent` is cancelled.
pub fn listen_until(
    channel: Channel,
    handler: Arc<dyn MessageHandler>,
    parent: &CancellationToken,
) -> ListenerHandle {
    let cancel = parent.child_token();
    let name = channel.name().to_string();
    let task = tokio::spawn(run_listener(channel, handler, cancel.clone()));
    ListenerHandle {
        channel: name,
        cancel,
        task: Some(task),
    }
}

async fn run_listener(
    mut channel: Channel,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
) -> ListenOutcome {
    let name = channel.name().to_string();
    let mut delivered = 0_u64;
    let mut failed = 0_u64;
    debug!(channel = name.as_str(), "channel listener started");

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break StopReason::Cancelled,
            next = channel.next_message() => next,
        };
        let Some(message) = next else {
            break StopReason::ChannelClosed;
        };

        match AssertUnwindSafe(handler.handle(&name, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => delivered += 1,
            Ok(Err(error)) => {
                failed += 1;
                warn!(channel = name.as_str(), %error, "channel handler failed; continuing");
            }
            Err(_) => {
                failed += 1;
                warn!(channel = name.as_str(), "channel handler panicked; continuing");
            }
        }
    };

    if reason == StopReason::Cancelled
        && let Err(error) = channel.unsubscribe().await
    {
        debug!(channel = name.as_str(), %error, "unsubscribe on stop failed");
    }

    info!(
        channel = name.as_str(),
        reason = ?reason,
        delivered,
        failed,
        "channel listener stopped"
    );
    ListenOutcome {
        channel: name,
        reason,
        delivered,
        failed,
    }
}

/// Log connection lifecycle events until cancelled or the connection goes away.
pub fn spawn_lifecycle_logger(
    mut events: broadcast::Receiver<ConnectionEvent>,
    relay: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => log_connection_event(&relay, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(relay = relay.as_str(), skipped, "lifecycle logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_connection_event(relay: &str, event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connecting { attempt } => {
            debug!(relay, attempt, "relay connecting");
        }
        ConnectionEvent::Connected { socket_id } => {
            info!(relay, socket_id = socket_id.as_deref().unwrap_or_default(), "relay connection live");
        }
        ConnectionEvent::Disconnected { reason } => {
            warn!(relay, reason = reason.as_str(), "relay disconnected");
        }
        ConnectionEvent::Error { message } => {
            warn!(relay, error = message.as_str(), "relay connection error");
        }
        ConnectionEvent::Reconnecting { attempt, delay } => {
            info!(
                relay,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "relay reconnect scheduled"
            );
        }
        ConnectionEvent::Closed => {
            info!(relay, "relay connection closed");
        }
    }
}
