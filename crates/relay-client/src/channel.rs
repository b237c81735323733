//! Channel subscriptions and their message streams.

use crate::error::Result;
use crate::relay::Shared;
use serde_json::Value;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Subscription state of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Subscribe requested, acknowledgment outstanding.
    Pending,
    /// Relay confirmed the subscription.
    Live,
    /// Acknowledgment timed out, was rejected, or the relay kicked the
    /// channel. Re-subscription is retried with backoff; messages may still
    /// arrive meanwhile.
    Degraded,
    /// Unsubscribed or the connection was closed.
    Closed,
}

/// Connection-side half of a channel.
pub(crate) struct ChannelSlot {
    pub(crate) id: u64,
    pub(crate) messages: mpsc::UnboundedSender<Value>,
    pub(crate) state: watch::Sender<ChannelState>,
    /// Running re-subscribe loop, if any. Cancelled when the slot goes away.
    pub(crate) retry: Option<CancellationToken>,
}

impl Drop for ChannelSlot {
    fn drop(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.cancel();
        }
    }
}

impl ChannelSlot {
    pub(crate) fn new(name: &str, id: u64, shared: Weak<Shared>) -> (Self, Channel) {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChannelState::Pending);
        let slot = Self {
            id,
            messages: messages_tx,
            state: state_tx,
            retry: None,
        };
        let channel = Channel {
            name: name.to_string(),
            slot_id: id,
            state: state_rx,
            messages: messages_rx,
            shared,
        };
        (slot, channel)
    }
}

/// Handle to a subscribed channel.
///
/// Messages are yielded in the order the relay delivered them. The stream
/// survives reconnects and ends only when the channel is unsubscribed or the
/// connection is closed. Dropping the handle forgets the channel locally.
pub struct Channel {
    name: String,
    slot_id: u64,
    state: watch::Receiver<ChannelState>,
    messages: mpsc::UnboundedReceiver<Value>,
    shared: Weak<Shared>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        if self.state.has_changed().is_err() {
            return ChannelState::Closed;
        }
        *self.state.borrow()
    }

    /// Wait until the relay confirms the subscription.
    ///
    /// Returns the state reached. On timeout a still-pending channel is
    /// marked `Degraded`, re-subscription is scheduled, and that state is
    /// returned.
    pub async fn wait_live(&mut self, wait: Duration) -> ChannelState {
        let reached = match timeout(
            wait,
            self.state.wait_for(|state| {
                matches!(state, ChannelState::Live | ChannelState::Closed)
            }),
        )
        .await
        {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_)) => Some(ChannelState::Closed),
            Err(_) => None,
        };

        if let Some(state) = reached {
            return state;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.update_slot_state(
                &self.name,
                Some(self.slot_id),
                ChannelState::Degraded,
                Some(ChannelState::Pending),
            );
            if self.state() == ChannelState::Degraded {
                shared.schedule_resubscribe(&self.name, self.slot_id);
            }
        }
        self.state()
    }

    /// Next message, or `None` once the channel has ended.
    pub async fn next_message(&mut self) -> Option<Value> {
        self.messages.recv().await
    }

    /// Tell the relay to stop delivering this channel and end the stream.
    pub async fn unsubscribe(self) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        if !shared.remove_slot(&self.name, self.slot_id) {
            return Ok(());
        }
        match shared.send_unsubscribe(&self.name).await {
            Ok(()) => Ok(()),
            Err(crate::error::ClientError::NotConnected) => {
                debug!(channel = self.name.as_str(), "unsubscribed while disconnected");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove_slot(&self.name, self.slot_id);
        }
    }
}
