//! SocketCluster relay client transport.
//!
//! This crate exposes a small surface:
//! - one supervised WebSocket connection with reconnect and re-subscription
//! - named channels yielding JSON messages in delivery order
//! - listener tasks that feed a channel into a [`MessageHandler`]

pub mod channel;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod protocol;
pub mod relay;

pub use channel::{Channel, ChannelState};
pub use error::{ClientError, Result};
pub use lifecycle::{ConnectionHealth, DisconnectReason, ReconnectPolicy};
pub use listener::{
    ListenOutcome, ListenerHandle, MessageHandler, StopReason, callback_handler, listen,
    listen_until, spawn_lifecycle_logger,
};
pub use relay::{ConnectionEvent, ConnectionState, RelayConfig, RelayConnection, RelayEndpoint};
