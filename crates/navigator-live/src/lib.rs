//! Live order and chat updates for the Navigator driver app.
//!
//! Wires the relay transport to the Fleetbase order lookup: driver channels
//! resolve `order*` ids to full orders, build a local notification, and fan the
//! update out through a session-scoped registry.

pub mod config;
pub mod events;
pub mod filter;
pub mod notification;
pub mod overrides;
pub mod registry;
pub mod session;

pub use config::{ConfigError, LiveConfig, resolve_relay_endpoint};
pub use events::{EventEnvelope, EventKind, chat_channel, driver_channel};
pub use filter::{
    ChatEvent, ChatEventFilter, ChatHandler, OrderEventFilter, OrderHandler, on_chat_event,
    on_order_event, order_callback,
};
pub use notification::{LocalNotification, NotificationSink, TracingNotificationSink, build_notification};
pub use overrides::{OverrideStore, StoreError};
pub use registry::{EventRegistry, RegistrySubscription};
pub use session::{CHAT_EVENTS_TOPIC, LiveSession, LiveUpdate, ORDER_UPDATES_TOPIC, SessionError};
