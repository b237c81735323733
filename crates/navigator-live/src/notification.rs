//! Local notification content for order events.

use async_trait::async_trait;
use fleet_resources::{Driver, Order};
use tracing::info;

use crate::events::EventKind;

pub const DEFAULT_TITLE: &str = "📦 New Incoming Order";
pub const ADHOC_MESSAGE: &str = "New order available nearby";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNotification {
    pub title: String,
    pub message: String,
    pub subtitle: Option<String>,
}

/// Compose the notification shown for `event` on `order`, as seen by `driver`.
///
/// Orders not assigned to this driver (including unassigned ones) are treated
/// as ad-hoc broadcasts. Pure: the same inputs always give the same output.
pub fn build_notification(order: &Order, driver: &Driver, event: &str) -> LocalNotification {
    let is_adhoc = !order.is_assigned_to(driver);

    let title = match EventKind::parse(event) {
        Some(EventKind::OrderDispatched) => format!("🚚 Order {} has been dispatched", order.id),
        Some(EventKind::OrderDriverAssigned) => format!("📋 Order {} has been assigned", order.id),
        _ => DEFAULT_TITLE.to_string(),
    };
    let message = if is_adhoc {
        ADHOC_MESSAGE.to_string()
    } else {
        format!("New order assigned {}", order.id)
    };
    let subtitle = order
        .pickup_street()
        .map(|street| format!("Pickup at {street}"));

    LocalNotification {
        title,
        message,
        subtitle,
    }
}

/// Platform notification API.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, notification: LocalNotification) -> relay_client::Result<()>;
}

/// Sink that records notifications in the log; used where no OS API exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

#[async_trait]
impl NotificationSink for TracingNotificationSink {
    async fn notify(&self, notification: LocalNotification) -> relay_client::Result<()> {
        info!(
            title = notification.title.as_str(),
            message = notification.message.as_str(),
            subtitle = notification.subtitle.as_deref().unwrap_or_default(),
            "local notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [&str; 5] = [
        "order.ready",
        "order.ping",
        "order.driver_assigned",
        "order.dispatched",
        "",
    ];

    #[test]
    fn assigned_order_ready_uses_default_copy() {
        let order = Order::new("order_123")
            .with_driver("drv_1")
            .with_pickup_street("1 Main St");
        let notification = build_notification(&order, &Driver::new("drv_1"), "order.ready");
        assert_eq!(
            notification,
            LocalNotification {
                title: "📦 New Incoming Order".to_string(),
                message: "New order assigned order_123".to_string(),
                subtitle: Some("Pickup at 1 Main St".to_string()),
            }
        );
    }

    #[test]
    fn order_for_another_driver_is_adhoc_for_every_event() {
        let driver = Driver::new("drv_1");
        let elsewhere = Order::new("order_123").with_driver("drv_999");
        let unassigned = Order::new("order_124");
        for event in ALL_EVENTS {
            assert_eq!(build_notification(&elsewhere, &driver, event).message, ADHOC_MESSAGE);
            assert_eq!(build_notification(&unassigned, &driver, event).message, ADHOC_MESSAGE);
        }
    }

    #[test]
    fn event_specific_titles_include_order_id() {
        let driver = Driver::new("drv_1");
        for order in [
            Order::new("order_7").with_driver("drv_1"),
            Order::new("order_7").with_driver("drv_2"),
            Order::new("order_7"),
        ] {
            let dispatched = build_notification(&order, &driver, "order.dispatched");
            assert!(dispatched.title.contains("order_7"));
            assert!(dispatched.title.contains("dispatched"));

            let assigned = build_notification(&order, &driver, "order.driver_assigned");
            assert_eq!(assigned.title, "📋 Order order_7 has been assigned");
        }
    }

    #[test]
    fn missing_pickup_yields_no_subtitle_and_output_is_stable() {
        let order = Order::new("order_8").with_driver("drv_1");
        let driver = Driver::new("drv_1");
        let first = build_notification(&order, &driver, "order.ping");
        assert_eq!(first.subtitle, None);
        for event in ALL_EVENTS {
            assert_eq!(
                build_notification(&order, &driver, event),
                build_notification(&order, &driver, event)
            );
        }
    }
}
