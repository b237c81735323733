//! Event envelopes carried on driver and chat channels.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

const ORDER_ID_PREFIX: &str = "order";

/// `{event, data}` wrapper used by every message on order and chat channels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EventEnvelope {
    #[serde(default, deserialize_with = "event_name")]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    /// Lenient parse; anything that is not an object yields `None`.
    pub fn from_message(message: Value) -> Option<Self> {
        if !message.is_object() {
            return None;
        }
        serde_json::from_value(message).ok()
    }

    /// `data.id` when it is a string.
    pub fn resource_id(&self) -> Option<&str> {
        self.data.get("id").and_then(Value::as_str)
    }

    /// `data.id` when it names an order.
    pub fn order_id(&self) -> Option<&str> {
        self.resource_id()
            .filter(|id| id.starts_with(ORDER_ID_PREFIX))
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event)
    }
}

/// Non-string event names read as empty rather than failing the envelope.
fn event_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    Ok(raw.as_str().unwrap_or_default().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    OrderReady,
    OrderPing,
    OrderDriverAssigned,
    OrderDispatched,
    ChatAddedParticipant,
    ChatRemovedParticipant,
    ChatParticipantCreated,
    ChatParticipantDeleted,
    ChatMessageCreated,
    ChatLogCreated,
    ChatAttachmentCreated,
    ChatReceiptCreated,
}

impl EventKind {
    pub const ALL: [Self; 12] = [
        Self::OrderReady,
        Self::OrderPing,
        Self::OrderDriverAssigned,
        Self::OrderDispatched,
        Self::ChatAddedParticipant,
        Self::ChatRemovedParticipant,
        Self::ChatParticipantCreated,
        Self::ChatParticipantDeleted,
        Self::ChatMessageCreated,
        Self::ChatLogCreated,
        Self::ChatAttachmentCreated,
        Self::ChatReceiptCreated,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OrderReady => "order.ready",
            Self::OrderPing => "order.ping",
            Self::OrderDriverAssigned => "order.driver_assigned",
            Self::OrderDispatched => "order.dispatched",
            Self::ChatAddedParticipant => "chat.added_participant",
            Self::ChatRemovedParticipant => "chat.removed_participant",
            Self::ChatParticipantCreated => "chat_participant.created",
            Self::ChatParticipantDeleted => "chat_participant.deleted",
            Self::ChatMessageCreated => "chat_message.created",
            Self::ChatLogCreated => "chat_log.created",
            Self::ChatAttachmentCreated => "chat_attachment.created",
            Self::ChatReceiptCreated => "chat_receipt.created",
        }
    }

    #[must_use]
    pub fn is_order_event(self) -> bool {
        matches!(
            self,
            Self::OrderReady | Self::OrderPing | Self::OrderDriverAssigned | Self::OrderDispatched
        )
    }

    #[must_use]
    pub fn is_chat_event(self) -> bool {
        !self.is_order_event()
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn driver_channel(driver_id: &str) -> String {
    format!("driver.{}", driver_id.trim())
}

pub fn chat_channel(channel_id: &str) -> String {
    format!("chat.{}", channel_id.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_exposes_string_ids_only() {
        let envelope = EventEnvelope::from_message(json!({
            "event": "order.ready",
            "data": { "id": "order_123" }
        }));
        assert_eq!(
            envelope.as_ref().and_then(EventEnvelope::order_id),
            Some("order_123")
        );
        assert_eq!(
            envelope.as_ref().and_then(EventEnvelope::kind),
            Some(EventKind::OrderReady)
        );

        let numeric = EventEnvelope::from_message(json!({ "event": "order.ready", "data": { "id": 42 } }));
        assert_eq!(numeric.as_ref().and_then(EventEnvelope::resource_id), None);

        let place = EventEnvelope::from_message(json!({ "event": "order.ready", "data": { "id": "place_1" } }));
        assert_eq!(place.as_ref().and_then(EventEnvelope::resource_id), Some("place_1"));
        assert_eq!(place.as_ref().and_then(EventEnvelope::order_id), None);

        assert!(EventEnvelope::from_message(json!("order_1")).is_none());
        let empty = EventEnvelope::from_message(json!({}));
        assert_eq!(empty.map(|envelope| envelope.event), Some(String::new()));
    }

    #[test]
    fn envelope_decoding_is_lenient_about_shapes() {
        struct Case {
            message: Value,
            event: &'static str,
            data: Value,
        }

        let cases = [
            Case {
                message: json!({ "event": 7, "data": { "id": "order_1" } }),
                event: "",
                data: json!({ "id": "order_1" }),
            },
            Case {
                message: json!({ "event": null }),
                event: "",
                data: Value::Null,
            },
            Case {
                message: json!({ "event": "chat_log.created", "data": [1, 2], "extra": true }),
                event: "chat_log.created",
                data: json!([1, 2]),
            },
        ];
        for case in cases {
            let envelope = EventEnvelope::from_message(case.message.clone());
            assert_eq!(
                envelope,
                Some(EventEnvelope {
                    event: case.event.to_string(),
                    data: case.data,
                }),
                "message {}",
                case.message
            );
        }
        assert!(EventEnvelope::from_message(Value::Null).is_none());
        assert!(EventEnvelope::from_message(json!([{ "event": "order.ready" }])).is_none());
    }

    #[test]
    fn taxonomy_round_trips_through_names() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::ALL.iter().filter(|kind| kind.is_order_event()).count(), 4);
        assert_eq!(EventKind::ALL.iter().filter(|kind| kind.is_chat_event()).count(), 8);
        assert_eq!(EventKind::parse("order.cancelled"), None);
    }

    #[test]
    fn channel_names_follow_convention() {
        assert_eq!(driver_channel("drv_1"), "driver.drv_1");
        assert_eq!(chat_channel(" c_9 "), "chat.c_9");
    }
}
