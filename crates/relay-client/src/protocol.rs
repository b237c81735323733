//! SocketCluster JSON frame encoding and parsing.

use crate::error::{ClientError, Result};
use serde_json::{Value, json};

const EVENT_HANDSHAKE: &str = "#handshake";
const EVENT_SUBSCRIBE: &str = "#subscribe";
const EVENT_UNSUBSCRIBE: &str = "#unsubscribe";
const EVENT_PUBLISH: &str = "#publish";
const EVENT_KICK_OUT: &str = "#kickOut";

const LEGACY_PING: &str = "#1";
const LEGACY_PONG: &str = "#2";

/// Frame received from the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Heartbeat. `legacy` is set for the `#1` form of protocol v1.
    Ping { legacy: bool },
    /// Reply to a request that carried a `cid`.
    Response {
        rid: u64,
        data: Option<Value>,
        error: Option<Value>,
    },
    /// Message published on a channel.
    Publish { channel: String, data: Value },
    /// Relay revoked a channel subscription.
    KickOut {
        channel: String,
        message: Option<String>,
    },
    /// Any other named server event.
    Event { event: String, data: Value },
}

/// Handshake acknowledgment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAck {
    pub socket_id: Option<String>,
    pub ping_timeout_ms: Option<u64>,
}

impl HandshakeAck {
    /// Read the handshake fields the client cares about; missing fields stay `None`.
    pub fn from_response(data: Option<&Value>) -> Self {
        let socket_id = data
            .and_then(|value| value.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let ping_timeout_ms = data
            .and_then(|value| value.get("pingTimeout"))
            .and_then(Value::as_u64);
        Self {
            socket_id,
            ping_timeout_ms,
        }
    }
}

pub fn handshake_frame(cid: u64) -> Result<String> {
    encode(&json!({
        "event": EVENT_HANDSHAKE,
        "data": { "authToken": Value::Null },
        "cid": cid,
    }))
}

pub fn subscribe_frame(cid: u64, channel: &str) -> Result<String> {
    encode(&json!({
        "event": EVENT_SUBSCRIBE,
        "data": { "channel": channel },
        "cid": cid,
    }))
}

pub fn unsubscribe_frame(cid: u64, channel: &str) -> Result<String> {
    encode(&json!({
        "event": EVENT_UNSUBSCRIBE,
        "data": channel,
        "cid": cid,
    }))
}

/// Reply text for a ping of the given style.
pub fn pong_text(legacy: bool) -> &'static str {
    if legacy { LEGACY_PONG } else { "" }
}

fn encode(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Parse a relay text frame into a typed frame.
pub fn parse_frame(text: &str) -> Result<Option<InboundFrame>> {
    if text.is_empty() {
        return Ok(Some(InboundFrame::Ping { legacy: false }));
    }
    if text == LEGACY_PING {
        return Ok(Some(InboundFrame::Ping { legacy: true }));
    }

    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| ClientError::Protocol("expected JSON object frame".to_string()))?;

    if let Some(rid) = object.get("rid") {
        let rid = rid
            .as_u64()
            .ok_or_else(|| ClientError::Protocol("invalid response rid".to_string()))?;
        return Ok(Some(InboundFrame::Response {
            rid,
            data: object.get("data").cloned(),
            error: object.get("error").filter(|error| !error.is_null()).cloned(),
        }));
    }

    let Some(event) = object.get("event") else {
        return Ok(None);
    };
    let event = event
        .as_str()
        .ok_or_else(|| ClientError::Protocol("invalid event name".to_string()))?;
    let data = object.get("data").cloned().unwrap_or(Value::Null);

    match event {
        EVENT_PUBLISH => {
            let channel = data
                .get("channel")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Protocol("invalid publish channel".to_string()))?
                .to_string();
            let payload = data.get("data").cloned().unwrap_or(Value::Null);
            Ok(Some(InboundFrame::Publish {
                channel,
                data: payload,
            }))
        }
        EVENT_KICK_OUT => {
            let channel = data
                .get("channel")
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::Protocol("invalid kickOut channel".to_string()))?
                .to_string();
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(Some(InboundFrame::KickOut { channel, message }))
        }
        _ => Ok(Some(InboundFrame::Event {
            event: event.to_string(),
            data,
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_heartbeats() -> Result<()> {
        assert_eq!(
            parse_frame("")?,
            Some(InboundFrame::Ping { legacy: false })
        );
        assert_eq!(
            parse_frame("#1")?,
            Some(InboundFrame::Ping { legacy: true })
        );
        assert_eq!(pong_text(false), "");
        assert_eq!(pong_text(true), "#2");
        Ok(())
    }

    #[test]
    fn parse_known_frame_kinds() -> Result<()> {
        let response = parse_frame(r##"{"rid":3,"data":{"id":"sock-1","pingTimeout":20000}}"##)?;
        let Some(InboundFrame::Response { rid, data, error }) = response else {
            panic!("expected response frame, got {response:?}");
        };
        assert_eq!(rid, 3);
        assert!(error.is_none());
        let ack = HandshakeAck::from_response(data.as_ref());
        assert_eq!(ack.socket_id.as_deref(), Some("sock-1"));
        assert_eq!(ack.ping_timeout_ms, Some(20_000));

        let publish = parse_frame(
            r##"{"event":"#publish","data":{"channel":"driver.drv_1","data":{"event":"order.ready","data":{"id":"order_123"}}}}"##,
        )?;
        assert_eq!(
            publish,
            Some(InboundFrame::Publish {
                channel: "driver.drv_1".to_string(),
                data: json!({"event": "order.ready", "data": {"id": "order_123"}}),
            })
        );

        let kick = parse_frame(r##"{"event":"#kickOut","data":{"channel":"chat.c1","message":"bye"}}"##)?;
        assert_eq!(
            kick,
            Some(InboundFrame::KickOut {
                channel: "chat.c1".to_string(),
                message: Some("bye".to_string()),
            })
        );

        let other = parse_frame(r##"{"event":"#setAuthToken","data":{"token":"t"}}"##)?;
        assert!(matches!(other, Some(InboundFrame::Event { ref event, .. }) if event == "#setAuthToken"));
        Ok(())
    }

    #[test]
    fn null_error_is_treated_as_success() -> Result<()> {
        let frame = parse_frame(r##"{"rid":7,"error":null}"##)?;
        assert_eq!(
            frame,
            Some(InboundFrame::Response {
                rid: 7,
                data: None,
                error: None,
            })
        );
        Ok(())
    }

    #[test]
    fn unknown_object_shape_returns_none() -> Result<()> {
        assert!(parse_frame(r##"{"hello":"world"}"##)?.is_none());
        Ok(())
    }

    #[test]
    fn parse_malformed_frames() {
        struct Case {
            name: &'static str,
            input: &'static str,
            expected_error_fragment: &'static str,
        }

        let cases = vec![
            Case {
                name: "array payload",
                input: r##"["EVENT","sub"]"##,
                expected_error_fragment: "expected JSON object frame",
            },
            Case {
                name: "rid is not a number",
                input: r##"{"rid":"one"}"##,
                expected_error_fragment: "invalid response rid",
            },
            Case {
                name: "event name is not a string",
                input: r##"{"event":12}"##,
                expected_error_fragment: "invalid event name",
            },
            Case {
                name: "publish without channel",
                input: r##"{"event":"#publish","data":{"data":{}}}"##,
                expected_error_fragment: "invalid publish channel",
            },
            Case {
                name: "kickOut without channel",
                input: r##"{"event":"#kickOut","data":{"message":"x"}}"##,
                expected_error_fragment: "invalid kickOut channel",
            },
            Case {
                name: "not json",
                input: "{not json",
                expected_error_fragment: "serialization error",
            },
        ];

        for case in cases {
            let result = parse_frame(case.input);
            assert!(result.is_err(), "{}: expected an error", case.name);

            if let Err(error) = result {
                let rendered = error.to_string();
                assert!(
                    rendered.contains(case.expected_error_fragment),
                    "{}: expected error fragment '{}' in '{}'",
                    case.name,
                    case.expected_error_fragment,
                    rendered
                );
            }
        }
    }

    #[test]
    fn outbound_frames_carry_cid_and_channel() -> Result<()> {
        let subscribe: Value = serde_json::from_str(&subscribe_frame(4, "driver.drv_1")?)?;
        assert_eq!(subscribe["event"], "#subscribe");
        assert_eq!(subscribe["data"]["channel"], "driver.drv_1");
        assert_eq!(subscribe["cid"], 4);

        let unsubscribe: Value = serde_json::from_str(&unsubscribe_frame(5, "driver.drv_1")?)?;
        assert_eq!(unsubscribe["event"], "#unsubscribe");
        assert_eq!(unsubscribe["data"], "driver.drv_1");

        let handshake: Value = serde_json::from_str(&handshake_frame(1)?)?;
        assert_eq!(handshake["event"], "#handshake");
        assert_eq!(handshake["cid"], 1);
        Ok(())
    }
}
