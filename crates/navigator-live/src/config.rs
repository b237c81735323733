use std::env;
use std::time::Duration;

use fleet_resources::FleetApiConfig;
use relay_client::{ReconnectPolicy, RelayConfig, RelayEndpoint};
use thiserror::Error;

use crate::overrides::OverrideStore;

pub const SOCKET_HOST_OVERRIDE: &str = "_SOCKET_HOST";
pub const SOCKET_PORT_OVERRIDE: &str = "_SOCKET_PORT";
pub const SOCKET_PATH_OVERRIDE: &str = "_SOCKET_PATH";
pub const SOCKET_SECURE_OVERRIDE: &str = "_SOCKET_SECURE";
pub const FLEETBASE_HOST_OVERRIDE: &str = "_FLEETBASE_HOST";
pub const FLEETBASE_KEY_OVERRIDE: &str = "_FLEETBASE_KEY";

pub const SOCKET_HOST_ENV: &str = "SOCKETCLUSTER_HOST";
pub const SOCKET_PORT_ENV: &str = "SOCKETCLUSTER_PORT";
pub const SOCKET_PATH_ENV: &str = "SOCKETCLUSTER_PATH";
pub const SOCKET_SECURE_ENV: &str = "SOCKETCLUSTER_SECURE";
pub const FLEETBASE_HOST_ENV: &str = "FLEETBASE_HOST";
pub const FLEETBASE_KEY_ENV: &str = "FLEETBASE_KEY";
pub const ACK_TIMEOUT_ENV: &str = "NAVIGATOR_SUBSCRIBE_ACK_TIMEOUT_MS";
pub const RECONNECT_BASE_ENV: &str = "NAVIGATOR_RECONNECT_BASE_MS";
pub const RECONNECT_MAX_ENV: &str = "NAVIGATOR_RECONNECT_MAX_MS";
pub const RECONNECT_JITTER_ENV: &str = "NAVIGATOR_RECONNECT_JITTER_MS";
pub const ORDER_FETCH_ATTEMPTS_ENV: &str = "NAVIGATOR_ORDER_FETCH_ATTEMPTS";

pub const DEFAULT_FLEETBASE_HOST: &str = "https://api.fleetbase.io";
pub const DEFAULT_ORDER_FETCH_ATTEMPTS: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Everything a live session needs to connect and resolve orders.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub relay: RelayConfig,
    pub fleet: FleetApiConfig,
    pub order_fetch_attempts: u32,
}

impl LiveConfig {
    pub fn from_env(overrides: &OverrideStore) -> Result<Self, ConfigError> {
        Self::from_lookup(overrides, |key| env::var(key).ok())
    }

    pub fn from_lookup(
        overrides: &OverrideStore,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let endpoint = resolve_relay_endpoint(overrides, &lookup)?;
        let mut relay = RelayConfig::with_endpoint(endpoint);

        let defaults = ReconnectPolicy::default();
        relay.ack_timeout = Duration::from_millis(parse_with_lookup(
            &lookup,
            ACK_TIMEOUT_ENV,
            relay.ack_timeout.as_millis() as u64,
            |raw| parse_positive_u64(ACK_TIMEOUT_ENV, &raw),
        )?);
        relay.reconnect = ReconnectPolicy {
            base_ms: parse_with_lookup(&lookup, RECONNECT_BASE_ENV, defaults.base_ms, |raw| {
                parse_positive_u64(RECONNECT_BASE_ENV, &raw)
            })?,
            max_ms: parse_with_lookup(&lookup, RECONNECT_MAX_ENV, defaults.max_ms, |raw| {
                parse_positive_u64(RECONNECT_MAX_ENV, &raw)
            })?,
            jitter_ms: parse_with_lookup(&lookup, RECONNECT_JITTER_ENV, defaults.jitter_ms, |raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|error| ConfigError::invalid(RECONNECT_JITTER_ENV, error.to_string()))
            })?,
        };
        if relay.reconnect.max_ms < relay.reconnect.base_ms {
            return Err(ConfigError::invalid(
                RECONNECT_MAX_ENV,
                format!(
                    "must be >= {RECONNECT_BASE_ENV} ({})",
                    relay.reconnect.base_ms
                ),
            ));
        }

        let base_url = layered(overrides, &lookup, FLEETBASE_HOST_OVERRIDE, FLEETBASE_HOST_ENV)
            .map_or_else(|| DEFAULT_FLEETBASE_HOST.to_string(), |(_, value)| value);
        let api_key =
            layered(overrides, &lookup, FLEETBASE_KEY_OVERRIDE, FLEETBASE_KEY_ENV).map(|(_, value)| value);
        let fleet = FleetApiConfig::new(base_url, api_key);

        let order_fetch_attempts = parse_with_lookup(
            &lookup,
            ORDER_FETCH_ATTEMPTS_ENV,
            DEFAULT_ORDER_FETCH_ATTEMPTS,
            |raw| {
                let attempts = raw.trim().parse::<u32>().map_err(|error| {
                    ConfigError::invalid(ORDER_FETCH_ATTEMPTS_ENV, error.to_string())
                })?;
                if !(1..=5).contains(&attempts) {
                    return Err(ConfigError::invalid(
                        ORDER_FETCH_ATTEMPTS_ENV,
                        "must be between 1 and 5",
                    ));
                }
                Ok(attempts)
            },
        )?;

        Ok(Self {
            relay,
            fleet,
            order_fetch_attempts,
        })
    }
}

/// Resolve the relay endpoint field by field: device override, then static
/// configuration, then the built-in default.
pub fn resolve_relay_endpoint(
    overrides: &OverrideStore,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<RelayEndpoint, ConfigError> {
    let defaults = RelayEndpoint::default();

    let hostname = layered(overrides, lookup, SOCKET_HOST_OVERRIDE, SOCKET_HOST_ENV)
        .map_or(defaults.hostname, |(_, value)| value);

    let port = match layered(overrides, lookup, SOCKET_PORT_OVERRIDE, SOCKET_PORT_ENV) {
        Some((key, raw)) => raw
            .parse::<u16>()
            .ok()
            .filter(|port| *port > 0)
            .ok_or_else(|| ConfigError::invalid(key, format!("expected a port number, got {raw:?}")))?,
        None => defaults.port,
    };

    let path = layered(overrides, lookup, SOCKET_PATH_OVERRIDE, SOCKET_PATH_ENV)
        .map_or(defaults.path, |(_, value)| value);

    let secure = match layered(overrides, lookup, SOCKET_SECURE_OVERRIDE, SOCKET_SECURE_ENV) {
        Some((key, raw)) => {
            parse_bool(&raw).map_err(|other| ConfigError::invalid(key, format!("expected a boolean, got {other:?}")))?
        }
        None => defaults.secure,
    };

    Ok(RelayEndpoint {
        hostname,
        port,
        path,
        secure,
    })
}

/// First non-blank value for a setting, with the key that supplied it.
fn layered<'k>(
    overrides: &OverrideStore,
    lookup: &impl Fn(&str) -> Option<String>,
    override_key: &'k str,
    env_key: &'k str,
) -> Option<(&'k str, String)> {
    if let Some(value) = overrides.get(override_key) {
        return Some((override_key, value.to_string()));
    }
    lookup(env_key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| (env_key, value))
}

fn parse_with_lookup<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parser: impl FnOnce(String) -> Result<T, ConfigError>,
) -> Result<T, ConfigError> {
    match lookup(key).filter(|raw| !raw.trim().is_empty()) {
        Some(raw) => parser(raw),
        None => Ok(default),
    }
}

fn parse_positive_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::invalid(key, "must be greater than zero")),
        Ok(value) => Ok(value),
        Err(error) => Err(ConfigError::invalid(key, error.to_string())),
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(values: &HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |key| values.get(key).map(ToString::to_string)
    }

    #[test]
    fn defaults_apply_when_nothing_is_configured() -> Result<(), ConfigError> {
        let config = LiveConfig::from_lookup(&OverrideStore::in_memory(), |_| None)?;
        assert_eq!(config.relay.endpoint, RelayEndpoint::default());
        assert_eq!(config.relay.ack_timeout, Duration::from_secs(15));
        assert_eq!(config.relay.reconnect, ReconnectPolicy::default());
        assert_eq!(config.fleet.base_url, DEFAULT_FLEETBASE_HOST);
        assert_eq!(config.fleet.api_key, None);
        assert_eq!(config.order_fetch_attempts, 2);
        Ok(())
    }

    #[test]
    fn device_overrides_win_over_static_configuration_per_field() -> Result<(), ConfigError> {
        let values = HashMap::from([
            ("SOCKETCLUSTER_HOST", "socket.static.example"),
            ("SOCKETCLUSTER_PORT", "9000"),
            ("SOCKETCLUSTER_PATH", "/static/"),
            ("SOCKETCLUSTER_SECURE", "true"),
        ]);
        let mut overrides = OverrideStore::in_memory();
        overrides.set(SOCKET_HOST_OVERRIDE, "socket.device.example");
        overrides.set(SOCKET_SECURE_OVERRIDE, "off");
        overrides.set(SOCKET_PATH_OVERRIDE, "  ");

        let endpoint = resolve_relay_endpoint(&overrides, &lookup_from(&values))?;
        assert_eq!(
            endpoint,
            RelayEndpoint {
                hostname: "socket.device.example".to_string(),
                port: 9000,
                path: "/static/".to_string(),
                secure: false,
            }
        );
        Ok(())
    }

    #[test]
    fn backend_and_tuning_values_are_parsed() -> Result<(), ConfigError> {
        let values = HashMap::from([
            ("FLEETBASE_HOST", "https://fleet.example.com"),
            ("FLEETBASE_KEY", "flb_live_abc"),
            ("NAVIGATOR_SUBSCRIBE_ACK_TIMEOUT_MS", "2500"),
            ("NAVIGATOR_RECONNECT_BASE_MS", "100"),
            ("NAVIGATOR_RECONNECT_MAX_MS", "4000"),
            ("NAVIGATOR_RECONNECT_JITTER_MS", "0"),
            ("NAVIGATOR_ORDER_FETCH_ATTEMPTS", "1"),
        ]);
        let mut overrides = OverrideStore::in_memory();
        overrides.set(FLEETBASE_KEY_OVERRIDE, "flb_device_key");

        let config = LiveConfig::from_lookup(&overrides, lookup_from(&values))?;
        assert_eq!(config.fleet.base_url, "https://fleet.example.com");
        assert_eq!(config.fleet.api_key.as_deref(), Some("flb_device_key"));
        assert_eq!(config.relay.ack_timeout, Duration::from_millis(2500));
        assert_eq!(
            config.relay.reconnect,
            ReconnectPolicy {
                base_ms: 100,
                max_ms: 4000,
                jitter_ms: 0,
            }
        );
        assert_eq!(config.order_fetch_attempts, 1);
        Ok(())
    }

    #[test]
    fn invalid_values_name_the_offending_key() {
        struct Case {
            name: &'static str,
            values: Vec<(&'static str, &'static str)>,
            override_value: Option<(&'static str, &'static str)>,
            expected: &'static str,
        }

        let cases = vec![
            Case {
                name: "port from static config",
                values: vec![("SOCKETCLUSTER_PORT", "eighty")],
                override_value: None,
                expected: "invalid SOCKETCLUSTER_PORT: expected a port number, got \"eighty\"",
            },
            Case {
                name: "port from device override",
                values: vec![("SOCKETCLUSTER_PORT", "8000")],
                override_value: Some((SOCKET_PORT_OVERRIDE, "0")),
                expected: "invalid _SOCKET_PORT: expected a port number, got \"0\"",
            },
            Case {
                name: "secure flag",
                values: vec![("SOCKETCLUSTER_SECURE", "maybe")],
                override_value: None,
                expected: "invalid SOCKETCLUSTER_SECURE: expected a boolean, got \"maybe\"",
            },
            Case {
                name: "zero ack timeout",
                values: vec![("NAVIGATOR_SUBSCRIBE_ACK_TIMEOUT_MS", "0")],
                override_value: None,
                expected: "invalid NAVIGATOR_SUBSCRIBE_ACK_TIMEOUT_MS: must be greater than zero",
            },
            Case {
                name: "max below base",
                values: vec![
                    ("NAVIGATOR_RECONNECT_BASE_MS", "5000"),
                    ("NAVIGATOR_RECONNECT_MAX_MS", "100"),
                ],
                override_value: None,
                expected: "invalid NAVIGATOR_RECONNECT_MAX_MS: must be >= NAVIGATOR_RECONNECT_BASE_MS (5000)",
            },
            Case {
                name: "fetch attempts out of range",
                values: vec![("NAVIGATOR_ORDER_FETCH_ATTEMPTS", "9")],
                override_value: None,
                expected: "invalid NAVIGATOR_ORDER_FETCH_ATTEMPTS: must be between 1 and 5",
            },
        ];

        for case in cases {
            let values: HashMap<&'static str, &'static str> = case.values.into_iter().collect();
            let mut overrides = OverrideStore::in_memory();
            if let Some((key, value)) = case.override_value {
                overrides.set(key, value);
            }
            let result = LiveConfig::from_lookup(&overrides, lookup_from(&values));
            let rendered = result.err().map(|error| error.to_string());
            assert_eq!(rendered.as_deref(), Some(case.expected), "{}", case.name);
        }
    }
}
