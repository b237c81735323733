//! Reconnect bookkeeping: attempt counters, backoff delays, disconnect reasons.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Exponential reconnect backoff with deterministic jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_ms: u64,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based): exponential, capped at
    /// `max_ms`, plus jitter derived from `seed_key`.
    #[must_use]
    pub fn delay_for(&self, seed_key: &str, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let base = self.base_ms.max(1);
        let scaled = base.saturating_mul(1_u64 << exponent);
        let capped = scaled.min(self.max_ms.max(base));
        Duration::from_millis(capped.saturating_add(deterministic_jitter_ms(
            seed_key,
            u64::from(attempt),
            self.jitter_ms,
        )))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    StreamClosed,
    KickedOut,
    Timeout,
    Network,
    Protocol,
    Unknown,
}

impl DisconnectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StreamClosed => "stream_closed",
            Self::KickedOut => "kicked_out",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionHealth {
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub next_retry_ms: Option<u64>,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_error: Option<String>,
    pub socket_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPlan {
    pub attempt: u32,
    pub delay: Duration,
}

/// Per-connection lifecycle counters driving the reconnect supervisor.
#[derive(Debug, Clone)]
pub struct ConnectionLifecycle {
    policy: ReconnectPolicy,
    seed_key: String,
    health: ConnectionHealth,
}

impl ConnectionLifecycle {
    pub fn new(policy: ReconnectPolicy, seed_key: impl Into<String>) -> Self {
        Self {
            policy,
            seed_key: seed_key.into(),
            health: ConnectionHealth::default(),
        }
    }

    pub fn mark_connecting(&mut self) -> u32 {
        self.health.connect_attempts = self.health.connect_attempts.saturating_add(1);
        self.health.next_retry_ms = None;
        self.health.connect_attempts
    }

    /// Handshake completed; consecutive failures start over.
    pub fn mark_live(&mut self, socket_id: Option<String>) {
        self.health.reconnect_attempts = 0;
        self.health.next_retry_ms = None;
        self.health.last_error = None;
        self.health.socket_id = socket_id;
    }

    #[must_use]
    pub fn mark_disconnect(
        &mut self,
        reason: DisconnectReason,
        error: Option<String>,
    ) -> ReconnectPlan {
        self.health.reconnect_attempts = self.health.reconnect_attempts.saturating_add(1);
        let attempt = self.health.reconnect_attempts;
        let delay = self.policy.delay_for(&self.seed_key, attempt);
        let delay_ms = delay.as_millis() as u64;
        self.health.last_disconnect_reason = Some(reason);
        self.health.last_error = error;
        self.health.next_retry_ms = Some(delay_ms);
        self.health.socket_id = None;
        ReconnectPlan { attempt, delay }
    }

    #[must_use]
    pub fn snapshot(&self) -> ConnectionHealth {
        self.health.clone()
    }
}

pub fn deterministic_jitter_ms(seed_key: &str, attempt: u64, max_jitter_ms: u64) -> u64 {
    if max_jitter_ms == 0 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    seed_key.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish() % (max_jitter_ms.saturating_add(1))
}

#[must_use]
pub fn classify_disconnect_reason(error: &str) -> DisconnectReason {
    let normalized = error.to_ascii_lowercase();
    if normalized.contains("kickout") || normalized.contains("kicked out") {
        return DisconnectReason::KickedOut;
    }
    if normalized.contains("timeout") || normalized.contains("timed out") {
        return DisconnectReason::Timeout;
    }
    if normalized.contains("protocol error") || normalized.contains("handshake rejected") {
        return DisconnectReason::Protocol;
    }
    if normalized.contains("closed") {
        return DisconnectReason::StreamClosed;
    }
    if normalized.contains("connection refused")
        || normalized.contains("connection reset")
        || normalized.contains("network")
        || normalized.contains("io error")
        || normalized.contains("websocket error")
        || normalized.contains("dns")
    {
        return DisconnectReason::Network;
    }
    DisconnectReason::Unknown
}
