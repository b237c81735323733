//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("already subscribed to channel: {0}")]
    AlreadySubscribed(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,
}

impl ClientError {
    /// Wrap any displayable failure raised inside a message handler.
    pub fn handler(error: impl std::fmt::Display) -> Self {
        Self::Handler(error.to_string())
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
