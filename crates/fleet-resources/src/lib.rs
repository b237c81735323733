use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

mod model;

pub use model::{Driver, DriverRef, Order, OrderPayload, Place};

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 1;

#[derive(Debug, Clone)]
pub struct FleetApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl FleetApiConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, Error)]
pub enum FleetApiError {
    #[error("fleet_client_base_url_missing")]
    BaseUrlMissing,
    #[error("fleet_client_invalid_path")]
    InvalidPath,
    #[error("fleet_invalid_resource_id:{id}")]
    InvalidResourceId { id: String },
    #[error("fleet_request_failed:{message}")]
    Request { message: String },
    #[error("fleet_read_failed:{message}")]
    Read { message: String },
    #[error("fleet_http_{status}:{body}")]
    Http { status: StatusCode, body: String },
    #[error("fleet_{resource}_not_found:{id}")]
    NotFound { resource: &'static str, id: String },
    #[error("fleet_json_decode_failed:{message}")]
    Decode { message: String },
}

impl FleetApiError {
    /// Transport failures and server-side errors may succeed on a second try.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } | Self::Read { .. } => true,
            Self::Http { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::BaseUrlMissing
            | Self::InvalidPath
            | Self::InvalidResourceId { .. }
            | Self::NotFound { .. }
            | Self::Decode { .. } => false,
        }
    }
}

/// Resolve an order id to the full order resource.
#[async_trait]
pub trait OrderLookup: Send + Sync + 'static {
    async fn find_order(&self, id: &str) -> Result<Order, FleetApiError>;
}

/// Fleetbase REST client limited to the resources the live core needs.
#[derive(Debug, Clone)]
pub struct FleetApiClient {
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

impl FleetApiClient {
    pub fn new(config: FleetApiConfig) -> Result<Self, FleetApiError> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            api_key: config
                .api_key
                .and_then(non_empty_string),
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with('/') {
            Some(format!("{}{}", self.base_url, trimmed))
        } else {
            Some(format!("{}/{}", self.base_url, trimmed))
        }
    }

    pub fn order_path(order_id: &str) -> Result<String, FleetApiError> {
        Ok(format!("/v1/orders/{}", validate_resource_id(order_id)?))
    }

    /// GET a single resource, mapping 404 to [`FleetApiError::NotFound`].
    pub async fn get_resource<T>(
        &self,
        resource: &'static str,
        id: &str,
        path: &str,
    ) -> Result<T, FleetApiError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let response = self.send_get(path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FleetApiError::NotFound {
                resource,
                id: id.to_string(),
            });
        }
        decode_json_response(response).await
    }

    async fn send_get(&self, path: &str) -> Result<reqwest::Response, FleetApiError> {
        let url = self.endpoint(path).ok_or(FleetApiError::InvalidPath)?;
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let mut request = self
                .http
                .get(url.as_str())
                .header("accept", "application/json")
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout);
            if let Some(api_key) = self.api_key.as_deref() {
                request = request.bearer_auth(api_key);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    debug!(url = url.as_str(), attempt = attempt + 1, %error, "fleet request failed");
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(FleetApiError::Request {
            message: last_error.unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

#[async_trait]
impl OrderLookup for FleetApiClient {
    async fn find_order(&self, id: &str) -> Result<Order, FleetApiError> {
        let path = Self::order_path(id)?;
        self.get_resource("order", id.trim(), path.as_str()).await
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> FleetApiError {
    let body = non_empty_string(String::from_utf8_lossy(body).to_string())
        .unwrap_or_else(|| "<empty>".to_string());
    FleetApiError::Http { status, body }
}

fn validate_resource_id(id: &str) -> Result<&str, FleetApiError> {
    let trimmed = id.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-');
    if valid {
        Ok(trimmed)
    } else {
        Err(FleetApiError::InvalidResourceId { id: id.to_string() })
    }
}

fn normalize_base_url(base_url: &str) -> Result<String, FleetApiError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(FleetApiError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T, FleetApiError>
where
    T: for<'de> serde::Deserialize<'de>,
{
    let status = response.status();
    let bytes = response
        .bytes()
        .await
        .map_err(|error| FleetApiError::Read {
            message: error.to_string(),
        })?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| FleetApiError::Decode {
        message: error.to_string(),
    })
}

fn non_empty_string(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_builder_normalizes_paths() -> Result<(), FleetApiError> {
        let client = FleetApiClient::new(FleetApiConfig::new("https://api.fleetbase.io/", None))?;

        assert_eq!(
            client.endpoint("/v1/orders/order_1"),
            Some("https://api.fleetbase.io/v1/orders/order_1".to_string())
        );
        assert_eq!(
            client.endpoint("v1/orders/order_1"),
            Some("https://api.fleetbase.io/v1/orders/order_1".to_string())
        );
        assert_eq!(client.endpoint(""), None);
        Ok(())
    }

    #[test]
    fn order_path_rejects_unsafe_ids() {
        assert_eq!(
            FleetApiClient::order_path(" order_abc-1 ").ok().as_deref(),
            Some("/v1/orders/order_abc-1")
        );
        for bad in ["", "   ", "order/../x", "order?x=1"] {
            assert!(
                matches!(
                    FleetApiClient::order_path(bad),
                    Err(FleetApiError::InvalidResourceId { .. })
                ),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn http_error_mapping_preserves_shape() {
        let error = format_http_error(StatusCode::BAD_GATEWAY, b" gateway failed ");
        assert_eq!(error.to_string(), "fleet_http_502 Bad Gateway:gateway failed");
        assert!(error.is_retryable());

        let empty_body = format_http_error(StatusCode::UNPROCESSABLE_ENTITY, b" ");
        assert_eq!(
            empty_body.to_string(),
            "fleet_http_422 Unprocessable Entity:<empty>"
        );
        assert!(!empty_body.is_retryable());
    }

    #[test]
    fn retryability_follows_error_class() {
        assert!(FleetApiError::Request { message: "reset".to_string() }.is_retryable());
        assert!(!FleetApiError::NotFound { resource: "order", id: "order_1".to_string() }.is_retryable());
        assert!(!FleetApiError::Decode { message: "eof".to_string() }.is_retryable());
        assert!(
            format_http_error(StatusCode::TOO_MANY_REQUESTS, b"slow down").is_retryable()
        );
    }

    #[test]
    fn base_url_missing_is_rejected() {
        let result = FleetApiClient::new(FleetApiConfig::new("   ", None));
        assert!(matches!(result, Err(FleetApiError::BaseUrlMissing)));
    }
}
