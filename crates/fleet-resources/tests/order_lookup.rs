use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use fleet_resources::{Driver, FleetApiClient, FleetApiConfig, FleetApiError, OrderLookup};
use serde_json::json;
use tokio::net::TcpListener;

const API_KEY: &str = "flb_test_key";

#[derive(Clone, Default)]
struct StubState {
    hits: Arc<AtomicUsize>,
}

async fn get_order(
    State(state): State<StubState>,
    Path(order_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {API_KEY}").as_str());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing key").into_response();
    }
    if !headers.contains_key("x-request-id") {
        return (StatusCode::BAD_REQUEST, "missing request id").into_response();
    }

    match order_id.as_str() {
        "order_123" => Json(json!({
            "id": "order_123",
            "status": "dispatched",
            "driver_assigned": { "id": "drv_1" },
            "payload": { "pickup": { "street1": "1 Main St" }, "dropoff": null }
        }))
        .into_response(),
        "order_broken" => (StatusCode::OK, "{not json").into_response(),
        "order_down" => (StatusCode::SERVICE_UNAVAILABLE, "maintenance").into_response(),
        _ => (StatusCode::NOT_FOUND, "").into_response(),
    }
}

async fn spawn_fleet_stub() -> Result<(SocketAddr, StubState, tokio::sync::oneshot::Sender<()>)> {
    let state = StubState::default();
    let app = Router::new()
        .route("/v1/orders/:order_id", get(get_order))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });
    Ok((addr, state, shutdown_tx))
}

fn client_for(addr: SocketAddr, api_key: Option<&str>) -> Result<FleetApiClient> {
    Ok(FleetApiClient::new(FleetApiConfig::new(
        format!("http://{addr}/"),
        api_key.map(str::to_string),
    ))?)
}

#[tokio::test]
async fn find_order_decodes_typed_order() -> Result<()> {
    let (addr, state, shutdown) = spawn_fleet_stub().await?;
    let client = client_for(addr, Some(API_KEY))?;

    let order = client.find_order("order_123").await?;
    assert_eq!(order.id, "order_123");
    assert_eq!(order.status.as_deref(), Some("dispatched"));
    assert!(order.is_assigned_to(&Driver::new("drv_1")));
    assert_eq!(order.pickup_street(), Some("1 Main St"));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn find_order_maps_failure_classes() -> Result<()> {
    let (addr, _state, shutdown) = spawn_fleet_stub().await?;
    let client = client_for(addr, Some(API_KEY))?;

    let missing = client.find_order("order_missing").await;
    assert!(matches!(
        missing,
        Err(FleetApiError::NotFound { resource: "order", ref id }) if id == "order_missing"
    ));

    let broken = client.find_order("order_broken").await;
    assert!(matches!(broken, Err(FleetApiError::Decode { .. })));

    let down = client.find_order("order_down").await;
    match down {
        Err(error @ FleetApiError::Http { .. }) => {
            assert!(error.is_retryable());
            assert_eq!(error.to_string(), "fleet_http_503 Service Unavailable:maintenance");
        }
        other => anyhow::bail!("unexpected result: {other:?}"),
    }

    let unauthorized = client_for(addr, None)?.find_order("order_123").await;
    assert!(matches!(
        unauthorized,
        Err(FleetApiError::Http { status, .. }) if status.as_u16() == 401
    ));

    let _ = shutdown.send(());
    Ok(())
}

#[tokio::test]
async fn transport_failure_is_retryable_request_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut config = FleetApiConfig::new(format!("http://{addr}"), Some(API_KEY.to_string()));
    config.request_attempts = 2;
    let client = FleetApiClient::new(config)?;

    match client.find_order("order_123").await {
        Err(error @ FleetApiError::Request { .. }) => assert!(error.is_retryable()),
        other => anyhow::bail!("unexpected result: {other:?}"),
    }
    Ok(())
}
