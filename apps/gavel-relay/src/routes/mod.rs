mod sse;

use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequest, Path, Request, State},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use notify_core::{
    BridgeError, ConnectionId, ConnectionStatus, Domain, EventKind, SubscriptionKey,
};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(health_check))
        .route("/metrics", get(sse::prometheus_metrics))
        .route(
            "/events/:domain/:entity",
            get(sse::subscribe_events).post(publish_event),
        )
        .route("/channels/:domain/:entity", get(channel_stats))
        .route("/connections/:connection_id", delete(close_connection))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(&'static str),
    Conflict(String),
    Unavailable(&'static str),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(ApiErrorBody {
                    error: "bad_request",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::Conflict(msg) => (
                axum::http::StatusCode::CONFLICT,
                Json(ApiErrorBody {
                    error: "conflict",
                    message: Some(msg),
                }),
            )
                .into_response(),
            ApiError::Unavailable(msg) => (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiErrorBody {
                    error: "unavailable",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
        }
    }
}

/// `Json` with rejections routed through the same error body as every
/// other 4xx on this API.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(ApiError::BadRequest(rejection.body_text())),
        }
    }
}

fn parse_key(domain: &str, entity: &str) -> Result<SubscriptionKey, ApiError> {
    let domain = domain
        .parse::<Domain>()
        .map_err(|err| ApiError::BadRequest(err.to_string()))?;
    SubscriptionKey::new(domain, entity).map_err(|err| ApiError::BadRequest(err.to_string()))
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "type")]
    pub event_type: EventKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub key: SubscriptionKey,
    pub seq: u64,
}

async fn publish_event(
    State(state): State<AppState>,
    Path((domain, entity)): Path<(String, String)>,
    ApiJson(request): ApiJson<PublishRequest>,
) -> ApiResult<PublishResponse> {
    let key = parse_key(&domain, &entity)?;
    let seq = state
        .service
        .publish(&key, request.event_type, request.payload)
        .await
        .map_err(|err| match err {
            BridgeError::Bus(_) => ApiError::Unavailable("event bus unreachable"),
            other => ApiError::BadRequest(other.to_string()),
        })?;
    Ok(Json(PublishResponse { key, seq }))
}

#[derive(Debug, Serialize)]
pub struct ChannelStats {
    pub key: SubscriptionKey,
    pub connections: usize,
}

async fn channel_stats(
    State(state): State<AppState>,
    Path((domain, entity)): Path<(String, String)>,
) -> ApiResult<ChannelStats> {
    let key = parse_key(&domain, &entity)?;
    let connections = state.service.connection_count(&key);
    Ok(Json(ChannelStats { key, connections }))
}

#[derive(Debug, Serialize)]
pub struct CloseResponse {
    pub connection_id: ConnectionId,
    pub status: ConnectionStatus,
}

async fn close_connection(
    State(state): State<AppState>,
    Path(connection_id): Path<String>,
) -> ApiResult<CloseResponse> {
    let id = connection_id
        .parse::<ConnectionId>()
        .map_err(|_| ApiError::BadRequest(format!("invalid connection id: {connection_id}")))?;
    if !state.service.close(id) {
        return Err(ApiError::NotFound("connection not registered"));
    }
    Ok(Json(CloseResponse {
        connection_id: id,
        status: ConnectionStatus::Completed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use notify_bus::{EventBus, LocalBus};
    use notify_core::{BusBridge, ConnectionRegistry, NotifyService};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;
    use tower::util::ServiceExt;

    async fn test_state() -> AppState {
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
        let registry = ConnectionRegistry::new(Duration::from_secs(600));
        let bridge = Arc::new(BusBridge::new(bus.clone(), registry.clone()));
        bridge.start().await.expect("bridge start");
        AppState {
            service: NotifyService::new(bus, registry, bridge, 32),
            keep_alive: Duration::from_secs(15),
        }
    }

    async fn next_sse_frame(body: &mut Body) -> String {
        let frame = timeout(Duration::from_secs(1), body.frame())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame read");
        let data = frame.into_data().expect("data frame");
        String::from_utf8(data.to_vec()).expect("utf8 frame")
    }

    #[tokio::test]
    async fn publish_returns_assigned_sequence() {
        let state = test_state().await;
        let app = build_router(state);

        for expected_seq in 1..=2u64 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/events/auction/42")
                        .header("content-type", "application/json")
                        .body(Body::from(
                            json!({ "type": "AUCTION_WON", "payload": { "tokenId": "T1" } })
                                .to_string(),
                        ))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let published: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(published["key"], "auction-42");
            assert_eq!(published["seq"], expected_seq);
        }
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events/garage/42")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "type": "NOTICE" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["error"], "bad_request");
    }

    #[tokio::test]
    async fn publish_without_bus_subscription_is_unavailable() {
        // Bridge never started, so the in-memory bus has no receive
        // loop and broadcast has nowhere to land.
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
        let registry = ConnectionRegistry::new(Duration::from_secs(600));
        let bridge = Arc::new(BusBridge::new(bus.clone(), registry.clone()));
        let state = AppState {
            service: NotifyService::new(bus, registry, bridge, 32),
            keep_alive: Duration::from_secs(15),
        };
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events/auction/1")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({ "type": "NOTICE" }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["error"], "unavailable");
    }

    #[tokio::test]
    async fn sse_stream_delivers_published_event() {
        let state = test_state().await;
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/events/auction/42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        state
            .service
            .publish(
                &"auction-42".parse().unwrap(),
                EventKind::AuctionWon,
                json!({ "tokenId": "T1" }),
            )
            .await
            .expect("publish");

        let mut body = response.into_body();
        let frame = next_sse_frame(&mut body).await;
        assert!(frame.contains("id: 1"), "frame: {frame}");
        assert!(frame.contains("event: AUCTION_WON"), "frame: {frame}");
        assert!(frame.contains("tokenId"), "frame: {frame}");
    }

    #[tokio::test]
    async fn reconnect_with_last_event_id_replays_missed_frames() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let key: SubscriptionKey = "contract-7".parse().unwrap();

        for n in 1..=3u64 {
            state
                .service
                .publish(&key, EventKind::ContractSigned, json!({ "n": n }))
                .await
                .expect("publish");
        }

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/events/contract/7")
                    .header("last-event-id", "1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body();
        let frame = next_sse_frame(&mut body).await;
        assert!(frame.contains("id: 2"), "frame: {frame}");
        let frame = next_sse_frame(&mut body).await;
        assert!(frame.contains("id: 3"), "frame: {frame}");
    }

    #[tokio::test]
    async fn fresh_subscriber_without_last_event_id_starts_live_only() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let key: SubscriptionKey = "contract-7".parse().unwrap();

        for n in 1..=3u64 {
            state
                .service
                .publish(&key, EventKind::ContractSigned, json!({ "n": n }))
                .await
                .expect("publish");
        }
        // Drain a frame published after those three through another key
        // so the dispatch loop is provably past them before the fresh
        // stream opens.
        let sentinel = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/events/user/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        state
            .service
            .publish(&"user-7".parse().unwrap(), EventKind::Notice, json!({}))
            .await
            .expect("publish sentinel");
        let mut sentinel_body = sentinel.into_body();
        next_sse_frame(&mut sentinel_body).await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/events/contract/7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state
            .service
            .publish(&key, EventKind::ContractCompleted, json!({}))
            .await
            .expect("publish");

        let mut body = response.into_body();
        let frame = next_sse_frame(&mut body).await;
        assert!(frame.contains("id: 4"), "frame: {frame}");
        assert!(!frame.contains("id: 1"), "frame: {frame}");
    }

    #[tokio::test]
    async fn malformed_publish_body_is_rejected_with_the_error_envelope() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/events/auction/1")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"type\": \"NOT_A_KIND\""))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["error"], "bad_request");
        assert!(error["message"].is_string());
    }

    #[tokio::test]
    async fn channel_stats_reports_open_connections() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let key: SubscriptionKey = "auction-3".parse().unwrap();
        let _sub = state.service.subscribe(key.clone(), None).await.unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/channels/auction/3")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(stats["key"], "auction-3");
        assert_eq!(stats["connections"], 1);
    }

    #[tokio::test]
    async fn close_connection_releases_the_slot() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let key: SubscriptionKey = "user-9".parse().unwrap();
        let sub = state.service.subscribe(key.clone(), None).await.unwrap();
        let id = sub.id();

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/connections/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let closed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(closed["status"], "completed");
        assert_eq!(state.service.connection_count(&key), 0);
    }

    #[tokio::test]
    async fn closing_unknown_connection_is_not_found() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/connections/{}", ConnectionId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_connection_id_is_rejected() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/connections/not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let state = test_state().await;
        let app = build_router(state);

        for uri in ["/healthz", "/readyz"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn metrics_expose_publish_counters() {
        let state = test_state().await;
        let app = build_router(state.clone());
        state
            .service
            .publish(
                &"payment-5".parse().unwrap(),
                EventKind::PaymentReceived,
                json!({}),
            )
            .await
            .expect("publish");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("notify_events_published_total"));
    }
}
