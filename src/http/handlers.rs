//! Service handlers: demo endpoint, health, metrics, and the admin façade
//! over engine operations.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, error, info};

use super::AppState;
use crate::ratelimit::{mask_credential, LimiterKind};
use crate::storage::now_unix_ms;

const SERVICE_NAME: &str = "Gatekeeper";

/// Demo endpoint behind the rate limiting gateway.
pub async fn demo() -> Response {
    Json(serde_json::json!({
        "message": "Hello from Gatekeeper!",
        "service": SERVICE_NAME,
        "timestamp": now_unix_ms() / 1000,
    }))
    .into_response()
}

/// Liveness probe; never rate limited.
pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "timestamp": now_unix_ms() / 1000,
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// Minimal runtime metrics: uptime and store reachability.
pub async fn metrics(State(state): State<AppState>) -> Response {
    let store_status = match state.store.health().await {
        Ok(()) => "ok",
        Err(e) => {
            error!(error = %e, "Store health check failed");
            "unreachable"
        }
    };

    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "timestamp": now_unix_ms() / 1000,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "store": store_status,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct StatusParams {
    key: Option<String>,
    kind: Option<String>,
}

/// Admin: snapshot of one bucket's state.
pub async fn admin_status(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> Response {
    let (identity, kind) = match validate_target(params.key.as_deref(), params.kind.as_deref()) {
        Ok(target) => target,
        Err(response) => return response,
    };

    debug!(
        key = %mask_credential(&identity),
        kind = %kind,
        "Admin status requested"
    );

    let status = match state.limiter.status(&identity, kind).await {
        Ok(status) => status,
        Err(e) => {
            error!(kind = %kind, error = %e, "Failed to read rate limit status");
            return internal_error("failed to retrieve rate limit status");
        }
    };

    let Some(status) = status else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "not_found",
                "message": "no rate limit state for this key",
            })),
        )
            .into_response();
    };

    let mut body = serde_json::json!({
        "key": identity,
        "limit": status.limit,
        "current": status.count,
        "remaining": status.limit.saturating_sub(status.count),
        "reset_time": status.window_end_ms() / 1000,
        "is_blocked": status.blocked,
        "limiter_type": kind.as_str(),
        "timestamp": now_unix_ms() / 1000,
    });
    if let Some(blocked_until_ms) = status.blocked_until_ms {
        body["blocked_until"] = serde_json::json!(blocked_until_ms / 1000);
    }

    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    key: Option<String>,
    kind: Option<String>,
}

/// Admin: drop counter and block state for one bucket.
pub async fn admin_reset(
    State(state): State<AppState>,
    Json(request): Json<ResetRequest>,
) -> Response {
    let (identity, kind) = match validate_target(request.key.as_deref(), request.kind.as_deref()) {
        Ok(target) => target,
        Err(response) => return response,
    };

    if let Err(e) = state.limiter.reset(&identity, kind).await {
        error!(kind = %kind, error = %e, "Failed to reset rate limit state");
        return internal_error("failed to reset rate limit state");
    }

    info!(
        key = %mask_credential(&identity),
        kind = %kind,
        "Rate limit state reset by admin"
    );

    Json(serde_json::json!({
        "status": "success",
        "message": "rate limit state reset",
        "key": mask_credential(&identity),
        "kind": kind.as_str(),
        "timestamp": now_unix_ms() / 1000,
    }))
    .into_response()
}

/// Validate the `(key, kind)` pair shared by both admin operations.
fn validate_target(
    key: Option<&str>,
    kind: Option<&str>,
) -> std::result::Result<(String, LimiterKind), Response> {
    let identity = key.map(str::trim).unwrap_or_default();
    if identity.is_empty() {
        return Err(validation_error("key parameter is required"));
    }

    let kind = kind.map(str::trim).unwrap_or_default();
    if kind.is_empty() {
        return Err(validation_error("kind parameter is required"));
    }
    let kind: LimiterKind = kind
        .parse()
        .map_err(|_| validation_error("kind must be 'address' or 'credential'"))?;

    Ok((identity.to_string(), kind))
}

fn validation_error(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": "validation_error",
            "message": message,
        })),
    )
        .into_response()
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": "internal_server_error",
            "message": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::extract::Request;
    use http_body_util::BodyExt;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::http::HttpServer;
    use crate::ratelimit::{RateLimitConfig, RateLimiter};
    use crate::storage::MemoryStore;

    fn test_app() -> axum::Router {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(RateLimiter::new(store.clone(), RateLimitConfig::new()));
        let state = AppState::new(limiter, store);
        HttpServer::router(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn limited_request(address: &str) -> Request {
        Request::builder()
            .uri("/")
            .header("X-Forwarded-For", address)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_not_rate_limited() {
        let app = test_app();

        for _ in 0..30 {
            let req = Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(req).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let body = body_json(app.clone().oneshot(req).await.unwrap()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "Gatekeeper");
    }

    #[tokio::test]
    async fn test_metrics_reports_store_health() {
        let app = test_app();

        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let body = body_json(app.oneshot(req).await.unwrap()).await;
        assert_eq!(body["service"], "Gatekeeper");
        assert_eq!(body["store"], "ok");
        assert!(body["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn test_admin_status_snapshot_after_traffic() {
        let app = test_app();

        for _ in 0..5 {
            let response = app
                .clone()
                .oneshot(limited_request("192.168.1.100"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let req = Request::builder()
            .uri("/admin/status?key=192.168.1.100&kind=address")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["limit"], 10);
        assert_eq!(body["current"], 5);
        assert_eq!(body["remaining"], 5);
        assert_eq!(body["is_blocked"], false);
        assert_eq!(body["limiter_type"], "address");
    }

    #[tokio::test]
    async fn test_admin_status_unknown_key_is_not_found() {
        let app = test_app();

        let req = Request::builder()
            .uri("/admin/status?key=10.9.9.9&kind=address")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_status_validation() {
        let app = test_app();

        let req = Request::builder()
            .uri("/admin/status?kind=address")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let req = Request::builder()
            .uri("/admin/status?key=10.0.0.1&kind=ip")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_admin_reset_recovers_admission() {
        let app = test_app();

        for _ in 0..11 {
            app.clone()
                .oneshot(limited_request("192.168.1.101"))
                .await
                .unwrap();
        }
        let response = app
            .clone()
            .oneshot(limited_request("192.168.1.101"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let req = Request::builder()
            .uri("/admin/reset")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"key": "192.168.1.101", "kind": "address"}"#,
            ))
            .unwrap();
        let response = app.clone().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "success");

        let response = app
            .clone()
            .oneshot(limited_request("192.168.1.101"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
