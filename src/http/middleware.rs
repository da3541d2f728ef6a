//! Request gateway: the rate limiting middleware.
//!
//! Extracts the caller's identity from the request, invokes the decision
//! engine under a bounded deadline, annotates the response with budget
//! headers, and short-circuits denied requests with the fixed 429 body.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::AppState;
use crate::error::GatekeeperError;
use crate::ratelimit::{mask_credential, Decision};
use crate::storage::now_unix_ms;

/// Upper bound on one engine invocation.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

/// Credential headers, probed in order; the first non-empty value wins.
const CREDENTIAL_HEADERS: [&str; 3] = ["API_KEY", "X-Api-Token", "Api-Token"];

/// Fixed user-facing denial message. Contractual; must not be altered.
const DENY_MESSAGE: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";
const HEADER_KIND: &str = "x-ratelimit-type";
const HEADER_REQUEST_ID: &str = "x-request-id";
const HEADER_RETRY_AFTER: &str = "retry-after";

/// The gateway. Mounted on every rate limited route.
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request_id(request.headers());
    let address = client_address(request.headers(), peer);
    let credential = api_credential(request.headers());

    debug!(
        client = %address,
        credential = %mask_credential(&credential),
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id,
        "Rate limiter gateway invoked"
    );

    let checked = tokio::time::timeout(
        REQUEST_DEADLINE,
        state.limiter.check(&address, &credential),
    )
    .await;

    let decision = match checked {
        Ok(Ok(decision)) => decision,
        Ok(Err(e)) => {
            error!(
                client = %address,
                credential = %mask_credential(&credential),
                error = %e,
                request_id = %request_id,
                "Rate limit check failed"
            );
            return internal_error(&request_id);
        }
        Err(_) => {
            let e = GatekeeperError::Deadline;
            error!(
                client = %address,
                error = %e,
                request_id = %request_id,
                "Rate limit check deadline elapsed"
            );
            return internal_error(&request_id);
        }
    };

    if !decision.allowed {
        info!(
            client = %address,
            credential = %mask_credential(&credential),
            kind = %decision.kind,
            limit = decision.limit,
            blocked_until_ms = ?decision.blocked_until_ms,
            request_id = %request_id,
            "Request rate limited"
        );
        return deny_response(&decision, &request_id);
    }

    let mut response = next.run(request).await;
    annotate(response.headers_mut(), &decision, &request_id);
    response
}

/// Build the 429 response with budget headers, `Retry-After`, and the
/// contractual body.
fn deny_response(decision: &Decision, request_id: &str) -> Response {
    let mut details = serde_json::json!({
        "limit": decision.limit,
        "remaining": 0,
        "reset_time": decision.reset_at_ms / 1000,
        "limiter_type": decision.kind.as_str(),
    });
    if let Some(blocked_until_ms) = decision.blocked_until_ms {
        details["blocked_until"] = serde_json::json!(blocked_until_ms / 1000);
    }

    let body = serde_json::json!({
        "error": "rate_limit_exceeded",
        "message": DENY_MESSAGE,
        "details": details,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    annotate(response.headers_mut(), decision, request_id);

    if let Some(blocked_until_ms) = decision.blocked_until_ms {
        let remaining_ms = (blocked_until_ms - now_unix_ms()).max(0);
        let retry_after_secs = (remaining_ms + 999) / 1000;
        insert_header(
            response.headers_mut(),
            HEADER_RETRY_AFTER,
            &retry_after_secs.to_string(),
        );
    }

    response
}

/// A short, non-revealing 5xx body.
fn internal_error(request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": "internal_server_error",
        "message": "unable to process rate limit check",
    });
    let mut response = (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response();
    insert_header(response.headers_mut(), HEADER_REQUEST_ID, request_id);
    response
}

/// Set the budget headers and correlation id on any outcome.
fn annotate(headers: &mut HeaderMap, decision: &Decision, request_id: &str) {
    insert_header(headers, HEADER_LIMIT, &decision.limit.to_string());
    insert_header(headers, HEADER_REMAINING, &decision.remaining.to_string());
    insert_header(headers, HEADER_RESET, &(decision.reset_at_ms / 1000).to_string());
    insert_header(headers, HEADER_KIND, decision.kind.as_str());
    insert_header(headers, HEADER_REQUEST_ID, request_id);
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Echo the caller's correlation id, or mint one.
fn request_id(headers: &HeaderMap) -> String {
    match header_str(headers, "X-Request-ID") {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}

/// Resolve the caller's address: forwarded-for list first token, then the
/// real-IP header, then the transport peer without its port.
fn client_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(forwarded) = header_str(headers, "X-Forwarded-For") {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = header_str(headers, "X-Real-IP") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    peer.ip().to_string()
}

/// Probe the credential header aliases in order; no aggregation.
fn api_credential(headers: &HeaderMap) -> String {
    for name in CREDENTIAL_HEADERS {
        if let Some(value) = header_str(headers, name) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    String::new()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
