//! HTTP proxy logic: translates an inbound axum request into a
//! `router::IncomingRequest`, drives it through the `RequestRouter`, and
//! translates the result back into an axum response.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use router::{IncomingRequest, ResponseBody, RouterError, RouterResponse};
use tracing::warn;

use crate::metrics;

/// Headers to strip before forwarding (hop-by-hop). Kept even though the
/// router builds its own headers for the upstream call, since a future
/// transformer may choose to carry caller headers through `prepare`.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Check if header is hop-by-hop.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Everything the proxy handler needs, shared across requests.
#[derive(Clone)]
pub struct ProxyState {
    pub router: Arc<router::RequestRouter>,
}

/// Proxy one inbound request: parse it into an `IncomingRequest`, hand it
/// to the router, and translate the outcome into an HTTP response.
pub async fn proxy_request(state: &ProxyState, path: &str, body: axum::body::Bytes, request_id: String) -> Response {
    let started = Instant::now();

    let incoming = match parse_request(path, &body) {
        Ok(req) => req,
        Err(e) => {
            warn!(request_id, error = %e, "rejecting malformed request");
            return bad_request(&e);
        }
    };

    let result = state.router.handle(incoming).await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(resp) => {
            metrics::record_request(resp.status, "POST", elapsed);
            router_response_to_http(resp)
        }
        Err(e) => {
            metrics::record_upstream_error(error_label(&e));
            error_to_http(e)
        }
    }
}

fn parse_request(path: &str, body: &[u8]) -> crate::error::Result<IncomingRequest> {
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| crate::error::Error::InvalidRequest(format!("invalid JSON body: {e}")))?;

    let model = json
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| crate::error::Error::InvalidRequest("request body missing \"model\"".to_string()))?
        .to_string();

    let family = if model.contains("claude") {
        account_auth::Family::Claude
    } else {
        account_auth::Family::Gemini
    };

    let session_id = json.get("sessionId").and_then(|v| v.as_str()).map(str::to_string);
    let streaming = path.contains("stream");

    Ok(IncomingRequest {
        family,
        model,
        body: json,
        session_id,
        streaming,
    })
}

fn router_response_to_http(resp: RouterResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
    match resp.body {
        ResponseBody::Json(value) => {
            let mut http = (status, axum::Json(value)).into_response();
            http.headers_mut()
                .insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            http
        }
        ResponseBody::Sse(text) => {
            let mut http = Response::new(Body::from(text));
            *http.status_mut() = status;
            http.headers_mut()
                .insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            http
        }
    }
}

fn error_to_http(err: RouterError) -> Response {
    let (status, body) = match &err {
        RouterError::NoAccounts | RouterError::AllRevoked => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "error": err.to_string() }),
        ),
        RouterError::RateLimitedBeyondCap => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({ "error": err.to_string() }),
        ),
        RouterError::SoftQuotaBlocked { reset_in_ms } => (
            StatusCode::TOO_MANY_REQUESTS,
            serde_json::json!({ "error": err.to_string(), "reset_in_ms": reset_in_ms }),
        ),
        RouterError::EmptyResponseAfterRetry { .. } => (
            StatusCode::BAD_GATEWAY,
            serde_json::json!({ "error": err.to_string() }),
        ),
        RouterError::Transform(_) | RouterError::Pool(_) | RouterError::Http(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": err.to_string() }),
        ),
    };
    (status, axum::Json(body)).into_response()
}

fn bad_request(e: &crate::error::Error) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

fn error_label(err: &RouterError) -> &'static str {
    match err {
        RouterError::NoAccounts => "no_accounts",
        RouterError::AllRevoked => "all_revoked",
        RouterError::RateLimitedBeyondCap => "rate_limited_beyond_cap",
        RouterError::SoftQuotaBlocked { .. } => "soft_quota_blocked",
        RouterError::EmptyResponseAfterRetry { .. } => "empty_response",
        RouterError::Transform(_) => "transform",
        RouterError::Pool(_) => "pool",
        RouterError::Http(_) => "http",
    }
}
