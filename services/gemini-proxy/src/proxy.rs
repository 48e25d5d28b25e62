//! HTTP proxy logic
//!
//! Authenticates the caller, validates the generate-content path and JSON
//! body, hands the request to the [`Coordinator`], and turns its outcome
//! into a response. Successful streams are piped through chunk by chunk;
//! every other outcome is a complete JSON body.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::Secret;
use tracing::{debug, instrument, warn};
use upstream::UpstreamBody;

use crate::coordinator::{Coordinator, FinalOutcome};
use crate::metrics;

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request identifier, stored in request extensions by [`assign_request_id`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().as_simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub coordinator: Coordinator,
    /// Key clients must present to use the proxy
    pub access_key: Arc<Secret<String>>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

/// Which upstream method a path targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `:generateContent`
    Buffered,
    /// `:streamGenerateContent`
    Stream,
}

impl Mode {
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Buffered => "buffered",
            Mode::Stream => "stream",
        }
    }
}

/// Parse `/{version}/models/{model}:{method}`.
///
/// Returns `None` unless the version is `v1` or `v1beta`, the model is a
/// single non-empty segment, and the method is one of the two
/// generate-content methods.
pub fn parse_model_path(path: &str) -> Option<Mode> {
    let rest = path.strip_prefix('/')?;
    let (version, rest) = rest.split_once('/')?;
    if version != "v1" && version != "v1beta" {
        return None;
    }
    let action = rest.strip_prefix("models/")?;
    let (model, method) = action.rsplit_once(':')?;
    if model.is_empty() || model.contains('/') {
        return None;
    }
    match method {
        "generateContent" => Some(Mode::Buffered),
        "streamGenerateContent" => Some(Mode::Stream),
        _ => None,
    }
}

/// Check `Authorization: Bearer <key>` or `x-goog-api-key: <key>` against the
/// configured access key.
pub fn is_authorized(headers: &HeaderMap, access_key: &Secret<String>) -> bool {
    let expected = access_key.expose().as_str();

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if bearer == Some(expected) {
        return true;
    }

    headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        == Some(expected)
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_json(error_type: &str, message: &str, request_id: &str) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    })
}

pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    json_response(
        status,
        Bytes::from(error_json(error_type, message, request_id).to_string()),
    )
}

fn json_response(status: StatusCode, body: Bytes) -> Response {
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

fn upstream_status(status: u16) -> StatusCode {
    StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Middleware that tags every request with a [`RequestId`] and echoes it in
/// the `x-request-id` response header.
pub async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::new();
    request.extensions_mut().insert(request_id.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Proxy one generate-content request.
///
/// Request metrics are recorded when the response head is ready; for a
/// stream that is before the body has been relayed.
#[instrument(skip_all, fields(request_id = %request_id, path = %request.uri().path()))]
pub async fn proxy_request(state: &ProxyState, request: Request, request_id: &str) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let (response, mode) = dispatch(state, request, request_id).await;

    let status = response.status().as_u16();
    if status >= 400 {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(status, mode, started.elapsed().as_secs_f64());
    response
}

async fn dispatch(
    state: &ProxyState,
    request: Request,
    request_id: &str,
) -> (Response, &'static str) {
    if !is_authorized(request.headers(), &state.access_key) {
        warn!("rejecting request without a valid proxy access key");
        return (
            error_response(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid proxy access key",
                request_id,
            ),
            "none",
        );
    }

    let path = request.uri().path().to_string();
    let Some(mode) = parse_model_path(&path) else {
        return (
            error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                &format!("unsupported path: {path}"),
                request_id,
            ),
            "none",
        );
    };

    let body_bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            return (
                error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("invalid request body: {e}"),
                    request_id,
                ),
                "none",
            );
        }
    };

    let body: serde_json::Value = match serde_json::from_slice(&body_bytes) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "request body is not valid JSON");
            return (
                error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_request",
                    &format!("request body must be valid JSON: {e}"),
                    request_id,
                ),
                "none",
            );
        }
    };

    let outcome = state
        .coordinator
        .handle(&path, &body, mode == Mode::Stream)
        .await;
    (into_response(outcome, request_id), mode.label())
}

/// Convert the coordinator's outcome into the client response.
pub fn into_response(outcome: FinalOutcome, request_id: &str) -> Response {
    match outcome {
        FinalOutcome::Success(response) => {
            let status = upstream_status(response.status);
            match response.body {
                UpstreamBody::Buffered(body) => json_response(status, body),
                UpstreamBody::Stream(stream) => (
                    status,
                    [
                        (header::CONTENT_TYPE, "text/event-stream"),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                    Body::from_stream(stream),
                )
                    .into_response(),
            }
        }
        FinalOutcome::Rejected(error) => json_response(upstream_status(error.status), error.body),
        FinalOutcome::Exhausted(exhausted) => json_response(
            upstream_status(exhausted.status()),
            exhausted.body(request_id),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::Exhausted;
    use upstream::{RetryableFailure, UpstreamError, UpstreamResponse};

    #[test]
    fn parses_generate_content_paths() {
        assert_eq!(
            parse_model_path("/v1beta/models/gemini-2.5-flash:generateContent"),
            Some(Mode::Buffered)
        );
        assert_eq!(
            parse_model_path("/v1/models/gemini-pro:streamGenerateContent"),
            Some(Mode::Stream)
        );
        assert_eq!(
            parse_model_path("/v1beta/models/gemini-1.5-pro-002:generateContent"),
            Some(Mode::Buffered)
        );
    }

    #[test]
    fn rejects_other_paths() {
        for path in [
            "/v2/models/gemini-pro:generateContent",
            "/v1/models/gemini-pro:countTokens",
            "/v1/models/gemini-pro",
            "/v1/models/:generateContent",
            "/v1/models/a/b:generateContent",
            "/v1/tunedModels/x:generateContent",
            "/health",
            "",
        ] {
            assert_eq!(parse_model_path(path), None, "path {path:?}");
        }
    }

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn authorization_accepts_bearer_or_goog_header() {
        let key = Secret::new("proxy-secret".to_string());
        assert!(is_authorized(
            &headers(&[("authorization", "Bearer proxy-secret")]),
            &key
        ));
        assert!(is_authorized(
            &headers(&[("x-goog-api-key", "proxy-secret")]),
            &key
        ));
        assert!(is_authorized(
            &headers(&[
                ("authorization", "Bearer wrong"),
                ("x-goog-api-key", "proxy-secret")
            ]),
            &key
        ));
    }

    #[test]
    fn authorization_rejects_missing_or_wrong_key() {
        let key = Secret::new("proxy-secret".to_string());
        assert!(!is_authorized(&HeaderMap::new(), &key));
        assert!(!is_authorized(
            &headers(&[("authorization", "Bearer nope")]),
            &key
        ));
        assert!(!is_authorized(
            &headers(&[("authorization", "proxy-secret")]),
            &key
        ));
        assert!(!is_authorized(&headers(&[("x-goog-api-key", "")]), &key));
    }

    #[tokio::test]
    async fn error_response_format() {
        let resp = error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing key",
            "req_abc123",
        );
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "unauthorized");
        assert_eq!(json["error"]["message"], "missing key");
        assert_eq!(json["error"]["request_id"], "req_abc123");
    }

    #[tokio::test]
    async fn rejected_outcome_passes_status_and_body_through() {
        let resp = into_response(
            FinalOutcome::Rejected(UpstreamError {
                status: 403,
                body: Bytes::from_static(br#"{"error":"bad request"}"#),
            }),
            "req_1",
        );
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(body, r#"{"error":"bad request"}"#);
    }

    #[tokio::test]
    async fn exhausted_outcome_uses_last_failure() {
        let resp = into_response(
            FinalOutcome::Exhausted(Exhausted {
                attempts: 2,
                last_failure: Some(RetryableFailure::Http(UpstreamError {
                    status: 429,
                    body: Bytes::from_static(b"{\"error\":\"quota\"}"),
                })),
            }),
            "req_1",
        );
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(body, "{\"error\":\"quota\"}");
    }

    #[test]
    fn buffered_success_is_json() {
        let resp = into_response(
            FinalOutcome::Success(UpstreamResponse {
                status: 200,
                content_type: None,
                body: UpstreamBody::Buffered(Bytes::from_static(b"{}")),
            }),
            "req_1",
        );
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = RequestId::new();
        let b = RequestId::new();
        assert!(a.as_str().starts_with("req_"));
        assert_eq!(a.as_str().len(), 4 + 32);
        assert_ne!(a.as_str(), b.as_str());
    }
}
