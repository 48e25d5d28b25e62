//! Per-request failover across the key pool
//!
//! One inbound request becomes at most N upstream attempts (N = pool size).
//! Each attempt takes the next active key. A retryable failure disables that
//! key and moves on; a terminal failure or a success ends the request at
//! once. Streams are classified on status before any byte reaches the
//! client, so a retry never follows partial output.

use std::sync::Arc;

use bytes::Bytes;
use key_pool::KeyPool;
use tracing::{debug, info, warn};
use upstream::{Outcome, RetryableFailure, Upstream, UpstreamError, UpstreamResponse};

use crate::metrics;
use crate::proxy::error_json;

/// Final result of one inbound request.
#[derive(Debug)]
pub enum FinalOutcome {
    Success(UpstreamResponse),
    /// Terminal upstream rejection, passed through verbatim.
    Rejected(UpstreamError),
    Exhausted(Exhausted),
}

/// No attempt succeeded: either no key was active, or every attempt failed
/// with a retryable error.
#[derive(Debug)]
pub struct Exhausted {
    pub attempts: usize,
    pub last_failure: Option<RetryableFailure>,
}

impl Exhausted {
    /// HTTP status returned to the client.
    pub fn status(&self) -> u16 {
        match &self.last_failure {
            Some(RetryableFailure::Http(e)) => e.status,
            Some(RetryableFailure::Transport { .. }) => 502,
            None => 503,
        }
    }

    /// Response body: the last upstream error body verbatim, or a synthesized
    /// error when there is none.
    pub fn body(&self, request_id: &str) -> Bytes {
        match &self.last_failure {
            Some(RetryableFailure::Http(e)) => e.body.clone(),
            Some(RetryableFailure::Transport { message, .. }) => Bytes::from(
                error_json(
                    "upstream_unreachable",
                    &format!(
                        "upstream request failed after {} attempt(s): {message}",
                        self.attempts
                    ),
                    request_id,
                )
                .to_string(),
            ),
            None => Bytes::from(
                error_json(
                    "pool_exhausted",
                    "no upstream API key is currently available",
                    request_id,
                )
                .to_string(),
            ),
        }
    }
}

/// Drives the retry loop. Cheap to clone.
#[derive(Clone)]
pub struct Coordinator {
    pool: Arc<KeyPool>,
    upstream: Arc<dyn Upstream>,
}

impl Coordinator {
    pub fn new(pool: Arc<KeyPool>, upstream: Arc<dyn Upstream>) -> Self {
        Self { pool, upstream }
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub async fn handle(
        &self,
        path: &str,
        body: &serde_json::Value,
        streaming: bool,
    ) -> FinalOutcome {
        let max_attempts = self.pool.size();
        let mut attempts = 0usize;
        let mut last_failure = None;

        while attempts < max_attempts {
            let Some(selected) = self.pool.next_active().await else {
                debug!(attempts, "no active key left for this request");
                break;
            };
            attempts += 1;

            let outcome = self
                .upstream
                .forward(selected.key.expose(), path, body, streaming)
                .await;
            metrics::record_attempt(outcome.label());

            match outcome {
                Outcome::Success(response) => {
                    info!(
                        key = %selected.label,
                        attempt = attempts,
                        status = response.status,
                        upstream = self.upstream.id(),
                        "upstream request succeeded"
                    );
                    return FinalOutcome::Success(response);
                }
                Outcome::Terminal(error) => {
                    info!(
                        key = %selected.label,
                        attempt = attempts,
                        status = error.status,
                        "upstream rejected request, not retrying"
                    );
                    return FinalOutcome::Rejected(error);
                }
                Outcome::Retryable(failure) => {
                    let error_type = failure.label();
                    match &failure {
                        RetryableFailure::Http(e) => warn!(
                            key = %selected.label,
                            attempt = attempts,
                            max_attempts,
                            status = e.status,
                            error_type,
                            "retryable upstream failure"
                        ),
                        RetryableFailure::Transport { message, .. } => warn!(
                            key = %selected.label,
                            attempt = attempts,
                            max_attempts,
                            error = %message,
                            error_type,
                            "upstream transport failure"
                        ),
                    }
                    metrics::record_upstream_error(error_type);
                    self.pool.disable(&selected).await;
                    last_failure = Some(failure);
                }
            }
        }

        let exhausted = Exhausted {
            attempts,
            last_failure,
        };
        warn!(
            attempts,
            status = exhausted.status(),
            "request exhausted all available keys"
        );
        FinalOutcome::Exhausted(exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use key_pool::CredentialState;
    use std::collections::HashMap;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use upstream::{ByteStream, TransportErrorKind, UpstreamBody};

    /// Canned reply for one key.
    #[derive(Clone)]
    enum Reply {
        Status(u16, &'static str),
        Transport,
        Stream(Vec<&'static str>),
    }

    /// In-memory upstream that answers from a fixed per-key script and
    /// records which keys were used.
    struct ScriptedUpstream {
        replies: HashMap<&'static str, Reply>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedUpstream {
        fn new(replies: &[(&'static str, Reply)]) -> Arc<Self> {
            Arc::new(Self {
                replies: replies.iter().cloned().collect(),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Upstream for ScriptedUpstream {
        fn id(&self) -> &str {
            "scripted"
        }

        fn forward<'a>(
            &'a self,
            api_key: &'a str,
            _path: &'a str,
            _body: &'a serde_json::Value,
            _streaming: bool,
        ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
            self.calls.lock().unwrap().push(api_key.to_string());
            let reply = self
                .replies
                .get(api_key)
                .cloned()
                .unwrap_or(Reply::Status(200, r#"{"ok":true}"#));

            Box::pin(async move {
                match reply {
                    Reply::Status(status, body) => {
                        let body = Bytes::from_static(body.as_bytes());
                        match upstream::classify_status(status) {
                            upstream::Classification::Success => {
                                Outcome::Success(UpstreamResponse {
                                    status,
                                    content_type: Some("application/json".into()),
                                    body: UpstreamBody::Buffered(body),
                                })
                            }
                            upstream::Classification::Terminal => {
                                Outcome::Terminal(UpstreamError { status, body })
                            }
                            upstream::Classification::Retryable => Outcome::Retryable(
                                RetryableFailure::Http(UpstreamError { status, body }),
                            ),
                        }
                    }
                    Reply::Transport => Outcome::Retryable(RetryableFailure::Transport {
                        kind: TransportErrorKind::Connect,
                        message: "connection refused".into(),
                    }),
                    Reply::Stream(chunks) => {
                        let items = chunks
                            .into_iter()
                            .map(|c| Ok::<_, std::io::Error>(Bytes::from_static(c.as_bytes())));
                        Outcome::Success(UpstreamResponse {
                            status: 200,
                            content_type: Some("text/event-stream".into()),
                            body: UpstreamBody::Stream(ByteStream::new(
                                futures_util::stream::iter(items),
                            )),
                        })
                    }
                }
            })
        }
    }

    fn coordinator(keys: &[&str], upstream: Arc<ScriptedUpstream>) -> Coordinator {
        let pool = KeyPool::new(keys.iter().map(|k| k.to_string()).collect()).unwrap();
        Coordinator::new(Arc::new(pool), upstream)
    }

    fn body() -> serde_json::Value {
        serde_json::json!({"contents": [{"parts": [{"text": "hi"}]}]})
    }

    const PATH: &str = "/v1beta/models/gemini-2.5-flash:generateContent";

    fn buffered(outcome: FinalOutcome) -> (u16, Bytes) {
        match outcome {
            FinalOutcome::Success(UpstreamResponse {
                status,
                body: UpstreamBody::Buffered(body),
                ..
            }) => (status, body),
            other => panic!("expected buffered success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rate_limited_key_fails_over_to_next() {
        let upstream = ScriptedUpstream::new(&[
            ("key-aaaa", Reply::Status(429, r#"{"error":"quota"}"#)),
            ("key-bbbb", Reply::Status(200, r#"{"ok":true}"#)),
        ]);
        let c = coordinator(&["key-aaaa", "key-bbbb"], upstream.clone());

        let (status, body) = buffered(c.handle(PATH, &body(), false).await);
        assert_eq!(status, 200);
        assert_eq!(body, r#"{"ok":true}"#);
        assert_eq!(upstream.calls(), vec!["key-aaaa", "key-bbbb"]);

        let states = c.pool().states().await;
        assert!(matches!(states[0], CredentialState::Disabled { .. }));
        assert_eq!(states[1], CredentialState::Active);
    }

    #[tokio::test]
    async fn terminal_failure_is_returned_verbatim_and_not_retried() {
        let upstream = ScriptedUpstream::new(&[(
            "key-aaaa",
            Reply::Status(403, r#"{"error":"bad request"}"#),
        )]);
        let c = coordinator(&["key-aaaa", "key-bbbb"], upstream.clone());

        match c.handle(PATH, &body(), false).await {
            FinalOutcome::Rejected(e) => {
                assert_eq!(e.status, 403);
                assert_eq!(e.body, r#"{"error":"bad request"}"#);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(upstream.calls(), vec!["key-aaaa"], "terminal must not retry");
        assert_eq!(c.pool().active_count().await, 2, "terminal is not a key failure");
    }

    #[tokio::test]
    async fn all_server_errors_exhaust_with_last_body() {
        let upstream = ScriptedUpstream::new(&[
            ("key-aaaa", Reply::Status(500, r#"{"error":"first"}"#)),
            ("key-bbbb", Reply::Status(500, r#"{"error":"second"}"#)),
        ]);
        let c = coordinator(&["key-aaaa", "key-bbbb"], upstream.clone());

        match c.handle(PATH, &body(), false).await {
            FinalOutcome::Exhausted(e) => {
                assert_eq!(e.attempts, 2);
                assert_eq!(e.status(), 500);
                assert_eq!(e.body("req_test"), r#"{"error":"second"}"#);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(c.pool().active_count().await, 0);
    }

    #[tokio::test]
    async fn attempts_are_bounded_by_pool_size() {
        let upstream = ScriptedUpstream::new(&[
            ("key-aaaa", Reply::Status(503, "{}")),
            ("key-bbbb", Reply::Transport),
            ("key-cccc", Reply::Status(429, "{}")),
        ]);
        let c = coordinator(&["key-aaaa", "key-bbbb", "key-cccc"], upstream.clone());

        let outcome = c.handle(PATH, &body(), false).await;
        assert!(matches!(outcome, FinalOutcome::Exhausted(Exhausted { attempts: 3, .. })));
        assert_eq!(upstream.calls().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_pool_returns_503_without_calling_upstream() {
        let upstream = ScriptedUpstream::new(&[("key-aaaa", Reply::Status(429, "{}"))]);
        let c = coordinator(&["key-aaaa"], upstream.clone());

        // First request disables the only key.
        let _ = c.handle(PATH, &body(), false).await;
        assert_eq!(upstream.calls().len(), 1);

        match c.handle(PATH, &body(), false).await {
            FinalOutcome::Exhausted(e) => {
                assert_eq!(e.attempts, 0);
                assert!(e.last_failure.is_none());
                assert_eq!(e.status(), 503);
                let json: serde_json::Value =
                    serde_json::from_slice(&e.body("req_abc")).unwrap();
                assert_eq!(json["error"]["type"], "pool_exhausted");
                assert_eq!(json["error"]["request_id"], "req_abc");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(upstream.calls().len(), 1, "no attempt without an active key");
    }

    #[tokio::test]
    async fn transport_exhaustion_maps_to_502() {
        let upstream = ScriptedUpstream::new(&[("key-aaaa", Reply::Transport)]);
        let c = coordinator(&["key-aaaa"], upstream);

        match c.handle(PATH, &body(), false).await {
            FinalOutcome::Exhausted(e) => {
                assert_eq!(e.status(), 502);
                let json: serde_json::Value = serde_json::from_slice(&e.body("req_x")).unwrap();
                assert_eq!(json["error"]["type"], "upstream_unreachable");
                assert!(
                    json["error"]["message"]
                        .as_str()
                        .unwrap()
                        .contains("connection refused")
                );
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successive_requests_rotate_keys() {
        let upstream = ScriptedUpstream::new(&[]);
        let c = coordinator(&["key-aaaa", "key-bbbb", "key-cccc"], upstream.clone());

        for _ in 0..4 {
            buffered(c.handle(PATH, &body(), false).await);
        }
        assert_eq!(
            upstream.calls(),
            vec!["key-aaaa", "key-bbbb", "key-cccc", "key-aaaa"]
        );
    }

    #[tokio::test]
    async fn retry_continues_from_cursor_and_skips_disabled() {
        let upstream = ScriptedUpstream::new(&[("key-bbbb", Reply::Status(500, "{}"))]);
        let c = coordinator(&["key-aaaa", "key-bbbb", "key-cccc"], upstream.clone());

        buffered(c.handle(PATH, &body(), false).await); // a
        buffered(c.handle(PATH, &body(), false).await); // b fails, c succeeds
        buffered(c.handle(PATH, &body(), false).await); // a
        buffered(c.handle(PATH, &body(), false).await); // b skipped, c

        assert_eq!(
            upstream.calls(),
            vec!["key-aaaa", "key-bbbb", "key-cccc", "key-aaaa", "key-cccc"]
        );
    }

    #[tokio::test]
    async fn streaming_success_passes_stream_through() {
        let upstream = ScriptedUpstream::new(&[
            ("key-aaaa", Reply::Status(429, "{}")),
            ("key-bbbb", Reply::Stream(vec!["data: 1\n\n", "data: 2\n\n"])),
        ]);
        let c = coordinator(&["key-aaaa", "key-bbbb"], upstream);

        match c.handle(PATH, &body(), true).await {
            FinalOutcome::Success(UpstreamResponse {
                status: 200,
                body: UpstreamBody::Stream(stream),
                ..
            }) => {
                let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;
                assert_eq!(chunks, vec!["data: 1\n\n", "data: 2\n\n"]);
            }
            other => panic!("expected streaming success, got {other:?}"),
        }
    }
}
