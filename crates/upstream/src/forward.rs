//! reqwest-backed forwarder for the Gemini generative-content API
//!
//! Each call is a single POST to `{base_url}{path}?key={api_key}`, with
//! `&alt=sse` added for streaming. Query parameters from the inbound request
//! are never forwarded. Streaming responses are classified on status and
//! headers alone; only 2xx bodies are handed to the caller as a live stream,
//! error bodies are drained and buffered here.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, instrument};

use crate::stream::ByteStream;
use crate::{
    Classification, Outcome, RetryableFailure, TransportErrorKind, Upstream, UpstreamBody,
    UpstreamError, UpstreamResponse, classify_status,
};

/// Default per-request timeout. Generation calls can be slow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Forwards requests to a fixed upstream base URL.
///
/// For buffered requests `timeout` bounds the whole exchange. For streaming
/// requests it bounds only the wait for response headers; a long-running
/// event stream is never cut off by it.
pub struct HttpForwarder {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, base_url, timeout))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Upstream URL for an inbound path (without query parameters).
    pub fn target_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Perform one attempt and classify the result.
    #[instrument(skip_all, fields(path = %path, streaming))]
    pub async fn send(
        &self,
        api_key: &str,
        path: &str,
        body: &serde_json::Value,
        streaming: bool,
    ) -> Outcome {
        let mut query = vec![("key", api_key)];
        if streaming {
            query.push(("alt", "sse"));
        }

        let request = self
            .client
            .post(self.target_url(path))
            .query(&query)
            .json(body);

        let sent = if streaming {
            match tokio::time::timeout(self.timeout, request.send()).await {
                Ok(result) => result,
                Err(_) => {
                    return Outcome::Retryable(RetryableFailure::Transport {
                        kind: TransportErrorKind::Timeout,
                        message: format!(
                            "no response headers within {}s",
                            self.timeout.as_secs()
                        ),
                    });
                }
            }
        } else {
            request.timeout(self.timeout).send().await
        };

        let response = match sent {
            Ok(r) => r,
            Err(e) => return Outcome::Retryable(transport_failure(e)),
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let classification = classify_status(status);
        debug!(status, ?classification, "upstream responded");

        if streaming && classification == Classification::Success {
            return Outcome::Success(UpstreamResponse {
                status,
                content_type,
                body: UpstreamBody::Stream(ByteStream::new(response.bytes_stream())),
            });
        }

        // Buffered requests are already bounded by the reqwest timeout.
        let drained = if streaming {
            match tokio::time::timeout(self.timeout, response.bytes()).await {
                Ok(result) => result,
                Err(_) => {
                    return Outcome::Retryable(RetryableFailure::Transport {
                        kind: TransportErrorKind::Timeout,
                        message: format!(
                            "error body from status {status} not received within {}s",
                            self.timeout.as_secs()
                        ),
                    });
                }
            }
        } else {
            response.bytes().await
        };
        let body: Bytes = match drained {
            Ok(b) => b,
            Err(e) => return Outcome::Retryable(transport_failure(e)),
        };

        match classification {
            Classification::Success => Outcome::Success(UpstreamResponse {
                status,
                content_type,
                body: UpstreamBody::Buffered(body),
            }),
            Classification::Terminal => Outcome::Terminal(UpstreamError { status, body }),
            Classification::Retryable => {
                Outcome::Retryable(RetryableFailure::Http(UpstreamError { status, body }))
            }
        }
    }
}

impl Upstream for HttpForwarder {
    fn id(&self) -> &str {
        "gemini"
    }

    fn forward<'a>(
        &'a self,
        api_key: &'a str,
        path: &'a str,
        body: &'a serde_json::Value,
        streaming: bool,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>> {
        Box::pin(self.send(api_key, path, body, streaming))
    }
}

/// Classify a reqwest error. The URL is stripped first: it carries the key.
fn transport_failure(error: reqwest::Error) -> RetryableFailure {
    let error = error.without_url();
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        TransportErrorKind::Connect
    } else if error.is_body() || error.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    };
    RetryableFailure::Transport {
        kind,
        message: error.to_string(),
    }
}
