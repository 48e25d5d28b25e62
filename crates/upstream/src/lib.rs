//! Forwarding of content-generation requests to the upstream API
//!
//! Defines the `Upstream` trait that decouples the retry loop from the HTTP
//! client. `HttpForwarder` is the reqwest implementation; tests substitute
//! scripted implementations. A forwarder performs exactly one attempt with one
//! key and classifies the result. It never touches the key pool: deciding
//! whether to disable a key and retry is the caller's job.

pub mod forward;
pub mod stream;

pub use forward::{DEFAULT_TIMEOUT, HttpForwarder};
pub use stream::ByteStream;

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// How an upstream HTTP status affects the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx
    Success,
    /// The request itself was rejected; another key would get the same answer.
    Terminal,
    /// 429 or 5xx; another key may succeed.
    Retryable,
}

/// Classify an upstream HTTP status code.
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        429 | 500..=599 => Classification::Retryable,
        _ => Classification::Terminal,
    }
}

/// A non-2xx upstream response, fully buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub status: u16,
    pub body: Bytes,
}

/// Kind of transport-level failure, used for log and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Body,
    Other,
}

impl TransportErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Body => "body",
            TransportErrorKind::Other => "other",
        }
    }
}

/// A failure for which trying a different key is expected to help.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryableFailure {
    /// Upstream answered 429 or 5xx.
    Http(UpstreamError),
    /// No HTTP response at all (connect, TLS, DNS, timeout, broken body).
    /// `message` never contains the request URL and therefore never the key.
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
}

impl RetryableFailure {
    /// Label for logs and the `error_type` metric.
    pub fn label(&self) -> &'static str {
        match self {
            RetryableFailure::Http(e) if e.status == 429 => "rate_limited",
            RetryableFailure::Http(_) => "server_error",
            RetryableFailure::Transport { kind, .. } => kind.label(),
        }
    }
}

/// Successful response body.
pub enum UpstreamBody {
    /// Complete body of a non-streaming request.
    Buffered(Bytes),
    /// Live event stream, drained incrementally by the caller.
    Stream(ByteStream),
}

impl fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamBody::Buffered(bytes) => {
                f.debug_tuple("Buffered").field(&bytes.len()).finish()
            }
            UpstreamBody::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// A 2xx upstream response.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: UpstreamBody,
}

/// Classified result of one forwarding attempt.
#[derive(Debug)]
pub enum Outcome {
    Success(UpstreamResponse),
    Terminal(UpstreamError),
    Retryable(RetryableFailure),
}

impl Outcome {
    /// Short label for logging and the attempts metric.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Terminal(_) => "terminal",
            Outcome::Retryable(_) => "retryable",
        }
    }
}

/// One attempt against the upstream API with a given key.
///
/// `path` is the inbound request path, passed through unchanged.
/// `streaming` selects server-sent-event framing.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Identifier for logging (e.g. "gemini")
    fn id(&self) -> &str;

    fn forward<'a>(
        &'a self,
        api_key: &'a str,
        path: &'a str,
        body: &'a serde_json::Value,
        streaming: bool,
    ) -> Pin<Box<dyn Future<Output = Outcome> + Send + 'a>>;
}
