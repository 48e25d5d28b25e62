//! Forward-only handle over a streamed upstream body

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use tracing::{debug, warn};

/// Live upstream response body.
///
/// Finite and forward-only: it yields chunks as the upstream sends them and
/// ends when the upstream closes the connection or a read fails. It cannot be
/// restarted. Dropping it early (e.g. the caller disconnected) drops the
/// underlying response and releases the upstream connection.
pub struct ByteStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    chunks: u64,
    bytes: u64,
    finished: bool,
}

impl ByteStream {
    pub fn new<S, E>(inner: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            inner: inner.map_err(io::Error::other).boxed(),
            chunks: 0,
            bytes: 0,
            finished: false,
        }
    }
}

impl Stream for ByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.chunks += 1;
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                warn!(
                    chunks = this.chunks,
                    bytes = this.bytes,
                    error = %e,
                    "upstream stream failed mid-body"
                );
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                debug!(
                    chunks = this.chunks,
                    bytes = this.bytes,
                    "upstream stream completed"
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                chunks = self.chunks,
                bytes = self.bytes,
                "stream dropped before completion, releasing upstream connection"
            );
        }
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("chunks", &self.chunks)
            .field("bytes", &self.bytes)
            .field("finished", &self.finished)
            .finish()
    }
}
