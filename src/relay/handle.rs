use axum::http::HeaderValue;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use futures_util::stream;
use pin_project::pin_project;
use std::{
    fmt::{Debug, Formatter},
    num::NonZeroUsize,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Error injected into a streamed response body when the peer that was
/// feeding it went away before end-of-stream. Surfacing it through the body
/// makes the transport abort the connection instead of terminating the
/// transfer cleanly, so the receiving client observes the truncation.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("sender aborted before end of stream")]
    SenderAborted,
}

/// A single frame of relayed data.
pub type Frame = Result<Bytes, RelayError>;

/// Metadata captured from a sender request before its body is consumed.
#[derive(Debug, Clone)]
pub struct SenderMeta {
    /// Number of receivers the sender expects (`?n=`, default 1).
    pub capacity: NonZeroUsize,
    /// Verbatim `Content-Length` header, replayed onto every receiver.
    pub content_length: Option<HeaderValue>,
    /// Verbatim `Content-Type` header, replayed onto every receiver.
    pub content_type: Option<HeaderValue>,
}

/// Byte stream read from a sender's request body.
pub struct ByteStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send + 'static>>,
}

impl ByteStream {
    pub fn wrap<S: Stream<Item = Result<Bytes, axum::Error>> + Send + 'static>(value: S) -> Self {
        Self {
            inner: Box::pin(value),
        }
    }

    /// There is only one reason for this to exist: tests that feed a body
    /// from a plain list of chunks.
    pub fn from_iter<I>(input: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self {
            inner: Box::pin(stream::iter(input.into_iter()).map(Ok)),
        }
    }
}

impl From<axum::body::Body> for ByteStream {
    fn from(value: axum::body::Body) -> Self {
        Self::wrap(value.into_data_stream())
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = Pin::get_mut(self);
        this.inner.poll_next_unpin(cx)
    }
}

impl Debug for ByteStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteStream")
    }
}

/// Writer for the human-readable progress lines streamed back to a sender.
///
/// The sender's response stays open for the whole transfer; notices are
/// appended as they happen. A send to a sender that already hung up simply
/// goes nowhere.
#[derive(Clone)]
pub(crate) struct NoticeWriter(mpsc::Sender<Frame>);

impl NoticeWriter {
    /// Notice channel capacity. Admission pushes at most two lines before the
    /// client starts reading, so a small buffer keeps `notify` non-blocking
    /// at registration time.
    const BUFFER: usize = 8;

    pub fn channel() -> (Self, ReceiverStream<Frame>) {
        let (tx, rx) = mpsc::channel(Self::BUFFER);
        (Self(tx), ReceiverStream::new(rx))
    }

    /// Queues a notice line without waiting. Used under the slot lock.
    pub fn notify(&self, line: &str) {
        let _ = self.0.try_send(Ok(Bytes::from(format!("[INFO] {line}\n"))));
    }

    /// Writes a notice line, waiting for the sender to drain its response if
    /// the buffer is full.
    pub async fn write(&self, line: &str) {
        let _ = self
            .0
            .send(Ok(Bytes::from(format!("[INFO] {line}\n"))))
            .await;
    }
}

impl Debug for NoticeWriter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoticeWriter")
    }
}

/// Response body stream that owns a cancellation guard.
///
/// The transport drops the body when the client disconnects, which drops the
/// guard, which unregisters the request from its slot if it is still
/// pending.
#[pin_project]
pub(crate) struct GuardedStream<S, G> {
    #[pin]
    inner: S,
    _guard: G,
}

impl<S, G> GuardedStream<S, G> {
    pub fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<S: Stream, G> Stream for GuardedStream<S, G> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn byte_stream_from_iter() {
        let stream = ByteStream::from_iter([Bytes::from("ab"), Bytes::from("cd")]);
        let chunks: Vec<_> = stream.map(Result::unwrap).collect().await;
        assert_eq!(chunks, vec![Bytes::from("ab"), Bytes::from("cd")]);
    }

    #[tokio::test]
    async fn notice_lines_are_prefixed_and_terminated() {
        let (writer, rx) = NoticeWriter::channel();
        writer.notify("Waiting for 1 receiver(s)...");
        writer.write("Sent.").await;
        drop(writer);

        let lines: Vec<_> = rx.map(Result::unwrap).collect().await;
        assert_eq!(
            lines,
            vec![
                Bytes::from("[INFO] Waiting for 1 receiver(s)...\n"),
                Bytes::from("[INFO] Sent.\n"),
            ]
        );
    }

    #[test]
    fn guard_dropped_with_stream() {
        struct Flag(std::sync::Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::Release);
            }
        }

        let dropped = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stream = GuardedStream::new(
            futures_util::stream::iter([1, 2, 3]),
            Flag(std::sync::Arc::clone(&dropped)),
        );
        drop(stream);
        assert!(dropped.load(std::sync::atomic::Ordering::Acquire));
    }
}
