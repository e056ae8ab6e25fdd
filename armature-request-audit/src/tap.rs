//! Response body tap
//!
//! [`BodyTap`] swaps a response's output channel for an in-memory
//! [`ResponseBuffer`] while the downstream handler runs, then puts the real
//! channel back and replays the buffered bytes into it. The client receives
//! exactly what the handler wrote; the middleware keeps a copy.

use crate::HttpResponse;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Shared in-memory output channel.
///
/// Clones write into the same buffer, so one clone can be handed to a
/// response while another is kept to read the bytes back.
#[derive(Debug, Clone, Default)]
pub struct ResponseBuffer {
    inner: Arc<Mutex<BytesMut>>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn contents(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock())
    }

    /// Take everything written so far, leaving the buffer empty
    pub fn take(&self) -> Bytes {
        self.inner.lock().split().freeze()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl AsyncWrite for ResponseBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Captures the response body of one request.
///
/// Created with [`BodyTap::attach`] before the handler runs and consumed by
/// [`BodyTap::detach`] once it has finished.
pub struct BodyTap {
    buffer: ResponseBuffer,
    original: crate::ResponseWriter,
}

impl BodyTap {
    /// Redirect `response` into a fresh buffer, holding on to its real channel
    pub fn attach(response: &mut HttpResponse) -> Self {
        let buffer = ResponseBuffer::new();
        let original = std::mem::replace(&mut response.body, Box::new(buffer.clone()));
        Self { buffer, original }
    }

    /// Bytes the handler has written so far
    pub fn captured(&self) -> Bytes {
        self.buffer.contents()
    }

    /// Restore the real channel and replay the captured bytes into it.
    ///
    /// Returns the captured bytes. The real channel is restored even when the
    /// replay fails.
    pub async fn detach(self, response: &mut HttpResponse) -> (Bytes, io::Result<()>) {
        response.body = self.original;
        let captured = self.buffer.take();

        let replay = async {
            response.body.write_all(&captured).await?;
            response.body.flush().await
        };
        let result = replay.await;

        (captured, result)
    }
}

impl std::fmt::Debug for BodyTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyTap")
            .field("captured", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_buffer_clones_share_bytes() {
        let buffer = ResponseBuffer::new();
        let mut writer = buffer.clone();

        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();

        assert_eq!(buffer.contents(), Bytes::from_static(b"hello world"));
        assert_eq!(buffer.take(), Bytes::from_static(b"hello world"));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_tap_captures_and_replays() {
        let client = ResponseBuffer::new();
        let mut response = HttpResponse::new(Box::new(client.clone()));

        let tap = BodyTap::attach(&mut response);
        response.write(b"{\"id\":").await.unwrap();
        response.write(b"42}").await.unwrap();

        // nothing reaches the client until the tap is detached
        assert!(client.is_empty());
        assert_eq!(tap.captured(), Bytes::from_static(b"{\"id\":42}"));

        let (captured, result) = tap.detach(&mut response).await;
        assert!(result.is_ok());
        assert_eq!(captured, Bytes::from_static(b"{\"id\":42}"));
        assert_eq!(client.contents(), captured);

        // later writes go straight to the client
        response.write(b"\n").await.unwrap();
        assert_eq!(client.contents(), Bytes::from_static(b"{\"id\":42}\n"));
    }

    #[tokio::test]
    async fn test_replay_failure_is_reported() {
        let mut response = HttpResponse::new(Box::new(BrokenPipe));

        let tap = BodyTap::attach(&mut response);
        response.write(b"partial").await.unwrap();

        let (captured, result) = tap.detach(&mut response).await;
        assert_eq!(captured, Bytes::from_static(b"partial"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }
}
