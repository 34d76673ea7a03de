//! Stream adapter replaying bytes read past the transport preamble.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Yields `leftover` before reading from the wrapped stream. Writes go
/// straight through.
#[derive(Debug)]
pub(crate) struct RewindStream<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> RewindStream<S> {
    pub(crate) fn new(leftover: impl Into<Bytes>, inner: S) -> Self {
        Self {
            leftover: leftover.into(),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.has_remaining() {
            let n = self.leftover.remaining().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    #[tokio::test]
    async fn leftover_is_read_before_inner_stream() {
        let (mut remote, local) = duplex(64);
        remote.write_all(&[4, 5]).await.expect("write");
        drop(remote);

        let mut stream = RewindStream::new(vec![1_u8, 2, 3], local);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.expect("read");

        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn small_buffers_drain_leftover_in_pieces() {
        let mut stream = RewindStream::new(vec![1_u8, 2, 3], tokio::io::empty());
        let mut chunk = [0_u8; 2];

        assert_eq!(stream.read(&mut chunk).await.expect("first"), 2);
        assert_eq!(chunk, [1, 2]);
        assert_eq!(stream.read(&mut chunk).await.expect("second"), 1);
        assert_eq!(stream.read(&mut chunk).await.expect("eof"), 0);
    }
}
