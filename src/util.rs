use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

/// An `AsyncRead` wrapper that accumulates a bounded prefix for parsing.
///
/// The request parser fills the buffer until a complete header section is
/// visible, consumes it with [`advance`](Self::advance), and then reads the
/// rest of the stream (buffered remainder first) through `AsyncRead`.
pub(crate) struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Unconsumed buffered bytes.
    pub(crate) fn chunk(&self) -> &[u8] {
        &self.buf
    }

    /// True once the buffer holds `limit` bytes.
    pub(crate) fn at_limit(&self) -> bool {
        self.buf.len() >= self.limit
    }

    /// Consumes `n` buffered bytes.
    pub(crate) fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Reads more bytes into the buffer, staying under the limit.
    ///
    /// Returns 0 at EOF or once the limit is reached.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.buf.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner).take(room as u64).read_buf(&mut self.buf).await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.buf.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.buf.len().min(out.remaining());
        out.put_slice(&self.buf[..n]);
        self.buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn fill_stops_at_limit() {
        let mut reader = Prebuffered::new(Cursor::new(b"hello world"), 5);
        assert_eq!(reader.fill().await.unwrap(), 5);
        assert_eq!(reader.chunk(), b"hello");
        assert!(reader.at_limit());
        assert_eq!(reader.fill().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fill_returns_zero_at_eof() {
        let mut reader = Prebuffered::new(Cursor::new(b""), 16);
        assert_eq!(reader.fill().await.unwrap(), 0);
        assert!(!reader.at_limit());
    }

    #[tokio::test]
    async fn reads_buffered_bytes_before_inner() {
        let mut reader = Prebuffered::new(Cursor::new(b"abcdef"), 4);
        reader.fill().await.unwrap();
        reader.advance(2);
        assert_eq!(reader.chunk(), b"cd");

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdef");
        assert!(reader.chunk().is_empty());
    }

    #[tokio::test]
    async fn fill_resumes_after_advance() {
        let mut reader = Prebuffered::new(Cursor::new(b"abcdefgh"), 4);
        reader.fill().await.unwrap();
        assert_eq!(reader.chunk(), b"abcd");
        reader.advance(3);
        reader.fill().await.unwrap();
        assert_eq!(reader.chunk(), b"defg");
    }
}
