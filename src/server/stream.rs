//! Byte-stream helpers for the accept loop.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as _, Result, bail};
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use super::ingress::MAX_HEADER_BYTES;

/// Reads from `stream` until the request line is complete and returns its
/// request target, leaving everything read so far in `buffered`.
///
/// `None` means the peer closed the connection without sending anything,
/// which port scanners do constantly and is not worth logging as an error.
pub(crate) async fn read_request_target<S: AsyncRead + Unpin>(
    stream: &mut S,
    buffered: &mut BytesMut,
) -> Result<Option<String>> {
    loop {
        if let Some(line_end) = find_crlf(buffered) {
            let line = std::str::from_utf8(&buffered[..line_end])
                .context("request line is not valid UTF-8")?;
            let mut parts = line.split_whitespace();
            let _method = parts.next().context("missing method in request line")?;
            let target = parts.next().context("missing target in request line")?;
            return Ok(Some(target.to_string()));
        }
        if buffered.len() >= MAX_HEADER_BYTES {
            bail!("request line exceeds {MAX_HEADER_BYTES} bytes");
        }
        let read = stream
            .read_buf(buffered)
            .await
            .context("reading request line")?;
        if read == 0 {
            if buffered.is_empty() {
                return Ok(None);
            }
            bail!("connection closed mid request line");
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// An `AsyncRead`/`AsyncWrite` wrapper that replays already-sniffed bytes
/// before falling through to the inner stream.
///
/// Used to hand a connection to the HTTP framework after the accept loop has
/// consumed part of the request deciding where it should go.
pub(crate) struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub(crate) fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_read_request_target() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET /_health HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();

        let mut buffered = BytesMut::new();
        let target = read_request_target(&mut server, &mut buffered)
            .await
            .unwrap();
        assert_eq!(target.as_deref(), Some("/_health"));
        // Everything consumed so far stays available for replay.
        assert!(buffered.starts_with(b"GET /_health HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn test_read_request_target_empty_connection() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        let mut buffered = BytesMut::new();
        let target = read_request_target(&mut server, &mut buffered)
            .await
            .unwrap();
        assert!(target.is_none());
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays_prefix() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hello"), server);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }
}
