//! Byte-accounted transport wrapper
//!
//! The SSH engine reads the server transport through a [`MeteredStream`].
//! Bytes are staged in an internal buffer on their way through, so the
//! meter can answer the handoff question exactly: how many wire bytes were
//! pulled off the transport, and how many of those the engine has not
//! consumed yet. `next_transport_byte = bytes_read - buffered`.
//!
//! Halting the meter freezes the snapshot, turns further reads into EOF
//! and silently discards further writes, so no byte crosses the transport
//! after the handoff message. Counter updates and the halt snapshot take
//! the same lock; the reported offset cannot race a concurrent read.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest single read pulled from the inner transport
const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Default)]
struct MeterState {
    bytes_read: u64,
    buffered: u64,
    halted: bool,
    snapshot: u64,
}

/// Shared view of a [`MeteredStream`]'s counters
#[derive(Debug, Default)]
pub struct Meter {
    state: Mutex<MeterState>,
}

impl Meter {
    /// Total wire bytes read from the server transport
    pub fn bytes_read(&self) -> u64 {
        self.state.lock().expect("meter lock poisoned").bytes_read
    }

    /// Bytes read from the transport but not yet consumed by the engine
    pub fn buffered(&self) -> u64 {
        self.state.lock().expect("meter lock poisoned").buffered
    }

    /// Stop the stream and capture the handoff offset.
    ///
    /// Idempotent; later calls return the original snapshot.
    pub fn halt(&self) -> u64 {
        let mut state = self.state.lock().expect("meter lock poisoned");
        if !state.halted {
            state.halted = true;
            state.snapshot = state.bytes_read - state.buffered;
        }
        state.snapshot
    }

    /// Whether the stream has been halted
    pub fn is_halted(&self) -> bool {
        self.state.lock().expect("meter lock poisoned").halted
    }
}

/// Transport wrapper that stages and counts every byte
pub struct MeteredStream<S> {
    inner: S,
    staging: BytesMut,
    meter: Arc<Meter>,
}

impl<S> MeteredStream<S> {
    /// Wrap a transport
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            staging: BytesMut::new(),
            meter: Arc::new(Meter::default()),
        }
    }

    /// Shared handle to the counters
    pub fn meter(&self) -> Arc<Meter> {
        Arc::clone(&self.meter)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut state = this.meter.state.lock().expect("meter lock poisoned");
        if state.halted {
            // EOF: the stub owns the transport from here on
            return Poll::Ready(Ok(()));
        }

        if this.staging.is_empty() {
            let mut chunk = [0u8; READ_CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = chunk_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    this.staging.extend_from_slice(filled);
                    state.bytes_read += filled.len() as u64;
                    state.buffered += filled.len() as u64;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        let n = this.staging.len().min(buf.remaining());
        buf.put_slice(&this.staging.split_to(n));
        state.buffered -= n as u64;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.meter.is_halted() {
            // Discard: nothing may reach the transport after handoff
            return Poll::Ready(Ok(buf.len()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.meter.is_halted() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.meter.is_halted() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// The handoff equation holds for any split between consumed and
    /// buffered bytes, regardless of read chunking.
    #[tokio::test]
    async fn test_offset_equation_across_splits() {
        let wire: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        for consumed_target in [0usize, 1, 7, 42, 250, 999, 1000] {
            for chunk in [1usize, 3, 16, 64, 1000] {
                let mut stream = MeteredStream::new(Cursor::new(wire.clone()));
                let meter = stream.meter();

                let mut consumed = 0usize;
                let mut buf = vec![0u8; chunk];
                while consumed < consumed_target {
                    let want = chunk.min(consumed_target - consumed);
                    let n = stream.read(&mut buf[..want]).await.unwrap();
                    assert!(n > 0);
                    assert_eq!(&buf[..n], &wire[consumed..consumed + n]);
                    consumed += n;
                }

                let next = meter.halt();
                assert_eq!(next, consumed as u64);
                assert_eq!(meter.bytes_read() - meter.buffered(), next);
            }
        }
    }

    #[tokio::test]
    async fn test_halt_is_idempotent() {
        let mut stream = MeteredStream::new(Cursor::new(vec![0u8; 100]));
        let meter = stream.meter();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();

        let first = meter.halt();
        let mut more = [0u8; 10];
        // Halted stream reads as EOF
        assert_eq!(stream.read(&mut more).await.unwrap(), 0);
        assert_eq!(meter.halt(), first);
    }

    #[tokio::test]
    async fn test_halted_writes_are_discarded() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = MeteredStream::new(client);
        let meter = stream.meter();

        stream.write_all(b"before").await.unwrap();
        meter.halt();
        stream.write_all(b"after").await.unwrap();
        stream.shutdown().await.unwrap();
        drop(stream);

        let mut seen = Vec::new();
        server.read_to_end(&mut seen).await.unwrap();
        assert_eq!(seen, b"before");
    }

    #[tokio::test]
    async fn test_counts_track_partial_consumption() {
        let mut stream = MeteredStream::new(Cursor::new(vec![7u8; 64]));
        let meter = stream.meter();

        let mut buf = [0u8; 10];
        stream.read_exact(&mut buf).await.unwrap();

        // The first poll stages the whole cursor
        assert_eq!(meter.bytes_read(), 64);
        assert_eq!(meter.buffered(), 54);
        assert_eq!(meter.halt(), 10);
    }
}
