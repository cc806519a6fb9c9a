//! A single multiplexed stream

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use kw_protocol::mux::INITIAL_WINDOW;
use kw_protocol::{MuxFrame, MuxFrameKind};

use super::{SendWindow, Shared, DATA_CHUNK};

/// Replenish the peer's window once this many bytes were consumed
const GRANT_THRESHOLD: u32 = INITIAL_WINDOW / 2;

/// One ordered byte stream inside a multiplexed session.
///
/// Reads drain the demux task's buffer and grant window credit back to the
/// peer; writes consume send-window credit before queueing a frame, so the
/// shared writer queue stays bounded by the windows. Dropping the stream
/// half-closes it.
pub struct MuxStream {
    id: u32,
    recv: mpsc::UnboundedReceiver<Bytes>,
    /// Partially consumed incoming chunk
    current: Bytes,
    /// Bytes consumed since the last window grant
    consumed: u32,
    frame_tx: mpsc::UnboundedSender<MuxFrame>,
    send_window: Arc<SendWindow>,
    shared: Arc<Shared>,
    write_closed: bool,
}

impl MuxStream {
    pub(super) fn new(
        id: u32,
        recv: mpsc::UnboundedReceiver<Bytes>,
        frame_tx: mpsc::UnboundedSender<MuxFrame>,
        send_window: Arc<SendWindow>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            recv,
            current: Bytes::new(),
            consumed: 0,
            frame_tx,
            send_window,
            shared,
            write_closed: false,
        }
    }

    /// Stream id on the wire
    pub fn id(&self) -> u32 {
        self.id
    }

    fn note_consumed(&mut self, n: u32) {
        self.consumed += n;
        if self.consumed >= GRANT_THRESHOLD {
            self.shared.add_recv_budget(self.id, self.consumed);
            let _ = self
                .frame_tx
                .send(MuxFrame::window_update(self.id, self.consumed));
            self.consumed = 0;
        }
    }

    fn send_close(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            let _ = self
                .frame_tx
                .send(MuxFrame::bare(self.id, MuxFrameKind::Close));
        }
    }
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let n = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(n));
                this.note_consumed(n as u32);
                return Poll::Ready(Ok(()));
            }

            match this.recv.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.current = chunk,
                // Peer half-closed: EOF after the buffer drained
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let want = buf.len().min(DATA_CHUNK);
        match this.send_window.try_consume(want, cx.waker()) {
            // No credit yet; woken on the next WindowUpdate
            None => Poll::Pending,
            // Session failed underneath us
            Some(0) => Poll::Ready(Err(io::ErrorKind::BrokenPipe.into())),
            Some(n) => {
                let frame = MuxFrame::data(this.id, Bytes::copy_from_slice(&buf[..n]));
                if this.frame_tx.send(frame).is_err() {
                    return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
                }
                Poll::Ready(Ok(n))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are flushed by the writer task as they are sent
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().send_close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        self.send_close();
    }
}
