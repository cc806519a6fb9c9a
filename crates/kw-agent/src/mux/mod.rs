//! Stream multiplexer runtime
//!
//! Promotes a single byte stream into independent ordered sub-streams with
//! per-stream flow control. One writer task serializes outgoing frames; one
//! demux task routes incoming frames to stream buffers. The frame format
//! lives in [`kw_protocol::mux`].

mod stream;

pub use stream::MuxStream;

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::task::Waker;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kw_protocol::mux::INITIAL_WINDOW;
use kw_protocol::{MuxCodec, MuxFrame, MuxFrameKind, ProtocolError};

/// Upper bound on a single outgoing data frame
pub(crate) const DATA_CHUNK: usize = 16 * 1024;

/// Multiplexer errors
#[derive(Error, Debug)]
pub enum MuxError {
    /// The session ended before the operation completed
    #[error("Multiplexed session closed")]
    SessionClosed,

    /// Frame-level error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// I/O error on the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which end of the session this is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// Opens streams with odd ids; the stub side
    Initiator,
    /// Accepts streams; the agent side
    Acceptor,
}

/// Flow-control window for the sending side of one stream
pub(crate) struct SendWindow {
    state: Mutex<WindowState>,
}

struct WindowState {
    available: u32,
    failed: bool,
    waker: Option<Waker>,
}

impl SendWindow {
    fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(WindowState {
                available: initial,
                failed: false,
                waker: None,
            }),
        }
    }

    /// Take up to `want` bytes of credit. Returns None (and stores the
    /// waker) when no credit is available, Some(0) when the session failed.
    pub(crate) fn try_consume(&self, want: usize, waker: &Waker) -> Option<usize> {
        let mut state = self.state.lock().expect("window lock poisoned");
        if state.failed {
            return Some(0);
        }
        if state.available == 0 {
            state.waker = Some(waker.clone());
            return None;
        }
        let take = want.min(state.available as usize);
        state.available -= take as u32;
        Some(take)
    }

    fn grant(&self, credit: u32) {
        let mut state = self.state.lock().expect("window lock poisoned");
        state.available = state.available.saturating_add(credit);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }

    fn fail(&self) {
        let mut state = self.state.lock().expect("window lock poisoned");
        state.failed = true;
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }
    }
}

/// Per-stream state shared between the demux task and stream handles
struct StreamState {
    /// Incoming data; None once the peer half-closed
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// How many more payload bytes the peer may send before a grant
    recv_budget: u64,
    /// Credit for our sending side
    send_window: Arc<SendWindow>,
}

pub(crate) struct Shared {
    streams: Mutex<HashMap<u32, StreamState>>,
    /// Cancelled when the session fails; stops the writer task
    shutdown: CancellationToken,
}

impl Shared {
    /// Bump the peer-facing receive budget when a grant is queued
    pub(crate) fn add_recv_budget(&self, stream_id: u32, credit: u32) {
        let mut streams = self.streams.lock().expect("mux lock poisoned");
        if let Some(state) = streams.get_mut(&stream_id) {
            state.recv_budget += u64::from(credit);
        }
    }

    fn fail_all(&self) {
        {
            let mut streams = self.streams.lock().expect("mux lock poisoned");
            for state in streams.values_mut() {
                state.data_tx = None;
                state.send_window.fail();
            }
        }
        self.shutdown.cancel();
    }
}

/// A promoted multiplexed session
///
/// All outgoing frames share one FIFO toward the writer task, so per-stream
/// frame order is preserved; the amount of queued data is bounded by the
/// per-stream send windows, which are consumed before a frame is queued.
pub struct MuxSession {
    role: MuxRole,
    shared: Arc<Shared>,
    /// Outgoing frames toward the writer task
    frame_tx: mpsc::UnboundedSender<MuxFrame>,
    /// Streams the peer has opened (acceptor role)
    accept_rx: mpsc::Receiver<MuxStream>,
    /// Next stream id to allocate (initiator role)
    next_stream_id: u32,
}

impl MuxSession {
    /// Promote `io` into a multiplexed session.
    ///
    /// `residue` carries bytes already read from `io` before promotion
    /// (the decoder's leftover buffer); `max_accept` bounds how many
    /// streams the peer may open before the session is torn down.
    pub fn new<S>(io: S, role: MuxRole, residue: BytesMut, max_accept: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let reader = Cursor::new(residue.freeze()).chain(read_half);

        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(max_accept.max(1));

        tokio::spawn(writer_task(
            FramedWrite::new(write_half, MuxCodec::new()),
            frame_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(demux_task(
            FramedRead::new(reader, MuxCodec::new()),
            Arc::clone(&shared),
            accept_tx,
            frame_tx.clone(),
            max_accept,
        ));

        Self {
            role,
            shared,
            frame_tx,
            accept_rx,
            next_stream_id: 1,
        }
    }

    /// Accept the next stream the peer opens (acceptor role)
    pub async fn accept(&mut self) -> Result<MuxStream, MuxError> {
        self.accept_rx.recv().await.ok_or(MuxError::SessionClosed)
    }

    /// Open a new stream (initiator role)
    pub fn open(&mut self) -> Result<MuxStream, MuxError> {
        debug_assert_eq!(self.role, MuxRole::Initiator);

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;

        let send_window = Arc::new(SendWindow::new(INITIAL_WINDOW));
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        {
            let mut streams = self.shared.streams.lock().expect("mux lock poisoned");
            streams.insert(
                stream_id,
                StreamState {
                    data_tx: Some(data_tx),
                    recv_budget: u64::from(INITIAL_WINDOW),
                    send_window: Arc::clone(&send_window),
                },
            );
        }

        self.frame_tx
            .send(MuxFrame::bare(stream_id, MuxFrameKind::Open))
            .map_err(|_| MuxError::SessionClosed)?;

        Ok(MuxStream::new(
            stream_id,
            data_rx,
            self.frame_tx.clone(),
            send_window,
            Arc::clone(&self.shared),
        ))
    }
}

async fn writer_task(
    mut sink: FramedWrite<impl AsyncWrite + Unpin, MuxCodec>,
    mut frame_rx: mpsc::UnboundedReceiver<MuxFrame>,
    shared: Arc<Shared>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            // A failed session stops the writer, releasing the transport
            _ = shared.shutdown.cancelled() => return,
            frame = frame_rx.recv() => frame,
        };
        let Some(frame) = frame else {
            break;
        };
        if let Err(e) = sink.send(frame).await {
            warn!("Mux write failed: {}", e);
            shared.fail_all();
            return;
        }
    }
    let _ = sink.flush().await;
}

async fn demux_task(
    mut frames: FramedRead<impl AsyncRead + Unpin, MuxCodec>,
    shared: Arc<Shared>,
    accept_tx: mpsc::Sender<MuxStream>,
    frame_tx: mpsc::UnboundedSender<MuxFrame>,
    max_accept: usize,
) {
    let mut accepted = 0usize;
    let mut highest_opened = 0u32;

    while let Some(frame) = frames.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Mux decode failed: {}", e);
                shared.fail_all();
                return;
            }
        };

        match frame.kind {
            MuxFrameKind::Open => {
                if accepted >= max_accept {
                    warn!("Peer opened stream {} beyond the limit", frame.stream_id);
                    shared.fail_all();
                    return;
                }
                if frame.stream_id <= highest_opened {
                    warn!("Peer reused stream id {}", frame.stream_id);
                    shared.fail_all();
                    return;
                }
                highest_opened = frame.stream_id;
                accepted += 1;

                let send_window = Arc::new(SendWindow::new(INITIAL_WINDOW));
                let (data_tx, data_rx) = mpsc::unbounded_channel();
                {
                    let mut streams = shared.streams.lock().expect("mux lock poisoned");
                    streams.insert(
                        frame.stream_id,
                        StreamState {
                            data_tx: Some(data_tx),
                            recv_budget: u64::from(INITIAL_WINDOW),
                            send_window: Arc::clone(&send_window),
                        },
                    );
                }

                let stream = MuxStream::new(
                    frame.stream_id,
                    data_rx,
                    frame_tx.clone(),
                    send_window,
                    Arc::clone(&shared),
                );
                if accept_tx.send(stream).await.is_err() {
                    // Nobody is accepting further streams
                    warn!("Peer opened stream {} after accepting stopped", frame.stream_id);
                    shared.fail_all();
                    return;
                }
            }

            MuxFrameKind::Data => {
                let mut streams = shared.streams.lock().expect("mux lock poisoned");
                let Some(state) = streams.get_mut(&frame.stream_id) else {
                    warn!("Data for unknown stream {}", frame.stream_id);
                    drop(streams);
                    shared.fail_all();
                    return;
                };
                let len = frame.payload.len() as u64;
                if len > state.recv_budget {
                    warn!("Stream {} overran its receive window", frame.stream_id);
                    drop(streams);
                    shared.fail_all();
                    return;
                }
                state.recv_budget -= len;
                if let Some(tx) = &state.data_tx {
                    // Receiver dropped means the local side lost interest
                    let _ = tx.send(frame.payload);
                }
            }

            MuxFrameKind::WindowUpdate => {
                let credit = match frame.credit() {
                    Ok(credit) => credit,
                    Err(e) => {
                        warn!("Bad window update on stream {}: {}", frame.stream_id, e);
                        shared.fail_all();
                        return;
                    }
                };
                let streams = shared.streams.lock().expect("mux lock poisoned");
                if let Some(state) = streams.get(&frame.stream_id) {
                    state.send_window.grant(credit);
                }
            }

            MuxFrameKind::Close => {
                let mut streams = shared.streams.lock().expect("mux lock poisoned");
                if let Some(state) = streams.get_mut(&frame.stream_id) {
                    // Dropping the sender lets the reader drain then see EOF
                    state.data_tx = None;
                }
            }
        }
    }

    debug!("Mux transport reached EOF");
    shared.fail_all();
}
