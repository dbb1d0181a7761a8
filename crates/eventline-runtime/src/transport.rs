//! Framed TCP link
//!
//! Splits a raw TCP stream into a frame reader and a fire-and-forget write
//! handle. Reliability is layered above: the write side never waits for
//! acknowledgement, and malformed inbound frames are logged and dropped
//! without disturbing the frames behind them.

use std::net::SocketAddr;
use std::time::Duration;

use eventline_core::wire::FrameBuffer;
use eventline_core::{wire, Envelope};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Interval between keep-alive reconnection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Consecutive failed reconnection attempts before keep-alive gives up
pub const MAX_RECONNECT_FAILURES: u32 = 5;

// ----------------------------------------------------------------------------
// Connection Handle
// ----------------------------------------------------------------------------

/// Cloneable write handle for one connection
///
/// Sends are fire-and-forget: envelopes are queued to a writer task that
/// matches one frame to one write. Once the socket dies the queue closes and
/// further sends are silently dropped; the owner learns about the death
/// from the read side.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ConnectionHandle {
    /// Remote address of the connection
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue an envelope for writing
    pub fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            trace!(peer = %self.peer, "write queue closed; frame dropped");
        }
    }

    /// Queue an event with arguments
    pub fn emit(&self, event: impl Into<String>, args: Vec<Value>) {
        self.send(Envelope::new(event, args));
    }

    /// Whether the writer task is still accepting frames
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

// ----------------------------------------------------------------------------
// Frame Stream
// ----------------------------------------------------------------------------

/// Read side of a framed connection
pub struct FrameStream {
    peer: SocketAddr,
    read: OwnedReadHalf,
    buffer: FrameBuffer,
}

impl FrameStream {
    /// Next well-formed frame, or `None` once the connection is gone
    ///
    /// Malformed frames and frames without the protocol marker are logged
    /// and skipped; they never surface to the caller.
    pub async fn next(&mut self) -> Option<Envelope> {
        let mut chunk = [0u8; 4096];

        loop {
            while let Some(frame) = self.buffer.next_frame() {
                match frame {
                    Ok(envelope) => return Some(envelope),
                    Err(err) => warn!(peer = %self.peer, %err, "dropping malformed frame"),
                }
            }

            match self.read.read(&mut chunk).await {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend(&chunk[..n]),
                Err(err) => {
                    debug!(peer = %self.peer, %err, "socket read failed");
                    return None;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Framing
// ----------------------------------------------------------------------------

/// Split a stream into its framed read side and a write handle
///
/// The writer task lives until the send queue closes (every handle dropped)
/// or a write fails.
pub fn framed(stream: TcpStream, peer: SocketAddr) -> (FrameStream, ConnectionHandle) {
    let (read, write) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(write, rx, peer));

    (
        FrameStream {
            peer,
            read,
            buffer: FrameBuffer::new(),
        },
        ConnectionHandle { peer, tx },
    )
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    peer: SocketAddr,
) {
    while let Some(envelope) = rx.recv().await {
        let bytes = wire::encode(&envelope);
        if let Err(err) = write.write_all(&bytes).await {
            debug!(peer = %peer, %err, "socket write failed");
            break;
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
