//! Frame codec for the Eventline wire protocol
//!
//! Each frame is a single self-describing JSON object tagged with the
//! protocol marker, terminated by a newline. TCP is a byte stream, so one
//! `write` is not one `read`: the decoder reassembles frames from
//! arbitrary byte chunks and tolerates several frames arriving in one chunk.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::Envelope;
use crate::errors::FrameError;

/// Frame delimiter
const DELIMITER: u8 = b'\n';

// ----------------------------------------------------------------------------
// Frame Shape
// ----------------------------------------------------------------------------

/// The on-wire shape of one frame
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    #[serde(rename = "__evl__")]
    marker: bool,
    event: String,
    #[serde(default)]
    args: Vec<Value>,
}

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Encode an envelope into one delimited frame
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let frame = Frame {
        marker: true,
        event: envelope.event.clone(),
        args: envelope.args.clone(),
    };

    // Envelope fields are always JSON-serializable, so this cannot fail.
    let mut bytes = serde_json::to_vec(&frame).unwrap_or_default();
    bytes.push(DELIMITER);
    bytes
}

/// Decode a single complete frame body (without its delimiter)
pub fn decode(bytes: &[u8]) -> Result<Envelope, FrameError> {
    let frame: Frame = serde_json::from_slice(bytes)?;

    if !frame.marker {
        return Err(FrameError::MissingMarker);
    }

    Ok(Envelope {
        event: frame.event,
        args: frame.args,
    })
}

// ----------------------------------------------------------------------------
// Frame Buffer
// ----------------------------------------------------------------------------

/// Reassembles delimited frames from a raw byte stream
///
/// Feed it whatever chunks the socket yields; it hands back complete frames
/// in arrival order. A malformed frame comes out as an `Err` the caller is
/// expected to log and drop; it never poisons the frames behind it.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read off the socket
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one has fully arrived
    pub fn next_frame(&mut self) -> Option<Result<Envelope, FrameError>> {
        let at = self.buf.iter().position(|&b| b == DELIMITER)?;
        let body: Vec<u8> = self.buf.drain(..=at).take(at).collect();

        if body.iter().all(|b| b.is_ascii_whitespace()) {
            // Empty line between frames; keep scanning.
            return self.next_frame();
        }

        Some(decode(&body))
    }

    /// Number of buffered bytes not yet forming a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
