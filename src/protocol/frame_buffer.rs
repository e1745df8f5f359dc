//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 7 bytes
//! - `WaitingForPayload`: Header validated, need payload plus end marker
//!
//! The declared size is checked against frame-max as soon as the header is
//! complete, so an oversized frame is rejected before any payload is read.
//!
//! # Example
//!
//! ```
//! use amqp_gateway::protocol::{build_frame, FrameBuffer, FrameType};
//!
//! let mut buffer = FrameBuffer::new();
//! let bytes = build_frame(FrameType::Body, 1, b"hello");
//!
//! let frames = buffer.push(&bytes).unwrap();
//! assert_eq!(frames.len(), 1);
//! assert_eq!(&frames[0].payload[..], b"hello");
//! ```

use bytes::BytesMut;

use super::wire_format::{FrameHeader, FRAME_END, FRAME_HEADER_SIZE, FRAME_MIN_SIZE};
use super::Frame;
use crate::error::ProtocolError;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 7 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes and the end marker.
    WaitingForPayload { header: FrameHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
///
/// Stateless across frames except for `frame_max`, which the connection
/// raises once tuning completes.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame size, header and end marker included.
    frame_max: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer limited to the pre-tuning frame size.
    pub fn new() -> Self {
        Self::with_frame_max(FRAME_MIN_SIZE)
    }

    /// Create a new frame buffer with a custom frame-max.
    pub fn with_frame_max(frame_max: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForHeader,
            frame_max,
        }
    }

    /// Current frame-max.
    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    /// Apply the negotiated frame-max to subsequent frames.
    pub fn set_frame_max(&mut self, frame_max: u32) {
        self.frame_max = frame_max;
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Returns a vector of complete frames. If data is fragmented,
    /// partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown frame type, an oversized frame, a
    /// malformed heartbeat or a bad end marker. The buffer must not be used
    /// after an error.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Extract a single frame from already buffered bytes.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was extracted
    /// - `Ok(None)` if more data is needed
    /// - `Err(...)` on a protocol violation
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if let State::WaitingForHeader = self.state {
            let header = match FrameHeader::decode(&self.buffer)? {
                Some(header) => header,
                None => return Ok(None),
            };
            header.validate(self.frame_max)?;

            let _ = self.buffer.split_to(FRAME_HEADER_SIZE);
            self.state = State::WaitingForPayload { header };
        }

        let header = match &self.state {
            State::WaitingForPayload { header } => *header,
            State::WaitingForHeader => return Ok(None),
        };

        let size = header.size as usize;
        if self.buffer.len() < size + 1 {
            return Ok(None);
        }

        let end = self.buffer[size];
        if end != FRAME_END {
            return Err(ProtocolError::FrameCorrupt { found: end });
        }

        let payload = self.buffer.split_to(size).freeze();
        let _ = self.buffer.split_to(1);
        self.state = State::WaitingForHeader;

        Ok(Some(Frame::new(header.frame_type, header.channel, payload)))
    }

    /// Append data to the buffer without extracting frames.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Check that the stream ended on a frame boundary.
    ///
    /// Called when the peer closes its write side; a partially received
    /// frame means the declared size did not match the bytes sent.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        let buffered = self.len();
        if buffered == 0 {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame { buffered })
        }
    }

    /// Number of bytes received but not yet returned as frames, including a
    /// consumed header that is waiting for its payload.
    pub fn len(&self) -> usize {
        match self.state {
            State::WaitingForHeader => self.buffer.len(),
            State::WaitingForPayload { .. } => self.buffer.len() + FRAME_HEADER_SIZE,
        }
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
