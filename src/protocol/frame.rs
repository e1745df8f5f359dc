//! Frame struct with typed accessors.
//!
//! Represents a complete protocol frame: type, channel and payload. The
//! declared size always equals `payload.len()`; the frame buffer never hands
//! out a frame whose payload was short. Uses `bytes::Bytes` for zero-copy
//! payload sharing between the read side and the forwarding writer.
//!
//! # Example
//!
//! ```
//! use amqp_gateway::protocol::{Frame, FrameType};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(FrameType::Body, 1, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.channel, 1);
//! assert_eq!(frame.encode().len(), 7 + 5 + 1);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{FrameHeader, FrameType, FRAME_END, FRAME_OVERHEAD};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel: u16,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            channel,
            payload,
        }
    }

    /// A heartbeat frame (channel 0, empty payload).
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, 0, Bytes::new())
    }

    /// Header describing this frame.
    #[inline]
    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.frame_type, self.channel, self.payload.len() as u32)
    }

    /// Size on the wire, including header and end marker.
    #[inline]
    pub fn wire_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    #[inline]
    pub fn is_heartbeat(&self) -> bool {
        self.frame_type == FrameType::Heartbeat
    }

    /// Class and method ids of a method frame, without decoding its arguments.
    ///
    /// Returns `None` for non-method frames or payloads shorter than 4 bytes.
    pub fn method_ids(&self) -> Option<(u16, u16)> {
        if self.frame_type != FrameType::Method || self.payload.len() < 4 {
            return None;
        }
        let p = &self.payload;
        Some((
            u16::from_be_bytes([p[0], p[1]]),
            u16::from_be_bytes([p[2], p[3]]),
        ))
    }

    /// Encode the frame into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
        buf.put_u8(FRAME_END);
    }
}

/// Build a complete frame as a single byte vector.
///
/// Use [`Frame::encode`] when a `Frame` is already at hand; this helper is
/// for raw payloads (tests, fuzzing, hand-built fixtures).
///
/// # Example
///
/// ```
/// use amqp_gateway::protocol::{build_frame, FrameType};
///
/// let bytes = build_frame(FrameType::Method, 0, &[0, 10, 0, 51]);
/// assert_eq!(bytes.len(), 7 + 4 + 1);
/// assert_eq!(*bytes.last().unwrap(), 0xCE);
/// ```
pub fn build_frame(frame_type: FrameType, channel: u16, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(frame_type, channel, payload.len() as u32);
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf.push(FRAME_END);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FRAME_HEADER_SIZE;

    #[test]
    fn test_frame_creation() {
        let frame = Frame::new(FrameType::Header, 7, Bytes::from_static(b"props"));

        assert_eq!(frame.channel, 7);
        assert_eq!(frame.header().size, 5);
        assert_eq!(frame.wire_len(), FRAME_HEADER_SIZE + 5 + 1);
        assert!(!frame.is_heartbeat());
    }

    #[test]
    fn test_heartbeat_frame_bytes() {
        let bytes = Frame::heartbeat().encode();
        assert_eq!(&bytes[..], &[8, 0, 0, 0, 0, 0, 0, FRAME_END]);
    }

    #[test]
    fn test_method_ids_peek() {
        let frame = Frame::new(FrameType::Method, 0, Bytes::from_static(&[0, 10, 0, 50, 1]));
        assert_eq!(frame.method_ids(), Some((10, 50)));

        let short = Frame::new(FrameType::Method, 0, Bytes::from_static(&[0, 10]));
        assert_eq!(short.method_ids(), None);

        let body = Frame::new(FrameType::Body, 1, Bytes::from_static(&[0, 10, 0, 50]));
        assert_eq!(body.method_ids(), None);
    }

    #[test]
    fn test_encode_matches_build_frame() {
        let frame = Frame::new(FrameType::Body, 2, Bytes::from_static(b"abc"));
        assert_eq!(&frame.encode()[..], &build_frame(FrameType::Body, 2, b"abc")[..]);
    }
}
