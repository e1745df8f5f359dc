//! Wire format encoding and decoding.
//!
//! Every AMQP 0-9-1 frame is a 7-byte header, the payload, and an end marker:
//! ```text
//! ┌──────┬─────────┬───────────┬─────────────┬──────┐
//! │ Type │ Channel │ Size      │ Payload     │ End  │
//! │ 1 B  │ u16 BE  │ u32 BE    │ Size bytes  │ 0xCE │
//! └──────┴─────────┴───────────┴─────────────┴──────┘
//! ```
//!
//! Before the first frame the client sends the 8-byte protocol header
//! `"AMQP" 0 0 9 1`.

use crate::error::ProtocolError;

/// Frame header size in bytes (type + channel + size).
pub const FRAME_HEADER_SIZE: usize = 7;

/// Frame end marker.
pub const FRAME_END: u8 = 0xCE;

/// Header plus end marker.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 1;

/// Smallest frame-max a peer may negotiate, and the limit before tuning.
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Frame-max offered by the gateway when not configured.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Protocol header for AMQP 0-9-1.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Frame type octets.
pub mod frame_type {
    pub const METHOD: u8 = 1;
    pub const HEADER: u8 = 2;
    pub const BODY: u8 = 3;
    pub const HEARTBEAT: u8 = 8;
}

/// Kind of a frame, from its type octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Method,
    Header,
    Body,
    Heartbeat,
}

impl FrameType {
    /// Parse a frame type octet. Unknown values are a protocol violation.
    pub fn from_octet(octet: u8) -> Result<Self, ProtocolError> {
        match octet {
            frame_type::METHOD => Ok(FrameType::Method),
            frame_type::HEADER => Ok(FrameType::Header),
            frame_type::BODY => Ok(FrameType::Body),
            frame_type::HEARTBEAT => Ok(FrameType::Heartbeat),
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }

    #[inline]
    pub fn octet(self) -> u8 {
        match self {
            FrameType::Method => frame_type::METHOD,
            FrameType::Header => frame_type::HEADER,
            FrameType::Body => frame_type::BODY,
            FrameType::Heartbeat => frame_type::HEARTBEAT,
        }
    }

    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Method => "method",
            FrameType::Header => "content-header",
            FrameType::Body => "content-body",
            FrameType::Heartbeat => "heartbeat",
        }
    }

    /// Content-header and content-body frames.
    #[inline]
    pub fn is_content(self) -> bool {
        matches!(self, FrameType::Header | FrameType::Body)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub channel: u16,
    /// Declared payload size in bytes.
    pub size: u32,
}

impl FrameHeader {
    pub fn new(frame_type: FrameType, channel: u16, size: u32) -> Self {
        Self {
            frame_type,
            channel,
            size,
        }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `FRAME_HEADER_SIZE` (7 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);
        buf[0] = self.frame_type.octet();
        buf[1..3].copy_from_slice(&self.channel.to_be_bytes());
        buf[3..7].copy_from_slice(&self.size.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short, and an error for an
    /// unknown frame type.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        Ok(Some(Self {
            frame_type: FrameType::from_octet(buf[0])?,
            channel: u16::from_be_bytes([buf[1], buf[2]]),
            size: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        }))
    }

    /// Total bytes this frame occupies on the wire.
    #[inline]
    pub fn frame_len(&self) -> u64 {
        self.size as u64 + FRAME_OVERHEAD as u64
    }

    /// Validate the header against the negotiated frame-max.
    ///
    /// Checks:
    /// - Whole frame (header, payload, end marker) fits in `frame_max`
    /// - Heartbeats have an empty payload and use channel 0
    pub fn validate(&self, frame_max: u32) -> Result<(), ProtocolError> {
        if self.frame_len() > frame_max as u64 {
            return Err(ProtocolError::FrameTooLarge {
                size: self.frame_len(),
                max: frame_max,
            });
        }

        if self.frame_type == FrameType::Heartbeat && (self.size != 0 || self.channel != 0) {
            return Err(ProtocolError::MalformedHeartbeat {
                channel: self.channel,
                size: self.size as usize,
            });
        }

        Ok(())
    }
}

/// Check a client's protocol header.
pub fn validate_protocol_header(header: &[u8; 8]) -> Result<(), ProtocolError> {
    if *header == PROTOCOL_HEADER {
        Ok(())
    } else {
        Err(ProtocolError::BadProtocolHeader(*header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = FrameHeader::new(FrameType::Method, 3, 100);
        let encoded = original.encode();
        let decoded = FrameHeader::decode(&encoded).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = FrameHeader::new(FrameType::Body, 0x0102, 0x03040506);
        let bytes = header.encode();

        assert_eq!(bytes[0], frame_type::BODY);
        assert_eq!(&bytes[1..3], &[0x01, 0x02]);
        assert_eq!(&bytes[3..7], &[0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [1u8; FRAME_HEADER_SIZE - 1];
        assert!(FrameHeader::decode(&buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_unknown_frame_type() {
        let buf = [4u8, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            FrameHeader::decode(&buf),
            Err(ProtocolError::UnknownFrameType(4))
        );
    }

    #[test]
    fn test_validate_frame_max_counts_overhead() {
        let fits = FrameHeader::new(FrameType::Body, 1, 4096 - FRAME_OVERHEAD as u32);
        assert!(fits.validate(4096).is_ok());

        let too_big = FrameHeader::new(FrameType::Body, 1, 4096 - FRAME_OVERHEAD as u32 + 1);
        assert!(matches!(
            too_big.validate(4096),
            Err(ProtocolError::FrameTooLarge { size: 4097, max: 4096 })
        ));
    }

    #[test]
    fn test_validate_heartbeat_shape() {
        assert!(FrameHeader::new(FrameType::Heartbeat, 0, 0)
            .validate(FRAME_MIN_SIZE)
            .is_ok());
        assert!(FrameHeader::new(FrameType::Heartbeat, 1, 0)
            .validate(FRAME_MIN_SIZE)
            .is_err());
        assert!(FrameHeader::new(FrameType::Heartbeat, 0, 2)
            .validate(FRAME_MIN_SIZE)
            .is_err());
    }

    #[test]
    fn test_protocol_header() {
        assert!(validate_protocol_header(&PROTOCOL_HEADER).is_ok());
        let amqp_1_0 = *b"AMQP\x00\x01\x00\x00";
        assert_eq!(
            validate_protocol_header(&amqp_1_0),
            Err(ProtocolError::BadProtocolHeader(amqp_1_0))
        );
    }
}
