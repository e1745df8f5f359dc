//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the AMQP 0-9-1 frame layer:
//! - 7-byte frame header encoding/decoding and the protocol header
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - Async reader/writer over sockets

mod frame;
mod frame_buffer;
mod stream;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use stream::{write_frame, FrameReader};
pub use wire_format::{
    frame_type, validate_protocol_header, FrameHeader, FrameType, DEFAULT_FRAME_MAX, FRAME_END,
    FRAME_HEADER_SIZE, FRAME_MIN_SIZE, FRAME_OVERHEAD, PROTOCOL_HEADER,
};
