//! Protocol module - wire format and framing.
//!
//! - 4-byte little-endian length header
//! - Frame buffer reassembling packets from a byte stream

mod frame_buffer;
pub mod wire_format;

pub use frame_buffer::FrameBuffer;
pub use wire_format::{
    decode_header, encode_header, validate_header, ABSOLUTE_MAX_PAYLOAD_LEN,
    DEFAULT_CAP_GROW_SHIFT, DEFAULT_MAX_PAYLOAD_LEN, DEFAULT_MIN_PAYLOAD_CAP, HEADER_SIZE,
};
