//! Wire format encoding and decoding.
//!
//! A wire frame is the packet buffer read as-is:
//! ```text
//! ┌──────────────┬──────────────────────────┐
//! │ Payload len  │ Payload                  │
//! │ 4 bytes      │ `len` bytes              │
//! │ uint32 LE    │                          │
//! └──────────────┴──────────────────────────┘
//! ```
//!
//! All multi-byte integers, in the header and in payload fields, are Little Endian.
//! The header is the only storage for the payload length: packets read and write it
//! through [`read_payload_len`] and [`write_payload_len`].

use crate::error::{PacketError, Result};

/// Header size in bytes (fixed, exactly 4).
pub const HEADER_SIZE: usize = 4;

/// Default minimum payload capacity. Packets carry a buffer of this size inline.
pub const DEFAULT_MIN_PAYLOAD_CAP: u32 = 128;

/// Default growth shift between capacity classes (factor `1 << 2 = 4`).
pub const DEFAULT_CAP_GROW_SHIFT: u32 = 2;

/// Default maximum payload length (32 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 32 * 1024 * 1024;

/// Largest payload length the 4-byte header can describe alongside the header itself.
pub const ABSOLUTE_MAX_PAYLOAD_LEN: u32 = u32::MAX - HEADER_SIZE as u32;

/// Encode a payload length header.
///
/// # Example
///
/// ```
/// use packetconn::protocol::encode_header;
///
/// assert_eq!(encode_header(0x0102_0304), [0x04, 0x03, 0x02, 0x01]);
/// ```
#[inline]
pub fn encode_header(payload_len: u32) -> [u8; HEADER_SIZE] {
    payload_len.to_le_bytes()
}

/// Decode a payload length header.
///
/// Returns `None` if the buffer is too short.
#[inline]
pub fn decode_header(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; HEADER_SIZE] = buf.get(..HEADER_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Read the payload length stored in the header of a packet buffer.
///
/// Packet buffers are always at least `HEADER_SIZE` long.
#[inline]
pub(crate) fn read_payload_len(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Store the payload length in the header of a packet buffer.
#[inline]
pub(crate) fn write_payload_len(buf: &mut [u8], payload_len: u32) {
    buf[..HEADER_SIZE].copy_from_slice(&payload_len.to_le_bytes());
}

/// Validate a decoded payload length against the configured maximum.
pub fn validate_header(payload_len: u32, max_payload_len: u32) -> Result<()> {
    if payload_len > max_payload_len {
        return Err(PacketError::PayloadTooLarge {
            required: u64::from(payload_len),
            max: max_payload_len,
        });
    }
    Ok(())
}
