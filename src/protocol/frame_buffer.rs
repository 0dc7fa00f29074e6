//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` to collect bytes from the stream and turns every complete
//! frame into a pooled [`Packet`]. Implements a state machine for fragmented frames:
//! - `WaitingForHeader`: Need at least 4 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! # Example
//!
//! ```
//! use packetconn::protocol::{encode_header, FrameBuffer};
//! use packetconn::PacketPool;
//!
//! let mut buffer = FrameBuffer::new(PacketPool::with_defaults());
//!
//! let mut stream = encode_header(2).to_vec();
//! stream.extend_from_slice(b"hi");
//!
//! let packets = buffer.push(&stream).unwrap();
//! assert_eq!(packets.len(), 1);
//! assert_eq!(packets[0].payload(), b"hi");
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{decode_header, validate_header, HEADER_SIZE};
use crate::error::Result;
use crate::packet::Packet;
use crate::pool::PacketPool;

/// Initial capacity of the accumulation buffer.
const INITIAL_CAPACITY: usize = 64 * 1024;

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete packets.
///
/// Headers above the pool's maximum payload length are rejected before any payload
/// is buffered.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Pool that extracted packets are checked out from.
    pool: PacketPool,
}

impl FrameBuffer {
    /// Create a frame buffer producing packets from `pool`.
    pub fn new(pool: PacketPool) -> Self {
        Self::with_capacity(pool, INITIAL_CAPACITY)
    }

    /// Create a frame buffer with a custom initial buffer capacity.
    pub fn with_capacity(pool: PacketPool, capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
            state: State::WaitingForHeader,
            pool,
        }
    }

    /// Push data into the buffer and extract all complete packets.
    ///
    /// Partial data is kept for the next push. Returned packets have a reference
    /// count of 1 and the read cursor at the payload start.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PayloadTooLarge`](crate::PacketError::PayloadTooLarge)
    /// if a header announces more than the pool's maximum payload length. The stream
    /// cannot be resynchronized after that; drop it.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        while let Some(packet) = self.try_extract_one()? {
            packets.push(packet);
        }

        Ok(packets)
    }

    fn try_extract_one(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.state {
                State::WaitingForHeader => {
                    let Some(payload_len) = decode_header(&self.buffer) else {
                        return Ok(None);
                    };

                    if let Err(e) =
                        validate_header(payload_len, self.pool.config().max_payload_len)
                    {
                        tracing::error!(payload_len, "rejecting oversized frame");
                        return Err(e);
                    }

                    self.buffer.advance(HEADER_SIZE);
                    self.state = State::WaitingForPayload {
                        remaining: payload_len,
                    };
                }

                State::WaitingForPayload { remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining);
                    self.state = State::WaitingForHeader;

                    let mut packet = self.pool.checkout()?;
                    packet.append_bytes(&payload)?;
                    return Ok(Some(packet));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}
