//! # packetconn
//!
//! Pooled, reference-counted packet buffers with a little-endian binary codec.
//!
//! A [`Packet`] holds a buffer that already is its own wire frame: a 4-byte
//! little-endian payload length followed by the payload. Producers append typed
//! fields, consumers read them back in order, and the buffer can be written to a
//! stream without re-framing.
//!
//! ## Architecture
//!
//! - **Pools**: buffer capacities follow a geometric [`CapacitySchedule`]; buffers
//!   above the inline minimum are recycled per class by a [`BufferPoolSet`], and
//!   packet shells by the owning [`PacketPool`]
//! - **Lifecycle**: packets start with a reference count of 1 and return everything
//!   to the pools on the final release; [`SharedPacket`] fans one packet out to
//!   several owners
//! - **Stream plumbing**: [`protocol::FrameBuffer`] reassembles packets from socket
//!   reads, and [`writer`] sends them from a dedicated task
//!
//! ## Example
//!
//! ```
//! use packetconn::PacketPool;
//!
//! let pool = PacketPool::with_defaults();
//!
//! let mut packet = pool.checkout().unwrap();
//! packet.append_u16(1).unwrap();
//! packet.append_string_list(&["alpha", "beta"]).unwrap();
//!
//! // Header plus payload, ready for the socket.
//! assert_eq!(&packet.wire_frame()[..4], &packet.payload_len().to_le_bytes());
//!
//! assert_eq!(packet.read_u16().unwrap(), 1);
//! assert_eq!(packet.read_string_list().unwrap(), ["alpha", "beta"]);
//! packet.release().unwrap();
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod packet;
pub mod pool;
pub mod protocol;
pub mod writer;

pub use config::PoolConfig;
pub use error::{PacketError, Result};
pub use packet::{Packet, SharedPacket};
pub use pool::{BufferPoolSet, CapacitySchedule, PacketPool, PoolStats};

/// Check out an empty packet from the process-wide default pool.
///
/// Code that builds its own [`PacketPool`] should call
/// [`PacketPool::checkout`] on it instead.
pub fn new_packet() -> Result<Packet> {
    PacketPool::global().checkout()
}
