//! Error types for packetconn.
//!
//! Every variant except `Io`, `ConnectionClosed` and `BackpressureTimeout` is a
//! usage or protocol invariant violation. Callers should drop the packet (or the
//! connection it came from) rather than retry.

use thiserror::Error;

/// Main error type for all packet operations.
#[derive(Debug, Error)]
pub enum PacketError {
    /// A pool was handed an object that does not belong to it.
    #[error("Pool invariant violated: {0}")]
    PoolInvariant(String),

    /// `release()` was called more times than references were established.
    #[error("Releasing packet with refcount={refcount}")]
    RefcountUnderflow {
        /// Reference count observed when the release was attempted.
        refcount: i64,
    },

    /// A read asked for bytes past the end of the written payload.
    #[error("Reading {len} bytes at offset {offset}, but only {available} available")]
    OutOfBounds {
        /// Payload offset the read started at.
        offset: usize,
        /// Number of bytes requested.
        len: usize,
        /// Payload bytes available from `offset`.
        available: usize,
    },

    /// The payload would grow past the configured maximum length.
    #[error("Payload size {required} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload length that was required.
        required: u64,
        /// Configured maximum payload length.
        max: u32,
    },

    /// A variable-length field or count does not fit its length prefix.
    #[error("Field length {len} exceeds prefix maximum {max}")]
    FieldTooLong {
        /// Length of the field or number of elements.
        len: usize,
        /// Largest value the prefix can carry.
        max: u64,
    },

    /// The packet handle was used after its final release.
    #[error("Packet already released")]
    Released,

    /// A string field did not hold valid UTF-8.
    #[error("Invalid UTF-8 in string field: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// I/O error while writing frames.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer task has gone away.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Invalid pool configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias using PacketError.
pub type Result<T> = std::result::Result<T, PacketError>;
