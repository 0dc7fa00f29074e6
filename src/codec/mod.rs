//! Codec module - structured payload fields.
//!
//! The fixed-width and length-prefixed primitives live on
//! [`Packet`](crate::Packet) itself. This module adds [`MsgPackCodec`] for
//! serde-serializable values, carried in a packet through
//! [`Packet::append_data`](crate::Packet::append_data) and
//! [`Packet::read_data`](crate::Packet::read_data).
//!
//! # Example
//!
//! ```
//! use packetconn::codec::MsgPackCodec;
//!
//! let encoded = MsgPackCodec::encode(&"hello").unwrap();
//! let decoded: String = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//! ```

mod msgpack;

pub use msgpack::MsgPackCodec;
