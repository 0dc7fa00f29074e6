//! MsgPack codec using `rmp-serde`.
//!
//! Structured values travel inside a packet as an I-prefixed field holding the
//! MessagePack encoding. Structs are always encoded as maps (`to_vec_named`), so
//! peers decode them by field name rather than position.
//!
//! # Example
//!
//! ```
//! use packetconn::PacketPool;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Login {
//!     user: String,
//!     attempt: u32,
//! }
//!
//! let pool = PacketPool::with_defaults();
//! let mut packet = pool.checkout().unwrap();
//!
//! let msg = Login { user: "ana".to_string(), attempt: 2 };
//! packet.append_u16(7).unwrap();
//! packet.append_data(&msg).unwrap();
//!
//! assert_eq!(packet.read_u16().unwrap(), 7);
//! let decoded: Login = packet.read_data().unwrap();
//! assert_eq!(decoded, msg);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::packet::Packet;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes, structs as maps.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
        // to_vec_named, not to_vec: positional structs break name-based decoders.
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Packet {
    /// Append `value` as an I-prefixed MessagePack field.
    ///
    /// The packet is unchanged if encoding fails.
    pub fn append_data<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let encoded = MsgPackCodec::encode(value)?;
        self.append_var_bytes_i(&encoded)
    }

    /// Read a field written by [`Packet::append_data`].
    ///
    /// The field is consumed even if it does not decode as `T`.
    pub fn read_data<T: DeserializeOwned>(&mut self) -> Result<T> {
        let bytes = self.read_var_bytes_i()?;
        MsgPackCodec::decode(bytes)
    }
}
