//! Binary codec primitives on [`Packet`].
//!
//! Appends write at the payload end and grow the buffer as needed. Reads consume
//! from the read cursor. All integers are Little Endian; floats travel as the bit
//! pattern of the same-width unsigned integer.
//!
//! Variable-length fields come in two flavors:
//! - **H-prefixed**: `uint16` length + bytes (max 65535). Strings and string lists.
//! - **I-prefixed**: `uint32` length + bytes, for fields that may be larger.
//!
//! A failed read leaves the cursor where it was before that read.

use std::collections::HashMap;

use super::{Packet, Shell};
use crate::error::{PacketError, Result};
use crate::protocol::HEADER_SIZE;

/// Largest H-prefixed field or string list.
const MAX_H_LEN: usize = u16::MAX as usize;

/// Largest I-prefixed field or map.
const MAX_I_LEN: usize = u32::MAX as usize;

#[inline]
fn check_h_len(len: usize) -> Result<()> {
    if len > MAX_H_LEN {
        return Err(PacketError::FieldTooLong {
            len,
            max: MAX_H_LEN as u64,
        });
    }
    Ok(())
}

#[inline]
fn check_i_len(len: usize) -> Result<()> {
    if len > MAX_I_LEN {
        return Err(PacketError::FieldTooLong {
            len,
            max: MAX_I_LEN as u64,
        });
    }
    Ok(())
}

impl Shell {
    /// Copy `bytes` to the payload end. Capacity must already be assured.
    fn put(&mut self, bytes: &[u8]) {
        let len = self.payload_len();
        let start = HEADER_SIZE + len as usize;
        let buf = self.buf_mut();
        buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.set_payload_len(len + bytes.len() as u32);
    }

    /// Consume `n` payload bytes at the read cursor.
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let start = self.read_cursor as usize;
        let available = (self.payload_len() as usize).saturating_sub(start);
        if n > available {
            return Err(PacketError::OutOfBounds {
                offset: start,
                len: n,
                available,
            });
        }
        self.read_cursor += n as u32;
        let pos = HEADER_SIZE + start;
        Ok(&self.buf()[pos..pos + n])
    }

    /// Consume a field whose length sits in the `W`-byte prefix at the read cursor.
    ///
    /// Prefix and body are checked together; on failure the cursor does not move.
    fn take_prefixed<const W: usize>(&mut self) -> Result<&[u8]> {
        let start = self.read_cursor as usize;
        let available = (self.payload_len() as usize).saturating_sub(start);
        if W > available {
            return Err(PacketError::OutOfBounds {
                offset: start,
                len: W,
                available,
            });
        }

        let pos = HEADER_SIZE + start;
        let mut raw = [0u8; 8];
        raw[..W].copy_from_slice(&self.buf()[pos..pos + W]);
        let len = u64::from_le_bytes(raw) as usize;
        if len > available - W {
            return Err(PacketError::OutOfBounds {
                offset: start + W,
                len,
                available: available - W,
            });
        }

        self.read_cursor += (W + len) as u32;
        Ok(&self.buf()[pos + W..pos + W + len])
    }
}

impl Packet {
    /// Reserve room for `extra` bytes, rejecting lengths the header cannot hold.
    fn reserve(&mut self, extra: usize) -> Result<()> {
        let need = u32::try_from(extra).map_err(|_| PacketError::PayloadTooLarge {
            required: u64::from(self.payload_len()) + extra as u64,
            max: self.pool.config().max_payload_len,
        })?;
        self.assure_capacity(need)
    }

    /// Append raw bytes, growing first. Callers that write several pieces reserve
    /// the total up front so a failure leaves no partial field behind.
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.shell_mut()?.put(bytes);
        Ok(())
    }

    /// Run a read that consumes several fields, restoring the cursor if any of them
    /// fails.
    fn rewind_on_err<T>(&mut self, read: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = self.read_cursor();
        let result = read(self);
        if result.is_err() {
            if let Some(shell) = self.shell.as_deref_mut() {
                shell.read_cursor = saved;
            }
        }
        result
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.shell_mut()?.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Append one byte.
    #[inline]
    pub fn append_byte(&mut self, b: u8) -> Result<()> {
        self.write(&[b])
    }

    /// Read one byte.
    #[inline]
    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Append a bool as one byte (1 or 0).
    #[inline]
    pub fn append_bool(&mut self, b: bool) -> Result<()> {
        self.append_byte(u8::from(b))
    }

    /// Read a bool; any non-zero byte is `true`.
    #[inline]
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_byte()? != 0)
    }

    #[inline]
    pub fn append_u16(&mut self, v: u16) -> Result<()> {
        self.write(&v.to_le_bytes())
    }

    #[inline]
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    #[inline]
    pub fn append_i16(&mut self, v: i16) -> Result<()> {
        self.append_u16(v as u16)
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    #[inline]
    pub fn append_u32(&mut self, v: u32) -> Result<()> {
        self.write(&v.to_le_bytes())
    }

    #[inline]
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    #[inline]
    pub fn append_i32(&mut self, v: i32) -> Result<()> {
        self.append_u32(v as u32)
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Remove the trailing `uint32` of the payload and return it.
    ///
    /// For protocols that append a trailer (a checksum, a sequence number) after the
    /// main payload. The read cursor does not move; the trailer must not overlap
    /// bytes that were already read.
    pub fn pop_u32(&mut self) -> Result<u32> {
        let shell = self.shell_mut()?;
        let len = shell.payload_len();
        let unread = len - shell.read_cursor;
        if unread < 4 {
            return Err(PacketError::OutOfBounds {
                offset: len.saturating_sub(4) as usize,
                len: 4,
                available: unread as usize,
            });
        }

        let end = HEADER_SIZE + len as usize;
        let buf = shell.buf();
        let v = u32::from_le_bytes([buf[end - 4], buf[end - 3], buf[end - 2], buf[end - 1]]);
        shell.set_payload_len(len - 4);
        Ok(v)
    }

    #[inline]
    pub fn append_u64(&mut self, v: u64) -> Result<()> {
        self.write(&v.to_le_bytes())
    }

    #[inline]
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    #[inline]
    pub fn append_i64(&mut self, v: i64) -> Result<()> {
        self.append_u64(v as u64)
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Append an `f32` as its IEEE-754 bit pattern.
    #[inline]
    pub fn append_f32(&mut self, v: f32) -> Result<()> {
        self.append_u32(v.to_bits())
    }

    #[inline]
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Append an `f64` as its IEEE-754 bit pattern.
    #[inline]
    pub fn append_f64(&mut self, v: f64) -> Result<()> {
        self.append_u64(v.to_bits())
    }

    #[inline]
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Append raw bytes with no length prefix.
    #[inline]
    pub fn append_bytes(&mut self, v: &[u8]) -> Result<()> {
        self.write(v)
    }

    /// Read `size` raw bytes.
    ///
    /// The slice points into the packet buffer; no copy is made.
    #[inline]
    pub fn read_bytes(&mut self, size: usize) -> Result<&[u8]> {
        self.shell_mut()?.take(size)
    }

    /// Append bytes with a `uint16` length prefix.
    pub fn append_var_bytes_h(&mut self, v: &[u8]) -> Result<()> {
        check_h_len(v.len())?;
        self.reserve(2 + v.len())?;
        self.append_u16(v.len() as u16)?;
        self.append_bytes(v)
    }

    /// Read bytes with a `uint16` length prefix.
    pub fn read_var_bytes_h(&mut self) -> Result<&[u8]> {
        self.shell_mut()?.take_prefixed::<2>()
    }

    /// Append bytes with a `uint32` length prefix.
    pub fn append_var_bytes_i(&mut self, v: &[u8]) -> Result<()> {
        check_i_len(v.len())?;
        self.reserve(4 + v.len())?;
        self.append_u32(v.len() as u32)?;
        self.append_bytes(v)
    }

    /// Read bytes with a `uint32` length prefix.
    pub fn read_var_bytes_i(&mut self) -> Result<&[u8]> {
        self.shell_mut()?.take_prefixed::<4>()
    }

    /// Append a string as H-prefixed UTF-8 bytes.
    #[inline]
    pub fn append_var_str(&mut self, s: &str) -> Result<()> {
        self.append_var_bytes_h(s.as_bytes())
    }

    /// Read an H-prefixed UTF-8 string.
    pub fn read_var_str(&mut self) -> Result<String> {
        self.rewind_on_err(|p| {
            let bytes = p.read_var_bytes_h()?.to_vec();
            Ok(String::from_utf8(bytes)?)
        })
    }

    /// Append a `uint16` count followed by each string H-prefixed.
    pub fn append_string_list<S: AsRef<str>>(&mut self, list: &[S]) -> Result<()> {
        check_h_len(list.len())?;
        let mut total = 2;
        for s in list {
            let len = s.as_ref().len();
            check_h_len(len)?;
            total += 2 + len;
        }
        self.reserve(total)?;

        self.append_u16(list.len() as u16)?;
        for s in list {
            self.append_var_str(s.as_ref())?;
        }
        Ok(())
    }

    /// Read a string list written by [`Packet::append_string_list`].
    pub fn read_string_list(&mut self) -> Result<Vec<String>> {
        self.rewind_on_err(|p| {
            let count = p.read_u16()?;
            // Same bound as maps: each entry carries at least its prefix.
            let bound = p.unread_payload().len() / 2;
            let mut list = Vec::with_capacity(usize::from(count).min(bound));
            for _ in 0..count {
                list.push(p.read_var_str()?);
            }
            Ok(list)
        })
    }

    /// Append a `uint32` count followed by each key and value H-prefixed.
    ///
    /// Takes anything that yields key/value pairs with a known length: `&HashMap`,
    /// `&BTreeMap`, or a `Vec` of pairs. Entries are written in iteration order;
    /// readers must not rely on it.
    pub fn append_map_string_string<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        I::IntoIter: ExactSizeIterator + Clone,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let entries = entries.into_iter();
        let count = entries.len();
        check_i_len(count)?;
        let mut total = 4;
        for (k, v) in entries.clone() {
            let (k, v) = (k.as_ref().len(), v.as_ref().len());
            check_h_len(k)?;
            check_h_len(v)?;
            total += 4 + k + v;
        }
        self.reserve(total)?;

        self.append_u32(count as u32)?;
        for (k, v) in entries {
            self.append_var_str(k.as_ref())?;
            self.append_var_str(v.as_ref())?;
        }
        Ok(())
    }

    /// Read a map written by [`Packet::append_map_string_string`].
    ///
    /// Duplicate keys keep the last value.
    pub fn read_map_string_string(&mut self) -> Result<HashMap<String, String>> {
        self.rewind_on_err(|p| {
            let count = p.read_u32()?;
            // Every entry needs at least two prefixes; don't trust the count for capacity.
            let bound = p.unread_payload().len() / 4;
            let mut map = HashMap::with_capacity((count as usize).min(bound));
            for _ in 0..count {
                let k = p.read_var_str()?;
                let v = p.read_var_str()?;
                map.insert(k, v);
            }
            Ok(map)
        })
    }
}
