//! Pooled, reference-counted packet buffers.
//!
//! A [`Packet`] owns one byte buffer laid out as a ready-to-send wire frame:
//!
//! ```text
//! ┌──────────────┬─────────────────────────────┬───────────────────┐
//! │ Payload len  │ Payload (written)           │ Unwritten         │
//! │ 4 bytes LE   │ payload_len bytes           │ cap - payload_len │
//! └──────────────┴─────────────────────────────┴───────────────────┘
//! ```
//!
//! The length header is the only record of the payload length, so
//! [`Packet::wire_frame`] can be written to a socket without any copy.
//!
//! Small payloads live in a buffer embedded in the packet shell. Larger payloads are
//! moved into buffers borrowed from the size-classed pools of the owning
//! [`PacketPool`], and everything goes back to the pools when the last reference is
//! released.
//!
//! # Example
//!
//! ```
//! use packetconn::PacketPool;
//!
//! let pool = PacketPool::with_defaults();
//! let mut packet = pool.checkout().unwrap();
//!
//! packet.append_u32(0xDEADBEEF).unwrap();
//! packet.append_var_str("hello").unwrap();
//! packet.append_bool(true).unwrap();
//! assert_eq!(packet.payload_len(), 12);
//!
//! assert_eq!(packet.read_u32().unwrap(), 0xDEADBEEF);
//! assert_eq!(packet.read_var_str().unwrap(), "hello");
//! assert!(packet.read_bool().unwrap());
//! assert!(!packet.has_unread_payload());
//!
//! packet.release().unwrap();
//! ```

mod codec;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{PacketError, Result};
use crate::pool::buffers::alloc_buffer;
use crate::pool::PacketPool;
use crate::protocol::wire_format::{read_payload_len, write_payload_len};
use crate::protocol::HEADER_SIZE;

/// Reusable packet state, recycled through the object pool.
pub(crate) struct Shell {
    refcount: AtomicI64,
    read_cursor: u32,
    /// Buffer of the minimum class, owned for the shell's whole life.
    inline: Box<[u8]>,
    /// Larger buffer borrowed from a class pool, if the payload outgrew `inline`.
    pooled: Option<Box<[u8]>>,
}

impl Shell {
    pub(crate) fn new(min_payload_cap: u32) -> Self {
        Self {
            refcount: AtomicI64::new(0),
            read_cursor: 0,
            inline: alloc_buffer(min_payload_cap),
            pooled: None,
        }
    }

    #[inline]
    fn buf(&self) -> &[u8] {
        self.pooled.as_deref().unwrap_or(&self.inline[..])
    }

    #[inline]
    fn buf_mut(&mut self) -> &mut [u8] {
        match self.pooled.as_deref_mut() {
            Some(buf) => buf,
            None => &mut self.inline[..],
        }
    }

    #[inline]
    pub(crate) fn payload_len(&self) -> u32 {
        read_payload_len(self.buf())
    }

    #[inline]
    pub(crate) fn set_payload_len(&mut self, len: u32) {
        write_payload_len(self.buf_mut(), len);
    }

    #[inline]
    fn payload_cap(&self) -> u32 {
        (self.buf().len() - HEADER_SIZE) as u32
    }

    #[inline]
    fn refcount(&self) -> i64 {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn activate(&mut self) {
        self.refcount.store(1, Ordering::Release);
    }

    /// Detach the pooled buffer (if any) and reset to an empty payload on the inline
    /// buffer. Returns the detached buffer for the caller to give back.
    pub(crate) fn reset(&mut self) -> Option<Box<[u8]>> {
        let pooled = self.pooled.take();
        self.read_cursor = 0;
        self.set_payload_len(0);
        self.refcount.store(0, Ordering::Release);
        pooled
    }

    /// Adjust the count by `delta`; the result must stay positive.
    fn add_refcount(&self, delta: i64) -> Result<i64> {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return Err(PacketError::RefcountUnderflow { refcount: current });
            }
            let next = current.checked_add(delta).ok_or_else(|| {
                PacketError::PoolInvariant(format!("refcount overflow: {} + {}", current, delta))
            })?;
            if next < 1 {
                return Err(PacketError::RefcountUnderflow { refcount: next });
            }
            match self.refcount.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(next),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop one reference, returning the remaining count. Never goes below zero.
    fn decrement_refcount(&self) -> Result<i64> {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return Err(PacketError::RefcountUnderflow { refcount: current });
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(actual) => current = actual,
            }
        }
    }
}

/// An exclusively owned packet.
///
/// Obtained from [`PacketPool::checkout`] with a reference count of 1 and an empty
/// payload. After the count reaches zero through [`Packet::release`] the handle is
/// detached: views are empty, writes fail with [`PacketError::Released`] and further
/// releases fail with [`PacketError::RefcountUnderflow`].
///
/// Dropping a packet that was never released returns it to the pools.
pub struct Packet {
    shell: Option<Box<Shell>>,
    pool: PacketPool,
}

impl Packet {
    pub(crate) fn from_shell(shell: Box<Shell>, pool: PacketPool) -> Self {
        Self {
            shell: Some(shell),
            pool,
        }
    }

    #[inline]
    fn shell(&self) -> Option<&Shell> {
        self.shell.as_deref()
    }

    #[inline]
    fn shell_mut(&mut self) -> Result<&mut Shell> {
        self.shell.as_deref_mut().ok_or(PacketError::Released)
    }

    /// The pool this packet returns to.
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    /// Current payload length, read from the header.
    #[inline]
    pub fn payload_len(&self) -> u32 {
        self.shell().map_or(0, Shell::payload_len)
    }

    /// Current payload capacity (buffer length minus the header).
    #[inline]
    pub fn payload_cap(&self) -> u32 {
        self.shell().map_or(0, Shell::payload_cap)
    }

    /// Number of payload bytes consumed by reads.
    #[inline]
    pub fn read_cursor(&self) -> u32 {
        self.shell().map_or(0, |shell| shell.read_cursor)
    }

    /// Current reference count (0 once released).
    #[inline]
    pub fn refcount(&self) -> i64 {
        self.shell().map_or(0, Shell::refcount)
    }

    /// Check whether the final release has already happened.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.shell.is_none()
    }

    /// The written payload.
    pub fn payload(&self) -> &[u8] {
        match self.shell() {
            Some(shell) => {
                let end = HEADER_SIZE + shell.payload_len() as usize;
                &shell.buf()[HEADER_SIZE..end]
            }
            None => &[],
        }
    }

    /// The whole payload region, written or not.
    pub fn total_payload(&self) -> &[u8] {
        match self.shell() {
            Some(shell) => &shell.buf()[HEADER_SIZE..],
            None => &[],
        }
    }

    /// Writable space after the payload end.
    ///
    /// Bytes written here become payload after [`Packet::advance_payload_len`].
    pub fn unwritten_payload(&mut self) -> &mut [u8] {
        match self.shell.as_deref_mut() {
            Some(shell) => {
                let start = HEADER_SIZE + shell.payload_len() as usize;
                &mut shell.buf_mut()[start..]
            }
            None => &mut [],
        }
    }

    /// Grow the payload over `n` bytes already written into
    /// [`Packet::unwritten_payload`].
    pub fn advance_payload_len(&mut self, n: u32) -> Result<()> {
        let shell = self.shell_mut()?;
        let len = shell.payload_len();
        let free = shell.payload_cap() - len;
        if n > free {
            return Err(PacketError::OutOfBounds {
                offset: len as usize,
                len: n as usize,
                available: free as usize,
            });
        }
        shell.set_payload_len(len + n);
        Ok(())
    }

    /// Payload bytes not yet consumed by reads.
    pub fn unread_payload(&self) -> &[u8] {
        match self.shell() {
            Some(shell) => {
                let start = HEADER_SIZE + shell.read_cursor as usize;
                let end = HEADER_SIZE + shell.payload_len() as usize;
                &shell.buf()[start..end]
            }
            None => &[],
        }
    }

    /// Check whether reads have not yet reached the payload end.
    #[inline]
    pub fn has_unread_payload(&self) -> bool {
        self.shell()
            .is_some_and(|shell| shell.read_cursor < shell.payload_len())
    }

    /// Header plus payload: the exact bytes to transmit.
    pub fn wire_frame(&self) -> &[u8] {
        match self.shell() {
            Some(shell) => &shell.buf()[..HEADER_SIZE + shell.payload_len() as usize],
            None => &[],
        }
    }

    /// Copy the wire frame into an owned `Bytes`.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.wire_frame())
    }

    /// Make room for `need` more payload bytes.
    ///
    /// When the current buffer is too small, the header and payload move into the
    /// smallest scheduled class that fits and the old buffer goes back to its pool.
    pub fn assure_capacity(&mut self, need: u32) -> Result<()> {
        let Self { shell, pool } = self;
        let shell = shell.as_deref_mut().ok_or(PacketError::Released)?;

        let payload_len = shell.payload_len();
        let old_cap = shell.payload_cap();
        let required = u64::from(payload_len) + u64::from(need);
        if required <= u64::from(old_cap) {
            return Ok(());
        }

        let max = pool.config().max_payload_len;
        if required > u64::from(max) {
            return Err(PacketError::PayloadTooLarge { required, max });
        }

        let new_cap = pool.schedule().next_class(required as u32);
        let mut buffer = pool.buffers().acquire(new_cap)?;
        let used = HEADER_SIZE + payload_len as usize;
        buffer[..used].copy_from_slice(&shell.buf()[..used]);

        if let Some(old) = shell.pooled.replace(buffer) {
            pool.buffers().release(old_cap, old)?;
        }

        tracing::trace!(old_cap, new_cap, "packet capacity upgraded");
        Ok(())
    }

    /// Add `delta` references.
    ///
    /// Call this before handing the same packet to additional owners; each owner then
    /// calls [`Packet::release`] (or [`SharedPacket::release`]) once. The count must
    /// stay positive; dropping references goes through `release`.
    pub fn add_refcount(&self, delta: i64) -> Result<()> {
        let shell = self
            .shell()
            .ok_or(PacketError::RefcountUnderflow { refcount: 0 })?;
        shell.add_refcount(delta).map(|_| ())
    }

    /// Drop one reference. The last release returns the buffer and the shell to
    /// their pools.
    pub fn release(&mut self) -> Result<()> {
        let shell = self
            .shell()
            .ok_or(PacketError::RefcountUnderflow { refcount: 0 })?;
        if shell.decrement_refcount()? == 0 {
            self.recycle()?;
        }
        Ok(())
    }

    /// Reset payload length and read cursor without touching the buffer.
    ///
    /// The capacity is kept, so the same owner can reuse the packet for the next
    /// round-trip.
    pub fn clear_payload(&mut self) {
        if let Some(shell) = self.shell.as_deref_mut() {
            shell.read_cursor = 0;
            shell.set_payload_len(0);
        }
    }

    /// Convert into a handle that can be shared across threads.
    pub fn into_shared(self) -> SharedPacket {
        SharedPacket {
            packet: Arc::new(self),
        }
    }

    fn recycle(&mut self) -> Result<()> {
        match self.shell.take() {
            Some(shell) => self.pool.recycle(shell),
            None => Ok(()),
        }
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        let Some(shell) = self.shell() else {
            return;
        };
        let refcount = shell.refcount();
        if refcount > 1 {
            tracing::warn!(refcount, "packet dropped with outstanding references");
        }
        if let Err(e) = self.recycle() {
            tracing::error!("Failed to recycle dropped packet: {}", e);
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("payload_len", &self.payload_len())
            .field("payload_cap", &self.payload_cap())
            .field("read_cursor", &self.read_cursor())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// A read-only packet handle for fan-out to several owners.
///
/// Each handle accounts for one reference. [`SharedPacket::share`] adds a reference
/// and returns a new handle; [`SharedPacket::release`] consumes a handle, and the one
/// that brings the count to zero recycles the packet.
pub struct SharedPacket {
    packet: Arc<Packet>,
}

impl SharedPacket {
    /// Add a reference and return a handle for it.
    pub fn share(&self) -> Result<SharedPacket> {
        self.packet.add_refcount(1)?;
        Ok(Self {
            packet: Arc::clone(&self.packet),
        })
    }

    /// Drop this handle's reference.
    pub fn release(self) -> Result<()> {
        let shell = self
            .packet
            .shell()
            .ok_or(PacketError::RefcountUnderflow { refcount: 0 })?;
        if shell.decrement_refcount()? == 0 {
            // Handles dropped without release still hold the Arc; the last of
            // them recycles through `Drop`.
            if let Ok(mut packet) = Arc::try_unwrap(self.packet) {
                packet.recycle()?;
            }
        }
        Ok(())
    }

    /// Recover exclusive, mutable access when this is the only reference.
    pub fn try_into_exclusive(self) -> std::result::Result<Packet, SharedPacket> {
        if self.packet.refcount() != 1 {
            return Err(self);
        }
        Arc::try_unwrap(self.packet).map_err(|packet| SharedPacket { packet })
    }

    /// Current reference count.
    #[inline]
    pub fn refcount(&self) -> i64 {
        self.packet.refcount()
    }

    /// Current payload length.
    #[inline]
    pub fn payload_len(&self) -> u32 {
        self.packet.payload_len()
    }

    /// The written payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        self.packet.payload()
    }

    /// Header plus payload: the exact bytes to transmit.
    #[inline]
    pub fn wire_frame(&self) -> &[u8] {
        self.packet.wire_frame()
    }
}

impl fmt::Debug for SharedPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedPacket").field(&*self.packet).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn pool() -> PacketPool {
        PacketPool::with_defaults()
    }

    #[test]
    fn test_checkout_state() {
        let pool = pool();
        let packet = pool.checkout().unwrap();
        assert_eq!(packet.refcount(), 1);
        assert_eq!(packet.payload_len(), 0);
        assert_eq!(packet.read_cursor(), 0);
        assert_eq!(packet.payload_cap(), 128);
        assert!(packet.payload().is_empty());
        assert_eq!(packet.wire_frame(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_wire_frame_is_header_plus_payload() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(b"abc").unwrap();
        assert_eq!(packet.wire_frame(), &[3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(&packet.to_bytes()[..], packet.wire_frame());
    }

    #[test]
    fn test_growth_to_smallest_sufficient_class() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(&[7u8; 500]).unwrap();
        assert_eq!(packet.payload_cap(), 512);
        assert_eq!(packet.payload_len(), 500);
        assert_eq!(pool.buffers().buffers_created(), 1);
    }

    #[test]
    fn test_growth_preserves_existing_bytes() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        let first: Vec<u8> = (0..100).collect();
        packet.append_bytes(&first).unwrap();
        let before = packet.wire_frame().to_vec();

        packet.append_bytes(&[0xEE; 3000]).unwrap();
        assert_eq!(packet.payload_cap(), 8192);
        // Everything after the header is untouched by the move.
        assert_eq!(
            &packet.wire_frame()[HEADER_SIZE..before.len()],
            &before[HEADER_SIZE..]
        );
        assert_eq!(&packet.payload()[..100], &first[..]);
        assert_eq!(&packet.wire_frame()[..HEADER_SIZE], &3100u32.to_le_bytes());
        assert_eq!(packet.payload_len(), 3100);
    }

    #[test]
    fn test_growth_returns_old_pooled_buffer() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(&[1u8; 300]).unwrap();
        assert_eq!(packet.payload_cap(), 512);
        packet.append_bytes(&[2u8; 300]).unwrap();
        assert_eq!(packet.payload_cap(), 2048);
        assert_eq!(pool.buffers().idle(512), 1);
    }

    #[test]
    fn test_growth_beyond_max_is_rejected() {
        let config = PoolConfig::new().with_max_payload_len(1000);
        let pool = PacketPool::new(config).unwrap();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(&[0u8; 1000]).unwrap();
        assert_eq!(packet.payload_cap(), 1000);

        let result = packet.append_byte(1);
        assert!(matches!(
            result,
            Err(PacketError::PayloadTooLarge { required: 1001, max: 1000 })
        ));
        assert_eq!(packet.payload_len(), 1000);
    }

    #[test]
    fn test_refcount_scenario() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_u32(1).unwrap();

        packet.add_refcount(2).unwrap();
        packet.release().unwrap();
        packet.release().unwrap();
        assert_eq!(packet.refcount(), 1);
        assert_eq!(packet.read_u32().unwrap(), 1);

        packet.release().unwrap();
        assert_eq!(packet.refcount(), 0);
        assert!(packet.is_released());
        assert_eq!(pool.stats().idle_shells, 1);
    }

    #[test]
    fn test_double_release_is_underflow() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.release().unwrap();
        let result = packet.release();
        assert!(matches!(result, Err(PacketError::RefcountUnderflow { refcount: 0 })));
    }

    #[test]
    fn test_add_refcount_cannot_reach_zero() {
        let pool = pool();
        let packet = pool.checkout().unwrap();
        assert!(matches!(
            packet.add_refcount(-1),
            Err(PacketError::RefcountUnderflow { refcount: 0 })
        ));
        assert_eq!(packet.refcount(), 1);
    }

    #[test]
    fn test_released_handle_is_inert() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(b"data").unwrap();
        packet.release().unwrap();

        assert!(packet.payload().is_empty());
        assert!(packet.wire_frame().is_empty());
        assert!(packet.unwritten_payload().is_empty());
        assert!(!packet.has_unread_payload());
        assert!(matches!(packet.append_byte(1), Err(PacketError::Released)));
        assert!(matches!(packet.read_byte(), Err(PacketError::Released)));
        assert!(packet.add_refcount(1).is_err());
    }

    #[test]
    fn test_release_returns_buffer_and_shell() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(&[0u8; 1000]).unwrap();
        assert_eq!(packet.payload_cap(), 2048);
        packet.release().unwrap();

        assert_eq!(pool.buffers().idle(2048), 1);
        assert_eq!(pool.stats().idle_shells, 1);

        let reused = pool.checkout().unwrap();
        assert_eq!(reused.payload_len(), 0);
        assert_eq!(reused.payload_cap(), 128);
        assert_eq!(reused.refcount(), 1);
        assert_eq!(pool.stats().shells_created, 1);
    }

    #[test]
    fn test_drop_recycles_unreleased_packet() {
        let pool = pool();
        {
            let mut packet = pool.checkout().unwrap();
            packet.append_bytes(&[0u8; 200]).unwrap();
        }
        assert_eq!(pool.stats().idle_shells, 1);
        assert_eq!(pool.buffers().idle(512), 1);
    }

    #[test]
    fn test_clear_payload_keeps_capacity() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(&[9u8; 600]).unwrap();
        packet.read_bytes(10).unwrap();

        packet.clear_payload();
        assert_eq!(packet.payload_len(), 0);
        assert_eq!(packet.read_cursor(), 0);
        assert!(!packet.has_unread_payload());
        assert_eq!(packet.payload_cap(), 2048);

        packet.clear_payload();
        assert_eq!(packet.payload_len(), 0);
    }

    #[test]
    fn test_unwritten_payload_direct_write() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_u16(1).unwrap();

        let unwritten = packet.unwritten_payload();
        assert_eq!(unwritten.len(), 126);
        unwritten[..3].copy_from_slice(b"xyz");
        packet.advance_payload_len(3).unwrap();

        assert_eq!(&packet.payload()[2..], b"xyz");
        assert!(packet.advance_payload_len(124).is_err());
    }

    #[test]
    fn test_unread_payload_tracks_cursor() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(b"hello").unwrap();
        assert_eq!(packet.unread_payload(), b"hello");
        packet.read_bytes(2).unwrap();
        assert_eq!(packet.unread_payload(), b"llo");
        assert_eq!(packet.total_payload().len(), 128);
    }

    #[test]
    fn test_shared_fan_out() {
        let pool = pool();
        let mut packet = pool.checkout().unwrap();
        packet.append_bytes(&[5u8; 700]).unwrap();
        let shared = packet.into_shared();

        let handles: Vec<_> = (0..4).map(|_| shared.share().unwrap()).collect();
        assert_eq!(shared.refcount(), 5);

        std::thread::scope(|s| {
            for handle in handles {
                s.spawn(move || {
                    assert_eq!(handle.payload().len(), 700);
                    handle.release().unwrap();
                });
            }
        });

        assert_eq!(shared.refcount(), 1);
        assert_eq!(pool.stats().idle_shells, 0);
        shared.release().unwrap();
        assert_eq!(pool.stats().idle_shells, 1);
        assert_eq!(pool.buffers().idle(2048), 1);
    }

    #[test]
    fn test_shared_try_into_exclusive() {
        let pool = pool();
        let shared = pool.checkout().unwrap().into_shared();
        let other = shared.share().unwrap();

        let shared = shared.try_into_exclusive().unwrap_err();
        other.release().unwrap();

        let mut packet = shared.try_into_exclusive().unwrap();
        packet.append_byte(1).unwrap();
        assert_eq!(packet.refcount(), 1);
    }

    #[test]
    fn test_debug_format() {
        let pool = pool();
        let packet = pool.checkout().unwrap();
        let text = format!("{:?}", packet);
        assert!(text.contains("payload_len: 0"));
        assert!(text.contains("refcount: 1"));
    }
}
