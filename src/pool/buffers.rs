//! Size-classed buffer pools.
//!
//! One lock-free free-list per capacity class above the minimum. Each pooled buffer
//! is exactly `HEADER_SIZE + class` bytes. The minimum class is never pooled: packets
//! carry that buffer inline, so acquiring or releasing it bypasses the free-lists.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

use super::schedule::CapacitySchedule;
use crate::error::{PacketError, Result};
use crate::protocol::HEADER_SIZE;

/// Free-list for a single capacity class.
struct ClassPool {
    capacity: u32,
    free: ArrayQueue<Box<[u8]>>,
    created: AtomicU64,
}

impl ClassPool {
    fn new(capacity: u32, max_idle: usize) -> Self {
        Self {
            capacity,
            free: ArrayQueue::new(max_idle),
            created: AtomicU64::new(0),
        }
    }

    #[inline]
    fn buffer_len(&self) -> usize {
        HEADER_SIZE + self.capacity as usize
    }
}

/// Allocate a zeroed buffer for `capacity` payload bytes plus the header.
#[inline]
pub(crate) fn alloc_buffer(capacity: u32) -> Box<[u8]> {
    vec![0u8; HEADER_SIZE + capacity as usize].into_boxed_slice()
}

/// Registry of buffer pools, one per capacity class.
pub struct BufferPoolSet {
    min_class: u32,
    /// Pools for every class above the minimum, ascending by capacity.
    pools: Vec<ClassPool>,
}

impl BufferPoolSet {
    /// Create an empty pool for every class of `schedule`, each holding at most
    /// `max_idle` buffers.
    pub fn new(schedule: &CapacitySchedule, max_idle: usize) -> Result<Self> {
        if max_idle == 0 {
            return Err(PacketError::Config(
                "idle pool bounds must be greater than 0".to_string(),
            ));
        }
        Ok(Self::with_bound(schedule, max_idle))
    }

    /// Same as [`BufferPoolSet::new`] for a bound already known to be non-zero.
    pub(crate) fn with_bound(schedule: &CapacitySchedule, max_idle: usize) -> Self {
        let min_class = schedule.min_class();
        let pools = schedule
            .classes()
            .iter()
            .copied()
            .filter(|&cap| cap > min_class)
            .map(|cap| ClassPool::new(cap, max_idle))
            .collect();

        Self { min_class, pools }
    }

    /// Look up the pool for `class`. `Ok(None)` means the unpooled minimum class.
    fn pool(&self, class: u32) -> Result<Option<&ClassPool>> {
        if class == self.min_class {
            return Ok(None);
        }
        match self.pools.binary_search_by_key(&class, |pool| pool.capacity) {
            Ok(idx) => Ok(Some(&self.pools[idx])),
            Err(_) => Err(PacketError::PoolInvariant(format!(
                "capacity {} is not a scheduled class",
                class
            ))),
        }
    }

    /// Lend a buffer of `HEADER_SIZE + class` bytes.
    ///
    /// Contents are unspecified; the caller initializes the header.
    pub fn acquire(&self, class: u32) -> Result<Box<[u8]>> {
        let Some(pool) = self.pool(class)? else {
            return Ok(alloc_buffer(class));
        };

        if let Some(buf) = pool.free.pop() {
            return Ok(buf);
        }

        pool.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(class, "allocating new pooled buffer");
        Ok(alloc_buffer(class))
    }

    /// Return a buffer to the pool of `class`.
    ///
    /// The buffer length must be exactly `HEADER_SIZE + class`.
    pub fn release(&self, class: u32, buf: Box<[u8]>) -> Result<()> {
        let expected = HEADER_SIZE + class as usize;
        if buf.len() != expected {
            tracing::error!(class, len = buf.len(), "buffer returned to wrong class");
            return Err(PacketError::PoolInvariant(format!(
                "buffer size should be {}, but is {}",
                expected,
                buf.len()
            )));
        }

        let Some(pool) = self.pool(class)? else {
            return Ok(());
        };
        debug_assert_eq!(pool.buffer_len(), expected);

        if pool.free.push(buf).is_err() {
            tracing::debug!(class, "buffer pool full, dropping buffer");
        }
        Ok(())
    }

    /// Number of idle buffers held for `class` (0 for the minimum or unknown classes).
    pub fn idle(&self, class: u32) -> usize {
        match self.pool(class) {
            Ok(Some(pool)) => pool.free.len(),
            _ => 0,
        }
    }

    /// Idle buffer count for every pooled class, ascending.
    pub fn idle_counts(&self) -> Vec<(u32, usize)> {
        self.pools
            .iter()
            .map(|pool| (pool.capacity, pool.free.len()))
            .collect()
    }

    /// Total buffers allocated by all class pools since creation.
    pub fn buffers_created(&self) -> u64 {
        self.pools
            .iter()
            .map(|pool| pool.created.load(Ordering::Relaxed))
            .sum()
    }
}
