//! Packet object pool.
//!
//! A [`PacketPool`] hands out packets with a reference count of 1 and takes them
//! back on the final release. Shells (the inline buffer plus bookkeeping) are kept
//! on a bounded lock-free queue; larger buffers go back to the [`BufferPoolSet`].
//!
//! The handle is cheap to clone and every packet carries one, so packets always
//! return to the pool they came from.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crossbeam_queue::ArrayQueue;

use super::buffers::BufferPoolSet;
use super::schedule::CapacitySchedule;
use crate::config::PoolConfig;
use crate::error::{PacketError, Result};
use crate::packet::{Packet, Shell};
use crate::protocol::HEADER_SIZE;

static GLOBAL: OnceLock<PacketPool> = OnceLock::new();

struct PoolInner {
    config: PoolConfig,
    schedule: CapacitySchedule,
    buffers: BufferPoolSet,
    shells: ArrayQueue<Box<Shell>>,
    shells_created: AtomicU64,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Shells waiting for reuse.
    pub idle_shells: usize,
    /// Idle buffers per pooled capacity class, ascending.
    pub idle_buffers: Vec<(u32, usize)>,
    /// Shells allocated since the pool was built.
    pub shells_created: u64,
    /// Class buffers allocated since the pool was built.
    pub buffers_created: u64,
}

/// Shared handle to a packet pool.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PoolInner>,
}

impl PacketPool {
    /// Build a pool for a validated configuration.
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let pool = Self::build(config);
        tracing::debug!(
            min_payload_cap = pool.config().min_payload_cap,
            max_payload_len = pool.config().max_payload_len,
            classes = pool.schedule().classes().len(),
            "packet pool created"
        );
        Ok(pool)
    }

    /// Build a pool with the default configuration.
    pub fn with_defaults() -> Self {
        Self::build(PoolConfig::default())
    }

    /// Assemble a pool from a configuration that already passed validation.
    fn build(config: PoolConfig) -> Self {
        let schedule = CapacitySchedule::from_validated(&config);
        Self {
            inner: Arc::new(PoolInner {
                buffers: BufferPoolSet::with_bound(&schedule, config.max_idle_buffers),
                shells: ArrayQueue::new(config.max_idle_shells),
                shells_created: AtomicU64::new(0),
                config,
                schedule,
            }),
        }
    }

    /// The process-wide pool with the default configuration.
    pub fn global() -> &'static PacketPool {
        GLOBAL.get_or_init(PacketPool::with_defaults)
    }

    /// Take a packet with an empty payload and a reference count of 1.
    pub fn checkout(&self) -> Result<Packet> {
        let mut shell = match self.inner.shells.pop() {
            Some(shell) => shell,
            None => {
                self.inner.shells_created.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("allocating new packet shell");
                Box::new(Shell::new(self.inner.config.min_payload_cap))
            }
        };

        let len = shell.payload_len();
        if len != 0 {
            tracing::error!(len, "pooled packet shell has a non-empty payload");
            return Err(PacketError::PoolInvariant(format!(
                "pooled packet has payload_len {}",
                len
            )));
        }

        shell.activate();
        Ok(Packet::from_shell(shell, self.clone()))
    }

    /// Give a shell back after its last reference is gone.
    ///
    /// Any class buffer the shell holds returns to its pool first. The shell is
    /// dropped if the idle queue is full.
    pub(crate) fn recycle(&self, mut shell: Box<Shell>) -> Result<()> {
        let pooled = shell.reset();
        let returned = match pooled {
            Some(buf) => {
                let class = (buf.len() - HEADER_SIZE) as u32;
                self.inner.buffers.release(class, buf)
            }
            None => Ok(()),
        };

        if self.inner.shells.push(shell).is_err() {
            tracing::debug!("packet pool full, dropping shell");
        }
        returned
    }

    /// The configuration this pool was built with.
    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// The capacity schedule derived from the configuration.
    #[inline]
    pub fn schedule(&self) -> &CapacitySchedule {
        &self.inner.schedule
    }

    /// The buffer pools behind packet growth.
    #[inline]
    pub fn buffers(&self) -> &BufferPoolSet {
        &self.inner.buffers
    }

    /// Current occupancy counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle_shells: self.inner.shells.len(),
            idle_buffers: self.inner.buffers.idle_counts(),
            shells_created: self.inner.shells_created.load(Ordering::Relaxed),
            buffers_created: self.inner.buffers.buffers_created(),
        }
    }

    /// Check whether two handles refer to the same pool.
    #[inline]
    pub fn same_pool(&self, other: &PacketPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketPool")
            .field("config", &self.inner.config)
            .field("idle_shells", &self.inner.shells.len())
            .finish()
    }
}
