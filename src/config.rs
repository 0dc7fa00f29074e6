//! Pool configuration.
//!
//! The three sizing constants (minimum capacity, growth shift, maximum payload
//! length) are fixed when a [`PacketPool`](crate::PacketPool) is built. Only the
//! maximum payload length matters on the wire; communicating endpoints must agree on
//! it. The capacity schedule derived from the other two is a local allocation detail.

use crate::error::{PacketError, Result};
use crate::protocol::{
    ABSOLUTE_MAX_PAYLOAD_LEN, DEFAULT_CAP_GROW_SHIFT, DEFAULT_MAX_PAYLOAD_LEN,
    DEFAULT_MIN_PAYLOAD_CAP,
};

/// Default number of idle packet shells kept for reuse.
pub const DEFAULT_MAX_IDLE_SHELLS: usize = 8192;

/// Default number of idle buffers kept per capacity class.
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 256;

/// Configuration for a packet pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Payload capacity of the buffer every packet carries inline.
    pub min_payload_cap: u32,
    /// Each capacity class is the previous one shifted left by this many bits.
    pub cap_grow_shift: u32,
    /// Hard ceiling on payload length.
    pub max_payload_len: u32,
    /// Idle packet shells kept before returned shells are dropped.
    pub max_idle_shells: usize,
    /// Idle buffers kept per class before returned buffers are dropped.
    pub max_idle_buffers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_payload_cap: DEFAULT_MIN_PAYLOAD_CAP,
            cap_grow_shift: DEFAULT_CAP_GROW_SHIFT,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            max_idle_shells: DEFAULT_MAX_IDLE_SHELLS,
            max_idle_buffers: DEFAULT_MAX_IDLE_BUFFERS,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the inline (minimum) payload capacity.
    pub fn with_min_payload_cap(mut self, cap: u32) -> Self {
        self.min_payload_cap = cap;
        self
    }

    /// Set the growth shift between capacity classes.
    pub fn with_cap_grow_shift(mut self, shift: u32) -> Self {
        self.cap_grow_shift = shift;
        self
    }

    /// Set the maximum payload length.
    pub fn with_max_payload_len(mut self, len: u32) -> Self {
        self.max_payload_len = len;
        self
    }

    /// Set how many idle shells the object pool retains.
    pub fn with_max_idle_shells(mut self, count: usize) -> Self {
        self.max_idle_shells = count;
        self
    }

    /// Set how many idle buffers each class pool retains.
    pub fn with_max_idle_buffers(mut self, count: usize) -> Self {
        self.max_idle_buffers = count;
        self
    }

    /// Check the configuration for values that cannot produce a usable schedule.
    pub fn validate(&self) -> Result<()> {
        if self.min_payload_cap == 0 {
            return Err(PacketError::Config(
                "min_payload_cap must be greater than 0".to_string(),
            ));
        }

        if self.cap_grow_shift == 0 || self.cap_grow_shift >= 16 {
            return Err(PacketError::Config(format!(
                "cap_grow_shift must be in 1..16, got {}",
                self.cap_grow_shift
            )));
        }

        if self.max_payload_len < self.min_payload_cap {
            return Err(PacketError::Config(format!(
                "max_payload_len {} is below min_payload_cap {}",
                self.max_payload_len, self.min_payload_cap
            )));
        }

        if self.max_payload_len > ABSOLUTE_MAX_PAYLOAD_LEN {
            return Err(PacketError::Config(format!(
                "max_payload_len {} exceeds absolute maximum {}",
                self.max_payload_len, ABSOLUTE_MAX_PAYLOAD_LEN
            )));
        }

        if self.max_idle_shells == 0 || self.max_idle_buffers == 0 {
            return Err(PacketError::Config(
                "idle pool bounds must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
