//! Pools backing packet allocation.
//!
//! - [`CapacitySchedule`]: the ladder of buffer capacities
//! - [`BufferPoolSet`]: one free-list of buffers per capacity class
//! - [`PacketPool`]: recycles packet shells and owns the two above

pub mod buffers;
mod packets;
pub mod schedule;

pub use buffers::BufferPoolSet;
pub use packets::{PacketPool, PoolStats};
pub use schedule::CapacitySchedule;
