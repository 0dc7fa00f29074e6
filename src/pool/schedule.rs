//! Capacity schedule.
//!
//! Payload capacities grow geometrically from the inline minimum:
//! `min, min << shift, min << 2*shift, ...` while below the maximum payload length,
//! with the maximum itself appended as the final catch-all class. Buffers only ever
//! come in these sizes, so a returned buffer always fits exactly one pool.

use crate::config::PoolConfig;
use crate::error::Result;

/// Ascending list of the payload capacities a packet buffer may have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacitySchedule {
    classes: Vec<u32>,
}

impl CapacitySchedule {
    /// Build the schedule for a configuration.
    ///
    /// Fails with [`PacketError::Config`] if the configuration does not validate.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    /// Build the schedule for a configuration that already passed
    /// [`PoolConfig::validate`].
    pub(crate) fn from_validated(config: &PoolConfig) -> Self {
        let max = config.max_payload_len;
        let mut classes = Vec::new();

        let mut cap = u64::from(config.min_payload_cap);
        while cap < u64::from(max) {
            classes.push(cap as u32);
            cap <<= config.cap_grow_shift;
        }
        classes.push(max);

        Self { classes }
    }

    /// Smallest class that can hold `payload_len` bytes.
    ///
    /// Lengths above the maximum resolve to the maximum class; callers are expected
    /// to reject such payloads.
    ///
    /// # Example
    ///
    /// ```
    /// use packetconn::{CapacitySchedule, PoolConfig};
    ///
    /// let schedule = CapacitySchedule::new(&PoolConfig::default()).unwrap();
    /// assert_eq!(schedule.next_class(100), 128);
    /// assert_eq!(schedule.next_class(500), 512);
    /// assert_eq!(schedule.next_class(512), 512);
    /// ```
    #[inline]
    pub fn next_class(&self, payload_len: u32) -> u32 {
        let idx = self.classes.partition_point(|&cap| cap < payload_len);
        self.classes.get(idx).copied().unwrap_or(self.max_class())
    }

    /// The inline (smallest) class.
    #[inline]
    pub fn min_class(&self) -> u32 {
        self.classes[0]
    }

    /// The catch-all (largest) class, equal to the maximum payload length.
    #[inline]
    pub fn max_class(&self) -> u32 {
        self.classes[self.classes.len() - 1]
    }

    /// Check whether `cap` is one of the scheduled classes.
    #[inline]
    pub fn contains(&self, cap: u32) -> bool {
        self.classes.binary_search(&cap).is_ok()
    }

    /// All classes, ascending.
    pub fn classes(&self) -> &[u32] {
        &self.classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PacketError;

    #[test]
    fn test_default_schedule() {
        let schedule = CapacitySchedule::new(&PoolConfig::default()).unwrap();
        assert_eq!(
            schedule.classes(),
            &[
                128,
                512,
                2048,
                8192,
                32768,
                131_072,
                524_288,
                2_097_152,
                8_388_608,
                33_554_432
            ]
        );
        assert_eq!(schedule.min_class(), 128);
        assert_eq!(schedule.max_class(), 32 * 1024 * 1024);
    }

    #[test]
    fn test_max_not_on_growth_curve() {
        let config = PoolConfig::new()
            .with_min_payload_cap(100)
            .with_cap_grow_shift(1)
            .with_max_payload_len(1000);
        let schedule = CapacitySchedule::new(&config).unwrap();
        assert_eq!(schedule.classes(), &[100, 200, 400, 800, 1000]);
    }

    #[test]
    fn test_single_class_when_min_equals_max() {
        let config = PoolConfig::new()
            .with_min_payload_cap(256)
            .with_max_payload_len(256);
        let schedule = CapacitySchedule::new(&config).unwrap();
        assert_eq!(schedule.classes(), &[256]);
        assert_eq!(schedule.next_class(0), 256);
        assert_eq!(schedule.next_class(10_000), 256);
    }

    #[test]
    fn test_next_class_boundaries() {
        let schedule = CapacitySchedule::new(&PoolConfig::default()).unwrap();
        assert_eq!(schedule.next_class(0), 128);
        assert_eq!(schedule.next_class(128), 128);
        assert_eq!(schedule.next_class(129), 512);
        assert_eq!(schedule.next_class(2048), 2048);
        assert_eq!(schedule.next_class(2049), 8192);
    }

    #[test]
    fn test_next_class_above_max_returns_max() {
        let schedule = CapacitySchedule::new(&PoolConfig::default()).unwrap();
        assert_eq!(schedule.next_class(u32::MAX), schedule.max_class());
    }

    #[test]
    fn test_next_class_is_monotonic() {
        let config = PoolConfig::new().with_max_payload_len(100_000);
        let schedule = CapacitySchedule::new(&config).unwrap();
        let mut prev = 0;
        for len in (0..120_000).step_by(97) {
            let class = schedule.next_class(len);
            assert!(class >= prev);
            prev = class;
        }
    }

    #[test]
    fn test_contains() {
        let schedule = CapacitySchedule::new(&PoolConfig::default()).unwrap();
        assert!(schedule.contains(512));
        assert!(!schedule.contains(513));
    }

    #[test]
    fn test_no_overflow_near_u32_max() {
        let config = PoolConfig::new()
            .with_cap_grow_shift(15)
            .with_max_payload_len(crate::protocol::ABSOLUTE_MAX_PAYLOAD_LEN);
        let schedule = CapacitySchedule::new(&config).unwrap();
        assert!(schedule.classes().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(schedule.max_class(), crate::protocol::ABSOLUTE_MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let zero_min = PoolConfig::new()
            .with_min_payload_cap(0)
            .with_max_payload_len(1000);
        let zero_shift = PoolConfig::new().with_cap_grow_shift(0);
        let wide_shift = PoolConfig::new().with_cap_grow_shift(64);
        let inverted = PoolConfig::new()
            .with_min_payload_cap(512)
            .with_max_payload_len(256);

        for config in [zero_min, zero_shift, wide_shift, inverted] {
            assert!(matches!(
                CapacitySchedule::new(&config),
                Err(PacketError::Config(_))
            ));
        }
    }
}
