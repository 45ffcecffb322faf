//! # Queue Configuration
//!
//! Limits and timeouts for the command queue services.

use static_assertions::const_assert;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Largest command record (header, sync arrays and payload) in bytes
pub const DEFAULT_MAX_COMMAND_SIZE: u32 = 1024;

/// Number of hardware device indices the processor table accepts
pub const DEFAULT_MAX_DEVICES: u32 = 16;

/// Longest the hardware is expected to take for anything, in microseconds
pub const MAX_HW_TIME_US: u64 = 500_000;

/// Polls per bounded wait
pub const WAIT_TRY_COUNT: u64 = 10_000;

const_assert!(DEFAULT_MAX_COMMAND_SIZE.is_power_of_two());
const_assert!(MAX_HW_TIME_US / WAIT_TRY_COUNT > 0);

// =============================================================================
// QUEUE CONFIG
// =============================================================================

/// Command queue configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Largest command record in bytes (also the per-queue slack area)
    pub max_command_size: u32,
    /// Exclusive upper bound on device indices
    pub max_devices: u32,
    /// Bounded wait for free queue space
    pub space_timeout_us: u64,
    /// Bounded wait for a queue to drain on destroy
    pub drain_timeout_us: u64,
    /// Sleep slice between polls
    pub poll_interval_us: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_command_size: DEFAULT_MAX_COMMAND_SIZE,
            max_devices: DEFAULT_MAX_DEVICES,
            space_timeout_us: MAX_HW_TIME_US,
            drain_timeout_us: MAX_HW_TIME_US,
            poll_interval_us: MAX_HW_TIME_US / WAIT_TRY_COUNT,
        }
    }
}

impl QueueConfig {
    /// Set the maximum command size
    pub fn with_max_command_size(mut self, bytes: u32) -> Self {
        self.max_command_size = bytes;
        self
    }

    /// Set the number of device indices
    pub fn with_max_devices(mut self, count: u32) -> Self {
        self.max_devices = count;
        self
    }

    /// Set the free-space wait bound
    pub fn with_space_timeout_us(mut self, us: u64) -> Self {
        self.space_timeout_us = us;
        self
    }

    /// Set the drain wait bound
    pub fn with_drain_timeout_us(mut self, us: u64) -> Self {
        self.drain_timeout_us = us;
        self
    }

    /// Set the poll slice
    pub fn with_poll_interval_us(mut self, us: u64) -> Self {
        self.poll_interval_us = us;
        self
    }

    /// Check internal consistency
    pub fn is_valid(&self) -> bool {
        self.max_command_size >= 4
            && self.max_command_size % 4 == 0
            && self.max_devices > 0
            && self.poll_interval_us > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_command_size, 1024);
        assert_eq!(config.space_timeout_us, 500_000);
        assert_eq!(config.poll_interval_us, 50);
        assert!(config.is_valid());
    }

    #[test]
    fn test_builder() {
        let config = QueueConfig::default()
            .with_max_command_size(256)
            .with_drain_timeout_us(1_000)
            .with_poll_interval_us(10);
        assert_eq!(config.max_command_size, 256);
        assert_eq!(config.drain_timeout_us, 1_000);
        assert!(config.is_valid());

        assert!(!config.with_max_command_size(6).is_valid());
        assert!(!config.with_poll_interval_us(0).is_valid());
    }
}
