//! Synchronizer configuration.

use std::time::Duration;

/// Live-object synchronization configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Period of the background re-broadcast timer
    pub background_update_interval: Duration,
    /// Window during which throttled sends are coalesced
    pub throttle_delay: Duration,
    /// Global switch for periodic and connect-reply broadcasts
    pub can_send_background_updates: bool,
    /// Buffered manager events per subscriber
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            background_update_interval: Duration::from_secs(10),
            throttle_delay: Duration::from_millis(20),
            can_send_background_updates: true,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn with_background_interval(mut self, interval: Duration) -> Self {
        self.background_update_interval = interval;
        self
    }

    pub fn with_throttle_delay(mut self, delay: Duration) -> Self {
        self.throttle_delay = delay;
        self
    }

    pub fn with_background_updates(mut self, enabled: bool) -> Self {
        self.can_send_background_updates = enabled;
        self
    }
}
