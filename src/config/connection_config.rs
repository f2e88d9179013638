use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::bluetooth::{CONNECT_RETRY_DELAY_MS, LINK_POLL_INTERVAL_MS, MAX_CONNECT_RETRIES};

/// Connection settings configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// `autoConnect` used when a connect command does not specify it
    pub default_auto_connect: bool,
    /// Attempts made for an auto-connect link before giving up
    pub max_connect_retries: u32,
    /// Delay between two connection attempts, in milliseconds
    pub connect_retry_delay_ms: u64,
    /// How often a backend without link callbacks checks that a link is alive, in milliseconds
    pub link_poll_interval_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            default_auto_connect: false,
            max_connect_retries: MAX_CONNECT_RETRIES,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            link_poll_interval_ms: LINK_POLL_INTERVAL_MS,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn link_poll_interval(&self) -> Duration {
        Duration::from_millis(self.link_poll_interval_ms.max(1))
    }
}
