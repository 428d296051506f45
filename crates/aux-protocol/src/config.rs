//! Link timing configuration

use serde::{Deserialize, Serialize};

/// Maximum time between the start byte and the last byte of a frame
pub const RECEIVE_TIMEOUT_MS: u64 = 150;

/// Interval between status refreshes once the unit is known to be present
pub const STATUS_POLL_INTERVAL_MS: u64 = 7000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub receive_timeout_ms: u64,
    /// Timeout for sequence steps that do not carry their own; zero selects
    /// the 500 ms default
    pub step_timeout_ms: u64,
    /// `None` turns periodic status polling off
    pub poll_interval_ms: Option<u64>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: RECEIVE_TIMEOUT_MS,
            step_timeout_ms: crate::sequence::DEFAULT_STEP_TIMEOUT_MS,
            poll_interval_ms: Some(STATUS_POLL_INTERVAL_MS),
        }
    }
}
