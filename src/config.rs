//! Tunables for the sync engine and the connectivity-triggered driver.

use std::time::Duration;

/// Retry pacing and timeout policy shared by the sync engine and driver.
///
/// The defaults are: 2 s base retry delay doubling per failure up to a 60 s
/// cap, a 30 s drain interval while online, a 10 s bound on each remote
/// call, and at most 50 queue rows claimed per drain pass. The attempt cap
/// (5 by default) lives on each queue row; see `sync::DEFAULT_MAX_ATTEMPTS`.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Delay before the first retry; doubles on each subsequent failure.
    pub base_retry_delay: Duration,
    /// Upper bound for the computed retry delay.
    pub max_retry_delay: Duration,
    /// Driver tick interval while the device is online.
    pub drain_interval: Duration,
    /// Bounded wait for a single remote submission.
    pub request_timeout: Duration,
    /// Maximum queue rows claimed per drain pass.
    pub batch_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_retry_delay: Duration::from_secs(2),
            max_retry_delay: Duration::from_secs(60),
            drain_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            batch_limit: 50,
        }
    }
}
