//! Service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a scan or mutation requested while another one runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the running operation, then proceed.
    #[default]
    Queue,
    /// Fail immediately with [`crate::Error::Busy`].
    Reject,
}

/// Timing and concurrency settings for [`crate::PartitionService`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use efi_mount_core::config::{BusyPolicy, ServiceConfig};
///
/// let config = ServiceConfig::default()
///     .with_elevation_timeout(Duration::from_secs(60))
///     .with_busy_policy(BusyPolicy::Reject);
/// assert_eq!(config.verify_attempts, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Wait before the first verification scan after mount or unmount.
    pub mount_grace: Duration,
    /// Wait before the first verification scan after eject.
    pub eject_grace: Duration,
    /// Wait before scanning in [`crate::PartitionService::force_rescan`].
    pub rescan_delay: Duration,
    /// Maximum verification scans after a mutation.
    pub verify_attempts: u32,
    /// Upper bound for the doubling delay between verification scans.
    pub max_verify_interval: Duration,
    /// Total time allowed for verification.
    pub verify_deadline: Duration,
    /// Time allowed for the elevation prompt and the command it runs.
    pub elevation_timeout: Duration,
    pub busy_policy: BusyPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            mount_grace: Duration::from_millis(500),
            eject_grace: Duration::from_millis(1000),
            rescan_delay: Duration::from_millis(1000),
            verify_attempts: 5,
            max_verify_interval: Duration::from_secs(4),
            verify_deadline: Duration::from_secs(10),
            elevation_timeout: Duration::from_secs(120),
            busy_policy: BusyPolicy::Queue,
        }
    }
}

impl ServiceConfig {
    /// Creates a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mount_grace(mut self, grace: Duration) -> Self {
        self.mount_grace = grace;
        self
    }

    pub fn with_eject_grace(mut self, grace: Duration) -> Self {
        self.eject_grace = grace;
        self
    }

    pub fn with_rescan_delay(mut self, delay: Duration) -> Self {
        self.rescan_delay = delay;
        self
    }

    /// Sets the verification budget. At least one scan is always made.
    pub fn with_verification(mut self, attempts: u32, max_interval: Duration, deadline: Duration) -> Self {
        self.verify_attempts = attempts.max(1);
        self.max_verify_interval = max_interval;
        self.verify_deadline = deadline;
        self
    }

    pub fn with_elevation_timeout(mut self, timeout: Duration) -> Self {
        self.elevation_timeout = timeout;
        self
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    /// Delays before each verification scan: `first`, doubling, capped at
    /// `max_verify_interval`, and cut off once their sum passes
    /// `verify_deadline`. Never empty.
    pub fn verify_delays(&self, first: Duration) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut delay = first;
        let mut elapsed = Duration::ZERO;

        for _ in 0..self.verify_attempts.max(1) {
            if !delays.is_empty() && elapsed + delay > self.verify_deadline {
                break;
            }
            elapsed += delay;
            delays.push(delay);
            delay = (delay * 2).min(self.max_verify_interval.max(first));
        }

        delays
    }
}
