//! Fetch retry back-off shared by all poll workers of one receiver.
//!
//! Intervals grow 1, 2, 4, 8, ... seconds up to [`MAX_RETRY_INTERVAL_SECS`]
//! while the listener keeps failing, and drop back to 1 on the first
//! successful fetch.

use std::sync::Mutex;
use std::time::Duration;

/// Upper bound of the back-off interval, in seconds
pub const MAX_RETRY_INTERVAL_SECS: u64 = 600;

/// Intervals above this many seconds mean the receiver is effectively suspended
pub const SUSPENSION_THRESHOLD_SECS: u64 = 60;

/// What happened when the interval was reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The interval was already at its base value
    Unchanged,
    /// The receiver was backing off
    Recovered,
    /// The receiver was backing off long enough to count as suspended
    Resumed,
}

/// Back-off interval guarded by a mutex
#[derive(Debug)]
pub struct RetryPolicy {
    interval_secs: Mutex<u64>,
    max_secs: u64,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::with_max(MAX_RETRY_INTERVAL_SECS)
    }

    pub fn with_max(max_secs: u64) -> Self {
        Self {
            interval_secs: Mutex::new(1),
            max_secs: max_secs.max(1),
        }
    }

    /// Interval the next failure will wait
    pub fn current(&self) -> Duration {
        Duration::from_secs(*self.lock())
    }

    /// Take the interval to wait now and double the stored one.
    pub fn next_interval(&self) -> Duration {
        let mut interval = self.lock();
        let current = *interval;
        *interval = interval.saturating_mul(2).min(self.max_secs);
        Duration::from_secs(current)
    }

    /// Reset to one second after a successful fetch
    pub fn reset(&self) -> ResetOutcome {
        let mut interval = self.lock();
        let previous = std::mem::replace(&mut *interval, 1);
        if previous > SUSPENSION_THRESHOLD_SECS {
            ResetOutcome::Resumed
        } else if previous > 1 {
            ResetOutcome::Recovered
        } else {
            ResetOutcome::Unchanged
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.interval_secs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether waiting `interval` means the receiver should report a suspension
pub fn is_suspension(interval: Duration) -> bool {
    interval.as_secs().saturating_mul(2) > SUSPENSION_THRESHOLD_SECS
}
