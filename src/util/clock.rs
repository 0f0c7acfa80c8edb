//! Wall-clock access in epoch milliseconds.
//!
//! Expiration deadlines and task delays are absolute epoch timestamps, so the
//! engine never reads `SystemTime` directly. Everything goes through a
//! [`Clock`] so tests can pin and advance time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_ms()
    }
}

/// Manually driven clock for deterministic tests and simulations.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock pinned at `start_ms`.
    #[must_use]
    pub fn new(start_ms: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance the clock by `duration`.
    pub fn advance(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.current.fetch_add(delta, Ordering::AcqRel);
    }

    /// Set the clock to an absolute epoch timestamp.
    pub fn set(&self, epoch_ms: u64) {
        self.current.store(epoch_ms, Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(now_ms())
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

/// Milliseconds remaining until `deadline_ms`, zero if it already passed.
#[must_use]
pub fn remaining(deadline_ms: u64, now_ms: u64) -> Duration {
    Duration::from_millis(deadline_ms.saturating_sub(now_ms))
}
