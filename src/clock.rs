//! Clock abstractions used by the limiters.
//!
//! Limiters never read time themselves; they ask a [`Clock`] and hand `now` to the counter
//! store, so refill and window arithmetic can be driven deterministically in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock source. Values are durations since the unix epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Duration;

    /// Whole unix seconds, as used in `X-RateLimit-Reset`.
    fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

/// System wall clock.
///
/// Notes: every gateway process passes its own `now` to the shared store, so hosts should
/// be NTP-synchronised; skew shows up as slightly early or late refills.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
    }
}

/// Manually driven clock for tests. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Start at `start` since the epoch.
    pub fn new(start: Duration) -> Self {
        Self { micros: Arc::new(AtomicU64::new(duration_to_micros(start))) }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(duration_to_micros(by), Ordering::SeqCst);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: Duration) {
        self.micros.store(duration_to_micros(to), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z; any fixed non-zero instant works.
        Self::new(Duration::from_secs(1_704_067_200))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

fn duration_to_micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
