//! The two limiting algorithms, as pure state transitions.
//!
//! [`InMemoryCounterStore`](super::store::InMemoryCounterStore) runs these directly; the
//! Redis store runs Lua translations of the same steps. Keep them in sync.

use std::collections::BTreeSet;
use std::time::Duration;

/// Token-bucket state for one key.
///
/// Invariant: `0 <= tokens <= burst` for the burst it was last updated with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    /// Microseconds since the unix epoch.
    pub last_update_us: u64,
}

/// Result of one bucket step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketStep {
    pub allowed: bool,
    pub remaining: u64,
}

impl BucketState {
    /// A bucket seen for the first time starts full.
    pub fn full(burst: u64, now_us: u64) -> Self {
        Self { tokens: burst as f64, last_update_us: now_us }
    }

    /// Refill for the elapsed time, then try to take one token.
    ///
    /// The state is always advanced to `now_us`, taken or not. A clock that moved
    /// backwards refills nothing.
    pub fn take(&mut self, now_us: u64, rate: f64, burst: u64) -> BucketStep {
        let elapsed = now_us.saturating_sub(self.last_update_us) as f64 / 1_000_000.0;
        let cap = burst as f64;
        let mut tokens = (self.tokens + elapsed * rate).min(cap).max(0.0);

        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }
        self.tokens = tokens;
        self.last_update_us = self.last_update_us.max(now_us);

        BucketStep { allowed, remaining: if allowed { tokens.floor() as u64 } else { 0 } }
    }
}

/// How long an idle bucket must survive in the store.
///
/// At least two windows, and never shorter than a full refill: an expired bucket comes back
/// full, which must not hand out more than refill would have.
pub fn bucket_ttl(window: Duration, rate: f64, burst: u64) -> Duration {
    let floor = window * 2;
    if rate <= 0.0 {
        return floor;
    }
    let refill = Duration::from_secs_f64((burst as f64 / rate).min(f64::from(u32::MAX)));
    floor.max(refill + window)
}

/// Sliding-window log for one key: `(timestamp_us, member)` pairs ordered by time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowLog {
    entries: BTreeSet<(u64, String)>,
}

/// Result of one window step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStep {
    pub allowed: bool,
    pub remaining: u64,
}

impl WindowLog {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries at or before `now_us - window`, then admit and record the request if
    /// fewer than `limit` remain. The window is the half-open interval `(now - window, now]`.
    pub fn record(&mut self, now_us: u64, window: Duration, limit: u64, member: &str) -> WindowStep {
        if let Some(cutoff) = window_cutoff(now_us, window) {
            self.entries = self.entries.split_off(&(cutoff.saturating_add(1), String::new()));
        }

        let count = self.entries.len() as u64;
        if count >= limit {
            return WindowStep { allowed: false, remaining: 0 };
        }
        self.entries.insert((now_us, member.to_string()));
        WindowStep { allowed: true, remaining: limit - count - 1 }
    }
}

/// Newest timestamp that has fallen out of the window ending at `now_us`, if any has.
pub fn window_cutoff(now_us: u64, window: Duration) -> Option<u64> {
    now_us.checked_sub(u64::try_from(window.as_micros()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000;

    #[test]
    fn bucket_conserves_tokens_without_elapsed_time() {
        let mut b = BucketState::full(5, 0);
        for n in 1..=5u64 {
            let step = b.take(0, 1.0, 5);
            assert!(step.allowed);
            assert_eq!(step.remaining, 5 - n);
        }
        assert_eq!(b.take(0, 1.0, 5), BucketStep { allowed: false, remaining: 0 });
    }

    #[test]
    fn bucket_refills_linearly_and_caps_at_burst() {
        let mut b = BucketState { tokens: 0.0, last_update_us: 0 };
        // 2.5s at 2/s → 5 tokens, take one.
        let step = b.take(2_500_000, 2.0, 10);
        assert_eq!(step.remaining, 4);
        assert!((b.tokens - 4.0).abs() < 1e-9);

        // An hour later the bucket is capped at burst.
        let step = b.take(3600 * SEC, 2.0, 10);
        assert_eq!(step.remaining, 9);
    }

    #[test]
    fn rejected_take_still_advances_time() {
        let mut b = BucketState { tokens: 0.2, last_update_us: 0 };
        let step = b.take(100_000, 1.0, 3);
        assert!(!step.allowed);
        assert_eq!(b.last_update_us, 100_000);
        assert!((b.tokens - 0.3).abs() < 1e-9);
    }

    #[test]
    fn backwards_clock_refills_nothing() {
        let mut b = BucketState { tokens: 0.5, last_update_us: 10 * SEC };
        assert!(!b.take(5 * SEC, 100.0, 10).allowed);
        assert_eq!(b.last_update_us, 10 * SEC);
    }

    #[test]
    fn ttl_covers_two_windows_and_full_refill() {
        let w = Duration::from_secs(1);
        assert_eq!(bucket_ttl(w, 100.0, 10), Duration::from_secs(2));
        assert_eq!(bucket_ttl(w, 1.0, 30), Duration::from_secs(31));
        assert_eq!(bucket_ttl(w, 0.0, 30), Duration::from_secs(2));
    }

    #[test]
    fn window_admits_exactly_limit() {
        let mut log = WindowLog::default();
        let w = Duration::from_secs(60);
        for i in 0..3u64 {
            let step = log.record(i * SEC, w, 3, &format!("m{i}"));
            assert!(step.allowed);
            assert_eq!(step.remaining, 2 - i);
        }
        assert!(!log.record(10 * SEC, w, 3, "m3").allowed);
        assert_eq!(log.len(), 3, "rejections are not recorded");
    }

    #[test]
    fn window_prunes_before_counting() {
        let mut log = WindowLog::default();
        let w = Duration::from_secs(60);
        assert!(log.record(0, w, 1, "a").allowed);
        assert!(!log.record(60 * SEC - 1, w, 1, "b").allowed);
        // Exactly one window later the first entry has aged out.
        assert!(log.record(60 * SEC, w, 1, "c").allowed);
        assert!(!log.record(60 * SEC + 1, w, 1, "d").allowed);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn same_tick_entries_do_not_collapse() {
        let mut log = WindowLog::default();
        let w = Duration::from_secs(1);
        assert!(log.record(5, w, 10, "x-1").allowed);
        assert!(log.record(5, w, 10, "x-2").allowed);
        assert_eq!(log.len(), 2);
    }
}
