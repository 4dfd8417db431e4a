//! Counter-store contract and the process-local implementation.
//!
//! A store owns all mutable limiter state. Each call runs one algorithm step atomically
//! and every key carries an expiry, so abandoned tenants cost nothing once they go idle.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::strategies::{BucketState, WindowLog};
use crate::error::StoreError;

/// One token-bucket check: refill, take one token, persist, all in one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketRequest<'a> {
    pub key: &'a str,
    /// Tokens per second.
    pub rate: f64,
    pub burst: u64,
    /// Caller's wall clock, since the unix epoch.
    pub now: Duration,
    /// Idle expiry for the bucket state.
    pub ttl: Duration,
}

/// Store reply for a token-bucket check: `[allowed, remaining, limit]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketReply {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
}

/// One sliding-window check: prune, count, conditionally insert, all in one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindowRequest<'a> {
    pub key: &'a str,
    pub limit: u64,
    pub window: Duration,
    pub now: Duration,
    /// Unique log member for this request, so same-tick inserts never deduplicate.
    pub member: &'a str,
}

/// Store reply for a sliding-window check: `[allowed, remaining]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReply {
    pub allowed: bool,
    pub remaining: u64,
}

/// Shared counter store: the single source of truth for rate-limit state.
///
/// Each method must execute as one indivisible operation against the backing store (a Lua
/// script, a transaction, a locked section) so concurrent callers, in this process or any
/// other, observe a linearizable sequence of mutations per key. Implementations must not
/// cache state locally.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn take_token(&self, req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError>;

    async fn record_hit(&self, req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError>;

    /// Cheap reachability probe for readiness checks.
    async fn health(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn take_token(&self, req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError> {
        (**self).take_token(req).await
    }

    async fn record_hit(&self, req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError> {
        (**self).record_hit(req).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        (**self).health().await
    }
}

/// Run one store call under `limit`; running out of time is a [`StoreError::Timeout`].
pub(crate) async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call).await.map_err(|_| StoreError::Timeout(limit))?
}

#[derive(Debug)]
enum Entry {
    Bucket(BucketState),
    Window(WindowLog),
}

#[derive(Debug)]
struct Slot {
    entry: Entry,
    expires_at: Duration,
}

/// Expired slots are swept from the map once every this many store calls.
const SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Default)]
struct Slots {
    map: HashMap<String, Slot>,
    calls: u64,
}

impl Slots {
    /// Count one call and, every [`SWEEP_EVERY`] calls, drop slots expired as of `now`.
    fn tick(&mut self, now: Duration) {
        self.calls = self.calls.wrapping_add(1);
        if self.calls % SWEEP_EVERY == 0 {
            let before = self.map.len();
            self.map.retain(|_, slot| slot.expires_at > now);
            let kept = self.map.len();
            tracing::trace!(swept = before - kept, kept, "expired counters swept");
        }
    }
}

/// Process-local counter store.
///
/// Runs the same algorithms as the Redis scripts under one short mutex section per call
/// (never held across an await). Suitable for a single gateway process and for tests; it
/// gives no cross-process guarantees.
///
/// Expired keys read as absent immediately and are physically removed by a sweep that
/// piggybacks on every 1024th call, so memory tracks the set of recently active keys.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<Slots>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys as of `now`.
    pub fn live_keys(&self, now: Duration) -> usize {
        self.data
            .lock()
            .map(|guard| guard.map.values().filter(|slot| slot.expires_at > now).count())
            .unwrap_or(0)
    }

    /// Number of slots held in memory, expired or not.
    pub fn stored_keys(&self) -> usize {
        self.data.lock().map(|guard| guard.map.len()).unwrap_or(0)
    }

    /// Drop every expired key now instead of waiting for the next sweep.
    pub fn purge_expired(&self, now: Duration) {
        if let Ok(mut guard) = self.data.lock() {
            guard.map.retain(|_, slot| slot.expires_at > now);
        }
    }

    fn with_data<T>(
        &self,
        now: Duration,
        f: impl FnOnce(&mut HashMap<String, Slot>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self
            .data
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))?;
        guard.tick(now);
        f(&mut guard.map)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn take_token(&self, req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError> {
        let now_us = micros(req.now);
        self.with_data(req.now, |data| {
            let slot = data.entry(req.key.to_string()).or_insert_with(|| Slot {
                entry: Entry::Bucket(BucketState::full(req.burst, now_us)),
                expires_at: req.now + req.ttl,
            });
            if slot.expires_at <= req.now {
                slot.entry = Entry::Bucket(BucketState::full(req.burst, now_us));
            }
            let Entry::Bucket(state) = &mut slot.entry else {
                return Err(StoreError::Protocol(format!("{} is not a token bucket", req.key)));
            };
            let step = state.take(now_us, req.rate, req.burst);
            slot.expires_at = req.now + req.ttl;
            Ok(BucketReply { allowed: step.allowed, remaining: step.remaining, limit: req.burst })
        })
    }

    async fn record_hit(&self, req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError> {
        let now_us = micros(req.now);
        self.with_data(req.now, |data| {
            let slot = data.entry(req.key.to_string()).or_insert_with(|| Slot {
                entry: Entry::Window(WindowLog::default()),
                expires_at: req.now + req.window,
            });
            if slot.expires_at <= req.now {
                slot.entry = Entry::Window(WindowLog::default());
            }
            let Entry::Window(log) = &mut slot.entry else {
                return Err(StoreError::Protocol(format!("{} is not a window log", req.key)));
            };
            let step = log.record(now_us, req.window, req.limit, req.member);
            if step.allowed {
                slot.expires_at = req.now + req.window;
            }
            Ok(WindowReply { allowed: step.allowed, remaining: step.remaining })
        })
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}
