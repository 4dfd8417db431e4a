//! Redis/Valkey counter store for tollgate.
//!
//! Each limiter check is one `EVALSHA` round trip running a Lua script, so the
//! read-modify-write is atomic across every gateway process sharing the server. The
//! scripts are loaded lazily: the first call on a fresh server falls back to `EVAL`.
//!
//! Connections go through [`redis::aio::ConnectionManager`], which multiplexes requests
//! over one connection and reconnects on its own after a drop. While it is reconnecting,
//! calls fail fast and the limiters fail open.
//!
//! ```no_run
//! use tollgate::{RateLimitConfig, TokenBucketLimiter};
//! use tollgate_redis::RedisCounterStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisCounterStore::connect("redis://127.0.0.1:6379/").await?;
//! let limiter = TokenBucketLimiter::new(RateLimitConfig::default(), store)?;
//! # let _ = limiter;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tollgate::rate_limit::strategies::window_cutoff;
use tollgate::rate_limit::{
    BucketReply, CounterStore, SlidingWindowRequest, TokenBucketRequest, WindowReply,
};
use tollgate::StoreError;

const TOKEN_BUCKET_LUA: &str = include_str!("lua/token_bucket.lua");
const SLIDING_WINDOW_LUA: &str = include_str!("lua/sliding_window.lua");

/// Counter store backed by a Redis-compatible server.
///
/// Cheap to clone; clones share the managed connection.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    token_bucket: Script,
    sliding_window: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("token_bucket", &self.token_bucket.get_hash())
            .field("sliding_window", &self.sliding_window.get_hash())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Open a managed connection to `url` (e.g. `redis://host:6379/0`).
    ///
    /// # Errors
    /// [`StoreError::Unavailable`] when the URL is invalid or the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url: {e}")))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(format!("failed to connect to redis: {e}")))?;
        tracing::info!("connected to redis counter store");
        Ok(Self::new(connection))
    }

    /// Wrap an existing managed connection.
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            token_bucket: Script::new(TOKEN_BUCKET_LUA),
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn take_token(&self, req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError> {
        let mut connection = self.connection.clone();
        let reply: (i64, i64, i64) = self
            .token_bucket
            .key(req.key)
            .arg(req.rate)
            .arg(req.burst)
            .arg(micros(req.now))
            .arg(millis(req.ttl))
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;

        let (allowed, remaining, limit) = reply;
        Ok(BucketReply {
            allowed: flag(allowed)?,
            remaining: count("remaining", remaining)?,
            limit: count("limit", limit)?,
        })
    }

    async fn record_hit(&self, req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError> {
        let now_us = micros(req.now);
        let cutoff = window_cutoff(now_us, req.window).map(|c| c.to_string()).unwrap_or_default();
        let mut connection = self.connection.clone();
        let reply: (i64, i64) = self
            .sliding_window
            .key(req.key)
            .arg(now_us)
            .arg(cutoff)
            .arg(req.limit)
            .arg(millis(req.window))
            .arg(req.member)
            .invoke_async(&mut connection)
            .await
            .map_err(unavailable)?;

        let (allowed, remaining) = reply;
        Ok(WindowReply { allowed: flag(allowed)?, remaining: count("remaining", remaining)? })
    }

    async fn health(&self) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(unavailable)?;
        if pong != "PONG" {
            return Err(StoreError::Protocol(format!("PING answered {pong:?}")));
        }
        Ok(())
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn flag(value: i64) -> Result<bool, StoreError> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(StoreError::Protocol(format!("allowed flag must be 0 or 1, got {other}"))),
    }
}

fn count(field: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Protocol(format!("{field} must not be negative, got {value}")))
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Redis rejects a zero expiry, so round up to at least one millisecond.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}
