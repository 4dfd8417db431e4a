#![forbid(unsafe_code)]

//! # Tollgate
//!
//! Distributed rate limiting for an API gateway, as tower middleware.
//!
//! Two cooperating limiters decide whether a request may proceed, using a shared counter
//! store as the only source of truth so that any number of gateway processes enforce one
//! budget:
//!
//! - **Token bucket** ([`TokenBucketLimiter`]): continuous refill, checked per endpoint,
//!   per tenant and globally, in that order.
//! - **Resource windows** ([`ResourceLimiter`]): sliding-window counts per resource type
//!   and operation, plus a maximum page size for list requests.
//!
//! When the store is unreachable or slow, both limiters **fail open**: the request is
//! allowed, a warning is logged and a [`RateLimitEvent::FailOpen`] is emitted so the
//! bypass is visible in metrics.
//!
//! ## Quick Start
//!
//! ```rust
//! use axum::{routing::get, Router};
//! use tollgate::{
//!     InMemoryCounterStore, RateLimitConfig, RateLimitLayer, ResourceLimitConfig,
//!     ResourceLimiter, TokenBucketLimiter,
//! };
//!
//! # fn main() -> Result<(), tollgate::ConfigError> {
//! let store = InMemoryCounterStore::new();
//! let buckets = TokenBucketLimiter::new(RateLimitConfig::default(), store.clone())?;
//! let resources = ResourceLimiter::new(ResourceLimitConfig::default(), store)?;
//!
//! // Layers added later wrap earlier ones, so the resource stage runs first and
//! // writes its headers last.
//! let app: Router = Router::new()
//!     .route("/resources", get(|| async { "[]" }))
//!     .layer(RateLimitLayer::new(buckets))
//!     .layer(RateLimitLayer::new(resources));
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod telemetry;
pub mod tenant;

// Re-exports
pub use classify::{classify, OperationType, ResourceType, API_BASE_PATH};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    EndpointLimit, RateLimitConfig, ResourceLimitConfig, ResourcePolicy, SubscriptionPolicy,
};
pub use error::{ConfigError, StoreError};
pub use rate_limit::{
    Admission, CounterStore, Decision, InMemoryCounterStore, RateLimitHeaders, RateLimitKey,
    RateLimitLayer, RateLimitService, RateLimiter, Rejection, RejectionBody, RequestInfo,
    ResourceLimiter, Scope, TokenBucketLimiter, Verdict,
};
pub use telemetry::{Fanout, LogSink, MemorySink, NullSink, RateLimitEvent, TelemetrySink};
pub use tenant::{resolve_tenant, TenantId};
