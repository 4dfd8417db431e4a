//! Telemetry and observability for the limiters.
//!
//! Limiters emit a [`RateLimitEvent`] for every rejection and every fail-open. Events flow
//! through `TelemetrySink` implementations which can log, count, or forward them to
//! external systems. Sinks are injected at limiter construction; nothing here is global, so
//! tests can hand each limiter its own isolated [`MemorySink`].
//!
//! # Event Types
//!
//! - **Limit hits**: `LimitExceeded` (429) and `PageSizeRejected` (400)
//! - **Degradation**: `FailOpen`, one per store call that failed or timed out
//!
//! # Telemetry Sinks
//!
//! A [`TelemetrySink`] is any infallible, cloneable `tower::Service<RateLimitEvent>`.
//! [`Fanout`] joins two of them, which is how the gateway feeds logs and metrics at once.

pub mod events;
pub mod sinks;

pub use events::{FailOpen, LimitHit, LimiterKind, RateLimitEvent};
pub(crate) use sinks::emit;
pub use sinks::{Fanout, LogSink, MemorySink, NullSink, TelemetrySink};
