//! Token-bucket limiter: endpoint → tenant → global.
//!
//! Each request is checked against up to three scopes in a fixed order. The first scope
//! that rejects ends the chain with a 429; scopes that are not configured are skipped
//! without a store call. Buckets refill continuously at `rate` tokens per second up to
//! `burst`, and every check is a single atomic store call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::response::{RateLimitHeaders, Rejection, RejectionBody};
use super::store::{bounded, CounterStore, TokenBucketRequest};
use super::strategies::bucket_ttl;
use super::{Admission, Decision, RateLimitKey, RateLimiter, RequestInfo, Scope, Verdict};
use crate::clock::{Clock, SystemClock};
use crate::config::{BucketPolicies, BucketPolicy, RateLimitConfig};
use crate::error::{ConfigError, StoreError};
use crate::telemetry::{
    emit, FailOpen, LimitHit, LimiterKind, NullSink, RateLimitEvent, TelemetrySink,
};

/// Refill is accounted per second; rejected callers are told to retry after one window.
pub const WINDOW: Duration = Duration::from_secs(1);
const RETRY_AFTER_SECS: u64 = 1;

/// Token-bucket limiter over a shared [`CounterStore`].
///
/// The limiter itself is immutable; all bucket state lives in the store, so any number of
/// gateway processes can share one budget.
pub struct TokenBucketLimiter<T = NullSink> {
    store: Arc<dyn CounterStore>,
    policies: BucketPolicies,
    enabled: bool,
    key_prefix: String,
    store_timeout: Duration,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl<T> fmt::Debug for TokenBucketLimiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("enabled", &self.enabled)
            .field("policies", &self.policies)
            .field("key_prefix", &self.key_prefix)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl TokenBucketLimiter<NullSink> {
    pub fn builder() -> TokenBucketLimiterBuilder<NullSink> {
        TokenBucketLimiterBuilder::new()
    }

    /// Shorthand for a builder with the system clock and no telemetry.
    ///
    /// # Errors
    /// See [`RateLimitConfig::compile`].
    pub fn new<S>(config: RateLimitConfig, store: S) -> Result<Self, ConfigError>
    where
        S: CounterStore + 'static,
    {
        Self::builder().config(config).store(store).build()
    }
}

impl<T> TokenBucketLimiter<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policies(&self) -> &BucketPolicies {
        &self.policies
    }

    /// Check one request against one scope, taking a token if one is available.
    ///
    /// Store failures and timeouts resolve to [`Admission::FailedOpen`] after emitting a
    /// fail-open event; this never returns an error.
    pub async fn admit(&self, key: &RateLimitKey, policy: BucketPolicy, tenant: &str) -> Admission {
        let now = self.clock.now();
        let req = TokenBucketRequest {
            key: key.as_str(),
            rate: policy.rate,
            burst: policy.burst,
            now,
            ttl: bucket_ttl(WINDOW, policy.rate, policy.burst),
        };

        match bounded(self.store_timeout, self.store.take_token(req)).await {
            Ok(reply) => Admission::Checked(Decision {
                allowed: reply.allowed,
                limit: reply.limit,
                remaining: reply.remaining,
                reset_at: now.as_secs() + WINDOW.as_secs(),
            }),
            Err(err) => {
                self.fail_open(key.scope(), tenant, &err).await;
                Admission::FailedOpen
            }
        }
    }

    /// Configured scopes for `request`, in evaluation order.
    fn scopes(&self, request: &RequestInfo) -> Vec<(RateLimitKey, BucketPolicy)> {
        let prefix = &self.key_prefix;
        let tenant = &request.tenant;
        let mut scopes = Vec::with_capacity(3);
        if let Some(policy) = self.policies.endpoint(&request.method, &request.path) {
            scopes.push((
                RateLimitKey::endpoint(prefix, tenant, &request.method, &request.path),
                policy,
            ));
        }
        if let Some(policy) = self.policies.tenant {
            scopes.push((RateLimitKey::tenant(prefix, tenant), policy));
        }
        if let Some(policy) = self.policies.global {
            scopes.push((RateLimitKey::global(prefix), policy));
        }
        scopes
    }

    async fn fail_open(&self, scope: Scope, tenant: &str, err: &StoreError) {
        tracing::warn!(
            limiter = LimiterKind::TokenBucket.as_str(),
            scope = scope.as_str(),
            tenant,
            error = %err,
            "rate limit store unavailable; allowing request"
        );
        let event = RateLimitEvent::FailOpen(FailOpen {
            limiter: LimiterKind::TokenBucket,
            scope,
            tenant: tenant.to_string(),
            resource: None,
            error: err.to_string(),
        });
        emit(&self.sink, event).await;
    }

    async fn reject(&self, scope: Scope, tenant: &str, decision: &Decision) -> Verdict {
        tracing::info!(
            scope = scope.as_str(),
            tenant,
            limit = decision.limit,
            "rate limit exceeded"
        );
        let event = RateLimitEvent::LimitExceeded(LimitHit {
            limiter: LimiterKind::TokenBucket,
            scope,
            tenant: tenant.to_string(),
            resource: None,
        });
        emit(&self.sink, event).await;

        Verdict::Reject(Rejection::too_many_requests(
            RateLimitHeaders::from_decision(decision),
            RETRY_AFTER_SECS,
            RejectionBody::rate_limit_exceeded(RETRY_AFTER_SECS),
        ))
    }
}

#[async_trait]
impl<T> RateLimiter for TokenBucketLimiter<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn evaluate(&self, request: &RequestInfo) -> Verdict {
        if !self.enabled {
            return Verdict::Proceed(None);
        }

        let mut headers = None;
        for (key, policy) in self.scopes(request) {
            match self.admit(&key, policy, &request.tenant).await {
                Admission::Checked(decision) if !decision.allowed => {
                    return self.reject(key.scope(), &request.tenant, &decision).await;
                }
                Admission::Checked(decision) => {
                    headers = Some(RateLimitHeaders::from_decision(&decision));
                }
                Admission::FailedOpen => {}
            }
        }
        Verdict::Proceed(headers)
    }
}

/// Builder for [`TokenBucketLimiter`].
pub struct TokenBucketLimiterBuilder<T = NullSink> {
    store: Option<Arc<dyn CounterStore>>,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl TokenBucketLimiterBuilder<NullSink> {
    pub fn new() -> Self {
        Self {
            store: None,
            config: RateLimitConfig::default(),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl Default for TokenBucketLimiterBuilder<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TokenBucketLimiterBuilder<T> {
    /// The shared counter store. Required.
    pub fn store<S>(mut self, store: S) -> Self
    where
        S: CounterStore + 'static,
    {
        self.store = Some(Arc::new(store));
        self
    }

    /// Use an already shared store handle.
    pub fn shared_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Route limit hits and fail-opens to `sink`.
    pub fn with_sink<U>(self, sink: U) -> TokenBucketLimiterBuilder<U> {
        TokenBucketLimiterBuilder {
            store: self.store,
            config: self.config,
            clock: self.clock,
            sink,
        }
    }

    /// Validate the config and build the limiter.
    ///
    /// # Errors
    /// [`ConfigError::MissingStore`] without a store, otherwise see
    /// [`RateLimitConfig::compile`].
    pub fn build(self) -> Result<TokenBucketLimiter<T>, ConfigError> {
        let store = self.store.ok_or(ConfigError::MissingStore)?;
        let policies = self.config.compile()?;
        Ok(TokenBucketLimiter {
            store,
            policies,
            enabled: self.config.enabled,
            store_timeout: self.config.store_timeout(),
            key_prefix: self.config.key_prefix,
            clock: self.clock,
            sink: self.sink,
        })
    }
}
