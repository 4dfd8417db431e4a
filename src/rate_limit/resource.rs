//! Resource limiter: sliding windows per (tenant, resource type, operation).
//!
//! Requests are classified from their method and path, then counted against a timestamp
//! log in the store. List operations are also checked for an oversized page before any
//! quota is consumed.

use std::fmt;
use std::num::IntErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::response::{RateLimitHeaders, Rejection, RejectionBody};
use super::store::{bounded, CounterStore, SlidingWindowRequest};
use super::{Admission, Decision, RateLimitKey, RateLimiter, RequestInfo, Scope, Verdict};
use crate::classify::{classify, OperationType, ResourceType};
use crate::clock::{Clock, SystemClock};
use crate::config::{ResourceLimitConfig, WindowPolicies};
use crate::error::{ConfigError, StoreError};
use crate::telemetry::{
    emit, FailOpen, LimitHit, LimiterKind, NullSink, RateLimitEvent, TelemetrySink,
};

/// Sliding-window limiter over a shared [`CounterStore`].
pub struct ResourceLimiter<T = NullSink> {
    store: Arc<dyn CounterStore>,
    policies: WindowPolicies,
    enabled: bool,
    page_size_param: String,
    key_prefix: String,
    store_timeout: Duration,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl<T> fmt::Debug for ResourceLimiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLimiter")
            .field("enabled", &self.enabled)
            .field("policies", &self.policies)
            .field("page_size_param", &self.page_size_param)
            .field("key_prefix", &self.key_prefix)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl ResourceLimiter<NullSink> {
    pub fn builder() -> ResourceLimiterBuilder<NullSink> {
        ResourceLimiterBuilder::new()
    }

    /// Shorthand for a builder with the system clock and no telemetry.
    ///
    /// # Errors
    /// See [`ResourceLimitConfig::compile`].
    pub fn new<S>(config: ResourceLimitConfig, store: S) -> Result<Self, ConfigError>
    where
        S: CounterStore + 'static,
    {
        Self::builder().config(config).store(store).build()
    }
}

impl<T> ResourceLimiter<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policies(&self) -> &WindowPolicies {
        &self.policies
    }

    /// Ceiling on active subscriptions per tenant. The subscription handler owns the count
    /// of existing subscriptions and enforces this.
    pub fn max_active_subscriptions(&self) -> u64 {
        self.policies.max_active_subscriptions()
    }

    /// Record one request for `(tenant, resource, operation)` if the window has room.
    ///
    /// Returns `None` for pairs without a configured window (unknown resources, zeroed
    /// limits); those are unlimited and never touch the store. Store failures and timeouts
    /// resolve to [`Admission::FailedOpen`].
    pub async fn admit_resource(
        &self,
        tenant: &str,
        resource: ResourceType,
        operation: OperationType,
    ) -> Option<Admission> {
        let policy = self.policies.window(resource, operation)?;

        let key = RateLimitKey::resource(&self.key_prefix, tenant, resource, operation);
        let now = self.clock.now();
        let member = format!("{}-{:016x}", now.as_micros(), rand::random::<u64>());
        let req = SlidingWindowRequest {
            key: key.as_str(),
            limit: policy.limit,
            window: policy.window,
            now,
            member: &member,
        };

        match bounded(self.store_timeout, self.store.record_hit(req)).await {
            Ok(reply) => {
                tracing::debug!(
                    tenant,
                    resource_type = resource.as_str(),
                    operation = operation.as_str(),
                    allowed = reply.allowed,
                    remaining = reply.remaining,
                    "resource window checked"
                );
                Some(Admission::Checked(Decision {
                    allowed: reply.allowed,
                    limit: policy.limit,
                    remaining: reply.remaining,
                    reset_at: now.as_secs() + policy.window.as_secs(),
                }))
            }
            Err(err) => {
                self.fail_open(tenant, resource, operation, &err).await;
                Some(Admission::FailedOpen)
            }
        }
    }

    /// Reject a list request whose page size exceeds the ceiling for `resource`.
    ///
    /// Only well-formed positive integers are judged; anything unparsable is left for
    /// downstream validation. Returns the 400 rejection, if any.
    pub async fn check_page_size(
        &self,
        request: &RequestInfo,
        resource: ResourceType,
    ) -> Option<Rejection> {
        let max = self.policies.max_page_size(resource);
        if max == 0 {
            return None;
        }
        let raw = request.query_param(&self.page_size_param)?;
        let received = parse_page_size(&raw)?;
        if received <= max {
            return None;
        }

        tracing::info!(
            tenant = %request.tenant,
            resource_type = resource.as_str(),
            max_size = max,
            received,
            "page size exceeds maximum"
        );
        let event = RateLimitEvent::PageSizeRejected {
            resource,
            tenant: request.tenant.clone(),
            max_size: max,
            received,
        };
        emit(&self.sink, event).await;
        Some(Rejection::bad_request(RejectionBody::page_size_exceeded(max, received)))
    }

    async fn fail_open(
        &self,
        tenant: &str,
        resource: ResourceType,
        operation: OperationType,
        err: &StoreError,
    ) {
        tracing::warn!(
            limiter = LimiterKind::Resource.as_str(),
            tenant,
            resource_type = resource.as_str(),
            operation = operation.as_str(),
            error = %err,
            "rate limit store unavailable; allowing request"
        );
        let event = RateLimitEvent::FailOpen(FailOpen {
            limiter: LimiterKind::Resource,
            scope: Scope::Resource,
            tenant: tenant.to_string(),
            resource: Some((resource, operation)),
            error: err.to_string(),
        });
        emit(&self.sink, event).await;
    }

    async fn reject(
        &self,
        tenant: &str,
        resource: ResourceType,
        operation: OperationType,
        decision: &Decision,
    ) -> Verdict {
        tracing::info!(
            tenant,
            resource_type = resource.as_str(),
            operation = operation.as_str(),
            limit = decision.limit,
            "resource rate limit exceeded"
        );
        let event = RateLimitEvent::LimitExceeded(LimitHit {
            limiter: LimiterKind::Resource,
            scope: Scope::Resource,
            tenant: tenant.to_string(),
            resource: Some((resource, operation)),
        });
        emit(&self.sink, event).await;

        let retry_after = self
            .policies
            .window(resource, operation)
            .map_or(60, |policy| policy.window.as_secs());
        Verdict::Reject(Rejection::too_many_requests(
            RateLimitHeaders::from_decision(decision).with_resource(resource),
            retry_after,
            RejectionBody::resource_limit_exceeded(resource, operation, retry_after),
        ))
    }
}

/// Positive integers only. Overflowing digit strings are still well-formed and count as
/// the largest possible size.
fn parse_page_size(raw: &str) -> Option<u64> {
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => Some(u64::MAX),
        Err(_) => None,
    }
}

#[async_trait]
impl<T> RateLimiter for ResourceLimiter<T>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    async fn evaluate(&self, request: &RequestInfo) -> Verdict {
        if !self.enabled {
            return Verdict::Proceed(None);
        }

        let (resource, operation) = classify(&request.method, &request.path);
        if operation == OperationType::List {
            if let Some(rejection) = self.check_page_size(request, resource).await {
                return Verdict::Reject(rejection);
            }
        }
        let Some(admission) = self.admit_resource(&request.tenant, resource, operation).await
        else {
            return Verdict::Proceed(None);
        };

        match admission {
            Admission::Checked(decision) if !decision.allowed => {
                self.reject(&request.tenant, resource, operation, &decision).await
            }
            Admission::Checked(decision) => Verdict::Proceed(Some(
                RateLimitHeaders::from_decision(&decision).with_resource(resource),
            )),
            Admission::FailedOpen => Verdict::Proceed(None),
        }
    }
}

/// Builder for [`ResourceLimiter`].
pub struct ResourceLimiterBuilder<T = NullSink> {
    store: Option<Arc<dyn CounterStore>>,
    config: ResourceLimitConfig,
    clock: Arc<dyn Clock>,
    sink: T,
}

impl ResourceLimiterBuilder<NullSink> {
    pub fn new() -> Self {
        Self {
            store: None,
            config: ResourceLimitConfig::default(),
            clock: Arc::new(SystemClock),
            sink: NullSink,
        }
    }
}

impl Default for ResourceLimiterBuilder<NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResourceLimiterBuilder<T> {
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

    pub fn config(mut self, config: ResourceLimitConfig) -> Self {
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

    /// Route limit hits, page-size rejections and fail-opens to `sink`.
    pub fn with_sink<U>(self, sink: U) -> ResourceLimiterBuilder<U> {
        ResourceLimiterBuilder {
            store: self.store,
            config: self.config,
            clock: self.clock,
            sink,
        }
    }

    /// # Errors
    /// [`ConfigError::MissingStore`] without a store, otherwise see
    /// [`ResourceLimitConfig::compile`].
    pub fn build(self) -> Result<ResourceLimiter<T>, ConfigError> {
        let store = self.store.ok_or(ConfigError::MissingStore)?;
        let policies = self.config.compile()?;
        Ok(ResourceLimiter {
            store,
            policies,
            enabled: self.config.enabled,
            store_timeout: self.config.store_timeout(),
            page_size_param: self.config.page_size_param,
            key_prefix: self.config.key_prefix,
            clock: self.clock,
            sink: self.sink,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::rate_limit::InMemoryCounterStore;
    use crate::telemetry::MemorySink;
    use http::{Method, StatusCode};

    fn request(method: Method, uri: &str) -> RequestInfo {
        let req = http::Request::builder()
            .method(method)
            .uri(uri)
            .header("x-tenant-id", "tenant-a")
            .body(())
            .unwrap();
        RequestInfo::from_request(&req)
    }

    #[test]
    fn page_size_parsing() {
        assert_eq!(parse_page_size("100"), Some(100));
        assert_eq!(parse_page_size(" 7 "), Some(7));
        assert_eq!(parse_page_size("0"), None);
        assert_eq!(parse_page_size("-5"), None);
        assert_eq!(parse_page_size("abc"), None);
        assert_eq!(parse_page_size("1.5"), None);
        assert_eq!(parse_page_size("99999999999999999999999"), Some(u64::MAX));
    }

    #[tokio::test]
    async fn page_size_is_checked_before_quota() {
        let mut cfg = ResourceLimitConfig::default();
        cfg.resources.lists_per_minute = 1;
        cfg.resources.max_page_size = 100;
        let store = InMemoryCounterStore::new();
        let sink = MemorySink::new();
        let limiter = ResourceLimiter::builder()
            .config(cfg)
            .store(store.clone())
            .clock(ManualClock::default())
            .with_sink(sink.clone())
            .build()
            .unwrap();

        let Verdict::Reject(rejection) = limiter.evaluate(&request(Method::GET, "/resources?limit=101")).await
        else {
            panic!("oversized page must be rejected");
        };
        assert_eq!(rejection.status, StatusCode::BAD_REQUEST);
        assert_eq!(rejection.body, RejectionBody::page_size_exceeded(100, 101));
        assert!(matches!(sink.events()[0], RateLimitEvent::PageSizeRejected { .. }));

        // The rejected request consumed nothing, so the single list slot is still free.
        let ok = limiter.evaluate(&request(Method::GET, "/resources?limit=100")).await;
        assert!(!ok.is_rejected());
    }

    #[tokio::test]
    async fn custom_page_size_param() {
        let cfg = ResourceLimitConfig { page_size_param: "pageSize".into(), ..Default::default() };
        let limiter = ResourceLimiter::new(cfg, InMemoryCounterStore::new()).unwrap();
        let verdict = limiter
            .evaluate(&request(Method::GET, "/deploymentManagers?pageSize=500&limit=1"))
            .await;
        assert!(verdict.is_rejected());
        let verdict = limiter.evaluate(&request(Method::GET, "/deploymentManagers?limit=500")).await;
        assert!(!verdict.is_rejected());
    }

    #[tokio::test]
    async fn reads_are_not_page_checked() {
        let limiter = ResourceLimiter::new(ResourceLimitConfig::default(), InMemoryCounterStore::new())
            .unwrap();
        let verdict = limiter.evaluate(&request(Method::GET, "/resources/r1?limit=5000")).await;
        assert!(!verdict.is_rejected());
    }

    #[tokio::test]
    async fn unknown_resources_are_not_counted() {
        let store = InMemoryCounterStore::new();
        let clock = ManualClock::default();
        let limiter = ResourceLimiter::builder()
            .store(store.clone())
            .clock(clock.clone())
            .build()
            .unwrap();
        let verdict = limiter.evaluate(&request(Method::GET, "/unknown-endpoint")).await;
        assert_eq!(verdict, Verdict::Proceed(None));
        assert_eq!(store.live_keys(clock.now()), 0);
    }

    #[tokio::test]
    async fn admit_resource_has_no_answer_for_unlimited_pairs() {
        let mut cfg = ResourceLimitConfig::default();
        cfg.resources.reads_per_minute = 0;
        cfg.resources.lists_per_minute = 2;
        let store = InMemoryCounterStore::new();
        let clock = ManualClock::default();
        let limiter = ResourceLimiter::builder()
            .config(cfg)
            .store(store.clone())
            .clock(clock.clone())
            .build()
            .unwrap();

        let unknown = limiter.admit_resource("t", ResourceType::Unknown, OperationType::Read).await;
        assert_eq!(unknown, None);
        let zeroed = limiter.admit_resource("t", ResourceType::Resources, OperationType::Read).await;
        assert_eq!(zeroed, None);
        assert_eq!(store.live_keys(clock.now()), 0);

        let Some(Admission::Checked(decision)) =
            limiter.admit_resource("t", ResourceType::Resources, OperationType::List).await
        else {
            panic!("configured pairs are checked against the store");
        };
        assert_eq!((decision.allowed, decision.limit, decision.remaining), (true, 2, 1));
        assert_eq!(decision.reset_at, clock.now().as_secs() + 60);
    }

    #[tokio::test]
    async fn success_headers_name_the_resource() {
        let clock = ManualClock::default();
        let limiter = ResourceLimiter::builder()
            .store(InMemoryCounterStore::new())
            .clock(clock.clone())
            .build()
            .unwrap();
        let Verdict::Proceed(Some(h)) =
            limiter.evaluate(&request(Method::POST, "/subscriptions")).await
        else {
            panic!("expected headers");
        };
        assert_eq!(h.resource, Some(ResourceType::Subscriptions));
        assert_eq!((h.limit, h.remaining), (100, 99));
        assert_eq!(h.reset, clock.now_secs() + 3600);
    }

    #[test]
    fn exposes_max_active_subscriptions() {
        let mut cfg = ResourceLimitConfig::default();
        cfg.subscriptions.max_active = 7;
        let limiter = ResourceLimiter::new(cfg, InMemoryCounterStore::new()).unwrap();
        assert_eq!(limiter.max_active_subscriptions(), 7);
    }
}
