use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{Service, ServiceExt};

use super::events::RateLimitEvent;
use crate::rate_limit::Scope;

/// Where limiters send their [`RateLimitEvent`]s.
///
/// Any cloneable `tower::Service<RateLimitEvent>` that cannot fail is a sink. Recording an
/// event must never change a verdict, so sinks that talk to fallible backends swallow their
/// own errors and report `Ok`.
pub trait TelemetrySink:
    Service<RateLimitEvent, Response = (), Error = Infallible> + Clone + Send + Sync + 'static
{
}

impl<S> TelemetrySink for S where
    S: Service<RateLimitEvent, Response = (), Error = Infallible> + Clone + Send + Sync + 'static
{
}

/// Deliver one event, waiting for the sink to become ready first.
pub(crate) async fn emit<S>(sink: &S, event: RateLimitEvent)
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    match sink.clone().oneshot(event).await {
        Ok(()) => {}
        Err(never) => match never {},
    }
}

/// Discards every event. The default for limiters built without a sink.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<RateLimitEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: RateLimitEvent) -> Self::Future {
        ready(Ok(()))
    }
}

/// Writes events as structured `tracing` records under the `tollgate::events` target.
///
/// Fail-opens are warnings since enforcement was skipped; rejections are debug records.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl Service<RateLimitEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        let resource_type = event.resource().map(|(r, _)| r.as_str());
        let operation = event.resource().map(|(_, op)| op.as_str());
        match &event {
            RateLimitEvent::LimitExceeded(hit) => tracing::debug!(
                target: "tollgate::events",
                limiter = hit.limiter.as_str(),
                scope = hit.scope.as_str(),
                tenant = %hit.tenant,
                resource_type,
                operation,
                "rate limit exceeded"
            ),
            RateLimitEvent::PageSizeRejected { tenant, max_size, received, .. } => tracing::debug!(
                target: "tollgate::events",
                tenant = %tenant,
                resource_type,
                max_size,
                received,
                "page size rejected"
            ),
            RateLimitEvent::FailOpen(fo) => tracing::warn!(
                target: "tollgate::events",
                limiter = fo.limiter.as_str(),
                scope = fo.scope.as_str(),
                tenant = %fo.tenant,
                resource_type,
                operation,
                error = %fo.error,
                "store unavailable; request allowed unchecked"
            ),
        }
        ready(Ok(()))
    }
}

#[derive(Debug)]
struct Recorded {
    events: VecDeque<RateLimitEvent>,
    capacity: usize,
    dropped: u64,
}

/// Keeps the most recent events in memory for assertions.
///
/// Clones share one buffer, so a test hands one clone to a limiter and queries another.
/// Once `capacity` events are held the oldest is dropped for each new one.
#[derive(Clone, Debug)]
pub struct MemorySink {
    inner: Arc<Mutex<Recorded>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(Recorded {
                events: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
                dropped: 0,
            })),
        }
    }

    fn tally(&self, pred: impl Fn(&RateLimitEvent) -> bool) -> usize {
        self.inner.lock().map(|r| r.events.iter().filter(|e| pred(e)).count()).unwrap_or(0)
    }

    /// Held events, oldest first.
    pub fn events(&self) -> Vec<RateLimitEvent> {
        self.inner.lock().map(|r| r.events.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events pushed out by the capacity limit.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().map(|r| r.dropped).unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut r) = self.inner.lock() {
            r.events.clear();
        }
    }

    pub fn fail_opens(&self) -> usize {
        self.tally(RateLimitEvent::is_fail_open)
    }

    pub fn limit_hits(&self) -> usize {
        self.tally(RateLimitEvent::is_limit_exceeded)
    }

    pub fn page_size_rejections(&self) -> usize {
        self.tally(|e| matches!(e, RateLimitEvent::PageSizeRejected { .. }))
    }

    /// Fail-opens recorded for one tenant.
    pub fn fail_opens_for(&self, tenant: &str) -> usize {
        self.tally(|e| e.is_fail_open() && e.tenant() == tenant)
    }

    /// 429s raised by one scope.
    pub fn limit_hits_in(&self, scope: Scope) -> usize {
        self.tally(|e| e.is_limit_exceeded() && e.scope() == scope)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<RateLimitEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        if let Ok(mut r) = self.inner.lock() {
            if r.events.len() >= r.capacity {
                r.events.pop_front();
                r.dropped += 1;
            }
            r.events.push_back(event);
        }
        ready(Ok(()))
    }
}

/// Delivers each event to `first` and then to `second`.
///
/// The gateway uses this to feed its log sink and its Prometheus sink from one limiter.
/// Nest it to reach more than two sinks.
#[derive(Clone, Debug)]
pub struct Fanout<A, B> {
    first: A,
    second: B,
}

impl<A, B> Fanout<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> Service<RateLimitEvent> for Fanout<A, B>
where
    A: TelemetrySink,
    A::Future: Send + 'static,
    B: TelemetrySink,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        let first = self.first.clone();
        let second = self.second.clone();
        Box::pin(async move {
            emit(&first, event.clone()).await;
            emit(&second, event).await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{OperationType, ResourceType};
    use crate::telemetry::events::{FailOpen, LimitHit, LimiterKind};

    fn hit(scope: Scope, tenant: &str) -> RateLimitEvent {
        RateLimitEvent::LimitExceeded(LimitHit {
            limiter: LimiterKind::TokenBucket,
            scope,
            tenant: tenant.into(),
            resource: None,
        })
    }

    fn store_down(tenant: &str, resource: ResourceType) -> RateLimitEvent {
        RateLimitEvent::FailOpen(FailOpen {
            limiter: LimiterKind::Resource,
            scope: Scope::Resource,
            tenant: tenant.into(),
            resource: Some((resource, OperationType::List)),
            error: "connection refused".into(),
        })
    }

    #[tokio::test]
    async fn fail_opens_are_counted_per_tenant() {
        let sink = MemorySink::new();
        emit(&sink, store_down("acme", ResourceType::Resources)).await;
        emit(&sink, store_down("acme", ResourceType::ResourcePools)).await;
        emit(&sink, store_down("globex", ResourceType::Resources)).await;
        emit(&sink, hit(Scope::Tenant, "acme")).await;

        assert_eq!(sink.fail_opens(), 3);
        assert_eq!(sink.fail_opens_for("acme"), 2);
        assert_eq!(sink.fail_opens_for("globex"), 1);
        assert_eq!(sink.fail_opens_for("initech"), 0);
        assert_eq!(sink.limit_hits(), 1);
    }

    #[tokio::test]
    async fn limit_hits_are_counted_per_scope() {
        let sink = MemorySink::new();
        for scope in [Scope::Endpoint, Scope::Tenant, Scope::Tenant, Scope::Global] {
            emit(&sink, hit(scope, "t")).await;
        }
        emit(
            &sink,
            RateLimitEvent::PageSizeRejected {
                resource: ResourceType::Resources,
                tenant: "t".into(),
                max_size: 100,
                received: 250,
            },
        )
        .await;

        assert_eq!(sink.limit_hits_in(Scope::Tenant), 2);
        assert_eq!(sink.limit_hits_in(Scope::Endpoint), 1);
        assert_eq!(sink.limit_hits_in(Scope::Resource), 0);
        assert_eq!(sink.page_size_rejections(), 1);
    }

    #[tokio::test]
    async fn full_buffer_drops_oldest_event() {
        let sink = MemorySink::with_capacity(2);
        emit(&sink, hit(Scope::Global, "first")).await;
        emit(&sink, store_down("second", ResourceType::Resources)).await;
        emit(&sink, hit(Scope::Global, "third")).await;

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.dropped(), 1);
        let tenants: Vec<String> = sink.events().iter().map(|e| e.tenant().to_string()).collect();
        assert_eq!(tenants, ["second", "third"]);

        sink.clear();
        assert!(sink.is_empty());
        assert_eq!(sink.fail_opens(), 0);
    }

    #[tokio::test]
    async fn fanout_delivers_to_both_sinks() {
        let logs = MemorySink::new();
        let metrics = MemorySink::new();
        let fanout = Fanout::new(logs.clone(), Fanout::new(NullSink, metrics.clone()));

        emit(&fanout, store_down("acme", ResourceType::DeploymentManagers)).await;
        emit(&fanout, hit(Scope::Endpoint, "acme")).await;

        assert_eq!(logs.events(), metrics.events());
        assert_eq!(metrics.fail_opens_for("acme"), 1);
        assert_eq!(metrics.limit_hits_in(Scope::Endpoint), 1);
    }

    #[tokio::test]
    async fn log_sink_accepts_every_event_kind() {
        emit(&LogSink, hit(Scope::Tenant, "t")).await;
        emit(&LogSink, store_down("t", ResourceType::Resources)).await;
        let page = RateLimitEvent::PageSizeRejected {
            resource: ResourceType::Resources,
            tenant: "t".into(),
            max_size: 1,
            received: 2,
        };
        assert_eq!(LogSink.oneshot(page).await, Ok(()));
    }
}
