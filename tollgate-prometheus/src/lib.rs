//! Prometheus metrics sink for `tollgate`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.
//!
//! | Metric | Labels |
//! |---|---|
//! | `tollgate_rate_limit_hits_total` | `limiter`, `scope`, `resource_type`, `operation` |
//! | `tollgate_fail_open_total` | `limiter`, `scope`, `resource_type`, `operation`, `tenant` |
//! | `tollgate_page_size_rejections_total` | `resource_type` |
//!
//! Token-bucket events carry no resource, so their `resource_type` and `operation` labels
//! are empty.

use prometheus::{IntCounterVec, Opts, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use tollgate::telemetry::RateLimitEvent;

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    hits: IntCounterVec,
    fail_opens: IntCounterVec,
    page_size_rejections: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let hits = IntCounterVec::new(
            Opts::new("tollgate_rate_limit_hits_total", "Requests rejected with 429"),
            &["limiter", "scope", "resource_type", "operation"],
        )?;
        let fail_opens = IntCounterVec::new(
            Opts::new(
                "tollgate_fail_open_total",
                "Limit checks skipped because the counter store failed or timed out",
            ),
            &["limiter", "scope", "resource_type", "operation", "tenant"],
        )?;
        let page_size_rejections = IntCounterVec::new(
            Opts::new("tollgate_page_size_rejections_total", "List requests rejected with 400"),
            &["resource_type"],
        )?;
        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(fail_opens.clone()))?;
        registry.register(Box::new(page_size_rejections.clone()))?;
        Ok(Self { registry, hits, fail_opens, page_size_rejections })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl tower_service::Service<RateLimitEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: RateLimitEvent) -> Self::Future {
        match &event {
            RateLimitEvent::LimitExceeded(hit) => {
                let (resource, operation) = labels(hit.resource);
                self.hits
                    .with_label_values(&[hit.limiter.as_str(), hit.scope.as_str(), resource, operation])
                    .inc();
            }
            RateLimitEvent::FailOpen(fo) => {
                let (resource, operation) = labels(fo.resource);
                self.fail_opens
                    .with_label_values(&[
                        fo.limiter.as_str(),
                        fo.scope.as_str(),
                        resource,
                        operation,
                        fo.tenant.as_str(),
                    ])
                    .inc();
            }
            RateLimitEvent::PageSizeRejected { resource, .. } => {
                self.page_size_rejections.with_label_values(&[resource.as_str()]).inc();
            }
        }
        ready(Ok(()))
    }
}

fn labels(
    resource: Option<(tollgate::ResourceType, tollgate::OperationType)>,
) -> (&'static str, &'static str) {
    resource.map_or(("", ""), |(r, op)| (r.as_str(), op.as_str()))
}
