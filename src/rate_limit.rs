//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: the trait each middleware stage evaluates per request.
//! - [`TokenBucketLimiter`]: endpoint → tenant → global scopes with continuous refill.
//! - [`ResourceLimiter`]: sliding windows per resource type and operation, plus page-size
//!   enforcement for list operations.
//! - [`RateLimitLayer`]: tower middleware that applies a limiter's [`Verdict`].
//!
//! # Architecture
//!
//! The system is designed to be modular:
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting works,
//!   only that it should ask a `RateLimiter` and render the verdict.
//! - **Logic**: the limiters pick the policy for a request and interpret store replies.
//! - **Storage**: [`CounterStore`] (in `store`) runs each algorithm as one atomic operation,
//!   in memory or in a shared store such as Redis. Limiters hold no mutable state.

use http::Method;
use std::borrow::Cow;
use std::fmt;

pub mod middleware;
pub mod resource;
pub mod response;
pub mod store;
pub mod strategies;
pub mod token_bucket;

pub use middleware::{RateLimitLayer, RateLimitService};
pub use resource::{ResourceLimiter, ResourceLimiterBuilder};
pub use response::{RateLimitHeaders, Rejection, RejectionBody};
pub use store::{
    BucketReply, CounterStore, InMemoryCounterStore, SlidingWindowRequest, TokenBucketRequest,
    WindowReply,
};
pub use token_bucket::{TokenBucketLimiter, TokenBucketLimiterBuilder};

use crate::classify::{OperationType, ResourceType};

/// Outcome of one scope check, consumed immediately to populate response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds at which the caller may expect capacity again.
    pub reset_at: u64,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Result of checking one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The store answered.
    Checked(Decision),
    /// The store failed or timed out; the request is allowed without accounting.
    FailedOpen,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        match self {
            Admission::Checked(decision) => decision.allowed,
            Admission::FailedOpen => true,
        }
    }

    pub fn decision(&self) -> Option<&Decision> {
        match self {
            Admission::Checked(decision) => Some(decision),
            Admission::FailedOpen => None,
        }
    }
}

/// What a middleware stage should do with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Forward the request, adding these headers to the response if present.
    Proceed(Option<RateLimitHeaders>),
    /// Short-circuit with this response.
    Reject(Rejection),
}

impl Verdict {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Verdict::Reject(_))
    }
}

/// The parts of a request a limiter needs.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub tenant: String,
}

impl RequestInfo {
    /// Capture the request line and resolve the tenant.
    pub fn from_request<B>(req: &http::Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: req.uri().query().map(str::to_string),
            tenant: crate::tenant::resolve_tenant(req),
        }
    }

    /// First value of query parameter `name`, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// Core interface for one middleware stage.
///
/// Implementations must not fail: store trouble resolves to an allowing verdict
/// (fail-open), and limit hits resolve to a rejection.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    async fn evaluate(&self, request: &RequestInfo) -> Verdict;
}

/// Which limiting dimension a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Endpoint,
    Tenant,
    Global,
    Resource,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Endpoint => "endpoint",
            Scope::Tenant => "tenant",
            Scope::Global => "global",
            Scope::Resource => "resource",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter-store key for one scope.
///
/// Rendered as `<prefix>:<scope>:<component>...`. Components are escaped so `:` inside a
/// tenant or path can never make two different scopes render to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    scope: Scope,
    rendered: String,
}

impl RateLimitKey {
    pub fn endpoint(prefix: &str, tenant: &str, method: &Method, path: &str) -> Self {
        Self::build(prefix, Scope::Endpoint, &[tenant, method.as_str(), path])
    }

    pub fn tenant(prefix: &str, tenant: &str) -> Self {
        Self::build(prefix, Scope::Tenant, &[tenant])
    }

    pub fn global(prefix: &str) -> Self {
        Self::build(prefix, Scope::Global, &[])
    }

    pub fn resource(
        prefix: &str,
        tenant: &str,
        resource: ResourceType,
        operation: OperationType,
    ) -> Self {
        Self::build(prefix, Scope::Resource, &[tenant, resource.as_str(), operation.as_str()])
    }

    fn build(prefix: &str, scope: Scope, components: &[&str]) -> Self {
        let mut rendered = String::with_capacity(64);
        rendered.push_str(&escape(prefix));
        rendered.push(':');
        rendered.push_str(scope.as_str());
        for c in components {
            rendered.push(':');
            rendered.push_str(&escape(c));
        }
        Self { scope, rendered }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

fn escape(component: &str) -> Cow<'_, str> {
    if !component.contains([':', '%']) {
        return Cow::Borrowed(component);
    }
    Cow::Owned(component.replace('%', "%25").replace(':', "%3A"))
}
