//! Rate-limit response contract: header names, rejection bodies and statuses.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::StatusCode;
use serde::Serialize;

use super::Decision;
use crate::classify::{OperationType, ResourceType};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATELIMIT_RESOURCE: HeaderName = HeaderName::from_static("x-ratelimit-resource");

/// Header values describing the decision that governed a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds.
    pub reset: u64,
    /// Set by the resource limiter only.
    pub resource: Option<ResourceType>,
}

impl RateLimitHeaders {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            limit: decision.limit,
            remaining: decision.remaining,
            reset: decision.reset_at,
            resource: None,
        }
    }

    pub fn with_resource(mut self, resource: ResourceType) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Write the headers, replacing any earlier values so the set stays consistent.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
        match self.resource {
            Some(resource) => {
                headers.insert(X_RATELIMIT_RESOURCE, HeaderValue::from_static(resource.as_str()));
            }
            None => {
                headers.remove(X_RATELIMIT_RESOURCE);
            }
        }
    }
}

/// JSON bodies for rejected requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RejectionBody {
    /// `{"error":"rate limit exceeded","retry_after":N}`
    RateLimitExceeded { error: &'static str, retry_after: u64 },
    /// `{"error":"resource rate limit exceeded","resource_type":..,"operation":..,"retry_after":N}`
    ResourceLimitExceeded {
        error: &'static str,
        resource_type: &'static str,
        operation: &'static str,
        retry_after: u64,
    },
    /// `{"error":"page size exceeds maximum","max_size":N,"received":N}`
    PageSizeExceeded { error: &'static str, max_size: u64, received: u64 },
}

impl RejectionBody {
    pub fn rate_limit_exceeded(retry_after: u64) -> Self {
        Self::RateLimitExceeded { error: "rate limit exceeded", retry_after }
    }

    pub fn resource_limit_exceeded(
        resource: ResourceType,
        operation: OperationType,
        retry_after: u64,
    ) -> Self {
        Self::ResourceLimitExceeded {
            error: "resource rate limit exceeded",
            resource_type: resource.as_str(),
            operation: operation.as_str(),
            retry_after,
        }
    }

    pub fn page_size_exceeded(max_size: u64, received: u64) -> Self {
        Self::PageSizeExceeded { error: "page size exceeds maximum", max_size, received }
    }
}

/// A short-circuit response: 429 for limit hits, 400 for oversized pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub headers: Option<RateLimitHeaders>,
    /// Seconds, sent as `Retry-After`.
    pub retry_after: Option<u64>,
    pub body: RejectionBody,
}

impl Rejection {
    pub fn too_many_requests(headers: RateLimitHeaders, retry_after: u64, body: RejectionBody) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: Some(headers),
            retry_after: Some(retry_after),
            body,
        }
    }

    pub fn bad_request(body: RejectionBody) -> Self {
        Self { status: StatusCode::BAD_REQUEST, headers: None, retry_after: None, body }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let payload = serde_json::to_vec(&self.body).unwrap_or_default();
        let mut response = Response::new(Body::from(payload));
        *response.status_mut() = self.status;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(h) = &self.headers {
            h.apply(headers);
        }
        if let Some(secs) = self.retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
