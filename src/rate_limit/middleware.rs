//! Tower middleware that runs a [`RateLimiter`] in front of an axum service.
//!
//! A rejected request is answered with the limiter's status, headers and JSON body. An
//! admitted request is forwarded and the response gains the `X-RateLimit-*` headers.

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::{Request, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

use crate::rate_limit::response::X_RATELIMIT_LIMIT;
use crate::rate_limit::{RateLimiter, RequestInfo, Verdict};

/// A layer that enforces rate limits using a [`RateLimiter`].
///
/// Stack one layer per limiter. The outermost layer writes its headers last, so when two
/// stages both allow a request the outer stage's `X-RateLimit-*` values are the ones the
/// client sees. A 429 from an inner stage keeps the headers of the scope that rejected it.
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
}

impl<L> RateLimitLayer<L> {
    /// Create a new rate limit layer.
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter) }
    }

    /// Share a limiter that is also used elsewhere, e.g. by a handler.
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self { limiter }
    }
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone() }
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone() }
    }
}

/// Middleware service that enforces rate limits.
///
/// Rejections are answered here and never reach the inner service; limiter trouble never
/// surfaces as an error, so `Error` is the inner service's own.
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), limiter: self.limiter.clone() }
    }
}

impl<S, L> Service<Request<Body>> for RateLimitService<S, L>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    L: RateLimiter + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let limiter = self.limiter.clone();
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let info = RequestInfo::from_request(&req);
            match limiter.evaluate(&info).await {
                Verdict::Reject(rejection) => Ok(rejection.into_response()),
                Verdict::Proceed(headers) => {
                    let mut response = inner.call(req).await?;
                    if let Some(headers) = headers {
                        if !is_limited(&response) {
                            headers.apply(response.headers_mut());
                        }
                    }
                    Ok(response)
                }
            }
        })
    }
}

/// A rejection from an inner limiter stage.
fn is_limited(response: &Response) -> bool {
    response.status() == StatusCode::TOO_MANY_REQUESTS
        && response.headers().contains_key(X_RATELIMIT_LIMIT)
}
