#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tollgate::rate_limit::{
    BucketReply, CounterStore, InMemoryCounterStore, SlidingWindowRequest, TokenBucketRequest,
    WindowReply,
};
use tollgate::{RequestInfo, StoreError};

/// Every call fails as if the store host refused the connection.
#[derive(Clone, Default)]
pub struct UnreachableStore {
    pub calls: Arc<AtomicUsize>,
}

impl UnreachableStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for UnreachableStore {
    async fn take_token(&self, _req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn record_hit(&self, _req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn health(&self) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Never answers.
#[derive(Clone, Default)]
pub struct HangingStore;

#[async_trait]
impl CounterStore for HangingStore {
    async fn take_token(&self, _req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError> {
        futures::future::pending().await
    }

    async fn record_hit(&self, _req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError> {
        futures::future::pending().await
    }
}

/// In-memory store that counts round trips.
#[derive(Clone, Default)]
pub struct CountingStore {
    pub inner: InMemoryCounterStore,
    pub calls: Arc<AtomicUsize>,
}

impl CountingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CounterStore for CountingStore {
    async fn take_token(&self, req: TokenBucketRequest<'_>) -> Result<BucketReply, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.take_token(req).await
    }

    async fn record_hit(&self, req: SlidingWindowRequest<'_>) -> Result<WindowReply, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.record_hit(req).await
    }
}

pub fn request(method: Method, uri: &str, tenant: &str) -> RequestInfo {
    let req = http::Request::builder()
        .method(method)
        .uri(uri)
        .header("x-tenant-id", tenant)
        .body(())
        .expect("valid request");
    RequestInfo::from_request(&req)
}
