mod common;

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::Response;
use common::UnreachableStore;
use http::{Request, StatusCode};
use http_body_util::BodyExt;
use tollgate::{
    InMemoryCounterStore, ManualClock, MemorySink, RateLimitConfig, RateLimitLayer,
    ResourceLimitConfig, ResourceLimiter, TokenBucketLimiter,
};
use tower::{service_fn, util::BoxCloneService, ServiceBuilder, ServiceExt};

type Gateway = BoxCloneService<Request<Body>, Response, Infallible>;

async fn backend(_req: Request<Body>) -> Result<Response, Infallible> {
    Ok(Response::new(Body::from("[]")))
}

fn gateway(buckets: RateLimitConfig, resources: ResourceLimitConfig) -> Gateway {
    let store = InMemoryCounterStore::new();
    let clock = ManualClock::default();
    let buckets = TokenBucketLimiter::builder()
        .config(buckets)
        .store(store.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    let resources = ResourceLimiter::builder()
        .config(resources)
        .store(store)
        .clock(clock)
        .build()
        .unwrap();

    // First layer is outermost: the resource stage runs first and writes headers last.
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(resources))
        .layer(RateLimitLayer::new(buckets))
        .service(service_fn(backend));
    BoxCloneService::new(svc)
}

fn get(uri: &str, tenant: &str) -> Request<Body> {
    Request::get(uri).header("x-tenant-id", tenant).body(Body::empty()).unwrap()
}

async fn json(resp: Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn allowed_response_carries_one_consistent_header_set() {
    let svc = gateway(RateLimitConfig::default(), ResourceLimitConfig::default());
    let resp = svc.oneshot(get("/resources/r1", "t1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let h = resp.headers();
    // Resources allow 1200 reads per minute; the tenant bucket allows 200.
    assert_eq!(h["x-ratelimit-limit"], "1200");
    assert_eq!(h["x-ratelimit-remaining"], "1199");
    assert_eq!(h["x-ratelimit-resource"], "resources");
    assert!(h.get("retry-after").is_none());
}

#[tokio::test]
async fn unclassified_paths_show_token_bucket_headers() {
    let svc = gateway(RateLimitConfig::default(), ResourceLimitConfig::default());
    let resp = svc.oneshot(get("/unknown-endpoint", "t1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-ratelimit-limit"], "200");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "199");
    assert!(resp.headers().get("x-ratelimit-resource").is_none());
}

#[tokio::test]
async fn token_bucket_rejection_contract() {
    let buckets = RateLimitConfig { requests_per_second: 1.0, burst_size: 1, ..Default::default() };
    let svc = gateway(buckets, ResourceLimitConfig::default());

    let first = svc.clone().oneshot(get("/resources", "t1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = svc.oneshot(get("/resources", "t1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let h = second.headers();
    assert_eq!(h["retry-after"], "1");
    assert_eq!(h["x-ratelimit-limit"], "1");
    assert_eq!(h["x-ratelimit-remaining"], "0");
    assert_eq!(h["content-type"], "application/json");
    assert!(h.get("x-ratelimit-resource").is_none());
    assert_eq!(
        json(second).await,
        serde_json::json!({"error": "rate limit exceeded", "retry_after": 1})
    );
}

#[tokio::test]
async fn resource_rejection_contract() {
    let mut resources = ResourceLimitConfig::default();
    resources.deployment_managers.reads_per_minute = 3;
    let svc = gateway(RateLimitConfig::default(), resources);

    for _ in 0..3 {
        let resp = svc.clone().oneshot(get("/deploymentManagers/dm-123", "t1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = svc.oneshot(get("/deploymentManagers/dm-123", "t1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(resp.headers()["retry-after"], "60");
    assert_eq!(resp.headers()["x-ratelimit-resource"], "deployment-managers");
    assert_eq!(
        json(resp).await,
        serde_json::json!({
            "error": "resource rate limit exceeded",
            "resource_type": "deployment-managers",
            "operation": "read",
            "retry_after": 60
        })
    );
}

#[tokio::test]
async fn oversized_page_is_a_bad_request() {
    let svc = gateway(RateLimitConfig::default(), ResourceLimitConfig::default());
    let uri = "/o2ims-infrastructureInventory/v1/deploymentManagers?limit=101";
    let resp = svc.oneshot(get(uri, "t1")).await.unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(resp.headers().get("retry-after").is_none());
    assert_eq!(
        json(resp).await,
        serde_json::json!({"error": "page size exceeds maximum", "max_size": 100, "received": 101})
    );
}

#[tokio::test]
async fn disabled_limiters_add_nothing() {
    let buckets = RateLimitConfig { enabled: false, burst_size: 1, ..Default::default() };
    let resources = ResourceLimitConfig { enabled: false, ..Default::default() };
    let svc = gateway(buckets, resources);

    for _ in 0..50 {
        let resp = svc.clone().oneshot(get("/resources?limit=999999", "t1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get("x-ratelimit-limit").is_none());
        assert!(resp.headers().get("x-ratelimit-resource").is_none());
    }
}

#[tokio::test]
async fn anonymous_callers_are_keyed_by_address() {
    let buckets = RateLimitConfig { requests_per_second: 1.0, burst_size: 1, ..Default::default() };
    let svc = gateway(buckets, ResourceLimitConfig::default());

    let from = |addr: &str| {
        let mut req = Request::get("/unknown").body(Body::empty()).unwrap();
        let addr: SocketAddr = addr.parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    };

    let a1 = svc.clone().oneshot(from("10.0.0.1:5000")).await.unwrap();
    let a2 = svc.clone().oneshot(from("10.0.0.1:5001")).await.unwrap();
    let b1 = svc.oneshot(from("10.0.0.2:5000")).await.unwrap();
    assert_eq!(a1.status(), StatusCode::OK);
    assert_eq!(a2.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(b1.status(), StatusCode::OK);
}

#[tokio::test]
async fn store_outage_fails_open_through_both_stages() {
    let sink = MemorySink::new();
    let store = UnreachableStore::default();
    let buckets = TokenBucketLimiter::builder()
        .store(store.clone())
        .with_sink(sink.clone())
        .build()
        .unwrap();
    let resources = ResourceLimiter::builder()
        .store(store.clone())
        .with_sink(sink.clone())
        .build()
        .unwrap();
    let svc = ServiceBuilder::new()
        .layer(RateLimitLayer::new(resources))
        .layer(RateLimitLayer::new(buckets))
        .service(service_fn(backend));

    let resp = svc.oneshot(get("/resourceTypes/rt-1", "t1")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-ratelimit-limit").is_none());
    // One resource window plus the tenant bucket.
    assert_eq!(store.calls(), 2);
    assert_eq!(sink.fail_opens(), 2);
}
