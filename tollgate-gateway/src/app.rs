//! Router assembly: operational routes plus the rate-limited proxy surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::{header, Request, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use tollgate::{
    classify, resolve_tenant, CounterStore, Fanout, LogSink, RateLimitLayer,
    ResourceLimiter, TokenBucketLimiter,
};
use tollgate_prometheus::PrometheusSink;
use tower::ServiceBuilder;

use crate::config::GatewayConfig;

#[derive(Clone)]
struct AppState {
    store: Arc<dyn CounterStore>,
    registry: Registry,
}

/// Build the gateway router.
///
/// `/healthz` and `/metrics` bypass the limiters. Every other request passes the resource
/// stage, then the token-bucket stage, before reaching the backend handler.
pub fn router(
    config: &GatewayConfig,
    store: Arc<dyn CounterStore>,
    registry: Registry,
) -> anyhow::Result<Router> {
    let sink = Fanout::new(LogSink, PrometheusSink::new(registry.clone())?);

    let buckets = TokenBucketLimiter::builder()
        .config(config.rate_limit.clone())
        .shared_store(store.clone())
        .with_sink(sink.clone())
        .build()?;
    let resources = ResourceLimiter::builder()
        .config(config.resource_limits.clone())
        .shared_store(store.clone())
        .with_sink(sink)
        .build()?;
    tracing::info!(
        token_bucket = buckets.is_enabled(),
        resource = resources.is_enabled(),
        "rate limiters configured"
    );

    let limited = ServiceBuilder::new()
        .layer(RateLimitLayer::new(resources))
        .layer(RateLimitLayer::new(buckets))
        .service_fn(backend);

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(AppState { store, registry })
        .fallback_service(limited))
}

async fn healthz(State(state): State<AppState>) -> Response {
    match state.store.health().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "counter store health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

/// Stand-in for the orchestrator backend: reports what the limiters saw.
async fn backend(req: Request<Body>) -> Result<Response, Infallible> {
    let (resource, operation) = classify(req.method(), req.uri().path());
    let body = serde_json::json!({
        "tenant": resolve_tenant(&req),
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "resource_type": resource.as_str(),
        "operation": operation.as_str(),
    });
    Ok(Json(body).into_response())
}
