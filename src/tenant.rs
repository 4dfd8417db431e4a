//! Tenant resolution.
//!
//! Both middleware stages call [`resolve_tenant`], so one caller always maps to one
//! rate-limit identity regardless of which stage is asking.

use axum::extract::ConnectInfo;
use http::Request;
use std::net::SocketAddr;

/// Header carrying an explicit tenant when upstream auth did not attach one.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Identity used when nothing else is known about the caller.
pub const ANONYMOUS_TENANT: &str = "anonymous";

/// Tenant identity placed in request extensions by upstream authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Resolve the caller's tenant. Never fails and never returns an empty string.
///
/// Precedence: authenticated [`TenantId`] extension, then the `X-Tenant-ID` header, then
/// the peer address from [`ConnectInfo`].
pub fn resolve_tenant<B>(req: &Request<B>) -> String {
    if let Some(id) = req.extensions().get::<TenantId>() {
        let id = id.as_str().trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }

    if let Some(id) = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return id.to_string();
    }

    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => ANONYMOUS_TENANT.to_string(),
    }
}
