//! Limiter configuration.
//!
//! Configs are plain `serde` structs so they can come from whatever loader the host
//! process uses. Numeric limits are signed on purpose: a negative value must be seen (and
//! rejected) rather than silently wrapped. Validation compiles a config into immutable
//! policy tables. Zero is accepted everywhere. On an enabled limiter, a zero that switches
//! off a limit which is otherwise on (a rate, a per-operation budget) logs a startup
//! warning. Zeros that mean "derive" or "unset" (burst sizes, the global scope, per-resource
//! page-size overrides) are silent, as is everything on a disabled limiter.

use crate::classify::{OperationType, ResourceType};
use crate::error::ConfigError;
use http::Method;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Default namespace for counter-store keys.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit";
/// Default bound on a single counter-store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// Token-bucket limiter settings (endpoint, tenant and global scopes).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Per-tenant refill rate.
    pub requests_per_second: f64,
    /// Per-tenant bucket size; 0 derives it from the rate.
    pub burst_size: i64,
    /// Rate shared by every caller; 0 leaves the global scope unconfigured.
    pub global_requests_per_second: f64,
    /// Global bucket size; 0 means twice the global rate.
    pub global_burst_size: i64,
    /// Per-tenant limits for exact endpoints, keyed `"METHOD /path"`.
    pub endpoints: BTreeMap<String, EndpointLimit>,
    pub key_prefix: String,
    pub store_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 100.0,
            burst_size: 200,
            global_requests_per_second: 0.0,
            global_burst_size: 0,
            endpoints: BTreeMap::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EndpointLimit {
    pub requests_per_second: f64,
    pub burst_size: i64,
}

/// Resource limiter settings (sliding windows per resource type and operation).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    pub enabled: bool,
    pub deployment_managers: ResourcePolicy,
    pub resource_pools: ResourcePolicy,
    pub resources: ResourcePolicy,
    pub resource_types: ResourcePolicy,
    pub subscriptions: SubscriptionPolicy,
    /// Page-size ceiling for resource types without their own.
    pub default_max_page_size: i64,
    /// Query parameter carrying the requested page size.
    pub page_size_param: String,
    pub key_prefix: String,
    pub store_timeout_ms: u64,
}

impl Default for ResourceLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            deployment_managers: ResourcePolicy::new(600, 120, 30, 30, 100),
            resource_pools: ResourcePolicy::new(600, 120, 60, 60, 500),
            resources: ResourcePolicy::new(1200, 300, 120, 120, 1000),
            resource_types: ResourcePolicy::new(600, 120, 30, 30, 500),
            subscriptions: SubscriptionPolicy::default(),
            default_max_page_size: 1000,
            page_size_param: "limit".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Per-minute limits for one resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub reads_per_minute: i64,
    pub lists_per_minute: i64,
    pub writes_per_minute: i64,
    pub deletes_per_minute: i64,
    /// 0 falls back to `default_max_page_size`.
    pub max_page_size: i64,
}

impl ResourcePolicy {
    pub const fn new(reads: i64, lists: i64, writes: i64, deletes: i64, max_page_size: i64) -> Self {
        Self {
            reads_per_minute: reads,
            lists_per_minute: lists,
            writes_per_minute: writes,
            deletes_per_minute: deletes,
            max_page_size,
        }
    }
}

/// Subscriptions are costly to create, so creation is limited per hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionPolicy {
    pub creates_per_hour: i64,
    /// Ceiling on concurrently active subscriptions per tenant, enforced by the
    /// subscription handler.
    pub max_active: i64,
    /// Shared by read, list and delete.
    pub reads_per_minute: i64,
}

impl Default for SubscriptionPolicy {
    fn default() -> Self {
        Self { creates_per_hour: 100, max_active: 50, reads_per_minute: 300 }
    }
}

/// Continuous-refill policy for one scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    pub rate: f64,
    pub burst: u64,
}

/// Discrete window policy for one (resource type, operation) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub limit: u64,
    pub window: Duration,
}

/// Validated token-bucket scopes. `None` means the scope is not configured.
#[derive(Debug, Clone, Default)]
pub struct BucketPolicies {
    pub tenant: Option<BucketPolicy>,
    pub global: Option<BucketPolicy>,
    pub endpoints: HashMap<String, BucketPolicy>,
}

impl BucketPolicies {
    pub fn endpoint(&self, method: &Method, path: &str) -> Option<BucketPolicy> {
        if self.endpoints.is_empty() {
            return None;
        }
        self.endpoints.get(&endpoint_key(method, path)).copied()
    }
}

fn endpoint_key(method: &Method, path: &str) -> String {
    format!("{} {}", method, path)
}

impl RateLimitConfig {
    /// Bound on each store call; 0 falls back to the default.
    pub fn store_timeout(&self) -> Duration {
        store_timeout(self.store_timeout_ms)
    }

    /// Validate and compile the scope table.
    ///
    /// # Errors
    /// Negative or non-finite values, and endpoint keys not shaped `"METHOD /path"`.
    pub fn compile(&self) -> Result<BucketPolicies, ConfigError> {
        let warn = self.enabled;
        let tenant_rate = rate("rate_limit.requests_per_second", self.requests_per_second, warn)?;
        let tenant_burst = count("rate_limit.burst_size", self.burst_size, false)?;
        let global_rate =
            rate("rate_limit.global_requests_per_second", self.global_requests_per_second, false)?;
        let global_burst = count("rate_limit.global_burst_size", self.global_burst_size, false)?;

        let mut endpoints = HashMap::with_capacity(self.endpoints.len());
        for (key, limit) in &self.endpoints {
            let (method, path) = parse_endpoint(key)?;
            let field = format!("rate_limit.endpoints[{key}]");
            let r = rate(&format!("{field}.requests_per_second"), limit.requests_per_second, warn)?;
            let b = count(&format!("{field}.burst_size"), limit.burst_size, false)?;
            if let Some(policy) = scoped_policy(r, b) {
                endpoints.insert(endpoint_key(&method, path), policy);
            }
        }

        Ok(BucketPolicies {
            tenant: scoped_policy(tenant_rate, tenant_burst),
            global: global_policy(global_rate, global_burst),
            endpoints,
        })
    }
}

fn scoped_policy(rate: f64, burst: u64) -> Option<BucketPolicy> {
    if rate == 0.0 {
        return None;
    }
    let burst = if burst > 0 { burst } else { (rate.ceil() as u64).max(1) };
    Some(BucketPolicy { rate, burst })
}

/// Global burst defaults to twice the rate; a zero rate leaves the scope unconfigured.
fn global_policy(rate: f64, burst: u64) -> Option<BucketPolicy> {
    let burst = if burst > 0 { burst } else { (rate * 2.0).ceil() as u64 };
    if rate == 0.0 || burst == 0 {
        return None;
    }
    Some(BucketPolicy { rate, burst })
}

fn parse_endpoint(key: &str) -> Result<(Method, &str), ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint(key.to_string());
    let (method, path) = key.trim().split_once(' ').ok_or_else(invalid)?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| invalid())?;
    let path = path.trim();
    if !path.starts_with('/') || path.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok((method, path))
}

/// Validated resource limiter tables.
#[derive(Debug, Clone, Default)]
pub struct WindowPolicies {
    windows: HashMap<(ResourceType, OperationType), WindowPolicy>,
    page_sizes: HashMap<ResourceType, u64>,
    default_max_page_size: u64,
    max_active_subscriptions: u64,
}

impl WindowPolicies {
    /// `None` when the pair has no resource-level limit.
    pub fn window(&self, resource: ResourceType, operation: OperationType) -> Option<WindowPolicy> {
        self.windows.get(&(resource, operation)).copied()
    }

    /// Page-size ceiling for `resource`; 0 means unbounded.
    pub fn max_page_size(&self, resource: ResourceType) -> u64 {
        self.page_sizes.get(&resource).copied().unwrap_or(self.default_max_page_size)
    }

    pub fn max_active_subscriptions(&self) -> u64 {
        self.max_active_subscriptions
    }
}

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

impl ResourceLimitConfig {
    /// Bound on each store call; 0 falls back to the default.
    pub fn store_timeout(&self) -> Duration {
        store_timeout(self.store_timeout_ms)
    }

    /// Validate and compile the per-resource tables.
    ///
    /// # Errors
    /// Any negative limit.
    pub fn compile(&self) -> Result<WindowPolicies, ConfigError> {
        let warn = self.enabled;
        let mut out = WindowPolicies {
            default_max_page_size: count(
                "resource_limit.default_max_page_size",
                self.default_max_page_size,
                warn,
            )?,
            ..WindowPolicies::default()
        };

        let table = [
            (ResourceType::DeploymentManagers, "deployment_managers", &self.deployment_managers),
            (ResourceType::ResourcePools, "resource_pools", &self.resource_pools),
            (ResourceType::Resources, "resources", &self.resources),
            (ResourceType::ResourceTypes, "resource_types", &self.resource_types),
        ];
        for (resource, name, policy) in table {
            let ops = [
                (OperationType::Read, "reads_per_minute", policy.reads_per_minute),
                (OperationType::List, "lists_per_minute", policy.lists_per_minute),
                (OperationType::Write, "writes_per_minute", policy.writes_per_minute),
                (OperationType::Delete, "deletes_per_minute", policy.deletes_per_minute),
            ];
            for (operation, field, value) in ops {
                let limit = count(&format!("resource_limit.{name}.{field}"), value, warn)?;
                out.insert(resource, operation, limit, MINUTE);
            }
            let max = count(&format!("resource_limit.{name}.max_page_size"), policy.max_page_size, false)?;
            if max > 0 {
                out.page_sizes.insert(resource, max);
            }
        }

        let subs = &self.subscriptions;
        let creates = count("resource_limit.subscriptions.creates_per_hour", subs.creates_per_hour, warn)?;
        let reads = count("resource_limit.subscriptions.reads_per_minute", subs.reads_per_minute, warn)?;
        out.max_active_subscriptions =
            count("resource_limit.subscriptions.max_active", subs.max_active, warn)?;
        out.insert(ResourceType::Subscriptions, OperationType::Write, creates, HOUR);
        for operation in [OperationType::Read, OperationType::List, OperationType::Delete] {
            out.insert(ResourceType::Subscriptions, operation, reads, MINUTE);
        }

        Ok(out)
    }
}

impl WindowPolicies {
    fn insert(&mut self, resource: ResourceType, operation: OperationType, limit: u64, window: Duration) {
        if limit > 0 {
            self.windows.insert((resource, operation), WindowPolicy { limit, window });
        }
    }
}

fn store_timeout(millis: u64) -> Duration {
    if millis == 0 {
        return DEFAULT_STORE_TIMEOUT;
    }
    Duration::from_millis(millis)
}

fn rate(field: &str, value: f64, warn_zero: bool) -> Result<f64, ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::not_finite(field, value));
    }
    if value < 0.0 {
        return Err(ConfigError::negative(field, value));
    }
    if value == 0.0 && warn_zero {
        tracing::warn!(field, "rate limit is zero; limit effectively disabled");
    }
    Ok(value)
}

fn count(field: &str, value: i64, warn_zero: bool) -> Result<u64, ConfigError> {
    let out = u64::try_from(value).map_err(|_| ConfigError::negative(field, value))?;
    if out == 0 && warn_zero {
        tracing::warn!(field, "rate limit is zero; limit effectively disabled");
    }
    Ok(out)
}
