//! Process configuration, read from one JSON document.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;
use tollgate::{RateLimitConfig, ResourceLimitConfig};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    /// Shared counter store. Without one, limits are enforced per process only.
    pub redis_url: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub resource_limits: ResourceLimitConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            redis_url: None,
            rate_limit: RateLimitConfig::default(),
            resource_limits: ResourceLimitConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
