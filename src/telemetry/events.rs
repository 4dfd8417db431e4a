use std::fmt;

use crate::classify::{OperationType, ResourceType};
use crate::rate_limit::Scope;

/// Which limiter produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterKind {
    TokenBucket,
    Resource,
}

impl LimiterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimiterKind::TokenBucket => "token_bucket",
            LimiterKind::Resource => "resource",
        }
    }
}

/// Rate-limit events emitted during request evaluation.
///
/// Allowed requests emit nothing; every rejection and every fail-open does. Operators
/// watch `FailOpen` to see when enforcement is bypassed because the store is degraded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitEvent {
    /// A scope rejected the request with 429.
    LimitExceeded(LimitHit),
    /// A list request asked for more than the maximum page size (400).
    PageSizeRejected {
        resource: ResourceType,
        tenant: String,
        max_size: u64,
        received: u64,
    },
    /// The store failed or timed out and the request was allowed unchecked.
    FailOpen(FailOpen),
}

/// Details of a limit hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitHit {
    pub limiter: LimiterKind,
    pub scope: Scope,
    pub tenant: String,
    /// Resource limiter only.
    pub resource: Option<(ResourceType, OperationType)>,
}

/// Details of a fail-open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailOpen {
    pub limiter: LimiterKind,
    pub scope: Scope,
    pub tenant: String,
    /// Resource limiter only.
    pub resource: Option<(ResourceType, OperationType)>,
    pub error: String,
}

impl RateLimitEvent {
    pub fn limiter(&self) -> LimiterKind {
        match self {
            RateLimitEvent::LimitExceeded(hit) => hit.limiter,
            RateLimitEvent::PageSizeRejected { .. } => LimiterKind::Resource,
            RateLimitEvent::FailOpen(f) => f.limiter,
        }
    }

    /// Tenant the rejected or unchecked request belonged to.
    pub fn tenant(&self) -> &str {
        match self {
            RateLimitEvent::LimitExceeded(hit) => &hit.tenant,
            RateLimitEvent::PageSizeRejected { tenant, .. } => tenant,
            RateLimitEvent::FailOpen(f) => &f.tenant,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            RateLimitEvent::LimitExceeded(hit) => hit.scope,
            RateLimitEvent::PageSizeRejected { .. } => Scope::Resource,
            RateLimitEvent::FailOpen(f) => f.scope,
        }
    }

    /// Resource and operation, for resource-limiter events.
    pub fn resource(&self) -> Option<(ResourceType, OperationType)> {
        match self {
            RateLimitEvent::LimitExceeded(hit) => hit.resource,
            RateLimitEvent::PageSizeRejected { resource, .. } => {
                Some((*resource, OperationType::List))
            }
            RateLimitEvent::FailOpen(f) => f.resource,
        }
    }

    pub fn is_fail_open(&self) -> bool {
        matches!(self, RateLimitEvent::FailOpen(_))
    }

    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, RateLimitEvent::LimitExceeded(_))
    }
}

impl fmt::Display for RateLimitEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitEvent::LimitExceeded(hit) => write!(f, "LimitExceeded::{}", hit),
            RateLimitEvent::PageSizeRejected { resource, tenant, max_size, received } => write!(
                f,
                "PageSizeRejected({}, tenant={}, max={}, received={})",
                resource, tenant, max_size, received
            ),
            RateLimitEvent::FailOpen(fo) => write!(f, "FailOpen::{}", fo),
        }
    }
}

fn write_target(
    f: &mut fmt::Formatter<'_>,
    limiter: LimiterKind,
    scope: Scope,
    tenant: &str,
    resource: Option<(ResourceType, OperationType)>,
) -> fmt::Result {
    write!(f, "{}({}, tenant={}", limiter.as_str(), scope, tenant)?;
    if let Some((r, op)) = resource {
        write!(f, ", {}/{}", r, op)?;
    }
    Ok(())
}

impl fmt::Display for LimitHit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_target(f, self.limiter, self.scope, &self.tenant, self.resource)?;
        write!(f, ")")
    }
}

impl fmt::Display for FailOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_target(f, self.limiter, self.scope, &self.tenant, self.resource)?;
        write!(f, ", error={})", self.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        let hit = RateLimitEvent::LimitExceeded(LimitHit {
            limiter: LimiterKind::Resource,
            scope: Scope::Resource,
            tenant: "t1".into(),
            resource: Some((ResourceType::DeploymentManagers, OperationType::Read)),
        });
        assert_eq!(
            hit.to_string(),
            "LimitExceeded::resource(resource, tenant=t1, deployment-managers/read)"
        );

        let fo = RateLimitEvent::FailOpen(FailOpen {
            limiter: LimiterKind::TokenBucket,
            scope: Scope::Global,
            tenant: "t2".into(),
            resource: None,
            error: "timeout".into(),
        });
        assert_eq!(fo.to_string(), "FailOpen::token_bucket(global, tenant=t2, error=timeout)");
        assert!(fo.is_fail_open());
        assert_eq!(fo.limiter(), LimiterKind::TokenBucket);

        let page = RateLimitEvent::PageSizeRejected {
            resource: ResourceType::Resources,
            tenant: "t3".into(),
            max_size: 100,
            received: 101,
        };
        assert!(page.to_string().contains("max=100"));
        assert_eq!(page.limiter(), LimiterKind::Resource);
        assert!(!page.is_limit_exceeded());
        assert_eq!(page.tenant(), "t3");
        assert_eq!(page.scope(), Scope::Resource);
        assert_eq!(page.resource(), Some((ResourceType::Resources, OperationType::List)));
        assert_eq!(fo.resource(), None);
    }
}
