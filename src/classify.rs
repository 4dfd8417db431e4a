//! Request classification: HTTP method + path to (resource type, operation).
//!
//! Paths are matched segment-wise against an ordered route table. The first route that
//! matches wins, so nested routes (pools under a manager, resources under a pool) sit
//! ahead of the broader item routes that would otherwise swallow them.

use http::Method;
use std::fmt;

/// Prefix under which the inventory API is usually mounted. Paths carrying it classify
/// the same as bare paths.
pub const API_BASE_PATH: &str = "/o2ims-infrastructureInventory/v1";

/// Kind of inventory object a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    DeploymentManagers,
    ResourcePools,
    Resources,
    ResourceTypes,
    Subscriptions,
    Unknown,
}

impl ResourceType {
    /// Stable label used in headers, bodies, store keys and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeploymentManagers => "deployment-managers",
            Self::ResourcePools => "resource-pools",
            Self::Resources => "resources",
            Self::ResourceTypes => "resource-types",
            Self::Subscriptions => "subscriptions",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the request does to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Read,
    List,
    Write,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::List => "list",
            Self::Write => "write",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    /// Path has exactly the route's segments.
    Collection,
    /// Path has the route's segments plus at least one more.
    Item,
}

struct Route {
    segments: &'static [&'static str],
    resource: ResourceType,
    shape: Shape,
}

const fn route(segments: &'static [&'static str], resource: ResourceType, shape: Shape) -> Route {
    Route { segments, resource, shape }
}

// `*` matches exactly one segment. Order matters.
static ROUTES: &[Route] = &[
    route(&["deploymentManagers", "*", "resourcePools"], ResourceType::ResourcePools, Shape::Collection),
    route(&["deploymentManagers", "*", "resourcePools"], ResourceType::ResourcePools, Shape::Item),
    route(&["deploymentManagers"], ResourceType::DeploymentManagers, Shape::Collection),
    route(&["deploymentManagers"], ResourceType::DeploymentManagers, Shape::Item),
    route(&["resourcePools", "*", "resources"], ResourceType::Resources, Shape::Collection),
    route(&["resourcePools", "*", "resources"], ResourceType::Resources, Shape::Item),
    route(&["resourcePools"], ResourceType::ResourcePools, Shape::Collection),
    route(&["resourcePools"], ResourceType::ResourcePools, Shape::Item),
    route(&["resourceTypes"], ResourceType::ResourceTypes, Shape::Collection),
    route(&["resourceTypes"], ResourceType::ResourceTypes, Shape::Item),
    route(&["resources"], ResourceType::Resources, Shape::Collection),
    route(&["resources"], ResourceType::Resources, Shape::Item),
    route(&["subscriptions"], ResourceType::Subscriptions, Shape::Collection),
    route(&["subscriptions"], ResourceType::Subscriptions, Shape::Item),
];

impl Route {
    fn matches(&self, path: &[&str]) -> bool {
        let len_ok = match self.shape {
            Shape::Collection => path.len() == self.segments.len(),
            Shape::Item => path.len() > self.segments.len(),
        };
        len_ok && self.segments.iter().zip(path).all(|(want, got)| *want == "*" || want == got)
    }
}

/// Classify a request. Pure and infallible: anything unmatched is `(Unknown, Read)`.
pub fn classify(method: &Method, path: &str) -> (ResourceType, OperationType) {
    let path = strip_base(path);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let Some(route) = ROUTES.iter().find(|r| r.matches(&segments)) else {
        return (ResourceType::Unknown, OperationType::Read);
    };

    let operation = match *method {
        Method::GET if route.shape == Shape::Collection => OperationType::List,
        Method::GET => OperationType::Read,
        Method::POST | Method::PUT | Method::PATCH => OperationType::Write,
        Method::DELETE => OperationType::Delete,
        _ => OperationType::Read,
    };
    (route.resource, operation)
}

fn strip_base(path: &str) -> &str {
    match path.strip_prefix(API_BASE_PATH) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => path,
    }
}
