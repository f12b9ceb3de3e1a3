//! Route objects and the events that describe changes to them.
//!
//! Routes arrive as untyped JSON documents shaped like the cluster's route
//! resources. Only two things are ever read from them: the object identity
//! under `metadata` and the exposed host under `spec.host`. Both lookups live
//! here so nothing else depends on the document layout.

use serde_json::Value;

/// A change to a watched route object.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEvent {
    /// A route appeared.
    Added(Value),
    /// A route changed. Both the previous and the current object are carried
    /// so a host rename can be unexposed and re-exposed.
    Updated { old: Value, new: Value },
    /// A route went away. Carries the last known object.
    Deleted(Value),
}

/// The host a route exposes, read from `spec.host`.
pub fn route_host(route: &Value) -> Option<&str> {
    route.pointer("/spec/host").and_then(Value::as_str)
}

/// Identity of a route: `namespace/name`, or just `name` for cluster-scoped
/// objects.
pub fn route_key(route: &Value) -> Option<String> {
    let name = route.pointer("/metadata/name").and_then(Value::as_str)?;
    match route.pointer("/metadata/namespace").and_then(Value::as_str) {
        Some(ns) if !ns.is_empty() => Some(format!("{}/{}", ns, name)),
        _ => Some(name.to_string()),
    }
}
