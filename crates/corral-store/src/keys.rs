//! Key layout for the Corral state store.
//!
//! Nodes are keyed by `/nodes/{id}`; containers by
//! `/namespaces/{ns}/containers/{id}`. Prefix scans over these layouts
//! give stable, key-ordered listings.

/// Namespace used when callers don't specify one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Prefix under which all node records live.
pub const NODE_PREFIX: &str = "/nodes/";

/// Key for a node record.
pub fn node_key(id: &str) -> String {
    format!("{NODE_PREFIX}{id}")
}

/// Prefix under which a namespace's container records live.
pub fn container_prefix(namespace: &str) -> String {
    format!("/namespaces/{namespace}/containers/")
}

/// Key for a container record.
pub fn container_key(namespace: &str, id: &str) -> String {
    format!("/namespaces/{namespace}/containers/{id}")
}
