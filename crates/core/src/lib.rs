//! mcpsync core types: resource identity, denormalized snapshots and the
//! change envelope flowing from informers into the debounce buffer.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod classify;

pub use classify::{extract_data, identifier_of, is_relevant_change, should_skip_resource};

/// Namespace sentinel used for cluster-scoped resources.
pub const CLUSTER_SCOPE: &str = "_cluster";

/// Identity of a single resource as seen by the downstream index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    pub namespace: String,
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl ResourceIdentifier {
    /// Build an identifier; `None` or an empty namespace maps to [`CLUSTER_SCOPE`].
    pub fn new(namespace: Option<&str>, api_version: &str, kind: &str, name: &str) -> Self {
        let namespace = match namespace {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => CLUSTER_SCOPE.to_string(),
        };
        Self { namespace, api_version: api_version.to_string(), kind: kind.to_string(), name: name.to_string() }
    }

    pub fn is_cluster_scoped(&self) -> bool { self.namespace == CLUSTER_SCOPE }

    /// Canonical `{namespace}:{apiVersion}:{kind}:{name}` key.
    ///
    /// Namespace, apiVersion and kind never contain `:`, but names can (RBAC
    /// objects such as `system:aggregate-to-admin`). The name is last, so
    /// splitting on the first three colons recovers every field and the
    /// mapping stays injective.
    pub fn build_id(&self) -> String {
        format!("{}:{}:{}:{}", self.namespace, self.api_version, self.kind, self.name)
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.build_id()) }
}

/// Snapshot of a resource at observation time, shipped as an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceData {
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl ResourceData {
    pub fn identifier(&self) -> ResourceIdentifier {
        ResourceIdentifier::new(Some(&self.namespace), &self.api_version, &self.kind, &self.name)
    }

    pub fn id(&self) -> String { self.identifier().build_id() }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeAction {
    Upsert,
    Delete,
}

/// Change envelope keyed by resource ID.
///
/// `data` is only set for upserts and `delete_identifier` only for deletes;
/// use the constructors to keep that pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub action: ChangeAction,
    pub id: String,
    pub data: Option<ResourceData>,
    pub delete_identifier: Option<ResourceIdentifier>,
}

impl ResourceChange {
    pub fn upsert(data: ResourceData) -> Self {
        Self { action: ChangeAction::Upsert, id: data.id(), data: Some(data), delete_identifier: None }
    }

    pub fn delete(identifier: ResourceIdentifier) -> Self {
        Self { action: ChangeAction::Delete, id: identifier.build_id(), data: None, delete_identifier: Some(identifier) }
    }

    pub fn is_upsert(&self) -> bool { self.action == ChangeAction::Upsert }
    pub fn is_delete(&self) -> bool { self.action == ChangeAction::Delete }
}

/// Group/Version/Resource of a watched type. The core group is the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn is_subresource(&self) -> bool { self.resource.contains('/') }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

pub mod prelude {
    pub use super::{
        extract_data, identifier_of, is_relevant_change, should_skip_resource, ChangeAction, Gvr, ResourceChange,
        ResourceData, ResourceIdentifier, CLUSTER_SCOPE,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_id_maps_missing_namespace_to_cluster() {
        let id = ResourceIdentifier::new(None, "v1", "Node", "worker-1");
        assert!(id.is_cluster_scoped());
        assert_eq!(id.build_id(), "_cluster:v1:Node:worker-1");
        let empty = ResourceIdentifier::new(Some(""), "v1", "Node", "worker-1");
        assert_eq!(empty.build_id(), id.build_id());
    }

    #[test]
    fn build_id_is_deterministic_and_distinguishes_every_field() {
        let base = ResourceIdentifier::new(Some("default"), "apps/v1", "Deployment", "web");
        assert_eq!(base.build_id(), "default:apps/v1:Deployment:web");
        assert_eq!(base.build_id(), base.clone().build_id());

        let variants = [
            ResourceIdentifier::new(Some("prod"), "apps/v1", "Deployment", "web"),
            ResourceIdentifier::new(Some("default"), "apps/v1beta1", "Deployment", "web"),
            ResourceIdentifier::new(Some("default"), "apps/v1", "StatefulSet", "web"),
            ResourceIdentifier::new(Some("default"), "apps/v1", "Deployment", "api"),
            ResourceIdentifier::new(None, "apps/v1", "Deployment", "web"),
        ];
        for v in &variants {
            assert_ne!(v.build_id(), base.build_id(), "{v:?}");
        }
    }

    #[test]
    fn build_id_keeps_colons_in_names() {
        let id = ResourceIdentifier::new(None, "rbac.authorization.k8s.io/v1", "ClusterRole", "system:aggregate-to-admin");
        let built = id.build_id();
        assert_eq!(built, "_cluster:rbac.authorization.k8s.io/v1:ClusterRole:system:aggregate-to-admin");
        let parts: Vec<&str> = built.splitn(4, ':').collect();
        assert_eq!(parts, vec!["_cluster", "rbac.authorization.k8s.io/v1", "ClusterRole", "system:aggregate-to-admin"]);

        let other = ResourceIdentifier::new(None, "rbac.authorization.k8s.io/v1", "ClusterRole", "system:aggregate-to-edit");
        assert_ne!(built, other.build_id());
    }

    #[test]
    fn change_constructors_pair_payloads() {
        let id = ResourceIdentifier::new(Some("ns"), "v1", "Pod", "p");
        let del = ResourceChange::delete(id.clone());
        assert!(del.is_delete());
        assert_eq!(del.id, "ns:v1:Pod:p");
        assert!(del.data.is_none());
        assert_eq!(del.delete_identifier, Some(id));
    }

    #[test]
    fn gvr_display_and_subresource() {
        assert_eq!(Gvr::new("", "v1", "pods").to_string(), "v1/pods");
        assert_eq!(Gvr::new("apps", "v1", "deployments").api_version(), "apps/v1");
        assert!(Gvr::new("", "v1", "pods/log").is_subresource());
    }
}
