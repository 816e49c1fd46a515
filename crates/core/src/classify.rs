//! Pure functions deciding what a raw object looks like downstream and which
//! mutations are worth shipping.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value as Json;

use crate::{ResourceData, ResourceIdentifier};

/// Built-in types that churn too much to be worth indexing.
const SKIPPED_RESOURCES: &[(&str, &str)] = &[
    ("", "events"),
    ("events.k8s.io", "events"),
    ("coordination.k8s.io", "leases"),
    ("discovery.k8s.io", "endpointslices"),
];

const DENIED_ANNOTATIONS: &[&str] = &["kubectl.kubernetes.io/last-applied-configuration"];
const DENIED_ANNOTATION_PREFIXES: &[&str] = &["meta.helm.sh/", "helm.sh/"];

// Keys kept verbatim, plus any `<prefix>/<key>` variant of them.
const ALLOWED_ANNOTATIONS: &[&str] = &["description", "summary", "owner", "team", "documentation"];

pub fn should_skip_resource(group: &str, resource: &str) -> bool {
    SKIPPED_RESOURCES.iter().any(|(g, r)| *g == group && *r == resource)
}

fn metadata(obj: &Json) -> Option<&Json> { obj.get("metadata") }

fn str_field<'a>(v: Option<&'a Json>, key: &str) -> Option<&'a str> {
    v.and_then(|m| m.get(key)).and_then(|s| s.as_str())
}

fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

fn labels(obj: &Json) -> BTreeMap<String, String> {
    string_map(metadata(obj).and_then(|m| m.get("labels")))
}

fn annotation_allowed(key: &str) -> bool {
    if DENIED_ANNOTATIONS.contains(&key) || DENIED_ANNOTATION_PREFIXES.iter().any(|p| key.starts_with(p)) {
        return false;
    }
    let short = key.rsplit_once('/').map(|(_, k)| k).unwrap_or(key);
    ALLOWED_ANNOTATIONS.contains(&short)
}

/// Identity of a raw object, tolerating missing fields (delete tombstones may
/// carry little more than a name).
pub fn identifier_of(obj: &Json) -> ResourceIdentifier {
    let meta = metadata(obj);
    ResourceIdentifier::new(
        str_field(meta, "namespace"),
        obj.get("apiVersion").and_then(|s| s.as_str()).unwrap_or_default(),
        obj.get("kind").and_then(|s| s.as_str()).unwrap_or_default(),
        str_field(meta, "name").unwrap_or_default(),
    )
}

/// Build the denormalized snapshot for an object. Labels and annotations are
/// copied out of the source value.
pub fn extract_data(obj: &Json) -> ResourceData {
    let id = identifier_of(obj);
    let annotations = string_map(metadata(obj).and_then(|m| m.get("annotations")))
        .into_iter()
        .filter(|(k, _)| annotation_allowed(k))
        .collect();
    ResourceData {
        name: id.name,
        namespace: id.namespace,
        kind: id.kind,
        api_version: id.api_version,
        labels: labels(obj),
        annotations,
        timestamp: Utc::now(),
    }
}

/// True iff the label set differs. Status, annotations and resourceVersion are
/// not part of the synced projection and never count as a change.
pub fn is_relevant_change(old: &Json, new: &Json) -> bool {
    labels(old) != labels(new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(labels: Json, annotations: Json, rv: &str, status: Json) -> Json {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "default",
                "resourceVersion": rv,
                "labels": labels,
                "annotations": annotations,
            },
            "status": status,
        })
    }

    #[test]
    fn skip_list_is_exact() {
        assert!(should_skip_resource("", "events"));
        assert!(should_skip_resource("events.k8s.io", "events"));
        assert!(should_skip_resource("coordination.k8s.io", "leases"));
        assert!(should_skip_resource("discovery.k8s.io", "endpointslices"));
        assert!(!should_skip_resource("", "pods"));
        assert!(!should_skip_resource("apps", "events"));
        assert!(!should_skip_resource("", "endpoints"));
    }

    #[test]
    fn status_and_resource_version_are_ignored() {
        let old = pod(json!({"app": "web"}), json!({}), "1", json!({"phase": "Pending"}));
        let new = pod(json!({"app": "web"}), json!({}), "2", json!({"phase": "Running"}));
        assert!(!is_relevant_change(&old, &new));
    }

    #[test]
    fn annotations_are_ignored() {
        let old = pod(json!({"app": "web"}), json!({"description": "a"}), "1", json!({}));
        let new = pod(json!({"app": "web"}), json!({"description": "b"}), "1", json!({}));
        assert!(!is_relevant_change(&old, &new));
    }

    #[test]
    fn label_add_remove_and_value_change_are_relevant() {
        let base = pod(json!({"app": "web"}), json!({}), "1", json!({}));
        let added = pod(json!({"app": "web", "tier": "fe"}), json!({}), "2", json!({}));
        let removed = pod(json!({}), json!({}), "2", json!({}));
        let changed = pod(json!({"app": "api"}), json!({}), "2", json!({}));
        assert!(is_relevant_change(&base, &added));
        assert!(is_relevant_change(&base, &removed));
        assert!(is_relevant_change(&base, &changed));

        let bare = json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web-0"}});
        assert!(is_relevant_change(&bare, &base));
        assert!(!is_relevant_change(&bare, &bare));
    }

    #[test]
    fn extract_filters_annotations_and_copies_labels() {
        let obj = pod(
            json!({"app": "web"}),
            json!({
                "kubectl.kubernetes.io/last-applied-configuration": "{}",
                "meta.helm.sh/release-name": "web",
                "helm.sh/chart": "web-1.0",
                "description": "frontend",
                "example.com/owner": "team-a",
                "random": "dropped",
            }),
            "7",
            json!({}),
        );
        let mut data = extract_data(&obj);
        assert_eq!(data.id(), "default:v1:Pod:web-0");
        assert_eq!(data.annotations.len(), 2);
        assert_eq!(data.annotations.get("description").map(String::as_str), Some("frontend"));
        assert!(data.annotations.contains_key("example.com/owner"));

        data.labels.insert("mutated".into(), "yes".into());
        assert!(obj["metadata"]["labels"].get("mutated").is_none());
    }

    #[test]
    fn cluster_scoped_objects_use_sentinel() {
        let node = json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "n1"}});
        let data = extract_data(&node);
        assert_eq!(data.namespace, crate::CLUSTER_SCOPE);
        assert_eq!(identifier_of(&node).build_id(), "_cluster:v1:Node:n1");
    }
}
