use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kube::api::DynamicObject;
use mcpsync_core::{extract_data, identifier_of, is_relevant_change, ResourceChange};
use serde_json::Value as Json;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{trace, warn};

use crate::{ResourceEventHandler, WatchedResource};

/// Serialize an object, filling `apiVersion`/`kind` from the watched type when
/// the API server left them off list items.
pub fn raw_object(obj: &DynamicObject, resource: &WatchedResource) -> serde_json::Result<Json> {
    let mut raw = serde_json::to_value(obj)?;
    if let Some(map) = raw.as_object_mut() {
        if !map.get("apiVersion").is_some_and(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
            map.insert("apiVersion".into(), Json::String(resource.gvr.api_version()));
        }
        if !map.get("kind").is_some_and(|v| v.as_str().is_some_and(|s| !s.is_empty())) {
            map.insert("kind".into(), Json::String(resource.kind.clone()));
        }
    }
    Ok(raw)
}

/// Informer callbacks that classify events and push changes onto the intake
/// queue without ever waiting: a full queue drops the change and counts it.
pub struct ChangeForwarder {
    resource: WatchedResource,
    tx: mpsc::Sender<ResourceChange>,
    dropped: Arc<AtomicU64>,
}

impl ChangeForwarder {
    pub fn new(resource: WatchedResource, tx: mpsc::Sender<ResourceChange>, dropped: Arc<AtomicU64>) -> Self {
        Self { resource, tx, dropped }
    }

    fn raw(&self, obj: &DynamicObject) -> Option<Json> {
        match raw_object(obj, &self.resource) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(gvr = %self.resource.gvr, error = %e, "failed to serialize object; dropping event");
                self.drop_change("encode");
                None
            }
        }
    }

    fn drop_change(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("sync_changes_dropped_total", 1u64, "reason" => reason);
    }

    fn enqueue(&self, change: ResourceChange) {
        match self.tx.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(c)) => {
                trace!(id = %c.id, "intake queue full; dropping change");
                self.drop_change("queue_full");
            }
            Err(TrySendError::Closed(_)) => self.drop_change("closed"),
        }
    }
}

impl ResourceEventHandler for ChangeForwarder {
    fn on_add(&self, obj: &DynamicObject) {
        if let Some(raw) = self.raw(obj) {
            self.enqueue(ResourceChange::upsert(extract_data(&raw)));
        }
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
        let (Some(old), Some(new)) = (self.raw(old), self.raw(new)) else { return };
        if is_relevant_change(&old, &new) {
            self.enqueue(ResourceChange::upsert(extract_data(&new)));
        }
    }

    fn on_delete(&self, obj: &DynamicObject) {
        if let Some(raw) = self.raw(obj) {
            self.enqueue(ResourceChange::delete(identifier_of(&raw)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsync_core::{ChangeAction, Gvr};

    fn deployments() -> WatchedResource {
        WatchedResource { gvr: Gvr::new("apps", "v1", "deployments"), kind: "Deployment".into(), namespaced: true }
    }

    fn deploy(labels: &[(&str, &str)], replicas: i64) -> DynamicObject {
        let mut o = DynamicObject::new("web", &deployments().api_resource()).within("prod");
        o.types = None;
        o.metadata.labels = Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        o.data = serde_json::json!({ "status": { "readyReplicas": replicas } });
        o
    }

    fn forwarder(cap: usize) -> (ChangeForwarder, mpsc::Receiver<ResourceChange>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(cap);
        let dropped = Arc::new(AtomicU64::new(0));
        (ChangeForwarder::new(deployments(), tx, dropped.clone()), rx, dropped)
    }

    #[test]
    fn add_fills_missing_type_meta() {
        let (fwd, mut rx, _) = forwarder(4);
        fwd.on_add(&deploy(&[("app", "web")], 1));
        let change = rx.try_recv().unwrap();
        assert_eq!(change.action, ChangeAction::Upsert);
        assert_eq!(change.id, "prod:apps/v1:Deployment:web");
    }

    #[test]
    fn status_only_update_is_filtered() {
        let (fwd, mut rx, _) = forwarder(4);
        fwd.on_update(&deploy(&[("app", "web")], 1), &deploy(&[("app", "web")], 3));
        assert!(rx.try_recv().is_err());
        fwd.on_update(&deploy(&[("app", "web")], 1), &deploy(&[("app", "api")], 1));
        assert_eq!(rx.try_recv().unwrap().data.unwrap().labels["app"], "api");
    }

    #[test]
    fn delete_carries_identifier() {
        let (fwd, mut rx, _) = forwarder(4);
        fwd.on_delete(&deploy(&[], 0));
        let change = rx.try_recv().unwrap();
        assert!(change.is_delete());
        assert_eq!(change.delete_identifier.unwrap().namespace, "prod");
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (fwd, _rx, dropped) = forwarder(1);
        fwd.on_add(&deploy(&[], 0));
        fwd.on_add(&deploy(&[], 0));
        fwd.on_add(&deploy(&[], 0));
        assert_eq!(dropped.load(Ordering::Relaxed), 2);
    }
}
