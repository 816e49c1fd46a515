use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::{Api, DynamicObject},
    core::ApiResource,
    runtime::{
        reflector::{store::Writer, ObjectRef, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::WatchedResource;

/// Callbacks fired by an informer. Implementations must not block.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &DynamicObject);
    fn on_update(&self, old: &DynamicObject, new: &DynamicObject);
    /// Also fired for cached objects missing from a relist, whose final state is unknown.
    fn on_delete(&self, obj: &DynamicObject);
}

/// Watch of one type backed by a local cache.
pub struct Informer {
    resource: WatchedResource,
    store: Store<DynamicObject>,
    task: JoinHandle<()>,
}

impl Informer {
    /// Start list+watch for `resource` across all namespaces. The watch runs until
    /// `cancel` fires or the informer is stopped.
    pub fn spawn(
        client: Client,
        resource: WatchedResource,
        handler: Arc<dyn ResourceEventHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let ar = resource.api_resource();
        let api: Api<DynamicObject> = Api::all_with(client, &ar);
        let writer = Writer::new(ar.clone());
        let store = writer.as_reader();
        let gvr = resource.gvr.to_string();
        let task = tokio::spawn(async move {
            let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
            futures::pin_mut!(stream);
            let mut writer = writer;
            debug!(gvr = %gvr, "informer started");
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => dispatch(&mut writer, &ar, event, handler.as_ref()),
                    Some(Err(e)) => {
                        metrics::counter!("informer_watch_errors_total", 1u64);
                        warn!(gvr = %gvr, error = %e, "watch error; backing off");
                    }
                    None => {
                        warn!(gvr = %gvr, "watch stream ended");
                        break;
                    }
                }
            }
            debug!(gvr = %gvr, "informer stopped");
        });
        Self { resource, store, task }
    }

    pub fn resource(&self) -> &WatchedResource { &self.resource }

    /// Every object currently in the local cache.
    pub fn list(&self) -> Vec<Arc<DynamicObject>> { self.store.state() }

    /// Shared handle on the cache, usable after the informer is moved elsewhere.
    pub fn reader(&self) -> Store<DynamicObject> { self.store.clone() }

    pub fn is_running(&self) -> bool { !self.task.is_finished() }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        info!(gvr = %self.resource.gvr, "informer stopped");
    }
}

/// Apply one watch event to the cache and fire the matching callbacks.
///
/// The previous cached state decides between add and update; on a relist,
/// cached objects absent from the new listing are reported as deleted.
pub fn dispatch(
    writer: &mut Writer<DynamicObject>,
    ar: &ApiResource,
    event: Event<DynamicObject>,
    handler: &dyn ResourceEventHandler,
) {
    let reader = writer.as_reader();
    let key = |obj: &DynamicObject| ObjectRef::from_obj_with(obj, ar.clone());
    match &event {
        Event::Applied(obj) => {
            let old = reader.get(&key(obj));
            writer.apply_watcher_event(&event);
            match old {
                Some(old) => handler.on_update(&old, obj),
                None => handler.on_add(obj),
            }
        }
        Event::Deleted(obj) => {
            writer.apply_watcher_event(&event);
            handler.on_delete(obj);
        }
        Event::Restarted(objs) => {
            let listed: HashSet<_> = objs.iter().map(key).collect();
            let gone: Vec<_> = reader.state().into_iter().filter(|o| !listed.contains(&key(o.as_ref()))).collect();
            let seen: Vec<_> = objs.iter().map(|o| (reader.get(&key(o)), o)).collect();
            writer.apply_watcher_event(&event);
            debug!(listed = objs.len(), gone = gone.len(), kind = %ar.kind, "relist");
            for obj in gone {
                handler.on_delete(&obj);
            }
            for (old, new) in seen {
                match old {
                    Some(old) => handler.on_update(&old, new),
                    None => handler.on_add(new),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, s: String) { self.0.lock().unwrap().push(s) }
        fn take(&self) -> Vec<String> { std::mem::take(&mut *self.0.lock().unwrap()) }
    }

    fn name(o: &DynamicObject) -> &str { o.metadata.name.as_deref().unwrap_or("") }
    fn rv(o: &DynamicObject) -> &str { o.metadata.resource_version.as_deref().unwrap_or("") }

    impl ResourceEventHandler for Calls {
        fn on_add(&self, obj: &DynamicObject) { self.push(format!("add {}", name(obj))) }
        fn on_update(&self, old: &DynamicObject, new: &DynamicObject) {
            self.push(format!("update {} {}->{}", name(new), rv(old), rv(new)))
        }
        fn on_delete(&self, obj: &DynamicObject) { self.push(format!("delete {}", name(obj))) }
    }

    fn cm_resource() -> ApiResource {
        crate::WatchedResource { gvr: mcpsync_core::Gvr::new("", "v1", "configmaps"), kind: "ConfigMap".into(), namespaced: true }
            .api_resource()
    }

    fn cm(ar: &ApiResource, name: &str, rv: &str) -> DynamicObject {
        let mut o = DynamicObject::new(name, ar).within("default");
        o.metadata.resource_version = Some(rv.into());
        o
    }

    #[test]
    fn applied_distinguishes_add_from_update() {
        let ar = cm_resource();
        let mut writer = Writer::new(ar.clone());
        let calls = Calls::default();
        dispatch(&mut writer, &ar, Event::Applied(cm(&ar, "a", "1")), &calls);
        dispatch(&mut writer, &ar, Event::Applied(cm(&ar, "a", "2")), &calls);
        assert_eq!(calls.take(), vec!["add a", "update a 1->2"]);
        assert_eq!(writer.as_reader().state().len(), 1);
    }

    #[test]
    fn deleted_clears_cache() {
        let ar = cm_resource();
        let mut writer = Writer::new(ar.clone());
        let calls = Calls::default();
        dispatch(&mut writer, &ar, Event::Applied(cm(&ar, "a", "1")), &calls);
        dispatch(&mut writer, &ar, Event::Deleted(cm(&ar, "a", "2")), &calls);
        assert_eq!(calls.take(), vec!["add a", "delete a"]);
        assert!(writer.as_reader().state().is_empty());
    }

    #[test]
    fn relist_reports_vanished_objects_as_deleted() {
        let ar = cm_resource();
        let mut writer = Writer::new(ar.clone());
        let calls = Calls::default();
        dispatch(&mut writer, &ar, Event::Applied(cm(&ar, "a", "1")), &calls);
        dispatch(&mut writer, &ar, Event::Applied(cm(&ar, "b", "1")), &calls);
        calls.take();

        dispatch(&mut writer, &ar, Event::Restarted(vec![cm(&ar, "a", "3"), cm(&ar, "c", "1")]), &calls);
        let mut got = calls.take();
        got.sort();
        assert_eq!(got, vec!["add c", "delete b", "update a 1->3"]);
        assert_eq!(writer.as_reader().state().len(), 2);
    }
}
