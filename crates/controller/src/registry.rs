use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResyncRecord {
    pub at: DateTime<Utc>,
    pub count: usize,
}

/// What status reporting needs to know about one running configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveConfigStatus {
    pub watched_gvrs: usize,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub last_resync: Option<ResyncRecord>,
}

/// Process-wide table of active configurations keyed by `namespace/name`.
/// Cloning shares the table; only the manager's start/stop transitions write it.
#[derive(Clone, Default)]
pub struct ActiveRegistry {
    inner: Arc<RwLock<HashMap<String, ActiveConfigStatus>>>,
}

impl ActiveRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn start(&self, key: &str, watched_gvrs: usize) {
        let mut map = self.inner.write();
        map.insert(
            key.to_string(),
            ActiveConfigStatus { watched_gvrs, active: true, started_at: Utc::now(), last_resync: None },
        );
        metrics::gauge!("sync_active_configs", map.len() as f64);
    }

    pub fn stop(&self, key: &str) -> Option<ActiveConfigStatus> {
        let mut map = self.inner.write();
        let prev = map.remove(key);
        metrics::gauge!("sync_active_configs", map.len() as f64);
        prev
    }

    pub fn record_resync(&self, key: &str, count: usize, at: DateTime<Utc>) {
        if let Some(entry) = self.inner.write().get_mut(key) {
            entry.last_resync = Some(ResyncRecord { at, count });
        }
    }

    pub fn lookup(&self, key: &str) -> Option<ActiveConfigStatus> { self.inner.read().get(key).cloned() }

    pub fn is_active(&self, key: &str) -> bool { self.inner.read().get(key).is_some_and(|s| s.active) }

    pub fn len(&self) -> usize { self.inner.read().len() }

    pub fn is_empty(&self) -> bool { self.inner.read().is_empty() }

    /// Sorted by key.
    pub fn snapshot(&self) -> Vec<(String, ActiveConfigStatus)> {
        let mut out: Vec<_> = self.inner.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
