use std::time::Duration;

use mcpsync_store::DEFAULT_WINDOW;

use crate::crd::{ResourceSyncConfigSpec, SecretKeyRef};

pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Upper bounds matching the CRD schema's `maximum`; larger spec values are clamped.
pub const MAX_DEBOUNCE_WINDOW: Duration = Duration::from_secs(60 * 60);
pub const MAX_RESYNC_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Normalized view of a configuration's spec. Two configurations whose
/// settings compare equal share a watcher; anything else forces a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub endpoint: String,
    pub debounce_window: Duration,
    pub resync_interval: Duration,
    pub auth_secret_ref: Option<SecretKeyRef>,
}

fn positive(v: Option<i64>) -> Option<u64> { v.filter(|v| *v > 0).map(|v| v as u64) }

impl SyncSettings {
    pub fn from_spec(spec: &ResourceSyncConfigSpec) -> Self {
        Self {
            endpoint: spec.endpoint.trim().to_string(),
            debounce_window: positive(spec.debounce_window_seconds)
                .map(|s| Duration::from_secs(s).min(MAX_DEBOUNCE_WINDOW))
                .unwrap_or(DEFAULT_WINDOW),
            resync_interval: positive(spec.resync_interval_minutes)
                .map(|m| Duration::from_secs(m.saturating_mul(60)).min(MAX_RESYNC_INTERVAL))
                .unwrap_or(DEFAULT_RESYNC_INTERVAL),
            auth_secret_ref: spec.auth_secret_ref.clone(),
        }
    }

    /// No endpoint means changes are collected but never shipped.
    pub fn has_target(&self) -> bool { !self.endpoint.is_empty() }
}
