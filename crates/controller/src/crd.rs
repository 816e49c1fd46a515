use chrono::{DateTime, SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const READY: &str = "Ready";

/// Sync target and timing for one configuration.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "mcpsync.dev",
    version = "v1alpha1",
    kind = "ResourceSyncConfig",
    namespaced,
    status = "ResourceSyncConfigStatus",
    shortname = "rsc",
    printcolumn = r#"{"name":"Endpoint", "type":"string", "jsonPath":".spec.endpoint"}"#,
    printcolumn = r#"{"name":"Watching", "type":"integer", "jsonPath":".status.watchedResources"}"#,
    printcolumn = r#"{"name":"Active", "type":"boolean", "jsonPath":".status.active"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncConfigSpec {
    pub endpoint: String,
    /// Defaults to 10 when unset or not positive; at most one hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(max = 3600))]
    pub debounce_window_seconds: Option<i64>,
    /// Defaults to 60 when unset or not positive; at most one week.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(max = 10080))]
    pub resync_interval_minutes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret_ref: Option<SecretKeyRef>,
}

/// Secret in the configuration's namespace holding the bearer token.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSyncConfigStatus {
    pub active: bool,
    pub watched_resources: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resync_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resync_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<StatusCondition>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" or "False".
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: String,
}

/// Why a configuration is (not) ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReason {
    Watching,
    DiscoveryFailed,
    CredentialUnavailable,
    Stopped,
}

impl ReadyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Watching => "Watching",
            Self::DiscoveryFailed => "DiscoveryFailed",
            Self::CredentialUnavailable => "CredentialUnavailable",
            Self::Stopped => "Stopped",
        }
    }

    pub fn is_ready(&self) -> bool { matches!(self, Self::Watching) }
}

pub fn rfc3339(t: DateTime<Utc>) -> String { t.to_rfc3339_opts(SecondsFormat::Secs, true) }

impl ResourceSyncConfigStatus {
    pub fn ready_condition(&self) -> Option<&StatusCondition> { self.conditions.iter().find(|c| c.type_ == READY) }

    /// Set the Ready condition. The transition time is carried over from
    /// `prev` unless the condition's status flips.
    pub fn set_ready(&mut self, prev: Option<&ResourceSyncConfigStatus>, reason: ReadyReason, message: impl Into<String>, now: DateTime<Utc>) {
        let status = if reason.is_ready() { "True" } else { "False" };
        let last_transition_time = prev
            .and_then(|p| p.ready_condition())
            .filter(|c| c.status == status)
            .map(|c| c.last_transition_time.clone())
            .unwrap_or_else(|| rfc3339(now));
        self.conditions.retain(|c| c.type_ != READY);
        self.conditions.push(StatusCondition {
            type_: READY.into(),
            status: status.into(),
            reason: reason.as_str().into(),
            message: message.into(),
            last_transition_time,
        });
    }
}

impl ResourceSyncConfig {
    /// Registry key: `namespace/name`.
    pub fn config_key(&self) -> String { format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any()) }
}
