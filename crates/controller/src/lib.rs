//! mcpsync controller: reconciles `ResourceSyncConfig` objects into running
//! watch pipelines (discovery, informers, debounce buffer, sync client) and
//! reports their state back on the object's status.

#![forbid(unsafe_code)]

mod crd;
mod manager;
mod reconcile;
mod registry;
mod settings;

pub use crd::{
    rfc3339, ReadyReason, ResourceSyncConfig, ResourceSyncConfigSpec, ResourceSyncConfigStatus, SecretKeyRef,
    StatusCondition, READY,
};
pub use manager::{collect_resync, resync_once, ManagerOptions, ResyncSource, RuntimeStats, StartOutcome, SyncManager};
pub use reconcile::{build_status, error_policy, reconcile, run, Context, FINALIZER};
pub use registry::{ActiveConfigStatus, ActiveRegistry, ResyncRecord};
pub use settings::{SyncSettings, DEFAULT_RESYNC_INTERVAL, MAX_DEBOUNCE_WINDOW, MAX_RESYNC_INTERVAL};

use mcpsync_transport::{CredentialError, SyncError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
    #[error("{0} has no namespace")]
    MissingNamespace(String),
    #[error("finalizer: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}
