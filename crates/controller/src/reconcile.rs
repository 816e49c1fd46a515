use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher,
    },
    Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    crd::rfc3339, ActiveConfigStatus, Error, ReadyReason, ResourceSyncConfig, ResourceSyncConfigStatus, StartOutcome,
    SyncManager, SyncSettings,
};

pub const FINALIZER: &str = "mcpsync.dev/cleanup";

/// Shared state handed to every reconcile.
pub struct Context {
    pub client: Client,
    pub manager: Arc<SyncManager>,
    /// Periodic maintenance requeue after a successful reconcile.
    pub requeue: Duration,
    pub error_requeue: Duration,
}

/// Status written after a reconcile, built from the registry's view of the config.
pub fn build_status(
    generation: Option<i64>,
    prev: Option<&ResourceSyncConfigStatus>,
    active: Option<&ActiveConfigStatus>,
    reason: ReadyReason,
    message: &str,
    now: DateTime<Utc>,
) -> ResourceSyncConfigStatus {
    let mut status = ResourceSyncConfigStatus {
        active: active.is_some_and(|a| a.active),
        watched_resources: active.map(|a| a.watched_gvrs as i64).unwrap_or(0),
        last_resync_time: prev.and_then(|p| p.last_resync_time.clone()),
        last_resync_count: prev.and_then(|p| p.last_resync_count),
        observed_generation: generation,
        conditions: prev.map(|p| p.conditions.clone()).unwrap_or_default(),
    };
    if let Some(r) = active.and_then(|a| a.last_resync) {
        status.last_resync_time = Some(rfc3339(r.at));
        status.last_resync_count = Some(r.count as i64);
    }
    status.set_ready(prev, reason, message, now);
    status
}

async fn patch_status(api: &Api<ResourceSyncConfig>, cfg: &ResourceSyncConfig, status: ResourceSyncConfigStatus) -> Result<(), Error> {
    let patch = Patch::Merge(json!({ "status": status }));
    api.patch_status(&cfg.name_any(), &PatchParams::default(), &patch).await?;
    Ok(())
}

async fn apply(cfg: Arc<ResourceSyncConfig>, api: &Api<ResourceSyncConfig>, ctx: &Context, namespace: &str) -> Result<Action, Error> {
    let key = cfg.config_key();
    let settings = SyncSettings::from_spec(&cfg.spec);
    let registry = ctx.manager.registry();

    match ctx.manager.ensure_running(&key, namespace, settings.clone()).await {
        Ok(StartOutcome::Unchanged) => debug!(config = %key, "settings unchanged"),
        Ok(outcome) => info!(config = %key, ?outcome, gvrs = ctx.manager.watched(&key).len(), "watcher (re)started"),
        Err(e @ Error::Discovery(_)) => {
            let msg = e.to_string();
            let status = build_status(cfg.metadata.generation, cfg.status.as_ref(), registry.lookup(&key).as_ref(), ReadyReason::DiscoveryFailed, &msg, Utc::now());
            patch_status(api, &cfg, status).await?;
            return Err(e);
        }
        Err(e) => return Err(e),
    }

    let (reason, message) = match ctx.manager.probe_credentials(namespace, &settings).await {
        Ok(()) => (ReadyReason::Watching, format!("watching {} resource types", ctx.manager.watched(&key).len())),
        Err(e) => {
            warn!(config = %key, error = %e, "credentials unavailable; sync attempts will fail until fixed");
            (ReadyReason::CredentialUnavailable, e.to_string())
        }
    };
    let status = build_status(cfg.metadata.generation, cfg.status.as_ref(), registry.lookup(&key).as_ref(), reason, &message, Utc::now());
    patch_status(api, &cfg, status).await?;
    Ok(Action::requeue(ctx.requeue))
}

async fn cleanup(cfg: Arc<ResourceSyncConfig>, api: &Api<ResourceSyncConfig>, ctx: &Context) -> Result<Action, Error> {
    let key = cfg.config_key();
    if ctx.manager.stop(&key).await {
        info!(config = %key, "config deleted; watcher stopped");
    }
    let status = build_status(cfg.metadata.generation, cfg.status.as_ref(), None, ReadyReason::Stopped, "configuration deleted", Utc::now());
    // the object is on its way out; a failed write must not hold up finalizer removal
    if let Err(e) = patch_status(api, &cfg, status).await {
        debug!(config = %key, error = %e, "could not record stopped status");
    }
    Ok(Action::await_change())
}

pub async fn reconcile(cfg: Arc<ResourceSyncConfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = cfg.namespace().ok_or_else(|| Error::MissingNamespace(cfg.name_any()))?;
    let api: Api<ResourceSyncConfig> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, cfg, |event| async {
        match event {
            Finalizer::Apply(cfg) => apply(cfg, &api, &ctx, &namespace).await,
            Finalizer::Cleanup(cfg) => cleanup(cfg, &api, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

pub fn error_policy(cfg: Arc<ResourceSyncConfig>, err: &Error, ctx: Arc<Context>) -> Action {
    metrics::counter!("sync_reconcile_errors_total", 1u64);
    warn!(config = %cfg.config_key(), error = %err, "reconcile failed");
    Action::requeue(ctx.error_requeue)
}

/// Drive the controller until SIGINT/SIGTERM, then stop every watcher with a final flush.
pub async fn run(client: Client, manager: Arc<SyncManager>, requeue: Duration) -> anyhow::Result<()> {
    let configs: Api<ResourceSyncConfig> = Api::all(client.clone());
    configs
        .list(&ListParams::default().limit(1))
        .await
        .context("listing ResourceSyncConfigs (is the CRD installed?)")?;

    let ctx = Arc::new(Context { client, manager: manager.clone(), requeue, error_requeue: Duration::from_secs(30) });
    info!("controller started");
    Controller::new(configs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(config = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;

    manager.shutdown().await;
    info!("controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResyncRecord;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() }

    #[test]
    fn status_reflects_active_config() {
        let active = ActiveConfigStatus {
            watched_gvrs: 42,
            active: true,
            started_at: now(),
            last_resync: Some(ResyncRecord { at: now(), count: 900 }),
        };
        let s = build_status(Some(3), None, Some(&active), ReadyReason::Watching, "watching 42 resource types", now());
        assert!(s.active);
        assert_eq!(s.watched_resources, 42);
        assert_eq!(s.observed_generation, Some(3));
        assert_eq!(s.last_resync_time.as_deref(), Some("2026-03-01T12:00:00Z"));
        assert_eq!(s.last_resync_count, Some(900));
        let ready = s.ready_condition().unwrap();
        assert_eq!((ready.status.as_str(), ready.reason.as_str()), ("True", "Watching"));
    }

    #[test]
    fn discovery_failure_reports_inactive() {
        let s = build_status(Some(1), None, None, ReadyReason::DiscoveryFailed, "discovery failed: timeout", now());
        assert!(!s.active);
        assert_eq!(s.watched_resources, 0);
        assert_eq!(s.ready_condition().unwrap().status, "False");
    }

    #[test]
    fn previous_resync_survives_a_restart() {
        let prev = ResourceSyncConfigStatus {
            last_resync_time: Some("2026-02-01T00:00:00Z".into()),
            last_resync_count: Some(7),
            ..Default::default()
        };
        let active = ActiveConfigStatus { watched_gvrs: 5, active: true, started_at: now(), last_resync: None };
        let s = build_status(Some(2), Some(&prev), Some(&active), ReadyReason::Watching, "ok", now());
        assert_eq!(s.last_resync_count, Some(7));
        assert_eq!(s.last_resync_time.as_deref(), Some("2026-02-01T00:00:00Z"));
    }

    #[test]
    fn status_serializes_camel_case() {
        let s = build_status(None, None, None, ReadyReason::Stopped, "", now());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["watchedResources"], 0);
        assert_eq!(v["conditions"][0]["type"], "Ready");
        assert_eq!(v["conditions"][0]["lastTransitionTime"], "2026-03-01T12:00:00Z");
        assert!(v.get("observedGeneration").is_none());
    }
}
