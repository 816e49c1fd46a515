use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::{api::DynamicObject, runtime::reflector::Store, Client};
use mcpsync_core::{extract_data, Gvr, ResourceData};
use mcpsync_kubehub::{discover, is_crd_resource, raw_object, ChangeForwarder, Informer, SecretTokenSource, WatchedResource};
use mcpsync_store::{BufferStats, DebounceBuffer};
use mcpsync_transport::{SyncClient, SyncClientConfig, SyncError, SyncTransport, TokenSource};
use parking_lot::Mutex;
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ActiveRegistry, Error, SyncSettings};

/// Process-level knobs shared by every configuration.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ManagerOptions {
    fn client_config(&self, endpoint: &str) -> SyncClientConfig {
        SyncClientConfig {
            max_retries: self.max_retries,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
            request_timeout: self.request_timeout,
            ..SyncClientConfig::new(endpoint)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    Restarted,
    Unchanged,
}

/// One informer's cache as seen by resync.
#[derive(Clone)]
pub struct ResyncSource {
    pub resource: WatchedResource,
    pub store: Store<DynamicObject>,
}

/// Snapshot every cached object as [`ResourceData`], leaving out CRD objects.
pub fn collect_resync(sources: &[ResyncSource]) -> Vec<ResourceData> {
    let mut out = Vec::new();
    for src in sources.iter().filter(|s| !is_crd_resource(&s.resource.gvr)) {
        for obj in src.store.state() {
            match raw_object(&obj, &src.resource) {
                Ok(raw) => out.push(extract_data(&raw)),
                Err(e) => warn!(gvr = %src.resource.gvr, error = %e, "skipping unserializable object in resync"),
            }
        }
    }
    out
}

/// Ship the full cached state. Without sources or a transport this does nothing.
pub async fn resync_once(sources: &[ResyncSource], transport: Option<&dyn SyncTransport>) -> Result<usize, SyncError> {
    let Some(transport) = transport else { return Ok(0) };
    if sources.is_empty() {
        return Ok(0);
    }
    let all = collect_resync(sources);
    let n = all.len();
    metrics::histogram!("sync_resync_items", n as f64);
    transport.resync(all).await?;
    Ok(n)
}

/// Changes dropped before reaching the buffer plus the buffer's own counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub buffer: BufferStats,
    pub queue_dropped: u64,
}

struct ConfigRuntime {
    settings: SyncSettings,
    cancel: CancellationToken,
    informers: BTreeMap<Gvr, Informer>,
    buffer: Arc<DebounceBuffer>,
    transport: Option<Arc<dyn SyncTransport>>,
    flush_task: JoinHandle<()>,
    resync_task: JoinHandle<()>,
    queue_dropped: Arc<AtomicU64>,
}

impl ConfigRuntime {
    fn sources(&self) -> Vec<ResyncSource> {
        self.informers.values().map(|i| ResyncSource { resource: i.resource().clone(), store: i.reader() }).collect()
    }

    /// Tear down. With `final_flush`, informers are stopped first so the
    /// intake drains into the buffer, then one last flush runs before the
    /// context is cancelled.
    async fn shutdown(self, key: &str, final_flush: bool) {
        if !final_flush {
            self.cancel.cancel();
        }
        for informer in self.informers.into_values() {
            informer.stop().await;
        }
        if final_flush {
            // every sender is gone now, so the loop exits once the queue is empty
            let _ = self.flush_task.await;
            match self.buffer.flush().await {
                Ok(report) => info!(config = %key, upserts = report.upserts, deletes = report.deletes, "final flush"),
                Err(e) => warn!(config = %key, error = %e, pending = self.buffer.pending_len(), "final flush failed; pending changes lost"),
            }
            self.cancel.cancel();
        } else {
            let _ = self.flush_task.await;
        }
        let _ = self.resync_task.await;
        metrics::gauge!("sync_watched_gvrs", 0.0, "config" => key.to_string());
    }
}

/// Owns one watch pipeline per active configuration.
pub struct SyncManager {
    client: OnceCell<Client>,
    opts: ManagerOptions,
    registry: ActiveRegistry,
    runtimes: Mutex<HashMap<String, ConfigRuntime>>,
    pinned: Mutex<Option<Vec<WatchedResource>>>,
}

impl SyncManager {
    /// The kube client is created on first use.
    pub fn new(opts: ManagerOptions, registry: ActiveRegistry) -> Self {
        Self {
            client: OnceCell::new(),
            opts,
            registry,
            runtimes: Mutex::new(HashMap::new()),
            pinned: Mutex::new(None),
        }
    }

    pub fn with_client(opts: ManagerOptions, registry: ActiveRegistry, client: Client) -> Self {
        Self { client: OnceCell::new_with(Some(client)), ..Self::new(opts, registry) }
    }

    pub fn registry(&self) -> &ActiveRegistry { &self.registry }

    pub fn options(&self) -> &ManagerOptions { &self.opts }

    /// Watch exactly `resources` from now on instead of asking API discovery.
    /// Running configurations pick the new set up on their next reconcile.
    pub fn pin_resources(&self, resources: Vec<WatchedResource>) { *self.pinned.lock() = Some(resources); }

    async fn resolve_resources(&self, client: &Client) -> Result<Vec<WatchedResource>, Error> {
        if let Some(pinned) = self.pinned.lock().clone() {
            return Ok(pinned);
        }
        discover(client).await.map_err(|e| Error::Discovery(format!("{:#}", e)))
    }

    async fn ensure_clients(&self) -> Result<Client, Error> {
        let client = self.client.get_or_try_init(Client::try_default).await?;
        Ok(client.clone())
    }

    pub fn is_running(&self, key: &str) -> bool { self.runtimes.lock().contains_key(key) }

    pub fn settings(&self, key: &str) -> Option<SyncSettings> { self.runtimes.lock().get(key).map(|r| r.settings.clone()) }

    pub fn watched(&self, key: &str) -> Vec<Gvr> {
        self.runtimes.lock().get(key).map(|r| r.informers.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn stats(&self, key: &str) -> Option<RuntimeStats> {
        self.runtimes
            .lock()
            .get(key)
            .map(|r| RuntimeStats { buffer: r.buffer.stats(), queue_dropped: r.queue_dropped.load(Ordering::Relaxed) })
    }

    /// Bring the pipeline for `key` in line with `settings`: start it if absent,
    /// restart it if any setting changed. With unchanged settings the watched
    /// types are rediscovered, and the pipeline restarts only when that set
    /// moved or one of its informers has exited.
    pub async fn ensure_running(&self, key: &str, namespace: &str, settings: SyncSettings) -> Result<StartOutcome, Error> {
        let current = {
            let runtimes = self.runtimes.lock();
            runtimes.get(key).map(|rt| {
                let gvrs: BTreeSet<Gvr> = rt.informers.keys().cloned().collect();
                (rt.settings == settings, gvrs, rt.informers.values().all(Informer::is_running))
            })
        };
        let client = self.ensure_clients().await?;

        let rediscovered = match current {
            Some((true, running, healthy)) => match self.resolve_resources(&client).await {
                Ok(found) => {
                    let found_gvrs: BTreeSet<Gvr> = found.iter().map(|r| r.gvr.clone()).collect();
                    if healthy && found_gvrs == running {
                        return Ok(StartOutcome::Unchanged);
                    }
                    info!(config = %key, before = running.len(), after = found_gvrs.len(), healthy, "watched types changed; restarting watcher");
                    Some(found)
                }
                Err(e) => {
                    warn!(config = %key, error = %e, "rediscovery failed; keeping current watcher");
                    return Ok(StartOutcome::Unchanged);
                }
            },
            Some((false, ..)) => {
                info!(config = %key, "settings changed; restarting watcher");
                None
            }
            None => None,
        };

        let previous = self.runtimes.lock().remove(key);
        let restarting = previous.is_some();
        if let Some(rt) = previous {
            rt.shutdown(key, false).await;
            self.registry.stop(key);
        }

        let resources = match rediscovered {
            Some(found) => found,
            None => self.resolve_resources(&client).await?,
        };
        let rt = self.start_runtime(&client, key, namespace, settings, resources)?;
        let watched = rt.informers.len();
        self.runtimes.lock().insert(key.to_string(), rt);
        self.registry.start(key, watched);
        info!(config = %key, gvrs = watched, restarted = restarting, "watcher running");
        Ok(if restarting { StartOutcome::Restarted } else { StartOutcome::Started })
    }

    fn start_runtime(
        &self,
        client: &Client,
        key: &str,
        namespace: &str,
        settings: SyncSettings,
        resources: Vec<WatchedResource>,
    ) -> Result<ConfigRuntime, Error> {
        let cancel = CancellationToken::new();
        let transport: Option<Arc<dyn SyncTransport>> = if settings.has_target() {
            let mut http = SyncClient::new(self.opts.client_config(&settings.endpoint))?.with_cancellation(cancel.child_token());
            if let Some(r) = &settings.auth_secret_ref {
                http = http.with_token_source(Arc::new(SecretTokenSource::new(client.clone(), namespace, &r.name, &r.key)));
            }
            debug!(config = %key, url = %http.url(), "sync client ready");
            Some(Arc::new(http))
        } else {
            warn!(config = %key, "no endpoint configured; changes will be discarded");
            None
        };

        let buffer = Arc::new(DebounceBuffer::new(settings.debounce_window));
        buffer.set_transport(transport.clone());
        let (tx, rx) = mpsc::channel(self.opts.queue_capacity.max(1));
        let queue_dropped = Arc::new(AtomicU64::new(0));

        let mut informers = BTreeMap::new();
        for res in resources {
            let forwarder = ChangeForwarder::new(res.clone(), tx.clone(), queue_dropped.clone());
            let informer = Informer::spawn(client.clone(), res.clone(), Arc::new(forwarder), cancel.child_token());
            informers.insert(res.gvr, informer);
        }
        drop(tx);
        metrics::gauge!("sync_watched_gvrs", informers.len() as f64, "config" => key.to_string());

        let flush_task = tokio::spawn(buffer.clone().run(rx, cancel.child_token()));
        let sources: Vec<ResyncSource> =
            informers.values().map(|i| ResyncSource { resource: i.resource().clone(), store: i.reader() }).collect();
        let resync_task = tokio::spawn(resync_loop(
            key.to_string(),
            sources,
            transport.clone(),
            settings.resync_interval,
            self.registry.clone(),
            cancel.child_token(),
        ));

        Ok(ConfigRuntime { settings, cancel, informers, buffer, transport, flush_task, resync_task, queue_dropped })
    }

    /// Tear down the pipeline for `key`. Returns false when nothing was running.
    pub async fn stop(&self, key: &str) -> bool {
        let Some(rt) = self.runtimes.lock().remove(key) else {
            debug!(config = %key, "stop requested for inactive config");
            return false;
        };
        rt.shutdown(key, false).await;
        self.registry.stop(key);
        info!(config = %key, "watcher stopped");
        true
    }

    /// Run a resync for `key` now. Unknown keys report zero items.
    pub async fn resync(&self, key: &str) -> Result<usize, Error> {
        let (sources, transport) = {
            let runtimes = self.runtimes.lock();
            let Some(rt) = runtimes.get(key) else { return Ok(0) };
            (rt.sources(), rt.transport.clone())
        };
        let n = resync_once(&sources, transport.as_deref()).await?;
        if transport.is_some() && !sources.is_empty() {
            self.registry.record_resync(key, n, Utc::now());
        }
        Ok(n)
    }

    /// Resolve the configured bearer token once so a bad secret shows up in status.
    pub async fn probe_credentials(&self, namespace: &str, settings: &SyncSettings) -> Result<(), Error> {
        let Some(r) = &settings.auth_secret_ref else { return Ok(()) };
        let client = self.ensure_clients().await?;
        SecretTokenSource::new(client, namespace, &r.name, &r.key).token().await.map_err(Error::Credential)?;
        Ok(())
    }

    /// Stop everything, giving each configuration one final flush.
    pub async fn shutdown(&self) {
        let all: Vec<(String, ConfigRuntime)> = self.runtimes.lock().drain().collect();
        info!(configs = all.len(), "shutting down watchers");
        for (key, rt) in all {
            rt.shutdown(&key, true).await;
            self.registry.stop(&key);
        }
    }
}

async fn resync_loop(
    key: String,
    sources: Vec<ResyncSource>,
    transport: Option<Arc<dyn SyncTransport>>,
    every: Duration,
    registry: ActiveRegistry,
    cancel: CancellationToken,
) {
    let every = if every.is_zero() { crate::DEFAULT_RESYNC_INTERVAL } else { every };
    let now = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval_at(now.checked_add(every).unwrap_or(now), every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match resync_once(&sources, transport.as_deref()).await {
            Ok(n) => {
                if transport.is_some() && !sources.is_empty() {
                    registry.record_resync(&key, n, Utc::now());
                }
                info!(config = %key, items = n, "resync complete");
            }
            Err(SyncError::Cancelled) => break,
            Err(e) => warn!(config = %key, error = %e, "resync failed; next attempt at the following interval"),
        }
    }
    debug!(config = %key, "resync loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stopping_unknown_config_is_a_no_op() {
        let mgr = SyncManager::new(ManagerOptions::default(), ActiveRegistry::new());
        assert!(!mgr.stop("ns/none").await);
        assert_eq!(mgr.resync("ns/none").await.unwrap(), 0);
        assert!(mgr.stats("ns/none").is_none());
        assert!(mgr.watched("ns/none").is_empty());
    }

    #[tokio::test]
    async fn shutdown_without_configs_is_quiet() {
        let registry = ActiveRegistry::new();
        let mgr = SyncManager::new(ManagerOptions::default(), registry.clone());
        mgr.shutdown().await;
        assert!(registry.is_empty());
    }

    #[test]
    fn client_config_carries_options() {
        let opts = ManagerOptions { max_retries: 7, initial_backoff: Duration::from_millis(5), ..Default::default() };
        let cfg = opts.client_config("http://mcp");
        assert_eq!(cfg.endpoint, "http://mcp");
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(5));
        assert_eq!(cfg.max_backoff, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn credentials_without_secret_ref_need_no_client() {
        let mgr = SyncManager::new(ManagerOptions::default(), ActiveRegistry::new());
        let settings = SyncSettings {
            endpoint: "http://mcp".into(),
            debounce_window: Duration::from_secs(10),
            resync_interval: Duration::from_secs(3600),
            auth_secret_ref: None,
        };
        assert!(mgr.probe_credentials("ns", &settings).await.is_ok());
    }
}
