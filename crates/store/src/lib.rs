//! mcpsync store: debounce buffer turning a stream of per-resource changes
//! into periodic, deduplicated batches for the sync transport.

#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use mcpsync_core::{ChangeAction, ResourceChange};
use mcpsync_transport::{SyncError, SyncTransport};
use metrics::{counter, gauge, histogram};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);
/// Longest accepted window; larger values are clamped.
pub const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Cumulative counters plus the current pending size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub total_upserts: u64,
    pub total_deletes: u64,
    pub total_flushes: u64,
    pub total_dropped: u64,
    pub pending: usize,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_flush_size: usize,
}

/// Outcome of a single flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub upserts: usize,
    pub deletes: usize,
    /// Items put back into the pending map for the next flush.
    pub requeued: usize,
    /// Items thrown away because no transport is attached.
    pub discarded: usize,
}

#[derive(Debug)]
struct LastFlush {
    at: DateTime<Utc>,
    size: usize,
}

/// Last-state-wins buffer keyed by resource ID.
///
/// Merge rules for a change arriving for an ID that is already pending:
/// - a delete replaces anything;
/// - an upsert replaces an upsert;
/// - an upsert behind a pending delete is ignored.
pub struct DebounceBuffer {
    pending: Mutex<FxHashMap<String, ResourceChange>>,
    window: Duration,
    transport: RwLock<Option<Arc<dyn SyncTransport>>>,
    total_upserts: AtomicU64,
    total_deletes: AtomicU64,
    total_flushes: AtomicU64,
    total_dropped: AtomicU64,
    last_flush: ArcSwapOption<LastFlush>,
}

impl DebounceBuffer {
    /// A zero window falls back to [`DEFAULT_WINDOW`]; anything above [`MAX_WINDOW`] is clamped.
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Mutex::new(FxHashMap::default()),
            window: if window.is_zero() { DEFAULT_WINDOW } else { window.min(MAX_WINDOW) },
            transport: RwLock::new(None),
            total_upserts: AtomicU64::new(0),
            total_deletes: AtomicU64::new(0),
            total_flushes: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            last_flush: ArcSwapOption::empty(),
        }
    }

    pub fn with_transport(self, transport: Arc<dyn SyncTransport>) -> Self {
        self.set_transport(Some(transport));
        self
    }

    pub fn set_transport(&self, transport: Option<Arc<dyn SyncTransport>>) { *self.transport.write() = transport; }

    pub fn transport(&self) -> Option<Arc<dyn SyncTransport>> { self.transport.read().clone() }

    pub fn window(&self) -> Duration { self.window }

    pub fn pending_len(&self) -> usize { self.pending.lock().len() }

    /// Clone of the pending entry for `id`, if any.
    pub fn pending(&self, id: &str) -> Option<ResourceChange> { self.pending.lock().get(id).cloned() }

    pub fn stats(&self) -> BufferStats {
        let last = self.last_flush.load_full();
        BufferStats {
            total_upserts: self.total_upserts.load(Ordering::Relaxed),
            total_deletes: self.total_deletes.load(Ordering::Relaxed),
            total_flushes: self.total_flushes.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            pending: self.pending_len(),
            last_flush_at: last.as_ref().map(|l| l.at),
            last_flush_size: last.as_ref().map(|l| l.size).unwrap_or(0),
        }
    }

    /// Count a change that never made it into the buffer (e.g. a full intake queue).
    pub fn note_dropped(&self, reason: &'static str) {
        self.total_dropped.fetch_add(1, Ordering::Relaxed);
        counter!("sync_changes_dropped_total", 1u64, "reason" => reason);
    }

    pub fn record(&self, change: ResourceChange) {
        if change.id.is_empty() {
            self.note_dropped("invalid");
            return;
        }
        let mut pending = self.pending.lock();
        if merge(&mut pending, change) {
            counter!("sync_changes_recorded_total", 1u64);
        }
        gauge!("sync_pending_changes", pending.len() as f64);
    }

    /// Swap out the pending set and ship it. On failure the batch goes back into
    /// the buffer (only the rejected items for a partial failure); entries
    /// recorded for the same ID in the meantime are newer and win.
    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        gauge!("sync_pending_changes", 0.0);
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }
        let Some(transport) = self.transport() else {
            debug!(items = batch.len(), "no transport attached; discarding batch");
            return Ok(FlushReport { discarded: batch.len(), ..Default::default() });
        };

        let mut upserts = Vec::new();
        let mut deletes = Vec::new();
        for change in batch.values() {
            match change.action {
                ChangeAction::Upsert => upserts.extend(change.data.clone()),
                ChangeAction::Delete => deletes.push(change.id.clone()),
            }
        }
        let (n_up, n_del) = (upserts.len(), deletes.len());
        let t0 = Instant::now();
        let res = transport.sync_resources(upserts, deletes).await;
        histogram!("sync_flush_ms", t0.elapsed().as_secs_f64() * 1000.0);

        match res {
            Ok(_) => {
                self.mark_flushed(n_up as u64, n_del as u64, batch.len());
                counter!("sync_flush_total", 1u64, "outcome" => "ok");
                histogram!("sync_flush_items", batch.len() as f64);
                debug!(upserts = n_up, deletes = n_del, "flushed batch");
                Ok(FlushReport { upserts: n_up, deletes: n_del, ..Default::default() })
            }
            Err(err) => {
                let requeued = match err.partial_response() {
                    Some(resp) => {
                        let failed: HashSet<&str> = resp.get_failures().iter().map(|f| f.id.as_str()).collect();
                        let (retry, accepted): (Vec<_>, Vec<_>) =
                            batch.into_values().partition(|c| failed.contains(c.id.as_str()));
                        let ok_up = accepted.iter().filter(|c| c.is_upsert()).count() as u64;
                        let ok_del = accepted.len() as u64 - ok_up;
                        self.mark_flushed(ok_up, ok_del, accepted.len());
                        counter!("sync_flush_total", 1u64, "outcome" => "partial");
                        self.requeue(retry)
                    }
                    None => {
                        counter!("sync_flush_total", 1u64, "outcome" => "failed");
                        self.requeue(batch.into_values())
                    }
                };
                warn!(error = %err, requeued, "flush failed; items kept for next window");
                Err(err)
            }
        }
    }

    fn mark_flushed(&self, upserts: u64, deletes: u64, size: usize) {
        self.total_upserts.fetch_add(upserts, Ordering::Relaxed);
        self.total_deletes.fetch_add(deletes, Ordering::Relaxed);
        self.total_flushes.fetch_add(1, Ordering::Relaxed);
        self.last_flush.store(Some(Arc::new(LastFlush { at: Utc::now(), size })));
    }

    fn requeue(&self, items: impl IntoIterator<Item = ResourceChange>) -> usize {
        let mut pending = self.pending.lock();
        let mut n = 0;
        for change in items {
            if let Entry::Vacant(v) = pending.entry(change.id.clone()) {
                v.insert(change);
                n += 1;
            }
        }
        gauge!("sync_pending_changes", pending.len() as f64);
        n
    }

    /// Consume the intake channel until it closes or `cancel` fires, flushing
    /// every window. Cancellation does not flush; call [`Self::flush`] first if
    /// pending changes must not be lost.
    pub async fn run(self: Arc<Self>, mut intake: mpsc::Receiver<ResourceChange>, cancel: CancellationToken) {
        let now = tokio::time::Instant::now();
        let start = now.checked_add(self.window).unwrap_or(now);
        let mut ticker = tokio::time::interval_at(start, self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(window_ms = self.window.as_millis() as u64, "debounce loop started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(pending = self.pending_len(), "debounce loop cancelled");
                    break;
                }
                // ahead of intake so a busy queue cannot starve flushing
                _ = ticker.tick() => {
                    // failures were requeued and logged inside flush
                    let _ = self.flush().await;
                }
                maybe = intake.recv() => match maybe {
                    Some(change) => self.record(change),
                    None => {
                        debug!(pending = self.pending_len(), "intake channel closed");
                        break;
                    }
                },
            }
        }
        info!("debounce loop stopped");
    }
}

/// Apply one change to the pending map; returns whether it was kept.
fn merge(pending: &mut FxHashMap<String, ResourceChange>, change: ResourceChange) -> bool {
    match pending.entry(change.id.clone()) {
        Entry::Vacant(v) => {
            v.insert(change);
            true
        }
        Entry::Occupied(mut o) => match (o.get().action, change.action) {
            (ChangeAction::Delete, ChangeAction::Upsert) => false,
            _ => {
                o.insert(change);
                true
            }
        },
    }
}
