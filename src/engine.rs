//! Sync orchestrator: optimistic local mutation, durable queuing, debounced
//! drains, and connectivity-edge reactions behind one facade.
//!
//! The engine owns the single in-flight drain guard and the pending-change
//! counter. Local state always moves first (optimistic read-your-write);
//! the network only ever confirms what the user already sees.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::RemoteBackend;
use crate::cache::{self, CacheStats, CacheSyncReport, CacheSynchronizer, CachedItem};
use crate::config::{EngineConfig, SyncScope};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivitySubscription};
use crate::db::{self, DbState, META_LAST_SUCCESSFUL_SYNC};
use crate::error::SyncError;
use crate::outbox::{
    self, ChangePayload, CheckinPayload, CheckoutPayload, DrainReport, QuantityAdjustPayload,
};
use crate::stock_count::StockCountTracker;

/// Aggregated sync state for the status indicator.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: i64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Shared mutable status. `is_syncing` doubles as the drain in-flight guard.
pub(crate) struct StatusState {
    pub(crate) is_syncing: AtomicBool,
    pub(crate) pending: AtomicI64,
    pub(crate) last_sync: Mutex<Option<DateTime<Utc>>>,
    pub(crate) last_error: Mutex<Option<String>>,
}

impl StatusState {
    pub(crate) fn new(pending: i64, last_sync: Option<DateTime<Utc>>) -> Self {
        Self {
            is_syncing: AtomicBool::new(false),
            pending: AtomicI64::new(pending),
            last_sync: Mutex::new(last_sync),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn set_error(&self, error: Option<String>) {
        let mut guard = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *guard = error;
    }

    /// Decrement the pending counter, clamped at zero.
    pub(crate) fn decrement_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some((v - 1).max(0)));
    }
}

struct EngineInner {
    db: Arc<DbState>,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<ConnectivityMonitor>,
    cache_sync: CacheSynchronizer,
    scope: SyncScope,
    config: EngineConfig,
    status: Arc<StatusState>,
    drain_scheduled: AtomicBool,
    shutdown: CancellationToken,
}

/// Offline-first sync engine facade. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Build an engine for one (tenant, user) scope.
    ///
    /// Any change left `syncing` by a crash is requeued here, and the
    /// pending counter is seeded from the durable queue.
    pub fn new(
        db: Arc<DbState>,
        backend: Arc<dyn RemoteBackend>,
        scope: SyncScope,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let requeued = outbox::requeue_syncing_changes(&db, &scope)?;
        if requeued > 0 {
            info!(requeued, "recovered changes interrupted by a previous run");
        }
        let pending = outbox::pending_change_count(&db, &scope)?;
        let last_sync = {
            let conn = db
                .conn
                .lock()
                .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
            db::get_metadata_time(&conn, &scope, META_LAST_SUCCESSFUL_SYNC)
        };

        let monitor = Arc::new(ConnectivityMonitor::new(
            backend.clone(),
            config.heartbeat_interval,
            config.liveness_timeout,
        ));
        let cache_sync =
            CacheSynchronizer::new(db.clone(), backend.clone(), config.catalog_page_size);

        Ok(Self {
            inner: Arc::new(EngineInner {
                db,
                backend,
                monitor,
                cache_sync,
                scope,
                config,
                status: Arc::new(StatusState::new(pending, last_sync)),
                drain_scheduled: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Start the background reactor: connectivity subscription, reconnect
    /// drains, and periodic catalog refreshes.
    pub fn start(&self) {
        let engine = self.clone();
        tokio::spawn(async move { engine.run_reactor().await });
    }

    /// Stop the background reactor. Queued changes stay durable and drain on
    /// the next start.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    // -----------------------------------------------------------------------
    // Connectivity surface
    // -----------------------------------------------------------------------

    pub fn snapshot_online(&self) -> bool {
        self.inner.monitor.snapshot()
    }

    pub fn subscribe_online(&self) -> ConnectivitySubscription {
        self.inner.monitor.subscribe()
    }

    /// Forward a platform link-state hint to the monitor.
    pub fn nudge_connectivity(&self) {
        self.inner.monitor.nudge();
    }

    pub fn monitor(&self) -> Arc<ConnectivityMonitor> {
        self.inner.monitor.clone()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Adjust an item's quantity: cache first, queue second, network later.
    ///
    /// When online and no drain is in flight, a drain is scheduled after the
    /// debounce window so rapid adjustments coalesce into one burst.
    pub fn queue_quantity_adjustment(
        &self,
        payload: QuantityAdjustPayload,
    ) -> Result<String, SyncError> {
        cache::update_cached_quantity(
            &self.inner.db,
            &self.inner.scope,
            &payload.item_id,
            payload.new_quantity,
        )?;
        let id = outbox::queue_change(
            &self.inner.db,
            &self.inner.scope,
            ChangePayload::QuantityAdjust(payload),
        )?;
        self.inner.status.pending.fetch_add(1, Ordering::SeqCst);
        self.schedule_debounced_drain();
        Ok(id)
    }

    /// Check an item out to someone; available quantity drops locally first.
    pub fn queue_checkout(&self, payload: CheckoutPayload) -> Result<String, SyncError> {
        if let Some(item) = cache::lookup_by_id(&self.inner.db, &self.inner.scope, &payload.item_id)?
        {
            let remaining = (item.quantity - payload.quantity).max(0);
            cache::update_cached_quantity(
                &self.inner.db,
                &self.inner.scope,
                &payload.item_id,
                remaining,
            )?;
        }
        let id = outbox::queue_change(
            &self.inner.db,
            &self.inner.scope,
            ChangePayload::Checkout(payload),
        )?;
        self.inner.status.pending.fetch_add(1, Ordering::SeqCst);
        self.schedule_debounced_drain();
        Ok(id)
    }

    /// Return a checked-out item; available quantity rises locally first.
    pub fn queue_checkin(&self, payload: CheckinPayload) -> Result<String, SyncError> {
        if let Some(item) = cache::lookup_by_id(&self.inner.db, &self.inner.scope, &payload.item_id)?
        {
            cache::update_cached_quantity(
                &self.inner.db,
                &self.inner.scope,
                &payload.item_id,
                item.quantity + payload.quantity,
            )?;
        }
        let id = outbox::queue_change(
            &self.inner.db,
            &self.inner.scope,
            ChangePayload::Checkin(payload),
        )?;
        self.inner.status.pending.fetch_add(1, Ordering::SeqCst);
        self.schedule_debounced_drain();
        Ok(id)
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// Resolve a scanned code against the local cache: barcode first, then
    /// SKU. Pure local read; a missing store degrades to not-found.
    pub fn lookup_item_offline(&self, code: &str) -> Option<CachedItem> {
        let code = code.trim();
        if code.is_empty() {
            return None;
        }
        match cache::lookup_by_barcode(&self.inner.db, &self.inner.scope, code) {
            Ok(Some(item)) => return Some(item),
            Ok(None) => {}
            Err(e) => {
                debug!(error = %e, "offline lookup degraded to not-found");
                return None;
            }
        }
        cache::lookup_by_sku(&self.inner.db, &self.inner.scope, code)
            .ok()
            .flatten()
    }

    // -----------------------------------------------------------------------
    // Drains
    // -----------------------------------------------------------------------

    fn schedule_debounced_drain(&self) {
        if !self.inner.monitor.snapshot() {
            // Offline: the next online edge triggers the drain.
            return;
        }
        if self.inner.status.is_syncing.load(Ordering::SeqCst) {
            return;
        }
        if self.inner.drain_scheduled.swap(true, Ordering::SeqCst) {
            // A window is already open; this change rides along.
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.inner.shutdown.cancelled() => {
                    engine.inner.drain_scheduled.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(engine.inner.config.drain_debounce) => {}
            }
            engine.inner.drain_scheduled.store(false, Ordering::SeqCst);
            if let Err(e) = engine.process_queue().await {
                debug!(error = %e, "debounced drain finished with failures");
            }
        });
    }

    /// Drain the outbox now. No-op while offline or while another drain is
    /// in flight.
    pub async fn process_queue(&self) -> Result<DrainReport, SyncError> {
        if !self.inner.monitor.snapshot() {
            debug!("offline; drain deferred");
            return Ok(DrainReport::default());
        }
        if self
            .inner
            .status
            .is_syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in flight");
            return Ok(DrainReport::default());
        }
        self.inner.status.set_error(None);

        let result = outbox::process_queue(
            &self.inner.db,
            self.inner.backend.as_ref(),
            &self.inner.scope,
        )
        .await;

        match &result {
            Ok(report) => {
                if report.succeeded > 0 {
                    let mut guard = self
                        .inner
                        .status
                        .last_sync
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    *guard = Some(Utc::now());
                }
                if report.failed > 0 {
                    self.inner
                        .status
                        .set_error(Some(format!("{} change(s) failed to sync", report.failed)));
                }
            }
            Err(e) => self.inner.status.set_error(Some(e.to_string())),
        }

        self.refresh_pending_count();
        self.inner.status.is_syncing.store(false, Ordering::SeqCst);
        result
    }

    /// Manual "sync now" from the UI.
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        self.process_queue().await
    }

    /// Reset failed changes to pending and re-run the drain.
    pub async fn retry_failed(&self) -> Result<DrainReport, SyncError> {
        let reset = outbox::reset_failed_changes(&self.inner.db, &self.inner.scope)?;
        if reset > 0 {
            info!(reset, "failed changes queued for retry");
        }
        self.refresh_pending_count();
        self.process_queue().await
    }

    fn refresh_pending_count(&self) {
        match outbox::pending_change_count(&self.inner.db, &self.inner.scope) {
            Ok(count) => self.inner.status.pending.store(count, Ordering::SeqCst),
            Err(e) => debug!(error = %e, "pending count refresh failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Cache
    // -----------------------------------------------------------------------

    /// Refresh the item cache if online; skipped otherwise.
    pub async fn sync_item_cache(&self) -> Result<Option<CacheSyncReport>, SyncError> {
        if !self.inner.monitor.snapshot() {
            debug!("offline; cache sync skipped");
            return Ok(None);
        }
        self.inner.cache_sync.sync_item_cache(&self.inner.scope).await
    }

    pub fn cache_stats(&self) -> Result<CacheStats, SyncError> {
        cache::cache_stats(
            &self.inner.db,
            &self.inner.scope,
            self.inner.config.cache_ttl,
        )
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub fn pending_count(&self) -> i64 {
        self.inner.status.pending.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.inner.monitor.snapshot(),
            is_syncing: self.inner.status.is_syncing.load(Ordering::SeqCst),
            pending_count: self.inner.status.pending.load(Ordering::SeqCst),
            last_sync: *self
                .inner
                .status
                .last_sync
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            last_error: self
                .inner
                .status
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Tracker for an offline-first counting session, sharing this engine's
    /// store, backend, and pending counter.
    pub fn stock_count(&self) -> StockCountTracker {
        StockCountTracker::new(
            self.inner.db.clone(),
            self.inner.backend.clone(),
            self.inner.monitor.clone(),
            self.inner.scope.clone(),
            self.inner.status.clone(),
            self.inner.config.count_sync_min_spacing,
        )
    }

    // -----------------------------------------------------------------------
    // Background reactor
    // -----------------------------------------------------------------------

    async fn run_reactor(self) {
        let mut sub = self.inner.monitor.subscribe();
        let shutdown = self.inner.shutdown.clone();

        // Deferred startup catalog refresh, off the critical path.
        {
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = engine.inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(engine.inner.config.startup_sync_delay) => {}
                }
                engine.refresh_cache_best_effort().await;
            });
        }

        let mut cache_tick = tokio::time::interval(self.inner.config.cache_sync_interval);
        cache_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cache_tick.tick().await; // the first tick completes immediately

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = sub.next_event() => match event {
                    Some(ConnectivityEvent::Online { offline_for }) => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(self.inner.config.reconnect_settle) => {}
                        }
                        let long_outage = offline_for
                            .map(|d| d >= self.inner.config.cache_refresh_after_offline)
                            .unwrap_or(false);
                        if long_outage {
                            self.refresh_cache_best_effort().await;
                        }
                        if let Err(e) = self.process_queue().await {
                            debug!(error = %e, "drain after reconnect incomplete");
                        }
                    }
                    Some(ConnectivityEvent::Offline) => {
                        // State change only. Queued work waits for the next edge.
                    }
                    None => break,
                },
                _ = cache_tick.tick() => {
                    let stale = cache::is_cache_stale(
                        &self.inner.db,
                        &self.inner.scope,
                        self.inner.config.cache_ttl,
                    );
                    if self.inner.monitor.snapshot() && stale {
                        self.refresh_cache_best_effort().await;
                    }
                }
            }
        }
        debug!("engine reactor stopped");
    }

    async fn refresh_cache_best_effort(&self) {
        if let Err(e) = self.sync_item_cache().await {
            warn!(error = %e, "catalog refresh failed");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
