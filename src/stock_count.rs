//! Offline-first stock counting.
//!
//! A counting session is a durable local mirror of one server-side stock
//! count. Recording a count moves the item to `counted` with `synced = 0`
//! immediately; the flag flips only after a confirmed remote write. On
//! re-initialisation the server snapshot is merged item by item, and a
//! locally unsynced item always beats the server version: the server read
//! cannot know about a write that is still in flight.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::RemoteBackend;
use crate::config::SyncScope;
use crate::connectivity::ConnectivityMonitor;
use crate::db::{self, DbState};
use crate::engine::StatusState;
use crate::error::SyncError;
use crate::outbox::{self, ChangePayload, ChangeType, DrainReport, StockCountRecordPayload};

/// Per-item counting state. Only an explicit session reset returns an item
/// to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountStatus {
    Pending,
    Counted,
    Verified,
    Adjusted,
}

impl CountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CountStatus::Pending => "pending",
            CountStatus::Counted => "counted",
            CountStatus::Verified => "verified",
            CountStatus::Adjusted => "adjusted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(CountStatus::Pending),
            "counted" => Some(CountStatus::Counted),
            "verified" => Some(CountStatus::Verified),
            "adjusted" => Some(CountStatus::Adjusted),
            _ => None,
        }
    }
}

/// One row of the local counting session.
#[derive(Debug, Clone)]
pub struct StockCountItem {
    pub id: String,
    pub stock_count_id: String,
    pub item_id: String,
    pub item_name: Option<String>,
    pub item_sku: Option<String>,
    pub expected_quantity: i64,
    pub counted_quantity: Option<i64>,
    pub variance: Option<i64>,
    pub status: CountStatus,
    pub synced: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// One row of the server snapshot handed to `initialize`.
#[derive(Debug, Clone)]
pub struct ServerCountItem {
    pub id: String,
    pub item_id: String,
    pub item_name: Option<String>,
    pub item_sku: Option<String>,
    pub expected_quantity: i64,
    pub counted_quantity: Option<i64>,
    pub variance: Option<i64>,
    pub status: CountStatus,
}

/// Counting progress for the session header.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountProgress {
    pub total: usize,
    pub counted: usize,
    pub unsynced: usize,
}

fn row_to_count_item(row: &Row<'_>) -> rusqlite::Result<StockCountItem> {
    let status_raw: String = row.get(8)?;
    let synced: i64 = row.get(9)?;
    let updated_raw: String = row.get(10)?;
    Ok(StockCountItem {
        id: row.get(0)?,
        stock_count_id: row.get(1)?,
        item_id: row.get(2)?,
        item_name: row.get(3)?,
        item_sku: row.get(4)?,
        expected_quantity: row.get(5)?,
        counted_quantity: row.get(6)?,
        variance: row.get(7)?,
        status: CountStatus::parse(&status_raw).unwrap_or(CountStatus::Pending),
        synced: synced != 0,
        updated_at: db::parse_timestamp(&updated_raw),
    })
}

const COUNT_ITEM_COLUMNS: &str = "id, stock_count_id, item_id, item_name, item_sku, \
                                  expected_quantity, counted_quantity, variance, status, \
                                  synced, updated_at";

/// Offline-first tracker for one counting session at a time. Shares the
/// engine's store, backend, connectivity view, and pending counter.
pub struct StockCountTracker {
    db: Arc<DbState>,
    backend: Arc<dyn RemoteBackend>,
    monitor: Arc<ConnectivityMonitor>,
    scope: SyncScope,
    status: Arc<StatusState>,
    active: Mutex<Option<String>>,
    min_spacing: Duration,
    last_attempt: Mutex<Option<Instant>>,
    in_flight: AtomicBool,
}

impl StockCountTracker {
    pub(crate) fn new(
        db: Arc<DbState>,
        backend: Arc<dyn RemoteBackend>,
        monitor: Arc<ConnectivityMonitor>,
        scope: SyncScope,
        status: Arc<StatusState>,
        min_spacing: Duration,
    ) -> Self {
        Self {
            db,
            backend,
            monitor,
            scope,
            status,
            active: Mutex::new(None),
            min_spacing,
            last_attempt: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Adopt or merge a server snapshot for `stock_count_id`.
    ///
    /// First visit adopts the snapshot verbatim. A later visit merges item
    /// by item: local unsynced rows win, everything else takes the server
    /// value. Sessions belonging to a different (tenant, user) are wiped
    /// first.
    pub fn initialize(
        &self,
        stock_count_id: &str,
        server_items: &[ServerCountItem],
    ) -> Result<(), SyncError> {
        self.reset_foreign_scopes()?;
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            *active = Some(stock_count_id.to_string());
        }

        let now = db::format_timestamp(Utc::now());
        let existing = self.session_id(stock_count_id)?;

        if let Some(session_id) = existing {
            self.merge_server_items(stock_count_id, server_items, &now)?;
            self.touch_session(&session_id, &now)?;
            debug!(stock_count_id, "counting session merged with server snapshot");
        } else {
            self.create_session(stock_count_id, &now)?;
            for item in server_items {
                self.upsert_server_item(stock_count_id, item, &now)?;
            }
            info!(
                stock_count_id,
                items = server_items.len(),
                "counting session adopted from server"
            );
        }
        Ok(())
    }

    /// Record a count. The local row flips to `counted(unsynced)` and the
    /// change is durably queued before any network attempt; a failed
    /// immediate apply falls back silently to the outbox. The local count
    /// is never rolled back.
    pub async fn record_count(&self, count_item_id: &str, quantity: i64) -> Result<(), SyncError> {
        let item = self.get_item(count_item_id)?.ok_or_else(|| {
            SyncError::Storage(format!("stock count item {count_item_id} not known locally"))
        })?;

        let variance = quantity - item.expected_quantity;
        self.mark_item_counted(count_item_id, quantity, variance)?;

        let payload = StockCountRecordPayload {
            stock_count_id: item.stock_count_id.clone(),
            stock_count_item_id: item.id.clone(),
            item_id: item.item_id.clone(),
            expected_quantity: item.expected_quantity,
            counted_quantity: quantity,
            variance,
            counted_at: Utc::now(),
        };
        let change_id = outbox::queue_change(
            &self.db,
            &self.scope,
            ChangePayload::StockCountRecord(payload.clone()),
        )?;
        self.status.pending.fetch_add(1, Ordering::SeqCst);

        if self.monitor.snapshot() {
            match self.backend.record_stock_count(&self.scope, &payload).await {
                Ok(outcome) if outcome.success => {
                    self.mark_item_synced(count_item_id)?;
                    if outbox::mark_completed(&self.db, &self.scope, &change_id)? {
                        self.status.decrement_pending();
                    }
                }
                Ok(outcome) => {
                    debug!(
                        reason = outcome.error.as_deref().unwrap_or("unspecified"),
                        "immediate count apply rejected; left queued"
                    );
                }
                Err(e) => {
                    debug!(error = %e, "immediate count apply failed; left queued");
                }
            }
        }
        Ok(())
    }

    /// Drain queued `stock_count_record` changes only. Rate-limited, and a
    /// no-op while offline or while a previous drain is in flight. Each
    /// success flips the matching item to synced.
    pub async fn sync_pending_changes(&self) -> Result<DrainReport, SyncError> {
        if !self.monitor.snapshot() {
            return Ok(DrainReport::default());
        }
        {
            let mut last = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = *last {
                if prev.elapsed() < self.min_spacing {
                    return Ok(DrainReport::default());
                }
            }
            *last = Some(Instant::now());
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(DrainReport::default());
        }

        let result = self.drain_count_records().await;
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_count_records(&self) -> Result<DrainReport, SyncError> {
        let changes: Vec<_> = outbox::pending_changes(&self.db, &self.scope)?
            .into_iter()
            .filter(|c| c.change_type == ChangeType::StockCountRecord)
            .collect();

        let mut report = DrainReport::default();
        for change in changes {
            report.attempted += 1;
            outbox::mark_syncing(&self.db, &self.scope, &change.id)?;

            let payload: StockCountRecordPayload =
                match serde_json::from_value(change.payload.clone()) {
                    Ok(p) => p,
                    Err(e) => {
                        outbox::mark_failed(
                            &self.db,
                            &self.scope,
                            &change.id,
                            &format!("malformed stock_count_record payload: {e}"),
                        )?;
                        report.failed += 1;
                        continue;
                    }
                };

            match self.backend.record_stock_count(&self.scope, &payload).await {
                Ok(outcome) if outcome.success => {
                    if outbox::mark_completed(&self.db, &self.scope, &change.id)? {
                        self.status.decrement_pending();
                    }
                    self.mark_item_synced(&payload.stock_count_item_id)?;
                    report.succeeded += 1;
                }
                Ok(outcome) => {
                    let reason = outcome
                        .error
                        .unwrap_or_else(|| "rejected by server".to_string());
                    outbox::mark_failed(&self.db, &self.scope, &change.id, &reason)?;
                    report.failed += 1;
                }
                Err(e) => {
                    outbox::mark_failed(&self.db, &self.scope, &change.id, &e.to_string())?;
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                "stock count drain finished"
            );
        }
        Ok(report)
    }

    /// Items of the active session, in insertion order.
    pub fn items(&self) -> Result<Vec<StockCountItem>, SyncError> {
        let Some(stock_count_id) = self.active_id() else {
            return Ok(Vec::new());
        };
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COUNT_ITEM_COLUMNS} FROM stock_count_items
                 WHERE tenant_id = ?1 AND user_id = ?2 AND stock_count_id = ?3
                 ORDER BY rowid ASC"
            ))
            .map_err(|e| SyncError::Storage(format!("items prepare: {e}")))?;
        let rows = stmt
            .query_map(
                params![self.scope.tenant_id, self.scope.user_id, stock_count_id],
                row_to_count_item,
            )
            .map_err(|e| SyncError::Storage(format!("items query: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Counting progress for the active session.
    pub fn progress(&self) -> Result<CountProgress, SyncError> {
        let items = self.items()?;
        let counted = items
            .iter()
            .filter(|i| i.status != CountStatus::Pending)
            .count();
        let unsynced = items.iter().filter(|i| !i.synced).count();
        Ok(CountProgress {
            total: items.len(),
            counted,
            unsynced,
        })
    }

    /// Explicit session reset: the only path that returns items to
    /// `pending` (by dropping the local session so the next initialize
    /// adopts the server snapshot fresh).
    pub fn reset(&self) -> Result<(), SyncError> {
        let Some(stock_count_id) = self.active_id() else {
            return Ok(());
        };
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.execute(
            "DELETE FROM stock_count_items
             WHERE tenant_id = ?1 AND user_id = ?2 AND stock_count_id = ?3",
            params![self.scope.tenant_id, self.scope.user_id, stock_count_id],
        )
        .map_err(|e| SyncError::Storage(format!("reset items: {e}")))?;
        conn.execute(
            "DELETE FROM stock_count_sessions
             WHERE tenant_id = ?1 AND user_id = ?2 AND stock_count_id = ?3",
            params![self.scope.tenant_id, self.scope.user_id, stock_count_id],
        )
        .map_err(|e| SyncError::Storage(format!("reset session: {e}")))?;
        info!(%stock_count_id, "counting session reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Store helpers
    // -----------------------------------------------------------------------

    fn active_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Wipe counting sessions that belong to another (tenant, user). A scope
    /// switch on a shared device must not inherit the previous account's
    /// local counting state.
    fn reset_foreign_scopes(&self) -> Result<(), SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        let removed = conn
            .execute(
                "DELETE FROM stock_count_items
                 WHERE NOT (tenant_id = ?1 AND user_id = ?2)",
                params![self.scope.tenant_id, self.scope.user_id],
            )
            .map_err(|e| SyncError::Storage(format!("reset foreign items: {e}")))?;
        conn.execute(
            "DELETE FROM stock_count_sessions
             WHERE NOT (tenant_id = ?1 AND user_id = ?2)",
            params![self.scope.tenant_id, self.scope.user_id],
        )
        .map_err(|e| SyncError::Storage(format!("reset foreign sessions: {e}")))?;
        if removed > 0 {
            info!(removed, "cleared counting state from another scope");
        }
        Ok(())
    }

    fn session_id(&self, stock_count_id: &str) -> Result<Option<String>, SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.query_row(
            "SELECT id FROM stock_count_sessions
             WHERE tenant_id = ?1 AND user_id = ?2 AND stock_count_id = ?3",
            params![self.scope.tenant_id, self.scope.user_id, stock_count_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("session_id: {e}")))
    }

    fn create_session(&self, stock_count_id: &str, now: &str) -> Result<(), SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.execute(
            "INSERT INTO stock_count_sessions (
                 id, tenant_id, user_id, stock_count_id, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![
                Uuid::new_v4().to_string(),
                self.scope.tenant_id,
                self.scope.user_id,
                stock_count_id,
                now,
            ],
        )
        .map_err(|e| SyncError::Storage(format!("create_session: {e}")))?;
        Ok(())
    }

    fn touch_session(&self, session_id: &str, now: &str) -> Result<(), SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.execute(
            "UPDATE stock_count_sessions SET updated_at = ?2 WHERE id = ?1",
            params![session_id, now],
        )
        .map_err(|e| SyncError::Storage(format!("touch_session: {e}")))?;
        Ok(())
    }

    /// Write one server item into the session verbatim (`synced = 1`).
    fn upsert_server_item(
        &self,
        stock_count_id: &str,
        item: &ServerCountItem,
        now: &str,
    ) -> Result<(), SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.execute(
            "INSERT INTO stock_count_items (
                 id, tenant_id, user_id, stock_count_id, item_id, item_name,
                 item_sku, expected_quantity, counted_quantity, variance,
                 status, synced, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12)
             ON CONFLICT(tenant_id, user_id, id) DO UPDATE SET
                item_id = excluded.item_id,
                item_name = excluded.item_name,
                item_sku = excluded.item_sku,
                expected_quantity = excluded.expected_quantity,
                counted_quantity = excluded.counted_quantity,
                variance = excluded.variance,
                status = excluded.status,
                synced = 1,
                updated_at = excluded.updated_at",
            params![
                item.id,
                self.scope.tenant_id,
                self.scope.user_id,
                stock_count_id,
                item.item_id,
                item.item_name,
                item.item_sku,
                item.expected_quantity,
                item.counted_quantity,
                item.variance,
                item.status.as_str(),
                now,
            ],
        )
        .map_err(|e| SyncError::Storage(format!("upsert_server_item ({}): {e}", item.id)))?;
        Ok(())
    }

    /// Item-by-item merge: local unsynced rows win; everything else takes
    /// the server value. Synced local rows missing from the snapshot are
    /// dropped (the server no longer knows them).
    fn merge_server_items(
        &self,
        stock_count_id: &str,
        server_items: &[ServerCountItem],
        now: &str,
    ) -> Result<(), SyncError> {
        for item in server_items {
            if let Some(local) = self.get_item(&item.id)? {
                if !local.synced {
                    continue;
                }
            }
            self.upsert_server_item(stock_count_id, item, now)?;
        }

        let server_ids: std::collections::HashSet<&str> =
            server_items.iter().map(|i| i.id.as_str()).collect();
        for local in self.items_for(stock_count_id)? {
            if local.synced && !server_ids.contains(local.id.as_str()) {
                let conn = self
                    .db
                    .conn
                    .lock()
                    .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
                conn.execute(
                    "DELETE FROM stock_count_items
                     WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3",
                    params![self.scope.tenant_id, self.scope.user_id, local.id],
                )
                .map_err(|e| SyncError::Storage(format!("merge delete ({}): {e}", local.id)))?;
            }
        }
        Ok(())
    }

    fn items_for(&self, stock_count_id: &str) -> Result<Vec<StockCountItem>, SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {COUNT_ITEM_COLUMNS} FROM stock_count_items
                 WHERE tenant_id = ?1 AND user_id = ?2 AND stock_count_id = ?3
                 ORDER BY rowid ASC"
            ))
            .map_err(|e| SyncError::Storage(format!("items_for prepare: {e}")))?;
        let rows = stmt
            .query_map(
                params![self.scope.tenant_id, self.scope.user_id, stock_count_id],
                row_to_count_item,
            )
            .map_err(|e| SyncError::Storage(format!("items_for query: {e}")))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    fn get_item(&self, count_item_id: &str) -> Result<Option<StockCountItem>, SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.query_row(
            &format!(
                "SELECT {COUNT_ITEM_COLUMNS} FROM stock_count_items
                 WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3"
            ),
            params![self.scope.tenant_id, self.scope.user_id, count_item_id],
            row_to_count_item,
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("get_item: {e}")))
    }

    fn mark_item_counted(
        &self,
        count_item_id: &str,
        quantity: i64,
        variance: i64,
    ) -> Result<(), SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.execute(
            "UPDATE stock_count_items
             SET counted_quantity = ?4, variance = ?5, status = 'counted',
                 synced = 0, updated_at = ?6
             WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3",
            params![
                self.scope.tenant_id,
                self.scope.user_id,
                count_item_id,
                quantity,
                variance,
                db::format_timestamp(Utc::now()),
            ],
        )
        .map_err(|e| SyncError::Storage(format!("mark_item_counted: {e}")))?;
        Ok(())
    }

    fn mark_item_synced(&self, count_item_id: &str) -> Result<(), SyncError> {
        let conn = self
            .db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        conn.execute(
            "UPDATE stock_count_items
             SET synced = 1, updated_at = ?4
             WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3",
            params![
                self.scope.tenant_id,
                self.scope.user_id,
                count_item_id,
                db::format_timestamp(Utc::now()),
            ],
        )
        .map_err(|e| SyncError::Storage(format!("mark_item_synced: {e}")))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
