//! Durable outbox of pending mutations.
//!
//! Every user mutation taken while offline (or awaiting confirmation) lands
//! here as an append-only `pending_changes` row. The drain walks pending rows
//! strictly in creation order and applies each against the remote backend;
//! a failure marks that row and moves on, it never halts the batch.
//!
//! Status transitions: `pending -> syncing -> {completed | failed}`, and
//! `failed -> pending` only through an explicit retry. A row found `syncing`
//! at startup was interrupted mid-submission and is requeued.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::RemoteBackend;
use crate::config::SyncScope;
use crate::db::{self, DbState, META_LAST_SUCCESSFUL_SYNC};
use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Change kinds and payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    QuantityAdjust,
    Checkout,
    Checkin,
    StockCountRecord,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::QuantityAdjust => "quantity_adjust",
            ChangeType::Checkout => "checkout",
            ChangeType::Checkin => "checkin",
            ChangeType::StockCountRecord => "stock_count_record",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "quantity_adjust" => Some(ChangeType::QuantityAdjust),
            "checkout" => Some(ChangeType::Checkout),
            "checkin" => Some(ChangeType::Checkin),
            "stock_count_record" => Some(ChangeType::StockCountRecord),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Syncing => "syncing",
            ChangeStatus::Completed => "completed",
            ChangeStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(ChangeStatus::Pending),
            "syncing" => Some(ChangeStatus::Syncing),
            "completed" => Some(ChangeStatus::Completed),
            "failed" => Some(ChangeStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityAdjustPayload {
    pub item_id: String,
    pub previous_quantity: i64,
    pub new_quantity: i64,
    pub adjustment: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutPayload {
    pub item_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckinPayload {
    pub item_id: String,
    pub quantity: i64,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockCountRecordPayload {
    pub stock_count_id: String,
    pub stock_count_item_id: String,
    pub item_id: String,
    pub expected_quantity: i64,
    pub counted_quantity: i64,
    pub variance: i64,
    pub counted_at: DateTime<Utc>,
}

/// A typed mutation heading for the queue.
#[derive(Debug, Clone)]
pub enum ChangePayload {
    QuantityAdjust(QuantityAdjustPayload),
    Checkout(CheckoutPayload),
    Checkin(CheckinPayload),
    StockCountRecord(StockCountRecordPayload),
}

impl ChangePayload {
    pub fn change_type(&self) -> ChangeType {
        match self {
            ChangePayload::QuantityAdjust(_) => ChangeType::QuantityAdjust,
            ChangePayload::Checkout(_) => ChangeType::Checkout,
            ChangePayload::Checkin(_) => ChangeType::Checkin,
            ChangePayload::StockCountRecord(_) => ChangeType::StockCountRecord,
        }
    }

    pub fn entity_type(&self) -> &'static str {
        match self {
            ChangePayload::StockCountRecord(_) => "stock_count_item",
            _ => "inventory_item",
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            ChangePayload::QuantityAdjust(p) => &p.item_id,
            ChangePayload::Checkout(p) => &p.item_id,
            ChangePayload::Checkin(p) => &p.item_id,
            ChangePayload::StockCountRecord(p) => &p.stock_count_item_id,
        }
    }

    fn to_value(&self) -> Result<Value, SyncError> {
        let result = match self {
            ChangePayload::QuantityAdjust(p) => serde_json::to_value(p),
            ChangePayload::Checkout(p) => serde_json::to_value(p),
            ChangePayload::Checkin(p) => serde_json::to_value(p),
            ChangePayload::StockCountRecord(p) => serde_json::to_value(p),
        };
        result.map_err(|e| SyncError::Storage(format!("serialize payload: {e}")))
    }
}

/// One outbox row.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub id: String,
    pub change_type: ChangeType,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub status: ChangeStatus,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
}

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<PendingChange> {
    let change_type_raw: String = row.get(1)?;
    let status_raw: String = row.get(5)?;
    let payload_raw: String = row.get(4)?;
    let created_at_raw: String = row.get(8)?;
    let synced_at_raw: Option<String> = row.get(9)?;
    Ok(PendingChange {
        id: row.get(0)?,
        change_type: ChangeType::parse(&change_type_raw).unwrap_or(ChangeType::QuantityAdjust),
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(Value::Null),
        status: ChangeStatus::parse(&status_raw).unwrap_or(ChangeStatus::Pending),
        retry_count: row.get(6)?,
        last_error: row.get(7)?,
        created_at: db::parse_timestamp(&created_at_raw),
        synced_at: synced_at_raw.as_deref().and_then(db::parse_timestamp),
    })
}

const CHANGE_COLUMNS: &str = "id, change_type, entity_type, entity_id, payload, status, \
                              retry_count, last_error, created_at, synced_at";

// ---------------------------------------------------------------------------
// Queue operations
// ---------------------------------------------------------------------------

/// Append a new change with status `pending`. Returns the change id once the
/// row is durably persisted.
pub fn queue_change(
    db: &DbState,
    scope: &SyncScope,
    payload: ChangePayload,
) -> Result<String, SyncError> {
    let id = Uuid::new_v4().to_string();
    let now = db::format_timestamp(Utc::now());
    let payload_json = serde_json::to_string(&payload.to_value()?)
        .map_err(|e| SyncError::Storage(format!("serialize payload: {e}")))?;

    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.execute(
        "INSERT INTO pending_changes (
             id, tenant_id, user_id, change_type, entity_type, entity_id,
             payload, status, retry_count, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?8)",
        params![
            id,
            scope.tenant_id,
            scope.user_id,
            payload.change_type().as_str(),
            payload.entity_type(),
            payload.entity_id(),
            payload_json,
            now,
        ],
    )
    .map_err(|e| SyncError::Storage(format!("queue_change: {e}")))?;

    debug!(change_id = %id, change_type = payload.change_type().as_str(), "change queued");
    Ok(id)
}

/// All `pending` changes for a scope, FIFO by creation time.
pub fn pending_changes(db: &DbState, scope: &SyncScope) -> Result<Vec<PendingChange>, SyncError> {
    changes_with_status(db, scope, ChangeStatus::Pending)
}

/// All `failed` changes for a scope.
pub fn failed_changes(db: &DbState, scope: &SyncScope) -> Result<Vec<PendingChange>, SyncError> {
    changes_with_status(db, scope, ChangeStatus::Failed)
}

fn changes_with_status(
    db: &DbState,
    scope: &SyncScope,
    status: ChangeStatus,
) -> Result<Vec<PendingChange>, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CHANGE_COLUMNS} FROM pending_changes
             WHERE tenant_id = ?1 AND user_id = ?2 AND status = ?3
             ORDER BY created_at ASC, rowid ASC"
        ))
        .map_err(|e| SyncError::Storage(format!("pending_changes prepare: {e}")))?;
    let rows = stmt
        .query_map(
            params![scope.tenant_id, scope.user_id, status.as_str()],
            row_to_change,
        )
        .map_err(|e| SyncError::Storage(format!("pending_changes query: {e}")))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Load a single change by id.
pub fn get_change(
    db: &DbState,
    scope: &SyncScope,
    id: &str,
) -> Result<Option<PendingChange>, SyncError> {
    use rusqlite::OptionalExtension;
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.query_row(
        &format!(
            "SELECT {CHANGE_COLUMNS} FROM pending_changes
             WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3"
        ),
        params![scope.tenant_id, scope.user_id, id],
        row_to_change,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("get_change: {e}")))
}

/// Count of changes still awaiting delivery (`pending` plus interrupted
/// `syncing` rows; both represent unsynced work).
pub fn pending_change_count(db: &DbState, scope: &SyncScope) -> Result<i64, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.query_row(
        "SELECT COUNT(*) FROM pending_changes
         WHERE tenant_id = ?1 AND user_id = ?2 AND status IN ('pending', 'syncing')",
        params![scope.tenant_id, scope.user_id],
        |row| row.get(0),
    )
    .map_err(|e| SyncError::Storage(format!("pending_change_count: {e}")))
}

/// Mark a change as `syncing`. No-op unless the row is currently pending.
pub fn mark_syncing(db: &DbState, scope: &SyncScope, id: &str) -> Result<(), SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.execute(
        "UPDATE pending_changes
         SET status = 'syncing', updated_at = ?4
         WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3
           AND status IN ('pending', 'syncing')",
        params![
            scope.tenant_id,
            scope.user_id,
            id,
            db::format_timestamp(Utc::now())
        ],
    )
    .map_err(|e| SyncError::Storage(format!("mark_syncing: {e}")))?;
    Ok(())
}

/// Mark a change as `completed`. Returns `true` only when this call actually
/// performed the transition, so callers can keep pending counters honest
/// when the same completion is reported twice.
pub fn mark_completed(db: &DbState, scope: &SyncScope, id: &str) -> Result<bool, SyncError> {
    let now = db::format_timestamp(Utc::now());
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let rows = conn
        .execute(
            "UPDATE pending_changes
             SET status = 'completed', synced_at = ?4, updated_at = ?4, last_error = NULL
             WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3
               AND status != 'completed'",
            params![scope.tenant_id, scope.user_id, id, now],
        )
        .map_err(|e| SyncError::Storage(format!("mark_completed: {e}")))?;
    Ok(rows > 0)
}

/// Mark a change as `failed`, capturing the error and bumping the retry
/// counter. Completed rows are never resurrected.
pub fn mark_failed(
    db: &DbState,
    scope: &SyncScope,
    id: &str,
    error: &str,
) -> Result<(), SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.execute(
        "UPDATE pending_changes
         SET status = 'failed', retry_count = retry_count + 1,
             last_error = ?4, updated_at = ?5
         WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3
           AND status != 'completed'",
        params![
            scope.tenant_id,
            scope.user_id,
            id,
            error,
            db::format_timestamp(Utc::now())
        ],
    )
    .map_err(|e| SyncError::Storage(format!("mark_failed: {e}")))?;
    Ok(())
}

/// Reset every `failed` change back to `pending` (the explicit retry action).
pub fn reset_failed_changes(db: &DbState, scope: &SyncScope) -> Result<usize, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let rows = conn
        .execute(
            "UPDATE pending_changes
             SET status = 'pending', retry_count = 0, last_error = NULL, updated_at = ?3
             WHERE tenant_id = ?1 AND user_id = ?2 AND status = 'failed'",
            params![
                scope.tenant_id,
                scope.user_id,
                db::format_timestamp(Utc::now())
            ],
        )
        .map_err(|e| SyncError::Storage(format!("reset_failed_changes: {e}")))?;
    Ok(rows)
}

/// Requeue rows stuck in `syncing`: a crash or reload mid-submission left
/// them behind, and the next drain should pick them up again.
pub fn requeue_syncing_changes(db: &DbState, scope: &SyncScope) -> Result<usize, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let rows = conn
        .execute(
            "UPDATE pending_changes
             SET status = 'pending', updated_at = ?3
             WHERE tenant_id = ?1 AND user_id = ?2 AND status = 'syncing'",
            params![
                scope.tenant_id,
                scope.user_id,
                db::format_timestamp(Utc::now())
            ],
        )
        .map_err(|e| SyncError::Storage(format!("requeue_syncing_changes: {e}")))?;
    if rows > 0 {
        info!(requeued = rows, "requeued changes interrupted mid-submission");
    }
    Ok(rows)
}

/// Delete completed rows. They are kept around after a drain for visibility;
/// callers prune on their own schedule.
pub fn prune_completed(db: &DbState, scope: &SyncScope) -> Result<usize, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let rows = conn
        .execute(
            "DELETE FROM pending_changes
             WHERE tenant_id = ?1 AND user_id = ?2 AND status = 'completed'",
            params![scope.tenant_id, scope.user_id],
        )
        .map_err(|e| SyncError::Storage(format!("prune_completed: {e}")))?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Drain
// ---------------------------------------------------------------------------

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DrainReport {
    /// Collapse into a `Result`, surfacing an aggregate error when any change
    /// failed during the pass.
    pub fn into_result(self) -> Result<DrainReport, SyncError> {
        if self.failed > 0 {
            Err(SyncError::DrainIncomplete {
                failed: self.failed,
            })
        } else {
            Ok(self)
        }
    }
}

/// Drain every eligible change, strictly sequentially in creation order.
///
/// Each change is marked `syncing`, dispatched to its per-type remote apply,
/// and marked `completed` or `failed`. A failure records the message and
/// moves on. Callers hold the single in-flight guard; this function assumes
/// it is not re-entered for the same scope.
pub async fn process_queue(
    db: &DbState,
    backend: &dyn RemoteBackend,
    scope: &SyncScope,
) -> Result<DrainReport, SyncError> {
    requeue_syncing_changes(db, scope)?;
    let pending = pending_changes(db, scope)?;
    let mut report = DrainReport::default();

    if pending.is_empty() {
        return Ok(report);
    }
    debug!(count = pending.len(), "draining pending changes");

    for change in pending {
        report.attempted += 1;
        mark_syncing(db, scope, &change.id)?;

        match dispatch_change(backend, scope, &change).await {
            Ok(()) => {
                mark_completed(db, scope, &change.id)?;
                report.succeeded += 1;
            }
            Err(err) => {
                let message = err.to_string();
                warn!(
                    change_id = %change.id,
                    change_type = change.change_type.as_str(),
                    error = %message,
                    "change failed to sync"
                );
                mark_failed(db, scope, &change.id, &message)?;
                report.failed += 1;
            }
        }
    }

    if report.succeeded > 0 {
        let conn = db
            .conn
            .lock()
            .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
        db::set_metadata_time(&conn, scope, META_LAST_SUCCESSFUL_SYNC, Utc::now())?;
    }
    if report.failed > 0 {
        warn!(failed = report.failed, "drain finished with failures");
    } else {
        info!(succeeded = report.succeeded, "drain complete");
    }

    Ok(report)
}

/// Apply one change against the remote backend.
async fn dispatch_change(
    backend: &dyn RemoteBackend,
    scope: &SyncScope,
    change: &PendingChange,
) -> Result<(), SyncError> {
    match change.change_type {
        ChangeType::QuantityAdjust => {
            let payload: QuantityAdjustPayload = parse_payload(change)?;
            backend
                .apply_quantity_adjustment(scope, &payload)
                .await?
                .into_result()
        }
        ChangeType::Checkout => {
            let payload: CheckoutPayload = parse_payload(change)?;
            backend.apply_checkout(scope, &payload).await?.into_result()
        }
        ChangeType::Checkin => {
            let payload: CheckinPayload = parse_payload(change)?;
            backend.apply_checkin(scope, &payload).await?.into_result()
        }
        ChangeType::StockCountRecord => {
            let payload: StockCountRecordPayload = parse_payload(change)?;
            backend
                .record_stock_count(scope, &payload)
                .await?
                .into_result()
        }
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(change: &PendingChange) -> Result<T, SyncError> {
    serde_json::from_value(change.payload.clone()).map_err(|e| {
        SyncError::Storage(format!(
            "malformed {} payload for change {}: {e}",
            change.change_type.as_str(),
            change.id
        ))
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::MockBackend;
    use crate::db;
    use rusqlite::Connection;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn scope() -> SyncScope {
        SyncScope::new("tenant-1", "user-1")
    }

    fn adjust_payload(item_id: &str, from: i64, to: i64) -> ChangePayload {
        ChangePayload::QuantityAdjust(QuantityAdjustPayload {
            item_id: item_id.to_string(),
            previous_quantity: from,
            new_quantity: to,
            adjustment: to - from,
            reason: None,
        })
    }

    #[test]
    fn test_queue_change_appends_pending_fifo() {
        let db = test_db();
        let first = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        let second = queue_change(&db, &scope(), adjust_payload("item-b", 4, 5)).unwrap();

        assert_eq!(pending_change_count(&db, &scope()).unwrap(), 2);

        let pending = pending_changes(&db, &scope()).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first);
        assert_eq!(pending[1].id, second);
        assert_eq!(pending[0].status, ChangeStatus::Pending);
        assert_eq!(pending[0].entity_type, "inventory_item");
    }

    #[test]
    fn test_queue_is_scoped_per_tenant_and_user() {
        let db = test_db();
        queue_change(&db, &scope(), adjust_payload("item-a", 1, 2)).unwrap();

        let other = SyncScope::new("tenant-2", "user-1");
        assert_eq!(pending_change_count(&db, &other).unwrap(), 0);
        assert!(pending_changes(&db, &other).unwrap().is_empty());
    }

    #[test]
    fn test_mark_completed_is_idempotent() {
        let db = test_db();
        let id = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();

        mark_syncing(&db, &scope(), &id).unwrap();
        assert!(mark_completed(&db, &scope(), &id).unwrap());
        // Second completion reports no transition — no double decrement.
        assert!(!mark_completed(&db, &scope(), &id).unwrap());

        let change = get_change(&db, &scope(), &id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Completed);
        assert!(change.synced_at.is_some());
    }

    #[test]
    fn test_mark_failed_records_error_and_retry_count() {
        let db = test_db();
        let id = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();

        mark_syncing(&db, &scope(), &id).unwrap();
        mark_failed(&db, &scope(), &id, "transport error: timed out").unwrap();

        let change = get_change(&db, &scope(), &id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Failed);
        assert_eq!(change.retry_count, 1);
        assert_eq!(
            change.last_error.as_deref(),
            Some("transport error: timed out")
        );

        // Failed rows are no longer pending
        assert!(pending_changes(&db, &scope()).unwrap().is_empty());
    }

    #[test]
    fn test_mark_failed_never_resurrects_completed() {
        let db = test_db();
        let id = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        mark_syncing(&db, &scope(), &id).unwrap();
        assert!(mark_completed(&db, &scope(), &id).unwrap());

        mark_failed(&db, &scope(), &id, "late failure report").unwrap();
        let change = get_change(&db, &scope(), &id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Completed);
    }

    #[test]
    fn test_reset_failed_changes_returns_rows_to_pending() {
        let db = test_db();
        let id = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        mark_syncing(&db, &scope(), &id).unwrap();
        mark_failed(&db, &scope(), &id, "boom").unwrap();

        assert_eq!(reset_failed_changes(&db, &scope()).unwrap(), 1);

        let change = get_change(&db, &scope(), &id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Pending);
        assert_eq!(change.retry_count, 0);
        assert!(change.last_error.is_none());
    }

    #[test]
    fn test_requeue_syncing_changes_recovers_interrupted_rows() {
        let db = test_db();
        let id = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        mark_syncing(&db, &scope(), &id).unwrap();

        // Simulated crash: the row is still `syncing` on next startup.
        assert_eq!(requeue_syncing_changes(&db, &scope()).unwrap(), 1);
        let change = get_change(&db, &scope(), &id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Pending);

        // Nothing stuck — second call is a no-op
        assert_eq!(requeue_syncing_changes(&db, &scope()).unwrap(), 0);
    }

    #[test]
    fn test_prune_completed_leaves_other_rows() {
        let db = test_db();
        let done = queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        let open = queue_change(&db, &scope(), adjust_payload("item-b", 2, 3)).unwrap();
        mark_syncing(&db, &scope(), &done).unwrap();
        mark_completed(&db, &scope(), &done).unwrap();

        assert_eq!(prune_completed(&db, &scope()).unwrap(), 1);
        assert!(get_change(&db, &scope(), &done).unwrap().is_none());
        assert!(get_change(&db, &scope(), &open).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_drain_applies_changes_in_order() {
        let db = test_db();
        let backend = MockBackend::online();
        queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        queue_change(&db, &scope(), adjust_payload("item-a", 7, 5)).unwrap();

        let report = process_queue(&db, &backend, &scope()).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(pending_change_count(&db, &scope()).unwrap(), 0);

        let applied = backend.adjustments.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].new_quantity, 7);
        assert_eq!(applied[1].new_quantity, 5);
    }

    #[tokio::test]
    async fn test_drain_failure_does_not_halt_the_batch() {
        let db = test_db();
        let backend = MockBackend::online();
        backend.fail_transport_for("item-bad");

        queue_change(&db, &scope(), adjust_payload("item-bad", 9, 8)).unwrap();
        let good = queue_change(&db, &scope(), adjust_payload("item-good", 3, 4)).unwrap();

        let report = process_queue(&db, &backend, &scope()).await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(matches!(
            report.into_result(),
            Err(SyncError::DrainIncomplete { failed: 1 })
        ));

        let good_change = get_change(&db, &scope(), &good).unwrap().unwrap();
        assert_eq!(good_change.status, ChangeStatus::Completed);

        let failed = failed_changes(&db, &scope()).unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_drain_records_business_rejection() {
        let db = test_db();
        let backend = MockBackend::online();
        backend.reject_for("item-a");

        queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        let report = process_queue(&db, &backend, &scope()).await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = failed_changes(&db, &scope()).unwrap();
        assert!(failed[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("rejected"));
        // The rejected adjustment was never recorded as applied
        assert!(backend.adjustments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_after_transport_failure_converges() {
        let db = test_db();
        let backend = MockBackend::online();
        backend.fail_transport_for("item-a");

        queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();
        let report = process_queue(&db, &backend, &scope()).await.unwrap();
        assert_eq!(report.failed, 1);

        // Server recovers; explicit retry drains everything not yet completed.
        backend.clear_transport_failures();
        reset_failed_changes(&db, &scope()).unwrap();
        let report = process_queue(&db, &backend, &scope()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(pending_change_count(&db, &scope()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_updates_last_successful_sync_only_on_success() {
        let db = test_db();
        let backend = MockBackend::online();
        backend.fail_transport_for("item-a");
        queue_change(&db, &scope(), adjust_payload("item-a", 10, 7)).unwrap();

        process_queue(&db, &backend, &scope()).await.unwrap();
        {
            let conn = db.conn.lock().unwrap();
            assert!(db::get_metadata_time(&conn, &scope(), META_LAST_SUCCESSFUL_SYNC).is_none());
        }

        backend.clear_transport_failures();
        reset_failed_changes(&db, &scope()).unwrap();
        process_queue(&db, &backend, &scope()).await.unwrap();
        {
            let conn = db.conn.lock().unwrap();
            assert!(db::get_metadata_time(&conn, &scope(), META_LAST_SUCCESSFUL_SYNC).is_some());
        }
    }

    #[tokio::test]
    async fn test_drain_with_empty_queue_is_a_noop() {
        let db = test_db();
        let backend = MockBackend::online();
        let report = process_queue(&db, &backend, &scope()).await.unwrap();
        assert_eq!(report.attempted, 0);
    }
}
