//! Offline item cache: a local projection of the catalog keyed by
//! barcode/SKU so scans keep resolving while the network is down.
//!
//! Rows are written wholesale by cache sync passes and by the optimistic
//! quantity update; between passes they are read-only. Lookups never touch
//! the network.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{RemoteBackend, RemoteItem};
use crate::config::SyncScope;
use crate::db::{self, DbState, META_LAST_CACHE_SYNC};
use crate::error::SyncError;

/// One locally cached catalog item.
#[derive(Debug, Clone)]
pub struct CachedItem {
    pub id: String,
    pub barcode: Option<String>,
    pub sku: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub min_quantity: Option<i64>,
    pub price: Option<f64>,
    pub image_url: Option<String>,
    pub folder_name: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Cache freshness summary for diagnostics and the status indicator.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub item_count: i64,
    pub last_sync: Option<DateTime<Utc>>,
    pub is_stale: bool,
}

/// Result of one catalog refresh.
#[derive(Debug, Clone, Copy)]
pub struct CacheSyncReport {
    pub items_updated: usize,
    pub total_cached: i64,
}

const ITEM_COLUMNS: &str = "id, barcode, sku, name, quantity, min_quantity, price, \
                            image_url, folder_name, last_synced_at";

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<CachedItem> {
    let last_synced_raw: String = row.get(9)?;
    Ok(CachedItem {
        id: row.get(0)?,
        barcode: row.get(1)?,
        sku: row.get(2)?,
        name: row.get(3)?,
        quantity: row.get(4)?,
        min_quantity: row.get(5)?,
        price: row.get(6)?,
        image_url: row.get(7)?,
        folder_name: row.get(8)?,
        last_synced_at: db::parse_timestamp(&last_synced_raw),
    })
}

// ---------------------------------------------------------------------------
// Store operations
// ---------------------------------------------------------------------------

/// Upsert a batch of catalog items in one transaction. Existing rows are
/// overwritten wholesale.
pub fn upsert_items(
    db: &DbState,
    scope: &SyncScope,
    items: &[RemoteItem],
    synced_at: DateTime<Utc>,
) -> Result<usize, SyncError> {
    if items.is_empty() {
        return Ok(0);
    }
    let synced_at = db::format_timestamp(synced_at);
    let mut conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let tx = conn
        .transaction()
        .map_err(|e| SyncError::Storage(format!("upsert_items begin: {e}")))?;
    {
        let mut stmt = tx
            .prepare(
                "INSERT INTO cached_items (
                     id, tenant_id, user_id, barcode, sku, name, quantity,
                     min_quantity, price, image_url, folder_name, last_synced_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(tenant_id, user_id, id) DO UPDATE SET
                    barcode = excluded.barcode,
                    sku = excluded.sku,
                    name = excluded.name,
                    quantity = excluded.quantity,
                    min_quantity = excluded.min_quantity,
                    price = excluded.price,
                    image_url = excluded.image_url,
                    folder_name = excluded.folder_name,
                    last_synced_at = excluded.last_synced_at",
            )
            .map_err(|e| SyncError::Storage(format!("upsert_items prepare: {e}")))?;
        for item in items {
            stmt.execute(params![
                item.id,
                scope.tenant_id,
                scope.user_id,
                item.barcode,
                item.sku,
                item.name,
                item.quantity,
                item.min_quantity,
                item.price,
                item.image_url,
                item.folder_name,
                synced_at,
            ])
            .map_err(|e| SyncError::Storage(format!("upsert_items ({}): {e}", item.id)))?;
        }
    }
    tx.commit()
        .map_err(|e| SyncError::Storage(format!("upsert_items commit: {e}")))?;
    Ok(items.len())
}

/// Look up an item by barcode. Barcodes are not necessarily unique; the
/// first match (lowest id) wins.
pub fn lookup_by_barcode(
    db: &DbState,
    scope: &SyncScope,
    barcode: &str,
) -> Result<Option<CachedItem>, SyncError> {
    lookup_by_column(db, scope, "barcode", barcode)
}

/// Look up an item by SKU. First match wins, as for barcodes.
pub fn lookup_by_sku(
    db: &DbState,
    scope: &SyncScope,
    sku: &str,
) -> Result<Option<CachedItem>, SyncError> {
    lookup_by_column(db, scope, "sku", sku)
}

fn lookup_by_column(
    db: &DbState,
    scope: &SyncScope,
    column: &str,
    value: &str,
) -> Result<Option<CachedItem>, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.query_row(
        &format!(
            "SELECT {ITEM_COLUMNS} FROM cached_items
             WHERE tenant_id = ?1 AND user_id = ?2 AND {column} = ?3
             ORDER BY id ASC LIMIT 1"
        ),
        params![scope.tenant_id, scope.user_id, value],
        row_to_item,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("lookup_by_{column}: {e}")))
}

/// Look up an item by its id.
pub fn lookup_by_id(
    db: &DbState,
    scope: &SyncScope,
    id: &str,
) -> Result<Option<CachedItem>, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.query_row(
        &format!(
            "SELECT {ITEM_COLUMNS} FROM cached_items
             WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3"
        ),
        params![scope.tenant_id, scope.user_id, id],
        row_to_item,
    )
    .optional()
    .map_err(|e| SyncError::Storage(format!("lookup_by_id: {e}")))
}

/// Optimistic quantity write for the local read-your-write guarantee.
/// Returns `false` when the item is not cached (nothing to update).
pub fn update_cached_quantity(
    db: &DbState,
    scope: &SyncScope,
    id: &str,
    new_quantity: i64,
) -> Result<bool, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let rows = conn
        .execute(
            "UPDATE cached_items SET quantity = ?4
             WHERE tenant_id = ?1 AND user_id = ?2 AND id = ?3",
            params![scope.tenant_id, scope.user_id, id, new_quantity],
        )
        .map_err(|e| SyncError::Storage(format!("update_cached_quantity: {e}")))?;
    Ok(rows > 0)
}

/// Number of cached items for a scope.
pub fn item_count(db: &DbState, scope: &SyncScope) -> Result<i64, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    conn.query_row(
        "SELECT COUNT(*) FROM cached_items WHERE tenant_id = ?1 AND user_id = ?2",
        params![scope.tenant_id, scope.user_id],
        |row| row.get(0),
    )
    .map_err(|e| SyncError::Storage(format!("item_count: {e}")))
}

/// Drop every cached item for a scope.
pub fn clear_cache(db: &DbState, scope: &SyncScope) -> Result<usize, SyncError> {
    let conn = db
        .conn
        .lock()
        .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
    let rows = conn
        .execute(
            "DELETE FROM cached_items WHERE tenant_id = ?1 AND user_id = ?2",
            params![scope.tenant_id, scope.user_id],
        )
        .map_err(|e| SyncError::Storage(format!("clear_cache: {e}")))?;
    Ok(rows)
}

/// When the catalog was last refreshed for this scope.
pub fn last_cache_sync(db: &DbState, scope: &SyncScope) -> Option<DateTime<Utc>> {
    let conn = db.conn.lock().ok()?;
    db::get_metadata_time(&conn, scope, META_LAST_CACHE_SYNC)
}

/// True when the cached projection is older than `ttl`, or has never been
/// synced at all. A store failure also reads as stale.
pub fn is_cache_stale(db: &DbState, scope: &SyncScope, ttl: Duration) -> bool {
    match last_cache_sync(db, scope) {
        Some(last) => {
            let age = Utc::now().signed_duration_since(last);
            age.num_milliseconds() > ttl.as_millis() as i64
        }
        None => true,
    }
}

/// Cache freshness summary.
pub fn cache_stats(db: &DbState, scope: &SyncScope, ttl: Duration) -> Result<CacheStats, SyncError> {
    Ok(CacheStats {
        item_count: item_count(db, scope)?,
        last_sync: last_cache_sync(db, scope),
        is_stale: is_cache_stale(db, scope, ttl),
    })
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Pages the scoped catalog into the local cache. One instance per engine;
/// an in-flight flag keeps overlapping passes from racing each other.
pub struct CacheSynchronizer {
    db: Arc<DbState>,
    backend: Arc<dyn RemoteBackend>,
    in_flight: AtomicBool,
    page_size: u32,
}

impl CacheSynchronizer {
    pub fn new(db: Arc<DbState>, backend: Arc<dyn RemoteBackend>, page_size: u32) -> Self {
        Self {
            db,
            backend,
            in_flight: AtomicBool::new(false),
            page_size,
        }
    }

    /// Refresh the cached catalog for a scope.
    ///
    /// Returns `Ok(None)` when the pass was skipped: another pass is already
    /// in flight, or the local store is unavailable (which degrades offline
    /// lookups rather than erroring). `last_cache_sync` moves only on a pass
    /// that fetched every page.
    pub async fn sync_item_cache(
        &self,
        scope: &SyncScope,
    ) -> Result<Option<CacheSyncReport>, SyncError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("cache sync already in flight, skipping");
            return Ok(None);
        }

        let result = self.run(scope).await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(report) => Ok(Some(report)),
            Err(SyncError::Storage(reason)) => {
                warn!(%reason, "cache sync skipped: local store unavailable");
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    async fn run(&self, scope: &SyncScope) -> Result<CacheSyncReport, SyncError> {
        let mut cursor: Option<String> = None;
        let mut items_updated = 0usize;

        loop {
            let page = self
                .backend
                .fetch_catalog_page(scope, cursor.as_deref(), self.page_size)
                .await?;
            items_updated += upsert_items(&self.db, scope, &page.items, Utc::now())?;

            match page.next_cursor {
                Some(next) if !page.items.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        {
            let conn = self
                .db
                .conn
                .lock()
                .map_err(|_| SyncError::Storage("database lock poisoned".into()))?;
            db::set_metadata_time(&conn, scope, META_LAST_CACHE_SYNC, Utc::now())?;
        }

        let total_cached = item_count(&self.db, scope)?;
        info!(items_updated, total_cached, "item cache refreshed");
        Ok(CacheSyncReport {
            items_updated,
            total_cached,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{remote_item, MockBackend};
    use crate::db;
    use chrono::Duration as ChronoDuration;
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

    const TTL: Duration = Duration::from_secs(5 * 60);

    #[test]
    fn test_upsert_overwrites_existing_rows() {
        let db = test_db();
        let items = vec![remote_item("item-1", Some("111"), Some("SKU-1"), 10)];
        upsert_items(&db, &scope(), &items, Utc::now()).unwrap();

        let refreshed = vec![remote_item("item-1", Some("111"), Some("SKU-1"), 25)];
        upsert_items(&db, &scope(), &refreshed, Utc::now()).unwrap();

        assert_eq!(item_count(&db, &scope()).unwrap(), 1);
        let item = lookup_by_id(&db, &scope(), "item-1").unwrap().unwrap();
        assert_eq!(item.quantity, 25);
    }

    #[test]
    fn test_lookup_first_match_wins_for_duplicate_barcodes() {
        let db = test_db();
        let items = vec![
            remote_item("item-b", Some("555"), None, 2),
            remote_item("item-a", Some("555"), None, 1),
        ];
        upsert_items(&db, &scope(), &items, Utc::now()).unwrap();

        let found = lookup_by_barcode(&db, &scope(), "555").unwrap().unwrap();
        assert_eq!(found.id, "item-a");
    }

    #[test]
    fn test_lookup_by_sku_and_missing_codes() {
        let db = test_db();
        let items = vec![remote_item("item-1", Some("111"), Some("SKU-1"), 4)];
        upsert_items(&db, &scope(), &items, Utc::now()).unwrap();

        assert!(lookup_by_sku(&db, &scope(), "SKU-1").unwrap().is_some());
        assert!(lookup_by_sku(&db, &scope(), "SKU-404").unwrap().is_none());
        assert!(lookup_by_barcode(&db, &scope(), "999").unwrap().is_none());
    }

    #[test]
    fn test_lookups_are_scoped() {
        let db = test_db();
        let items = vec![remote_item("item-1", Some("111"), None, 4)];
        upsert_items(&db, &scope(), &items, Utc::now()).unwrap();

        let other = SyncScope::new("tenant-2", "user-7");
        assert!(lookup_by_barcode(&db, &other, "111").unwrap().is_none());
    }

    #[test]
    fn test_update_cached_quantity() {
        let db = test_db();
        let items = vec![remote_item("item-1", None, None, 10)];
        upsert_items(&db, &scope(), &items, Utc::now()).unwrap();

        assert!(update_cached_quantity(&db, &scope(), "item-1", 7).unwrap());
        let item = lookup_by_id(&db, &scope(), "item-1").unwrap().unwrap();
        assert_eq!(item.quantity, 7);

        assert!(!update_cached_quantity(&db, &scope(), "missing", 3).unwrap());
    }

    #[test]
    fn test_staleness_boundary() {
        let db = test_db();

        // Never synced: stale
        assert!(is_cache_stale(&db, &scope(), TTL));

        // Fresh sync: not stale
        {
            let conn = db.conn.lock().unwrap();
            db::set_metadata_time(&conn, &scope(), META_LAST_CACHE_SYNC, Utc::now()).unwrap();
        }
        assert!(!is_cache_stale(&db, &scope(), TTL));

        // Sync older than the TTL: stale again
        {
            let conn = db.conn.lock().unwrap();
            let old = Utc::now() - ChronoDuration::minutes(10);
            db::set_metadata_time(&conn, &scope(), META_LAST_CACHE_SYNC, old).unwrap();
        }
        assert!(is_cache_stale(&db, &scope(), TTL));
    }

    #[tokio::test]
    async fn test_sync_item_cache_pages_through_catalog() {
        let db = test_db();
        let backend = Arc::new(MockBackend::online());
        {
            let mut catalog = backend.catalog.lock().unwrap();
            for n in 0..5 {
                catalog.push(remote_item(&format!("item-{n}"), None, None, n));
            }
        }

        let synchronizer = CacheSynchronizer::new(Arc::new(db), backend, 2);
        let report = synchronizer
            .sync_item_cache(&scope())
            .await
            .unwrap()
            .expect("sync should run");

        assert_eq!(report.items_updated, 5);
        assert_eq!(report.total_cached, 5);
        assert!(!is_cache_stale(&synchronizer.db, &scope(), TTL));

        let stats = cache_stats(&synchronizer.db, &scope(), TTL).unwrap();
        assert_eq!(stats.item_count, 5);
        assert!(stats.last_sync.is_some());
        assert!(!stats.is_stale);
    }

    #[tokio::test]
    async fn test_sync_item_cache_skips_when_already_in_flight() {
        let db = test_db();
        let backend = Arc::new(MockBackend::online());
        let synchronizer = CacheSynchronizer::new(Arc::new(db), backend, 2);

        synchronizer.in_flight.store(true, Ordering::SeqCst);
        let result = synchronizer.sync_item_cache(&scope()).await.unwrap();
        assert!(result.is_none(), "overlapping sync must be skipped");
    }

    #[tokio::test]
    async fn test_sync_item_cache_propagates_transport_failure() {
        let db = test_db();
        let backend = Arc::new(MockBackend::offline());
        let synchronizer = CacheSynchronizer::new(Arc::new(db), backend, 2);

        let err = synchronizer.sync_item_cache(&scope()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        // Failed pass never moves the sync marker
        assert!(is_cache_stale(&synchronizer.db, &scope(), TTL));
    }
}
