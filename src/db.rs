//! Local SQLite store for the sync engine.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, scoped sync
//! metadata helpers, and the shared connection state used by every
//! component. All rows are scoped by (tenant_id, user_id) so that two
//! accounts on a shared device never see each other's cache or queue.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::SyncScope;
use crate::error::SyncError;

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Metadata key: last successful catalog refresh for a scope.
pub const META_LAST_CACHE_SYNC: &str = "last_cache_sync";
/// Metadata key: last drain that completed at least one change.
pub const META_LAST_SUCCESSFUL_SYNC: &str = "last_successful_sync";

/// Initialize the database at `{data_dir}/fieldstock.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, SyncError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Storage(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("fieldstock.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| SyncError::Storage(format!("database open failed after retry: {e}")))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, SyncError> {
    let conn = Connection::open(path).map_err(|e| SyncError::Storage(format!("sqlite open: {e}")))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| SyncError::Storage(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), SyncError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| SyncError::Storage(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: item cache, outbox, and sync metadata.
fn migrate_v1(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        -- cached_items (offline catalog projection)
        CREATE TABLE IF NOT EXISTS cached_items (
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            barcode TEXT,
            sku TEXT,
            name TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 0,
            min_quantity INTEGER,
            price REAL,
            last_synced_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, user_id, id)
        );

        -- pending_changes (append-only outbox)
        CREATE TABLE IF NOT EXISTS pending_changes (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            change_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            synced_at TEXT
        );

        -- sync_metadata (scoped key/value store)
        CREATE TABLE IF NOT EXISTS sync_metadata (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            meta_key TEXT NOT NULL,
            meta_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(tenant_id, user_id, meta_key)
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_cached_items_barcode
            ON cached_items(tenant_id, user_id, barcode);
        CREATE INDEX IF NOT EXISTS idx_cached_items_sku
            ON cached_items(tenant_id, user_id, sku);
        CREATE INDEX IF NOT EXISTS idx_pending_changes_scope_status
            ON pending_changes(tenant_id, user_id, status);
        CREATE INDEX IF NOT EXISTS idx_pending_changes_created_at
            ON pending_changes(created_at);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::Storage(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: stock counting session tables.
fn migrate_v2(conn: &Connection) -> Result<(), SyncError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS stock_count_sessions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            stock_count_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(tenant_id, user_id, stock_count_id)
        );

        CREATE TABLE IF NOT EXISTS stock_count_items (
            id TEXT NOT NULL,
            tenant_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            stock_count_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            item_name TEXT,
            item_sku TEXT,
            expected_quantity INTEGER NOT NULL DEFAULT 0,
            counted_quantity INTEGER,
            variance INTEGER,
            status TEXT NOT NULL DEFAULT 'pending',
            synced INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tenant_id, user_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_stock_count_items_count
            ON stock_count_items(tenant_id, user_id, stock_count_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::Storage(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: image/folder columns on cached_items (thumbnail display and
/// folder filtering in the scanning UI).
fn migrate_v3(conn: &Connection) -> Result<(), SyncError> {
    if !column_exists(conn, "cached_items", "image_url")? {
        conn.execute_batch("ALTER TABLE cached_items ADD COLUMN image_url TEXT;")
            .map_err(|e| SyncError::Storage(format!("migration v3 (image_url): {e}")))?;
    }
    if !column_exists(conn, "cached_items", "folder_name")? {
        conn.execute_batch("ALTER TABLE cached_items ADD COLUMN folder_name TEXT;")
            .map_err(|e| SyncError::Storage(format!("migration v3 (folder_name): {e}")))?;
    }

    conn.execute_batch("INSERT INTO schema_version (version) VALUES (3);")
        .map_err(|e| SyncError::Storage(format!("migration v3: {e}")))?;

    info!("Applied migration v3");
    Ok(())
}

/// Check whether a column exists on a table.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, SyncError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| SyncError::Storage(format!("table_info({table}): {e}")))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| SyncError::Storage(format!("table_info({table}): {e}")))?;
    for name in names.flatten() {
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Serialize a timestamp the way every table stores them: RFC 3339 with
/// millisecond precision, UTC. Millisecond precision keeps FIFO ordering
/// stable for rapid successive queue appends.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp. Returns `None` for legacy or malformed values.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Sync metadata helpers
// ---------------------------------------------------------------------------

/// Get a single metadata value for a scope.
pub fn get_metadata(conn: &Connection, scope: &SyncScope, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT meta_value FROM sync_metadata
         WHERE tenant_id = ?1 AND user_id = ?2 AND meta_key = ?3",
        params![scope.tenant_id, scope.user_id, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a metadata value for a scope.
pub fn set_metadata(
    conn: &Connection,
    scope: &SyncScope,
    key: &str,
    value: &str,
) -> Result<(), SyncError> {
    conn.execute(
        "INSERT INTO sync_metadata (tenant_id, user_id, meta_key, meta_value, updated_at)
         VALUES (?1, ?2, ?3, ?4, datetime('now'))
         ON CONFLICT(tenant_id, user_id, meta_key) DO UPDATE SET
            meta_value = excluded.meta_value,
            updated_at = excluded.updated_at",
        params![scope.tenant_id, scope.user_id, key, value],
    )
    .map_err(|e| SyncError::Storage(format!("set_metadata: {e}")))?;
    Ok(())
}

/// Get a metadata value parsed as a timestamp.
pub fn get_metadata_time(
    conn: &Connection,
    scope: &SyncScope,
    key: &str,
) -> Option<DateTime<Utc>> {
    get_metadata(conn, scope, key).and_then(|raw| parse_timestamp(&raw))
}

/// Store a timestamp metadata value.
pub fn set_metadata_time(
    conn: &Connection,
    scope: &SyncScope,
    key: &str,
    ts: DateTime<Utc>,
) -> Result<(), SyncError> {
    set_metadata(conn, scope, key, &format_timestamp(ts))
}

/// Delete every row belonging to a scope: cache, outbox, metadata, and
/// counting sessions. Used when a tenant/user mismatch is detected on a
/// shared device.
pub fn clear_scope(conn: &Connection, scope: &SyncScope) -> Result<(), SyncError> {
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| SyncError::Storage(format!("clear_scope begin: {e}")))?;
    let tables = [
        "cached_items",
        "pending_changes",
        "stock_count_items",
        "stock_count_sessions",
        "sync_metadata",
    ];
    for table in tables {
        if let Err(e) = conn.execute(
            &format!("DELETE FROM {table} WHERE tenant_id = ?1 AND user_id = ?2"),
            params![scope.tenant_id, scope.user_id],
        ) {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(SyncError::Storage(format!("clear_scope ({table}): {e}")));
        }
    }
    conn.execute_batch("COMMIT;")
        .map_err(|e| SyncError::Storage(format!("clear_scope commit: {e}")))?;
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    fn scope() -> SyncScope {
        SyncScope::new("tenant-1", "user-1")
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_conn();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);

        assert!(
            tables.contains(&"cached_items".to_string()),
            "missing cached_items"
        );
        assert!(
            tables.contains(&"pending_changes".to_string()),
            "missing pending_changes"
        );
        assert!(
            tables.contains(&"sync_metadata".to_string()),
            "missing sync_metadata"
        );
        assert!(
            tables.contains(&"stock_count_sessions".to_string()),
            "missing stock_count_sessions"
        );
        assert!(
            tables.contains(&"stock_count_items".to_string()),
            "missing stock_count_items"
        );

        // v3 columns
        assert!(column_exists(&conn, "cached_items", "image_url").unwrap());
        assert!(column_exists(&conn, "cached_items", "folder_name").unwrap());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_conn();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should be a no-op");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_metadata_roundtrip_and_upsert() {
        let conn = test_conn();
        run_migrations_for_test(&conn);

        assert_eq!(get_metadata(&conn, &scope(), "k"), None);

        set_metadata(&conn, &scope(), "k", "v1").unwrap();
        assert_eq!(get_metadata(&conn, &scope(), "k").as_deref(), Some("v1"));

        set_metadata(&conn, &scope(), "k", "v2").unwrap();
        assert_eq!(get_metadata(&conn, &scope(), "k").as_deref(), Some("v2"));

        // Scoping: a different user never sees the value
        let other = SyncScope::new("tenant-1", "user-2");
        assert_eq!(get_metadata(&conn, &other, "k"), None);
    }

    #[test]
    fn test_metadata_time_roundtrip() {
        let conn = test_conn();
        run_migrations_for_test(&conn);

        let ts = Utc::now();
        set_metadata_time(&conn, &scope(), META_LAST_CACHE_SYNC, ts).unwrap();
        let read = get_metadata_time(&conn, &scope(), META_LAST_CACHE_SYNC).unwrap();
        // Millisecond precision survives the roundtrip
        assert_eq!(read.timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_clear_scope_removes_only_that_scope() {
        let conn = test_conn();
        run_migrations_for_test(&conn);

        set_metadata(&conn, &scope(), "k", "v").unwrap();
        let other = SyncScope::new("tenant-2", "user-9");
        set_metadata(&conn, &other, "k", "kept").unwrap();

        clear_scope(&conn, &scope()).unwrap();

        assert_eq!(get_metadata(&conn, &scope(), "k"), None);
        assert_eq!(get_metadata(&conn, &other, "k").as_deref(), Some("kept"));
    }

    #[test]
    fn test_timestamp_parse_rejects_garbage() {
        assert!(parse_timestamp("not-a-date").is_none());
        let now = Utc::now();
        assert_eq!(
            parse_timestamp(&format_timestamp(now)).unwrap().timestamp_millis(),
            now.timestamp_millis()
        );
    }
}
