//! Fieldstock — offline-first inventory sync engine.
//!
//! Lets field users keep scanning, adjusting quantities, and counting
//! inventory while connectivity is intermittent, then reconciles everything
//! with the remote dashboard once it returns. The moving parts:
//!
//! - [`connectivity`] — one liveness-probing monitor for any number of
//!   consumers, edge-triggered events only.
//! - [`db`] — SQLite (WAL) store scoped by (tenant, user): cached items,
//!   the outbox, sync metadata, counting sessions.
//! - [`cache`] — local catalog projection for barcode/SKU lookups.
//! - [`outbox`] — append-only queue of pending mutations with a strictly
//!   sequential drain.
//! - [`engine`] — the facade: optimistic updates, debounced drains,
//!   reconnect reactions, aggregated status.
//! - [`stock_count`] — offline-first counting sessions with
//!   unsynced-local-wins reconciliation.
//!
//! Composition root wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! use fieldstock::{
//!     EngineConfig, HttpBackend, RemoteConfig, SyncEngine, SyncScope,
//! };
//!
//! # fn main() -> Result<(), fieldstock::SyncError> {
//! let config = EngineConfig::default();
//! let remote = RemoteConfig::new("dashboard.fieldstock.app", "fsk_12345");
//! let backend = Arc::new(HttpBackend::new(&remote, config.liveness_timeout)?);
//! let db = Arc::new(fieldstock::db::init(std::path::Path::new("./data"))?);
//!
//! let engine = SyncEngine::new(
//!     db,
//!     backend,
//!     SyncScope::new("tenant-1", "user-1"),
//!     config,
//! )?;
//! engine.start();
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod outbox;
pub mod stock_count;

pub use api::{CatalogPage, HttpBackend, RemoteBackend, RemoteItem, RemoteOutcome};
pub use cache::{CacheStats, CacheSyncReport, CacheSynchronizer, CachedItem};
pub use config::{EngineConfig, RemoteConfig, SyncScope};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, ConnectivitySubscription};
pub use db::DbState;
pub use engine::{SyncEngine, SyncStatus};
pub use error::SyncError;
pub use outbox::{
    ChangePayload, ChangeStatus, ChangeType, CheckinPayload, CheckoutPayload, DrainReport,
    PendingChange, QuantityAdjustPayload, StockCountRecordPayload,
};
pub use stock_count::{
    CountProgress, CountStatus, ServerCountItem, StockCountItem, StockCountTracker,
};

/// Initialize structured logging (console, plus a daily-rolling file when a
/// log directory is given).
///
/// Returns the appender guard; hold it for the lifetime of the process —
/// dropping it flushes buffered log lines.
pub fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fieldstock=debug"));

    let console_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "fieldstock");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            registry.with(file_layer).init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    };

    info!("Fieldstock sync engine v{}", env!("CARGO_PKG_VERSION"));
    guard
}
