//! SQLite-backed persistence.
//!
//! One connection behind a `parking_lot::Mutex`, WAL mode on disk, schema
//! applied idempotently at open. Reads are cheap; every check-then-write
//! sequence runs inside a single transaction so concurrent approvers resolve
//! with one winner and one rejection. Per-snapshot write mutexes serialize
//! the heavier write paths (ingestion, matching passes, lock transitions).

pub mod canonical;
pub mod lineage;
pub mod schema;

use crate::error::{DomainError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub struct Store {
    conn: Arc<Mutex<Connection>>,
    snapshot_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| DomainError::Infrastructure(format!("open {path}: {e}")))?;
        Self::init(conn, path)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| DomainError::Infrastructure(e.to_string()))?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, path: &str) -> Result<Self> {
        // WAL is unavailable for in-memory databases; ignore the refusal.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        info!(path, "store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            snapshot_locks: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Mutex serializing write paths for one snapshot. Readers never take it.
    pub fn snapshot_write_lock(&self, snapshot_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.snapshot_locks.lock();
        locks
            .entry(snapshot_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` inside one transaction; rolls back on error.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

// =============================================================================
// SQL VALUE HELPERS
// =============================================================================

pub(crate) fn date_to_sql(d: Option<NaiveDate>) -> Option<String> {
    d.map(|d| d.format("%Y-%m-%d").to_string())
}

pub(crate) fn date_from_sql(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

pub(crate) fn ts_to_sql(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

pub(crate) fn ts_from_sql(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_applies_schema() {
        let store = Store::open_in_memory().unwrap();
        let count: i64 = store
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='snapshots'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_snapshot_lock_is_shared_per_id() {
        let store = Store::open_in_memory().unwrap();
        let a = store.snapshot_write_lock(1);
        let b = store.snapshot_write_lock(1);
        let c = store.snapshot_write_lock(2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_date_round_trip() {
        let d = NaiveDate::from_ymd_opt(2026, 1, 15);
        assert_eq!(date_from_sql(date_to_sql(d)), d);
        assert_eq!(date_from_sql(None), None);
    }
}
