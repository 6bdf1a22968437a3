//! Lineage store: connections, sync runs, datasets, raw and canonical
//! records, schema drift events and evidence refs. Every canonical record
//! traces back to the raw source bytes it came from.

use super::{date_from_sql, date_to_sql, ts_from_sql, ts_to_sql, Store};
use crate::connectors::{CanonicalRow, ColumnSpec, NormalizeError, RawRow};
use crate::error::{DomainError, Result};
use crate::store::canonical::is_unique_violation;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Error,
    PendingSetup,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Inactive => "INACTIVE",
            ConnectionStatus::Error => "ERROR",
            ConnectionStatus::PendingSetup => "PENDING_SETUP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ConnectionStatus::Active),
            "INACTIVE" => Some(ConnectionStatus::Inactive),
            "ERROR" => Some(ConnectionStatus::Error),
            "PENDING_SETUP" => Some(ConnectionStatus::PendingSetup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Running,
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Running => "RUNNING",
            SyncStatus::Success => "SUCCESS",
            SyncStatus::Partial => "PARTIAL",
            SyncStatus::Failed => "FAILED",
            SyncStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SyncStatus::Pending),
            "RUNNING" => Some(SyncStatus::Running),
            "SUCCESS" => Some(SyncStatus::Success),
            "PARTIAL" => Some(SyncStatus::Partial),
            "FAILED" => Some(SyncStatus::Failed),
            "CANCELLED" => Some(SyncStatus::Cancelled),
            _ => None,
        }
    }
}

/// External-source configuration. Secrets never live here — only an opaque
/// reference resolved outside this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageConnection {
    pub id: i64,
    pub entity_id: Option<i64>,
    pub connector_type: String,
    pub name: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub secret_ref: Option<String>,
    pub status: ConnectionStatus,
    pub status_message: Option<String>,
    pub last_test_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Row-level issue captured during a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncIssue {
    pub row_idx: usize,
    pub issue_type: String,
    pub message: String,
    pub source_row_id: Option<String>,
}

/// Audit record of one extract cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub connection_id: i64,
    pub status: SyncStatus,
    pub triggered_by: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_extracted: i64,
    pub rows_normalized: i64,
    pub rows_loaded: i64,
    pub rows_skipped: i64,
    pub rows_error: i64,
    pub errors: Vec<SyncIssue>,
    pub warnings: Vec<SyncIssue>,
}

/// Versioned output of one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    /// Opaque identifier handed to downstream consumers.
    pub dataset_uid: String,
    pub entity_id: Option<i64>,
    pub sync_run_id: i64,
    pub source_type: String,
    pub schema_fingerprint: Option<String>,
    pub schema_columns: Vec<ColumnSpec>,
    pub row_count: i64,
    pub amount_total: f64,
    pub date_range_start: Option<NaiveDate>,
    pub date_range_end: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Normalized form of one raw record, unique per (dataset, canonical_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: i64,
    pub dataset_id: i64,
    pub raw_record_id: Option<i64>,
    pub record_type: String,
    pub canonical_id: String,
    pub payload: serde_json::Value,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub record_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub counterparty: Option<String>,
    pub external_id: Option<String>,
}

/// Detected schema change between consecutive datasets of one connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDriftEvent {
    pub id: i64,
    pub connection_id: i64,
    pub old_dataset_id: Option<i64>,
    pub new_dataset_id: Option<i64>,
    pub old_fingerprint: Option<String>,
    pub new_fingerprint: Option<String>,
    pub added_columns: Vec<ColumnSpec>,
    pub removed_columns: Vec<ColumnSpec>,
    pub type_changes: Vec<TypeChange>,
    pub severity: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeChange {
    pub name: String,
    pub old_type: String,
    pub new_type: String,
}

/// Outcome of loading one batch of extracted rows.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub loaded: i64,
    pub skipped: i64,
    pub errors: i64,
    pub normalized: i64,
    pub error_issues: Vec<SyncIssue>,
    pub warning_issues: Vec<SyncIssue>,
    pub amount_sum: f64,
    pub min_date: Option<NaiveDate>,
    pub max_date: Option<NaiveDate>,
}

// =============================================================================
// ROW MAPPERS
// =============================================================================

fn connection_from_row(row: &Row<'_>) -> rusqlite::Result<LineageConnection> {
    let status: String = row.get("status")?;
    let config_json: String = row.get("config_json")?;
    Ok(LineageConnection {
        id: row.get("id")?,
        entity_id: row.get("entity_id")?,
        connector_type: row.get("type")?,
        name: row.get("name")?,
        description: row.get("description")?,
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        secret_ref: row.get("secret_ref")?,
        status: ConnectionStatus::parse(&status).unwrap_or(ConnectionStatus::PendingSetup),
        status_message: row.get("status_message")?,
        last_test_at: ts_from_sql(row.get("last_test_at")?),
        last_sync_at: ts_from_sql(row.get("last_sync_at")?),
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn sync_run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let status: String = row.get("status")?;
    let errors_json: Option<String> = row.get("errors_json")?;
    let warnings_json: Option<String> = row.get("warnings_json")?;
    Ok(SyncRun {
        id: row.get("id")?,
        connection_id: row.get("connection_id")?,
        status: SyncStatus::parse(&status).unwrap_or(SyncStatus::Pending),
        triggered_by: row.get("triggered_by")?,
        started_at: ts_from_sql(row.get("started_at")?),
        finished_at: ts_from_sql(row.get("finished_at")?),
        rows_extracted: row.get("rows_extracted")?,
        rows_normalized: row.get("rows_normalized")?,
        rows_loaded: row.get("rows_loaded")?,
        rows_skipped: row.get("rows_skipped")?,
        rows_error: row.get("rows_error")?,
        errors: errors_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        warnings: warnings_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
    })
}

fn dataset_from_row(row: &Row<'_>) -> rusqlite::Result<Dataset> {
    let columns_json: Option<String> = row.get("schema_columns_json")?;
    Ok(Dataset {
        id: row.get("id")?,
        dataset_uid: row.get("dataset_uid")?,
        entity_id: row.get("entity_id")?,
        sync_run_id: row.get("sync_run_id")?,
        source_type: row.get("source_type")?,
        schema_fingerprint: row.get("schema_fingerprint")?,
        schema_columns: columns_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        row_count: row.get("row_count")?,
        amount_total: row.get("amount_total")?,
        date_range_start: date_from_sql(row.get("date_range_start")?),
        date_range_end: date_from_sql(row.get("date_range_end")?),
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn canonical_record_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalRecord> {
    let payload_json: String = row.get("payload_json")?;
    Ok(CanonicalRecord {
        id: row.get("id")?,
        dataset_id: row.get("dataset_id")?,
        raw_record_id: row.get("raw_record_id")?,
        record_type: row.get("record_type")?,
        canonical_id: row.get("canonical_id")?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        record_date: date_from_sql(row.get("record_date")?),
        due_date: date_from_sql(row.get("due_date")?),
        counterparty: row.get("counterparty")?,
        external_id: row.get("external_id")?,
    })
}

fn drift_from_row(row: &Row<'_>) -> rusqlite::Result<SchemaDriftEvent> {
    let added: Option<String> = row.get("added_columns_json")?;
    let removed: Option<String> = row.get("removed_columns_json")?;
    let changed: Option<String> = row.get("type_changes_json")?;
    Ok(SchemaDriftEvent {
        id: row.get("id")?,
        connection_id: row.get("connection_id")?,
        old_dataset_id: row.get("old_dataset_id")?,
        new_dataset_id: row.get("new_dataset_id")?,
        old_fingerprint: row.get("old_fingerprint")?,
        new_fingerprint: row.get("new_fingerprint")?,
        added_columns: added
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        removed_columns: removed
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        type_changes: changed
            .and_then(|j| serde_json::from_str(&j).ok())
            .unwrap_or_default(),
        severity: row.get("severity")?,
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

// =============================================================================
// CONNECTIONS
// =============================================================================

impl Store {
    pub fn create_connection(
        &self,
        entity_id: Option<i64>,
        connector_type: &str,
        name: &str,
        config: &serde_json::Value,
        secret_ref: Option<&str>,
        description: Option<&str>,
    ) -> Result<LineageConnection> {
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO connections
                   (entity_id, type, name, description, config_json, secret_ref, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'PENDING_SETUP', ?7)",
                params![
                    entity_id,
                    connector_type,
                    name,
                    description,
                    serde_json::to_string(config)?,
                    secret_ref,
                    ts_to_sql(Utc::now()),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_connection(id)
    }

    pub fn get_connection(&self, id: i64) -> Result<LineageConnection> {
        self.conn()
            .query_row("SELECT * FROM connections WHERE id = ?1", [id], connection_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Connection {id}")))
    }

    pub fn list_connections(&self, entity_id: Option<i64>) -> Result<Vec<LineageConnection>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM connections WHERE (?1 IS NULL OR entity_id = ?1) ORDER BY id",
        )?;
        let rows = stmt
            .query_map([entity_id], connection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_connection_status(
        &self,
        id: i64,
        status: ConnectionStatus,
        message: Option<&str>,
        tested: bool,
    ) -> Result<()> {
        let tested_at = tested.then(|| ts_to_sql(Utc::now()));
        self.conn().execute(
            "UPDATE connections
             SET status = ?2, status_message = ?3, last_test_at = COALESCE(?4, last_test_at)
             WHERE id = ?1",
            params![id, status.as_str(), message, tested_at],
        )?;
        Ok(())
    }

    pub fn touch_connection_synced(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE connections SET last_sync_at = ?2 WHERE id = ?1",
            params![id, ts_to_sql(Utc::now())],
        )?;
        Ok(())
    }
}

// =============================================================================
// SYNC RUNS & DATASETS
// =============================================================================

impl Store {
    pub fn create_sync_run(&self, connection_id: i64, triggered_by: &str) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sync_runs (connection_id, status, triggered_by, created_at)
             VALUES (?1, 'PENDING', ?2, ?3)",
            params![connection_id, triggered_by, ts_to_sql(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_sync_run(&self, id: i64) -> Result<SyncRun> {
        self.conn()
            .query_row("SELECT * FROM sync_runs WHERE id = ?1", [id], sync_run_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("SyncRun {id}")))
    }

    pub fn list_sync_runs(&self, connection_id: i64, limit: i64) -> Result<Vec<SyncRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM sync_runs WHERE connection_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![connection_id, limit], sync_run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_sync_running(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE sync_runs SET status = 'RUNNING', started_at = ?2 WHERE id = ?1",
            params![id, ts_to_sql(Utc::now())],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize_sync_run(
        &self,
        id: i64,
        status: SyncStatus,
        rows_extracted: i64,
        rows_normalized: i64,
        rows_loaded: i64,
        rows_skipped: i64,
        rows_error: i64,
        errors: &[SyncIssue],
        warnings: &[SyncIssue],
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE sync_runs
             SET status = ?2, finished_at = ?3,
                 rows_extracted = ?4, rows_normalized = ?5, rows_loaded = ?6,
                 rows_skipped = ?7, rows_error = ?8, errors_json = ?9, warnings_json = ?10
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                ts_to_sql(Utc::now()),
                rows_extracted,
                rows_normalized,
                rows_loaded,
                rows_skipped,
                rows_error,
                serde_json::to_string(errors)?,
                serde_json::to_string(warnings)?,
            ],
        )?;
        Ok(())
    }

    pub fn create_dataset(
        &self,
        entity_id: Option<i64>,
        sync_run_id: i64,
        source_type: &str,
        schema_fingerprint: Option<&str>,
        schema_columns: &[ColumnSpec],
    ) -> Result<Dataset> {
        let dataset_uid = uuid::Uuid::new_v4().to_string();
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO datasets
                   (dataset_uid, entity_id, sync_run_id, source_type,
                    schema_fingerprint, schema_columns_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    dataset_uid,
                    entity_id,
                    sync_run_id,
                    source_type,
                    schema_fingerprint,
                    serde_json::to_string(schema_columns)?,
                    ts_to_sql(Utc::now()),
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_dataset(id)
    }

    pub fn get_dataset(&self, id: i64) -> Result<Dataset> {
        self.conn()
            .query_row("SELECT * FROM datasets WHERE id = ?1", [id], dataset_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Dataset {id}")))
    }

    pub fn get_dataset_by_uid(&self, uid: &str) -> Result<Dataset> {
        self.conn()
            .query_row(
                "SELECT * FROM datasets WHERE dataset_uid = ?1",
                [uid],
                dataset_from_row,
            )
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Dataset {uid}")))
    }

    /// Most recent prior dataset for the same connection, for drift
    /// comparison.
    pub fn latest_prior_dataset(
        &self,
        connection_id: i64,
        exclude_dataset_id: i64,
    ) -> Result<Option<Dataset>> {
        let result = self
            .conn()
            .query_row(
                "SELECT d.* FROM datasets d
                 JOIN sync_runs r ON d.sync_run_id = r.id
                 WHERE r.connection_id = ?1 AND d.id != ?2
                 ORDER BY d.created_at DESC, d.id DESC
                 LIMIT 1",
                params![connection_id, exclude_dataset_id],
                dataset_from_row,
            )
            .optional()?;
        Ok(result)
    }

    pub fn update_dataset_aggregates(
        &self,
        id: i64,
        row_count: i64,
        amount_total: f64,
        date_range_start: Option<NaiveDate>,
        date_range_end: Option<NaiveDate>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE datasets
             SET row_count = ?2, amount_total = ?3, date_range_start = ?4, date_range_end = ?5
             WHERE id = ?1",
            params![
                id,
                row_count,
                amount_total,
                date_to_sql(date_range_start),
                date_to_sql(date_range_end),
            ],
        )?;
        Ok(())
    }
}

// =============================================================================
// RAW / CANONICAL RECORD LOADING
// =============================================================================

impl Store {
    /// Load one batch of extracted rows in a single transaction.
    ///
    /// Every raw row is persisted; canonical rows deduplicate on
    /// `(dataset_id, canonical_id)` — a duplicate counts as skipped, never
    /// as loaded, and the raw record keeps a duplicate marker.
    pub fn ingest_batch(
        &self,
        dataset_id: i64,
        items: &[(RawRow, std::result::Result<CanonicalRow, NormalizeError>)],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        self.with_tx(|tx| {
            for (raw, normalized) in items {
                tx.execute(
                    "INSERT INTO raw_records
                       (dataset_id, source_table, source_row_id, payload_json, raw_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        dataset_id,
                        raw.source_table,
                        raw.source_row_id,
                        serde_json::to_string(&raw.payload)?,
                        raw.raw_hash,
                        ts_to_sql(Utc::now()),
                    ],
                )?;
                let raw_id = tx.last_insert_rowid();

                match normalized {
                    Ok(row) => {
                        outcome.normalized += 1;
                        let inserted = tx.execute(
                            "INSERT INTO canonical_records
                               (dataset_id, raw_record_id, record_type, canonical_id, payload_json,
                                amount, currency, record_date, due_date, counterparty, external_id,
                                created_at)
                             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                            params![
                                dataset_id,
                                raw_id,
                                row.record_type.as_str(),
                                row.canonical_id,
                                serde_json::to_string(&row.payload)?,
                                row.amount,
                                row.currency,
                                date_to_sql(row.record_date),
                                date_to_sql(row.due_date),
                                row.counterparty,
                                row.external_id,
                                ts_to_sql(Utc::now()),
                            ],
                        );
                        match inserted {
                            Ok(_) => {
                                outcome.loaded += 1;
                                if let Some(amount) = row.amount {
                                    outcome.amount_sum += amount;
                                }
                                if let Some(date) = row.record_date {
                                    outcome.min_date =
                                        Some(outcome.min_date.map_or(date, |d| d.min(date)));
                                    outcome.max_date =
                                        Some(outcome.max_date.map_or(date, |d| d.max(date)));
                                }
                                tx.execute(
                                    "UPDATE raw_records SET is_processed = 1 WHERE id = ?1",
                                    [raw_id],
                                )?;
                            }
                            Err(e) if is_unique_violation(&e) => {
                                outcome.skipped += 1;
                                outcome.warning_issues.push(SyncIssue {
                                    row_idx: raw.row_index,
                                    issue_type: "duplicate".to_string(),
                                    message: format!(
                                        "Duplicate canonical_id: {}",
                                        &row.canonical_id[..20.min(row.canonical_id.len())]
                                    ),
                                    source_row_id: Some(raw.source_row_id.clone()),
                                });
                                tx.execute(
                                    "UPDATE raw_records
                                     SET is_processed = 1,
                                         processing_error = 'Duplicate canonical_id (idempotency)'
                                     WHERE id = ?1",
                                    [raw_id],
                                )?;
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                    Err(err) => {
                        outcome.errors += 1;
                        outcome.error_issues.push(SyncIssue {
                            row_idx: err.row_index,
                            issue_type: err.error_type.clone(),
                            message: err.message.clone(),
                            source_row_id: Some(err.source_row_id.clone()),
                        });
                        tx.execute(
                            "UPDATE raw_records SET processing_error = ?2 WHERE id = ?1",
                            params![raw_id, err.message],
                        )?;
                    }
                }
            }
            Ok(())
        })?;
        Ok(outcome)
    }

    pub fn list_canonical_records(
        &self,
        dataset_id: i64,
        record_type: Option<&str>,
    ) -> Result<Vec<CanonicalRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM canonical_records
             WHERE dataset_id = ?1 AND (?2 IS NULL OR record_type = ?2)
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![dataset_id, record_type], canonical_record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_canonical_records(&self, dataset_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM canonical_records WHERE dataset_id = ?1",
            [dataset_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// =============================================================================
// SCHEMA DRIFT & EVIDENCE
// =============================================================================

impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn insert_drift_event(
        &self,
        connection_id: i64,
        old_dataset_id: Option<i64>,
        new_dataset_id: Option<i64>,
        old_fingerprint: Option<&str>,
        new_fingerprint: Option<&str>,
        added: &[ColumnSpec],
        removed: &[ColumnSpec],
        type_changes: &[TypeChange],
        severity: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO schema_drift_events
               (connection_id, old_dataset_id, new_dataset_id, old_fingerprint, new_fingerprint,
                added_columns_json, removed_columns_json, type_changes_json, severity, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                connection_id,
                old_dataset_id,
                new_dataset_id,
                old_fingerprint,
                new_fingerprint,
                serde_json::to_string(added)?,
                serde_json::to_string(removed)?,
                serde_json::to_string(type_changes)?,
                severity,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_drift_events(&self, connection_id: i64) -> Result<Vec<SchemaDriftEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM schema_drift_events WHERE connection_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([connection_id], drift_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_drift_events(&self, connection_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM schema_drift_events WHERE connection_id = ?1",
            [connection_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn insert_evidence_ref(
        &self,
        kind: &str,
        ref_id: &str,
        context_type: Option<&str>,
        context_id: Option<i64>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO evidence_refs (kind, ref_id, context_type, context_id, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                kind,
                ref_id,
                context_type,
                context_id,
                metadata.map(|m| m.to_string()),
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}
