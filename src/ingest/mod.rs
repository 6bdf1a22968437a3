//! Sync orchestrator.
//!
//! Runs a connector's extract -> normalize -> load cycle inside a SyncRun,
//! emits a Dataset, detects schema drift against the previous dataset of the
//! same connection, and commits in batches. One sync per connection at a
//! time, enforced by the running-syncs map. Cancellation is cooperative at
//! batch commit boundaries; a cancelled run keeps its partial Dataset.

pub mod drift;

use crate::connectors::{Connector, ConnectorRegistry, ExtractOptions, RawRow, RecordType};
use crate::error::{DomainError, Result};
use crate::store::canonical::{NewBankTransaction, NewInvoice, NewVendorBill};
use crate::store::lineage::{Dataset, SyncIssue, SyncStatus};
use crate::store::Store;
use crate::workflow::assert_snapshot_not_locked;
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Cooperative cancellation flag shared with a running sync.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct SyncHandle {
    cancel: CancelFlag,
}

/// Final accounting of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub sync_run_id: i64,
    pub dataset_id: i64,
    pub dataset_uid: String,
    pub status: SyncStatus,
    pub rows_extracted: i64,
    pub rows_normalized: i64,
    pub rows_loaded: i64,
    pub rows_skipped: i64,
    pub rows_error: i64,
}

pub struct SyncOrchestrator {
    store: Arc<Store>,
    registry: Arc<ConnectorRegistry>,
    running: Mutex<HashMap<i64, SyncHandle>>,
    batch_size: usize,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<Store>, registry: Arc<ConnectorRegistry>, batch_size: usize) -> Self {
        Self {
            store,
            registry,
            running: Mutex::new(HashMap::new()),
            batch_size: batch_size.max(1),
        }
    }

    /// Probe a connection and record the outcome on the connection row.
    pub fn test_connection(&self, connection_id: i64) -> Result<crate::connectors::TestReport> {
        use crate::store::lineage::ConnectionStatus;

        let connection = self.store.get_connection(connection_id)?;
        let connector = match self.registry.create(
            &connection.connector_type,
            &connection.config,
            connection.entity_id,
        ) {
            Ok(c) => c,
            Err(e) => {
                self.store.update_connection_status(
                    connection_id,
                    ConnectionStatus::Error,
                    Some(&e.to_string()),
                    true,
                )?;
                return Err(e);
            }
        };

        let started = std::time::Instant::now();
        let mut report = connector.test();
        report.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);

        let status = if report.success {
            ConnectionStatus::Active
        } else {
            ConnectionStatus::Error
        };
        self.store
            .update_connection_status(connection_id, status, Some(&report.message), true)?;
        Ok(report)
    }

    /// Assess source data quality for a connection without persisting
    /// anything.
    pub fn connection_health(
        &self,
        connection_id: i64,
    ) -> Result<crate::connectors::health::HealthReport> {
        let connection = self.store.get_connection(connection_id)?;
        let connector = self.registry.create(
            &connection.connector_type,
            &connection.config,
            connection.entity_id,
        )?;
        crate::connectors::assess_health(&*connector, &ExtractOptions::default())
    }

    /// Run a sync to completion on the calling thread.
    ///
    /// Returns a `State` error when a sync is already running for the
    /// connection.
    pub fn run_sync(
        &self,
        connection_id: i64,
        triggered_by: &str,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
    ) -> Result<SyncOutcome> {
        let cancel = self.acquire_sync_slot(connection_id)?;
        let result = self.execute_sync(connection_id, triggered_by, since, until, &cancel);
        self.running.lock().remove(&connection_id);
        result
    }

    /// Request cancellation of an in-flight sync. Takes effect at the next
    /// batch commit boundary.
    pub fn cancel_sync(&self, connection_id: i64) -> bool {
        if let Some(handle) = self.running.lock().get(&connection_id) {
            handle.cancel.cancel();
            true
        } else {
            false
        }
    }

    fn acquire_sync_slot(&self, connection_id: i64) -> Result<CancelFlag> {
        let mut running = self.running.lock();
        if running.contains_key(&connection_id) {
            return Err(DomainError::State(format!(
                "Sync already in progress for connection {connection_id}"
            )));
        }
        let cancel = CancelFlag::new();
        running.insert(
            connection_id,
            SyncHandle {
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    fn execute_sync(
        &self,
        connection_id: i64,
        triggered_by: &str,
        since: Option<NaiveDate>,
        until: Option<NaiveDate>,
        cancel: &CancelFlag,
    ) -> Result<SyncOutcome> {
        let connection = self.store.get_connection(connection_id)?;
        let sync_run_id = self.store.create_sync_run(connection_id, triggered_by)?;
        self.store.mark_sync_running(sync_run_id)?;

        let connector = match self.registry.create(
            &connection.connector_type,
            &connection.config,
            connection.entity_id,
        ) {
            Ok(c) => c,
            Err(e) => {
                let issue = SyncIssue {
                    row_idx: 0,
                    issue_type: "connector".to_string(),
                    message: e.to_string(),
                    source_row_id: None,
                };
                self.store.finalize_sync_run(
                    sync_run_id,
                    SyncStatus::Failed,
                    0,
                    0,
                    0,
                    0,
                    0,
                    &[issue],
                    &[],
                )?;
                return Err(e);
            }
        };

        let schema = connector.get_schema()?;
        let dataset = self.store.create_dataset(
            connection.entity_id,
            sync_run_id,
            &connector.source_type(),
            Some(&schema.fingerprint),
            &schema.columns,
        )?;

        self.detect_drift(connection_id, &dataset, &schema)?;

        let opts = ExtractOptions {
            since,
            until,
            batch_size: self.batch_size,
        };
        let rows = connector.extract(&opts)?;

        let mut extracted: i64 = 0;
        let mut normalized: i64 = 0;
        let mut loaded: i64 = 0;
        let mut skipped: i64 = 0;
        let mut errored: i64 = 0;
        let mut errors: Vec<SyncIssue> = Vec::new();
        let mut warnings: Vec<SyncIssue> = Vec::new();
        let mut amount_total = 0.0;
        let mut min_date: Option<NaiveDate> = None;
        let mut max_date: Option<NaiveDate> = None;
        let mut cancelled = false;

        let mut batch: Vec<(RawRow, std::result::Result<_, _>)> = Vec::with_capacity(self.batch_size);
        for raw in rows {
            extracted += 1;
            let result = connector.normalize(&raw);
            batch.push((raw, result));

            if batch.len() >= self.batch_size {
                let outcome = self.store.ingest_batch(dataset.id, &batch)?;
                batch.clear();
                normalized += outcome.normalized;
                loaded += outcome.loaded;
                skipped += outcome.skipped;
                errored += outcome.errors;
                errors.extend(outcome.error_issues);
                warnings.extend(outcome.warning_issues);
                amount_total += outcome.amount_sum;
                min_date = merge_min(min_date, outcome.min_date);
                max_date = merge_max(max_date, outcome.max_date);

                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
            }
        }
        if !cancelled && !batch.is_empty() {
            let outcome = self.store.ingest_batch(dataset.id, &batch)?;
            normalized += outcome.normalized;
            loaded += outcome.loaded;
            skipped += outcome.skipped;
            errored += outcome.errors;
            errors.extend(outcome.error_issues);
            warnings.extend(outcome.warning_issues);
            amount_total += outcome.amount_sum;
            min_date = merge_min(min_date, outcome.min_date);
            max_date = merge_max(max_date, outcome.max_date);
        }

        let status = if cancelled {
            SyncStatus::Cancelled
        } else if errored == 0 {
            SyncStatus::Success
        } else if loaded > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Failed
        };

        self.store.finalize_sync_run(
            sync_run_id,
            status,
            extracted,
            normalized,
            loaded,
            skipped,
            errored,
            &errors,
            &warnings,
        )?;
        self.store
            .update_dataset_aggregates(dataset.id, loaded, amount_total, min_date, max_date)?;
        self.store.touch_connection_synced(connection_id)?;

        info!(
            connection_id,
            sync_run_id,
            status = status.as_str(),
            extracted,
            loaded,
            skipped,
            errors = errored,
            "sync finished"
        );

        Ok(SyncOutcome {
            sync_run_id,
            dataset_id: dataset.id,
            dataset_uid: dataset.dataset_uid,
            status,
            rows_extracted: extracted,
            rows_normalized: normalized,
            rows_loaded: loaded,
            rows_skipped: skipped,
            rows_error: errored,
        })
    }

    fn detect_drift(
        &self,
        connection_id: i64,
        new_dataset: &Dataset,
        new_schema: &crate::connectors::SchemaInfo,
    ) -> Result<()> {
        let prior = match self.store.latest_prior_dataset(connection_id, new_dataset.id)? {
            Some(p) => p,
            None => return Ok(()),
        };
        let Some(old_fingerprint) = prior.schema_fingerprint.clone() else {
            return Ok(());
        };
        if old_fingerprint == new_schema.fingerprint {
            return Ok(());
        }

        let assessment = drift::assess_drift(&prior.schema_columns, &new_schema.columns);
        warn!(
            connection_id,
            severity = assessment.severity,
            added = assessment.added.len(),
            removed = assessment.removed.len(),
            "schema drift detected"
        );
        self.store.insert_drift_event(
            connection_id,
            Some(prior.id),
            Some(new_dataset.id),
            Some(&old_fingerprint),
            Some(&new_schema.fingerprint),
            &assessment.added,
            &assessment.removed,
            &assessment.type_changes,
            assessment.severity,
        )?;
        Ok(())
    }
}

// =============================================================================
// DATASET PROMOTION
// =============================================================================

/// Rows materialized into a snapshot from one dataset.
#[derive(Debug, Default, Clone)]
pub struct PromotionOutcome {
    pub invoices: i64,
    pub vendor_bills: i64,
    pub bank_transactions: i64,
    pub fx_rates: i64,
    pub skipped: i64,
}

/// Materialize a dataset's canonical records as snapshot rows.
///
/// Canonical IDs carry over, so re-promoting the same records into the same
/// snapshot skips duplicates instead of loading them.
pub fn promote_dataset(
    store: &Store,
    snapshot_id: i64,
    dataset_uid: &str,
    default_bank_account: &str,
) -> Result<PromotionOutcome> {
    let snapshot = store.get_snapshot(snapshot_id)?;
    assert_snapshot_not_locked(&snapshot)?;
    let dataset = store.get_dataset_by_uid(dataset_uid)?;
    let _guard = store.snapshot_write_lock(snapshot_id);
    let _held = _guard.lock();

    let mut outcome = PromotionOutcome::default();
    for record in store.list_canonical_records(dataset.id, None)? {
        let payload = &record.payload;
        match RecordType::parse(&record.record_type) {
            Some(RecordType::Invoice) => {
                let new = NewInvoice {
                    entity_id: dataset.entity_id,
                    canonical_id: record.canonical_id.clone(),
                    document_number: str_field(payload, "document_number")
                        .or_else(|| record.external_id.clone())
                        .unwrap_or_else(|| record.canonical_id.chars().take(12).collect()),
                    document_type: str_field(payload, "document_type")
                        .unwrap_or_else(|| "INV".to_string()),
                    customer: str_field(payload, "customer").or_else(|| record.counterparty.clone()),
                    country: str_field(payload, "country"),
                    project: str_field(payload, "project"),
                    project_desc: str_field(payload, "project_desc"),
                    terms_of_payment: str_field(payload, "terms_of_payment"),
                    payment_terms_days: payload
                        .get("payment_terms_days")
                        .and_then(|v| v.as_i64()),
                    amount: record.amount.unwrap_or(0.0),
                    currency: record.currency.clone().unwrap_or_else(|| "EUR".to_string()),
                    issue_date: record.record_date,
                    due_date: record.due_date,
                    payment_date: date_field(payload, "payment_date"),
                };
                match store.insert_invoice(snapshot_id, &new) {
                    Ok(_) => outcome.invoices += 1,
                    Err(DomainError::State(_)) => outcome.skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            Some(RecordType::VendorBill) => {
                let new = NewVendorBill {
                    entity_id: dataset.entity_id,
                    canonical_id: record.canonical_id.clone(),
                    document_number: str_field(payload, "document_number")
                        .or_else(|| record.external_id.clone())
                        .unwrap_or_else(|| record.canonical_id.chars().take(12).collect()),
                    vendor: str_field(payload, "vendor").or_else(|| record.counterparty.clone()),
                    category: str_field(payload, "category"),
                    amount: record.amount.unwrap_or(0.0),
                    currency: record.currency.clone().unwrap_or_else(|| "EUR".to_string()),
                    issue_date: record.record_date,
                    due_date: record.due_date,
                    payment_date: date_field(payload, "payment_date"),
                    approval_date: date_field(payload, "approval_date"),
                    scheduled_payment_date: date_field(payload, "scheduled_payment_date"),
                    is_discretionary: payload
                        .get("is_discretionary")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    hold_status: false,
                };
                match store.insert_vendor_bill(snapshot_id, &new) {
                    Ok(_) => outcome.vendor_bills += 1,
                    Err(DomainError::State(_)) => outcome.skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            Some(RecordType::BankTxn) => {
                let new = NewBankTransaction {
                    canonical_id: Some(record.canonical_id.clone()),
                    bank_account_id: str_field(payload, "bank_account_id")
                        .unwrap_or_else(|| default_bank_account.to_string()),
                    transaction_date: record.record_date,
                    value_date: date_field(payload, "value_date"),
                    amount: record.amount.unwrap_or(0.0),
                    currency: record.currency.clone().unwrap_or_else(|| "EUR".to_string()),
                    reference: str_field(payload, "reference").or_else(|| record.external_id.clone()),
                    counterparty: record.counterparty.clone(),
                    fee_amount: payload.get("fee").and_then(|v| v.as_f64()).unwrap_or(0.0),
                };
                match store.insert_bank_transaction(snapshot_id, &new) {
                    Ok(_) => outcome.bank_transactions += 1,
                    Err(DomainError::State(_)) => outcome.skipped += 1,
                    Err(e) => return Err(e),
                }
            }
            Some(RecordType::FxRate) => {
                let from = str_field(payload, "from_currency");
                let to = str_field(payload, "to_currency");
                let rate = payload.get("rate").and_then(|v| v.as_f64());
                if let (Some(from), Some(to), Some(rate)) = (from, to, rate) {
                    match store.insert_fx_rate(snapshot_id, &from, &to, rate) {
                        Ok(_) => outcome.fx_rates += 1,
                        Err(DomainError::State(_)) => outcome.skipped += 1,
                        Err(e) => return Err(e),
                    }
                } else {
                    outcome.skipped += 1;
                }
            }
            None => outcome.skipped += 1,
        }
    }

    store.set_snapshot_dataset(snapshot_id, dataset_uid)?;
    Ok(outcome)
}

fn str_field(payload: &serde_json::Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn date_field(payload: &serde_json::Value, key: &str) -> Option<NaiveDate> {
    str_field(payload, key).and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

fn merge_min(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

fn merge_max(a: Option<NaiveDate>, b: Option<NaiveDate>) -> Option<NaiveDate> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (x, None) | (None, x) => x,
    }
}
