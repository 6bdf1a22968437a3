//! Canonical store: entities, snapshots, AR/AP documents, bank postings,
//! FX rates, policies, allocations, forecast artifacts and workflow rows.

use super::{date_from_sql, date_to_sql, ts_from_sql, ts_to_sql, Store};
use crate::error::{DomainError, Result};
use crate::models::*;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// =============================================================================
// ROW MAPPERS
// =============================================================================

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    let accounts_json: String = row.get("internal_accounts_json")?;
    Ok(Entity {
        id: row.get("id")?,
        name: row.get("name")?,
        base_currency: row.get("base_currency")?,
        payment_run_day: row.get::<_, i64>("payment_run_day")? as u8,
        internal_accounts: serde_json::from_str(&accounts_json).unwrap_or_default(),
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<Snapshot> {
    let status: String = row.get("status")?;
    Ok(Snapshot {
        id: row.get("id")?,
        entity_id: row.get("entity_id")?,
        label: row.get("label")?,
        status: SnapshotStatus::parse(&status).unwrap_or(SnapshotStatus::Draft),
        opening_bank_balance: row.get("opening_bank_balance")?,
        min_cash_threshold: row.get("min_cash_threshold")?,
        cash_explained_pct: row.get("cash_explained_pct")?,
        locked_at: ts_from_sql(row.get("locked_at")?),
        locked_by: row.get("locked_by")?,
        lock_reason: row.get("lock_reason")?,
        policies_json: row.get("policies_json")?,
        dataset_id: row.get("dataset_id")?,
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<Invoice> {
    Ok(Invoice {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        entity_id: row.get("entity_id")?,
        canonical_id: row.get("canonical_id")?,
        document_number: row.get("document_number")?,
        document_type: row.get("document_type")?,
        customer: row.get("customer")?,
        country: row.get("country")?,
        project: row.get("project")?,
        project_desc: row.get("project_desc")?,
        terms_of_payment: row.get("terms_of_payment")?,
        payment_terms_days: row.get("payment_terms_days")?,
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        issue_date: date_from_sql(row.get("issue_date")?),
        due_date: date_from_sql(row.get("due_date")?),
        payment_date: date_from_sql(row.get("payment_date")?),
        predicted_payment_date: date_from_sql(row.get("predicted_payment_date")?),
        confidence_p25: date_from_sql(row.get("confidence_p25")?),
        confidence_p75: date_from_sql(row.get("confidence_p75")?),
        predicted_delay_days: row.get("predicted_delay_days")?,
        prediction_segment: row.get("prediction_segment")?,
        truth_label: row.get("truth_label")?,
    })
}

fn bill_from_row(row: &Row<'_>) -> rusqlite::Result<VendorBill> {
    Ok(VendorBill {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        entity_id: row.get("entity_id")?,
        canonical_id: row.get("canonical_id")?,
        document_number: row.get("document_number")?,
        vendor: row.get("vendor")?,
        category: row.get("category")?,
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        issue_date: date_from_sql(row.get("issue_date")?),
        due_date: date_from_sql(row.get("due_date")?),
        payment_date: date_from_sql(row.get("payment_date")?),
        approval_date: date_from_sql(row.get("approval_date")?),
        scheduled_payment_date: date_from_sql(row.get("scheduled_payment_date")?),
        is_discretionary: row.get::<_, i64>("is_discretionary")? != 0,
        hold_status: row.get::<_, i64>("hold_status")? != 0,
    })
}

fn txn_from_row(row: &Row<'_>) -> rusqlite::Result<BankTransaction> {
    let recon_type: String = row.get("reconciliation_type")?;
    let lifecycle: String = row.get("lifecycle_status")?;
    Ok(BankTransaction {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        canonical_id: row.get("canonical_id")?,
        bank_account_id: row.get("bank_account_id")?,
        transaction_date: date_from_sql(row.get("transaction_date")?)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        value_date: date_from_sql(row.get("value_date")?),
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        reference: row.get("reference")?,
        counterparty: row.get("counterparty")?,
        fee_amount: row.get("fee_amount")?,
        is_reconciled: row.get::<_, i64>("is_reconciled")? != 0,
        reconciliation_type: ReconciliationType::parse(&recon_type)
            .unwrap_or(ReconciliationType::None),
        match_confidence: row.get("match_confidence")?,
        lifecycle_status: LifecycleStatus::parse(&lifecycle).unwrap_or(LifecycleStatus::New),
        resolved_at: ts_from_sql(row.get("resolved_at")?),
    })
}

fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationAllocation> {
    let status: String = row.get("status")?;
    Ok(ReconciliationAllocation {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        bank_transaction_id: row.get("bank_transaction_id")?,
        invoice_id: row.get("invoice_id")?,
        vendor_bill_id: row.get("vendor_bill_id")?,
        allocated_amount: row.get("allocated_amount")?,
        writeoff_amount: row.get("writeoff_amount")?,
        match_tier: row.get::<_, i64>("match_tier")? as u8,
        confidence: row.get("confidence")?,
        status: MatchStatus::parse(&status).unwrap_or(MatchStatus::PendingApproval),
        approved_by: row.get("approved_by")?,
        approved_at: ts_from_sql(row.get("approved_at")?),
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn exception_from_row(row: &Row<'_>) -> rusqlite::Result<Exception> {
    let severity: String = row.get("severity")?;
    let status: String = row.get("status")?;
    let evidence_json: String = row.get("evidence_refs_json")?;
    Ok(Exception {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        exception_type: row.get("exception_type")?,
        severity: Severity::parse(&severity).unwrap_or(Severity::Info),
        title: row.get("title")?,
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        status: ExceptionStatus::parse(&status).unwrap_or(ExceptionStatus::Open),
        assignee: row.get("assignee")?,
        assigned_by: row.get("assigned_by")?,
        sla_due_at: ts_from_sql(row.get("sla_due_at")?),
        resolution_type: row.get("resolution_type")?,
        resolution_note: row.get("resolution_note")?,
        evidence_refs: serde_json::from_str(&evidence_json).unwrap_or_default(),
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn scenario_from_row(row: &Row<'_>) -> rusqlite::Result<Scenario> {
    let status: String = row.get("status")?;
    let config_json: String = row.get("config_json")?;
    Ok(Scenario {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        name: row.get("name")?,
        config: serde_json::from_str(&config_json).unwrap_or_default(),
        status: ScenarioStatus::parse(&status).unwrap_or(ScenarioStatus::Draft),
        created_by: row.get("created_by")?,
        approved_by: row.get("approved_by")?,
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn action_from_row(row: &Row<'_>) -> rusqlite::Result<Action> {
    let status: String = row.get("status")?;
    Ok(Action {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        title: row.get("title")?,
        action_type: row.get("action_type")?,
        status: ActionStatus::parse(&status).unwrap_or(ActionStatus::Draft),
        requires_approval: row.get::<_, i64>("requires_approval")? != 0,
        assignee: row.get("assignee")?,
        due_date: date_from_sql(row.get("due_date")?),
        created_by: row.get("created_by")?,
        started_at: ts_from_sql(row.get("started_at")?),
        completed_at: ts_from_sql(row.get("completed_at")?),
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    let evidence_json: String = row.get("evidence_refs_json")?;
    Ok(Comment {
        id: row.get("id")?,
        parent_type: row.get("parent_type")?,
        parent_id: row.get("parent_id")?,
        author: row.get("author")?,
        body: row.get("body")?,
        reply_to: row.get("reply_to")?,
        evidence_refs: serde_json::from_str(&evidence_json).unwrap_or_default(),
        is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditLog> {
    Ok(AuditLog {
        id: row.get("id")?,
        actor: row.get("actor")?,
        role: row.get("role")?,
        action: row.get("action")?,
        resource_type: row.get("resource_type")?,
        resource_id: row.get("resource_id")?,
        snapshot_id: row.get("snapshot_id")?,
        changes_json: row.get("changes_json")?,
        ip_address: row.get("ip_address")?,
        note: row.get("note")?,
        created_at: ts_from_sql(row.get("created_at")?).unwrap_or_else(Utc::now),
    })
}

fn outflow_from_row(row: &Row<'_>) -> rusqlite::Result<OutflowItem> {
    Ok(OutflowItem {
        id: row.get("id")?,
        snapshot_id: row.get("snapshot_id")?,
        entity_id: row.get("entity_id")?,
        category: row.get("category")?,
        description: row.get("description")?,
        amount: row.get("amount")?,
        currency: row.get("currency")?,
        expected_date: date_from_sql(row.get("expected_date")?)
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
        is_discretionary: row.get::<_, i64>("is_discretionary")? != 0,
        source: row.get("source")?,
        status: row.get("status")?,
    })
}

// =============================================================================
// ENTITIES & SNAPSHOTS
// =============================================================================

impl Store {
    pub fn create_entity(
        &self,
        name: &str,
        base_currency: &str,
        payment_run_day: u8,
        internal_accounts: &[String],
    ) -> Result<Entity> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO entities (name, base_currency, payment_run_day, internal_accounts_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                base_currency,
                payment_run_day as i64,
                serde_json::to_string(internal_accounts)?
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_entity(id)
    }

    pub fn get_entity(&self, id: i64) -> Result<Entity> {
        self.conn()
            .query_row("SELECT * FROM entities WHERE id = ?1", [id], entity_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Entity {id}")))
    }

    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM entities ORDER BY id")?;
        let rows = stmt
            .query_map([], entity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn create_snapshot(
        &self,
        entity_id: i64,
        label: &str,
        opening_bank_balance: f64,
        min_cash_threshold: f64,
    ) -> Result<Snapshot> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO snapshots
               (entity_id, label, status, opening_bank_balance, min_cash_threshold, created_at)
             VALUES (?1, ?2, 'DRAFT', ?3, ?4, ?5)",
            params![
                entity_id,
                label,
                opening_bank_balance,
                min_cash_threshold,
                ts_to_sql(Utc::now())
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_snapshot(id)
    }

    pub fn get_snapshot(&self, id: i64) -> Result<Snapshot> {
        self.conn()
            .query_row("SELECT * FROM snapshots WHERE id = ?1", [id], snapshot_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Snapshot {id}")))
    }

    pub(crate) fn update_snapshot_status(
        &self,
        id: i64,
        status: SnapshotStatus,
        locked_by: Option<&str>,
        lock_reason: Option<&str>,
        policies_json: Option<&str>,
    ) -> Result<()> {
        let locked_at = if status == SnapshotStatus::Locked {
            Some(ts_to_sql(Utc::now()))
        } else {
            None
        };
        self.conn().execute(
            "UPDATE snapshots
             SET status = ?2,
                 locked_at = COALESCE(?3, locked_at),
                 locked_by = COALESCE(?4, locked_by),
                 lock_reason = COALESCE(?5, lock_reason),
                 policies_json = COALESCE(?6, policies_json)
             WHERE id = ?1",
            params![id, status.as_str(), locked_at, locked_by, lock_reason, policies_json],
        )?;
        Ok(())
    }

    pub fn set_snapshot_dataset(&self, id: i64, dataset_uid: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE snapshots SET dataset_id = ?2 WHERE id = ?1",
            params![id, dataset_uid],
        )?;
        Ok(())
    }

    pub fn set_cash_explained(&self, id: i64, pct: f64) -> Result<()> {
        self.conn().execute(
            "UPDATE snapshots SET cash_explained_pct = ?2 WHERE id = ?1",
            params![id, pct],
        )?;
        Ok(())
    }
}

// =============================================================================
// INVOICES & BILLS
// =============================================================================

/// Insert payload for a new invoice row.
#[derive(Debug, Clone, Default)]
pub struct NewInvoice {
    pub entity_id: Option<i64>,
    pub canonical_id: String,
    pub document_number: String,
    pub document_type: String,
    pub customer: Option<String>,
    pub country: Option<String>,
    pub project: Option<String>,
    pub project_desc: Option<String>,
    pub terms_of_payment: Option<String>,
    pub payment_terms_days: Option<i64>,
    pub amount: f64,
    pub currency: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default)]
pub struct NewVendorBill {
    pub entity_id: Option<i64>,
    pub canonical_id: String,
    pub document_number: String,
    pub vendor: Option<String>,
    pub category: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub issue_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
    pub approval_date: Option<NaiveDate>,
    pub scheduled_payment_date: Option<NaiveDate>,
    pub is_discretionary: bool,
    pub hold_status: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NewBankTransaction {
    pub canonical_id: Option<String>,
    pub bank_account_id: String,
    pub transaction_date: Option<NaiveDate>,
    pub value_date: Option<NaiveDate>,
    pub amount: f64,
    pub currency: String,
    pub reference: Option<String>,
    pub counterparty: Option<String>,
    pub fee_amount: f64,
}

impl Store {
    /// Insert an invoice. A duplicate `(snapshot, canonical_id)` returns a
    /// `State` error — callers treat it as an idempotent skip.
    pub fn insert_invoice(&self, snapshot_id: i64, new: &NewInvoice) -> Result<i64> {
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO invoices
               (snapshot_id, entity_id, canonical_id, document_number, document_type,
                customer, country, project, project_desc, terms_of_payment,
                payment_terms_days, amount, currency, issue_date, due_date, payment_date)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                snapshot_id,
                new.entity_id,
                new.canonical_id,
                new.document_number,
                new.document_type,
                new.customer,
                new.country,
                new.project,
                new.project_desc,
                new.terms_of_payment,
                new.payment_terms_days,
                new.amount,
                new.currency,
                date_to_sql(new.issue_date),
                date_to_sql(new.due_date),
                date_to_sql(new.payment_date),
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(DomainError::State(format!(
                "Duplicate canonical_id in snapshot {snapshot_id}: {}",
                new.canonical_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert_vendor_bill(&self, snapshot_id: i64, new: &NewVendorBill) -> Result<i64> {
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO vendor_bills
               (snapshot_id, entity_id, canonical_id, document_number, vendor, category,
                amount, currency, issue_date, due_date, payment_date, approval_date,
                scheduled_payment_date, is_discretionary, hold_status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                snapshot_id,
                new.entity_id,
                new.canonical_id,
                new.document_number,
                new.vendor,
                new.category,
                new.amount,
                new.currency,
                date_to_sql(new.issue_date),
                date_to_sql(new.due_date),
                date_to_sql(new.payment_date),
                date_to_sql(new.approval_date),
                date_to_sql(new.scheduled_payment_date),
                new.is_discretionary as i64,
                new.hold_status as i64,
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(DomainError::State(format!(
                "Duplicate canonical_id in snapshot {snapshot_id}: {}",
                new.canonical_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn insert_bank_transaction(
        &self,
        snapshot_id: i64,
        new: &NewBankTransaction,
    ) -> Result<i64> {
        let txn_date = new
            .transaction_date
            .ok_or_else(|| DomainError::Input("Bank transaction requires a date".to_string()))?;
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO bank_transactions
               (snapshot_id, canonical_id, bank_account_id, transaction_date, value_date,
                amount, currency, reference, counterparty, fee_amount)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                snapshot_id,
                new.canonical_id,
                new.bank_account_id,
                date_to_sql(Some(txn_date)),
                date_to_sql(new.value_date),
                new.amount,
                new.currency,
                new.reference,
                new.counterparty,
                new.fee_amount,
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(DomainError::State(format!(
                "Duplicate canonical_id in snapshot {snapshot_id}: {}",
                new.canonical_id.as_deref().unwrap_or("")
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_invoice(&self, id: i64) -> Result<Invoice> {
        self.conn()
            .query_row("SELECT * FROM invoices WHERE id = ?1", [id], invoice_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Invoice {id}")))
    }

    pub fn list_invoices(&self, snapshot_id: i64) -> Result<Vec<Invoice>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM invoices WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], invoice_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_open_invoices(&self, snapshot_id: i64) -> Result<Vec<Invoice>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM invoices WHERE snapshot_id = ?1 AND payment_date IS NULL ORDER BY id",
        )?;
        let rows = stmt
            .query_map([snapshot_id], invoice_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn update_invoice_prediction(
        &self,
        invoice_id: i64,
        predicted_payment_date: Option<NaiveDate>,
        confidence_p25: Option<NaiveDate>,
        confidence_p75: Option<NaiveDate>,
        predicted_delay_days: i64,
        prediction_segment: &str,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE invoices
             SET predicted_payment_date = ?2, confidence_p25 = ?3, confidence_p75 = ?4,
                 predicted_delay_days = ?5, prediction_segment = ?6
             WHERE id = ?1",
            params![
                invoice_id,
                date_to_sql(predicted_payment_date),
                date_to_sql(confidence_p25),
                date_to_sql(confidence_p75),
                predicted_delay_days,
                prediction_segment,
            ],
        )?;
        Ok(())
    }

    pub fn set_invoice_truth_label(&self, invoice_id: i64, label: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE invoices SET truth_label = ?2 WHERE id = ?1",
            params![invoice_id, label],
        )?;
        Ok(())
    }

    pub fn get_vendor_bill(&self, id: i64) -> Result<VendorBill> {
        self.conn()
            .query_row("SELECT * FROM vendor_bills WHERE id = ?1", [id], bill_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("VendorBill {id}")))
    }

    pub fn list_vendor_bills(&self, snapshot_id: i64) -> Result<Vec<VendorBill>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM vendor_bills WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], bill_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn get_bank_transaction(&self, id: i64) -> Result<BankTransaction> {
        self.conn()
            .query_row(
                "SELECT * FROM bank_transactions WHERE id = ?1",
                [id],
                txn_from_row,
            )
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("BankTransaction {id}")))
    }

    pub fn list_bank_transactions(&self, snapshot_id: i64) -> Result<Vec<BankTransaction>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM bank_transactions WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], txn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_unreconciled_transactions(&self, snapshot_id: i64) -> Result<Vec<BankTransaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM bank_transactions
             WHERE snapshot_id = ?1 AND is_reconciled = 0 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([snapshot_id], txn_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_transaction_reconciled(
        &self,
        txn_id: i64,
        recon_type: ReconciliationType,
        confidence: f64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE bank_transactions
             SET is_reconciled = 1, reconciliation_type = ?2, match_confidence = ?3,
                 lifecycle_status = 'resolved', resolved_at = ?4
             WHERE id = ?1",
            params![txn_id, recon_type.as_str(), confidence, ts_to_sql(Utc::now())],
        )?;
        Ok(())
    }

    pub fn mark_transaction_pending(
        &self,
        txn_id: i64,
        recon_type: ReconciliationType,
        confidence: Option<f64>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE bank_transactions
             SET reconciliation_type = ?2, match_confidence = ?3, lifecycle_status = 'new'
             WHERE id = ?1",
            params![txn_id, recon_type.as_str(), confidence],
        )?;
        Ok(())
    }
}

// =============================================================================
// FX & POLICIES
// =============================================================================

impl Store {
    /// Store a rate for the snapshot. Rates are written once; re-inserting
    /// the same pair is a state error (snapshot FX is immutable).
    pub fn insert_fx_rate(
        &self,
        snapshot_id: i64,
        from_currency: &str,
        to_currency: &str,
        rate: f64,
    ) -> Result<i64> {
        if rate <= 0.0 {
            return Err(DomainError::Input(format!(
                "FX rate must be positive: {from_currency}->{to_currency} {rate}"
            )));
        }
        let conn = self.conn();
        let result = conn.execute(
            "INSERT INTO fx_rates (snapshot_id, from_currency, to_currency, rate)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot_id,
                from_currency.to_uppercase(),
                to_currency.to_uppercase(),
                rate
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(DomainError::State(format!(
                "FX rate {from_currency}->{to_currency} already frozen for snapshot {snapshot_id}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list_fx_rates(&self, snapshot_id: i64) -> Result<Vec<FxRate>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM fx_rates WHERE snapshot_id = ?1")?;
        let rows = stmt
            .query_map([snapshot_id], |row| {
                Ok(FxRate {
                    id: row.get("id")?,
                    snapshot_id: row.get("snapshot_id")?,
                    from_currency: row.get("from_currency")?,
                    to_currency: row.get("to_currency")?,
                    rate: row.get("rate")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Snapshot-locked rate lookup with inverse fallback. `None` means the
    /// amount must be routed to the Unknown bucket.
    pub fn get_fx_rate(
        &self,
        snapshot_id: i64,
        from_currency: &str,
        to_currency: &str,
    ) -> Result<Option<f64>> {
        let from = from_currency.to_uppercase();
        let to = to_currency.to_uppercase();
        if from == to {
            return Ok(Some(1.0));
        }
        let conn = self.conn();
        let direct: Option<f64> = conn
            .query_row(
                "SELECT rate FROM fx_rates
                 WHERE snapshot_id = ?1 AND from_currency = ?2 AND to_currency = ?3",
                params![snapshot_id, from, to],
                |row| row.get(0),
            )
            .optional()?;
        if direct.is_some() {
            return Ok(direct);
        }
        let inverse: Option<f64> = conn
            .query_row(
                "SELECT rate FROM fx_rates
                 WHERE snapshot_id = ?1 AND from_currency = ?2 AND to_currency = ?3",
                params![snapshot_id, to, from],
                |row| row.get(0),
            )
            .optional()?;
        Ok(inverse.filter(|r| *r > 0.0).map(|r| 1.0 / r))
    }

    pub fn upsert_matching_policy(&self, policy: &MatchingPolicy) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE matching_policies SET is_active = 0
             WHERE currency = ?1 AND (entity_id IS ?2)",
            params![policy.currency, policy.entity_id],
        )?;
        conn.execute(
            "INSERT INTO matching_policies
               (entity_id, currency, amount_tolerance, date_window_days,
                tier2_min_confidence, tier3_min_confidence,
                auto_apply_tier1, auto_apply_tier2, is_active)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,1)",
            params![
                policy.entity_id,
                policy.currency,
                policy.amount_tolerance,
                policy.date_window_days,
                policy.tier2_min_confidence,
                policy.tier3_min_confidence,
                policy.auto_apply_tier1 as i64,
                policy.auto_apply_tier2 as i64,
            ],
        )?;
        Ok(())
    }

    /// Active policy for entity+currency; entity-specific beats global,
    /// falls back to defaults when nothing is configured.
    pub fn get_matching_policy(
        &self,
        entity_id: Option<i64>,
        currency: &str,
    ) -> Result<MatchingPolicy> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM matching_policies
             WHERE is_active = 1 AND currency = ?1 AND (entity_id = ?2 OR entity_id IS NULL)
             ORDER BY entity_id IS NULL
             LIMIT 1",
        )?;
        let policy = stmt
            .query_row(params![currency, entity_id], |row| {
                Ok(MatchingPolicy {
                    entity_id: row.get("entity_id")?,
                    currency: row.get("currency")?,
                    amount_tolerance: row.get("amount_tolerance")?,
                    date_window_days: row.get("date_window_days")?,
                    tier2_min_confidence: row.get("tier2_min_confidence")?,
                    tier3_min_confidence: row.get("tier3_min_confidence")?,
                    auto_apply_tier1: row.get::<_, i64>("auto_apply_tier1")? != 0,
                    auto_apply_tier2: row.get::<_, i64>("auto_apply_tier2")? != 0,
                })
            })
            .optional()?;
        Ok(policy.unwrap_or_else(|| MatchingPolicy {
            currency: currency.to_string(),
            ..MatchingPolicy::default()
        }))
    }

    pub fn list_active_policies(&self) -> Result<Vec<MatchingPolicy>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM matching_policies WHERE is_active = 1 ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MatchingPolicy {
                    entity_id: row.get("entity_id")?,
                    currency: row.get("currency")?,
                    amount_tolerance: row.get("amount_tolerance")?,
                    date_window_days: row.get("date_window_days")?,
                    tier2_min_confidence: row.get("tier2_min_confidence")?,
                    tier3_min_confidence: row.get("tier3_min_confidence")?,
                    auto_apply_tier1: row.get::<_, i64>("auto_apply_tier1")? != 0,
                    auto_apply_tier2: row.get::<_, i64>("auto_apply_tier2")? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// =============================================================================
// ALLOCATIONS
// =============================================================================

/// Insert payload for one allocation.
#[derive(Debug, Clone)]
pub struct NewAllocation {
    pub bank_transaction_id: i64,
    pub invoice_id: Option<i64>,
    pub vendor_bill_id: Option<i64>,
    pub allocated_amount: f64,
    pub writeoff_amount: f64,
    pub match_tier: u8,
    pub confidence: f64,
    pub status: MatchStatus,
    pub approved_by: Option<String>,
}

impl Store {
    pub fn insert_allocation(&self, snapshot_id: i64, new: &NewAllocation) -> Result<i64> {
        let approved_at = if new.status == MatchStatus::Reconciled {
            Some(ts_to_sql(Utc::now()))
        } else {
            None
        };
        let conn = self.conn();
        conn.execute(
            "INSERT INTO reconciliation_allocations
               (snapshot_id, bank_transaction_id, invoice_id, vendor_bill_id,
                allocated_amount, writeoff_amount, match_tier, confidence, status,
                approved_by, approved_at, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                snapshot_id,
                new.bank_transaction_id,
                new.invoice_id,
                new.vendor_bill_id,
                new.allocated_amount,
                new.writeoff_amount,
                new.match_tier as i64,
                new.confidence,
                new.status.as_str(),
                new.approved_by,
                approved_at,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_allocation(&self, id: i64) -> Result<ReconciliationAllocation> {
        self.conn()
            .query_row(
                "SELECT * FROM reconciliation_allocations WHERE id = ?1",
                [id],
                allocation_from_row,
            )
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Allocation {id}")))
    }

    pub fn list_allocations_for_snapshot(
        &self,
        snapshot_id: i64,
    ) -> Result<Vec<ReconciliationAllocation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM reconciliation_allocations WHERE snapshot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([snapshot_id], allocation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_allocations_for_transaction(
        &self,
        txn_id: i64,
    ) -> Result<Vec<ReconciliationAllocation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM reconciliation_allocations WHERE bank_transaction_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([txn_id], allocation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sum of RECONCILED allocations against one invoice.
    pub fn approved_allocation_total(&self, invoice_id: i64) -> Result<f64> {
        let total: f64 = self.conn().query_row(
            "SELECT COALESCE(SUM(allocated_amount), 0)
             FROM reconciliation_allocations
             WHERE invoice_id = ?1 AND status = 'RECONCILED'",
            [invoice_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn set_allocation_status(
        &self,
        allocation_id: i64,
        status: MatchStatus,
        approved_by: Option<&str>,
    ) -> Result<()> {
        let approved_at = if status == MatchStatus::Reconciled {
            Some(ts_to_sql(Utc::now()))
        } else {
            None
        };
        self.conn().execute(
            "UPDATE reconciliation_allocations
             SET status = ?2, approved_by = COALESCE(?3, approved_by), approved_at = ?4
             WHERE id = ?1",
            params![allocation_id, status.as_str(), approved_by, approved_at],
        )?;
        Ok(())
    }

    pub fn list_pending_allocations(&self, snapshot_id: i64) -> Result<Vec<ReconciliationAllocation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM reconciliation_allocations
             WHERE snapshot_id = ?1 AND status = 'PENDING_APPROVAL' ORDER BY id",
        )?;
        let rows = stmt
            .query_map([snapshot_id], allocation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// =============================================================================
// FORECAST ARTIFACTS
// =============================================================================

impl Store {
    /// Replace all segment rows for a snapshot with a fresh forecast run.
    pub fn replace_segment_stats(&self, snapshot_id: i64, stats: &[SegmentStats]) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM segment_stats WHERE snapshot_id = ?1",
                [snapshot_id],
            )?;
            for s in stats {
                tx.execute(
                    "INSERT INTO segment_stats
                       (snapshot_id, segment_type, segment_key, sample_size,
                        p25_delay, p50_delay, p75_delay, p90_delay, mean_delay, std_delay)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    params![
                        snapshot_id,
                        s.segment_type,
                        s.segment_key,
                        s.sample_size,
                        s.p25_delay,
                        s.p50_delay,
                        s.p75_delay,
                        s.p90_delay,
                        s.mean_delay,
                        s.std_delay,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn list_segment_stats(&self, snapshot_id: i64) -> Result<Vec<SegmentStats>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM segment_stats WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], |row| {
                Ok(SegmentStats {
                    snapshot_id: row.get("snapshot_id")?,
                    segment_type: row.get("segment_type")?,
                    segment_key: row.get("segment_key")?,
                    sample_size: row.get("sample_size")?,
                    p25_delay: row.get("p25_delay")?,
                    p50_delay: row.get("p50_delay")?,
                    p75_delay: row.get("p75_delay")?,
                    p90_delay: row.get("p90_delay")?,
                    mean_delay: row.get("mean_delay")?,
                    std_delay: row.get("std_delay")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn replace_calibration_stats(
        &self,
        snapshot_id: i64,
        stats: &[CalibrationRecord],
    ) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM calibration_stats WHERE snapshot_id = ?1",
                [snapshot_id],
            )?;
            for s in stats {
                tx.execute(
                    "INSERT INTO calibration_stats
                       (snapshot_id, segment_type, segment_key, coverage_p25, coverage_p50,
                        coverage_p75, coverage_p90, calibration_error, sample_size, backtest_splits)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    params![
                        snapshot_id,
                        s.segment_type,
                        s.segment_key,
                        s.coverage_p25,
                        s.coverage_p50,
                        s.coverage_p75,
                        s.coverage_p90,
                        s.calibration_error,
                        s.sample_size,
                        s.backtest_splits,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn list_calibration_stats(&self, snapshot_id: i64) -> Result<Vec<CalibrationRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM calibration_stats WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], |row| {
                Ok(CalibrationRecord {
                    snapshot_id: row.get("snapshot_id")?,
                    segment_type: row.get("segment_type")?,
                    segment_key: row.get("segment_key")?,
                    coverage_p25: row.get("coverage_p25")?,
                    coverage_p50: row.get("coverage_p50")?,
                    coverage_p75: row.get("coverage_p75")?,
                    coverage_p90: row.get("coverage_p90")?,
                    calibration_error: row.get("calibration_error")?,
                    sample_size: row.get("sample_size")?,
                    backtest_splits: row.get("backtest_splits")?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// =============================================================================
// WORKFLOW ROWS
// =============================================================================

impl Store {
    pub fn insert_exception(
        &self,
        snapshot_id: i64,
        exception_type: &str,
        severity: Severity,
        title: &str,
        amount: Option<f64>,
        currency: Option<&str>,
        evidence_refs: &[EvidenceRef],
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO exceptions
               (snapshot_id, exception_type, severity, title, amount, currency,
                status, evidence_refs_json, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,'open',?7,?8)",
            params![
                snapshot_id,
                exception_type,
                severity.as_str(),
                title,
                amount,
                currency,
                serde_json::to_string(evidence_refs)?,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_exception(&self, id: i64) -> Result<Exception> {
        self.conn()
            .query_row("SELECT * FROM exceptions WHERE id = ?1", [id], exception_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Exception {id}")))
    }

    pub fn list_exceptions(&self, snapshot_id: i64) -> Result<Vec<Exception>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM exceptions WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], exception_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count_open_critical_exceptions(&self, snapshot_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM exceptions
             WHERE snapshot_id = ?1 AND severity = 'critical'
               AND status IN ('open', 'in_review', 'escalated')",
            [snapshot_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub(crate) fn update_exception(
        &self,
        id: i64,
        status: ExceptionStatus,
        assignee: Option<&str>,
        assigned_by: Option<&str>,
        sla_due_at: Option<chrono::DateTime<Utc>>,
        resolution_type: Option<&str>,
        resolution_note: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE exceptions
             SET status = ?2,
                 assignee = COALESCE(?3, assignee),
                 assigned_by = COALESCE(?4, assigned_by),
                 sla_due_at = COALESCE(?5, sla_due_at),
                 resolution_type = COALESCE(?6, resolution_type),
                 resolution_note = COALESCE(?7, resolution_note)
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                assignee,
                assigned_by,
                sla_due_at.map(ts_to_sql),
                resolution_type,
                resolution_note,
            ],
        )?;
        Ok(())
    }

    pub fn insert_scenario(
        &self,
        snapshot_id: i64,
        name: &str,
        config: &ScenarioConfig,
        created_by: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO scenarios (snapshot_id, name, config_json, status, created_by, created_at)
             VALUES (?1, ?2, ?3, 'DRAFT', ?4, ?5)",
            params![
                snapshot_id,
                name,
                serde_json::to_string(config)?,
                created_by,
                ts_to_sql(Utc::now())
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_scenario(&self, id: i64) -> Result<Scenario> {
        self.conn()
            .query_row("SELECT * FROM scenarios WHERE id = ?1", [id], scenario_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Scenario {id}")))
    }

    pub(crate) fn update_scenario_status(
        &self,
        id: i64,
        status: ScenarioStatus,
        approved_by: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE scenarios SET status = ?2, approved_by = COALESCE(?3, approved_by)
             WHERE id = ?1",
            params![id, status.as_str(), approved_by],
        )?;
        Ok(())
    }

    pub fn insert_action(
        &self,
        snapshot_id: i64,
        title: &str,
        action_type: &str,
        requires_approval: bool,
        assignee: Option<&str>,
        due_date: Option<NaiveDate>,
        created_by: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO actions
               (snapshot_id, title, action_type, status, requires_approval,
                assignee, due_date, created_by, created_at)
             VALUES (?1, ?2, ?3, 'DRAFT', ?4, ?5, ?6, ?7, ?8)",
            params![
                snapshot_id,
                title,
                action_type,
                requires_approval as i64,
                assignee,
                date_to_sql(due_date),
                created_by,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_action(&self, id: i64) -> Result<Action> {
        self.conn()
            .query_row("SELECT * FROM actions WHERE id = ?1", [id], action_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Action {id}")))
    }

    pub(crate) fn update_action_status(&self, id: i64, status: ActionStatus) -> Result<()> {
        let now = ts_to_sql(Utc::now());
        let started_at = if status == ActionStatus::InProgress {
            Some(now.clone())
        } else {
            None
        };
        let completed_at = if matches!(status, ActionStatus::Done | ActionStatus::Cancelled) {
            Some(now)
        } else {
            None
        };
        self.conn().execute(
            "UPDATE actions
             SET status = ?2,
                 started_at = COALESCE(?3, started_at),
                 completed_at = COALESCE(?4, completed_at)
             WHERE id = ?1",
            params![id, status.as_str(), started_at, completed_at],
        )?;
        Ok(())
    }

    pub fn insert_comment(
        &self,
        parent_type: &str,
        parent_id: i64,
        author: &str,
        body: &str,
        reply_to: Option<i64>,
        evidence_refs: &[EvidenceRef],
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO comments
               (parent_type, parent_id, author, body, reply_to, evidence_refs_json, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                parent_type,
                parent_id,
                author,
                body,
                reply_to,
                serde_json::to_string(evidence_refs)?,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_comment(&self, id: i64) -> Result<Comment> {
        self.conn()
            .query_row("SELECT * FROM comments WHERE id = ?1", [id], comment_from_row)
            .optional()?
            .ok_or_else(|| DomainError::NotFound(format!("Comment {id}")))
    }

    pub fn list_comments(&self, parent_type: &str, parent_id: i64) -> Result<Vec<Comment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM comments
             WHERE parent_type = ?1 AND parent_id = ?2 AND is_deleted = 0 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![parent_type, parent_id], comment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn soft_delete_comment(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE comments SET is_deleted = 1 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    pub fn append_audit(
        &self,
        actor: &str,
        role: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<i64>,
        snapshot_id: Option<i64>,
        changes_json: Option<&str>,
        ip_address: Option<&str>,
        note: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log
               (actor, role, action, resource_type, resource_id, snapshot_id,
                changes_json, ip_address, note, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                actor,
                role,
                action,
                resource_type,
                resource_id,
                snapshot_id,
                changes_json,
                ip_address,
                note,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_audit_for_snapshot(&self, snapshot_id: i64) -> Result<Vec<AuditLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM audit_log WHERE snapshot_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([snapshot_id], audit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Mutating audit entries referencing a snapshot after a timestamp.
    pub fn mutations_after(
        &self,
        snapshot_id: i64,
        after: chrono::DateTime<Utc>,
    ) -> Result<Vec<AuditLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM audit_log
             WHERE snapshot_id = ?1 AND action IN ('Update', 'Delete') AND created_at > ?2
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![snapshot_id, ts_to_sql(after)], audit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// =============================================================================
// OUTFLOW PLANNING
// =============================================================================

impl Store {
    pub fn insert_recurring_outflow(
        &self,
        entity_id: i64,
        category: &str,
        description: &str,
        amount: f64,
        currency: &str,
        frequency: &RecurringFrequency,
        is_discretionary: bool,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO recurring_outflows
               (entity_id, category, description, amount, currency, frequency_json, is_discretionary)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                entity_id,
                category,
                description,
                amount,
                currency,
                serde_json::to_string(frequency)?,
                is_discretionary as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_recurring_outflows(&self, entity_id: i64) -> Result<Vec<RecurringOutflow>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM recurring_outflows WHERE entity_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([entity_id], |row| {
                let freq_json: String = row.get("frequency_json")?;
                Ok(RecurringOutflow {
                    id: row.get("id")?,
                    entity_id: row.get("entity_id")?,
                    category: row.get("category")?,
                    description: row.get("description")?,
                    amount: row.get("amount")?,
                    currency: row.get("currency")?,
                    frequency: serde_json::from_str(&freq_json).unwrap_or(
                        RecurringFrequency::Monthly {
                            day_of_month: 1,
                            is_last_day: false,
                        },
                    ),
                    is_discretionary: row.get::<_, i64>("is_discretionary")? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn insert_outflow_item(&self, item: &OutflowItem) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO outflow_items
               (snapshot_id, entity_id, category, description, amount, currency,
                expected_date, is_discretionary, source, status)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                item.snapshot_id,
                item.entity_id,
                item.category,
                item.description,
                item.amount,
                item.currency,
                date_to_sql(Some(item.expected_date)),
                item.is_discretionary as i64,
                item.source,
                item.status,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_outflow_items(&self, snapshot_id: i64) -> Result<Vec<OutflowItem>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT * FROM outflow_items WHERE snapshot_id = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([snapshot_id], outflow_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

// =============================================================================
// LOCK GATE OVERRIDES
// =============================================================================

impl Store {
    pub fn append_lock_gate_override(
        &self,
        snapshot_id: i64,
        user: &str,
        role: &str,
        email: Option<&str>,
        ip_address: Option<&str>,
        failed_gates_json: &str,
        acknowledgment_text: &str,
        override_reason: &str,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO lock_gate_overrides
               (snapshot_id, user, role, email, ip_address, failed_gates_json,
                acknowledgment_text, override_reason, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                snapshot_id,
                user,
                role,
                email,
                ip_address,
                failed_gates_json,
                acknowledgment_text,
                override_reason,
                ts_to_sql(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_lock_gate_overrides(&self, snapshot_id: i64) -> Result<i64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM lock_gate_overrides WHERE snapshot_id = ?1",
            [snapshot_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_snapshot() -> (Store, Snapshot) {
        let store = Store::open_in_memory().unwrap();
        let entity = store
            .create_entity("Acme GmbH", "EUR", 3, &["DE89".to_string()])
            .unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 100_000.0, 20_000.0).unwrap();
        (store, snapshot)
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_duplicate_canonical_id_rejected() {
        let (store, snapshot) = store_with_snapshot();
        let new = NewInvoice {
            canonical_id: "abc123".to_string(),
            document_number: "INV-1".to_string(),
            document_type: "INV".to_string(),
            amount: 100.0,
            currency: "EUR".to_string(),
            ..Default::default()
        };
        store.insert_invoice(snapshot.id, &new).unwrap();
        let err = store.insert_invoice(snapshot.id, &new).unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }

    #[test]
    fn test_same_canonical_id_allowed_across_snapshots() {
        let (store, snapshot) = store_with_snapshot();
        let other = store
            .create_snapshot(snapshot.entity_id, "W02", 0.0, 0.0)
            .unwrap();
        let new = NewInvoice {
            canonical_id: "abc123".to_string(),
            document_number: "INV-1".to_string(),
            document_type: "INV".to_string(),
            amount: 100.0,
            currency: "EUR".to_string(),
            ..Default::default()
        };
        store.insert_invoice(snapshot.id, &new).unwrap();
        store.insert_invoice(other.id, &new).unwrap();
    }

    #[test]
    fn test_fx_rate_inverse_fallback_and_unknown() {
        let (store, snapshot) = store_with_snapshot();
        store.insert_fx_rate(snapshot.id, "EUR", "USD", 1.25).unwrap();
        assert_eq!(store.get_fx_rate(snapshot.id, "EUR", "USD").unwrap(), Some(1.25));
        let inverse = store.get_fx_rate(snapshot.id, "USD", "EUR").unwrap().unwrap();
        assert!((inverse - 0.8).abs() < 1e-9);
        // No GBP rate: the lookup yields None, never 1.0.
        assert_eq!(store.get_fx_rate(snapshot.id, "GBP", "EUR").unwrap(), None);
        assert_eq!(store.get_fx_rate(snapshot.id, "EUR", "EUR").unwrap(), Some(1.0));
    }

    #[test]
    fn test_fx_rates_immutable_once_stored() {
        let (store, snapshot) = store_with_snapshot();
        store.insert_fx_rate(snapshot.id, "USD", "EUR", 0.9).unwrap();
        let err = store.insert_fx_rate(snapshot.id, "USD", "EUR", 0.95).unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }

    #[test]
    fn test_policy_entity_specific_beats_global() {
        let (store, _snapshot) = store_with_snapshot();
        store
            .upsert_matching_policy(&MatchingPolicy {
                entity_id: None,
                currency: "EUR".to_string(),
                amount_tolerance: 0.05,
                ..MatchingPolicy::default()
            })
            .unwrap();
        store
            .upsert_matching_policy(&MatchingPolicy {
                entity_id: Some(1),
                currency: "EUR".to_string(),
                amount_tolerance: 0.01,
                ..MatchingPolicy::default()
            })
            .unwrap();
        let policy = store.get_matching_policy(Some(1), "EUR").unwrap();
        assert!((policy.amount_tolerance - 0.01).abs() < 1e-9);
        let fallback = store.get_matching_policy(Some(99), "EUR").unwrap();
        assert!((fallback.amount_tolerance - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_allocation_approval_totals() {
        let (store, snapshot) = store_with_snapshot();
        let invoice_id = store
            .insert_invoice(
                snapshot.id,
                &NewInvoice {
                    canonical_id: "inv-1".to_string(),
                    document_number: "INV-1".to_string(),
                    document_type: "INV".to_string(),
                    amount: 1000.0,
                    currency: "EUR".to_string(),
                    due_date: Some(d("2026-02-01")),
                    ..Default::default()
                },
            )
            .unwrap();
        let txn_id = store
            .insert_bank_transaction(
                snapshot.id,
                &NewBankTransaction {
                    bank_account_id: "ACC".to_string(),
                    transaction_date: Some(d("2026-02-02")),
                    amount: 400.0,
                    currency: "EUR".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        let alloc_id = store
            .insert_allocation(
                snapshot.id,
                &NewAllocation {
                    bank_transaction_id: txn_id,
                    invoice_id: Some(invoice_id),
                    vendor_bill_id: None,
                    allocated_amount: 400.0,
                    writeoff_amount: 0.0,
                    match_tier: 3,
                    confidence: 0.65,
                    status: MatchStatus::PendingApproval,
                    approved_by: None,
                },
            )
            .unwrap();
        assert_eq!(store.approved_allocation_total(invoice_id).unwrap(), 0.0);
        store
            .set_allocation_status(alloc_id, MatchStatus::Reconciled, Some("cfo"))
            .unwrap();
        assert!((store.approved_allocation_total(invoice_id).unwrap() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_audit_mutations_after() {
        let (store, snapshot) = store_with_snapshot();
        let before = Utc::now() - chrono::Duration::seconds(10);
        store
            .append_audit(
                "alice",
                "regular",
                "Update",
                "exception",
                Some(1),
                Some(snapshot.id),
                None,
                None,
                None,
            )
            .unwrap();
        assert_eq!(store.mutations_after(snapshot.id, before).unwrap().len(), 1);
        assert_eq!(
            store
                .mutations_after(snapshot.id, Utc::now() + chrono::Duration::seconds(10))
                .unwrap()
                .len(),
            0
        );
    }
}
