//! Exception lifecycle: OPEN -> IN_REVIEW (on assign) -> RESOLVED |
//! ESCALATED | WONT_FIX.

use super::assert_snapshot_not_locked;
use crate::error::{DomainError, Result};
use crate::models::{EvidenceRef, Exception, ExceptionStatus, Role, Severity};
use crate::store::Store;
use chrono::{Duration, Utc};
use std::sync::Arc;

/// Default SLA window applied at assignment.
const DEFAULT_SLA_HOURS: i64 = 24;

fn valid_transition(from: ExceptionStatus, to: ExceptionStatus) -> bool {
    use ExceptionStatus::*;
    matches!(
        (from, to),
        (Open, InReview)
            | (InReview, Resolved)
            | (InReview, Escalated)
            | (InReview, WontFix)
            | (Escalated, Resolved)
            | (Escalated, WontFix)
    )
}

pub struct ExceptionWorkflow {
    store: Arc<Store>,
}

impl ExceptionWorkflow {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn raise(
        &self,
        snapshot_id: i64,
        exception_type: &str,
        severity: Severity,
        title: &str,
        amount: Option<f64>,
        currency: Option<&str>,
        evidence: &[EvidenceRef],
        actor: &str,
        role: Role,
    ) -> Result<Exception> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        let id = self.store.insert_exception(
            snapshot_id,
            exception_type,
            severity,
            title,
            amount,
            currency,
            evidence,
        )?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Create",
            "exception",
            Some(id),
            Some(snapshot_id),
            None,
            None,
            None,
        )?;
        self.store.get_exception(id)
    }

    /// Assign and move to IN_REVIEW, starting the SLA clock.
    pub fn assign(
        &self,
        exception_id: i64,
        assignee: &str,
        actor: &str,
        role: Role,
    ) -> Result<Exception> {
        let exception = self.store.get_exception(exception_id)?;
        let snapshot = self.store.get_snapshot(exception.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        if !valid_transition(exception.status, ExceptionStatus::InReview) {
            return Err(DomainError::State(format!(
                "Exception {exception_id} is {}, cannot assign",
                exception.status.as_str()
            )));
        }

        self.store.update_exception(
            exception_id,
            ExceptionStatus::InReview,
            Some(assignee),
            Some(actor),
            Some(Utc::now() + Duration::hours(DEFAULT_SLA_HOURS)),
            None,
            None,
        )?;
        self.audit_transition(&exception, ExceptionStatus::InReview, actor, role)?;
        self.store.get_exception(exception_id)
    }

    /// Resolution requires a type and a note.
    pub fn resolve(
        &self,
        exception_id: i64,
        resolution_type: &str,
        resolution_note: &str,
        actor: &str,
        role: Role,
    ) -> Result<Exception> {
        if resolution_type.trim().is_empty() || resolution_note.trim().is_empty() {
            return Err(DomainError::Input(
                "Resolving an exception requires a resolution type and note".to_string(),
            ));
        }
        let exception = self.store.get_exception(exception_id)?;
        let snapshot = self.store.get_snapshot(exception.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        if !valid_transition(exception.status, ExceptionStatus::Resolved) {
            return Err(DomainError::State(format!(
                "Exception {exception_id} is {}, cannot resolve",
                exception.status.as_str()
            )));
        }

        self.store.update_exception(
            exception_id,
            ExceptionStatus::Resolved,
            None,
            None,
            None,
            Some(resolution_type),
            Some(resolution_note),
        )?;
        self.audit_transition(&exception, ExceptionStatus::Resolved, actor, role)?;
        self.store.get_exception(exception_id)
    }

    pub fn escalate(&self, exception_id: i64, actor: &str, role: Role) -> Result<Exception> {
        self.transition(exception_id, ExceptionStatus::Escalated, actor, role)
    }

    pub fn wont_fix(&self, exception_id: i64, actor: &str, role: Role) -> Result<Exception> {
        self.transition(exception_id, ExceptionStatus::WontFix, actor, role)
    }

    fn transition(
        &self,
        exception_id: i64,
        to: ExceptionStatus,
        actor: &str,
        role: Role,
    ) -> Result<Exception> {
        let exception = self.store.get_exception(exception_id)?;
        let snapshot = self.store.get_snapshot(exception.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        if !valid_transition(exception.status, to) {
            return Err(DomainError::State(format!(
                "Exception {exception_id}: {} -> {} is not allowed",
                exception.status.as_str(),
                to.as_str()
            )));
        }
        self.store
            .update_exception(exception_id, to, None, None, None, None, None)?;
        self.audit_transition(&exception, to, actor, role)?;
        self.store.get_exception(exception_id)
    }

    /// Flag intercompany traffic: invoices whose customer is another
    /// managed entity, and postings whose counterparty text carries one of
    /// the entity's own internal account identifiers.
    pub fn flag_intercompany(
        &self,
        snapshot_id: i64,
        actor: &str,
        role: Role,
    ) -> Result<Vec<Exception>> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        let entity_names: Vec<String> = self
            .store
            .list_entities()?
            .into_iter()
            .map(|e| e.name.to_lowercase())
            .collect();
        let own = self.store.get_entity(snapshot.entity_id)?;

        let mut raised = Vec::new();
        for inv in self.store.list_invoices(snapshot_id)? {
            let Some(customer) = &inv.customer else { continue };
            if entity_names.contains(&customer.to_lowercase()) {
                raised.push(self.raise(
                    snapshot_id,
                    "intercompany",
                    Severity::Info,
                    &format!(
                        "Intercompany invoice {} billed to {customer}",
                        inv.document_number
                    ),
                    Some(inv.amount),
                    Some(&inv.currency),
                    &[EvidenceRef::new("invoice", inv.id)],
                    actor,
                    role,
                )?);
            }
        }
        for txn in self.store.list_bank_transactions(snapshot_id)? {
            let counterparty = txn.counterparty.clone().unwrap_or_default();
            let hit = own
                .internal_accounts
                .iter()
                .any(|account| !account.is_empty() && counterparty.contains(account.as_str()));
            if hit {
                raised.push(self.raise(
                    snapshot_id,
                    "intercompany",
                    Severity::Info,
                    &format!("Bank posting {} moves cash between own accounts", txn.id),
                    Some(txn.amount),
                    Some(&txn.currency),
                    &[EvidenceRef::new("bank_txn", txn.id)],
                    actor,
                    role,
                )?);
            }
        }
        Ok(raised)
    }

    fn audit_transition(
        &self,
        exception: &Exception,
        to: ExceptionStatus,
        actor: &str,
        role: Role,
    ) -> Result<()> {
        self.store.append_audit(
            actor,
            role.as_str(),
            "Update",
            "exception",
            Some(exception.id),
            Some(exception.snapshot_id),
            Some(
                &serde_json::json!({
                    "status": { "old": exception.status.as_str(), "new": to.as_str() }
                })
                .to_string(),
            ),
            None,
            None,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<Store>, ExceptionWorkflow, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        let workflow = ExceptionWorkflow::new(store.clone());
        (store, workflow, snapshot.id)
    }

    fn raise(workflow: &ExceptionWorkflow, snapshot_id: i64) -> Exception {
        workflow
            .raise(
                snapshot_id,
                "duplicate_payment",
                Severity::Warning,
                "Possible double posting",
                Some(1200.0),
                Some("EUR"),
                &[EvidenceRef::new("bank_txn", 7)],
                "system",
                Role::Regular,
            )
            .unwrap()
    }

    #[test]
    fn test_assign_sets_sla_and_state() {
        let (_store, workflow, snapshot_id) = setup();
        let exception = raise(&workflow, snapshot_id);
        assert_eq!(exception.status, ExceptionStatus::Open);

        let assigned = workflow
            .assign(exception.id, "maria", "lead", Role::Regular)
            .unwrap();
        assert_eq!(assigned.status, ExceptionStatus::InReview);
        assert_eq!(assigned.assignee.as_deref(), Some("maria"));
        assert_eq!(assigned.assigned_by.as_deref(), Some("lead"));
        assert!(assigned.sla_due_at.is_some());
    }

    #[test]
    fn test_resolve_requires_note() {
        let (_store, workflow, snapshot_id) = setup();
        let exception = raise(&workflow, snapshot_id);
        workflow
            .assign(exception.id, "maria", "lead", Role::Regular)
            .unwrap();
        let err = workflow
            .resolve(exception.id, "", "", "maria", Role::Regular)
            .unwrap_err();
        assert_eq!(err.code(), "INPUT_ERROR");

        let resolved = workflow
            .resolve(
                exception.id,
                "writeoff",
                "Cleared against credit note CN-7",
                "maria",
                Role::Regular,
            )
            .unwrap();
        assert_eq!(resolved.status, ExceptionStatus::Resolved);
        assert_eq!(resolved.resolution_type.as_deref(), Some("writeoff"));
    }

    #[test]
    fn test_cannot_resolve_open_exception_directly() {
        let (_store, workflow, snapshot_id) = setup();
        let exception = raise(&workflow, snapshot_id);
        let err = workflow
            .resolve(exception.id, "fix", "done", "maria", Role::Regular)
            .unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }

    #[test]
    fn test_escalate_then_resolve() {
        let (_store, workflow, snapshot_id) = setup();
        let exception = raise(&workflow, snapshot_id);
        workflow
            .assign(exception.id, "maria", "lead", Role::Regular)
            .unwrap();
        let escalated = workflow
            .escalate(exception.id, "maria", Role::Regular)
            .unwrap();
        assert_eq!(escalated.status, ExceptionStatus::Escalated);
        workflow
            .resolve(exception.id, "vendor_credit", "Vendor confirmed credit", "cfo", Role::LockCapable)
            .unwrap();
    }

    #[test]
    fn test_flag_intercompany_by_name_and_account() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store
            .create_entity("Acme GmbH", "EUR", 3, &["DE89370400440532013000".to_string()])
            .unwrap();
        store.create_entity("Acme France SA", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        let workflow = ExceptionWorkflow::new(store.clone());

        store
            .insert_invoice(
                snapshot.id,
                &crate::store::canonical::NewInvoice {
                    canonical_id: "ic-1".to_string(),
                    document_number: "INV-IC-1".to_string(),
                    document_type: "INV".to_string(),
                    customer: Some("Acme France SA".to_string()),
                    amount: 7500.0,
                    currency: "EUR".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .insert_bank_transaction(
                snapshot.id,
                &crate::store::canonical::NewBankTransaction {
                    bank_account_id: "ACC".to_string(),
                    transaction_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 15),
                    amount: 500.0,
                    currency: "EUR".to_string(),
                    counterparty: Some("Transfer from DE89370400440532013000".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let raised = workflow
            .flag_intercompany(snapshot.id, "system", Role::Regular)
            .unwrap();
        assert_eq!(raised.len(), 2);
        assert!(raised.iter().all(|e| e.exception_type == "intercompany"));
    }

    #[test]
    fn test_locked_snapshot_blocks_exception_writes() {
        let (store, workflow, snapshot_id) = setup();
        let exception = raise(&workflow, snapshot_id);
        store
            .update_snapshot_status(
                snapshot_id,
                crate::models::SnapshotStatus::Locked,
                Some("cfo"),
                Some("close"),
                None,
            )
            .unwrap();
        let err = workflow
            .assign(exception.id, "maria", "lead", Role::Regular)
            .unwrap_err();
        assert_eq!(err.to_string(), "state error: Cannot modify locked snapshot");
    }
}
