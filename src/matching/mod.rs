//! Reconciliation matching engine.
//!
//! Classifies every unreconciled inflow into a tier, allocates amounts under
//! conservation and no-overmatch constraints, and persists the result.
//! Tier 3 (suggested) allocations are stored PENDING_APPROVAL and never move
//! a transaction to reconciled without an explicit human approval.

pub mod index;
pub mod solver;

use crate::error::{DomainError, Result};
use crate::models::{
    BankTransaction, Invoice, MatchStatus, MatchingPolicy, ReconciliationType, Role,
};
use crate::store::canonical::NewAllocation;
use crate::store::Store;
use crate::workflow::assert_snapshot_not_locked;
use index::{extract_refs, normalize_counterparty, BlockingIndex};
use serde::{Deserialize, Serialize};
use solver::{AllocationSolution, SolverCandidate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// CANDIDATES
// =============================================================================

/// A scored candidate match between one transaction and one invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub invoice_id: i64,
    pub invoice_number: String,
    pub customer: String,
    pub open_amount: f64,
    pub confidence: f64,
    pub tier: u8,
    pub ref_match: bool,
    pub amount_match: bool,
    pub date_match: bool,
    pub match_reasons: Vec<String>,
}

/// Outcome tag for one processed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnOutcome {
    Deterministic,
    Rule,
    ManyToMany,
    Suggested,
    Manual,
    SkippedOutflow,
}

/// Aggregate result of one matching pass over a snapshot.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MatchRunSummary {
    pub processed: usize,
    pub deterministic: usize,
    pub rule: usize,
    pub many_to_many: usize,
    pub suggested: usize,
    pub manual: usize,
    pub skipped_outflows: usize,
    pub cash_explained_pct: f64,
}

/// Cash Explained % — the north-star trust KPI for a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashExplained {
    pub snapshot_id: i64,
    pub total_bank_inflows: f64,
    pub matched_amount: f64,
    pub unmatched_amount: f64,
    pub cash_explained_pct: f64,
    pub status: String,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct MatchingEngine {
    store: Arc<Store>,
}

impl MatchingEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Run a full matching pass over every unreconciled transaction of a
    /// snapshot. Holds the snapshot write lock for the duration.
    pub fn run_snapshot(&self, snapshot_id: i64) -> Result<MatchRunSummary> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        let lock = self.store.snapshot_write_lock(snapshot_id);
        let _held = lock.lock();

        let entity = self.store.get_entity(snapshot.entity_id)?;
        let policy = self
            .store
            .get_matching_policy(Some(entity.id), &entity.base_currency)?;

        let index = self.build_index(snapshot_id)?;
        info!(
            snapshot_id,
            open_invoices = index.len(),
            "matching pass started"
        );

        let mut summary = MatchRunSummary::default();
        for txn in self.store.list_unreconciled_transactions(snapshot_id)? {
            let outcome = self.reconcile_transaction(&txn, &index, &policy)?;
            summary.processed += 1;
            match outcome {
                TxnOutcome::Deterministic => summary.deterministic += 1,
                TxnOutcome::Rule => summary.rule += 1,
                TxnOutcome::ManyToMany => summary.many_to_many += 1,
                TxnOutcome::Suggested => summary.suggested += 1,
                TxnOutcome::Manual => summary.manual += 1,
                TxnOutcome::SkippedOutflow => summary.skipped_outflows += 1,
            }
        }

        let kpi = self.cash_explained(snapshot_id)?;
        self.store.set_cash_explained(snapshot_id, kpi.cash_explained_pct)?;
        summary.cash_explained_pct = kpi.cash_explained_pct;
        info!(
            snapshot_id,
            deterministic = summary.deterministic,
            rule = summary.rule,
            suggested = summary.suggested,
            manual = summary.manual,
            cash_explained = summary.cash_explained_pct,
            "matching pass finished"
        );
        Ok(summary)
    }

    fn build_index(&self, snapshot_id: i64) -> Result<BlockingIndex> {
        let mut entries = Vec::new();
        for invoice in self.store.list_open_invoices(snapshot_id)? {
            let approved = self.store.approved_allocation_total(invoice.id)?;
            entries.push((invoice, approved));
        }
        Ok(BlockingIndex::build(entries))
    }

    fn reconcile_transaction(
        &self,
        txn: &BankTransaction,
        index: &BlockingIndex,
        policy: &MatchingPolicy,
    ) -> Result<TxnOutcome> {
        // AR matching only consumes inflows.
        if txn.amount < 0.0 {
            return Ok(TxnOutcome::SkippedOutflow);
        }

        let candidates = self.generate_candidates(txn, index, policy);
        if candidates.is_empty() {
            self.store
                .mark_transaction_pending(txn.id, ReconciliationType::Manual, None)?;
            return Ok(TxnOutcome::Manual);
        }

        let best = &candidates[0];
        debug!(
            txn_id = txn.id,
            candidates = candidates.len(),
            best_tier = best.tier,
            best_confidence = best.confidence,
            "scored candidates"
        );

        // Tier 1: auto-apply the best single candidate when the policy
        // allows and it alone satisfies conservation.
        if best.tier == 1 && policy.auto_apply_tier1 {
            let single = solver::solve(
                txn.amount,
                &[SolverCandidate {
                    invoice_id: best.invoice_id,
                    open_amount: best.open_amount,
                    confidence: best.confidence,
                }],
                txn.fee_amount,
                0.0,
            );
            if single.is_complete() {
                self.apply_solution(txn, &candidates, &single, ReconciliationType::Deterministic)?;
                return Ok(TxnOutcome::Deterministic);
            }
        }

        // Tier 2 single match under policy auto-apply.
        if best.tier == 2
            && policy.auto_apply_tier2
            && best.confidence >= policy.tier2_min_confidence
        {
            let single = solver::solve(
                txn.amount,
                &[SolverCandidate {
                    invoice_id: best.invoice_id,
                    open_amount: best.open_amount,
                    confidence: best.confidence,
                }],
                txn.fee_amount,
                0.0,
            );
            if single.is_complete() {
                self.apply_solution(txn, &candidates, &single, ReconciliationType::Rule)?;
                return Ok(TxnOutcome::Rule);
            }
        }

        // Bundled payments: several deterministic- or rule-shaped
        // candidates, solved together. Suggested-grade candidates never
        // enter this pool.
        let strong: Vec<&MatchCandidate> = candidates
            .iter()
            .filter(|c| {
                c.ref_match
                    || (c.amount_match
                        && c.date_match
                        && c.confidence >= policy.tier2_min_confidence)
            })
            .collect();
        if strong.len() >= 2 {
            let solver_input: Vec<SolverCandidate> = strong
                .iter()
                .map(|c| SolverCandidate {
                    invoice_id: c.invoice_id,
                    open_amount: c.open_amount,
                    confidence: c.confidence,
                })
                .collect();
            let solution = solver::solve(txn.amount, &solver_input, txn.fee_amount, 0.0);
            if solution.is_complete() && solution.allocations.len() > 1 {
                // Driving tier: deterministic only when every allocated
                // invoice was reference-matched.
                let driving = if solution.allocations.keys().all(|id| {
                    strong
                        .iter()
                        .find(|c| c.invoice_id == *id)
                        .map(|c| c.ref_match)
                        .unwrap_or(false)
                }) {
                    ReconciliationType::Deterministic
                } else {
                    ReconciliationType::Rule
                };
                let applies = match driving {
                    ReconciliationType::Deterministic => policy.auto_apply_tier1,
                    _ => policy.auto_apply_tier2,
                };
                if applies {
                    self.apply_solution(txn, &candidates, &solution, driving)?;
                    return Ok(TxnOutcome::ManyToMany);
                }
            }
        }

        // Tier 3: persist suggestions, pending approval. The transaction
        // stays unreconciled until a human acts.
        if best.confidence >= policy.tier3_min_confidence {
            let solution = solver::solve(
                txn.amount,
                &candidates
                    .iter()
                    .map(|c| SolverCandidate {
                        invoice_id: c.invoice_id,
                        open_amount: c.open_amount,
                        confidence: c.confidence,
                    })
                    .collect::<Vec<_>>(),
                txn.fee_amount,
                0.0,
            );
            for (invoice_id, amount) in &solution.allocations {
                let cand = candidates
                    .iter()
                    .find(|c| c.invoice_id == *invoice_id)
                    .expect("allocation for unknown candidate");
                self.store.insert_allocation(
                    txn.snapshot_id,
                    &NewAllocation {
                        bank_transaction_id: txn.id,
                        invoice_id: Some(*invoice_id),
                        vendor_bill_id: None,
                        allocated_amount: *amount,
                        writeoff_amount: 0.0,
                        match_tier: 3,
                        confidence: cand.confidence,
                        status: MatchStatus::PendingApproval,
                        approved_by: None,
                    },
                )?;
            }
            self.store.mark_transaction_pending(
                txn.id,
                ReconciliationType::Suggested,
                Some(best.confidence),
            )?;
            return Ok(TxnOutcome::Suggested);
        }

        self.store
            .mark_transaction_pending(txn.id, ReconciliationType::Manual, None)?;
        Ok(TxnOutcome::Manual)
    }

    /// Score candidates for one transaction, ordered best-first.
    pub fn generate_candidates(
        &self,
        txn: &BankTransaction,
        index: &BlockingIndex,
        policy: &MatchingPolicy,
    ) -> Vec<MatchCandidate> {
        let text = [
            txn.reference.as_deref().unwrap_or(""),
            txn.counterparty.as_deref().unwrap_or(""),
        ]
        .join(" ");
        let refs = extract_refs(&text);

        let ids = index.query(
            txn.amount,
            txn.counterparty.as_deref(),
            Some(txn.transaction_date),
            &refs,
            policy.amount_tolerance,
            policy.date_window_days,
        );

        let mut candidates = Vec::new();
        for id in ids {
            let Some(entry) = index.get(id) else { continue };
            if entry.open_amount <= 0.01 {
                continue;
            }
            candidates.push(score_candidate(txn, &entry.invoice, entry.open_amount, &refs, policy));
        }

        candidates.sort_by(|a, b| {
            a.tier
                .cmp(&b.tier)
                .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.invoice_id.cmp(&b.invoice_id))
        });
        candidates
    }

    /// Persist a validated solution as RECONCILED allocations.
    fn apply_solution(
        &self,
        txn: &BankTransaction,
        candidates: &[MatchCandidate],
        solution: &AllocationSolution,
        recon_type: ReconciliationType,
    ) -> Result<()> {
        let opens: BTreeMap<i64, f64> = candidates
            .iter()
            .map(|c| (c.invoice_id, c.open_amount))
            .collect();
        if let Err(violation) = solver::validate(solution, txn.amount, &opens) {
            warn!(txn_id = txn.id, %violation, "allocation validation failed");
            self.store.insert_exception(
                txn.snapshot_id,
                "allocation_validation",
                crate::models::Severity::Error,
                &format!("Allocation rejected for transaction {}: {violation}", txn.id),
                Some(txn.amount),
                Some(&txn.currency),
                &[crate::models::EvidenceRef::new("bank_txn", txn.id)],
            )?;
            return Err(DomainError::State(violation));
        }

        let mut min_confidence: f64 = 1.0;
        for (invoice_id, amount) in &solution.allocations {
            let cand = candidates
                .iter()
                .find(|c| c.invoice_id == *invoice_id)
                .expect("allocation for unknown candidate");
            min_confidence = min_confidence.min(cand.confidence);
            self.store.insert_allocation(
                txn.snapshot_id,
                &NewAllocation {
                    bank_transaction_id: txn.id,
                    invoice_id: Some(*invoice_id),
                    vendor_bill_id: None,
                    allocated_amount: *amount,
                    writeoff_amount: 0.0,
                    match_tier: recon_type.tier(),
                    confidence: cand.confidence,
                    status: MatchStatus::Reconciled,
                    approved_by: Some("system".to_string()),
                },
            )?;
            self.store.set_invoice_truth_label(*invoice_id, "reconciled")?;
        }
        self.store
            .mark_transaction_reconciled(txn.id, recon_type, min_confidence)?;
        self.store.append_audit(
            "system",
            Role::Regular.as_str(),
            "Create",
            "reconciliation_allocation",
            Some(txn.id),
            Some(txn.snapshot_id),
            Some(&serde_json::json!({ "allocations": solution.allocations }).to_string()),
            None,
            None,
        )?;
        Ok(())
    }

    /// Cash Explained % = approved allocations / positive inflows * 100.
    pub fn cash_explained(&self, snapshot_id: i64) -> Result<CashExplained> {
        let total_inflows: f64 = self
            .store
            .list_bank_transactions(snapshot_id)?
            .iter()
            .filter(|t| t.amount > 0.0)
            .map(|t| t.amount)
            .sum();
        let matched: f64 = self
            .store
            .list_allocations_for_snapshot(snapshot_id)?
            .iter()
            .filter(|a| a.status == MatchStatus::Reconciled)
            .map(|a| a.allocated_amount)
            .sum();

        let pct = if total_inflows > 0.0 {
            ((matched / total_inflows) * 100.0).clamp(0.0, 100.0)
        } else {
            // No bank data means nothing is unexplained.
            100.0
        };
        let status = if pct >= 95.0 {
            "healthy"
        } else if pct >= 80.0 {
            "warning"
        } else {
            "critical"
        };
        Ok(CashExplained {
            snapshot_id,
            total_bank_inflows: total_inflows,
            matched_amount: matched,
            unmatched_amount: total_inflows - matched,
            cash_explained_pct: (pct * 100.0).round() / 100.0,
            status: status.to_string(),
        })
    }
}

// =============================================================================
// SCORING
// =============================================================================

/// Additive confidence scoring in [0, 1].
fn score_candidate(
    txn: &BankTransaction,
    invoice: &Invoice,
    open_amount: f64,
    txn_refs: &[String],
    policy: &MatchingPolicy,
) -> MatchCandidate {
    let mut confidence: f64 = 0.0;
    let mut reasons = Vec::new();

    // Reference containment, either direction.
    let invoice_number_upper = invoice.document_number.to_uppercase();
    let ref_match = txn_refs.iter().any(|token| {
        let token_upper = token.to_uppercase();
        invoice_number_upper.contains(&token_upper) || token_upper.contains(&invoice_number_upper)
    });
    if ref_match {
        confidence += 0.5;
        reasons.push("reference match".to_string());
    }

    // Amount proximity.
    let mut amount_match = false;
    if invoice.amount != 0.0 {
        let rel_diff = (txn.amount.abs() - invoice.amount.abs()).abs() / invoice.amount.abs();
        if rel_diff <= policy.amount_tolerance {
            amount_match = true;
            confidence += 0.3;
            reasons.push(format!(
                "amount within {:.1}% tolerance",
                policy.amount_tolerance * 100.0
            ));
        } else if rel_diff <= policy.amount_tolerance * 10.0 {
            confidence += 0.2;
            reasons.push("amount within extended tolerance".to_string());
        }
    }

    // Counterparty.
    if let (Some(txn_name), Some(customer)) = (&txn.counterparty, &invoice.customer) {
        let a = normalize_counterparty(txn_name);
        let b = normalize_counterparty(customer);
        if !a.is_empty() && a == b {
            confidence += 0.15;
            reasons.push("counterparty match".to_string());
        } else if !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a)) {
            confidence += 0.08;
            reasons.push("partial counterparty match".to_string());
        }
    }

    // Date proximity to the due date.
    let mut date_match = false;
    if let Some(due) = invoice.due_date {
        let days = (txn.transaction_date - due).num_days().abs();
        if days <= policy.date_window_days {
            date_match = true;
        }
        if days <= 3 {
            confidence += 0.1;
            reasons.push("paid within 3 days of due".to_string());
        } else if days <= policy.date_window_days {
            confidence += 0.05;
            reasons.push("paid within date window".to_string());
        }
    }

    // An exact amount landing inside the date window is a strong signal
    // even without a reference token; floor it into the suggested band.
    if amount_match && date_match {
        confidence = confidence.max(0.70);
    }

    let confidence = confidence.min(1.0);
    let tier = if ref_match && confidence >= 0.95 {
        1
    } else if amount_match && date_match && confidence >= policy.tier2_min_confidence {
        2
    } else if confidence >= policy.tier3_min_confidence {
        3
    } else {
        4
    };

    MatchCandidate {
        invoice_id: invoice.id,
        invoice_number: invoice.document_number.clone(),
        customer: invoice.customer.clone().unwrap_or_default(),
        open_amount,
        confidence,
        tier,
        ref_match,
        amount_match,
        date_match,
        match_reasons: reasons,
    }
}

// =============================================================================
// APPROVAL WORKFLOW
// =============================================================================

impl MatchingEngine {
    /// Approve a suggested match. Locked-snapshot check runs first; the
    /// allocation must still be pending. Any role may approve.
    pub fn approve_match(
        &self,
        allocation_id: i64,
        actor: &str,
        role: Role,
    ) -> Result<()> {
        let allocation = self.store.get_allocation(allocation_id)?;
        let snapshot = self.store.get_snapshot(allocation.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;

        if allocation.status != MatchStatus::PendingApproval {
            return Err(DomainError::State(format!(
                "Allocation {allocation_id} is {}, expected PENDING_APPROVAL",
                allocation.status.as_str()
            )));
        }

        let lock = self.store.snapshot_write_lock(snapshot.id);
        let _held = lock.lock();

        self.store
            .set_allocation_status(allocation_id, MatchStatus::Reconciled, Some(actor))?;
        let txn = self.store.get_bank_transaction(allocation.bank_transaction_id)?;
        self.store.mark_transaction_reconciled(
            txn.id,
            ReconciliationType::Suggested,
            allocation.confidence,
        )?;
        if let Some(invoice_id) = allocation.invoice_id {
            self.store.set_invoice_truth_label(invoice_id, "reconciled")?;
        }
        self.store.append_audit(
            actor,
            role.as_str(),
            "Approve",
            "reconciliation_allocation",
            Some(allocation_id),
            Some(snapshot.id),
            Some(
                &serde_json::json!({
                    "status": { "old": "PENDING_APPROVAL", "new": "RECONCILED" }
                })
                .to_string(),
            ),
            None,
            None,
        )?;

        let kpi = self.cash_explained(snapshot.id)?;
        self.store.set_cash_explained(snapshot.id, kpi.cash_explained_pct)?;
        Ok(())
    }

    /// Reject a suggested match. The transaction remains unreconciled.
    pub fn reject_match(&self, allocation_id: i64, actor: &str, role: Role) -> Result<()> {
        let allocation = self.store.get_allocation(allocation_id)?;
        let snapshot = self.store.get_snapshot(allocation.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;

        if allocation.status != MatchStatus::PendingApproval {
            return Err(DomainError::State(format!(
                "Allocation {allocation_id} is {}, expected PENDING_APPROVAL",
                allocation.status.as_str()
            )));
        }

        self.store
            .set_allocation_status(allocation_id, MatchStatus::Rejected, Some(actor))?;
        self.store
            .mark_transaction_pending(allocation.bank_transaction_id, ReconciliationType::None, None)?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Reject",
            "reconciliation_allocation",
            Some(allocation_id),
            Some(snapshot.id),
            None,
            None,
            None,
        )?;
        Ok(())
    }
}
