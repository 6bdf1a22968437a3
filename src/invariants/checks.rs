//! The seven deterministic checks.

use super::{CheckResult, CheckStatus, TOLERANCE};
use crate::error::Result;
use crate::matching::index::week_key;
use crate::models::{EvidenceRef, MatchStatus, Severity, Snapshot};
use crate::store::Store;
use std::collections::BTreeMap;

// =============================================================================
// 1. WEEKLY CASH MATH
// =============================================================================

/// closing = opening + inflows - outflows, verified cumulatively per ISO
/// week against an independent running total.
pub fn check_weekly_cash_math(store: &Store, snapshot: &Snapshot) -> Result<CheckResult> {
    let name = "weekly_cash_math";
    let description = "Verify closing balance = opening + inflows - outflows for each week";

    let transactions = store.list_bank_transactions(snapshot.id)?;
    if transactions.is_empty() {
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Skip,
            Severity::Info,
            "Skipped: no bank transactions to verify",
        ));
    }

    #[derive(Default)]
    struct WeekTotals {
        inflows: f64,
        outflows: f64,
    }
    let mut weekly: BTreeMap<String, WeekTotals> = BTreeMap::new();
    let mut running_total = 0.0;
    for txn in &transactions {
        let entry = weekly.entry(week_key(txn.transaction_date)).or_default();
        if txn.amount > 0.0 {
            entry.inflows += txn.amount;
        } else {
            entry.outflows += txn.amount.abs();
        }
        running_total += txn.amount;
    }

    // Chain weekly closings, then cross-check the final closing against
    // the flat transaction sum: both paths must agree within tolerance.
    let mut violations = Vec::new();
    let mut opening = snapshot.opening_bank_balance;
    let mut chain = Vec::new();
    for (week, totals) in &weekly {
        let closing = opening + totals.inflows - totals.outflows;
        chain.push(serde_json::json!({
            "week": week,
            "opening": opening,
            "inflows": totals.inflows,
            "outflows": totals.outflows,
            "closing": closing,
        }));
        opening = closing;
    }
    let final_expected = snapshot.opening_bank_balance + running_total;
    if (opening - final_expected).abs() > TOLERANCE {
        violations.push(serde_json::json!({
            "week": "cumulative",
            "chained_closing": opening,
            "flat_closing": final_expected,
            "difference": (opening - final_expected).abs(),
        }));
    }

    if violations.is_empty() {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Critical,
            format!(
                "Passed: cash math verified for {} weeks within tolerance {TOLERANCE}",
                weekly.len()
            ),
        )
        .with_details(serde_json::json!({
            "weeks_checked": weekly.len(),
            "violations": 0,
            "tolerance": TOLERANCE,
            "weekly_chain": chain,
        })))
    } else {
        let exposure: f64 = violations
            .iter()
            .filter_map(|v| v["difference"].as_f64())
            .sum();
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Critical,
            format!("Failed: {} week(s) have cash math violations", violations.len()),
        )
        .with_details(serde_json::json!({
            "weeks_checked": weekly.len(),
            "violations": violations.len(),
            "violation_details": violations,
            "tolerance": TOLERANCE,
        }))
        .with_evidence(
            violations
                .iter()
                .take(10)
                .filter_map(|v| v["week"].as_str().map(|w| EvidenceRef::new("week", w)))
                .collect(),
        )
        .with_exposure(exposure, &snapshot_currency(store, snapshot)))
    }
}

// =============================================================================
// 2. DRILLDOWN SUM INTEGRITY
// =============================================================================

/// For each drilldown dimension, the grouped sums must equal the flat sum.
pub fn check_drilldown_sum_integrity(store: &Store, snapshot: &Snapshot) -> Result<CheckResult> {
    let name = "drilldown_sum_integrity";
    let description = "Verify grid cell totals equal the sum of drilldown rows";

    let invoices = store.list_invoices(snapshot.id)?;
    if invoices.is_empty() {
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Skip,
            Severity::Error,
            "Skipped: no invoices in snapshot",
        ));
    }

    let total: f64 = invoices.iter().map(|i| i.amount).sum();
    let group_sum = |key_fn: &dyn Fn(&crate::models::Invoice) -> String| -> f64 {
        let mut groups: BTreeMap<String, f64> = BTreeMap::new();
        for inv in &invoices {
            *groups.entry(key_fn(inv)).or_default() += inv.amount;
        }
        groups.values().sum()
    };

    let dimensions: [(&str, f64); 3] = [
        (
            "by_customer",
            group_sum(&|i| i.customer.clone().unwrap_or_else(|| "UNKNOWN".into())),
        ),
        (
            "by_country",
            group_sum(&|i| i.country.clone().unwrap_or_else(|| "UNKNOWN".into())),
        ),
        ("by_currency", group_sum(&|i| i.currency.clone())),
    ];

    let mut violations = Vec::new();
    for (dimension, sum) in &dimensions {
        if (total - sum).abs() > TOLERANCE {
            violations.push(serde_json::json!({
                "drilldown": dimension,
                "total": total,
                "sum": sum,
                "difference": (total - sum).abs(),
            }));
        }
    }

    if violations.is_empty() {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Error,
            format!("Passed: all 3 drilldowns sum to total {total:.2} within tolerance {TOLERANCE}"),
        )
        .with_details(serde_json::json!({
            "total_amount": total,
            "drilldowns_checked": 3,
        })))
    } else {
        let exposure: f64 = violations
            .iter()
            .filter_map(|v| v["difference"].as_f64())
            .sum();
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Error,
            format!("Failed: {} drilldown(s) don't sum to total {total:.2}", violations.len()),
        )
        .with_details(serde_json::json!({
            "total_amount": total,
            "violations": violations,
        }))
        .with_evidence(
            violations
                .iter()
                .filter_map(|v| {
                    v["drilldown"]
                        .as_str()
                        .map(|d| EvidenceRef::new("drilldown", d))
                })
                .collect(),
        )
        .with_exposure(exposure, &snapshot_currency(store, snapshot)))
    }
}

// =============================================================================
// 3. RECONCILIATION CONSERVATION
// =============================================================================

/// For each reconciled transaction:
/// sum(allocations) + fees + writeoffs = |txn amount|.
pub fn check_reconciliation_conservation(
    store: &Store,
    snapshot: &Snapshot,
) -> Result<CheckResult> {
    let name = "reconciliation_conservation";
    let description = "Verify allocations + fees + writeoffs equal the transaction amount";

    let allocations = store.list_allocations_for_snapshot(snapshot.id)?;
    let reconciled: Vec<_> = allocations
        .iter()
        .filter(|a| a.status == MatchStatus::Reconciled)
        .collect();
    if reconciled.is_empty() {
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Skip,
            Severity::Critical,
            "Skipped: no reconciliation records to verify",
        ));
    }

    let mut by_txn: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
    for alloc in &reconciled {
        let entry = by_txn.entry(alloc.bank_transaction_id).or_default();
        entry.0 += alloc.allocated_amount;
        entry.1 += alloc.writeoff_amount;
    }

    let mut violations = Vec::new();
    let mut exposure = 0.0;
    for (txn_id, (allocated, writeoffs)) in &by_txn {
        let txn = store.get_bank_transaction(*txn_id)?;
        let expected = txn.amount.abs();
        let actual = allocated + txn.fee_amount + writeoffs;
        let difference = (expected - actual).abs();
        if difference > TOLERANCE {
            exposure += difference;
            violations.push(serde_json::json!({
                "txn_id": txn_id,
                "txn_amount": expected,
                "allocated": allocated,
                "fees": txn.fee_amount,
                "writeoffs": writeoffs,
                "difference": difference,
            }));
        }
    }

    if violations.is_empty() {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Critical,
            format!(
                "Passed: {} transaction(s) verified - allocations sum to transaction amounts",
                by_txn.len()
            ),
        )
        .with_details(serde_json::json!({
            "transactions_checked": by_txn.len(),
            "tolerance": TOLERANCE,
        })))
    } else {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Critical,
            format!(
                "Failed: {} transaction(s) have conservation violations, total unaccounted {exposure:.2}",
                violations.len()
            ),
        )
        .with_details(serde_json::json!({
            "transactions_checked": by_txn.len(),
            "violations": violations,
        }))
        .with_evidence(
            violations
                .iter()
                .take(20)
                .filter_map(|v| v["txn_id"].as_i64().map(|id| EvidenceRef::new("bank_txn", id)))
                .collect(),
        )
        .with_exposure(exposure, &snapshot_currency(store, snapshot)))
    }
}

// =============================================================================
// 4. NO-OVERMATCH
// =============================================================================

/// Allocations against an invoice stay within amount * 1.001 and are
/// individually non-negative.
pub fn check_no_overmatch(store: &Store, snapshot: &Snapshot) -> Result<CheckResult> {
    let name = "no_overmatch";
    let description = "Verify allocations don't exceed invoice amounts and are non-negative";

    let allocations = store.list_allocations_for_snapshot(snapshot.id)?;
    let reconciled: Vec<_> = allocations
        .iter()
        .filter(|a| a.status == MatchStatus::Reconciled && a.invoice_id.is_some())
        .collect();
    if reconciled.is_empty() {
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Skip,
            Severity::Critical,
            "Skipped: no reconciliation records to verify",
        ));
    }

    let mut by_invoice: BTreeMap<i64, f64> = BTreeMap::new();
    let mut negative = Vec::new();
    for alloc in &reconciled {
        let invoice_id = alloc.invoice_id.expect("filtered to invoice allocations");
        *by_invoice.entry(invoice_id).or_default() += alloc.allocated_amount;
        if alloc.allocated_amount < 0.0 {
            negative.push(serde_json::json!({
                "allocation_id": alloc.id,
                "invoice_id": invoice_id,
                "amount": alloc.allocated_amount,
            }));
        }
    }

    let mut over = Vec::new();
    let mut exposure = 0.0;
    for (invoice_id, allocated) in &by_invoice {
        let invoice = store.get_invoice(*invoice_id)?;
        let cap = invoice.amount.abs() * 1.001;
        if *allocated > cap {
            let over_amount = allocated - invoice.amount.abs();
            exposure += over_amount;
            over.push(serde_json::json!({
                "invoice_id": invoice_id,
                "document_number": invoice.document_number,
                "invoice_amount": invoice.amount.abs(),
                "total_allocated": allocated,
                "over_amount": over_amount,
            }));
        }
    }

    if over.is_empty() && negative.is_empty() {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Critical,
            format!(
                "Passed: {} invoice(s) verified - no over-allocations or negative amounts",
                by_invoice.len()
            ),
        )
        .with_details(serde_json::json!({
            "invoices_checked": by_invoice.len(),
        })))
    } else {
        let mut evidence: Vec<EvidenceRef> = over
            .iter()
            .filter_map(|v| v["invoice_id"].as_i64().map(|id| EvidenceRef::new("invoice", id)))
            .collect();
        evidence.extend(negative.iter().filter_map(|v| {
            v["allocation_id"]
                .as_i64()
                .map(|id| EvidenceRef::new("allocation", id))
        }));
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Critical,
            format!(
                "Failed: {} over-allocation(s), {} negative allocation(s), total over-allocated {exposure:.2}",
                over.len(),
                negative.len()
            ),
        )
        .with_details(serde_json::json!({
            "invoices_checked": by_invoice.len(),
            "over_allocations": over,
            "negative_allocations": negative,
        }))
        .with_evidence(evidence)
        .with_exposure(exposure, &snapshot_currency(store, snapshot)))
    }
}

// =============================================================================
// 5. FX SAFETY
// =============================================================================

/// Foreign-currency invoices need a rate to base; a stored 1.0 rate between
/// distinct currencies is a silent-fallback detector and fails hard.
pub fn check_fx_safety(
    store: &Store,
    snapshot: &Snapshot,
    base_currency: &str,
) -> Result<CheckResult> {
    let name = "fx_safety";
    let description =
        "Verify missing FX routes to Unknown and no silent 1.0 conversion exists";

    let rates = store.list_fx_rates(snapshot.id)?;
    let suspicious: Vec<_> = rates
        .iter()
        .filter(|r| r.from_currency != r.to_currency && r.rate == 1.0)
        .collect();

    let foreign: Vec<_> = store
        .list_invoices(snapshot.id)?
        .into_iter()
        .filter(|i| i.currency != base_currency)
        .collect();

    let mut missing = Vec::new();
    let mut exposure = 0.0;
    for inv in &foreign {
        if store
            .get_fx_rate(snapshot.id, &inv.currency, base_currency)?
            .is_none()
        {
            exposure += inv.amount.abs();
            missing.push(serde_json::json!({
                "invoice_id": inv.id,
                "document_number": inv.document_number,
                "currency": inv.currency,
                "amount": inv.amount,
                "missing_rate": format!("{}/{}", inv.currency, base_currency),
            }));
        }
    }

    if !suspicious.is_empty() {
        let mut evidence: Vec<EvidenceRef> = suspicious
            .iter()
            .map(|r| EvidenceRef::new("fx_rate", r.id))
            .collect();
        evidence.extend(missing.iter().filter_map(|v| {
            v["invoice_id"].as_i64().map(|id| EvidenceRef::new("invoice", id))
        }));
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Critical,
            format!(
                "Failed: {} suspicious 1.0 FX rate(s) found (silent conversion); {} invoice(s) missing FX",
                suspicious.len(),
                missing.len()
            ),
        )
        .with_details(serde_json::json!({
            "foreign_invoices": foreign.len(),
            "missing_fx": missing.len(),
            "suspicious_1_0_rates": suspicious.len(),
        }))
        .with_evidence(evidence)
        .with_exposure(exposure, base_currency));
    }

    if !missing.is_empty() {
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Warn,
            Severity::Warning,
            format!(
                "Warning: {} foreign currency invoice(s) missing FX rates, exposure {exposure:.2} {base_currency}",
                missing.len()
            ),
        )
        .with_details(serde_json::json!({
            "foreign_invoices": foreign.len(),
            "missing_fx": missing.len(),
            "missing_fx_details": missing,
        }))
        .with_evidence(
            missing
                .iter()
                .take(20)
                .filter_map(|v| v["invoice_id"].as_i64().map(|id| EvidenceRef::new("invoice", id)))
                .collect(),
        )
        .with_exposure(exposure, base_currency));
    }

    Ok(CheckResult::new(
        name,
        description,
        CheckStatus::Pass,
        Severity::Error,
        format!(
            "Passed: {} foreign currency invoice(s) all have valid FX rates",
            foreign.len()
        ),
    )
    .with_details(serde_json::json!({
        "foreign_invoices": foreign.len(),
        "missing_fx": 0,
        "suspicious_1_0_rates": 0,
    })))
}

// =============================================================================
// 6. SNAPSHOT IMMUTABILITY
// =============================================================================

/// A locked snapshot must carry its lock metadata and show no mutating
/// audit entries after the lock timestamp.
pub fn check_snapshot_immutability(store: &Store, snapshot: &Snapshot) -> Result<CheckResult> {
    let name = "snapshot_immutability";
    let description = "Verify locked snapshots have an audit trail and reject modifications";

    if !snapshot.is_locked() {
        return Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Critical,
            "Passed: snapshot is not locked - immutability constraint not applicable",
        )
        .with_details(serde_json::json!({ "is_locked": false })));
    }

    let mut violations = Vec::new();
    if snapshot.locked_at.is_none() {
        violations.push(serde_json::json!({ "field": "locked_at", "issue": "missing" }));
    }
    if snapshot.locked_by.is_none() {
        violations.push(serde_json::json!({ "field": "locked_by", "issue": "missing" }));
    }
    if let Some(locked_at) = snapshot.locked_at {
        for entry in store.mutations_after(snapshot.id, locked_at)? {
            violations.push(serde_json::json!({
                "audit_id": entry.id,
                "action": entry.action,
                "resource_type": entry.resource_type,
                "issue": "modification after lock",
            }));
        }
    }

    if violations.is_empty() {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Critical,
            "Passed: locked snapshot has a valid audit trail and no post-lock modifications",
        )
        .with_details(serde_json::json!({
            "is_locked": true,
            "locked_by": snapshot.locked_by,
        })))
    } else {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Critical,
            format!(
                "Failed: locked snapshot has {} immutability violation(s)",
                violations.len()
            ),
        )
        .with_details(serde_json::json!({
            "is_locked": true,
            "violations": violations,
        }))
        .with_evidence(
            violations
                .iter()
                .filter_map(|v| v["audit_id"].as_i64().map(|id| EvidenceRef::new("audit_log", id)))
                .collect(),
        ))
    }
}

// =============================================================================
// 7. IDEMPOTENCY
// =============================================================================

/// No duplicate canonical IDs within the snapshot. One sample row is
/// appended per duplicated canonical ID.
pub fn check_idempotency(store: &Store, snapshot: &Snapshot) -> Result<CheckResult> {
    let name = "idempotency";
    let description = "Verify no duplicate canonical IDs within the snapshot";

    let mut counts: BTreeMap<String, (usize, Vec<String>, Vec<f64>)> = BTreeMap::new();
    for inv in store.list_invoices(snapshot.id)? {
        let entry = counts.entry(inv.canonical_id.clone()).or_default();
        entry.0 += 1;
        entry.1.push(inv.document_number.clone());
        entry.2.push(inv.amount);
    }
    for bill in store.list_vendor_bills(snapshot.id)? {
        let entry = counts.entry(bill.canonical_id.clone()).or_default();
        entry.0 += 1;
        entry.1.push(bill.document_number.clone());
        entry.2.push(bill.amount);
    }

    let mut samples = Vec::new();
    let mut total_duplicates = 0usize;
    for (canonical_id, (count, doc_numbers, amounts)) in &counts {
        if *count > 1 {
            total_duplicates += count - 1;
            samples.push(serde_json::json!({
                "canonical_id": format!("{}...", &canonical_id[..20.min(canonical_id.len())]),
                "count": count,
                "doc_numbers": doc_numbers,
                "amounts": amounts,
            }));
        }
    }

    if samples.is_empty() {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Pass,
            Severity::Error,
            "Passed: no duplicate canonical IDs found; import is idempotent",
        )
        .with_details(serde_json::json!({
            "total_duplicates": 0,
            "has_dataset_id": snapshot.dataset_id.is_some(),
            "dataset_id": snapshot.dataset_id,
        })))
    } else {
        Ok(CheckResult::new(
            name,
            description,
            CheckStatus::Fail,
            Severity::Error,
            format!(
                "Failed: {total_duplicates} duplicate record(s) across {} canonical ID(s); re-import is not idempotent",
                samples.len()
            ),
        )
        .with_details(serde_json::json!({
            "total_duplicates": total_duplicates,
            "unique_duplicated_ids": samples.len(),
            "sample_duplicates": samples,
        }))
        .with_evidence(
            samples
                .iter()
                .filter_map(|v| {
                    v["canonical_id"]
                        .as_str()
                        .map(|id| EvidenceRef::new("duplicate", id))
                })
                .collect(),
        ))
    }
}

fn snapshot_currency(store: &Store, snapshot: &Snapshot) -> String {
    store
        .get_entity(snapshot.entity_id)
        .map(|e| e.base_currency)
        .unwrap_or_else(|_| "EUR".to_string())
}
