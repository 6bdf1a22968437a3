//! Trust report and lock gates.
//!
//! Derived metrics over a snapshot — cash explained, missing-FX exposure,
//! duplicate exposure, unknown cash, reconciliation age, data freshness,
//! open critical findings, schema drift — each carrying evidence refs, a
//! composite trust score, and the gate predicates whose failure blocks a
//! lock without a CFO override.

use crate::error::{DomainError, Result};
use crate::matching::MatchingEngine;
use crate::models::{EvidenceRef, Role};
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// REPORT TYPES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub evidence_refs: Vec<EvidenceRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustReport {
    pub snapshot_id: i64,
    pub base_currency: String,
    pub cash_explained_pct: f64,
    pub missing_fx_exposure_base: f64,
    /// missing-FX exposure as a fraction of total open AR.
    pub missing_fx_ratio: f64,
    pub duplicate_exposure_base: f64,
    /// Unexplained share of bank inflows, as a fraction.
    pub unknown_cash_pct: f64,
    pub reconciliation_age_days: Option<f64>,
    pub data_freshness_hours: f64,
    pub critical_findings_open: i64,
    pub schema_drift_count: i64,
    pub trust_score: f64,
    pub metrics: Vec<TrustMetric>,
    pub generated_at: DateTime<Utc>,
}

/// Configurable gate thresholds; defaults per policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockGateThresholds {
    pub max_missing_fx_ratio: f64,
    pub max_unknown_cash_pct: f64,
    pub max_duplicate_exposure: f64,
    pub max_data_freshness_hours: f64,
    pub max_critical_findings: i64,
}

impl Default for LockGateThresholds {
    fn default() -> Self {
        Self {
            max_missing_fx_ratio: 0.05,
            max_unknown_cash_pct: 0.05,
            max_duplicate_exposure: 0.0,
            max_data_freshness_hours: 48.0,
            max_critical_findings: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub value: f64,
    pub threshold: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockGateReport {
    pub gates: Vec<GateResult>,
}

impl LockGateReport {
    pub fn all_passed(&self) -> bool {
        self.gates.iter().all(|g| g.passed)
    }

    pub fn failed_gate_names(&self) -> Vec<String> {
        self.gates
            .iter()
            .filter(|g| !g.passed)
            .map(|g| g.name.clone())
            .collect()
    }
}

/// CFO override accompanying a failed-gate lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRequest {
    pub acknowledgment_text: String,
    pub override_reason: String,
    pub email: Option<String>,
    pub ip_address: Option<String>,
}

impl OverrideRequest {
    /// Minimum acknowledgment length, characters.
    pub const MIN_ACK_LEN: usize = 20;

    pub fn validate(&self, role: Role) -> Result<()> {
        if !role.can_lock() {
            return Err(DomainError::Policy(
                "Only the lock-capable role may override lock gates".to_string(),
            ));
        }
        if self.acknowledgment_text.trim().chars().count() < Self::MIN_ACK_LEN {
            return Err(DomainError::Policy(format!(
                "Override acknowledgment must be at least {} characters",
                Self::MIN_ACK_LEN
            )));
        }
        if self.override_reason.trim().is_empty() {
            return Err(DomainError::Policy(
                "Override reason is required".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct TrustEngine {
    store: Arc<Store>,
}

impl TrustEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn evaluate(&self, snapshot_id: i64, as_of: DateTime<Utc>) -> Result<TrustReport> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        let entity = self.store.get_entity(snapshot.entity_id)?;
        let base_currency = entity.base_currency.clone();

        let kpi = MatchingEngine::new(self.store.clone()).cash_explained(snapshot_id)?;

        // Missing-FX exposure over open AR.
        let open_invoices = self.store.list_open_invoices(snapshot_id)?;
        let total_open: f64 = open_invoices.iter().map(|i| i.amount.abs()).sum();
        let mut missing_fx_exposure = 0.0;
        let mut missing_fx_evidence = Vec::new();
        for inv in &open_invoices {
            if inv.currency != base_currency {
                let rate = self
                    .store
                    .get_fx_rate(snapshot_id, &inv.currency, &base_currency)?;
                if rate.is_none() {
                    missing_fx_exposure += inv.amount.abs();
                    missing_fx_evidence.push(EvidenceRef::new("invoice", inv.id));
                }
            }
        }
        let missing_fx_ratio = if total_open > 0.0 {
            missing_fx_exposure / total_open
        } else {
            0.0
        };

        // Duplicate exposure; DB uniqueness keeps this at zero, a non-zero
        // value means the storage guarantee itself is broken.
        let mut seen: BTreeMap<&str, f64> = BTreeMap::new();
        let mut duplicate_exposure = 0.0;
        let mut duplicate_evidence = Vec::new();
        let all_invoices = self.store.list_invoices(snapshot_id)?;
        for inv in &all_invoices {
            if seen.contains_key(inv.canonical_id.as_str()) {
                duplicate_exposure += inv.amount.abs();
                duplicate_evidence.push(EvidenceRef::new("invoice", inv.id));
            } else {
                seen.insert(&inv.canonical_id, inv.amount);
            }
        }

        let unknown_cash_pct = 1.0 - (kpi.cash_explained_pct / 100.0);

        // Reconciliation age: time since the most recent resolution.
        let reconciliation_age_days = self
            .store
            .list_bank_transactions(snapshot_id)?
            .iter()
            .filter_map(|t| t.resolved_at)
            .max()
            .map(|latest| (as_of - latest).num_seconds() as f64 / 86_400.0);

        // Freshness of the dataset the snapshot was promoted from. A
        // snapshot without provenance has nothing to go stale.
        let (data_freshness_hours, schema_drift_count) = match &snapshot.dataset_id {
            Some(uid) => {
                let dataset = self.store.get_dataset_by_uid(uid)?;
                let run = self.store.get_sync_run(dataset.sync_run_id)?;
                let drift = self.store.count_drift_events(run.connection_id)?;
                let hours = (as_of - dataset.created_at).num_seconds() as f64 / 3600.0;
                (hours.max(0.0), drift)
            }
            None => (0.0, 0),
        };

        let critical_findings_open = self.store.count_open_critical_exceptions(snapshot_id)?;

        let trust_score = compute_trust_score(
            kpi.cash_explained_pct,
            missing_fx_ratio,
            duplicate_exposure,
            data_freshness_hours,
            critical_findings_open,
            schema_drift_count,
        );
        debug!(snapshot_id, trust_score, "trust report evaluated");

        let metrics = vec![
            TrustMetric {
                name: "cash_explained_pct".to_string(),
                value: kpi.cash_explained_pct,
                unit: "percent".to_string(),
                evidence_refs: vec![EvidenceRef::new("snapshot", snapshot_id)],
            },
            TrustMetric {
                name: "missing_fx_exposure_base".to_string(),
                value: missing_fx_exposure,
                unit: "amount".to_string(),
                evidence_refs: missing_fx_evidence,
            },
            TrustMetric {
                name: "duplicate_exposure_base".to_string(),
                value: duplicate_exposure,
                unit: "amount".to_string(),
                evidence_refs: duplicate_evidence,
            },
            TrustMetric {
                name: "unknown_cash_pct".to_string(),
                value: unknown_cash_pct,
                unit: "fraction".to_string(),
                evidence_refs: vec![EvidenceRef::new("snapshot", snapshot_id)],
            },
            TrustMetric {
                name: "data_freshness_hours".to_string(),
                value: data_freshness_hours,
                unit: "hours".to_string(),
                evidence_refs: snapshot
                    .dataset_id
                    .iter()
                    .map(|uid| EvidenceRef::new("dataset", uid))
                    .collect(),
            },
            TrustMetric {
                name: "critical_findings_open".to_string(),
                value: critical_findings_open as f64,
                unit: "count".to_string(),
                evidence_refs: vec![],
            },
            TrustMetric {
                name: "schema_drift_count".to_string(),
                value: schema_drift_count as f64,
                unit: "count".to_string(),
                evidence_refs: vec![],
            },
        ];

        Ok(TrustReport {
            snapshot_id,
            base_currency,
            cash_explained_pct: kpi.cash_explained_pct,
            missing_fx_exposure_base: missing_fx_exposure,
            missing_fx_ratio,
            duplicate_exposure_base: duplicate_exposure,
            unknown_cash_pct,
            reconciliation_age_days,
            data_freshness_hours,
            critical_findings_open,
            schema_drift_count,
            trust_score,
            metrics,
            generated_at: as_of,
        })
    }

    /// Evaluate the lock gates over a trust report.
    pub fn lock_gates(
        &self,
        report: &TrustReport,
        thresholds: &LockGateThresholds,
    ) -> LockGateReport {
        let gates = vec![
            GateResult {
                name: "missing_fx_ratio".to_string(),
                passed: report.missing_fx_ratio <= thresholds.max_missing_fx_ratio,
                value: report.missing_fx_ratio,
                threshold: thresholds.max_missing_fx_ratio,
                description: "Missing-FX exposure over total open AR".to_string(),
            },
            GateResult {
                name: "unknown_cash_pct".to_string(),
                passed: report.unknown_cash_pct <= thresholds.max_unknown_cash_pct,
                value: report.unknown_cash_pct,
                threshold: thresholds.max_unknown_cash_pct,
                description: "Unexplained share of bank inflows".to_string(),
            },
            GateResult {
                name: "duplicate_exposure_base".to_string(),
                passed: report.duplicate_exposure_base <= thresholds.max_duplicate_exposure,
                value: report.duplicate_exposure_base,
                threshold: thresholds.max_duplicate_exposure,
                description: "Amount held in duplicated canonical IDs".to_string(),
            },
            GateResult {
                name: "data_freshness_hours".to_string(),
                passed: report.data_freshness_hours <= thresholds.max_data_freshness_hours,
                value: report.data_freshness_hours,
                threshold: thresholds.max_data_freshness_hours,
                description: "Age of the snapshot's source dataset".to_string(),
            },
            GateResult {
                name: "critical_findings_open".to_string(),
                passed: report.critical_findings_open <= thresholds.max_critical_findings,
                value: report.critical_findings_open as f64,
                threshold: thresholds.max_critical_findings as f64,
                description: "Open critical findings".to_string(),
            },
        ];
        LockGateReport { gates }
    }
}

/// Composite score in [0, 100], weighted with deductions.
fn compute_trust_score(
    cash_explained_pct: f64,
    missing_fx_ratio: f64,
    duplicate_exposure: f64,
    data_freshness_hours: f64,
    critical_findings: i64,
    schema_drift_count: i64,
) -> f64 {
    let mut score = 100.0;
    score -= (100.0 - cash_explained_pct) * 0.35;
    score -= (missing_fx_ratio * 100.0).min(100.0) * 0.25;
    if duplicate_exposure > 0.0 {
        score -= 15.0;
    }
    if data_freshness_hours > 48.0 {
        score -= 10.0;
    }
    score -= (critical_findings as f64 * 15.0).min(30.0);
    score -= (schema_drift_count as f64 * 2.0).min(10.0);
    score.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::canonical::{NewBankTransaction, NewInvoice};
    use chrono::NaiveDate;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn setup() -> (Arc<Store>, TrustEngine, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        let engine = TrustEngine::new(store.clone());
        (store, engine, snapshot.id)
    }

    #[test]
    fn test_clean_snapshot_passes_all_gates() {
        let (_store, engine, snapshot_id) = setup();
        let report = engine.evaluate(snapshot_id, Utc::now()).unwrap();
        assert_eq!(report.missing_fx_exposure_base, 0.0);
        assert_eq!(report.duplicate_exposure_base, 0.0);
        assert!(report.trust_score > 90.0);

        let gates = engine.lock_gates(&report, &LockGateThresholds::default());
        assert!(gates.all_passed());
    }

    #[test]
    fn test_missing_fx_fails_gate() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_invoice(
                snapshot_id,
                &NewInvoice {
                    canonical_id: "usd-1".to_string(),
                    document_number: "INV-USD".to_string(),
                    document_type: "INV".to_string(),
                    amount: 1000.0,
                    currency: "USD".to_string(),
                    due_date: Some(d("2026-03-01")),
                    ..Default::default()
                },
            )
            .unwrap();

        let report = engine.evaluate(snapshot_id, Utc::now()).unwrap();
        assert!(report.missing_fx_exposure_base >= 1000.0);
        assert!((report.missing_fx_ratio - 1.0).abs() < 1e-9);

        let gates = engine.lock_gates(&report, &LockGateThresholds::default());
        assert!(!gates.all_passed());
        assert!(gates
            .failed_gate_names()
            .contains(&"missing_fx_ratio".to_string()));
    }

    #[test]
    fn test_unmatched_inflows_raise_unknown_cash() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_bank_transaction(
                snapshot_id,
                &NewBankTransaction {
                    bank_account_id: "ACC".to_string(),
                    transaction_date: Some(d("2026-01-15")),
                    amount: 5000.0,
                    currency: "EUR".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        // Refresh the cached KPI the way a matching pass would.
        let kpi = MatchingEngine::new(store.clone())
            .cash_explained(snapshot_id)
            .unwrap();
        store.set_cash_explained(snapshot_id, kpi.cash_explained_pct).unwrap();

        let report = engine.evaluate(snapshot_id, Utc::now()).unwrap();
        assert!((report.unknown_cash_pct - 1.0).abs() < 1e-9);
        let gates = engine.lock_gates(&report, &LockGateThresholds::default());
        assert!(gates
            .failed_gate_names()
            .contains(&"unknown_cash_pct".to_string()));
    }

    #[test]
    fn test_critical_findings_fail_gate() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_exception(
                snapshot_id,
                "conservation",
                crate::models::Severity::Critical,
                "Allocation mismatch",
                None,
                None,
                &[],
            )
            .unwrap();
        let report = engine.evaluate(snapshot_id, Utc::now()).unwrap();
        assert_eq!(report.critical_findings_open, 1);
        let gates = engine.lock_gates(&report, &LockGateThresholds::default());
        assert!(gates
            .failed_gate_names()
            .contains(&"critical_findings_open".to_string()));
        assert!(report.trust_score < 90.0);
    }

    #[test]
    fn test_override_validation() {
        let ok = OverrideRequest {
            acknowledgment_text: "I accept the Q4 FX gap; revisit next week".to_string(),
            override_reason: "board deadline".to_string(),
            email: None,
            ip_address: None,
        };
        assert!(ok.validate(Role::LockCapable).is_ok());
        assert_eq!(
            ok.validate(Role::Regular).unwrap_err().code(),
            "POLICY_VIOLATION"
        );

        let short = OverrideRequest {
            acknowledgment_text: "ack".to_string(),
            override_reason: "r".to_string(),
            email: None,
            ip_address: None,
        };
        assert!(short.validate(Role::LockCapable).is_err());
    }
}
