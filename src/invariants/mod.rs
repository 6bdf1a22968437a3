//! Invariant engine.
//!
//! Seven deterministic checks gate lock eligibility. Each check returns a
//! status, severity, machine-readable details, a human-readable proof
//! string and evidence refs — violations are recorded, never raised. The
//! run aggregate is FAILED if any check fails, PARTIAL on warnings, else
//! PASSED, and is persisted in a single transaction.

pub mod checks;

use crate::error::{DomainError, Result};
use crate::models::{EvidenceRef, Severity};
use crate::store::{ts_from_sql, ts_to_sql, Store};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Tolerance for floating-point comparisons across all checks.
pub const TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Skip,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
            CheckStatus::Skip => "SKIP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(CheckStatus::Pass),
            "FAIL" => Some(CheckStatus::Fail),
            "WARN" => Some(CheckStatus::Warn),
            "SKIP" => Some(CheckStatus::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Passed,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Passed => "PASSED",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "PASSED" => Some(RunStatus::Passed),
            "PARTIAL" => Some(RunStatus::Partial),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Result of one invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub description: String,
    pub status: CheckStatus,
    pub severity: Severity,
    pub details: serde_json::Value,
    pub proof_string: String,
    pub evidence_refs: Vec<EvidenceRef>,
    pub exposure_amount: f64,
    pub exposure_currency: String,
}

impl CheckResult {
    pub fn new(
        name: &str,
        description: &str,
        status: CheckStatus,
        severity: Severity,
        proof_string: impl Into<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            status,
            severity,
            details: serde_json::json!({}),
            proof_string: proof_string.into(),
            evidence_refs: Vec::new(),
            exposure_amount: 0.0,
            exposure_currency: "EUR".to_string(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_evidence(mut self, evidence: Vec<EvidenceRef>) -> Self {
        self.evidence_refs = evidence;
        self
    }

    pub fn with_exposure(mut self, amount: f64, currency: &str) -> Self {
        self.exposure_amount = amount;
        self.exposure_currency = currency.to_string();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_invariants: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub skipped: usize,
    pub critical_failures: usize,
    pub execution_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantRun {
    pub id: i64,
    pub snapshot_id: i64,
    pub status: RunStatus,
    pub triggered_by: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub results: Vec<CheckResult>,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct InvariantEngine {
    store: Arc<Store>,
}

impl InvariantEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Run all seven checks and persist the run.
    pub fn run_all(&self, snapshot_id: i64, triggered_by: &str) -> Result<InvariantRun> {
        let started = std::time::Instant::now();
        let started_at = Utc::now();
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        let entity = self.store.get_entity(snapshot.entity_id)?;
        let base_currency = entity.base_currency.clone();

        let results = vec![
            checks::check_weekly_cash_math(&self.store, &snapshot)?,
            checks::check_drilldown_sum_integrity(&self.store, &snapshot)?,
            checks::check_reconciliation_conservation(&self.store, &snapshot)?,
            checks::check_no_overmatch(&self.store, &snapshot)?,
            checks::check_fx_safety(&self.store, &snapshot, &base_currency)?,
            checks::check_snapshot_immutability(&self.store, &snapshot)?,
            checks::check_idempotency(&self.store, &snapshot)?,
        ];

        let mut summary = RunSummary {
            total_invariants: results.len(),
            passed: 0,
            failed: 0,
            warnings: 0,
            skipped: 0,
            critical_failures: 0,
            execution_time_ms: 0.0,
        };
        for result in &results {
            match result.status {
                CheckStatus::Pass => summary.passed += 1,
                CheckStatus::Fail => {
                    summary.failed += 1;
                    if result.severity == Severity::Critical {
                        summary.critical_failures += 1;
                    }
                }
                CheckStatus::Warn => summary.warnings += 1,
                CheckStatus::Skip => summary.skipped += 1,
            }
        }
        summary.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;

        let status = if summary.failed > 0 {
            RunStatus::Failed
        } else if summary.warnings > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Passed
        };

        let run_id = self.store.persist_invariant_run(
            snapshot_id,
            triggered_by,
            status,
            started_at,
            &summary,
            &results,
        )?;
        info!(
            snapshot_id,
            run_id,
            status = status.as_str(),
            passed = summary.passed,
            failed = summary.failed,
            warnings = summary.warnings,
            "invariant run complete"
        );

        Ok(InvariantRun {
            id: run_id,
            snapshot_id,
            status,
            triggered_by: triggered_by.to_string(),
            started_at,
            completed_at: Some(Utc::now()),
            summary,
            results,
        })
    }
}

// =============================================================================
// PERSISTENCE
// =============================================================================

impl Store {
    /// Persist one invariant run with all results in a single transaction.
    pub fn persist_invariant_run(
        &self,
        snapshot_id: i64,
        triggered_by: &str,
        status: RunStatus,
        started_at: DateTime<Utc>,
        summary: &RunSummary,
        results: &[CheckResult],
    ) -> Result<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO invariant_runs
                   (snapshot_id, status, triggered_by, started_at, completed_at, summary_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    snapshot_id,
                    status.as_str(),
                    triggered_by,
                    ts_to_sql(started_at),
                    ts_to_sql(Utc::now()),
                    serde_json::to_string(summary)?,
                ],
            )?;
            let run_id = tx.last_insert_rowid();
            for result in results {
                tx.execute(
                    "INSERT INTO invariant_results
                       (run_id, name, description, status, severity, details_json,
                        proof_string, evidence_refs_json, exposure_amount, exposure_currency)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    params![
                        run_id,
                        result.name,
                        result.description,
                        result.status.as_str(),
                        result.severity.as_str(),
                        result.details.to_string(),
                        result.proof_string,
                        serde_json::to_string(&result.evidence_refs)?,
                        result.exposure_amount,
                        result.exposure_currency,
                    ],
                )?;
            }
            Ok(run_id)
        })
    }

    /// Latest persisted run for a snapshot, with results.
    pub fn get_latest_invariant_run(&self, snapshot_id: i64) -> Result<Option<InvariantRun>> {
        let header = self
            .conn()
            .query_row(
                "SELECT id, snapshot_id, status, triggered_by, started_at, completed_at, summary_json
                 FROM invariant_runs WHERE snapshot_id = ?1
                 ORDER BY id DESC LIMIT 1",
                [snapshot_id],
                |row| {
                    let status: String = row.get("status")?;
                    let summary_json: Option<String> = row.get("summary_json")?;
                    Ok((
                        row.get::<_, i64>("id")?,
                        row.get::<_, i64>("snapshot_id")?,
                        status,
                        row.get::<_, String>("triggered_by")?,
                        ts_from_sql(row.get("started_at")?),
                        ts_from_sql(row.get("completed_at")?),
                        summary_json,
                    ))
                },
            )
            .optional()?;

        let Some((id, snapshot_id, status, triggered_by, started_at, completed_at, summary_json)) =
            header
        else {
            return Ok(None);
        };

        let results = {
            let conn = self.conn();
            let mut stmt = conn.prepare(
                "SELECT * FROM invariant_results WHERE run_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([id], |row| {
                    let status: String = row.get("status")?;
                    let severity: String = row.get("severity")?;
                    let details_json: String = row.get("details_json")?;
                    let evidence_json: String = row.get("evidence_refs_json")?;
                    Ok(CheckResult {
                        name: row.get("name")?,
                        description: row.get("description")?,
                        status: CheckStatus::parse(&status).unwrap_or(CheckStatus::Skip),
                        severity: Severity::parse(&severity).unwrap_or(Severity::Info),
                        details: serde_json::from_str(&details_json)
                            .unwrap_or(serde_json::Value::Null),
                        proof_string: row.get("proof_string")?,
                        evidence_refs: serde_json::from_str(&evidence_json).unwrap_or_default(),
                        exposure_amount: row.get("exposure_amount")?,
                        exposure_currency: row.get("exposure_currency")?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let summary: RunSummary = summary_json
            .and_then(|j| serde_json::from_str(&j).ok())
            .ok_or_else(|| DomainError::Infrastructure("invariant run summary missing".into()))?;

        Ok(Some(InvariantRun {
            id,
            snapshot_id,
            status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
            triggered_by,
            started_at: started_at.unwrap_or_else(Utc::now),
            completed_at,
            summary,
            results,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot_all_pass_or_skip() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();

        let run = InvariantEngine::new(store.clone())
            .run_all(snapshot.id, "test")
            .unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.results.len(), 7);
        for result in &run.results {
            assert!(
                matches!(result.status, CheckStatus::Pass | CheckStatus::Skip),
                "{} was {:?}",
                result.name,
                result.status
            );
            assert!(!result.proof_string.is_empty());
        }

        let latest = store.get_latest_invariant_run(snapshot.id).unwrap().unwrap();
        assert_eq!(latest.id, run.id);
        assert_eq!(latest.results.len(), 7);
    }
}
