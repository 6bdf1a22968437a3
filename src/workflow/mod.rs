//! Snapshot workflow and collaboration state machines.
//!
//! Snapshot states run DRAFT -> READY_FOR_REVIEW -> LOCKED and never leave
//! LOCKED. Every mutating path calls `assert_snapshot_not_locked` before
//! touching a child row, and every mutation appends one audit entry. At
//! lock time the active matching policies are frozen onto the snapshot so
//! later reproduction is deterministic.

pub mod actions;
pub mod comments;
pub mod exceptions;
pub mod scenarios;

use crate::error::{DomainError, Result};
use crate::models::{Role, Snapshot, SnapshotStatus};
use crate::store::Store;
use crate::trust::{LockGateReport, OverrideRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Guard every write path. Locked snapshots are read-only.
pub fn assert_snapshot_not_locked(snapshot: &Snapshot) -> Result<()> {
    if snapshot.is_locked() {
        return Err(DomainError::locked_snapshot());
    }
    Ok(())
}

/// KPI deltas between two snapshots of the same entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotComparison {
    pub snapshot_a: i64,
    pub snapshot_b: i64,
    pub open_amount_a: f64,
    pub open_amount_b: f64,
    pub open_amount_delta: f64,
    pub cash_explained_a: f64,
    pub cash_explained_b: f64,
    pub cash_explained_delta: f64,
}

pub struct SnapshotWorkflow {
    store: Arc<Store>,
}

impl SnapshotWorkflow {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// DRAFT -> READY_FOR_REVIEW. Denied while any open or in-review
    /// critical exception exists.
    pub fn mark_ready(&self, snapshot_id: i64, actor: &str, role: Role) -> Result<Snapshot> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        if snapshot.status != SnapshotStatus::Draft {
            return Err(DomainError::State(format!(
                "Snapshot {snapshot_id} is {}, expected DRAFT",
                snapshot.status.as_str()
            )));
        }
        let critical = self.store.count_open_critical_exceptions(snapshot_id)?;
        if critical > 0 {
            return Err(DomainError::State(format!(
                "Snapshot {snapshot_id} has {critical} open critical exception(s)"
            )));
        }

        let lock = self.store.snapshot_write_lock(snapshot_id);
        let _held = lock.lock();
        self.store.update_snapshot_status(
            snapshot_id,
            SnapshotStatus::ReadyForReview,
            None,
            None,
            None,
        )?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Transition",
            "snapshot",
            Some(snapshot_id),
            Some(snapshot_id),
            Some(
                &serde_json::json!({
                    "status": { "old": "DRAFT", "new": "READY_FOR_REVIEW" }
                })
                .to_string(),
            ),
            None,
            None,
        )?;
        self.store.get_snapshot(snapshot_id)
    }

    /// READY_FOR_REVIEW -> LOCKED.
    ///
    /// Restricted to the lock-capable role. All lock gates must pass, or a
    /// valid CFO override must accompany the request; the override is
    /// recorded append-only either way the caller phrased it.
    pub fn lock(
        &self,
        snapshot_id: i64,
        actor: &str,
        role: Role,
        reason: &str,
        gates: &LockGateReport,
        override_request: Option<&OverrideRequest>,
    ) -> Result<Snapshot> {
        if !role.can_lock() {
            return Err(DomainError::Policy(
                "Only the lock-capable role may lock a snapshot".to_string(),
            ));
        }
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        if snapshot.status != SnapshotStatus::ReadyForReview {
            return Err(DomainError::State(format!(
                "Snapshot {snapshot_id} is {}, expected READY_FOR_REVIEW",
                snapshot.status.as_str()
            )));
        }

        if !gates.all_passed() {
            let request = override_request.ok_or_else(|| {
                DomainError::Policy(format!(
                    "Lock gates failed ({}) and no override supplied",
                    gates.failed_gate_names().join(", ")
                ))
            })?;
            request.validate(role)?;
            self.store.append_lock_gate_override(
                snapshot_id,
                actor,
                role.as_str(),
                request.email.as_deref(),
                request.ip_address.as_deref(),
                &serde_json::to_string(&gates.failed_gate_names())?,
                &request.acknowledgment_text,
                &request.override_reason,
            )?;
            info!(snapshot_id, actor, "lock gates overridden");
        }

        let lock = self.store.snapshot_write_lock(snapshot_id);
        let _held = lock.lock();

        // Freeze the active matching policies for deterministic replay.
        let policies = self.store.list_active_policies()?;
        let policies_json = serde_json::to_string(&policies)?;

        self.store.update_snapshot_status(
            snapshot_id,
            SnapshotStatus::Locked,
            Some(actor),
            Some(reason),
            Some(&policies_json),
        )?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Transition",
            "snapshot",
            Some(snapshot_id),
            Some(snapshot_id),
            Some(
                &serde_json::json!({
                    "status": { "old": "READY_FOR_REVIEW", "new": "LOCKED" },
                    "reason": reason,
                })
                .to_string(),
            ),
            None,
            None,
        )?;
        info!(snapshot_id, actor, "snapshot locked");
        self.store.get_snapshot(snapshot_id)
    }

    pub fn compare(&self, snapshot_a: i64, snapshot_b: i64) -> Result<SnapshotComparison> {
        let a = self.store.get_snapshot(snapshot_a)?;
        let b = self.store.get_snapshot(snapshot_b)?;
        let open = |id: i64| -> Result<f64> {
            Ok(self
                .store
                .list_open_invoices(id)?
                .iter()
                .map(|i| i.amount)
                .sum())
        };
        let open_a = open(snapshot_a)?;
        let open_b = open(snapshot_b)?;
        Ok(SnapshotComparison {
            snapshot_a,
            snapshot_b,
            open_amount_a: open_a,
            open_amount_b: open_b,
            open_amount_delta: open_b - open_a,
            cash_explained_a: a.cash_explained_pct,
            cash_explained_b: b.cash_explained_pct,
            cash_explained_delta: b.cash_explained_pct - a.cash_explained_pct,
        })
    }
}
