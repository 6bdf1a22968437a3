//! Action lifecycle: DRAFT -> PENDING_APPROVAL -> APPROVED -> IN_PROGRESS
//! -> DONE | CANCELLED. Approval-gated actions obey the lock-capable role.

use super::assert_snapshot_not_locked;
use crate::error::{DomainError, Result};
use crate::models::{Action, ActionStatus, Role};
use crate::store::Store;
use chrono::NaiveDate;
use std::sync::Arc;

fn valid_transition(from: ActionStatus, to: ActionStatus) -> bool {
    use ActionStatus::*;
    matches!(
        (from, to),
        (Draft, PendingApproval)
            | (PendingApproval, Approved)
            | (Approved, InProgress)
            | (Approved, Cancelled)
            | (InProgress, Done)
            | (InProgress, Cancelled)
    )
}

pub struct ActionWorkflow {
    store: Arc<Store>,
}

impl ActionWorkflow {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        snapshot_id: i64,
        title: &str,
        action_type: &str,
        requires_approval: bool,
        assignee: Option<&str>,
        due_date: Option<NaiveDate>,
        actor: &str,
        role: Role,
    ) -> Result<Action> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        let id = self.store.insert_action(
            snapshot_id,
            title,
            action_type,
            requires_approval,
            assignee,
            due_date,
            actor,
        )?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Create",
            "action",
            Some(id),
            Some(snapshot_id),
            None,
            None,
            None,
        )?;
        self.store.get_action(id)
    }

    pub fn submit_for_approval(&self, action_id: i64, actor: &str, role: Role) -> Result<Action> {
        self.transition(action_id, ActionStatus::PendingApproval, actor, role)
    }

    pub fn approve(&self, action_id: i64, actor: &str, role: Role) -> Result<Action> {
        let action = self.store.get_action(action_id)?;
        if action.requires_approval && !role.can_lock() {
            return Err(DomainError::Policy(
                "Only the lock-capable role may approve this action".to_string(),
            ));
        }
        self.transition(action_id, ActionStatus::Approved, actor, role)
    }

    pub fn start(&self, action_id: i64, actor: &str, role: Role) -> Result<Action> {
        self.transition(action_id, ActionStatus::InProgress, actor, role)
    }

    pub fn complete(&self, action_id: i64, actor: &str, role: Role) -> Result<Action> {
        self.transition(action_id, ActionStatus::Done, actor, role)
    }

    pub fn cancel(&self, action_id: i64, actor: &str, role: Role) -> Result<Action> {
        self.transition(action_id, ActionStatus::Cancelled, actor, role)
    }

    fn transition(
        &self,
        action_id: i64,
        to: ActionStatus,
        actor: &str,
        role: Role,
    ) -> Result<Action> {
        let action = self.store.get_action(action_id)?;
        let snapshot = self.store.get_snapshot(action.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        if !valid_transition(action.status, to) {
            return Err(DomainError::State(format!(
                "Action {action_id}: {} -> {} is not allowed",
                action.status.as_str(),
                to.as_str()
            )));
        }
        self.store.update_action_status(action_id, to)?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Update",
            "action",
            Some(action_id),
            Some(action.snapshot_id),
            Some(
                &serde_json::json!({
                    "status": { "old": action.status.as_str(), "new": to.as_str() }
                })
                .to_string(),
            ),
            None,
            None,
        )?;
        self.store.get_action(action_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ActionWorkflow, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        (ActionWorkflow::new(store), snapshot.id)
    }

    #[test]
    fn test_full_lifecycle() {
        let (workflow, snapshot_id) = setup();
        let action = workflow
            .create(
                snapshot_id,
                "Chase ACME payment",
                "collections_call",
                true,
                Some("maria"),
                None,
                "lead",
                Role::Regular,
            )
            .unwrap();

        workflow
            .submit_for_approval(action.id, "lead", Role::Regular)
            .unwrap();
        workflow.approve(action.id, "cfo", Role::LockCapable).unwrap();
        let started = workflow.start(action.id, "maria", Role::Regular).unwrap();
        assert!(started.started_at.is_some());
        let done = workflow.complete(action.id, "maria", Role::Regular).unwrap();
        assert_eq!(done.status, ActionStatus::Done);
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn test_approval_gate_respects_role() {
        let (workflow, snapshot_id) = setup();
        let action = workflow
            .create(
                snapshot_id,
                "Delay vendor run",
                "payment_hold",
                true,
                None,
                None,
                "lead",
                Role::Regular,
            )
            .unwrap();
        workflow
            .submit_for_approval(action.id, "lead", Role::Regular)
            .unwrap();
        let err = workflow
            .approve(action.id, "lead", Role::Regular)
            .unwrap_err();
        assert_eq!(err.code(), "POLICY_VIOLATION");
    }

    #[test]
    fn test_cannot_skip_states() {
        let (workflow, snapshot_id) = setup();
        let action = workflow
            .create(
                snapshot_id,
                "Tidy up",
                "cleanup",
                false,
                None,
                None,
                "lead",
                Role::Regular,
            )
            .unwrap();
        let err = workflow.start(action.id, "lead", Role::Regular).unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }
}
