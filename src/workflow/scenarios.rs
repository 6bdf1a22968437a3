//! Scenario lifecycle: DRAFT -> PROPOSED -> APPROVED | REJECTED.
//! Only the lock-capable role may approve or reject.

use super::assert_snapshot_not_locked;
use crate::error::{DomainError, Result};
use crate::models::{Role, Scenario, ScenarioConfig, ScenarioStatus};
use crate::store::Store;
use std::sync::Arc;

pub struct ScenarioWorkflow {
    store: Arc<Store>,
}

impl ScenarioWorkflow {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        snapshot_id: i64,
        name: &str,
        config: &ScenarioConfig,
        actor: &str,
        role: Role,
    ) -> Result<Scenario> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        let id = self.store.insert_scenario(snapshot_id, name, config, actor)?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Create",
            "scenario",
            Some(id),
            Some(snapshot_id),
            None,
            None,
            None,
        )?;
        self.store.get_scenario(id)
    }

    pub fn submit(&self, scenario_id: i64, actor: &str, role: Role) -> Result<Scenario> {
        let scenario = self.store.get_scenario(scenario_id)?;
        let snapshot = self.store.get_snapshot(scenario.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        if scenario.status != ScenarioStatus::Draft {
            return Err(DomainError::State(format!(
                "Scenario {scenario_id} is {}, expected DRAFT",
                scenario.status.as_str()
            )));
        }
        self.store
            .update_scenario_status(scenario_id, ScenarioStatus::Proposed, None)?;
        self.audit(&scenario, ScenarioStatus::Proposed, actor, role)?;
        self.store.get_scenario(scenario_id)
    }

    pub fn approve(&self, scenario_id: i64, actor: &str, role: Role) -> Result<Scenario> {
        self.decide(scenario_id, ScenarioStatus::Approved, actor, role)
    }

    pub fn reject(&self, scenario_id: i64, actor: &str, role: Role) -> Result<Scenario> {
        self.decide(scenario_id, ScenarioStatus::Rejected, actor, role)
    }

    fn decide(
        &self,
        scenario_id: i64,
        to: ScenarioStatus,
        actor: &str,
        role: Role,
    ) -> Result<Scenario> {
        if !role.can_lock() {
            return Err(DomainError::Policy(
                "Only the lock-capable role may decide scenarios".to_string(),
            ));
        }
        let scenario = self.store.get_scenario(scenario_id)?;
        let snapshot = self.store.get_snapshot(scenario.snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        if scenario.status != ScenarioStatus::Proposed {
            return Err(DomainError::State(format!(
                "Scenario {scenario_id} is {}, expected PROPOSED",
                scenario.status.as_str()
            )));
        }
        let approved_by = (to == ScenarioStatus::Approved).then_some(actor);
        self.store
            .update_scenario_status(scenario_id, to, approved_by)?;
        self.audit(&scenario, to, actor, role)?;
        self.store.get_scenario(scenario_id)
    }

    fn audit(&self, scenario: &Scenario, to: ScenarioStatus, actor: &str, role: Role) -> Result<()> {
        self.store.append_audit(
            actor,
            role.as_str(),
            "Update",
            "scenario",
            Some(scenario.id),
            Some(scenario.snapshot_id),
            Some(
                &serde_json::json!({
                    "status": { "old": scenario.status.as_str(), "new": to.as_str() }
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

    fn setup() -> (ScenarioWorkflow, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        (ScenarioWorkflow::new(store), snapshot.id)
    }

    fn draft(workflow: &ScenarioWorkflow, snapshot_id: i64) -> Scenario {
        workflow
            .create(
                snapshot_id,
                "Customer X slips 30 days",
                &ScenarioConfig {
                    global_shock_days: 0,
                    customer_shock_days: [("Customer X".to_string(), 30)].into_iter().collect(),
                    collections_improvement_days: 0,
                },
                "maria",
                Role::Regular,
            )
            .unwrap()
    }

    #[test]
    fn test_full_lifecycle() {
        let (workflow, snapshot_id) = setup();
        let scenario = draft(&workflow, snapshot_id);
        assert_eq!(scenario.status, ScenarioStatus::Draft);

        workflow.submit(scenario.id, "maria", Role::Regular).unwrap();
        let approved = workflow
            .approve(scenario.id, "cfo", Role::LockCapable)
            .unwrap();
        assert_eq!(approved.status, ScenarioStatus::Approved);
        assert_eq!(approved.approved_by.as_deref(), Some("cfo"));
    }

    #[test]
    fn test_regular_role_cannot_approve() {
        let (workflow, snapshot_id) = setup();
        let scenario = draft(&workflow, snapshot_id);
        workflow.submit(scenario.id, "maria", Role::Regular).unwrap();
        let err = workflow
            .approve(scenario.id, "maria", Role::Regular)
            .unwrap_err();
        assert_eq!(err.code(), "POLICY_VIOLATION");
    }

    #[test]
    fn test_cannot_approve_draft() {
        let (workflow, snapshot_id) = setup();
        let scenario = draft(&workflow, snapshot_id);
        let err = workflow
            .approve(scenario.id, "cfo", Role::LockCapable)
            .unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }
}
