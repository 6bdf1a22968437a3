//! Comments with evidence links. Soft-delete only.

use super::assert_snapshot_not_locked;
use crate::error::{DomainError, Result};
use crate::models::{Comment, EvidenceRef, Role};
use crate::store::Store;
use std::sync::Arc;

pub struct CommentWorkflow {
    store: Arc<Store>,
}

impl CommentWorkflow {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Parent snapshot lookup for lock enforcement. Comments on snapshot
    /// children resolve through their owning snapshot.
    fn snapshot_of_parent(&self, parent_type: &str, parent_id: i64) -> Result<Option<i64>> {
        match parent_type {
            "snapshot" => Ok(Some(parent_id)),
            "exception" => Ok(Some(self.store.get_exception(parent_id)?.snapshot_id)),
            "scenario" => Ok(Some(self.store.get_scenario(parent_id)?.snapshot_id)),
            "action" => Ok(Some(self.store.get_action(parent_id)?.snapshot_id)),
            _ => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        parent_type: &str,
        parent_id: i64,
        author: &str,
        body: &str,
        reply_to: Option<i64>,
        evidence: &[EvidenceRef],
        role: Role,
    ) -> Result<Comment> {
        if body.trim().is_empty() {
            return Err(DomainError::Input("Comment body is empty".to_string()));
        }
        let snapshot_id = self.snapshot_of_parent(parent_type, parent_id)?;
        if let Some(snapshot_id) = snapshot_id {
            let snapshot = self.store.get_snapshot(snapshot_id)?;
            assert_snapshot_not_locked(&snapshot)?;
        }
        if let Some(reply_to) = reply_to {
            // Replies must point at a live comment on the same parent.
            let parent = self.store.get_comment(reply_to)?;
            if parent.parent_type != parent_type || parent.parent_id != parent_id {
                return Err(DomainError::Input(
                    "reply_to references a comment on a different parent".to_string(),
                ));
            }
        }

        let id = self
            .store
            .insert_comment(parent_type, parent_id, author, body, reply_to, evidence)?;
        self.store.append_audit(
            author,
            role.as_str(),
            "Create",
            "comment",
            Some(id),
            snapshot_id,
            None,
            None,
            None,
        )?;
        self.store.get_comment(id)
    }

    pub fn soft_delete(&self, comment_id: i64, actor: &str, role: Role) -> Result<()> {
        let comment = self.store.get_comment(comment_id)?;
        let snapshot_id = self.snapshot_of_parent(&comment.parent_type, comment.parent_id)?;
        if let Some(snapshot_id) = snapshot_id {
            let snapshot = self.store.get_snapshot(snapshot_id)?;
            assert_snapshot_not_locked(&snapshot)?;
        }
        self.store.soft_delete_comment(comment_id)?;
        self.store.append_audit(
            actor,
            role.as_str(),
            "Delete",
            "comment",
            Some(comment_id),
            snapshot_id,
            None,
            None,
            None,
        )?;
        Ok(())
    }

    pub fn list(&self, parent_type: &str, parent_id: i64) -> Result<Vec<Comment>> {
        self.store.list_comments(parent_type, parent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (CommentWorkflow, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        (CommentWorkflow::new(store), snapshot.id)
    }

    #[test]
    fn test_comment_with_evidence_and_reply() {
        let (workflow, snapshot_id) = setup();
        let comment = workflow
            .create(
                "snapshot",
                snapshot_id,
                "maria",
                "FX gap traced to missing USD rate",
                None,
                &[EvidenceRef::new("fx_rate", "USD/EUR")],
                Role::Regular,
            )
            .unwrap();
        assert_eq!(comment.evidence_refs.len(), 1);

        let reply = workflow
            .create(
                "snapshot",
                snapshot_id,
                "cfo",
                "Agreed, revisit next week",
                Some(comment.id),
                &[],
                Role::LockCapable,
            )
            .unwrap();
        assert_eq!(reply.reply_to, Some(comment.id));
    }

    #[test]
    fn test_soft_delete_hides_comment() {
        let (workflow, snapshot_id) = setup();
        let comment = workflow
            .create(
                "snapshot",
                snapshot_id,
                "maria",
                "note",
                None,
                &[],
                Role::Regular,
            )
            .unwrap();
        workflow
            .soft_delete(comment.id, "maria", Role::Regular)
            .unwrap();
        assert!(workflow.list("snapshot", snapshot_id).unwrap().is_empty());
    }

    #[test]
    fn test_empty_body_rejected() {
        let (workflow, snapshot_id) = setup();
        let err = workflow
            .create("snapshot", snapshot_id, "maria", "  ", None, &[], Role::Regular)
            .unwrap_err();
        assert_eq!(err.code(), "INPUT_ERROR");
    }
}
