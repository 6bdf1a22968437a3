//! Schema drift detection between consecutive datasets of one connection.

use crate::connectors::ColumnSpec;
use crate::store::lineage::TypeChange;
use std::collections::BTreeMap;

/// Columns whose removal makes drift an error rather than a warning.
const CRITICAL_COLUMNS: &[&str] = &["amount", "currency", "date", "due_date"];

#[derive(Debug, Clone)]
pub struct DriftAssessment {
    pub added: Vec<ColumnSpec>,
    pub removed: Vec<ColumnSpec>,
    pub type_changes: Vec<TypeChange>,
    pub severity: &'static str,
}

impl DriftAssessment {
    pub fn is_drift(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty() || !self.type_changes.is_empty()
    }
}

/// Compare two column sets. Severity ladder: `error` when a critical column
/// was removed, `warning` on any removal or type change, `info` otherwise.
pub fn assess_drift(old_columns: &[ColumnSpec], new_columns: &[ColumnSpec]) -> DriftAssessment {
    let old_map: BTreeMap<&str, &ColumnSpec> =
        old_columns.iter().map(|c| (c.name.as_str(), c)).collect();
    let new_map: BTreeMap<&str, &ColumnSpec> =
        new_columns.iter().map(|c| (c.name.as_str(), c)).collect();

    let added: Vec<ColumnSpec> = new_columns
        .iter()
        .filter(|c| !old_map.contains_key(c.name.as_str()))
        .cloned()
        .collect();
    let removed: Vec<ColumnSpec> = old_columns
        .iter()
        .filter(|c| !new_map.contains_key(c.name.as_str()))
        .cloned()
        .collect();
    let type_changes: Vec<TypeChange> = old_columns
        .iter()
        .filter_map(|old| {
            new_map.get(old.name.as_str()).and_then(|new| {
                (old.type_name != new.type_name).then(|| TypeChange {
                    name: old.name.clone(),
                    old_type: old.type_name.clone(),
                    new_type: new.type_name.clone(),
                })
            })
        })
        .collect();

    let critical_removed = removed
        .iter()
        .any(|c| CRITICAL_COLUMNS.contains(&c.name.to_lowercase().as_str()));
    let severity = if critical_removed {
        "error"
    } else if !removed.is_empty() || !type_changes.is_empty() {
        "warning"
    } else {
        "info"
    };

    DriftAssessment {
        added,
        removed,
        type_changes,
        severity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, type_name: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }

    #[test]
    fn test_no_drift() {
        let cols = vec![col("amount", "number"), col("date", "date")];
        let assessment = assess_drift(&cols, &cols);
        assert!(!assessment.is_drift());
        assert_eq!(assessment.severity, "info");
    }

    #[test]
    fn test_added_column_is_info() {
        let old = vec![col("amount", "number")];
        let new = vec![col("amount", "number"), col("memo", "string")];
        let assessment = assess_drift(&old, &new);
        assert!(assessment.is_drift());
        assert_eq!(assessment.severity, "info");
        assert_eq!(assessment.added.len(), 1);
    }

    #[test]
    fn test_removed_noncritical_is_warning() {
        let old = vec![col("amount", "number"), col("memo", "string")];
        let new = vec![col("amount", "number")];
        let assessment = assess_drift(&old, &new);
        assert_eq!(assessment.severity, "warning");
    }

    #[test]
    fn test_removed_critical_is_error() {
        let old = vec![col("amount", "number"), col("currency", "string")];
        let new = vec![col("amount", "number")];
        let assessment = assess_drift(&old, &new);
        assert_eq!(assessment.severity, "error");
    }

    #[test]
    fn test_type_change_is_warning() {
        let old = vec![col("amount", "number")];
        let new = vec![col("amount", "string")];
        let assessment = assess_drift(&old, &new);
        assert_eq!(assessment.severity, "warning");
        assert_eq!(assessment.type_changes.len(), 1);
    }
}
