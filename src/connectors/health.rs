//! Data health report for a normalized batch.
//!
//! Counts valid/error/warning rows, field-level completeness, amount-weighted
//! totals and a quality bucket. Issues are consolidated by
//! (type, severity, message) with their row indices merged.

use crate::models::Severity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Quality bucket derived from valid-row % and average completeness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
        }
    }
}

/// Single data health issue, possibly spanning many rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthIssue {
    pub issue_type: String,
    pub severity: Severity,
    pub row_indices: Vec<usize>,
    pub message: String,
    pub affected_amount: Option<f64>,
}

impl HealthIssue {
    pub fn new(
        issue_type: impl Into<String>,
        severity: Severity,
        row_index: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            issue_type: issue_type.into(),
            severity,
            row_indices: vec![row_index],
            message: message.into(),
            affected_amount: None,
        }
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.affected_amount = Some(amount);
        self
    }
}

/// Comprehensive data health assessment for one extracted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub error_rows: usize,
    pub warning_rows: usize,
    /// Field -> % of rows with the field populated.
    pub completeness: BTreeMap<String, f64>,
    pub issues: Vec<HealthIssue>,
    pub quality_level: QualityLevel,
    pub total_amount: f64,
    pub valid_amount: f64,
    pub amount_with_issues: f64,
    pub schema_fingerprint: String,
    pub detected_columns: Vec<String>,
    /// Source column -> canonical column.
    pub mapped_columns: BTreeMap<String, String>,
    pub unmapped_columns: Vec<String>,
}

/// Fields whose completeness feeds the quality bucket.
const CORE_FIELDS: &[&str] = &[
    "amount",
    "currency",
    "document_date",
    "due_date",
    "counterparty",
    "document_number",
];

/// Per-row facts the builder aggregates over.
#[derive(Debug, Clone, Default)]
pub struct RowFacts {
    pub row_index: usize,
    pub amount: Option<f64>,
    /// Canonical fields populated on this row.
    pub populated_fields: Vec<&'static str>,
}

/// Consolidate issues by (type, severity, message), merging row indices.
pub fn consolidate_issues(issues: Vec<HealthIssue>) -> Vec<HealthIssue> {
    let mut merged: BTreeMap<(String, String, String), HealthIssue> = BTreeMap::new();
    for issue in issues {
        let key = (
            issue.issue_type.clone(),
            issue.severity.as_str().to_string(),
            issue.message.clone(),
        );
        match merged.get_mut(&key) {
            Some(existing) => {
                existing.row_indices.extend(issue.row_indices);
                if let Some(amt) = issue.affected_amount {
                    existing.affected_amount = Some(existing.affected_amount.unwrap_or(0.0) + amt);
                }
            }
            None => {
                merged.insert(key, issue);
            }
        }
    }
    let mut out: Vec<HealthIssue> = merged.into_values().collect();
    for issue in &mut out {
        issue.row_indices.sort_unstable();
        issue.row_indices.dedup();
    }
    out
}

/// Build a health report from per-row facts and collected issues.
pub fn build_report(
    rows: &[RowFacts],
    issues: Vec<HealthIssue>,
    schema_fingerprint: String,
    detected_columns: Vec<String>,
    mapped_columns: BTreeMap<String, String>,
) -> HealthReport {
    let issues = consolidate_issues(issues);
    let total_rows = rows.len();

    let mut error_indices: BTreeSet<usize> = BTreeSet::new();
    let mut warning_indices: BTreeSet<usize> = BTreeSet::new();
    for issue in &issues {
        match issue.severity {
            Severity::Error | Severity::Critical => {
                error_indices.extend(issue.row_indices.iter().copied())
            }
            Severity::Warning => warning_indices.extend(issue.row_indices.iter().copied()),
            Severity::Info => {}
        }
    }

    let error_rows = error_indices.len();
    let warning_rows = warning_indices.difference(&error_indices).count();
    let valid_rows = total_rows.saturating_sub(error_rows);

    let mapped_canonical: BTreeSet<&str> =
        mapped_columns.values().map(|s| s.as_str()).collect();
    let mut completeness = BTreeMap::new();
    for field in CORE_FIELDS {
        let pct = if mapped_canonical.contains(field)
            || *field == "counterparty" && (mapped_canonical.contains("customer") || mapped_canonical.contains("vendor"))
        {
            if total_rows == 0 {
                0.0
            } else {
                let filled = rows
                    .iter()
                    .filter(|r| r.populated_fields.contains(field))
                    .count();
                filled as f64 / total_rows as f64 * 100.0
            }
        } else {
            0.0
        };
        completeness.insert((*field).to_string(), pct);
    }

    let mut total_amount = 0.0;
    let mut valid_amount = 0.0;
    let mut amount_with_issues = 0.0;
    for row in rows {
        if let Some(amount) = row.amount {
            total_amount += amount.abs();
            if error_indices.contains(&row.row_index) {
                amount_with_issues += amount.abs();
            } else {
                valid_amount += amount.abs();
            }
        }
    }

    let completeness_avg = if completeness.is_empty() {
        0.0
    } else {
        completeness.values().sum::<f64>() / completeness.len() as f64
    };
    let valid_pct = if total_rows == 0 {
        100.0
    } else {
        valid_rows as f64 / total_rows as f64 * 100.0
    };

    let quality_level = if valid_pct >= 95.0 && completeness_avg >= 90.0 {
        QualityLevel::Excellent
    } else if valid_pct >= 85.0 && completeness_avg >= 75.0 {
        QualityLevel::Good
    } else if valid_pct >= 70.0 && completeness_avg >= 60.0 {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    };

    let unmapped_columns = detected_columns
        .iter()
        .filter(|c| !mapped_columns.contains_key(*c))
        .cloned()
        .collect();

    HealthReport {
        total_rows,
        valid_rows,
        error_rows,
        warning_rows,
        completeness,
        issues,
        quality_level,
        total_amount,
        valid_amount,
        amount_with_issues,
        schema_fingerprint,
        detected_columns,
        mapped_columns,
        unmapped_columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(row_index: usize, amount: f64, fields: Vec<&'static str>) -> RowFacts {
        RowFacts {
            row_index,
            amount: Some(amount),
            populated_fields: fields,
        }
    }

    fn full_fields() -> Vec<&'static str> {
        vec![
            "amount",
            "currency",
            "document_date",
            "due_date",
            "counterparty",
            "document_number",
        ]
    }

    fn full_mapping() -> BTreeMap<String, String> {
        [
            ("Amount", "amount"),
            ("Currency", "currency"),
            ("Date", "document_date"),
            ("Due Date", "due_date"),
            ("Counterparty", "counterparty"),
            ("Reference", "document_number"),
        ]
        .iter()
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .collect()
    }

    #[test]
    fn test_consolidation_merges_row_indices() {
        let issues = vec![
            HealthIssue::new("invalid_amount", Severity::Error, 3, "Could not parse amount"),
            HealthIssue::new("invalid_amount", Severity::Error, 7, "Could not parse amount"),
            HealthIssue::new("missing_due_date", Severity::Warning, 3, "Due date missing"),
        ];
        let merged = consolidate_issues(issues);
        assert_eq!(merged.len(), 2);
        let parse_issue = merged
            .iter()
            .find(|i| i.issue_type == "invalid_amount")
            .unwrap();
        assert_eq!(parse_issue.row_indices, vec![3, 7]);
    }

    #[test]
    fn test_quality_excellent_for_clean_batch() {
        let rows: Vec<RowFacts> = (0..20)
            .map(|i| facts(i, 100.0, full_fields()))
            .collect();
        let report = build_report(
            &rows,
            vec![],
            "fp".to_string(),
            full_mapping().keys().cloned().collect(),
            full_mapping(),
        );
        assert_eq!(report.quality_level, QualityLevel::Excellent);
        assert_eq!(report.valid_rows, 20);
        assert_eq!(report.error_rows, 0);
        assert!((report.total_amount - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rows_split_amounts() {
        let rows = vec![
            facts(0, 100.0, full_fields()),
            facts(1, 50.0, full_fields()),
        ];
        let issues = vec![HealthIssue::new(
            "invalid_date",
            Severity::Error,
            1,
            "Could not parse date",
        )];
        let report = build_report(
            &rows,
            issues,
            "fp".to_string(),
            full_mapping().keys().cloned().collect(),
            full_mapping(),
        );
        assert_eq!(report.error_rows, 1);
        assert_eq!(report.valid_rows, 1);
        assert!((report.valid_amount - 100.0).abs() < 1e-9);
        assert!((report.amount_with_issues - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_unmapped_columns_reported() {
        let rows = vec![facts(0, 10.0, full_fields())];
        let mut detected: Vec<String> = full_mapping().keys().cloned().collect();
        detected.push("Mystery".to_string());
        let report = build_report(&rows, vec![], "fp".to_string(), detected, full_mapping());
        assert_eq!(report.unmapped_columns, vec!["Mystery".to_string()]);
    }

    #[test]
    fn test_empty_batch_is_poor() {
        let report = build_report(
            &[],
            vec![],
            "fp".to_string(),
            vec![],
            BTreeMap::new(),
        );
        assert_eq!(report.total_rows, 0);
        // 100% valid but zero completeness lands in the poor bucket.
        assert_eq!(report.quality_level, QualityLevel::Poor);
    }
}
