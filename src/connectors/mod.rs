//! Connector SDK.
//!
//! A connector is a small capability set over one external source:
//! `test` (non-mutating probe), `get_schema` (deterministic fingerprint),
//! `extract` (lazy sequence of raw rows) and `normalize` (raw row to
//! canonical skeleton, or a structured parse error). Deep inheritance is
//! deliberately absent — each source kind is a concrete struct behind the
//! `Connector` trait, registered in a process-lifetime registry.

pub mod bank_csv;
pub mod erp_excel;
pub mod health;
pub mod normalize;
pub mod warehouse_sql;

use crate::error::{DomainError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub use bank_csv::{BankCsvConfig, BankCsvConnector};
pub use erp_excel::{ErpExcelConfig, ErpExcelConnector};
pub use warehouse_sql::{WarehouseSqlConfig, WarehouseSqlConnector};

// =============================================================================
// RECORD TYPES
// =============================================================================

/// Canonical record classes a connector may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    Invoice,
    VendorBill,
    BankTxn,
    FxRate,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Invoice => "Invoice",
            RecordType::VendorBill => "VendorBill",
            RecordType::BankTxn => "BankTxn",
            RecordType::FxRate => "FXRate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Invoice" => Some(RecordType::Invoice),
            "VendorBill" => Some(RecordType::VendorBill),
            "BankTxn" => Some(RecordType::BankTxn),
            "FXRate" => Some(RecordType::FxRate),
            _ => None,
        }
    }
}

// =============================================================================
// WIRE STRUCTURES
// =============================================================================

/// One source row preserved verbatim.
///
/// The payload keeps source column names untouched; `raw_hash` is the
/// SHA-256 of the canonicalized (key-sorted) payload, so byte-identical
/// rows hash identically regardless of column order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRow {
    pub source_table: String,
    pub source_row_id: String,
    pub row_index: usize,
    pub payload: BTreeMap<String, String>,
    pub raw_hash: String,
}

impl RawRow {
    pub fn new(
        source_table: impl Into<String>,
        source_row_id: impl Into<String>,
        row_index: usize,
        payload: BTreeMap<String, String>,
    ) -> Self {
        let canonical = serde_json::to_string(&payload).unwrap_or_default();
        let raw_hash = normalize::sha256_hex(&canonical);
        Self {
            source_table: source_table.into(),
            source_row_id: source_row_id.into(),
            row_index,
            payload,
            raw_hash,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(|s| s.as_str())
    }
}

/// Canonical skeleton produced by `normalize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalRow {
    pub record_type: RecordType,
    pub canonical_id: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub record_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub counterparty: Option<String>,
    pub external_id: Option<String>,
    /// Canonical-field payload for downstream promotion.
    pub payload: serde_json::Value,
}

/// Structured row-level parse failure. Recovered locally during sync; never
/// aborts the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeError {
    pub row_index: usize,
    pub error_type: String,
    pub message: String,
    pub source_row_id: String,
}

impl NormalizeError {
    pub fn new(
        raw: &RawRow,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            row_index: raw.row_index,
            error_type: error_type.into(),
            message: message.into(),
            source_row_id: raw.source_row_id.clone(),
        }
    }
}

/// Result of a connectivity probe. Must not mutate any state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<f64>,
    pub details: serde_json::Value,
    pub tested_at: DateTime<Utc>,
}

impl TestReport {
    pub fn ok(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            latency_ms: None,
            details,
            tested_at: Utc::now(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            latency_ms: None,
            details: serde_json::Value::Null,
            tested_at: Utc::now(),
        }
    }
}

/// Ordered column list with a deterministic fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub columns: Vec<ColumnSpec>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

impl SchemaInfo {
    /// Fingerprint = SHA-256 over the sorted `name:type` concatenation.
    pub fn from_columns(columns: Vec<ColumnSpec>) -> Self {
        let mut parts: Vec<String> = columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.type_name))
            .collect();
        parts.sort();
        let mut hasher = Sha256::new();
        hasher.update(parts.join("|").as_bytes());
        let fingerprint = hex::encode(hasher.finalize());
        Self {
            columns,
            fingerprint,
        }
    }
}

/// Extraction window and batching hints.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub batch_size: usize,
}

// =============================================================================
// CONNECTOR TRAIT & REGISTRY
// =============================================================================

/// Capability set every source variant implements.
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Stable type tag, e.g. "bank_csv".
    fn connector_type(&self) -> &'static str;

    /// Source data tag, e.g. "bank_csv" or "warehouse_snowflake".
    fn source_type(&self) -> String;

    /// Connectivity probe. Must not mutate state.
    fn test(&self) -> TestReport;

    /// Deterministic schema of the source.
    fn get_schema(&self) -> Result<SchemaInfo>;

    /// Lazy sequence of raw rows. The orchestrator consumes this in
    /// batches and commits every `batch_size` rows.
    fn extract(&self, opts: &ExtractOptions) -> Result<Box<dyn Iterator<Item = RawRow> + Send>>;

    /// Transform one raw row into a canonical skeleton.
    fn normalize(&self, raw: &RawRow) -> std::result::Result<CanonicalRow, NormalizeError>;
}

type ConnectorFactory =
    fn(config: &serde_json::Value, entity_id: Option<i64>) -> Result<Box<dyn Connector>>;

/// Process-lifetime map from connector type tags to factories.
/// Initialized once at startup; no global mutable state.
pub struct ConnectorRegistry {
    factories: BTreeMap<&'static str, ConnectorFactory>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with all built-in source variants.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("bank_csv", |config, entity_id| {
            let cfg: BankCsvConfig = serde_json::from_value(config.clone())
                .map_err(|e| DomainError::Input(format!("bank_csv config: {e}")))?;
            Ok(Box::new(BankCsvConnector::open(cfg, entity_id)?))
        });
        registry.register("erp_excel", |config, entity_id| {
            let cfg: ErpExcelConfig = serde_json::from_value(config.clone())
                .map_err(|e| DomainError::Input(format!("erp_excel config: {e}")))?;
            Ok(Box::new(ErpExcelConnector::open(cfg, entity_id)?))
        });
        registry.register("warehouse_sql", |config, entity_id| {
            let cfg: WarehouseSqlConfig = serde_json::from_value(config.clone())
                .map_err(|e| DomainError::Input(format!("warehouse_sql config: {e}")))?;
            Ok(Box::new(WarehouseSqlConnector::new(cfg, entity_id)))
        });
        registry
    }

    pub fn register(&mut self, type_tag: &'static str, factory: ConnectorFactory) {
        self.factories.insert(type_tag, factory);
    }

    pub fn create(
        &self,
        type_tag: &str,
        config: &serde_json::Value,
        entity_id: Option<i64>,
    ) -> Result<Box<dyn Connector>> {
        let factory = self
            .factories
            .get(type_tag)
            .ok_or_else(|| DomainError::Input(format!("Unknown connector type: {type_tag}")))?;
        factory(config, entity_id)
    }

    pub fn known_types(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

// =============================================================================
// HEALTH ASSESSMENT
// =============================================================================

/// Run a full extract/normalize pass and build the data health report for
/// one source. Nothing is persisted.
pub fn assess_health(
    connector: &dyn Connector,
    opts: &ExtractOptions,
) -> Result<health::HealthReport> {
    use crate::models::Severity;
    use health::{HealthIssue, RowFacts};

    let schema = connector.get_schema()?;
    let source_columns: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
    let mapped_columns: BTreeMap<String, String> =
        normalize::map_columns(&source_columns).into_iter().collect();

    let mut facts = Vec::new();
    let mut issues = Vec::new();
    for raw in connector.extract(opts)? {
        match connector.normalize(&raw) {
            Ok(row) => {
                let mut populated: Vec<&'static str> = Vec::new();
                if row.amount.is_some() {
                    populated.push("amount");
                }
                if row.currency.is_some() {
                    populated.push("currency");
                }
                if row.record_date.is_some() {
                    populated.push("document_date");
                }
                if row.due_date.is_some() {
                    populated.push("due_date");
                }
                if row.counterparty.is_some() {
                    populated.push("counterparty");
                }
                let has_doc_number = row.external_id.is_some()
                    || row
                        .payload
                        .get("document_number")
                        .and_then(|v| v.as_str())
                        .map(|s| !s.is_empty())
                        .unwrap_or(false);
                if has_doc_number {
                    populated.push("document_number");
                }
                if row.record_type == RecordType::Invoice && row.due_date.is_none() {
                    issues.push(
                        HealthIssue::new(
                            "missing_due_date",
                            Severity::Warning,
                            raw.row_index,
                            "Due date missing",
                        )
                        .with_amount(row.amount.unwrap_or(0.0).abs()),
                    );
                }
                facts.push(RowFacts {
                    row_index: raw.row_index,
                    amount: row.amount,
                    populated_fields: populated,
                });
            }
            Err(err) => {
                issues.push(HealthIssue::new(
                    err.error_type.clone(),
                    Severity::Error,
                    raw.row_index,
                    err.message.clone(),
                ));
                facts.push(RowFacts {
                    row_index: raw.row_index,
                    amount: None,
                    populated_fields: Vec::new(),
                });
            }
        }
    }

    Ok(health::build_report(
        &facts,
        issues,
        schema.fingerprint,
        source_columns,
        mapped_columns,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_row_hash_independent_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("amount".to_string(), "100".to_string());
        a.insert("ref".to_string(), "INV-1".to_string());

        let mut b = BTreeMap::new();
        b.insert("ref".to_string(), "INV-1".to_string());
        b.insert("amount".to_string(), "100".to_string());

        let row_a = RawRow::new("t", "1", 0, a);
        let row_b = RawRow::new("t", "1", 0, b);
        assert_eq!(row_a.raw_hash, row_b.raw_hash);
    }

    #[test]
    fn test_schema_fingerprint_deterministic_and_order_free() {
        let a = SchemaInfo::from_columns(vec![
            ColumnSpec {
                name: "amount".to_string(),
                type_name: "number".to_string(),
            },
            ColumnSpec {
                name: "date".to_string(),
                type_name: "date".to_string(),
            },
        ]);
        let b = SchemaInfo::from_columns(vec![
            ColumnSpec {
                name: "date".to_string(),
                type_name: "date".to_string(),
            },
            ColumnSpec {
                name: "amount".to_string(),
                type_name: "number".to_string(),
            },
        ]);
        assert_eq!(a.fingerprint, b.fingerprint);

        let c = SchemaInfo::from_columns(vec![ColumnSpec {
            name: "amount".to_string(),
            type_name: "string".to_string(),
        }]);
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = ConnectorRegistry::standard();
        let err = registry
            .create("carrier_pigeon", &serde_json::json!({}), None)
            .unwrap_err();
        assert_eq!(err.code(), "INPUT_ERROR");
    }

    #[test]
    fn test_registry_known_types() {
        let registry = ConnectorRegistry::standard();
        let types = registry.known_types();
        assert!(types.contains(&"bank_csv"));
        assert!(types.contains(&"erp_excel"));
        assert!(types.contains(&"warehouse_sql"));
    }
}
