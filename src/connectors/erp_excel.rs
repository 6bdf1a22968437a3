//! Spreadsheet ERP export connector.
//!
//! Reads the first matching sheet in preference order Data, AR, AP,
//! Invoices, Bills (else the first non-empty sheet), takes every cell as
//! text, then types through the normalization layer. Key grouping columns
//! are forward-filled to survive merged-cell exports.

use super::normalize::{
    canonical_id, map_columns, normalize_currency, parse_amount, parse_date, CanonicalIdInput,
    DateLocale,
};
use super::{
    CanonicalRow, ColumnSpec, Connector, ExtractOptions, NormalizeError, RawRow, RecordType,
    SchemaInfo, TestReport,
};
use crate::error::{DomainError, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const SHEET_PREFERENCE: &[&str] = &["Data", "AR", "AP", "Invoices", "Bills"];

/// Columns forward-filled down the sheet (merged-cell exports leave them
/// blank on continuation rows).
const FILL_COLUMNS: &[&str] = &["country", "customer", "project", "project_desc"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErpExcelConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    /// Force "Invoice" or "VendorBill"; inferred from the sheet otherwise.
    #[serde(default)]
    pub record_kind: Option<String>,
}

#[derive(Debug)]
pub struct ErpExcelConnector {
    config: ErpExcelConfig,
    entity_id: Option<i64>,
    sheet_name: String,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    locale: DateLocale,
    column_mapping: HashMap<String, String>,
    record_type: RecordType,
}

impl ErpExcelConnector {
    pub fn open(config: ErpExcelConfig, entity_id: Option<i64>) -> Result<Self> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| DomainError::Input("erp_excel config requires a path".to_string()))?;
        let mut workbook = open_workbook_auto(&path)
            .map_err(|e| DomainError::Infrastructure(format!("open workbook {path}: {e}")))?;

        let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
        let sheet_name = match &config.sheet_name {
            Some(name) => name.clone(),
            None => SHEET_PREFERENCE
                .iter()
                .find(|p| sheet_names.iter().any(|s| s == *p))
                .map(|s| s.to_string())
                .or_else(|| sheet_names.first().cloned())
                .ok_or_else(|| DomainError::Input("Workbook has no sheets".to_string()))?,
        };

        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| DomainError::Input(format!("sheet {sheet_name}: {e}")))?;

        let mut grid: Vec<Vec<String>> = Vec::new();
        for row in range.rows() {
            grid.push(row.iter().map(cell_to_string).collect());
        }
        let headers = grid
            .first()
            .map(|h| h.iter().map(|c| c.trim().to_string()).collect::<Vec<_>>())
            .unwrap_or_default();
        let rows = grid.into_iter().skip(1).collect();

        Self::from_grid(config, entity_id, sheet_name, headers, rows)
    }

    /// Build from an already-parsed grid. Used directly by tests and by the
    /// workbook `open` path above.
    pub fn from_grid(
        config: ErpExcelConfig,
        entity_id: Option<i64>,
        sheet_name: String,
        headers: Vec<String>,
        mut rows: Vec<Vec<String>>,
    ) -> Result<Self> {
        let locale = config
            .locale
            .as_deref()
            .and_then(DateLocale::parse)
            .unwrap_or(DateLocale::Iso);
        let column_mapping = map_columns(&headers);

        // Forward-fill key grouping columns.
        for (source, canonical) in &column_mapping {
            if !FILL_COLUMNS.contains(&canonical.as_str()) {
                continue;
            }
            if let Some(col_idx) = headers.iter().position(|h| h == source) {
                let mut last = String::new();
                for row in rows.iter_mut() {
                    if let Some(cell) = row.get_mut(col_idx) {
                        let cleaned = clean_id_string(cell);
                        if cleaned.is_empty() {
                            *cell = last.clone();
                        } else {
                            *cell = cleaned.clone();
                            last = cleaned;
                        }
                    }
                }
            }
        }

        let record_type = match config.record_kind.as_deref() {
            Some("VendorBill") => RecordType::VendorBill,
            Some("Invoice") => RecordType::Invoice,
            _ => {
                if sheet_name.eq_ignore_ascii_case("AP") || sheet_name.eq_ignore_ascii_case("Bills")
                {
                    RecordType::VendorBill
                } else {
                    RecordType::Invoice
                }
            }
        };

        debug!(
            sheet = %sheet_name,
            rows = rows.len(),
            mapped = column_mapping.len(),
            "erp_excel connector ready"
        );

        Ok(Self {
            config,
            entity_id,
            sheet_name,
            headers,
            rows,
            locale,
            column_mapping,
            record_type,
        })
    }

    fn canonical_value<'a>(&self, raw: &'a RawRow, canonical: &str) -> Option<&'a str> {
        for (source, target) in &self.column_mapping {
            if target == canonical {
                if let Some(v) = raw.get(source) {
                    let v = v.trim();
                    if !v.is_empty() {
                        return Some(v);
                    }
                }
            }
        }
        None
    }
}

impl Connector for ErpExcelConnector {
    fn connector_type(&self) -> &'static str {
        "erp_excel"
    }

    fn source_type(&self) -> String {
        "erp_excel".to_string()
    }

    fn test(&self) -> TestReport {
        TestReport::ok(
            "Workbook readable",
            serde_json::json!({
                "sheet_name": self.sheet_name,
                "rows": self.rows.len(),
                "columns": self.headers.len(),
            }),
        )
    }

    fn get_schema(&self) -> Result<SchemaInfo> {
        let columns = self
            .headers
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let values: Vec<&str> = self
                    .rows
                    .iter()
                    .take(20)
                    .filter_map(|r| r.get(idx))
                    .map(|v| v.trim())
                    .filter(|v| !v.is_empty())
                    .collect();
                let type_name = if values.is_empty() {
                    "string"
                } else if values.iter().all(|v| parse_date(v, self.locale).is_some()) {
                    "date"
                } else if values.iter().all(|v| parse_amount(v).is_some()) {
                    "number"
                } else {
                    "string"
                };
                ColumnSpec {
                    name: name.clone(),
                    type_name: type_name.to_string(),
                }
            })
            .collect();
        Ok(SchemaInfo::from_columns(columns))
    }

    fn extract(&self, opts: &ExtractOptions) -> Result<Box<dyn Iterator<Item = RawRow> + Send>> {
        let mut out = Vec::new();
        for (idx, row) in self.rows.iter().enumerate() {
            // Skip fully empty rows.
            if row.iter().all(|c| c.trim().is_empty()) {
                continue;
            }
            let mut payload = BTreeMap::new();
            for (col, value) in self.headers.iter().zip(row.iter()) {
                payload.insert(col.clone(), value.clone());
            }
            let source_row_id = self
                .column_mapping
                .iter()
                .find(|(_, target)| *target == "document_number")
                .and_then(|(source, _)| payload.get(source).cloned())
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| idx.to_string());
            let raw = RawRow::new(self.sheet_name.clone(), source_row_id, idx, payload);

            if opts.since.is_some() || opts.until.is_some() {
                let date = self
                    .canonical_value(&raw, "document_date")
                    .and_then(|v| parse_date(v, self.locale));
                if let Some(date) = date {
                    if opts.since.is_some_and(|s| date < s) {
                        continue;
                    }
                    if opts.until.is_some_and(|u| date > u) {
                        continue;
                    }
                }
            }
            out.push(raw);
        }
        Ok(Box::new(out.into_iter()))
    }

    fn normalize(&self, raw: &RawRow) -> std::result::Result<CanonicalRow, NormalizeError> {
        let doc_number = self
            .canonical_value(raw, "document_number")
            .map(clean_id_string)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                NormalizeError::new(raw, "missing_document_number", "Document number is empty")
            })?;

        let amount_str = self
            .canonical_value(raw, "amount")
            .ok_or_else(|| NormalizeError::new(raw, "missing_amount", "Amount field is empty"))?;
        let amount = parse_amount(amount_str).ok_or_else(|| {
            NormalizeError::new(
                raw,
                "invalid_amount",
                format!("Could not parse amount: {amount_str:?}"),
            )
        })?;

        let currency = self
            .canonical_value(raw, "currency")
            .and_then(normalize_currency)
            .or_else(|| self.config.default_currency.clone())
            .unwrap_or_else(|| "EUR".to_string());

        let record_date = self
            .canonical_value(raw, "document_date")
            .and_then(|v| parse_date(v, self.locale));
        let due_date = self
            .canonical_value(raw, "due_date")
            .and_then(|v| parse_date(v, self.locale));
        let payment_date = self
            .canonical_value(raw, "payment_date")
            .and_then(|v| parse_date(v, self.locale));

        let counterparty = match self.record_type {
            RecordType::VendorBill => self
                .canonical_value(raw, "vendor")
                .or_else(|| self.canonical_value(raw, "counterparty")),
            _ => self
                .canonical_value(raw, "customer")
                .or_else(|| self.canonical_value(raw, "counterparty")),
        }
        .map(|s| s.to_string());

        let doc_type = self
            .canonical_value(raw, "document_type")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "INV".to_string());

        let external_id = self.canonical_value(raw, "external_id").map(clean_id_string);
        let line_id = external_id.clone().unwrap_or_else(|| "0".to_string());

        let cid = canonical_id(&CanonicalIdInput {
            source: "erp_excel",
            entity_id: self.entity_id,
            record_type: self.record_type.as_str(),
            doc_type: &doc_type,
            doc_number: &doc_number,
            counterparty: counterparty.as_deref().unwrap_or(""),
            currency: &currency,
            amount,
            doc_date: record_date,
            due_date,
            line_id: &line_id,
        });

        let payment_terms_days = self
            .canonical_value(raw, "payment_terms_days")
            .and_then(|v| v.trim().parse::<i64>().ok());

        let payload = serde_json::json!({
            "document_number": doc_number,
            "document_type": doc_type,
            "customer": self.canonical_value(raw, "customer"),
            "vendor": self.canonical_value(raw, "vendor"),
            "country": self.canonical_value(raw, "country"),
            "project": self.canonical_value(raw, "project"),
            "project_desc": self.canonical_value(raw, "project_desc"),
            "terms_of_payment": self.canonical_value(raw, "payment_terms"),
            "payment_terms_days": payment_terms_days,
            "amount": amount,
            "currency": currency,
            "document_date": record_date.map(|d| d.to_string()),
            "due_date": due_date.map(|d| d.to_string()),
            "payment_date": payment_date.map(|d| d.to_string()),
        });

        Ok(CanonicalRow {
            record_type: self.record_type,
            canonical_id: cid,
            amount: Some(amount),
            currency: Some(currency),
            record_date,
            due_date,
            counterparty,
            external_id,
            payload,
        })
    }
}

/// Remove Excel numeric artifacts from identifier cells: scientific
/// notation, trailing `.0`, and textual nulls.
fn clean_id_string(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() || matches!(v.to_lowercase().as_str(), "nan" | "none" | "null") {
        return String::new();
    }
    let upper = v.to_uppercase();
    if upper.contains("E+") || upper.contains("E-") {
        if let Ok(f) = v.parse::<f64>() {
            return format!("{}", f as i64);
        }
    }
    if let Some(stripped) = v.strip_suffix(".0") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            return stripped.to_string();
        }
    }
    v.to_string()
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                format!("{f}")
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| d.date().to_string())
            .unwrap_or_default(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
        Data::Error(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector(sheet: &str, headers: &[&str], rows: Vec<Vec<&str>>) -> ErpExcelConnector {
        ErpExcelConnector::from_grid(
            ErpExcelConfig {
                path: None,
                sheet_name: None,
                locale: Some("EU".to_string()),
                default_currency: Some("EUR".to_string()),
                record_kind: None,
            },
            Some(1),
            sheet.to_string(),
            headers.iter().map(|h| h.to_string()).collect(),
            rows.into_iter()
                .map(|r| r.into_iter().map(|c| c.to_string()).collect())
                .collect(),
        )
        .unwrap()
    }

    const HEADERS: &[&str] = &[
        "Invoice Number",
        "Customer",
        "Country",
        "Invoice Amount",
        "Currency",
        "Document Date",
        "Due Date",
        "Payment Date",
        "Terms of Payment",
    ];

    #[test]
    fn test_normalize_invoice_row() {
        let conn = connector(
            "AR",
            HEADERS,
            vec![vec![
                "INV-001",
                "ACME Corp",
                "Germany",
                "1.234,56",
                "EUR",
                "15.01.2026",
                "14.02.2026",
                "",
                "NET30",
            ]],
        );
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        assert_eq!(rows.len(), 1);
        let norm = conn.normalize(&rows[0]).unwrap();
        assert_eq!(norm.record_type, RecordType::Invoice);
        assert_eq!(norm.amount, Some(1234.56));
        assert_eq!(norm.counterparty.as_deref(), Some("ACME Corp"));
        assert_eq!(
            norm.due_date.map(|d| d.to_string()).as_deref(),
            Some("2026-02-14")
        );
        assert_eq!(norm.payload["terms_of_payment"], "NET30");
    }

    #[test]
    fn test_forward_fill_grouping_columns() {
        let conn = connector(
            "Data",
            HEADERS,
            vec![
                vec![
                    "INV-001",
                    "ACME Corp",
                    "Germany",
                    "100",
                    "EUR",
                    "2026-01-01",
                    "2026-01-31",
                    "",
                    "NET30",
                ],
                vec![
                    "INV-002", "", "", "200", "EUR", "2026-01-02", "2026-02-01", "", "NET30",
                ],
            ],
        );
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        let second = conn.normalize(&rows[1]).unwrap();
        assert_eq!(second.counterparty.as_deref(), Some("ACME Corp"));
        assert_eq!(second.payload["country"], "Germany");
    }

    #[test]
    fn test_ap_sheet_yields_vendor_bills() {
        let conn = connector(
            "AP",
            &["Bill Number", "Vendor", "Amount", "Currency", "Due Date"],
            vec![vec!["BILL-9", "Supplier Ltd", "500", "EUR", "2026-03-01"]],
        );
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        let norm = conn.normalize(&rows[0]).unwrap();
        assert_eq!(norm.record_type, RecordType::VendorBill);
        assert_eq!(norm.counterparty.as_deref(), Some("Supplier Ltd"));
    }

    #[test]
    fn test_clean_id_string_artifacts() {
        assert_eq!(clean_id_string("12345.0"), "12345");
        assert_eq!(clean_id_string("1.23E+4"), "12300");
        assert_eq!(clean_id_string("nan"), "");
        assert_eq!(clean_id_string(" O11 "), "O11");
    }

    #[test]
    fn test_missing_document_number_is_error() {
        let conn = connector(
            "AR",
            HEADERS,
            vec![vec![
                "", "ACME", "DE", "10", "EUR", "2026-01-01", "2026-01-31", "", "NET30",
            ]],
        );
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        let err = conn.normalize(&rows[0]).unwrap_err();
        assert_eq!(err.error_type, "missing_document_number");
    }

    #[test]
    fn test_empty_rows_skipped() {
        let conn = connector(
            "AR",
            HEADERS,
            vec![
                vec!["", "", "", "", "", "", "", "", ""],
                vec![
                    "INV-1", "A", "DE", "10", "EUR", "2026-01-01", "2026-01-31", "", "NET30",
                ],
            ],
        );
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        assert_eq!(rows.len(), 1);
    }
}
