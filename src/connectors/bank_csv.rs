//! CSV bank statement connector.
//!
//! Delimiter is auto-detected among `,`, `;` and tab by frequency over the
//! first lines; encodings are tried in order utf-8, utf-8-sig, latin-1,
//! cp1252. All cells are read as text and typed by the normalization layer.

use super::normalize::{
    canonical_id, map_columns, normalize_currency, parse_amount, parse_date, CanonicalIdInput,
    DateLocale,
};
use super::{
    CanonicalRow, ColumnSpec, Connector, ExtractOptions, NormalizeError, RawRow, RecordType,
    SchemaInfo, TestReport,
};
use crate::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankCsvConfig {
    /// Path to the statement file. Omitted when content is supplied directly.
    #[serde(default)]
    pub path: Option<String>,
    pub bank_account_id: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub default_currency: Option<String>,
}

#[derive(Debug)]
pub struct BankCsvConnector {
    config: BankCsvConfig,
    entity_id: Option<i64>,
    text: String,
    delimiter: u8,
    locale: DateLocale,
    column_mapping: HashMap<String, String>,
    headers: Vec<String>,
}

impl BankCsvConnector {
    pub fn open(config: BankCsvConfig, entity_id: Option<i64>) -> Result<Self> {
        let path = config
            .path
            .clone()
            .ok_or_else(|| DomainError::Input("bank_csv config requires a path".to_string()))?;
        let bytes = std::fs::read(&path)
            .map_err(|e| DomainError::Infrastructure(format!("read {path}: {e}")))?;
        Self::from_bytes(config, entity_id, &bytes)
    }

    pub fn from_bytes(
        config: BankCsvConfig,
        entity_id: Option<i64>,
        bytes: &[u8],
    ) -> Result<Self> {
        let text = decode_bytes(bytes);
        let delimiter = detect_delimiter(&text);
        let locale = config
            .locale
            .as_deref()
            .and_then(DateLocale::parse)
            .unwrap_or(DateLocale::Iso);

        let headers = read_headers(&text, delimiter)?;
        let column_mapping = map_columns(&headers);
        debug!(
            delimiter = %(delimiter as char),
            columns = headers.len(),
            mapped = column_mapping.len(),
            "bank_csv connector ready"
        );

        Ok(Self {
            config,
            entity_id,
            text,
            delimiter,
            locale,
            column_mapping,
            headers,
        })
    }

    /// Value of a canonical column in this raw row, if mapped and non-empty.
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

impl Connector for BankCsvConnector {
    fn connector_type(&self) -> &'static str {
        "bank_csv"
    }

    fn source_type(&self) -> String {
        "bank_csv".to_string()
    }

    fn test(&self) -> TestReport {
        TestReport::ok(
            "CSV statement readable",
            serde_json::json!({
                "supported_delimiters": [",", ";", "\t"],
                "detected_delimiter": (self.delimiter as char).to_string(),
                "columns": self.headers.len(),
            }),
        )
    }

    fn get_schema(&self) -> Result<SchemaInfo> {
        let sample = sample_rows(&self.text, self.delimiter, 20)?;
        let columns = self
            .headers
            .iter()
            .enumerate()
            .map(|(idx, name)| ColumnSpec {
                name: name.clone(),
                type_name: infer_column_type(idx, &sample, self.locale),
            })
            .collect();
        Ok(SchemaInfo::from_columns(columns))
    }

    fn extract(&self, opts: &ExtractOptions) -> Result<Box<dyn Iterator<Item = RawRow> + Send>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_reader(self.text.as_bytes());
        let headers = self.headers.clone();

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    // A malformed line still yields a raw row so the error
                    // is captured downstream rather than silently dropped.
                    let mut payload = BTreeMap::new();
                    payload.insert("_malformed".to_string(), e.to_string());
                    rows.push(RawRow::new("bank_statement", idx.to_string(), idx, payload));
                    continue;
                }
            };
            let mut payload = BTreeMap::new();
            for (col, value) in headers.iter().zip(record.iter()) {
                payload.insert(col.clone(), value.to_string());
            }
            let source_row_id = self
                .column_mapping
                .iter()
                .find(|(_, target)| *target == "external_id")
                .and_then(|(source, _)| payload.get(source).cloned())
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| idx.to_string());

            let row = RawRow::new("bank_statement", source_row_id, idx, payload);

            // Date-window filter, applied on the parsed document date.
            if opts.since.is_some() || opts.until.is_some() {
                let date = self
                    .canonical_value(&row, "document_date")
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
            rows.push(row);
        }
        Ok(Box::new(rows.into_iter()))
    }

    fn normalize(&self, raw: &RawRow) -> std::result::Result<CanonicalRow, NormalizeError> {
        if let Some(msg) = raw.get("_malformed") {
            return Err(NormalizeError::new(raw, "malformed_row", msg));
        }

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

        let counterparty = self
            .canonical_value(raw, "counterparty")
            .or_else(|| self.canonical_value(raw, "customer"))
            .map(|s| s.to_string());

        let external_id = self
            .canonical_value(raw, "external_id")
            .map(|s| s.to_string());
        let reference = self
            .canonical_value(raw, "document_number")
            .or_else(|| self.canonical_value(raw, "description"))
            .map(|s| s.to_string());

        let doc_number = external_id
            .clone()
            .or_else(|| reference.clone())
            .unwrap_or_default();
        // Content-addressed line id so an unlabeled row still gets a
        // stable identity independent of its position in the file.
        let line_id = if doc_number.is_empty() {
            raw.raw_hash.clone()
        } else {
            "0".to_string()
        };

        let cid = canonical_id(&CanonicalIdInput {
            source: "bank_csv",
            entity_id: self.entity_id,
            record_type: RecordType::BankTxn.as_str(),
            doc_type: "TXN",
            doc_number: &doc_number,
            counterparty: counterparty.as_deref().unwrap_or(""),
            currency: &currency,
            amount,
            doc_date: record_date,
            due_date: None,
            line_id: &line_id,
        });

        let payload = serde_json::json!({
            "bank_account_id": self.config.bank_account_id,
            "reference": reference,
            "counterparty": counterparty,
            "amount": amount,
            "currency": currency,
            "transaction_date": record_date.map(|d| d.to_string()),
        });

        Ok(CanonicalRow {
            record_type: RecordType::BankTxn,
            canonical_id: cid,
            amount: Some(amount),
            currency: Some(currency),
            record_date,
            due_date: None,
            counterparty,
            external_id,
            payload,
        })
    }
}

// =============================================================================
// DECODING & DETECTION
// =============================================================================

/// Decode statement bytes, trying utf-8, utf-8-sig, latin-1, cp1252.
fn decode_bytes(bytes: &[u8]) -> String {
    // utf-8-sig: strip BOM if present, then utf-8.
    let stripped = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    if let Ok(s) = std::str::from_utf8(stripped) {
        return s.to_string();
    }
    // latin-1 maps every byte 1:1 onto U+0000..U+00FF, but loses the
    // cp1252 punctuation block; prefer the cp1252 table for 0x80..0x9F.
    stripped
        .iter()
        .map(|&b| cp1252_char(b))
        .collect()
}

fn cp1252_char(b: u8) -> char {
    match b {
        0x80 => '€',
        0x82 => '‚',
        0x84 => '„',
        0x85 => '…',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '“',
        0x94 => '”',
        0x96 => '–',
        0x97 => '—',
        0xA0..=0xFF | 0x00..=0x7F => b as char,
        other => other as char,
    }
}

/// Pick the delimiter with the highest frequency over the first 5 lines.
fn detect_delimiter(text: &str) -> u8 {
    let head: String = text.lines().take(5).collect::<Vec<_>>().join("\n");
    let candidates = [b',', b';', b'\t'];
    let mut best = b',';
    let mut best_count = 0usize;
    for &cand in &candidates {
        let count = head.bytes().filter(|&b| b == cand).count();
        if count > best_count {
            best = cand;
            best_count = count;
        }
    }
    best
}

fn read_headers(text: &str, delimiter: u8) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_reader(text.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| DomainError::Input(format!("CSV header: {e}")))?;
    Ok(headers.iter().map(|h| h.trim().to_string()).collect())
}

fn sample_rows(text: &str, delimiter: u8, limit: usize) -> Result<Vec<Vec<String>>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records().take(limit) {
        if let Ok(r) = record {
            rows.push(r.iter().map(|v| v.to_string()).collect());
        }
    }
    Ok(rows)
}

/// Infer "number", "date" or "string" from the sampled values of one column.
fn infer_column_type(col_idx: usize, sample: &[Vec<String>], locale: DateLocale) -> String {
    let values: Vec<&str> = sample
        .iter()
        .filter_map(|row| row.get(col_idx))
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return "string".to_string();
    }
    if values.iter().all(|v| parse_date(v, locale).is_some()) {
        return "date".to_string();
    }
    if values.iter().all(|v| parse_amount(v).is_some()) {
        return "number".to_string();
    }
    "string".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "external_id,amount,transaction_date,counterparty,currency\n\
        TXN001,1500.00,2026-01-15,ACME Corp,EUR\n\
        TXN002,-250.50,2026-01-15,Supplier Ltd,EUR\n";

    fn connector(content: &str) -> BankCsvConnector {
        BankCsvConnector::from_bytes(
            BankCsvConfig {
                path: None,
                bank_account_id: "ACC-1".to_string(),
                locale: Some("EU".to_string()),
                default_currency: Some("EUR".to_string()),
            },
            Some(1),
            content.as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_delimiter_detection() {
        assert_eq!(detect_delimiter("a,b,c\n1,2,3"), b',');
        assert_eq!(detect_delimiter("a;b;c\n1;2;3"), b';');
        assert_eq!(detect_delimiter("a\tb\tc\n1\t2\t3"), b'\t');
    }

    #[test]
    fn test_extract_and_normalize() {
        let conn = connector(SAMPLE);
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        assert_eq!(rows.len(), 2);

        let first = conn.normalize(&rows[0]).unwrap();
        assert_eq!(first.record_type, RecordType::BankTxn);
        assert_eq!(first.amount, Some(1500.0));
        assert_eq!(first.currency.as_deref(), Some("EUR"));
        assert_eq!(first.counterparty.as_deref(), Some("ACME Corp"));
        assert_eq!(first.external_id.as_deref(), Some("TXN001"));

        let second = conn.normalize(&rows[1]).unwrap();
        assert_eq!(second.amount, Some(-250.5));
    }

    #[test]
    fn test_canonical_ids_survive_row_shuffle() {
        let shuffled = "external_id,amount,transaction_date,counterparty,currency\n\
            TXN002,-250.50,2026-01-15,Supplier Ltd,EUR\n\
            TXN001,1500.00,2026-01-15,ACME Corp,EUR\n";

        let a = connector(SAMPLE);
        let b = connector(shuffled);

        let ids = |c: &BankCsvConnector| -> std::collections::BTreeSet<String> {
            c.extract(&ExtractOptions::default())
                .unwrap()
                .map(|r| c.normalize(&r).unwrap().canonical_id)
                .collect()
        };
        assert_eq!(ids(&a), ids(&b));
    }

    #[test]
    fn test_eu_formats_parse() {
        let content = "external_id;amount;transaction_date;counterparty;currency\n\
            TXN005;€3.456,78;15.01.2026;German Client;EUR\n";
        let conn = connector(content);
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        let norm = conn.normalize(&rows[0]).unwrap();
        assert_eq!(norm.amount, Some(3456.78));
        assert_eq!(
            norm.record_date.map(|d| d.to_string()).as_deref(),
            Some("2026-01-15")
        );
    }

    #[test]
    fn test_missing_amount_is_structured_error() {
        let content = "external_id,amount,transaction_date,counterparty,currency\n\
            TXN009,,2026-01-15,Ghost GmbH,EUR\n";
        let conn = connector(content);
        let rows: Vec<RawRow> = conn.extract(&ExtractOptions::default()).unwrap().collect();
        let err = conn.normalize(&rows[0]).unwrap_err();
        assert_eq!(err.error_type, "missing_amount");
        assert_eq!(err.source_row_id, "TXN009");
    }

    #[test]
    fn test_utf8_sig_and_cp1252_decode() {
        let mut with_bom = vec![0xEF, 0xBB, 0xBF];
        with_bom.extend_from_slice(b"a,b\n1,2\n");
        assert!(decode_bytes(&with_bom).starts_with("a,b"));

        // 0x80 is the euro sign in cp1252.
        let cp1252 = vec![b'a', b',', 0x80, b'\n'];
        assert!(decode_bytes(&cp1252).contains('€'));
    }

    #[test]
    fn test_date_window_filter() {
        let conn = connector(SAMPLE);
        let opts = ExtractOptions {
            since: Some(chrono::NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()),
            until: None,
            batch_size: 100,
        };
        let rows: Vec<RawRow> = conn.extract(&opts).unwrap().collect();
        assert!(rows.is_empty());
    }
}
