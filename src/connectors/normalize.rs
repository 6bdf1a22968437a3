//! Shared normalization library for all connectors.
//!
//! Column alias mapping, locale-aware date parsing, amount parsing across US
//! and European formats, currency normalization, and the canonical-ID
//! fingerprint that makes re-ingestion idempotent.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Locale hint biasing the date-format order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateLocale {
    Iso,
    Eu,
    Us,
    De,
}

impl DateLocale {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "ISO" => Some(DateLocale::Iso),
            "EU" => Some(DateLocale::Eu),
            "US" => Some(DateLocale::Us),
            "DE" => Some(DateLocale::De),
            _ => None,
        }
    }
}

/// Canonical column names with their accepted source-header aliases.
///
/// Covers common ERP/bank header variants including SAP field codes and
/// German synonyms. Matching is case- and whitespace-insensitive with `-`
/// and space folded to `_`.
pub const COLUMN_ALIASES: &[(&str, &[&str])] = &[
    (
        "amount",
        &[
            "amount",
            "amt",
            "total",
            "total_amount",
            "invoice_amount",
            "bill_amount",
            "transaction_amount",
            "value",
            "sum",
            "DMBTR",
            "WRBTR",
            "debit",
            "credit",
            "Amount (EUR)",
            "Amount EUR",
            "Betrag",
        ],
    ),
    (
        "currency",
        &[
            "currency",
            "curr",
            "ccy",
            "currency_code",
            "WAERS",
            "curr_key",
            "Local Currency",
            "Währung",
        ],
    ),
    (
        "document_date",
        &[
            "document_date",
            "doc_date",
            "invoice_date",
            "bill_date",
            "transaction_date",
            "date",
            "BLDAT",
            "posting_date",
            "Datum",
        ],
    ),
    (
        "due_date",
        &[
            "due_date",
            "expected_due_date",
            "payment_due",
            "maturity_date",
            "ZFBDT",
            "due",
            "Fällig",
        ],
    ),
    (
        "payment_date",
        &[
            "payment_date",
            "paid_date",
            "settlement_date",
            "clearing_date",
            "Zahldatum",
        ],
    ),
    (
        "document_number",
        &[
            "document_number",
            "doc_number",
            "doc_num",
            "invoice_number",
            "invoice_no",
            "bill_number",
            "reference",
            "ref",
            "BELNR",
            "Belegnr",
        ],
    ),
    (
        "external_id",
        &["external_id", "ext_id", "id", "transaction_id", "txn_id"],
    ),
    (
        "customer",
        &[
            "customer",
            "customer_name",
            "cust",
            "client",
            "buyer",
            "debtor",
            "KUNNR",
            "Kunde",
        ],
    ),
    (
        "vendor",
        &[
            "vendor",
            "vendor_name",
            "supplier",
            "creditor",
            "payee",
            "LIFNR",
            "Lieferant",
        ],
    ),
    (
        "counterparty",
        &["counterparty", "party", "name", "merchant", "merchant_name"],
    ),
    (
        "document_type",
        &["document_type", "doc_type", "type", "category", "BLART"],
    ),
    ("country", &["country", "country_code", "LAND1", "Land"]),
    (
        "description",
        &[
            "description",
            "desc",
            "memo",
            "narration",
            "remarks",
            "notes",
            "Beschreibung",
        ],
    ),
    (
        "project",
        &["project", "project_number", "proj", "PROJN", "Projekt"],
    ),
    (
        "project_desc",
        &[
            "project_desc",
            "project_description",
            "project_name",
            "Projektbeschreibung",
        ],
    ),
    (
        "payment_terms",
        &[
            "payment_terms",
            "terms_of_payment",
            "terms",
            "ZTERM",
            "Zahlungsbedingungen",
        ],
    ),
    (
        "payment_terms_days",
        &[
            "payment_terms_days",
            "terms_days",
            "net_days",
            "Payment Terms (in days)",
        ],
    ),
];

/// Fold a header for alias comparison: trim, lowercase, `-`/space -> `_`.
fn fold_header(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

/// Map source columns to canonical names.
///
/// Returns source column -> canonical column. Unmapped columns are simply
/// absent (they surface as `unmapped_columns` in the health report).
pub fn map_columns(source_columns: &[String]) -> HashMap<String, String> {
    let mut mapping = HashMap::new();
    for source_col in source_columns {
        let folded = fold_header(source_col);
        'outer: for (canonical, aliases) in COLUMN_ALIASES {
            for alias in *aliases {
                if fold_header(alias) == folded {
                    mapping.insert(source_col.clone(), (*canonical).to_string());
                    break 'outer;
                }
            }
        }
    }
    mapping
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%Y%m%d",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
];

/// Parse a date with an explicit locale hint biasing ambiguous formats.
///
/// Empty/whitespace and unparseable values both yield `None`; date parsing
/// never raises.
pub fn parse_date(value: &str, locale: DateLocale) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // Strip a trailing time component if the source exported datetimes.
    let value = value
        .split_once('T')
        .map(|(d, _)| d)
        .unwrap_or(value)
        .split_once(' ')
        .map(|(d, _)| d)
        .unwrap_or(value);

    let preferred: &[&str] = match locale {
        DateLocale::Iso => &[],
        DateLocale::Eu => &["%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y"],
        DateLocale::Us => &["%m/%d/%Y"],
        DateLocale::De => &["%d.%m.%Y"],
    };

    for fmt in preferred.iter().chain(DATE_FORMATS.iter()) {
        if let Ok(d) = NaiveDate::parse_from_str(value, fmt) {
            return Some(d);
        }
    }
    None
}

lazy_static! {
    static ref EU_DECIMAL_COMMA: Regex = Regex::new(r"^[\d.]*,\d{2}$").unwrap();
}

/// Parse an amount into a 2-decimal f64, ties rounded away from zero.
///
/// Accepts US `1,234.56`, EU `1.234,56`, parenthesized negatives
/// `(1234.56)`, currency symbols and a leading minus. Empty -> `None`.
pub fn parse_amount(value: &str) -> Option<f64> {
    let mut s = value.trim().to_string();
    if s.is_empty() {
        return None;
    }

    for symbol in ["€", "$", "£", "¥", "EUR", "USD", "GBP", "CHF", "JPY"] {
        s = s.replace(symbol, "");
    }
    s = s.trim().to_string();

    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    } else if let Some(rest) = s.strip_prefix('-') {
        negative = true;
        s = rest.to_string();
    }

    // Anything still alphabetic after symbol stripping is not an amount.
    if s.chars().any(|c| c.is_alphabetic()) {
        return None;
    }

    // Disambiguate thousands vs decimal separators.
    let has_comma = s.contains(',');
    let has_dot = s.contains('.');
    if has_comma && has_dot {
        if s.rfind(',') > s.rfind('.') {
            // European: 1.234,56
            s = s.replace('.', "").replace(',', ".");
        } else {
            // US: 1,234.56
            s = s.replace(',', "");
        }
    } else if has_comma {
        if EU_DECIMAL_COMMA.is_match(&s) {
            s = s.replace(',', ".");
        } else {
            s = s.replace(',', "");
        }
    }

    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    let parsed: f64 = cleaned.parse().ok()?;
    // Magnitude is non-negative here; the epsilon absorbs binary
    // representation error so 10.005 rounds up like a decimal would.
    let rounded = (parsed * 100.0 + 1e-9).round() / 100.0;
    Some(if negative { -rounded } else { rounded })
}

/// Round to 2 decimals, ties away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Normalize a currency to an uppercase ISO code.
pub fn normalize_currency(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let upper = trimmed.to_uppercase();
    let aliased = match upper.as_str() {
        "€" | "EURO" | "EUROS" => "EUR",
        "$" | "US$" | "DOLLARS" => "USD",
        "£" | "POUNDS" => "GBP",
        "¥" | "YEN" => "JPY",
        "FRANCS" => "CHF",
        _ => "",
    };
    if !aliased.is_empty() {
        return Some(aliased.to_string());
    }
    if upper.len() == 3 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
        return Some(upper);
    }
    let letters: String = upper.chars().filter(|c| c.is_ascii_alphabetic()).take(3).collect();
    if letters.is_empty() {
        None
    } else {
        Some(letters)
    }
}

/// Inputs for the canonical-ID fingerprint, in their fixed order.
#[derive(Debug, Clone, Default)]
pub struct CanonicalIdInput<'a> {
    pub source: &'a str,
    pub entity_id: Option<i64>,
    pub record_type: &'a str,
    pub doc_type: &'a str,
    pub doc_number: &'a str,
    pub counterparty: &'a str,
    pub currency: &'a str,
    pub amount: f64,
    pub doc_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub line_id: &'a str,
}

/// Generate a stable canonical ID — the idempotency primitive.
///
/// Components are trimmed and uppercased, joined with `|`, SHA-256 hashed.
/// Whitespace, case and row order never change the ID.
pub fn canonical_id(input: &CanonicalIdInput) -> String {
    fn clean(val: &str) -> String {
        val.trim().to_uppercase()
    }

    let entity = input
        .entity_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "GLOBAL".to_string());

    let components = [
        clean(input.source),
        entity,
        clean(input.record_type),
        clean(input.doc_type),
        clean(input.doc_number),
        clean(input.counterparty).chars().take(50).collect(),
        clean(input.currency),
        format!("{:.2}", input.amount),
        input
            .doc_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        input
            .due_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        clean(input.line_id),
    ];

    let raw = components.join("|");
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of an arbitrary string, hex-encoded. Used for raw payload hashes.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_map_columns_sap_and_german() {
        let cols = vec![
            "BELNR".to_string(),
            "DMBTR".to_string(),
            "WAERS".to_string(),
            "Kunde".to_string(),
            "mystery_col".to_string(),
        ];
        let mapping = map_columns(&cols);
        assert_eq!(mapping.get("BELNR").unwrap(), "document_number");
        assert_eq!(mapping.get("DMBTR").unwrap(), "amount");
        assert_eq!(mapping.get("WAERS").unwrap(), "currency");
        assert_eq!(mapping.get("Kunde").unwrap(), "customer");
        assert!(!mapping.contains_key("mystery_col"));
    }

    #[test]
    fn test_map_columns_case_and_separator_insensitive() {
        let cols = vec!["Invoice Number".to_string(), "due-date".to_string()];
        let mapping = map_columns(&cols);
        assert_eq!(mapping.get("Invoice Number").unwrap(), "document_number");
        assert_eq!(mapping.get("due-date").unwrap(), "due_date");
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("2026-01-15", DateLocale::Iso), Some(d("2026-01-15")));
        assert_eq!(parse_date("15/01/2026", DateLocale::Eu), Some(d("2026-01-15")));
        assert_eq!(parse_date("01/15/2026", DateLocale::Us), Some(d("2026-01-15")));
        assert_eq!(parse_date("15.01.2026", DateLocale::De), Some(d("2026-01-15")));
        assert_eq!(parse_date("20260115", DateLocale::Iso), Some(d("2026-01-15")));
        assert_eq!(parse_date("15 Jan 2026", DateLocale::Iso), Some(d("2026-01-15")));
        assert_eq!(parse_date("January 15, 2026", DateLocale::Iso), Some(d("2026-01-15")));
    }

    #[test]
    fn test_parse_date_locale_bias() {
        // 03/04 is ambiguous: EU reads day-first, US month-first.
        assert_eq!(parse_date("03/04/2026", DateLocale::Eu), Some(d("2026-04-03")));
        assert_eq!(parse_date("03/04/2026", DateLocale::Us), Some(d("2026-03-04")));
    }

    #[test]
    fn test_parse_date_empty_and_invalid() {
        assert_eq!(parse_date("", DateLocale::Iso), None);
        assert_eq!(parse_date("   ", DateLocale::Iso), None);
        assert_eq!(parse_date("not a date", DateLocale::Iso), None);
    }

    #[test]
    fn test_parse_amount_us_and_eu() {
        assert_eq!(parse_amount("1,234.56"), Some(1234.56));
        assert_eq!(parse_amount("1.234,56"), Some(1234.56));
        assert_eq!(parse_amount("1234,56"), Some(1234.56));
        assert_eq!(parse_amount("1,234"), Some(1234.0));
    }

    #[test]
    fn test_parse_amount_negatives_and_symbols() {
        assert_eq!(parse_amount("(1000.00)"), Some(-1000.0));
        assert_eq!(parse_amount("-250.50"), Some(-250.5));
        assert_eq!(parse_amount("€3.456,78"), Some(3456.78));
        assert_eq!(parse_amount("$ 99.99"), Some(99.99));
    }

    #[test]
    fn test_parse_amount_rounding_and_empty() {
        assert_eq!(parse_amount("10.005"), Some(10.01));
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("n/a"), None);
    }

    #[test]
    fn test_normalize_currency() {
        assert_eq!(normalize_currency("€"), Some("EUR".to_string()));
        assert_eq!(normalize_currency("$"), Some("USD".to_string()));
        assert_eq!(normalize_currency("gbp"), Some("GBP".to_string()));
        assert_eq!(normalize_currency("usd "), Some("USD".to_string()));
        assert_eq!(normalize_currency("Swedish Krona"), Some("SWE".to_string()));
        assert_eq!(normalize_currency(""), None);
    }

    #[test]
    fn test_canonical_id_whitespace_and_case_invariant() {
        let base = CanonicalIdInput {
            source: "bank_csv",
            entity_id: Some(1),
            record_type: "BankTxn",
            doc_type: "TXN",
            doc_number: "TXN001",
            counterparty: "ACME Corp",
            currency: "EUR",
            amount: 1500.0,
            doc_date: Some(d("2026-01-15")),
            due_date: None,
            line_id: "0",
        };
        let perturbed = CanonicalIdInput {
            source: " BANK_CSV ",
            doc_number: "  txn001 ",
            counterparty: "acme corp  ",
            currency: " eur",
            ..base.clone()
        };
        assert_eq!(canonical_id(&base), canonical_id(&perturbed));
    }

    #[test]
    fn test_canonical_id_sensitive_to_amount() {
        let a = CanonicalIdInput {
            source: "bank_csv",
            doc_number: "TXN001",
            amount: 1500.0,
            ..Default::default()
        };
        let b = CanonicalIdInput {
            amount: 1500.01,
            ..a.clone()
        };
        assert_ne!(canonical_id(&a), canonical_id(&b));
    }

    #[test]
    fn test_canonical_id_counterparty_truncated_at_50() {
        let long_name = "A".repeat(80);
        let a = CanonicalIdInput {
            counterparty: &long_name,
            ..Default::default()
        };
        let truncated = "A".repeat(50);
        let padded = format!("{}{}", truncated, "B".repeat(30));
        let b = CanonicalIdInput {
            counterparty: &padded,
            ..Default::default()
        };
        assert_eq!(canonical_id(&a), canonical_id(&b));
    }
}
