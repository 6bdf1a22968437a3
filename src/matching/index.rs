//! Blocking index for candidate generation.
//!
//! Four blocks keep matching at O(n*k) instead of O(n*m): extracted
//! reference tokens, amount buckets (±100), normalized counterparty names,
//! and ISO due-week keys (±1 week). Built once per snapshot from open
//! invoices, never shared across snapshots.

use crate::models::Invoice;
use chrono::{Datelike, Duration, NaiveDate};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};

lazy_static! {
    static ref REF_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"INV[-\s]?(\d+)").unwrap(),
        Regex::new(r"INVOICE[-\s]?(\d+)").unwrap(),
        Regex::new(r"#(\d+)").unwrap(),
        Regex::new(r"REF[-\s]?(\d+)").unwrap(),
        Regex::new(r"DOC[-\s]?(\d+)").unwrap(),
    ];
    static ref DIGIT_RUN: Regex = Regex::new(r"\d{4,}").unwrap();
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9\s]").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

const COMPANY_SUFFIXES: &[&str] = &[
    " ltd", " llc", " inc", " gmbh", " ag", " sa", " bv", " nv",
];

/// Extract invoice reference tokens from free-form text.
pub fn extract_refs(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let upper = text.to_uppercase();
    let mut refs = BTreeSet::new();

    for pattern in REF_PATTERNS.iter() {
        for caps in pattern.captures_iter(&upper) {
            if let Some(m) = caps.get(1) {
                refs.insert(format!("INV-{}", m.as_str()));
                refs.insert(m.as_str().to_string());
            }
        }
    }
    for m in DIGIT_RUN.find_iter(&upper) {
        refs.insert(m.as_str().to_string());
    }
    refs.into_iter().collect()
}

/// Normalize a company name: lowercase, strip punctuation, collapse
/// whitespace, drop legal-form suffixes.
pub fn normalize_counterparty(name: &str) -> String {
    if name.trim().is_empty() {
        return String::new();
    }
    let lowered = name.to_lowercase();
    let stripped = NON_ALNUM.replace_all(&lowered, "");
    let mut collapsed = WHITESPACE
        .replace_all(stripped.trim(), " ")
        .to_string();
    for suffix in COMPANY_SUFFIXES {
        if let Some(rest) = collapsed.strip_suffix(suffix) {
            collapsed = rest.trim_end().to_string();
            break;
        }
    }
    collapsed
}

/// ISO week key in the form `YYYY-Www`.
pub fn week_key(date: NaiveDate) -> String {
    let iso = date.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

fn adjacent_week_keys(date: NaiveDate) -> [String; 3] {
    [
        week_key(date - Duration::weeks(1)),
        week_key(date),
        week_key(date + Duration::weeks(1)),
    ]
}

fn amount_bucket(amount: f64) -> i64 {
    ((amount.abs() / 100.0).floor() as i64) * 100
}

/// Open invoice with its remaining unallocated amount.
#[derive(Debug, Clone)]
pub struct IndexedInvoice {
    pub invoice: Invoice,
    pub open_amount: f64,
}

#[derive(Default)]
pub struct BlockingIndex {
    by_ref: HashMap<String, BTreeSet<i64>>,
    by_amount_bucket: HashMap<i64, BTreeSet<i64>>,
    by_counterparty: HashMap<String, BTreeSet<i64>>,
    by_due_week: HashMap<String, BTreeSet<i64>>,
    invoices: HashMap<i64, IndexedInvoice>,
}

impl BlockingIndex {
    /// Build from open invoices and their already-approved allocation
    /// totals. Paid invoices and fully-allocated invoices are excluded.
    pub fn build(entries: Vec<(Invoice, f64)>) -> Self {
        let mut index = Self::default();
        for (invoice, approved_total) in entries {
            if invoice.payment_date.is_some() {
                continue;
            }
            let open_amount = (invoice.amount - approved_total).max(0.0);
            if open_amount <= 0.01 {
                continue;
            }
            let id = invoice.id;

            for token in extract_refs(&invoice.document_number) {
                index.by_ref.entry(token).or_default().insert(id);
            }
            let bucket = amount_bucket(invoice.amount);
            for b in [bucket - 100, bucket, bucket + 100] {
                index.by_amount_bucket.entry(b).or_default().insert(id);
            }
            if let Some(customer) = &invoice.customer {
                let key = normalize_counterparty(customer);
                if !key.is_empty() {
                    index.by_counterparty.entry(key).or_default().insert(id);
                }
            }
            if let Some(due) = invoice.due_date {
                for key in adjacent_week_keys(due) {
                    index.by_due_week.entry(key).or_default().insert(id);
                }
            }

            index.invoices.insert(id, IndexedInvoice {
                invoice,
                open_amount,
            });
        }
        index
    }

    pub fn len(&self) -> usize {
        self.invoices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invoices.is_empty()
    }

    pub fn get(&self, invoice_id: i64) -> Option<&IndexedInvoice> {
        self.invoices.get(&invoice_id)
    }

    /// Candidate invoice ids for a transaction: intersection of the
    /// non-empty amount / counterparty / date blocks, with reference hits
    /// unioned in afterwards.
    pub fn query(
        &self,
        amount: f64,
        counterparty: Option<&str>,
        txn_date: Option<NaiveDate>,
        refs: &[String],
        amount_tolerance: f64,
        date_window_days: i64,
    ) -> BTreeSet<i64> {
        let mut candidates: Option<BTreeSet<i64>> = None;

        // Amount block, refined by the actual relative tolerance.
        let bucket = amount_bucket(amount);
        let mut amount_hits = BTreeSet::new();
        for b in [bucket - 100, bucket, bucket + 100] {
            if let Some(ids) = self.by_amount_bucket.get(&b) {
                amount_hits.extend(ids.iter().copied());
            }
        }
        amount_hits.retain(|id| {
            self.invoices
                .get(id)
                .map(|entry| within_tolerance(amount.abs(), entry.invoice.amount, amount_tolerance))
                .unwrap_or(false)
        });
        if !amount_hits.is_empty() {
            candidates = Some(amount_hits);
        }

        // Counterparty block.
        if let Some(name) = counterparty {
            let key = normalize_counterparty(name);
            if let Some(ids) = self.by_counterparty.get(&key) {
                if !ids.is_empty() {
                    candidates = Some(match candidates {
                        Some(existing) => existing.intersection(ids).copied().collect(),
                        None => ids.clone(),
                    });
                }
            }
        }

        // Date-window block.
        if let Some(date) = txn_date {
            let mut date_hits = BTreeSet::new();
            for key in adjacent_week_keys(date) {
                if let Some(ids) = self.by_due_week.get(&key) {
                    date_hits.extend(ids.iter().copied());
                }
            }
            date_hits.retain(|id| {
                self.invoices
                    .get(id)
                    .and_then(|entry| entry.invoice.due_date)
                    .map(|due| (date - due).num_days().abs() <= date_window_days)
                    .unwrap_or(false)
            });
            if !date_hits.is_empty() {
                candidates = Some(match candidates {
                    Some(existing) => existing.intersection(&date_hits).copied().collect(),
                    None => date_hits,
                });
            }
        }

        // Reference hits are additive, never restrictive.
        let mut result = candidates.unwrap_or_default();
        for token in refs {
            if let Some(ids) = self.by_ref.get(&token.to_uppercase()) {
                result.extend(ids.iter().copied());
            }
        }
        result
    }
}

pub(crate) fn within_tolerance(a: f64, b: f64, tolerance: f64) -> bool {
    if b == 0.0 {
        return false;
    }
    (a - b.abs()).abs() / b.abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn invoice(id: i64, number: &str, customer: &str, amount: f64, due: &str) -> Invoice {
        Invoice {
            id,
            snapshot_id: 1,
            entity_id: None,
            canonical_id: format!("cid-{id}"),
            document_number: number.to_string(),
            document_type: "INV".to_string(),
            customer: Some(customer.to_string()),
            country: None,
            project: None,
            project_desc: None,
            terms_of_payment: None,
            payment_terms_days: None,
            amount,
            currency: "EUR".to_string(),
            issue_date: None,
            due_date: Some(d(due)),
            payment_date: None,
            predicted_payment_date: None,
            confidence_p25: None,
            confidence_p75: None,
            predicted_delay_days: None,
            prediction_segment: None,
            truth_label: None,
        }
    }

    #[test]
    fn test_extract_refs_patterns() {
        let refs = extract_refs("Payment INV-1042 ref 998877 thanks");
        assert!(refs.contains(&"1042".to_string()));
        assert!(refs.contains(&"INV-1042".to_string()));
        assert!(refs.contains(&"998877".to_string()));
    }

    #[test]
    fn test_extract_refs_dedup_and_empty() {
        let refs = extract_refs("INV-5 #12345 12345");
        let count = refs.iter().filter(|r| *r == "12345").count();
        assert_eq!(count, 1);
        assert!(extract_refs("   ").is_empty());
    }

    #[test]
    fn test_normalize_counterparty() {
        assert_eq!(normalize_counterparty("ACME Corp GmbH"), "acme corp");
        assert_eq!(normalize_counterparty("Supplier, Ltd."), "supplier");
        assert_eq!(normalize_counterparty("  Big   Name  "), "big name");
    }

    #[test]
    fn test_week_key_iso() {
        // 2026-01-01 is a Thursday in ISO week 1.
        assert_eq!(week_key(d("2026-01-01")), "2026-W01");
        // 2024-12-30 is a Monday belonging to ISO week 1 of 2025.
        assert_eq!(week_key(d("2024-12-30")), "2025-W01");
    }

    #[test]
    fn test_index_excludes_paid_and_exhausted() {
        let mut paid = invoice(1, "INV-001", "ACME", 100.0, "2026-01-31");
        paid.payment_date = Some(d("2026-01-20"));
        let exhausted = invoice(2, "INV-002", "ACME", 100.0, "2026-01-31");
        let open = invoice(3, "INV-003", "ACME", 100.0, "2026-01-31");

        let index = BlockingIndex::build(vec![
            (paid, 0.0),
            (exhausted, 100.0),
            (open, 30.0),
        ]);
        assert_eq!(index.len(), 1);
        assert!((index.get(3).unwrap().open_amount - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_query_intersects_blocks_and_unions_refs() {
        let index = BlockingIndex::build(vec![
            (invoice(1, "INV-001", "ACME Corp", 1000.0, "2026-01-30"), 0.0),
            (invoice(2, "INV-002", "ACME Corp", 5000.0, "2026-01-30"), 0.0),
            (invoice(3, "INV-003", "Other GmbH", 1000.0, "2026-06-30"), 0.0),
        ]);

        // Amount + counterparty point to invoice 1; the INV-002 reference
        // token unions invoice 2 back in.
        let refs = extract_refs("paying INV-002");
        let hits = index.query(
            1000.0,
            Some("ACME Corp"),
            Some(d("2026-01-29")),
            &refs,
            0.02,
            7,
        );
        assert!(hits.contains(&1));
        assert!(hits.contains(&2));
        assert!(!hits.contains(&3));
    }

    #[test]
    fn test_query_date_window_filters() {
        let index = BlockingIndex::build(vec![
            (invoice(1, "INV-001", "ACME", 1000.0, "2026-01-30"), 0.0),
        ]);
        // Within the same ISO week but outside the 2-day window.
        let hits = index.query(500.0, None, Some(d("2026-01-26")), &[], 0.02, 2);
        assert!(hits.is_empty());
    }
}
