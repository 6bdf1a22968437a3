//! Probabilistic payment forecast.
//!
//! Hierarchical segmentation with recency-weighted, outlier-robust delay
//! distributions, split-conformal calibration, and prediction application
//! to open invoices. Aggregation converts to base currency through
//! snapshot FX; anything without a rate lands in the Unknown bucket and is
//! never converted at 1.0.

pub mod calibration;
pub mod stats;

use crate::error::Result;
use crate::models::{CalibrationRecord, Invoice, ScenarioConfig, SegmentStats};
use crate::store::Store;
use crate::workflow::assert_snapshot_not_locked;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Minimum rows a segment needs before its statistics are trusted.
pub const MIN_SAMPLE: usize = 15;

/// Delay clipping range in days before any statistics are computed.
pub const DELAY_CLIP: (f64, f64) = (-30.0, 180.0);

/// Hierarchical fallback, most specific first. The first segment with
/// enough rows wins.
const HIERARCHY: &[&[&str]] = &[
    &["customer", "country", "terms_of_payment"],
    &["customer", "country"],
    &["customer"],
    &["country"],
    &[],
];

fn segment_type_name(levels: &[&str]) -> String {
    if levels.is_empty() {
        "Global".to_string()
    } else {
        levels.join("+")
    }
}

fn level_value(invoice: &Invoice, level: &str) -> String {
    let value = match level {
        "customer" => invoice.customer.as_deref(),
        "country" => invoice.country.as_deref(),
        "terms_of_payment" => invoice.terms_of_payment.as_deref(),
        _ => None,
    };
    value.unwrap_or("").trim().to_string()
}

fn segment_key(invoice: &Invoice, levels: &[&str]) -> String {
    levels
        .iter()
        .map(|l| level_value(invoice, l))
        .collect::<Vec<_>>()
        .join("+")
}

/// Conservative defaults used when no payment history exists at all.
fn default_global_stats(snapshot_id: i64) -> SegmentStats {
    SegmentStats {
        snapshot_id,
        segment_type: "Global".to_string(),
        segment_key: String::new(),
        sample_size: 0,
        p25_delay: -7.0,
        p50_delay: 0.0,
        p75_delay: 14.0,
        p90_delay: 30.0,
        mean_delay: 0.0,
        std_delay: 15.0,
    }
}

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastRunSummary {
    pub snapshot_id: i64,
    pub paid_rows: usize,
    pub segments_analyzed: usize,
    pub calibrated_segments: usize,
    pub invoices_forecasted: usize,
}

/// One week of forecast inflows, base currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeekBucket {
    pub label: String,
    pub start_date: NaiveDate,
    /// P50 landing total.
    pub base: f64,
    /// P25 landing total ("upside": cash arrives early).
    pub upside: f64,
    /// P75 landing total ("downside").
    pub downside: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastAggregation {
    pub snapshot_id: i64,
    pub base_currency: String,
    pub weeks: Vec<WeekBucket>,
    /// Open amounts that could not be mapped to base currency. Never
    /// silently zero-filled.
    pub unknown_amount: f64,
    pub unknown_invoices: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftWarning {
    pub segment: String,
    pub issue: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationDiagnostics {
    pub average_coverage_p25_p75: Option<f64>,
    pub average_calibration_error: Option<f64>,
    pub expected_coverage: f64,
    pub calibrated_segments: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleSizeDiagnostics {
    pub minimum: i64,
    pub maximum: i64,
    pub median: f64,
    pub minimum_required: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub recency_half_life_days: f64,
    pub winsorize_percentile: usize,
    pub min_sample_size: usize,
    pub hierarchy_levels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastDiagnostics {
    pub snapshot_id: i64,
    pub total_segments: usize,
    pub segments_with_sufficient_data: usize,
    pub segments_with_insufficient_data: usize,
    pub calibration: CalibrationDiagnostics,
    pub sample_sizes: SampleSizeDiagnostics,
    pub drift_warnings: Vec<DriftWarning>,
    pub model_config: ModelConfig,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ForecastEngine {
    store: Arc<Store>,
}

struct PaidRow {
    invoice_idx: usize,
    delay: f64,
    weight: f64,
}

impl ForecastEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Build segment statistics, calibrate, and apply predictions to every
    /// open invoice of the snapshot. `as_of` anchors recency weighting.
    pub fn run(&self, snapshot_id: i64, as_of: NaiveDate) -> Result<ForecastRunSummary> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        assert_snapshot_not_locked(&snapshot)?;
        let lock = self.store.snapshot_write_lock(snapshot_id);
        let _held = lock.lock();

        let invoices = self.store.list_invoices(snapshot_id)?;

        // Paid subset with clipped delays.
        let mut paid: Vec<PaidRow> = Vec::new();
        for (idx, inv) in invoices.iter().enumerate() {
            let (Some(payment), Some(due)) = (inv.payment_date, inv.due_date) else {
                continue;
            };
            let delay =
                ((payment - due).num_days() as f64).clamp(DELAY_CLIP.0, DELAY_CLIP.1);
            let age = (as_of - payment).num_days() as f64;
            paid.push(PaidRow {
                invoice_idx: idx,
                delay,
                weight: stats::recency_weight(age),
            });
        }

        // Winsorize against the whole paid population.
        if let Some((lo, hi)) = stats::winsorize_bounds(
            &paid.iter().map(|p| p.delay).collect::<Vec<_>>(),
        ) {
            for row in paid.iter_mut() {
                row.delay = row.delay.clamp(lo, hi);
            }
        }

        // Segment statistics per hierarchy level.
        let mut segment_stats: BTreeMap<(String, String), SegmentStats> = BTreeMap::new();
        let mut segment_delays: BTreeMap<(String, String), Vec<f64>> = BTreeMap::new();

        for levels in HIERARCHY {
            let seg_type = segment_type_name(levels);
            if levels.is_empty() {
                if !paid.is_empty() {
                    let pairs: Vec<(f64, f64)> =
                        paid.iter().map(|p| (p.delay, p.weight)).collect();
                    segment_stats.insert(
                        (seg_type.clone(), String::new()),
                        build_stats(snapshot_id, &seg_type, "", &pairs),
                    );
                    segment_delays.insert(
                        (seg_type, String::new()),
                        paid.iter().map(|p| p.delay).collect(),
                    );
                }
                continue;
            }

            let mut groups: BTreeMap<String, Vec<&PaidRow>> = BTreeMap::new();
            for row in &paid {
                let key = segment_key(&invoices[row.invoice_idx], levels);
                groups.entry(key).or_default().push(row);
            }
            for (key, rows) in groups {
                if rows.len() < MIN_SAMPLE {
                    continue;
                }
                let pairs: Vec<(f64, f64)> =
                    rows.iter().map(|p| (p.delay, p.weight)).collect();
                segment_stats.insert(
                    (seg_type.clone(), key.clone()),
                    build_stats(snapshot_id, &seg_type, &key, &pairs),
                );
                segment_delays.insert(
                    (seg_type.clone(), key),
                    rows.iter().map(|p| p.delay).collect(),
                );
            }
        }

        if segment_stats.is_empty() {
            segment_stats.insert(
                ("Global".to_string(), String::new()),
                default_global_stats(snapshot_id),
            );
        }

        let stats_rows: Vec<SegmentStats> = segment_stats.values().cloned().collect();
        self.store.replace_segment_stats(snapshot_id, &stats_rows)?;

        // Split-conformal calibration for segments with enough history.
        let mut calibration_rows = Vec::new();
        for ((seg_type, seg_key), delays) in &segment_delays {
            if delays.len() < MIN_SAMPLE * 2 {
                continue;
            }
            if let Some(summary) = calibration::calibrate(delays, MIN_SAMPLE) {
                debug!(
                    segment = %format!("{seg_type}::{seg_key}"),
                    coverage = summary.coverage_p25,
                    error = summary.calibration_error,
                    "segment calibrated"
                );
                calibration_rows.push(CalibrationRecord {
                    snapshot_id,
                    segment_type: seg_type.clone(),
                    segment_key: seg_key.clone(),
                    coverage_p25: summary.coverage_p25,
                    coverage_p50: summary.coverage_p50,
                    coverage_p75: summary.coverage_p75,
                    coverage_p90: summary.coverage_p90,
                    calibration_error: summary.calibration_error,
                    sample_size: delays.len() as i64,
                    backtest_splits: summary.splits_used as i64,
                });
            }
        }
        self.store
            .replace_calibration_stats(snapshot_id, &calibration_rows)?;

        // Apply predictions to open invoices via hierarchy walk.
        let mut forecasted = 0usize;
        for inv in &invoices {
            if inv.payment_date.is_some() {
                continue;
            }
            let Some(due) = inv.due_date else { continue };

            let mut chosen: Option<&SegmentStats> = None;
            for levels in HIERARCHY {
                let seg_type = segment_type_name(levels);
                let key = if levels.is_empty() {
                    String::new()
                } else {
                    segment_key(inv, levels)
                };
                if let Some(stats) = segment_stats.get(&(seg_type, key)) {
                    chosen = Some(stats);
                    break;
                }
            }
            let fallback = default_global_stats(snapshot_id);
            let stats = chosen.unwrap_or(&fallback);

            let p50 = stats.p50_delay.round() as i64;
            let p25 = stats.p25_delay.round() as i64;
            let p75 = stats.p75_delay.round() as i64;
            self.store.update_invoice_prediction(
                inv.id,
                Some(due + Duration::days(p50)),
                Some(due + Duration::days(p25)),
                Some(due + Duration::days(p75)),
                p50,
                &stats.segment_type,
            )?;
            forecasted += 1;
        }

        info!(
            snapshot_id,
            paid = paid.len(),
            segments = segment_stats.len(),
            calibrated = calibration_rows.len(),
            forecasted,
            "forecast run complete"
        );

        Ok(ForecastRunSummary {
            snapshot_id,
            paid_rows: paid.len(),
            segments_analyzed: segment_stats.len(),
            calibrated_segments: calibration_rows.len(),
            invoices_forecasted: forecasted,
        })
    }

    /// Weekly base-currency inflow aggregation over a 13-week horizon.
    pub fn weekly_aggregation(
        &self,
        snapshot_id: i64,
        as_of: NaiveDate,
    ) -> Result<ForecastAggregation> {
        self.aggregate_with_shift(snapshot_id, as_of, None)
    }

    /// Weekly aggregation with a scenario's day shifts applied on top.
    pub fn apply_scenario(
        &self,
        snapshot_id: i64,
        as_of: NaiveDate,
        config: &ScenarioConfig,
    ) -> Result<ForecastAggregation> {
        self.aggregate_with_shift(snapshot_id, as_of, Some(config))
    }

    fn aggregate_with_shift(
        &self,
        snapshot_id: i64,
        as_of: NaiveDate,
        scenario: Option<&ScenarioConfig>,
    ) -> Result<ForecastAggregation> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        let entity = self.store.get_entity(snapshot.entity_id)?;
        let base_currency = entity.base_currency.clone();

        struct Landing {
            amount_base: f64,
            p50: NaiveDate,
            p25: NaiveDate,
            p75: NaiveDate,
        }

        let mut landings: Vec<Landing> = Vec::new();
        let mut unknown_amount = 0.0;
        let mut unknown_invoices = 0usize;

        for inv in self.store.list_open_invoices(snapshot_id)? {
            let (Some(p50), Some(p25), Some(p75)) =
                (inv.predicted_payment_date, inv.confidence_p25, inv.confidence_p75)
            else {
                continue;
            };
            let Some(rate) = self
                .store
                .get_fx_rate(snapshot_id, &inv.currency, &base_currency)?
            else {
                unknown_amount += inv.amount.abs();
                unknown_invoices += 1;
                continue;
            };
            let shift = scenario
                .map(|c| {
                    let customer_shift = inv
                        .customer
                        .as_deref()
                        .and_then(|name| c.customer_shock_days.get(name))
                        .copied()
                        .unwrap_or(0);
                    c.global_shock_days + customer_shift - c.collections_improvement_days
                })
                .unwrap_or(0);
            landings.push(Landing {
                amount_base: inv.amount * rate,
                p50: p50 + Duration::days(shift),
                p25: p25 + Duration::days(shift),
                p75: p75 + Duration::days(shift),
            });
        }

        // Adaptive start: pin to this week unless the forecast is mostly
        // historical, in which case center on the data.
        let monday = |d: NaiveDate| d - Duration::days(d.weekday().num_days_from_monday() as i64);
        let mut start = monday(as_of);
        if let Some(first) = landings.iter().map(|l| l.p50).min() {
            if (as_of - first).num_days() > 28 {
                start = monday(first);
            }
        }

        let mut weeks = Vec::with_capacity(13);
        for i in 0..13 {
            let w_start = start + Duration::weeks(i);
            let w_end = w_start + Duration::weeks(1);
            let in_week = |d: NaiveDate| d >= w_start && d < w_end;

            let base = landings
                .iter()
                .filter(|l| in_week(l.p50))
                .map(|l| l.amount_base)
                .sum();
            let upside = landings
                .iter()
                .filter(|l| in_week(l.p25))
                .map(|l| l.amount_base)
                .sum();
            let downside = landings
                .iter()
                .filter(|l| in_week(l.p75))
                .map(|l| l.amount_base)
                .sum();

            weeks.push(WeekBucket {
                label: format!("W{} ({})", i + 1, w_start.format("%m/%d")),
                start_date: w_start,
                base,
                upside,
                downside,
            });
        }

        Ok(ForecastAggregation {
            snapshot_id,
            base_currency,
            weeks,
            unknown_amount,
            unknown_invoices,
        })
    }

    /// Forecast quality diagnostics with drift warnings.
    pub fn diagnostics(&self, snapshot_id: i64) -> Result<ForecastDiagnostics> {
        let segments = self.store.list_segment_stats(snapshot_id)?;
        let calibrations = self.store.list_calibration_stats(snapshot_id)?;

        let sufficient = segments
            .iter()
            .filter(|s| s.sample_size >= MIN_SAMPLE as i64)
            .count();

        let mut sample_sizes: Vec<i64> = segments.iter().map(|s| s.sample_size).collect();
        sample_sizes.sort_unstable();
        let median = if sample_sizes.is_empty() {
            0.0
        } else if sample_sizes.len() % 2 == 1 {
            sample_sizes[sample_sizes.len() / 2] as f64
        } else {
            let mid = sample_sizes.len() / 2;
            (sample_sizes[mid - 1] + sample_sizes[mid]) as f64 / 2.0
        };

        let mut drift_warnings = Vec::new();
        for calib in &calibrations {
            let segment = format!("{}::{}", calib.segment_type, calib.segment_key);
            if calib.coverage_p25 < 0.40 || calib.coverage_p25 > 0.60 {
                drift_warnings.push(DriftWarning {
                    segment: segment.clone(),
                    issue: "coverage_out_of_range".to_string(),
                    value: calib.coverage_p25,
                    threshold: 0.50,
                });
            }
            if calib.calibration_error > 0.10 {
                drift_warnings.push(DriftWarning {
                    segment,
                    issue: "high_calibration_error".to_string(),
                    value: calib.calibration_error,
                    threshold: 0.10,
                });
            }
        }

        let (avg_coverage, avg_error) = if calibrations.is_empty() {
            (None, None)
        } else {
            let n = calibrations.len() as f64;
            (
                Some(calibrations.iter().map(|c| c.coverage_p25).sum::<f64>() / n),
                Some(calibrations.iter().map(|c| c.calibration_error).sum::<f64>() / n),
            )
        };

        Ok(ForecastDiagnostics {
            snapshot_id,
            total_segments: segments.len(),
            segments_with_sufficient_data: sufficient,
            segments_with_insufficient_data: segments.len() - sufficient,
            calibration: CalibrationDiagnostics {
                average_coverage_p25_p75: avg_coverage,
                average_calibration_error: avg_error,
                expected_coverage: 0.50,
                calibrated_segments: calibrations.len(),
            },
            sample_sizes: SampleSizeDiagnostics {
                minimum: sample_sizes.first().copied().unwrap_or(0),
                maximum: sample_sizes.last().copied().unwrap_or(0),
                median,
                minimum_required: MIN_SAMPLE,
            },
            drift_warnings,
            model_config: ModelConfig {
                recency_half_life_days: stats::RECENCY_HALF_LIFE_DAYS,
                winsorize_percentile: stats::WINSORIZE_PERCENTILE,
                min_sample_size: MIN_SAMPLE,
                hierarchy_levels: HIERARCHY.iter().map(|l| segment_type_name(l)).collect(),
            },
        })
    }
}

fn build_stats(
    snapshot_id: i64,
    segment_type: &str,
    segment_key: &str,
    pairs: &[(f64, f64)],
) -> SegmentStats {
    let (mean, std) = stats::weighted_mean_std(pairs);
    SegmentStats {
        snapshot_id,
        segment_type: segment_type.to_string(),
        segment_key: segment_key.to_string(),
        sample_size: pairs.len() as i64,
        p25_delay: stats::weighted_percentile(pairs, 25.0),
        p50_delay: stats::weighted_percentile(pairs, 50.0),
        p75_delay: stats::weighted_percentile(pairs, 75.0),
        p90_delay: stats::weighted_percentile(pairs, 90.0),
        mean_delay: mean,
        std_delay: std,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::canonical::NewInvoice;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn setup() -> (Arc<Store>, ForecastEngine, i64) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let entity = store.create_entity("Acme GmbH", "EUR", 3, &[]).unwrap();
        let snapshot = store.create_snapshot(entity.id, "W01", 0.0, 0.0).unwrap();
        let engine = ForecastEngine::new(store.clone());
        (store, engine, snapshot.id)
    }

    fn paid_invoice(
        n: usize,
        customer: &str,
        country: &str,
        terms: &str,
        delay_days: i64,
    ) -> NewInvoice {
        let due = d("2026-01-15");
        NewInvoice {
            canonical_id: format!("paid-{customer}-{n}"),
            document_number: format!("INV-{customer}-{n}"),
            document_type: "INV".to_string(),
            customer: Some(customer.to_string()),
            country: Some(country.to_string()),
            terms_of_payment: Some(terms.to_string()),
            amount: 1000.0,
            currency: "EUR".to_string(),
            due_date: Some(due),
            payment_date: Some(due + Duration::days(delay_days)),
            ..Default::default()
        }
    }

    fn open_invoice(n: usize, customer: &str, country: &str, amount: f64, currency: &str) -> NewInvoice {
        NewInvoice {
            canonical_id: format!("open-{customer}-{n}"),
            document_number: format!("INV-OPEN-{n}"),
            document_type: "INV".to_string(),
            customer: Some(customer.to_string()),
            country: Some(country.to_string()),
            terms_of_payment: Some("NET30".to_string()),
            amount,
            currency: currency.to_string(),
            due_date: Some(d("2026-03-01")),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_history_falls_back_to_global_default() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_invoice(snapshot_id, &open_invoice(1, "ACME", "DE", 1000.0, "EUR"))
            .unwrap();

        let summary = engine.run(snapshot_id, d("2026-02-01")).unwrap();
        assert_eq!(summary.paid_rows, 0);
        assert_eq!(summary.invoices_forecasted, 1);

        let segments = store.list_segment_stats(snapshot_id).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].segment_type, "Global");

        let inv = &store.list_open_invoices(snapshot_id).unwrap()[0];
        // Default P50 is zero delay: prediction lands on the due date.
        assert_eq!(inv.predicted_payment_date, Some(d("2026-03-01")));
        assert_eq!(inv.confidence_p25, Some(d("2026-02-22")));
        assert_eq!(inv.confidence_p75, Some(d("2026-03-15")));
    }

    #[test]
    fn test_segment_hierarchy_prefers_specific_level() {
        let (store, engine, snapshot_id) = setup();
        // 20 paid rows for ACME/DE/NET30 with ~10 day delays.
        for n in 0..20 {
            store
                .insert_invoice(snapshot_id, &paid_invoice(n, "ACME", "DE", "NET30", 10))
                .unwrap();
        }
        // Unrelated history with 60 day delays.
        for n in 0..20 {
            store
                .insert_invoice(snapshot_id, &paid_invoice(n, "Zeta", "FR", "NET60", 60))
                .unwrap();
        }
        store
            .insert_invoice(snapshot_id, &open_invoice(1, "ACME", "DE", 1000.0, "EUR"))
            .unwrap();

        engine.run(snapshot_id, d("2026-02-15")).unwrap();

        let inv = store
            .list_open_invoices(snapshot_id)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(
            inv.prediction_segment.as_deref(),
            Some("customer+country+terms_of_payment")
        );
        // ACME history says ~10 days late, not the blended 35.
        assert_eq!(inv.predicted_payment_date, Some(d("2026-03-11")));
    }

    #[test]
    fn test_small_segment_falls_back() {
        let (store, engine, snapshot_id) = setup();
        // Only 5 rows for ACME (below MIN_SAMPLE), 30 rows globally.
        for n in 0..5 {
            store
                .insert_invoice(snapshot_id, &paid_invoice(n, "ACME", "DE", "NET30", 5))
                .unwrap();
        }
        for n in 0..30 {
            store
                .insert_invoice(snapshot_id, &paid_invoice(n, "Zeta", "FR", "NET60", 20))
                .unwrap();
        }
        store
            .insert_invoice(snapshot_id, &open_invoice(1, "ACME", "DE", 1000.0, "EUR"))
            .unwrap();

        engine.run(snapshot_id, d("2026-02-15")).unwrap();
        let inv = store
            .list_open_invoices(snapshot_id)
            .unwrap()
            .into_iter()
            .next()
            .unwrap();
        assert_eq!(inv.prediction_segment.as_deref(), Some("Global"));
    }

    #[test]
    fn test_delays_clipped_and_winsorized() {
        let (store, engine, snapshot_id) = setup();
        for n in 0..16 {
            // A 400-day delay clips to 180 before stats.
            let delay = if n == 0 { 400 } else { 10 };
            store
                .insert_invoice(snapshot_id, &paid_invoice(n, "ACME", "DE", "NET30", delay))
                .unwrap();
        }
        engine.run(snapshot_id, d("2026-02-15")).unwrap();
        let segments = store.list_segment_stats(snapshot_id).unwrap();
        for s in &segments {
            assert!(s.p90_delay <= 180.0);
        }
    }

    #[test]
    fn test_calibration_rows_written_for_large_segments() {
        let (store, engine, snapshot_id) = setup();
        for n in 0..40 {
            store
                .insert_invoice(
                    snapshot_id,
                    &paid_invoice(n, "ACME", "DE", "NET30", (n % 20) as i64),
                )
                .unwrap();
        }
        let summary = engine.run(snapshot_id, d("2026-02-15")).unwrap();
        assert!(summary.calibrated_segments > 0);
        let calibrations = store.list_calibration_stats(snapshot_id).unwrap();
        assert!(!calibrations.is_empty());
        for c in &calibrations {
            assert_eq!(c.backtest_splits, 5);
            assert!(c.coverage_p25 >= 0.0 && c.coverage_p25 <= 1.0);
        }
    }

    #[test]
    fn test_missing_fx_routes_to_unknown() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_invoice(snapshot_id, &open_invoice(1, "ACME", "DE", 1000.0, "USD"))
            .unwrap();
        engine.run(snapshot_id, d("2026-02-01")).unwrap();

        let aggregation = engine
            .weekly_aggregation(snapshot_id, d("2026-02-01"))
            .unwrap();
        assert_eq!(aggregation.unknown_invoices, 1);
        assert!((aggregation.unknown_amount - 1000.0).abs() < 1e-9);
        let total: f64 = aggregation.weeks.iter().map(|w| w.base).sum();
        assert_eq!(total, 0.0);
    }

    #[test]
    fn test_credit_note_nets_against_invoice() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_invoice(snapshot_id, &open_invoice(1, "ACME", "DE", 5000.0, "EUR"))
            .unwrap();
        let mut cn = open_invoice(2, "ACME", "DE", -2000.0, "EUR");
        cn.document_type = "CN".to_string();
        store.insert_invoice(snapshot_id, &cn).unwrap();

        engine.run(snapshot_id, d("2026-02-01")).unwrap();
        let aggregation = engine
            .weekly_aggregation(snapshot_id, d("2026-02-01"))
            .unwrap();
        let total: f64 = aggregation.weeks.iter().map(|w| w.base).sum();
        assert!((total - 3000.0).abs() < 1e-9);
        assert!(total >= 0.0);
    }

    #[test]
    fn test_scenario_shifts_landings() {
        let (store, engine, snapshot_id) = setup();
        store
            .insert_invoice(snapshot_id, &open_invoice(1, "ACME", "DE", 1000.0, "EUR"))
            .unwrap();
        engine.run(snapshot_id, d("2026-02-23")).unwrap();

        let base = engine
            .weekly_aggregation(snapshot_id, d("2026-02-23"))
            .unwrap();
        let base_week = base
            .weeks
            .iter()
            .position(|w| w.base > 0.0)
            .expect("landing week");

        let config = ScenarioConfig {
            global_shock_days: 14,
            ..Default::default()
        };
        let shocked = engine
            .apply_scenario(snapshot_id, d("2026-02-23"), &config)
            .unwrap();
        let shocked_week = shocked
            .weeks
            .iter()
            .position(|w| w.base > 0.0)
            .expect("landing week");
        assert_eq!(shocked_week, base_week + 2);
    }

    #[test]
    fn test_diagnostics_reports_drift() {
        let (store, engine, snapshot_id) = setup();
        for n in 0..80 {
            let delay = if n < 64 { (n % 10) as i64 } else { 120 };
            store
                .insert_invoice(snapshot_id, &paid_invoice(n, "ACME", "DE", "NET30", delay))
                .unwrap();
        }
        engine.run(snapshot_id, d("2026-02-15")).unwrap();
        let diagnostics = engine.diagnostics(snapshot_id).unwrap();
        assert!(diagnostics.total_segments > 0);
        assert_eq!(diagnostics.calibration.expected_coverage, 0.50);
        assert_eq!(diagnostics.model_config.min_sample_size, MIN_SAMPLE);
    }
}
