//! Split-conformal calibration.
//!
//! For each segment with enough history, the paid delays are split into
//! folds; percentiles computed on the calibration side are scored for
//! empirical coverage on the held-out side. A well-calibrated P25–P75 band
//! covers ~50% of outcomes.

use super::stats::percentile_linear;

pub const BACKTEST_SPLITS: usize = 5;

/// Mean coverages across folds for one segment.
#[derive(Debug, Clone)]
pub struct CalibrationSummary {
    /// Coverage of the P25–P75 band (expected ~0.50).
    pub coverage_p25: f64,
    /// Cumulative coverage at P50 (expected ~0.50).
    pub coverage_p50: f64,
    /// Cumulative coverage at P75 (expected ~0.75).
    pub coverage_p75: f64,
    /// Cumulative coverage at P90 (expected ~0.90).
    pub coverage_p90: f64,
    pub calibration_error: f64,
    pub splits_used: usize,
}

/// Run k-fold split-conformal calibration over one segment's delays.
///
/// Returns `None` when no fold leaves at least `min_calibration` rows on
/// the calibration side.
pub fn calibrate(delays: &[f64], min_calibration: usize) -> Option<CalibrationSummary> {
    let n = delays.len();
    if n < BACKTEST_SPLITS {
        return None;
    }
    let split_size = n / BACKTEST_SPLITS;
    if split_size == 0 {
        return None;
    }

    let mut band_coverages = Vec::new();
    let mut p50_coverages = Vec::new();
    let mut p75_coverages = Vec::new();
    let mut p90_coverages = Vec::new();

    for split in 0..BACKTEST_SPLITS {
        let test_start = split * split_size;
        let test_end = if split == BACKTEST_SPLITS - 1 {
            n
        } else {
            (split + 1) * split_size
        };

        let test: &[f64] = &delays[test_start..test_end];
        let mut calibration: Vec<f64> = delays[..test_start]
            .iter()
            .chain(delays[test_end..].iter())
            .copied()
            .collect();
        if calibration.len() < min_calibration || test.is_empty() {
            continue;
        }
        calibration.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let p25 = percentile_linear(&calibration, 25.0);
        let p50 = percentile_linear(&calibration, 50.0);
        let p75 = percentile_linear(&calibration, 75.0);
        let p90 = percentile_linear(&calibration, 90.0);

        let len = test.len() as f64;
        band_coverages
            .push(test.iter().filter(|d| **d >= p25 && **d <= p75).count() as f64 / len);
        p50_coverages.push(test.iter().filter(|d| **d <= p50).count() as f64 / len);
        p75_coverages.push(test.iter().filter(|d| **d <= p75).count() as f64 / len);
        p90_coverages.push(test.iter().filter(|d| **d <= p90).count() as f64 / len);
    }

    if band_coverages.is_empty() {
        return None;
    }

    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
    let coverage_p25 = mean(&band_coverages);
    Some(CalibrationSummary {
        coverage_p25,
        coverage_p50: mean(&p50_coverages),
        coverage_p75: mean(&p75_coverages),
        coverage_p90: mean(&p90_coverages),
        calibration_error: (coverage_p25 - 0.50).abs(),
        splits_used: band_coverages.len(),
    })
}
