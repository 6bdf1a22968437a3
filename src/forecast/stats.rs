//! Weighted statistics for payment-delay distributions.
//!
//! Winsorization bounds come from the unweighted 1st/99th percentiles of
//! the paid population; recency weights halve every 90 days of age.

use statrs::statistics::{Data, OrderStatistics};

/// Half-life of the recency weighting, in days.
pub const RECENCY_HALF_LIFE_DAYS: f64 = 90.0;

/// Winsorization percentile (upper; lower is its mirror).
pub const WINSORIZE_PERCENTILE: usize = 99;

/// Cap extreme delays at the population's 1st/99th percentiles.
pub fn winsorize_bounds(delays: &[f64]) -> Option<(f64, f64)> {
    if delays.is_empty() {
        return None;
    }
    let mut data = Data::new(delays.to_vec());
    let lo = data.percentile(100 - WINSORIZE_PERCENTILE);
    let hi = data.percentile(WINSORIZE_PERCENTILE);
    Some((lo, hi))
}

/// `2^(-age_days / 90)`; future-dated payments weigh like today's.
pub fn recency_weight(age_days: f64) -> f64 {
    (-(age_days.max(0.0)) / RECENCY_HALF_LIFE_DAYS).exp2()
}

/// Weighted percentile over (value, weight) pairs using the cumulative
/// weight method.
pub fn weighted_percentile(pairs: &[(f64, f64)], percentile: f64) -> f64 {
    if pairs.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<(f64, f64)> = pairs.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return sorted[sorted.len() / 2].0;
    }
    let target = percentile / 100.0 * total;
    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= target {
            return *value;
        }
    }
    sorted.last().map(|(v, _)| *v).unwrap_or(0.0)
}

/// Weighted mean and standard deviation.
pub fn weighted_mean_std(pairs: &[(f64, f64)]) -> (f64, f64) {
    let total: f64 = pairs.iter().map(|(_, w)| w).sum();
    if total <= 0.0 || pairs.is_empty() {
        return (0.0, 0.0);
    }
    let mean = pairs.iter().map(|(v, w)| v * w).sum::<f64>() / total;
    let variance = pairs
        .iter()
        .map(|(v, w)| w * (v - mean).powi(2))
        .sum::<f64>()
        / total;
    (mean, variance.sqrt())
}

/// Unweighted percentile with linear interpolation over a sorted slice.
pub fn percentile_linear(sorted: &[f64], percentile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = percentile / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let fraction = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
    }
}
