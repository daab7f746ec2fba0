//! Scalar distribution helpers used by the scoring rules.

use std::f64::consts::PI;

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Standard normal density.
#[must_use]
pub fn normal_pdf(z: f64) -> f64 {
    Normal::standard().pdf(z)
}

/// Standard normal CDF.
#[must_use]
pub fn normal_cdf(z: f64) -> f64 {
    Normal::standard().cdf(z)
}

/// Inverse standard normal CDF.
///
/// Returns `-inf`/`inf` at the end points.
#[must_use]
pub fn normal_ppf(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    Normal::standard().inverse_cdf(p)
}

/// Linear-interpolation quantile of already sorted values.
#[must_use]
pub fn sorted_quantile(sorted: &[f64], level: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let position = level.clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = position.floor() as usize;
            let upper = position.ceil() as usize;
            let weight = position - lower as f64;
            sorted[lower] + weight * (sorted[upper] - sorted[lower])
        }
    }
}

/// Sorts a copy of `values` and returns the interpolated quantile.
#[must_use]
pub fn quantile(values: &[f64], level: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted_quantile(&sorted, level)
}

/// Pinball (quantile) loss for residual `target - prediction`.
#[must_use]
pub fn pinball(target: f64, prediction: f64, level: f64) -> f64 {
    let residual = target - prediction;
    if residual >= 0.0 {
        level * residual
    } else {
        (level - 1.0) * residual
    }
}

/// Closed-form CRPS of `N(mean, std²)` at `target`.
#[must_use]
pub fn gaussian_crps(target: f64, mean: f64, std: f64) -> f64 {
    if std <= 0.0 {
        return (target - mean).abs();
    }
    let z = (target - mean) / std;
    std * (z * (2.0 * normal_cdf(z) - 1.0) + 2.0 * normal_pdf(z) - 1.0 / PI.sqrt())
}

/// Energy-form CRPS of an empirical ensemble (`samples` sorted ascending).
#[must_use]
pub fn sample_crps(sorted_samples: &[f64], target: f64) -> f64 {
    let m = sorted_samples.len();
    if m == 0 {
        return f64::NAN;
    }
    let m_f = m as f64;
    let abs_error = sorted_samples.iter().map(|x| (x - target).abs()).sum::<f64>() / m_f;
    let spread = sorted_samples
        .iter()
        .enumerate()
        .map(|(i, x)| (2.0 * (i + 1) as f64 - m_f - 1.0) * x)
        .sum::<f64>()
        * 2.0
        / (m_f * m_f);
    abs_error - 0.5 * spread
}
