//! Accuracy and calibration scores shared by every backend.
//!
//! Raw scores come from the predictive on the test split. The `new_*`
//! variants recalibrate the predictive on the validation split first:
//! per-level residual shifts for the quantiles, a conformal margin for the
//! 95 % interval, and a mean-bias correction for the point forecast.

use std::time::Instant;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::RngCore;

use super::{
    diagnostics::{Diagnostics, MetricKey},
    predictive::Predictive,
    DataSplit, InferenceError,
};
use crate::{
    config::QuantileLevels,
    stats::{pinball, quantile, sample_crps},
};

/// Bounds of the nominal 95 % interval.
pub const INTERVAL_LEVELS: [f64; 2] = [0.025, 0.975];
/// Nominal miscoverage of the interval.
pub const MISCOVERAGE: f64 = 0.05;
/// Predictive draws per test row for the sample-based CRPS.
pub const SAMPLE_DRAWS: usize = 256;

/// Scores of one fitted predictive.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    /// Raw and recalibrated metrics keyed by the diagnostics vocabulary.
    pub metrics: Vec<(MetricKey, f64)>,
    /// Seconds spent predicting the test split.
    pub prediction_seconds: f64,
}

impl Scores {
    /// Copies every score into `diagnostics`.
    pub fn record_into(&self, diagnostics: &mut Diagnostics) {
        for (key, value) in &self.metrics {
            diagnostics.set(*key, *value);
        }
    }

    /// Score by key.
    #[must_use]
    pub fn get(&self, key: MetricKey) -> Option<f64> {
        self.metrics
            .iter()
            .find_map(|(k, v)| (*k == key).then_some(*v))
    }
}

/// Scores predictives against held-out splits.
#[derive(Debug, Clone)]
pub struct Scorer {
    levels: Vec<f64>,
    sample_crps: bool,
}

impl Scorer {
    /// Scores calibration over the interior levels of `levels`.
    #[must_use]
    pub fn new(levels: &QuantileLevels) -> Self {
        Self {
            levels: levels.interior(),
            sample_crps: true,
        }
    }

    /// Skips the sample-based CRPS even when the predictive can be sampled.
    #[must_use]
    pub fn without_sample_crps(mut self) -> Self {
        self.sample_crps = false;
        self
    }

    /// Computes raw and recalibrated scores.
    pub fn score(
        &self,
        predictive: &dyn Predictive,
        validation: Option<DataSplit<'_>>,
        test: DataSplit<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<Scores, InferenceError> {
        let started = Instant::now();
        let mean = predictive.mean(test.inputs)?;
        let quantiles = predictive.quantiles(test.inputs, &self.levels)?;
        let interval = predictive.quantiles(test.inputs, &INTERVAL_LEVELS)?;
        let prediction_seconds = started.elapsed().as_secs_f64();

        let y = test.targets;
        let lower = interval.column(0);
        let upper = interval.column(1);
        let mse = mean_squared_error(mean.view(), y, 0.0);
        let (coverage, width) = interval_scores(lower, upper, y, 0.0);
        let cal_error = calibration_error(&quantiles, y, &self.levels);
        let crps = match predictive.crps(test.inputs, y)? {
            Some(per_row) => per_row.mean().unwrap_or(0.0),
            None => quantile_crps(&quantiles, y, &self.levels),
        };

        let mut metrics = vec![
            (MetricKey::Mse, mse),
            (MetricKey::Coverage, coverage),
            (MetricKey::Width, width),
            (MetricKey::CalError, cal_error),
            (MetricKey::Crps, crps),
        ];

        if self.sample_crps {
            if let Some(draws) = predictive.samples(test.inputs, SAMPLE_DRAWS, rng)? {
                metrics.push((MetricKey::ECrps, ensemble_crps(&draws, y)));
            }
        }

        let recalibrated = match validation {
            Some(val) if !val.targets.is_empty() => {
                let val_mean = predictive.mean(val.inputs)?;
                let val_quantiles = predictive.quantiles(val.inputs, &self.levels)?;
                let val_interval = predictive.quantiles(val.inputs, &INTERVAL_LEVELS)?;

                let bias = (&val.targets - &val_mean).mean().unwrap_or(0.0);
                let shifts = level_shifts(&val_quantiles, val.targets, &self.levels);
                let margin =
                    conformal_margin(val_interval.column(0), val_interval.column(1), val.targets);

                let shifted = apply_shifts(&quantiles, &shifts);
                let (new_coverage, new_width) = interval_scores(lower, upper, y, margin);
                [
                    mean_squared_error(mean.view(), y, bias),
                    new_coverage,
                    new_width,
                    calibration_error(&shifted, y, &self.levels),
                    quantile_crps(&shifted, y, &self.levels),
                ]
            }
            _ => [mse, coverage, width, cal_error, crps],
        };
        metrics.extend(
            [
                MetricKey::NewMse,
                MetricKey::NewCoverage,
                MetricKey::NewWidth,
                MetricKey::NewCalError,
                MetricKey::NewCrps,
            ]
            .into_iter()
            .zip(recalibrated),
        );

        Ok(Scores {
            metrics,
            prediction_seconds,
        })
    }
}

fn mean_squared_error(mean: ArrayView1<'_, f64>, targets: ArrayView1<'_, f64>, bias: f64) -> f64 {
    let n = targets.len().max(1) as f64;
    targets
        .iter()
        .zip(mean.iter())
        .map(|(y, m)| (y - m - bias).powi(2))
        .sum::<f64>()
        / n
}

/// Coverage and mean width of `[lower - margin, upper + margin]`.
fn interval_scores(
    lower: ArrayView1<'_, f64>,
    upper: ArrayView1<'_, f64>,
    targets: ArrayView1<'_, f64>,
    margin: f64,
) -> (f64, f64) {
    let n = targets.len().max(1) as f64;
    let mut covered = 0usize;
    let mut width = 0.0;
    for ((y, lo), hi) in targets.iter().zip(lower.iter()).zip(upper.iter()) {
        let (lo, hi) = (lo - margin, hi + margin);
        if *y >= lo && *y <= hi {
            covered += 1;
        }
        width += (hi - lo).max(0.0);
    }
    (covered as f64 / n, width / n)
}

/// Mean over levels of |fraction of targets below the quantile − level|.
fn calibration_error(quantiles: &Array2<f64>, targets: ArrayView1<'_, f64>, levels: &[f64]) -> f64 {
    if levels.is_empty() || targets.is_empty() {
        return 0.0;
    }
    let n = targets.len() as f64;
    levels
        .iter()
        .zip(quantiles.axis_iter(Axis(1)))
        .map(|(level, column)| {
            let below = targets
                .iter()
                .zip(column.iter())
                .filter(|(y, q)| *y <= *q)
                .count() as f64;
            (below / n - level).abs()
        })
        .sum::<f64>()
        / levels.len() as f64
}

/// CRPS approximated by twice the average pinball loss over the levels.
fn quantile_crps(quantiles: &Array2<f64>, targets: ArrayView1<'_, f64>, levels: &[f64]) -> f64 {
    if levels.is_empty() || targets.is_empty() {
        return 0.0;
    }
    let total = quantiles
        .outer_iter()
        .zip(targets.iter())
        .map(|(row, y)| {
            row.iter()
                .zip(levels)
                .map(|(q, level)| pinball(*y, *q, *level))
                .sum::<f64>()
        })
        .sum::<f64>();
    2.0 * total / (targets.len() * levels.len()) as f64
}

fn ensemble_crps(draws: &Array2<f64>, targets: ArrayView1<'_, f64>) -> f64 {
    let n = targets.len().max(1) as f64;
    draws
        .outer_iter()
        .zip(targets.iter())
        .map(|(row, y)| {
            let mut sorted = row.to_vec();
            sorted.sort_by(f64::total_cmp);
            sample_crps(&sorted, *y)
        })
        .sum::<f64>()
        / n
}

/// Per level, the `level`-quantile of validation residuals `y − q_level`.
fn level_shifts(quantiles: &Array2<f64>, targets: ArrayView1<'_, f64>, levels: &[f64]) -> Vec<f64> {
    levels
        .iter()
        .zip(quantiles.axis_iter(Axis(1)))
        .map(|(level, column)| {
            let residuals: Vec<f64> = (&targets - &column).to_vec();
            quantile(&residuals, *level)
        })
        .collect()
}

fn apply_shifts(quantiles: &Array2<f64>, shifts: &[f64]) -> Array2<f64> {
    let mut shifted = quantiles + &Array1::from(shifts.to_vec());
    for mut row in shifted.outer_iter_mut() {
        let mut sorted = row.to_vec();
        sorted.sort_by(f64::total_cmp);
        row.assign(&Array1::from(sorted));
    }
    shifted
}

/// Split-conformal margin for the interval (may be negative, shrinking it).
fn conformal_margin(
    lower: ArrayView1<'_, f64>,
    upper: ArrayView1<'_, f64>,
    targets: ArrayView1<'_, f64>,
) -> f64 {
    let mut scores: Vec<f64> = targets
        .iter()
        .zip(lower.iter().zip(upper.iter()))
        .map(|(y, (lo, hi))| (lo - y).max(y - hi))
        .collect();
    if scores.is_empty() {
        return 0.0;
    }
    scores.sort_by(f64::total_cmp);
    let n = scores.len();
    let rank = (((n + 1) as f64) * (1.0 - MISCOVERAGE)).ceil() as usize;
    scores[rank.clamp(1, n) - 1]
}
