use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{rngs::SmallRng, RngCore, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use super::InferenceError;
use crate::{
    model::{guide::PosteriorCovariance, ReadoutModel},
    stats::{gaussian_crps, normal_ppf, sorted_quantile},
};

/// Distribution over test targets produced by a fitted backend.
pub trait Predictive: Send + Sync {
    /// Predictive mean per input row.
    fn mean(&self, inputs: ArrayView2<'_, f64>) -> Result<Array1<f64>, InferenceError>;

    /// `rows × levels` predictive quantiles; every row is non-decreasing.
    fn quantiles(
        &self,
        inputs: ArrayView2<'_, f64>,
        levels: &[f64],
    ) -> Result<Array2<f64>, InferenceError>;

    /// Closed-form CRPS per row, when the family has one.
    fn crps(
        &self,
        _inputs: ArrayView2<'_, f64>,
        _targets: ArrayView1<'_, f64>,
    ) -> Result<Option<Array1<f64>>, InferenceError> {
        Ok(None)
    }

    /// `rows × count` predictive draws, when the family can be sampled.
    fn samples(
        &self,
        _inputs: ArrayView2<'_, f64>,
        _count: usize,
        _rng: &mut dyn RngCore,
    ) -> Result<Option<Array2<f64>>, InferenceError> {
        Ok(None)
    }
}

/// `y | x ~ N(φ(x)ᵀ m, φ(x)ᵀ Σ φ(x) + σ²)`.
#[derive(Debug, Clone)]
pub struct GaussianPredictive {
    model: ReadoutModel,
    loc: Array1<f64>,
    covariance: PosteriorCovariance,
    noise_scale: f64,
}

impl GaussianPredictive {
    /// Wraps a Gaussian posterior over the readout coefficients.
    #[must_use]
    pub const fn new(
        model: ReadoutModel,
        loc: Array1<f64>,
        covariance: PosteriorCovariance,
        noise_scale: f64,
    ) -> Self {
        Self {
            model,
            loc,
            covariance,
            noise_scale,
        }
    }

    /// Predictive mean and standard deviation per row.
    pub fn moments(
        &self,
        inputs: ArrayView2<'_, f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), InferenceError> {
        let phi = self.model.features(inputs)?;
        let mean = phi.dot(&self.loc);
        let noise_var = self.noise_scale * self.noise_scale;
        let std = phi
            .outer_iter()
            .map(|row| (self.covariance.quad_form(row) + noise_var).sqrt())
            .collect::<Array1<f64>>();
        Ok((mean, std))
    }
}

impl Predictive for GaussianPredictive {
    fn mean(&self, inputs: ArrayView2<'_, f64>) -> Result<Array1<f64>, InferenceError> {
        Ok(self.model.features(inputs)?.dot(&self.loc))
    }

    fn quantiles(
        &self,
        inputs: ArrayView2<'_, f64>,
        levels: &[f64],
    ) -> Result<Array2<f64>, InferenceError> {
        let (mean, std) = self.moments(inputs)?;
        let z: Vec<f64> = levels.iter().map(|l| normal_ppf(*l)).collect();
        Ok(Array2::from_shape_fn((mean.len(), levels.len()), |(i, k)| {
            mean[i] + std[i] * z[k]
        }))
    }

    fn crps(
        &self,
        inputs: ArrayView2<'_, f64>,
        targets: ArrayView1<'_, f64>,
    ) -> Result<Option<Array1<f64>>, InferenceError> {
        let (mean, std) = self.moments(inputs)?;
        Ok(Some(
            targets
                .iter()
                .zip(mean.iter().zip(std.iter()))
                .map(|(y, (m, s))| gaussian_crps(*y, *m, *s))
                .collect(),
        ))
    }

    fn samples(
        &self,
        inputs: ArrayView2<'_, f64>,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Option<Array2<f64>>, InferenceError> {
        let phi = self.model.features(inputs)?;
        let mut draws = Array2::<f64>::zeros((phi.nrows(), count));
        for mut column in draws.columns_mut() {
            let coef = self.covariance.sample(self.loc.view(), rng);
            let fitted = phi.dot(&coef);
            for (slot, mu) in column.iter_mut().zip(fitted.iter()) {
                let eps: f64 = StandardNormal.sample(rng);
                *slot = mu + self.noise_scale * eps;
            }
        }
        Ok(Some(draws))
    }
}

/// Mixture over posterior draws `(w_s, σ_s)`.
///
/// Predictive quantiles come from one noisy draw per posterior sample,
/// generated from a fixed seed so repeated queries agree.
#[derive(Debug, Clone)]
pub struct SamplePredictive {
    model: ReadoutModel,
    coefficients: Array2<f64>,
    noise_scales: Array1<f64>,
    draw_seed: u64,
}

impl SamplePredictive {
    /// `coefficients` is `draws × features`, `noise_scales` has one entry per draw.
    pub fn new(
        model: ReadoutModel,
        coefficients: Array2<f64>,
        noise_scales: Array1<f64>,
        draw_seed: u64,
    ) -> Result<Self, InferenceError> {
        if coefficients.nrows() == 0 || coefficients.nrows() != noise_scales.len() {
            return Err(InferenceError::Shape(format!(
                "{} coefficient draws against {} noise draws",
                coefficients.nrows(),
                noise_scales.len()
            )));
        }
        Ok(Self {
            model,
            coefficients,
            noise_scales,
            draw_seed,
        })
    }

    /// Number of posterior draws.
    #[must_use]
    pub fn len(&self) -> usize {
        self.noise_scales.len()
    }

    /// Whether the predictive holds no draws (never true once constructed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.noise_scales.is_empty()
    }

    fn noisy_draws<R: RngCore + ?Sized>(&self, phi: &Array2<f64>, rng: &mut R) -> Array2<f64> {
        let mut fitted = phi.dot(&self.coefficients.t());
        for mut row in fitted.outer_iter_mut() {
            for (slot, sigma) in row.iter_mut().zip(self.noise_scales.iter()) {
                let eps: f64 = StandardNormal.sample(rng);
                *slot += sigma * eps;
            }
        }
        fitted
    }
}

impl Predictive for SamplePredictive {
    fn mean(&self, inputs: ArrayView2<'_, f64>) -> Result<Array1<f64>, InferenceError> {
        let phi = self.model.features(inputs)?;
        let average = self
            .coefficients
            .mean_axis(Axis(0))
            .ok_or_else(|| InferenceError::Shape("no posterior draws".into()))?;
        Ok(phi.dot(&average))
    }

    fn quantiles(
        &self,
        inputs: ArrayView2<'_, f64>,
        levels: &[f64],
    ) -> Result<Array2<f64>, InferenceError> {
        let phi = self.model.features(inputs)?;
        let mut rng = SmallRng::seed_from_u64(self.draw_seed);
        let draws = self.noisy_draws(&phi, &mut rng);
        let mut out = Array2::<f64>::zeros((draws.nrows(), levels.len()));
        for (row, mut target) in draws.outer_iter().zip(out.outer_iter_mut()) {
            let mut sorted = row.to_vec();
            sorted.sort_by(f64::total_cmp);
            for (slot, level) in target.iter_mut().zip(levels) {
                *slot = sorted_quantile(&sorted, *level);
            }
        }
        Ok(out)
    }

    fn samples(
        &self,
        inputs: ArrayView2<'_, f64>,
        count: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Option<Array2<f64>>, InferenceError> {
        let phi = self.model.features(inputs)?;
        let draws = self.noisy_draws(&phi, rng);
        let total = draws.ncols();
        let picks: Vec<usize> = (0..count).map(|j| j * total / count.max(1)).collect();
        Ok(Some(draws.select(Axis(1), &picks)))
    }
}

/// Quantile-regression readout: one linear output per level.
#[derive(Debug, Clone)]
pub struct QuantilePredictive {
    model: ReadoutModel,
    weights: Array2<f64>,
    levels: Vec<f64>,
}

impl QuantilePredictive {
    /// `weights` is `features × levels`.
    pub fn new(
        model: ReadoutModel,
        weights: Array2<f64>,
        levels: Vec<f64>,
    ) -> Result<Self, InferenceError> {
        if weights.ncols() != levels.len() || levels.is_empty() {
            return Err(InferenceError::Shape(format!(
                "{} quantile outputs for {} levels",
                weights.ncols(),
                levels.len()
            )));
        }
        Ok(Self {
            model,
            weights,
            levels,
        })
    }

    /// Fitted quantiles at the model's own levels, sorted per row.
    pub fn fitted(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, InferenceError> {
        let mut raw = self.model.features(inputs)?.dot(&self.weights);
        for mut row in raw.outer_iter_mut() {
            let mut sorted = row.to_vec();
            sorted.sort_by(f64::total_cmp);
            row.assign(&Array1::from(sorted));
        }
        Ok(raw)
    }

    fn interpolate(&self, row: ArrayView1<'_, f64>, level: f64) -> f64 {
        let last = self.levels.len() - 1;
        if level <= self.levels[0] {
            return row[0];
        }
        if level >= self.levels[last] {
            return row[last];
        }
        let upper = self.levels.partition_point(|l| *l < level);
        let lower = upper - 1;
        let span = self.levels[upper] - self.levels[lower];
        let weight = (level - self.levels[lower]) / span;
        row[lower] + weight * (row[upper] - row[lower])
    }
}

impl Predictive for QuantilePredictive {
    fn mean(&self, inputs: ArrayView2<'_, f64>) -> Result<Array1<f64>, InferenceError> {
        let fitted = self.fitted(inputs)?;
        let last = self.levels.len() - 1;
        Ok(fitted
            .outer_iter()
            .map(|row| {
                let interior = self
                    .levels
                    .windows(2)
                    .zip(row.windows(2))
                    .map(|(l, q)| (l[1] - l[0]) * 0.5 * (q[0] + q[1]))
                    .sum::<f64>();
                interior + self.levels[0] * row[0] + (1.0 - self.levels[last]) * row[last]
            })
            .collect())
    }

    fn quantiles(
        &self,
        inputs: ArrayView2<'_, f64>,
        levels: &[f64],
    ) -> Result<Array2<f64>, InferenceError> {
        let fitted = self.fitted(inputs)?;
        Ok(Array2::from_shape_fn((fitted.nrows(), levels.len()), |(i, k)| {
            self.interpolate(fitted.row(i), levels[k])
        }))
    }
}
