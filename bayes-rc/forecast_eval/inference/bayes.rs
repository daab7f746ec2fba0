use std::{f64::consts::PI, time::Instant};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use super::{
    diagnostics::{Diagnostics, MetricKey},
    noise_scale,
    predictive::GaussianPredictive,
    scoring::Scorer,
    InferenceError, InferenceMethod, InferenceOutcome, InferenceRequest,
};
use crate::{
    linalg::{cholesky_inverse, cholesky_jittered, cholesky_solve, gram, log_det},
    model::{guide::PosteriorCovariance, priors::NoisePrior, ModelFamily, NOISE_SCALE},
};

/// Store key of the posterior mean written by [`ConjugateBayes`].
pub const POSTERIOR_LOC: &str = "bayes.loc";

/// Noise re-estimation rounds before the final posterior.
const EVIDENCE_ITERATIONS: usize = 5;

/// Sufficient statistics of a linear-Gaussian readout.
#[derive(Debug, Clone)]
pub struct LinearStats {
    /// `Φᵀ Φ`.
    pub gram: Array2<f64>,
    /// `Φᵀ y`.
    pub xty: Array1<f64>,
    /// `yᵀ y`.
    pub yy: f64,
    /// Rows.
    pub n: usize,
}

impl LinearStats {
    /// Accumulates the statistics of a design matrix and its targets.
    pub fn new(phi: ArrayView2<'_, f64>, targets: ArrayView1<'_, f64>) -> Result<Self, InferenceError> {
        if phi.nrows() != targets.len() || phi.nrows() == 0 {
            return Err(InferenceError::Shape(format!(
                "{} design rows against {} targets",
                phi.nrows(),
                targets.len()
            )));
        }
        Ok(Self {
            gram: gram(phi),
            xty: phi.t().dot(&targets),
            yy: targets.dot(&targets),
            n: targets.len(),
        })
    }

    /// `‖y − Φ w‖²`.
    #[must_use]
    pub fn sse(&self, w: ArrayView1<'_, f64>) -> f64 {
        (self.yy - 2.0 * w.dot(&self.xty) + w.dot(&self.gram.dot(&w))).max(0.0)
    }
}

/// Exact Gaussian posterior `N(loc, Σ)` of the readout coefficients.
#[derive(Debug, Clone)]
pub struct ConjugatePosterior {
    /// Posterior mean.
    pub loc: Array1<f64>,
    /// Posterior covariance.
    pub covariance: Array2<f64>,
    /// Observation noise scale the posterior was computed at.
    pub noise: f64,
    /// Negative log marginal likelihood per observation.
    pub neg_log_evidence: f64,
}

impl ConjugatePosterior {
    /// Posterior at a fixed noise scale.
    pub fn at_noise(
        stats: &LinearStats,
        prior_mean: &Array1<f64>,
        prior_var: &Array1<f64>,
        noise: f64,
    ) -> Result<Self, InferenceError> {
        let noise_var = noise * noise;
        let mut precision = &stats.gram / noise_var;
        for (slot, v) in precision.diag_mut().iter_mut().zip(prior_var.iter()) {
            *slot += 1.0 / v;
        }
        let rhs = &stats.xty / noise_var + prior_mean / prior_var;
        let chol = cholesky_jittered(precision.view())?;
        let loc = cholesky_solve(chol.view(), rhs.view());
        let covariance = cholesky_inverse(chol.view());

        let n = stats.n as f64;
        let misfit = stats.sse(loc.view()) / (2.0 * noise_var)
            + 0.5
                * (&loc - prior_mean)
                    .iter()
                    .zip(prior_var.iter())
                    .map(|(d, v)| d * d / v)
                    .sum::<f64>();
        let log_evidence = -0.5 * n * (2.0 * PI).ln() - n * noise.ln() - misfit
            - 0.5 * log_det(chol.view())
            - 0.5 * prior_var.iter().map(|v| v.ln()).sum::<f64>();
        Ok(Self {
            loc,
            covariance,
            noise,
            neg_log_evidence: -log_evidence / n,
        })
    }

    /// Alternates posterior updates with the expected-residual noise estimate.
    pub fn fit(
        stats: &LinearStats,
        prior_mean: &Array1<f64>,
        prior_var: &Array1<f64>,
        noise_prior: NoisePrior,
        initial_noise: f64,
    ) -> Result<Self, InferenceError> {
        let mut noise = noise_prior.clamp(initial_noise);
        for _ in 0..EVIDENCE_ITERATIONS {
            let posterior = Self::at_noise(stats, prior_mean, prior_var, noise)?;
            let trace = (&stats.gram * &posterior.covariance).sum();
            let expected_sse = stats.sse(posterior.loc.view()) + trace;
            noise = noise_prior.clamp((expected_sse / stats.n as f64).sqrt());
        }
        Self::at_noise(stats, prior_mean, prior_var, noise)
    }
}

/// Conjugate linear-Gaussian readout with evidence-driven noise.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConjugateBayes;

impl InferenceMethod for ConjugateBayes {
    fn name(&self) -> &str {
        "bayes"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Bayesian
    }

    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        let scorer = Scorer::new(&request.scoring_levels());
        let InferenceRequest {
            model,
            store,
            train,
            validation,
            test,
            rng,
            ..
        } = request;

        let started = Instant::now();
        let phi = model.features(train.inputs)?;
        let stats = LinearStats::new(phi.view(), train.targets)?;
        let posterior = ConjugatePosterior::fit(
            &stats,
            &model.prior_mean(),
            &model.prior_variance(),
            model.noise_prior(),
            noise_scale(store)?,
        )?;
        let scale_tril = cholesky_jittered(posterior.covariance.view())?;
        store.set(NOISE_SCALE, Array1::from_elem(1, posterior.noise))?;
        store.register(POSTERIOR_LOC, posterior.loc.clone())?;
        let train_time = started.elapsed().as_secs_f64();

        let predictive = GaussianPredictive::new(
            model.clone(),
            posterior.loc,
            PosteriorCovariance::Full { scale_tril },
            posterior.noise,
        );
        let scores = scorer.score(&predictive, validation, test, rng)?;

        let mut diagnostics = Diagnostics::new()
            .with(MetricKey::TrainTime, train_time)
            .with(MetricKey::InferenceTime, scores.prediction_seconds)
            .with(MetricKey::FinalLoss, posterior.neg_log_evidence);
        scores.record_into(&mut diagnostics);
        Ok(InferenceOutcome {
            predictive: Box::new(predictive),
            diagnostics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn posterior_matches_ridge_solution() {
        // One feature, unit prior, unit noise: loc = Σxy / (Σx² + 1).
        let phi = array![[1.0], [2.0], [3.0]];
        let y = array![2.0, 4.0, 6.0];
        let stats = LinearStats::new(phi.view(), y.view()).unwrap();
        let posterior =
            ConjugatePosterior::at_noise(&stats, &array![0.0], &array![1.0], 1.0).unwrap();
        assert!((posterior.loc[0] - 28.0 / 15.0).abs() < 1e-12);
        assert!((posterior.covariance[[0, 0]] - 1.0 / 15.0).abs() < 1e-12);
        assert!(posterior.neg_log_evidence.is_finite());
    }

    #[test]
    fn noise_estimate_tracks_residual_spread() {
        let n = 400;
        let phi = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { (i as f64 * 0.37).sin() } else { 1.0 });
        let y = Array1::from_shape_fn(n, |i| {
            let wobble = if i % 2 == 0 { 0.3 } else { -0.3 };
            2.0 * phi[[i, 0]] + 0.5 + wobble
        });
        let stats = LinearStats::new(phi.view(), y.view()).unwrap();
        let prior = NoisePrior::from_spec(crate::config::DistributionKind::Unif, [0.0, 10.0]).unwrap();
        let posterior =
            ConjugatePosterior::fit(&stats, &array![0.0, 0.0], &array![1.0, 1.0], prior, 1.0).unwrap();
        assert!((posterior.noise - 0.3).abs() < 0.05);
        assert!((posterior.loc[0] - 2.0).abs() < 0.1);
    }

    #[test]
    fn empty_split_is_rejected() {
        let phi = Array2::<f64>::zeros((0, 2));
        let y = Array1::<f64>::zeros(0);
        assert!(matches!(LinearStats::new(phi.view(), y.view()), Err(InferenceError::Shape(_))));
    }
}
