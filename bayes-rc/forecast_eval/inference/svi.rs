use std::{f64::consts::PI, time::Instant};

use ndarray::{Array1, Array2, Axis};

use super::{
    bayes::LinearStats,
    diagnostics::{Diagnostics, MetricKey},
    noise_scale,
    optim::{max_abs, Adam},
    predictive::GaussianPredictive,
    scoring::Scorer,
    InferenceError, InferenceMethod, InferenceOutcome, InferenceRequest,
};
use crate::{
    linalg::{cholesky_inverse, cholesky_jittered, log_det},
    model::{
        guide::{Guide, GuideKind, COV_FACTOR, LOC, SCALE, SCALE_TRIL},
        params::ParamStore,
        GuidePolicy, ModelFamily, NOISE_SCALE,
    },
};

const LOC_SLOT: usize = 0;
const SCALE_SLOT: usize = 1;
const SHAPE_SLOT: usize = 2;
const NOISE_SLOT: usize = 3;

/// Variational inference on the readout with a multivariate normal guide.
///
/// The likelihood is linear-Gaussian in the readout coefficients, so the
/// expected log-likelihood and the KL term of the ELBO are available in
/// closed form and the optimizer follows exact gradients.
#[derive(Debug, Default, Clone, Copy)]
pub struct VariationalInference;

impl InferenceMethod for VariationalInference {
    fn name(&self) -> &str {
        "svi"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Bayesian
    }

    fn guide_policy(&self) -> GuidePolicy {
        GuidePolicy::Required
    }

    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        let scorer = Scorer::new(&request.scoring_levels());
        let InferenceRequest {
            config,
            model,
            guide,
            store,
            train,
            validation,
            test,
            rng,
            ..
        } = request;
        let guide = guide.ok_or(InferenceError::MissingGuide("svi"))?;

        let started = Instant::now();
        let phi = model.features(train.inputs)?;
        let stats = LinearStats::new(phi.view(), train.targets)?;
        let prior = Prior {
            mean: model.prior_mean(),
            variance: model.prior_variance(),
        };
        let noise_prior = model.noise_prior();

        let mut state = GuideState::load(guide, store)?;
        let mut log_noise = Array1::from_elem(1, noise_prior.clamp(noise_scale(store)?).ln());
        let mut adam = Adam::new(config.lr, 4);
        let mut final_loss = f64::NAN;
        let n = stats.n as f64;

        for iteration in 0..config.num_iterations {
            let noise_var = (2.0 * log_noise[0]).exp();
            adam.tick();
            let (loss, expected_sse) = state.step(&mut adam, &stats, &prior, noise_var)?;
            if !loss.is_finite() || !state.is_finite() {
                return Err(InferenceError::NonFinite {
                    method: "svi",
                    what: "ELBO",
                    iteration,
                });
            }
            final_loss = loss + log_noise[0];
            let grad = Array1::from_elem(1, (n - expected_sse / noise_var) / n);
            adam.update(NOISE_SLOT, &mut log_noise, grad.view());
            log_noise[0] = noise_prior.clamp(log_noise[0].exp()).ln();
        }

        let noise = log_noise[0].exp();
        state.store(store)?;
        store.set(NOISE_SCALE, Array1::from_elem(1, noise))?;
        let train_time = started.elapsed().as_secs_f64();

        let predictive = GaussianPredictive::new(
            model.clone(),
            guide.loc(store)?,
            guide.covariance(store)?,
            noise,
        );
        let scores = scorer.score(&predictive, validation, test, rng)?;

        let mut diagnostics = Diagnostics::new()
            .with(MetricKey::TrainTime, train_time)
            .with(MetricKey::InferenceTime, scores.prediction_seconds)
            .with(MetricKey::FinalLoss, final_loss);
        scores.record_into(&mut diagnostics);
        Ok(InferenceOutcome {
            predictive: Box::new(predictive),
            diagnostics,
        })
    }
}

struct Prior {
    mean: Array1<f64>,
    variance: Array1<f64>,
}

/// Unconstrained guide parameters: positive scales are held as logs.
#[derive(Debug, Clone)]
enum GuideState {
    Full {
        loc: Array1<f64>,
        /// Strictly lower part of the Cholesky factor; the diagonal is ignored.
        lower: Array2<f64>,
        log_diag: Array1<f64>,
    },
    LowRank {
        loc: Array1<f64>,
        log_scale: Array1<f64>,
        factor: Array2<f64>,
    },
}

impl GuideState {
    fn load(guide: &Guide, store: &ParamStore) -> Result<Self, InferenceError> {
        let loc = guide.loc(store)?;
        Ok(match guide.kind() {
            GuideKind::FullRank => {
                let tril = store.matrix(SCALE_TRIL)?;
                Self::Full {
                    loc,
                    lower: strictly_lower(tril),
                    log_diag: tril.diag().mapv(f64::ln),
                }
            }
            GuideKind::LowRank { .. } => Self::LowRank {
                loc,
                log_scale: store.vector(SCALE)?.mapv(f64::ln),
                factor: store.matrix(COV_FACTOR)?.clone(),
            },
        })
    }

    fn store(&self, store: &mut ParamStore) -> Result<(), InferenceError> {
        match self {
            Self::Full {
                loc,
                lower,
                log_diag,
            } => {
                store.set(LOC, loc.clone())?;
                store.set(SCALE_TRIL, compose_tril(lower, log_diag))?;
            }
            Self::LowRank {
                loc,
                log_scale,
                factor,
            } => {
                store.set(LOC, loc.clone())?;
                store.set(SCALE, log_scale.mapv(f64::exp))?;
                store.set(COV_FACTOR, factor.clone())?;
            }
        }
        Ok(())
    }

    fn is_finite(&self) -> bool {
        match self {
            Self::Full {
                loc,
                lower,
                log_diag,
            } => [max_abs(loc), max_abs(lower), max_abs(log_diag)]
                .iter()
                .all(|v| v.is_finite()),
            Self::LowRank {
                loc,
                log_scale,
                factor,
            } => [max_abs(loc), max_abs(log_scale), max_abs(factor)]
                .iter()
                .all(|v| v.is_finite()),
        }
    }

    /// One Adam step on the negative ELBO per observation.
    ///
    /// Returns the loss (excluding the `ln σ` term, added by the caller)
    /// and the expected squared residual `E_q‖y − Φw‖²` for the noise update.
    fn step(
        &mut self,
        adam: &mut Adam,
        stats: &LinearStats,
        prior: &Prior,
        noise_var: f64,
    ) -> Result<(f64, f64), InferenceError> {
        let n = stats.n as f64;
        let p = prior.mean.len() as f64;
        let inv_var = prior.variance.mapv(|v| 1.0 / v);
        let log_prior_det = prior.variance.iter().map(|v| v.ln()).sum::<f64>();

        let loc = match self {
            Self::Full { loc, .. } | Self::LowRank { loc, .. } => loc,
        };
        let gram_loc = stats.gram.dot(&*loc);
        let sse = (stats.yy - 2.0 * loc.dot(&stats.xty) + loc.dot(&gram_loc)).max(0.0);
        let offset = &*loc - &prior.mean;
        let prior_fit = offset.iter().zip(inv_var.iter()).map(|(d, iv)| d * d * iv).sum::<f64>();
        let loc_grad = ((&gram_loc - &stats.xty) / noise_var + &offset * &inv_var) / n;

        let (trace, marginal_sum, log_det_cov) = match self {
            Self::Full {
                loc,
                lower,
                log_diag,
            } => {
                let tril = compose_tril(lower, log_diag);
                let gram_tril = stats.gram.dot(&tril);
                let trace = (&tril * &gram_tril).sum();
                let marginal_sum = (&tril * &tril)
                    .sum_axis(Axis(1))
                    .iter()
                    .zip(inv_var.iter())
                    .map(|(s, iv)| s * iv)
                    .sum::<f64>();
                let log_det_cov = 2.0 * log_diag.sum();

                let mut tril_grad =
                    (&gram_tril / noise_var + &tril * &inv_var.view().insert_axis(Axis(1))) / n;
                let diag = tril.diag().to_owned();
                let mut log_diag_grad = Array1::<f64>::zeros(diag.len());
                for (j, d) in diag.iter().enumerate() {
                    log_diag_grad[j] = (tril_grad[[j, j]] - 1.0 / (d * n)) * d;
                }
                mask_strictly_lower(&mut tril_grad);

                adam.update(LOC_SLOT, loc, loc_grad.view());
                adam.update(SCALE_SLOT, log_diag, log_diag_grad.view());
                adam.update(SHAPE_SLOT, lower, tril_grad.view());
                (trace, marginal_sum, log_det_cov)
            }
            Self::LowRank {
                loc,
                log_scale,
                factor,
            } => {
                let scale_sq = log_scale.mapv(|l| (2.0 * l).exp());
                let gram_factor = stats.gram.dot(&*factor);
                let trace = scale_sq
                    .iter()
                    .zip(stats.gram.diag().iter())
                    .map(|(s, g)| s * g)
                    .sum::<f64>()
                    + (&*factor * &gram_factor).sum();
                let marginal = &scale_sq + &(&*factor * &*factor).sum_axis(Axis(1));
                let marginal_sum = (&marginal * &inv_var).sum();

                // Woodbury: Σ⁻¹ = D⁻¹ − U M⁻¹ Uᵀ with U = D⁻¹W, M = I + Wᵀ D⁻¹ W.
                let rank = factor.ncols();
                let scaled = &*factor / &scale_sq.view().insert_axis(Axis(1));
                let capacitance = Array2::<f64>::eye(rank) + factor.t().dot(&scaled);
                let chol = cholesky_jittered(capacitance.view())?;
                let capacitance_inv = cholesky_inverse(chol.view());
                let precision_factor = scaled.dot(&capacitance_inv);
                let precision_diag = scale_sq.mapv(|s| 1.0 / s)
                    - (&precision_factor * &scaled).sum_axis(Axis(1));
                let log_det_cov = 2.0 * log_scale.sum() + log_det(chol.view());

                let log_scale_grad = (&scale_sq * &stats.gram.diag() / noise_var
                    + &scale_sq * &inv_var
                    - &scale_sq * &precision_diag)
                    / n;
                let factor_grad = (&gram_factor / noise_var
                    + &*factor * &inv_var.view().insert_axis(Axis(1))
                    - &precision_factor)
                    / n;

                adam.update(LOC_SLOT, loc, loc_grad.view());
                adam.update(SCALE_SLOT, log_scale, log_scale_grad.view());
                adam.update(SHAPE_SLOT, factor, factor_grad.view());
                (trace, marginal_sum, log_det_cov)
            }
        };

        let expected_sse = sse + trace;
        let kl = 0.5 * (marginal_sum + prior_fit - p + log_prior_det - log_det_cov);
        let nll = 0.5 * n * (2.0 * PI).ln() + expected_sse / (2.0 * noise_var);
        Ok(((nll + kl) / n, expected_sse))
    }
}

fn strictly_lower(matrix: &Array2<f64>) -> Array2<f64> {
    let mut lower = matrix.clone();
    mask_strictly_lower(&mut lower);
    lower
}

fn mask_strictly_lower(matrix: &mut Array2<f64>) {
    for ((i, j), value) in matrix.indexed_iter_mut() {
        if j >= i {
            *value = 0.0;
        }
    }
}

fn compose_tril(lower: &Array2<f64>, log_diag: &Array1<f64>) -> Array2<f64> {
    let mut tril = lower.clone();
    tril.diag_mut().assign(&log_diag.mapv(f64::exp));
    tril
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compute::ComputeContext,
        config::{ExperimentConfig, QuantileLevels},
        inference::{DataSplit, InferenceRegistry},
        model::{tests::resolved, ModelFactory},
    };
    use rand::{rngs::SmallRng, SeedableRng};

    fn synthetic(n: usize, offset: usize) -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((n, 2), |(i, j)| {
            let t = (i + offset) as f64;
            if j == 0 { (t * 0.21).sin() } else { (t * 0.13).cos() }
        });
        let y = Array1::from_shape_fn(n, |i| {
            0.8 * x[[i, 0]] - 0.4 * x[[i, 1]] + 0.05 * ((i * 7 % 11) as f64 - 5.0) / 5.0
        });
        (x, y)
    }

    fn fit(rank: Option<usize>, dim_reduction: bool) -> (Diagnostics, ParamStore) {
        let config = ExperimentConfig {
            model_widths: vec![2, 1],
            inference: "svi".into(),
            rank,
            dim_reduction,
            lr: 0.05,
            num_iterations: 400,
            ..ExperimentConfig::default()
        }
        .resolve(&InferenceRegistry::with_builtin())
        .unwrap();

        let (x_train, y_train) = synthetic(200, 0);
        let (x_test, y_test) = synthetic(60, 200);
        let levels = QuantileLevels::reference();
        let mut store = ParamStore::new();
        let mut rng = SmallRng::seed_from_u64(11);
        let (model, guide) = ModelFactory::build(
            ModelFamily::Bayesian,
            GuidePolicy::Required,
            &config,
            2,
            &levels,
            &ComputeContext::cpu(1),
            &mut store,
            &mut rng,
        )
        .unwrap();
        let ctx = ComputeContext::cpu(1);
        let outcome = VariationalInference
            .run(InferenceRequest {
                config: &config,
                model: &model,
                guide: guide.as_ref(),
                store: &mut store,
                train: DataSplit::new(x_train.view(), y_train.view()).unwrap(),
                validation: None,
                test: DataSplit::new(x_test.view(), y_test.view()).unwrap(),
                quantiles: Some(&levels),
                ctx: &ctx,
                rng: &mut rng,
            })
            .unwrap();
        (outcome.diagnostics, store)
    }

    #[test]
    fn full_rank_guide_learns_the_readout() {
        let (diagnostics, store) = fit(None, true);
        let loc = store.vector(LOC).unwrap();
        assert!((loc[0] - 0.8).abs() < 0.1, "loc = {loc}");
        assert!((loc[1] + 0.4).abs() < 0.1, "loc = {loc}");
        assert!(diagnostics.get(MetricKey::Mse).unwrap() < 0.05);
        assert!(diagnostics.get(MetricKey::FinalLoss).unwrap().is_finite());
        assert!(diagnostics.get(MetricKey::ECrps).is_some());
        assert!(store.vector(NOISE_SCALE).unwrap()[0] < 0.5);
    }

    #[test]
    fn low_rank_guide_keeps_positive_scales() {
        let (diagnostics, store) = fit(Some(1), false);
        assert!(store.vector(SCALE).unwrap().iter().all(|s| *s > 0.0));
        assert_eq!(store.matrix(COV_FACTOR).unwrap().dim(), (3, 1));
        assert!(diagnostics.get(MetricKey::Coverage).unwrap() > 0.5);
    }

    #[test]
    fn missing_guide_is_an_error() {
        let config = resolved(vec![2, 1], "svi");
        let (x, y) = synthetic(10, 0);
        let levels = QuantileLevels::reference();
        let mut store = ParamStore::new();
        let mut rng = SmallRng::seed_from_u64(0);
        let (model, _) = ModelFactory::build(
            ModelFamily::Bayesian,
            GuidePolicy::None,
            &config,
            2,
            &levels,
            &ComputeContext::cpu(1),
            &mut store,
            &mut rng,
        )
        .unwrap();
        let ctx = ComputeContext::cpu(1);
        let split = DataSplit::new(x.view(), y.view()).unwrap();
        let err = VariationalInference
            .run(InferenceRequest {
                config: &config,
                model: &model,
                guide: None,
                store: &mut store,
                train: split,
                validation: None,
                test: split,
                quantiles: None,
                ctx: &ctx,
                rng: &mut rng,
            })
            .unwrap_err();
        assert!(matches!(err, InferenceError::MissingGuide("svi")));
    }
}
