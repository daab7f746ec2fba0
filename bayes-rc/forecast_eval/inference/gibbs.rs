//! Component-wise Gibbs samplers for the linear-Gaussian readout.
//!
//! `mcmc` samples the readout coefficients under their Gaussian prior;
//! `ssvs` adds spike-and-slab inclusion indicators on the raw embeddings.
//! Both draw the noise variance from its inverse-gamma full conditional,
//! truncated to the uniform noise prior. Chains are seeded from the trial
//! generator in order and run on the context's worker pool, so the draws do
//! not depend on the thread budget.

use std::time::Instant;

use ndarray::{Array1, Array2, ArrayView1};
use rand::{rngs::SmallRng, Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use rand_distr::{Beta, Distribution, Gamma, StandardNormal};

use super::{
    bayes::LinearStats,
    diagnostics::{Diagnostics, MetricKey},
    noise_scale,
    predictive::SamplePredictive,
    scoring::Scorer,
    InferenceError, InferenceMethod, InferenceOutcome, InferenceRequest,
};
use crate::model::{priors::NoisePrior, ModelFamily, INCLUSION, NOISE_SCALE};

/// Store key of the posterior-mean coefficients.
pub const POSTERIOR_MEAN: &str = "gibbs.loc";
/// Spike variance of excluded coefficients.
pub const SPIKE_VARIANCE: f64 = 1e-4;
/// Posterior draws kept for the predictive after thinning.
pub const MAX_PREDICTIVE_DRAWS: usize = 1000;

const NOISE_REJECTION_TRIES: usize = 32;

/// Gibbs sampling of the readout under its Gaussian prior.
#[derive(Debug, Default, Clone, Copy)]
pub struct GibbsRegression;

impl InferenceMethod for GibbsRegression {
    fn name(&self) -> &str {
        "mcmc"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Bayesian
    }

    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        run_sampler("mcmc", false, request)
    }
}

/// Spike-and-slab variable selection on the raw embeddings.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpikeSlabSelection;

impl InferenceMethod for SpikeSlabSelection {
    fn name(&self) -> &str {
        "ssvs"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::SpikeSlab
    }

    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        run_sampler("ssvs", true, request)
    }
}

fn run_sampler(
    method: &'static str,
    selection: bool,
    request: InferenceRequest<'_>,
) -> Result<InferenceOutcome, InferenceError> {
    let scorer = Scorer::new(&request.scoring_levels());
    let InferenceRequest {
        config,
        model,
        store,
        train,
        validation,
        test,
        ctx,
        rng,
        ..
    } = request;

    let started = Instant::now();
    let phi = model.features(train.inputs)?;
    let stats = LinearStats::new(phi.view(), train.targets)?;
    let sampler = GibbsSampler {
        method,
        stats: &stats,
        prior_mean: model.prior_mean(),
        prior_var: model.prior_variance(),
        noise_prior: model.noise_prior(),
        selection: selection.then(|| SpikeSlab {
            slab_var: model.prior_variance()[0],
        }),
    };
    let initial_noise = noise_scale(store)?;
    let chain_seeds: Vec<u64> = (0..config.num_chains).map(|_| rng.next_u64()).collect();
    let chains: Vec<Draws> = ctx.install(|| {
        chain_seeds
            .par_iter()
            .map(|seed| sampler.chain(*seed, config.num_samples, config.num_samples, initial_noise))
            .collect::<Result<_, _>>()
    })??;
    let mut draws = Draws::default();
    for chain in chains {
        draws.append(chain);
    }
    let posterior = draws.thin(MAX_PREDICTIVE_DRAWS, stats.gram.nrows())?;

    store.set(NOISE_SCALE, Array1::from_elem(1, posterior.noise.mean().unwrap_or(initial_noise)))?;
    store.register(POSTERIOR_MEAN, posterior.mean_coefficients.clone())?;
    if let Some(inclusion) = posterior.inclusion {
        store.set(INCLUSION, inclusion)?;
    }
    let train_time = started.elapsed().as_secs_f64();

    let predictive =
        SamplePredictive::new(model.clone(), posterior.coefficients, posterior.noise, rng.next_u64())?;
    let scores = scorer.score(&predictive, validation, test, rng)?;

    let mut diagnostics = Diagnostics::new().with(MetricKey::TrainTime, train_time);
    scores.record_into(&mut diagnostics);
    Ok(InferenceOutcome {
        predictive: Box::new(predictive),
        diagnostics,
    })
}

#[derive(Debug, Clone, Copy)]
struct SpikeSlab {
    slab_var: f64,
}

struct GibbsSampler<'a> {
    method: &'static str,
    stats: &'a LinearStats,
    prior_mean: Array1<f64>,
    prior_var: Array1<f64>,
    noise_prior: NoisePrior,
    selection: Option<SpikeSlab>,
}

#[derive(Debug, Default)]
struct Draws {
    coefficients: Vec<Array1<f64>>,
    noise: Vec<f64>,
    inclusion: Vec<Vec<bool>>,
}

struct Posterior {
    coefficients: Array2<f64>,
    noise: Array1<f64>,
    mean_coefficients: Array1<f64>,
    inclusion: Option<Array1<f64>>,
}

impl Draws {
    fn append(&mut self, mut other: Self) {
        self.coefficients.append(&mut other.coefficients);
        self.noise.append(&mut other.noise);
        self.inclusion.append(&mut other.inclusion);
    }

    fn thin(self, limit: usize, dim: usize) -> Result<Posterior, InferenceError> {
        let total = self.noise.len();
        if total == 0 {
            return Err(InferenceError::Shape("sampler kept no draws".into()));
        }
        let mut mean_coefficients = Array1::<f64>::zeros(dim);
        for draw in &self.coefficients {
            mean_coefficients += draw;
        }
        mean_coefficients /= total as f64;

        let inclusion = (!self.inclusion.is_empty()).then(|| {
            let mut rate = Array1::<f64>::zeros(dim);
            for flags in &self.inclusion {
                for (slot, flag) in rate.iter_mut().zip(flags) {
                    if *flag {
                        *slot += 1.0;
                    }
                }
            }
            rate / self.inclusion.len() as f64
        });

        let kept = total.min(limit);
        let picks: Vec<usize> = (0..kept).map(|k| k * total / kept).collect();
        let mut coefficients = Array2::<f64>::zeros((kept, dim));
        for (mut row, index) in coefficients.outer_iter_mut().zip(&picks) {
            row.assign(&self.coefficients[*index]);
        }
        let noise = picks.iter().map(|index| self.noise[*index]).collect();
        Ok(Posterior {
            coefficients,
            noise,
            mean_coefficients,
            inclusion,
        })
    }
}

impl GibbsSampler<'_> {
    fn chain(
        &self,
        seed: u64,
        warmup: usize,
        keep: usize,
        initial_noise: f64,
    ) -> Result<Draws, InferenceError> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let rng = &mut rng;
        let mut draws = Draws::default();
        let p = self.prior_mean.len();
        let bias = p - 1;
        let gram = &self.stats.gram;
        let mut w = Array1::from_shape_fn(p, |j| {
            let z: f64 = StandardNormal.sample(rng);
            self.prior_mean[j] + 0.1 * z
        });
        let mut gram_w = gram.dot(&w);
        let mut noise_var = initial_noise * initial_noise;
        let mut included = vec![true; p];
        let mut inclusion_prob: f64 = 0.5;

        for sweep in 0..warmup + keep {
            for j in 0..p {
                let (mean_j, var_j) = match self.selection {
                    Some(spike_slab) if j != bias => {
                        let var = if included[j] {
                            spike_slab.slab_var
                        } else {
                            SPIKE_VARIANCE
                        };
                        (0.0, var)
                    }
                    _ => (self.prior_mean[j], self.prior_var[j]),
                };
                let g_jj = gram[[j, j]];
                let rest = gram_w[j] - g_jj * w[j];
                let precision = g_jj / noise_var + 1.0 / var_j;
                let mean = ((self.stats.xty[j] - rest) / noise_var + mean_j / var_j) / precision;
                let z: f64 = StandardNormal.sample(rng);
                let next = mean + z / precision.sqrt();
                let delta = next - w[j];
                if delta != 0.0 {
                    gram_w.scaled_add(delta, &gram.column(j));
                    w[j] = next;
                }

                if let Some(spike_slab) = self.selection {
                    if j != bias {
                        let log_odds = (inclusion_prob / (1.0 - inclusion_prob)).ln()
                            + log_normal(w[j], spike_slab.slab_var)
                            - log_normal(w[j], SPIKE_VARIANCE);
                        let prob = 1.0 / (1.0 + (-log_odds).exp());
                        included[j] = rng.gen::<f64>() < prob;
                    }
                }
            }

            if self.selection.is_some() {
                let active = included[..bias].iter().filter(|flag| **flag).count() as f64;
                let beta = Beta::new(1.0 + active, 1.0 + bias as f64 - active)
                    .map_err(|err| self.failure(err))?;
                inclusion_prob = beta.sample(rng).clamp(1e-6, 1.0 - 1e-6);
            }

            let sse = self.sse(w.view(), gram_w.view());
            if !sse.is_finite() {
                return Err(InferenceError::NonFinite {
                    method: self.method,
                    what: "residual sum of squares",
                    iteration: sweep,
                });
            }
            noise_var = self.draw_noise_var(sse, rng)?;

            if sweep >= warmup {
                draws.coefficients.push(w.clone());
                draws.noise.push(noise_var.sqrt());
                if self.selection.is_some() {
                    draws.inclusion.push(included.clone());
                }
            }
        }
        Ok(draws)
    }

    fn sse(&self, w: ArrayView1<'_, f64>, gram_w: ArrayView1<'_, f64>) -> f64 {
        (self.stats.yy - 2.0 * w.dot(&self.stats.xty) + w.dot(&gram_w)).max(0.0)
    }

    /// `σ² | w ~ InvGamma((n − 1) / 2, SSE / 2)` restricted to the prior bounds.
    fn draw_noise_var(&self, sse: f64, rng: &mut SmallRng) -> Result<f64, InferenceError> {
        let low = self.noise_prior.clamp(self.noise_prior.low()).powi(2);
        let high = self.noise_prior.high().powi(2);
        let shape = (self.stats.n as f64 - 1.0) / 2.0;
        let rate = (sse / 2.0).max(f64::MIN_POSITIVE);
        let gamma = Gamma::new(shape, 1.0 / rate).map_err(|err| self.failure(err))?;
        let mut candidate = low;
        for _ in 0..NOISE_REJECTION_TRIES {
            candidate = 1.0 / gamma.sample(rng);
            if (low..=high).contains(&candidate) {
                return Ok(candidate);
            }
        }
        Ok(candidate.clamp(low, high))
    }

    fn failure(&self, err: impl std::fmt::Display) -> InferenceError {
        InferenceError::Backend {
            method: self.method.to_string(),
            message: err.to_string(),
        }
    }
}

fn log_normal(x: f64, variance: f64) -> f64 {
    -0.5 * (x * x / variance + variance.ln())
}
