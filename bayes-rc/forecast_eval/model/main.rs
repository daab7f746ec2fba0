//! Readout models and the factory that builds a fresh model/guide pair per trial.

/// Approximate-posterior guides.
pub mod guide;
/// Per-trial parameter store.
pub mod params;
/// Prior specifications.
pub mod priors;

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    compute::{ComputeContext, ComputeError},
    config::{Activation, QuantileLevels, ResolvedConfig},
};
use guide::{Guide, GuideKind};
use params::{ParamStore, ParamStoreError};
use priors::{NoisePrior, WeightPrior};

/// Store key of the observation noise scale.
pub const NOISE_SCALE: &str = "model.noise_scale";
/// Store key of the quantile-regression coefficients (`features × levels`).
pub const QUANTILE_WEIGHTS: &str = "model.quantile.weight";
/// Store key of the spike-and-slab inclusion probabilities.
pub const INCLUSION: &str = "model.inclusion_prob";

const PARALLEL_MIN_ROWS: usize = 256;

/// Family of readout a backend fits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ModelFamily {
    /// Gaussian likelihood over a single output.
    Bayesian,
    /// One output per quantile level, fitted with the pinball loss.
    Quantile,
    /// Linear spike-and-slab regression on the raw embeddings.
    SpikeSlab,
}

/// Whether a backend needs a variational guide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidePolicy {
    /// Build a guide sized to the readout coefficients.
    Required,
    /// No guide (sampling or point-estimate backends).
    None,
}

/// Errors raised while building a model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Input width disagrees with the data.
    #[error("model expects inputs of width {expected}, got {actual}")]
    InputWidth {
        /// Width the model was built for.
        expected: usize,
        /// Width supplied.
        actual: usize,
    },
    /// Parameter registration failed.
    #[error(transparent)]
    Params(#[from] ParamStoreError),
    /// Worker pool failure while evaluating features.
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Fixed random hidden layer.
#[derive(Debug, Clone, PartialEq)]
struct DenseLayer {
    weight: Array2<f64>,
    bias: Array1<f64>,
}

/// Readout mapping embeddings to likelihood parameters.
///
/// Hidden layers are random projections drawn once per trial; inference only
/// fits the output layer, whose inputs are the last hidden activations plus a
/// constant bias feature.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadoutModel {
    family: ModelFamily,
    input_dim: usize,
    hidden: Vec<DenseLayer>,
    activation: Activation,
    output_dim: usize,
    weight_prior: WeightPrior,
    bias_prior: WeightPrior,
    noise_prior: NoisePrior,
    quantiles: Option<QuantileLevels>,
    compute: ComputeContext,
}

impl ReadoutModel {
    /// Model family.
    #[must_use]
    pub const fn family(&self) -> ModelFamily {
        self.family
    }

    /// Expected embedding width.
    #[must_use]
    pub const fn input_dim(&self) -> usize {
        self.input_dim
    }

    /// Outputs per input row (1, or the number of quantile levels).
    #[must_use]
    pub const fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Readout coefficients per output, bias included.
    #[must_use]
    pub fn feature_dim(&self) -> usize {
        self.hidden
            .last()
            .map_or(self.input_dim, |layer| layer.weight.ncols())
            + 1
    }

    /// Quantile levels of a quantile model.
    #[must_use]
    pub const fn quantiles(&self) -> Option<&QuantileLevels> {
        self.quantiles.as_ref()
    }

    /// Noise-scale prior.
    #[must_use]
    pub const fn noise_prior(&self) -> NoisePrior {
        self.noise_prior
    }

    /// Prior mean of the readout coefficients (bias last).
    #[must_use]
    pub fn prior_mean(&self) -> Array1<f64> {
        let mut mean = Array1::from_elem(self.feature_dim(), self.weight_prior.mean());
        let last = mean.len() - 1;
        mean[last] = self.bias_prior.mean();
        mean
    }

    /// Prior variance of the readout coefficients (bias last).
    #[must_use]
    pub fn prior_variance(&self) -> Array1<f64> {
        let mut variance = Array1::from_elem(self.feature_dim(), self.weight_prior.variance());
        let last = variance.len() - 1;
        variance[last] = self.bias_prior.variance();
        variance
    }

    /// Design matrix: hidden activations of `inputs` followed by a bias column.
    ///
    /// With hidden layers and a multi-thread context, row blocks are
    /// evaluated in parallel; each row's result does not depend on the split.
    pub fn features(&self, inputs: ArrayView2<'_, f64>) -> Result<Array2<f64>, ModelError> {
        if inputs.ncols() != self.input_dim {
            return Err(ModelError::InputWidth {
                expected: self.input_dim,
                actual: inputs.ncols(),
            });
        }
        let threads = self.compute.threads();
        if self.hidden.is_empty() || threads == 1 || inputs.nrows() < PARALLEL_MIN_ROWS {
            return Ok(self.block_features(inputs));
        }
        let block_rows = inputs.nrows().div_ceil(threads);
        let blocks: Vec<ArrayView2<'_, f64>> = inputs.axis_chunks_iter(Axis(0), block_rows).collect();
        let evaluated: Vec<Array2<f64>> = self
            .compute
            .install(|| blocks.into_par_iter().map(|block| self.block_features(block)).collect())?;
        let mut design = Array2::<f64>::zeros((inputs.nrows(), self.feature_dim()));
        let mut start = 0;
        for block in &evaluated {
            let end = start + block.nrows();
            design.slice_mut(s![start..end, ..]).assign(block);
            start = end;
        }
        Ok(design)
    }

    fn block_features(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut hidden = inputs.to_owned();
        for layer in &self.hidden {
            let mut next = hidden.dot(&layer.weight) + &layer.bias;
            let activation = self.activation;
            next.mapv_inplace(|v| activation.apply(v));
            hidden = next;
        }
        let width = hidden.ncols();
        let mut design = Array2::<f64>::ones((hidden.nrows(), width + 1));
        design.slice_mut(s![.., ..width]).assign(&hidden);
        design
    }
}

/// Builds fresh model/guide pairs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelFactory;

impl ModelFactory {
    /// Builds the readout for `family`, registering its parameters in `store`,
    /// and a guide when the policy asks for one.
    ///
    /// The guide is full-rank when embeddings were dimensionality-reduced and
    /// low-rank otherwise.
    pub fn build<R: Rng + ?Sized>(
        family: ModelFamily,
        policy: GuidePolicy,
        config: &ResolvedConfig,
        embedding_dim: usize,
        quantiles: &QuantileLevels,
        ctx: &ComputeContext,
        store: &mut ParamStore,
        rng: &mut R,
    ) -> Result<(ReadoutModel, Option<Guide>), ModelError> {
        let weight_prior = config.weight_prior();
        let (hidden, activation) = match family {
            ModelFamily::SpikeSlab => (Vec::new(), Activation::Identity),
            ModelFamily::Bayesian | ModelFamily::Quantile => {
                let widths = &config.model_widths;
                if widths[0] != embedding_dim {
                    return Err(ModelError::InputWidth {
                        expected: widths[0],
                        actual: embedding_dim,
                    });
                }
                let mut layers = Vec::new();
                for (index, pair) in widths[..widths.len() - 1].windows(2).enumerate() {
                    let (fan_in, fan_out) = (pair[0], pair[1]);
                    let scale = 1.0 / (fan_in as f64).sqrt();
                    let weight = Array2::from_shape_simple_fn((fan_in, fan_out), || {
                        weight_prior.sample(rng) * scale
                    });
                    let bias = Array1::from_shape_simple_fn(fan_out, || weight_prior.sample(rng) * scale);
                    store.register(format!("model.hidden.{index}.weight"), weight.clone())?;
                    store.register(format!("model.hidden.{index}.bias"), bias.clone())?;
                    layers.push(DenseLayer { weight, bias });
                }
                (layers, config.activation)
            }
        };

        let (output_dim, model_quantiles) = match family {
            ModelFamily::Quantile => (quantiles.len(), Some(quantiles.clone())),
            ModelFamily::Bayesian | ModelFamily::SpikeSlab => (1, None),
        };

        let model = ReadoutModel {
            family,
            input_dim: embedding_dim,
            hidden,
            activation,
            output_dim,
            weight_prior,
            bias_prior: config.bias_prior(),
            noise_prior: config.noise_prior(),
            quantiles: model_quantiles,
            compute: ctx.clone(),
        };

        let p = model.feature_dim();
        match family {
            ModelFamily::Bayesian => {
                store.register(NOISE_SCALE, Array1::from_elem(1, model.noise_prior.initial()))?;
            }
            ModelFamily::Quantile => {
                store.register(QUANTILE_WEIGHTS, Array2::<f64>::zeros((p, output_dim)))?;
            }
            ModelFamily::SpikeSlab => {
                store.register(NOISE_SCALE, Array1::from_elem(1, model.noise_prior.initial()))?;
                store.register(INCLUSION, Array1::from_elem(p, 0.5))?;
            }
        }

        let guide = match policy {
            GuidePolicy::Required => {
                let kind = GuideKind::select(config.dim_reduction, config.rank, p);
                Some(Guide::register(kind, model.prior_mean().view(), store, rng)?)
            }
            GuidePolicy::None => None,
        };
        Ok((model, guide))
    }
}
