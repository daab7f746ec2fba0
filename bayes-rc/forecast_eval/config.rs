use std::{fmt, fs, ops::Deref, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    dataset::KNOWN_DATASETS,
    inference::InferenceRegistry,
    model::priors::{NoisePrior, WeightPrior},
};

/// Hidden-layer nonlinearity of the readout model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Hyperbolic tangent.
    #[default]
    Tanh,
    /// Rectified linear unit.
    Relu,
    /// Logistic sigmoid.
    Sigmoid,
    /// No nonlinearity.
    Identity,
}

impl Activation {
    /// Applies the nonlinearity to a scalar.
    #[must_use]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            Self::Tanh => x.tanh(),
            Self::Relu => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Identity => x,
        }
    }
}

/// Family of a prior distribution spec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    /// Normal with `[mean, std]` parameters.
    Gauss,
    /// Uniform with `[low, high]` parameters.
    Unif,
}

impl fmt::Display for DistributionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gauss => write!(f, "gauss"),
            Self::Unif => write!(f, "unif"),
        }
    }
}

/// Raw experiment options as written by the caller or read from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Dataset identifier (`acea`, `spain`).
    pub dataset: String,
    /// Layer widths of the readout, input first. The last width is the
    /// single forecast output and must be 1; quantile models widen it to one
    /// output per level themselves.
    pub model_widths: Vec<usize>,
    /// Hidden-layer activation.
    pub activation: Activation,
    /// Prior families: weights, noise scale, bias.
    pub distributions: Vec<DistributionKind>,
    /// Prior parameters matching `distributions` (the bias prior reuses the first pair).
    pub parameters: Vec<[f64; 2]>,
    /// Whether reservoir states are PCA-reduced.
    pub dim_reduction: bool,
    /// Independent chains for sampling backends.
    pub num_chains: usize,
    /// Kept draws per chain for sampling backends.
    pub num_samples: usize,
    /// Inference method name, resolved through the registry.
    pub inference: String,
    /// Optimizer step size.
    pub lr: f64,
    /// Optimizer iterations.
    pub num_iterations: usize,
    /// Rank of the low-rank guide (`None` picks `round(sqrt(p))`).
    pub rank: Option<usize>,
    /// Write per-seed predictive bands.
    pub plot: bool,
    /// Number of seeds (trials).
    pub seed: usize,
    /// Export the per-seed table to the workbook.
    pub print_results: bool,
    /// Sweep run: tracker goes online.
    pub sweep: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            dataset: "acea".into(),
            model_widths: vec![512, 1],
            activation: Activation::Tanh,
            distributions: vec![
                DistributionKind::Gauss,
                DistributionKind::Unif,
                DistributionKind::Gauss,
            ],
            parameters: vec![[0.0, 1.0], [0.0, 10.0]],
            dim_reduction: false,
            num_chains: 10,
            num_samples: 1000,
            inference: "q_regr".into(),
            lr: 0.001,
            num_iterations: 500,
            rank: None,
            plot: true,
            seed: 1,
            print_results: true,
            sweep: false,
        }
    }
}

impl ExperimentConfig {
    /// Parses a TOML document; missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validates every option once and freezes the result.
    pub fn resolve(self, registry: &InferenceRegistry) -> Result<ResolvedConfig, ConfigError> {
        if !KNOWN_DATASETS.contains(&self.dataset.as_str()) {
            return Err(ConfigError::UnknownDataset(self.dataset));
        }
        if !registry.contains(&self.inference) {
            return Err(ConfigError::UnknownInference {
                name: self.inference,
                known: registry.names().join(", "),
            });
        }
        if self.seed == 0 {
            return Err(ConfigError::Invalid("seed count must be at least 1".into()));
        }
        if self.model_widths.len() < 2 || self.model_widths.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "model_widths must list at least two positive widths, got {:?}",
                self.model_widths
            )));
        }
        if self.model_widths.last() != Some(&1) {
            return Err(ConfigError::Invalid(format!(
                "model_widths must end with a single output, got {:?}",
                self.model_widths
            )));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::Invalid(format!("lr must be positive, got {}", self.lr)));
        }
        if self.num_iterations == 0 || self.num_samples == 0 || self.num_chains == 0 {
            return Err(ConfigError::Invalid(
                "num_iterations, num_samples and num_chains must be positive".into(),
            ));
        }
        if self.rank == Some(0) {
            return Err(ConfigError::Invalid("rank must be positive when set".into()));
        }
        let weight_prior = WeightPrior::from_spec(self.distribution(0)?, self.parameter(0)?)?;
        let noise_prior = NoisePrior::from_spec(self.distribution(1)?, self.parameter(1)?)?;
        let bias_prior = match self.distributions.get(2) {
            Some(kind) => WeightPrior::from_spec(*kind, self.parameter(0)?)?,
            None => weight_prior,
        };
        Ok(ResolvedConfig {
            inner: Arc::new(self),
            weight_prior,
            bias_prior,
            noise_prior,
        })
    }

    fn distribution(&self, index: usize) -> Result<DistributionKind, ConfigError> {
        self.distributions
            .get(index)
            .copied()
            .ok_or_else(|| ConfigError::Invalid(format!("missing prior distribution #{index}")))
    }

    fn parameter(&self, index: usize) -> Result<[f64; 2], ConfigError> {
        self.parameters
            .get(index)
            .copied()
            .ok_or_else(|| ConfigError::Invalid(format!("missing prior parameters #{index}")))
    }
}

/// Validated, read-only configuration shared by every trial of an experiment.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    inner: Arc<ExperimentConfig>,
    weight_prior: WeightPrior,
    bias_prior: WeightPrior,
    noise_prior: NoisePrior,
}

impl ResolvedConfig {
    /// Prior over readout weights.
    #[must_use]
    pub const fn weight_prior(&self) -> WeightPrior {
        self.weight_prior
    }

    /// Prior over the readout bias.
    #[must_use]
    pub const fn bias_prior(&self) -> WeightPrior {
        self.bias_prior
    }

    /// Prior over the observation noise scale.
    #[must_use]
    pub const fn noise_prior(&self) -> NoisePrior {
        self.noise_prior
    }

    /// Number of trials.
    #[must_use]
    pub fn seeds(&self) -> usize {
        self.inner.seed
    }

    /// Workbook sheet name for this experiment.
    #[must_use]
    pub fn sheet_name(&self) -> String {
        format!("sheet_{}_{}", self.inner.dataset, self.inner.inference)
    }
}

impl Deref for ResolvedConfig {
    type Target = ExperimentConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Ordered probability levels used by quantile regression and calibration scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileLevels(Vec<f64>);

impl QuantileLevels {
    /// `[0, 0.005, 0.025, 0.05, …, 0.975, 0.995]`.
    #[must_use]
    pub fn reference() -> Self {
        let mut levels = vec![0.0, 0.005];
        levels.extend((1..=39).map(|n| 0.025 * f64::from(n)));
        levels.push(0.995);
        Self(levels)
    }

    /// Builds a custom list; levels must lie in `[0, 1]` and be strictly increasing.
    pub fn new(levels: Vec<f64>) -> Result<Self, ConfigError> {
        if levels.is_empty() {
            return Err(ConfigError::Invalid("quantile list is empty".into()));
        }
        if let Some(bad) = levels.iter().find(|l| !(0.0..=1.0).contains(*l)) {
            return Err(ConfigError::Invalid(format!("quantile level {bad} outside [0, 1]")));
        }
        if levels.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::Invalid("quantile levels must be strictly increasing".into()));
        }
        Ok(Self(levels))
    }

    /// All levels.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// Levels strictly inside `(0, 1)`.
    #[must_use]
    pub fn interior(&self) -> Vec<f64> {
        self.0.iter().copied().filter(|l| *l > 0.0 && *l < 1.0).collect()
    }

    /// Number of levels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty (never true for a constructed list).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Configuration errors; all are raised before any trial runs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Dataset name not in the catalog.
    #[error("{0} dataset not defined")]
    UnknownDataset(String),
    /// Inference method not registered.
    #[error("unknown inference method `{name}` (registered: {known})")]
    UnknownInference {
        /// Offending name.
        name: String,
        /// Registered names.
        known: String,
    },
    /// Prior family unsupported for the slot it appears in.
    #[error("unsupported {slot} prior `{kind}`")]
    UnsupportedPrior {
        /// Prior slot (`weight`, `noise`, `bias`).
        slot: &'static str,
        /// Distribution family.
        kind: DistributionKind,
    },
    /// Any other out-of-range option.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// TOML syntax or type error.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// Configuration file unreadable.
    #[error("failed to read configuration {path}: {message}")]
    Io {
        /// File path.
        path: String,
        /// Underlying IO error.
        message: String,
    },
}
