use std::{
    fs,
    path::{Path, PathBuf},
};

use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{bundle::EmbeddingBundle, pca::Pca, EmbeddingError, EmbeddingSource};
use crate::dataset::{
    load_dataset,
    splits::{generate_splits, TEST_PERCENT, VAL_PERCENT},
};

const POWER_ITERATIONS: usize = 300;
const POWER_BURN_IN: usize = 100;

/// Echo-state reservoir hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservoirConfig {
    /// Number of reservoir neurons.
    pub n_internal_units: usize,
    /// Target spectral radius of the recurrent weights.
    pub spectral_radius: f64,
    /// Leak rate; `1.0` disables leakage.
    pub leak: f64,
    /// Scale of the uniform input weights.
    pub input_scaling: f64,
    /// Fraction of non-zero recurrent weights.
    pub connectivity: f64,
    /// Initial transient states discarded from the training split.
    pub n_drop: usize,
    /// Components kept when dimensionality reduction is enabled.
    pub n_dim: usize,
    /// Seed of the reservoir weights.
    pub seed: u64,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            n_internal_units: 512,
            spectral_radius: 0.99,
            leak: 1.0,
            input_scaling: 0.1,
            connectivity: 0.25,
            n_drop: 10,
            n_dim: 75,
            seed: 0,
        }
    }
}

impl ReservoirConfig {
    /// Reads a JSON hyper-parameter file; missing fields take defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EmbeddingError> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|source| EmbeddingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|source| EmbeddingError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the reservoir cannot be built with.
    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.n_internal_units == 0 {
            return Err(EmbeddingError::Reservoir("n_internal_units must be positive".into()));
        }
        if !(self.connectivity > 0.0 && self.connectivity <= 1.0) {
            return Err(EmbeddingError::Reservoir(format!(
                "connectivity {} outside (0, 1]",
                self.connectivity
            )));
        }
        if !(self.leak > 0.0 && self.leak <= 1.0) {
            return Err(EmbeddingError::Reservoir(format!("leak {} outside (0, 1]", self.leak)));
        }
        if !(self.spectral_radius > 0.0 && self.spectral_radius.is_finite()) {
            return Err(EmbeddingError::Reservoir(format!(
                "spectral radius {} must be positive",
                self.spectral_radius
            )));
        }
        if self.n_dim == 0 {
            return Err(EmbeddingError::Reservoir("n_dim must be positive".into()));
        }
        Ok(())
    }
}

/// Fixed random recurrent network.
#[derive(Debug, Clone)]
pub struct Reservoir {
    input_weights: Array2<f64>,
    recurrent: Array2<f64>,
    leak: f64,
}

impl Reservoir {
    /// Draws the weights for `input_dim` inputs.
    #[must_use]
    pub fn new(config: &ReservoirConfig, input_dim: usize) -> Self {
        let units = config.n_internal_units;
        let mut rng = SmallRng::seed_from_u64(config.seed);
        let input_weights = Array2::from_shape_simple_fn((units, input_dim), || {
            rng.gen_range(-1.0..1.0) * config.input_scaling
        });
        let mut recurrent = Array2::from_shape_simple_fn((units, units), || {
            if rng.gen::<f64>() < config.connectivity {
                rng.gen_range(-0.5..0.5)
            } else {
                0.0
            }
        });
        let radius = spectral_radius(recurrent.view());
        if radius > 0.0 {
            recurrent.mapv_inplace(|w| w * config.spectral_radius / radius);
        }
        Self {
            input_weights,
            recurrent,
            leak: config.leak,
        }
    }

    /// Runs the reservoir from the zero state over `inputs`, one state per row.
    #[must_use]
    pub fn drive(&self, inputs: ArrayView2<'_, f64>) -> Array2<f64> {
        let units = self.recurrent.nrows();
        let mut state = Array1::<f64>::zeros(units);
        let mut states = Array2::<f64>::zeros((inputs.nrows(), units));
        for (row, input) in inputs.rows().into_iter().enumerate() {
            let update = (self.recurrent.dot(&state) + self.input_weights.dot(&input)).mapv(f64::tanh);
            state = state * (1.0 - self.leak) + update * self.leak;
            states.row_mut(row).assign(&state);
        }
        states
    }

    /// Largest eigenvalue modulus of the recurrent weights after scaling.
    #[must_use]
    pub fn spectral_radius(&self) -> f64 {
        spectral_radius(self.recurrent.view())
    }
}

/// Power iteration; the radius is the geometric mean of the per-step growth
/// after a burn-in, which also converges for complex dominant pairs.
fn spectral_radius(matrix: ArrayView2<'_, f64>) -> f64 {
    let n = matrix.nrows();
    if n == 0 {
        return 0.0;
    }
    let mut vector = Array1::from_elem(n, 1.0 / (n as f64).sqrt());
    let mut log_growth = 0.0;
    for step in 0..POWER_ITERATIONS {
        let next = matrix.dot(&vector);
        let norm = next.dot(&next).sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return 0.0;
        }
        if step >= POWER_BURN_IN {
            log_growth += norm.ln();
        }
        vector = next / norm;
    }
    (log_growth / (POWER_ITERATIONS - POWER_BURN_IN) as f64).exp()
}

/// Builds bundles from a named dataset with an echo-state reservoir.
#[derive(Debug, Clone)]
pub struct ReservoirEmbedder {
    config: ReservoirConfig,
    data_dir: PathBuf,
}

impl ReservoirEmbedder {
    /// Embedder reading raw series from `data_dir`.
    pub fn new(config: ReservoirConfig, data_dir: impl Into<PathBuf>) -> Result<Self, EmbeddingError> {
        config.validate()?;
        Ok(Self {
            config,
            data_dir: data_dir.into(),
        })
    }

    /// Hyper-parameters in use.
    #[must_use]
    pub const fn config(&self) -> &ReservoirConfig {
        &self.config
    }
}

impl EmbeddingSource for ReservoirEmbedder {
    fn reservoir_units(&self) -> usize {
        self.config.n_internal_units
    }

    fn compute(&self, dataset: &str, dim_reduction: bool) -> Result<EmbeddingBundle, EmbeddingError> {
        let series = load_dataset(dataset, &self.data_dir)?;
        let splits = generate_splits(&series, TEST_PERCENT, VAL_PERCENT)?;
        let (n_train, n_val) = (splits.train.targets.len(), splits.validation.targets.len());
        let n_drop = self.config.n_drop;
        if n_drop >= n_train {
            return Err(EmbeddingError::Reservoir(format!(
                "cannot drop {n_drop} transient states from {n_train} training rows"
            )));
        }

        let inputs = concatenate(
            Axis(0),
            &[
                splits.train.inputs.view(),
                splits.validation.inputs.view(),
                splits.test.inputs.view(),
            ],
        )
        .map_err(|err| EmbeddingError::Reservoir(err.to_string()))?;
        let reservoir = Reservoir::new(&self.config, inputs.ncols());
        let states = reservoir.drive(inputs.view());

        let train = states.slice(s![n_drop..n_train, ..]);
        let validation = states.slice(s![n_train..n_train + n_val, ..]);
        let test = states.slice(s![n_train + n_val.., ..]);
        let (train, validation, test) = if dim_reduction {
            let limit = train.nrows().min(self.config.n_internal_units);
            if self.config.n_dim > limit {
                return Err(EmbeddingError::Reservoir(format!(
                    "n_dim {} exceeds {limit}, the smaller of {} training states and {} units",
                    self.config.n_dim,
                    train.nrows(),
                    self.config.n_internal_units
                )));
            }
            let pca = Pca::fit(train, self.config.n_dim);
            (pca.transform(train), pca.transform(validation), pca.transform(test))
        } else {
            (train.to_owned(), validation.to_owned(), test.to_owned())
        };

        Ok(EmbeddingBundle::new(
            splits.train.targets.slice(s![n_drop..]).to_owned(),
            train,
            splits.validation.targets,
            validation,
            splits.test.targets,
            test,
        )?)
    }
}
