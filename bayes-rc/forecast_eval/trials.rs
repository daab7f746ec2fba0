use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use rand::{rngs::SmallRng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;
use thiserror::Error;

use crate::{
    compute::ComputeContext,
    config::{ConfigError, QuantileLevels, ResolvedConfig},
    embedding::{
        bundle::{EmbeddingBundle, SplitKind},
        EmbeddingError,
    },
    inference::{
        diagnostics::{DiagnosticsRecord, MetricKey},
        predictive::Predictive,
        scoring::INTERVAL_LEVELS,
        DataSplit, InferenceError, InferenceMethod, InferenceRequest,
    },
    model::{params::ParamStore, ModelError, ModelFamily},
    telemetry::ExperimentTelemetry,
};

/// Failures that abort an experiment.
///
/// Backend and model errors pass through unmodified; no seed is retried and
/// no partial series is returned.
#[derive(Debug, Error)]
pub enum ExperimentError {
    /// Raised while resolving the configuration, before any trial.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Embeddings could not be produced or loaded.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    /// Model construction failed inside a trial.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Backend failure inside a trial.
    #[error(transparent)]
    Inference(#[from] InferenceError),
    /// Model input width disagrees with the embeddings.
    #[error("model_widths[0] is {expected} but embeddings have {actual} columns")]
    InputWidth {
        /// Configured input width.
        expected: usize,
        /// Embedding width.
        actual: usize,
    },
    /// Plot artifact could not be written.
    #[error("failed to write artifact {path}: {source}")]
    Artifact {
        /// Artifact path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Reporter failure.
    #[error(transparent)]
    Report(#[from] anyhow::Error),
}

/// One ordered series per diagnostics key, one entry per completed trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerMetricSeries {
    seeds: Vec<u64>,
    series: IndexMap<MetricKey, Vec<f64>>,
}

impl Default for PerMetricSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl PerMetricSeries {
    /// Empty series for every key of the vocabulary.
    #[must_use]
    pub fn new() -> Self {
        Self {
            seeds: Vec::new(),
            series: MetricKey::ALL.into_iter().map(|key| (key, Vec::new())).collect(),
        }
    }

    /// Appends one trial's record.
    pub fn push(&mut self, seed: u64, record: &DiagnosticsRecord) {
        self.seeds.push(seed);
        for (key, value) in record.iter() {
            self.series.entry(key).or_default().push(value);
        }
    }

    /// Series of one key, in seed order.
    #[must_use]
    pub fn get(&self, key: MetricKey) -> &[f64] {
        self.series.get(&key).map_or(&[], Vec::as_slice)
    }

    /// Seeds in trial order.
    #[must_use]
    pub fn seeds(&self) -> &[u64] {
        &self.seeds
    }

    /// Number of completed trials.
    #[must_use]
    pub fn trials(&self) -> usize {
        self.seeds.len()
    }

    /// `(key, series)` pairs in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (MetricKey, &[f64])> + '_ {
        self.series.iter().map(|(key, values)| (*key, values.as_slice()))
    }

    /// Per-seed table rows: `seed` followed by one column per key.
    #[must_use]
    pub fn rows(&self) -> Vec<IndexMap<String, f64>> {
        self.seeds
            .iter()
            .enumerate()
            .map(|(trial, seed)| {
                let mut row = IndexMap::new();
                row.insert("seed".to_string(), *seed as f64);
                for (key, values) in &self.series {
                    row.insert(key.column().to_string(), values[trial]);
                }
                row
            })
            .collect()
    }
}

/// Collaborators shared by every trial of an experiment.
#[derive(Debug, Clone, Copy)]
pub struct TrialEnv<'a> {
    /// Numeric context handed to backends.
    pub ctx: &'a ComputeContext,
    /// Logs and tracking events.
    pub telemetry: &'a ExperimentTelemetry,
    /// Destination of per-seed predictive bands when plotting is on.
    pub artifacts: Option<&'a Path>,
}

/// Test predictive bands written for plotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveBands {
    /// Trial seed.
    pub seed: u64,
    /// Predictive mean.
    pub mean: Vec<f64>,
    /// 2.5 % quantile.
    pub lower: Vec<f64>,
    /// 97.5 % quantile.
    pub upper: Vec<f64>,
    /// Observed test targets.
    pub targets: Vec<f64>,
}

/// Runs `config.seed` independent trials sequentially.
///
/// Trial `k` seeds its generator with `k` and gets its own parameter store,
/// so it is reproducible in isolation. The first failing trial aborts the
/// experiment.
pub fn run_trials(
    config: &ResolvedConfig,
    bundle: &EmbeddingBundle,
    quantiles: &QuantileLevels,
    method: &dyn InferenceMethod,
    env: TrialEnv<'_>,
) -> Result<PerMetricSeries, ExperimentError> {
    let embedding_dim = bundle.embedding_dim();
    if method.family() != ModelFamily::SpikeSlab && config.model_widths[0] != embedding_dim {
        return Err(ExperimentError::InputWidth {
            expected: config.model_widths[0],
            actual: embedding_dim,
        });
    }
    let (train_x, train_y) = bundle.split(SplitKind::Train);
    let (val_x, val_y) = bundle.split(SplitKind::Validation);
    let (test_x, test_y) = bundle.split(SplitKind::Test);
    let train = DataSplit::new(train_x, train_y)?;
    let validation = if val_y.is_empty() {
        None
    } else {
        Some(DataSplit::new(val_x, val_y)?)
    };
    let test = DataSplit::new(test_x, test_y)?;

    let seeds = config.seeds();
    note(
        env.telemetry,
        LogLevel::Info,
        "experiment.started",
        json!({
            "dataset": config.dataset,
            "inference": method.name(),
            "seeds": seeds,
            "embedding_dim": embedding_dim,
            "compute": env.ctx.describe(),
        }),
    );

    let mut series = PerMetricSeries::new();
    for trial in 0..seeds {
        let seed = trial as u64;
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut store = ParamStore::new();
        let (model, guide) = method.build(config, embedding_dim, quantiles, env.ctx, &mut store, &mut rng)?;
        let outcome = method.run(InferenceRequest {
            config,
            model: &model,
            guide: guide.as_ref(),
            store: &mut store,
            train: DataSplit {
                inputs: train.inputs.reborrow(),
                targets: train.targets.reborrow(),
            },
            validation: validation.map(|split| DataSplit {
                inputs: split.inputs.reborrow(),
                targets: split.targets.reborrow(),
            }),
            test: DataSplit {
                inputs: test.inputs.reborrow(),
                targets: test.targets.reborrow(),
            },
            quantiles: Some(quantiles),
            ctx: env.ctx,
            rng: &mut rng,
        })?;
        let record = outcome
            .diagnostics
            .complete()
            .map_err(InferenceError::from)?;

        if config.plot {
            if let Some(dir) = env.artifacts {
                write_bands(dir, config, seed, outcome.predictive.as_ref(), test)?;
            }
        }

        note(
            env.telemetry,
            LogLevel::Debug,
            "experiment.trial.completed",
            json!({ "seed": seed, "train_time": record.get(MetricKey::TrainTime) }),
        );
        let payload: serde_json::Map<String, serde_json::Value> = record
            .iter()
            .map(|(key, value)| (key.name().to_string(), json!(value)))
            .collect();
        let _ = env
            .telemetry
            .event_at("experiment.trial.completed", seed, payload.into());
        series.push(seed, &record);
    }

    note(
        env.telemetry,
        LogLevel::Info,
        "experiment.completed",
        json!({ "inference": method.name(), "trials": series.trials() }),
    );
    Ok(series)
}

fn write_bands(
    dir: &Path,
    config: &ResolvedConfig,
    seed: u64,
    predictive: &dyn Predictive,
    test: DataSplit<'_>,
) -> Result<(), ExperimentError> {
    let mean = predictive.mean(test.inputs)?;
    let interval = predictive.quantiles(test.inputs, &INTERVAL_LEVELS)?;
    let bands = PredictiveBands {
        seed,
        mean: mean.to_vec(),
        lower: interval.column(0).to_vec(),
        upper: interval.column(1).to_vec(),
        targets: test.targets.to_vec(),
    };
    let path = dir.join(format!("{}_{}_seed{seed}.json", config.dataset, config.inference));
    let io = |source| ExperimentError::Artifact {
        path: path.clone(),
        source,
    };
    fs::create_dir_all(dir).map_err(io)?;
    let encoded = serde_json::to_vec_pretty(&bands).map_err(|err| io(err.into()))?;
    fs::write(&path, encoded).map_err(io)
}

fn note(telemetry: &ExperimentTelemetry, level: LogLevel, message: &str, metadata: serde_json::Value) {
    let _ = telemetry.log(level, message, metadata);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ExperimentConfig, inference::InferenceRegistry};
    use ndarray::{Array1, Array2};
    use tempfile::tempdir;

    fn bundle(dim: usize) -> EmbeddingBundle {
        let rows = |n: usize, phase: f64| {
            Array2::from_shape_fn((n, dim), |(i, j)| ((i + j) as f64 * 0.31 + phase).sin())
        };
        let targets = |x: &Array2<f64>| {
            Array1::from_shape_fn(x.nrows(), |i| 0.8 * x[[i, 0]] + 0.05 * (i as f64 * 1.3).cos())
        };
        let (train, val, test) = (rows(120, 0.0), rows(30, 1.0), rows(30, 2.0));
        EmbeddingBundle::new(targets(&train), train.clone(), targets(&val), val, targets(&test), test)
            .unwrap()
    }

    fn config(inference: &str, seeds: usize, plot: bool) -> ResolvedConfig {
        ExperimentConfig {
            model_widths: vec![4, 1],
            inference: inference.into(),
            seed: seeds,
            num_iterations: 50,
            num_samples: 20,
            num_chains: 1,
            lr: 0.01,
            plot,
            ..ExperimentConfig::default()
        }
        .resolve(&InferenceRegistry::with_builtin())
        .unwrap()
    }

    #[test]
    fn every_key_has_one_entry_per_seed() {
        let registry = InferenceRegistry::with_builtin();
        let config = config("bayes", 3, false);
        let method = registry.resolve(&config).unwrap();
        let ctx = ComputeContext::cpu(1);
        let telemetry = ExperimentTelemetry::disabled();
        let env = TrialEnv { ctx: &ctx, telemetry: &telemetry, artifacts: None };
        let series = run_trials(&config, &bundle(4), &QuantileLevels::reference(), method.as_ref(), env).unwrap();
        assert_eq!(series.seeds(), [0, 1, 2]);
        for (_, values) in series.iter() {
            assert_eq!(values.len(), 3);
        }
        let rows = series.rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["seed"], 2.0);
        assert_eq!(rows[0].len(), MetricKey::ALL.len() + 1);
    }

    #[test]
    fn mismatched_input_width_fails_before_any_trial() {
        let registry = InferenceRegistry::with_builtin();
        let config = config("bayes", 2, false);
        let method = registry.resolve(&config).unwrap();
        let ctx = ComputeContext::cpu(1);
        let telemetry = ExperimentTelemetry::disabled();
        let env = TrialEnv { ctx: &ctx, telemetry: &telemetry, artifacts: None };
        let err = run_trials(&config, &bundle(6), &QuantileLevels::reference(), method.as_ref(), env).unwrap_err();
        assert!(matches!(err, ExperimentError::InputWidth { expected: 4, actual: 6 }));
    }

    #[test]
    fn plotting_writes_one_band_file_per_seed() {
        let dir = tempdir().unwrap();
        let registry = InferenceRegistry::with_builtin();
        let config = config("bayes", 2, true);
        let method = registry.resolve(&config).unwrap();
        let ctx = ComputeContext::cpu(1);
        let telemetry = ExperimentTelemetry::disabled();
        let env = TrialEnv { ctx: &ctx, telemetry: &telemetry, artifacts: Some(dir.path()) };
        run_trials(&config, &bundle(4), &QuantileLevels::reference(), method.as_ref(), env).unwrap();
        let raw = fs::read(dir.path().join("acea_bayes_seed1.json")).unwrap();
        let bands: PredictiveBands = serde_json::from_slice(&raw).unwrap();
        assert_eq!(bands.seed, 1);
        assert_eq!(bands.targets.len(), 30);
        assert!(bands.lower.iter().zip(&bands.upper).all(|(lo, hi)| lo <= hi));
        assert!(!dir.path().join("acea_bayes_seed2.json").exists());
    }

    #[test]
    fn empty_validation_split_is_passed_as_none() {
        let train = Array2::from_shape_fn((40, 4), |(i, j)| ((i * 3 + j) as f64).cos());
        let test = Array2::from_shape_fn((10, 4), |(i, j)| ((i + j) as f64).sin());
        let bundle = EmbeddingBundle::new(
            train.column(1).to_owned(),
            train.clone(),
            Array1::zeros(0),
            Array2::zeros((0, 4)),
            test.column(1).to_owned(),
            test,
        )
        .unwrap();
        let registry = InferenceRegistry::with_builtin();
        let config = config("bayes", 1, false);
        let method = registry.resolve(&config).unwrap();
        let ctx = ComputeContext::cpu(1);
        let telemetry = ExperimentTelemetry::disabled();
        let env = TrialEnv { ctx: &ctx, telemetry: &telemetry, artifacts: None };
        let series = run_trials(&config, &bundle, &QuantileLevels::reference(), method.as_ref(), env).unwrap();
        assert_eq!(series.get(MetricKey::NewMse), series.get(MetricKey::Mse));
    }
}
