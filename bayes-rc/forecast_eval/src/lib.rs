#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Repeated-seed evaluation of probabilistic forecasters trained on echo-state
//! reservoir embeddings: trial loop, pluggable inference backends, metric
//! aggregation and result reporting.

/// Experiment configuration and quantile levels.
#[path = "../config.rs"]
pub mod config;

/// Explicit numeric context passed to models and backends.
#[path = "../compute.rs"]
pub mod compute;

/// Dense factorizations used by the backends.
#[path = "../linalg.rs"]
pub mod linalg;

/// Distribution helpers and scoring rules.
#[path = "../stats.rs"]
pub mod stats;

/// Raw series loaders and split generation.
#[path = "../dataset/main.rs"]
pub mod dataset;

/// Reservoir embeddings and their cache.
#[path = "../embedding/main.rs"]
pub mod embedding;

/// Readout models, priors, guides and the per-trial parameter store.
#[path = "../model/main.rs"]
pub mod model;

/// Inference backends and the registry dispatching between them.
#[path = "../inference/main.rs"]
pub mod inference;

/// Telemetry helpers for logging/event emission.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Sequential seed-indexed trial loop.
#[path = "../trials.rs"]
pub mod trials;

/// Mean and population standard deviation per metric.
#[path = "../aggregate.rs"]
pub mod aggregate;

/// Scalar tracking and workbook export.
#[path = "../reporter.rs"]
pub mod reporter;

/// High-level orchestration entry point.
#[path = "../experiment.rs"]
pub mod experiment;

pub use aggregate::{aggregate, MetricSummary, Summary};
pub use compute::ComputeContext;
pub use config::{ConfigError, ExperimentConfig, QuantileLevels, ResolvedConfig};
pub use embedding::{
    bundle::{BundleError, EmbeddingBundle, SplitKind},
    esn::{ReservoirConfig, ReservoirEmbedder},
    EmbeddingCache, EmbeddingError, EmbeddingSource,
};
pub use experiment::{Experiment, ExperimentReport};
pub use inference::{
    diagnostics::{Diagnostics, DiagnosticsRecord, MetricKey},
    predictive::Predictive,
    DataSplit, InferenceError, InferenceMethod, InferenceOutcome, InferenceRegistry,
    InferenceRequest,
};
pub use reporter::{Reporter, RunMode, RunTracker, TableRow, Workbook};
pub use telemetry::{ExperimentTelemetry, ExperimentTelemetryBuilder};
pub use trials::{run_trials, ExperimentError, PerMetricSeries, TrialEnv};
