use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde_json::json;
use shared_logging::LogLevel;

use crate::{
    aggregate::{aggregate, Summary},
    compute::ComputeContext,
    config::{ExperimentConfig, QuantileLevels, ResolvedConfig},
    embedding::{bundle::EmbeddingBundle, EmbeddingCache, EmbeddingSource},
    inference::{InferenceMethod, InferenceRegistry},
    reporter::Reporter,
    telemetry::ExperimentTelemetry,
    trials::{run_trials, ExperimentError, PerMetricSeries, TrialEnv},
};

/// Per-seed series and their summary.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentReport {
    /// One entry per seed for every key.
    pub series: PerMetricSeries,
    /// Mean and population std per key.
    pub summary: Summary,
    /// When the first trial started.
    pub started_at: DateTime<Utc>,
    /// When reporting finished.
    pub finished_at: DateTime<Utc>,
}

/// One resolved experiment: configuration, backend and collaborators.
///
/// Construction resolves the configuration against the registry, so unknown
/// datasets or methods fail here, before embeddings are touched or any
/// trial runs.
pub struct Experiment {
    config: ResolvedConfig,
    method: Arc<dyn InferenceMethod>,
    quantiles: QuantileLevels,
    ctx: ComputeContext,
    telemetry: ExperimentTelemetry,
    artifacts: Option<PathBuf>,
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("dataset", &self.config.dataset)
            .field("inference", &self.method.name())
            .field("seeds", &self.config.seeds())
            .finish_non_exhaustive()
    }
}

impl Experiment {
    /// Resolves `config` and selects its backend.
    pub fn new(
        config: ExperimentConfig,
        registry: &InferenceRegistry,
        ctx: ComputeContext,
        telemetry: ExperimentTelemetry,
    ) -> Result<Self, ExperimentError> {
        let config = config.resolve(registry)?;
        let method = registry.resolve(&config)?;
        Ok(Self {
            config,
            method,
            quantiles: QuantileLevels::reference(),
            ctx,
            telemetry,
            artifacts: None,
        })
    }

    /// Directory receiving per-seed predictive bands when `plot` is set.
    #[must_use]
    pub fn with_artifacts(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifacts = Some(dir.into());
        self
    }

    /// Overrides the reference quantile list.
    #[must_use]
    pub fn with_quantiles(mut self, quantiles: QuantileLevels) -> Self {
        self.quantiles = quantiles;
        self
    }

    /// Frozen configuration.
    #[must_use]
    pub const fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Loads (or computes) the embeddings, then runs and reports.
    pub fn run<S: EmbeddingSource>(
        &self,
        cache: &EmbeddingCache<S>,
        reporter: &dyn Reporter,
    ) -> Result<ExperimentReport, ExperimentError> {
        let bundle = cache.load_or_compute(&self.config.dataset, self.config.dim_reduction)?;
        self.run_with_bundle(&bundle, reporter)
    }

    /// Runs every trial on `bundle`, aggregates, and hands results to `reporter`.
    pub fn run_with_bundle(
        &self,
        bundle: &EmbeddingBundle,
        reporter: &dyn Reporter,
    ) -> Result<ExperimentReport, ExperimentError> {
        let started_at = Utc::now();
        let env = TrialEnv {
            ctx: &self.ctx,
            telemetry: &self.telemetry,
            artifacts: self.artifacts.as_deref(),
        };
        let series = run_trials(&self.config, bundle, &self.quantiles, self.method.as_ref(), env)?;
        let summary = aggregate(&series);

        for (name, value) in summary.scalars() {
            reporter.log_scalar(&name, value)?;
        }
        if self.config.print_results {
            reporter.export_table(&self.config.sheet_name(), &series.rows())?;
        }
        let _ = self.telemetry.log(
            LogLevel::Info,
            "experiment.summary",
            json!({ "sheet": self.config.sheet_name(), "trials": summary.trials() }),
        );
        let _ = self.telemetry.event(
            "experiment.summary",
            serde_json::to_value(&summary).unwrap_or_default(),
        );
        Ok(ExperimentReport {
            series,
            summary,
            started_at,
            finished_at: Utc::now(),
        })
    }
}
