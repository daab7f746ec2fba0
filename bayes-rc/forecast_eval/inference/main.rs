//! Inference backends behind one contract, and the registry that dispatches
//! on the configured method name.

/// Conjugate Bayesian readout.
pub mod bayes;
/// Fixed diagnostics vocabulary.
pub mod diagnostics;
/// Gibbs samplers (`mcmc`, `ssvs`).
pub mod gibbs;
/// First-order optimizers.
pub mod optim;
/// Predictive distributions returned by backends.
pub mod predictive;
/// Linear quantile regression.
pub mod quantile;
/// Shared accuracy and calibration scoring.
pub mod scoring;
/// Variational inference with analytic ELBO.
pub mod svi;

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use ndarray::{ArrayView1, ArrayView2};
use rand::rngs::SmallRng;
use thiserror::Error;

use crate::{
    compute::{ComputeContext, ComputeError},
    config::{ConfigError, QuantileLevels, ResolvedConfig},
    linalg::LinalgError,
    model::{
        guide::Guide, params::ParamStore, params::ParamStoreError, GuidePolicy, ModelError,
        ModelFactory, ModelFamily, ReadoutModel,
    },
};
use diagnostics::{Diagnostics, DiagnosticsError};
use predictive::Predictive;

/// Row-aligned inputs and targets of one split.
#[derive(Debug, Clone, Copy)]
pub struct DataSplit<'a> {
    /// `rows × embedding_dim` inputs.
    pub inputs: ArrayView2<'a, f64>,
    /// One target per row.
    pub targets: ArrayView1<'a, f64>,
}

impl<'a> DataSplit<'a> {
    /// Pairs inputs with targets, rejecting misaligned rows.
    pub fn new(
        inputs: ArrayView2<'a, f64>,
        targets: ArrayView1<'a, f64>,
    ) -> Result<Self, InferenceError> {
        if inputs.nrows() != targets.len() {
            return Err(InferenceError::Shape(format!(
                "{} input rows against {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        Ok(Self { inputs, targets })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the split is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Everything a backend needs for one trial.
pub struct InferenceRequest<'a> {
    /// Frozen experiment configuration.
    pub config: &'a ResolvedConfig,
    /// Readout built for this trial.
    pub model: &'a ReadoutModel,
    /// Guide, for backends that asked for one.
    pub guide: Option<&'a Guide>,
    /// The trial's parameter store.
    pub store: &'a mut ParamStore,
    /// Training split.
    pub train: DataSplit<'a>,
    /// Validation split used for recalibrated scores.
    pub validation: Option<DataSplit<'a>>,
    /// Test split.
    pub test: DataSplit<'a>,
    /// Quantile levels of the experiment.
    pub quantiles: Option<&'a QuantileLevels>,
    /// Numeric context.
    pub ctx: &'a ComputeContext,
    /// Trial-seeded generator.
    pub rng: &'a mut SmallRng,
}

impl InferenceRequest<'_> {
    /// Levels used for calibration scoring.
    #[must_use]
    pub fn scoring_levels(&self) -> QuantileLevels {
        self.quantiles
            .cloned()
            .unwrap_or_else(QuantileLevels::reference)
    }
}

impl fmt::Debug for InferenceRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("inference", &self.config.inference)
            .field("train_rows", &self.train.len())
            .field("test_rows", &self.test.len())
            .field("device", &self.ctx.device().id)
            .finish_non_exhaustive()
    }
}

/// What a backend hands back.
pub struct InferenceOutcome {
    /// Fitted predictive distribution.
    pub predictive: Box<dyn Predictive>,
    /// Subset of the diagnostics vocabulary the backend produced.
    pub diagnostics: Diagnostics,
}

impl fmt::Debug for InferenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceOutcome")
            .field("diagnostics", &self.diagnostics)
            .finish_non_exhaustive()
    }
}

/// Backend failures. They abort the experiment and surface unmodified.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Factorization failure.
    #[error(transparent)]
    Linalg(#[from] LinalgError),
    /// Model evaluation failure.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Parameter store failure.
    #[error(transparent)]
    Params(#[from] ParamStoreError),
    /// Diagnostics failed validation.
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    /// Worker pool failure.
    #[error(transparent)]
    Compute(#[from] ComputeError),
    /// Objective or state diverged.
    #[error("{method}: {what} became non-finite at iteration {iteration}")]
    NonFinite {
        /// Backend name.
        method: &'static str,
        /// Quantity that diverged.
        what: &'static str,
        /// Iteration at which it was detected.
        iteration: usize,
    },
    /// Backend needs a guide but none was built.
    #[error("{0} requires a variational guide")]
    MissingGuide(&'static str),
    /// Inconsistent array shapes.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Dispatch on a name the registry does not know.
    #[error("inference method `{0}` is not registered")]
    Unregistered(String),
    /// Free-form failure raised by an externally registered backend.
    #[error("{method} failed: {message}")]
    Backend {
        /// Backend name.
        method: String,
        /// Failure description.
        message: String,
    },
}

/// One inference procedure: builds its model/guide pair and fits it.
pub trait InferenceMethod: Send + Sync {
    /// Registry name (`svi`, `bayes`, …).
    fn name(&self) -> &str;

    /// Readout family the method fits.
    fn family(&self) -> ModelFamily;

    /// Whether a guide is built alongside the model.
    fn guide_policy(&self) -> GuidePolicy {
        GuidePolicy::None
    }

    /// Builds a fresh model/guide pair in the trial's store.
    fn build(
        &self,
        config: &ResolvedConfig,
        embedding_dim: usize,
        quantiles: &QuantileLevels,
        ctx: &ComputeContext,
        store: &mut ParamStore,
        rng: &mut SmallRng,
    ) -> Result<(ReadoutModel, Option<Guide>), ModelError> {
        ModelFactory::build(
            self.family(),
            self.guide_policy(),
            config,
            embedding_dim,
            quantiles,
            ctx,
            store,
            rng,
        )
    }

    /// Fits the model and scores the predictive.
    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError>;
}

/// Name → method table.
#[derive(Clone, Default)]
pub struct InferenceRegistry {
    methods: IndexMap<String, Arc<dyn InferenceMethod>>,
}

impl fmt::Debug for InferenceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl InferenceRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in backend.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(svi::VariationalInference));
        registry.register(Arc::new(bayes::ConjugateBayes));
        registry.register(Arc::new(gibbs::GibbsRegression));
        registry.register(Arc::new(gibbs::SpikeSlabSelection));
        registry.register(Arc::new(quantile::QuantileRegression));
        registry
    }

    /// Adds a method, returning the one it replaced.
    pub fn register(&mut self, method: Arc<dyn InferenceMethod>) -> Option<Arc<dyn InferenceMethod>> {
        self.methods.insert(method.name().to_string(), method)
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Method by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn InferenceMethod>> {
        self.methods.get(name).cloned()
    }

    /// Method selected by a resolved configuration.
    pub fn resolve(&self, config: &ResolvedConfig) -> Result<Arc<dyn InferenceMethod>, ConfigError> {
        self.get(&config.inference)
            .ok_or_else(|| ConfigError::UnknownInference {
                name: config.inference.clone(),
                known: self.names().join(", "),
            })
    }

    /// Dispatches a request to the method named by its configuration.
    pub fn infer(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        let method = self
            .get(&request.config.inference)
            .ok_or_else(|| InferenceError::Unregistered(request.config.inference.clone()))?;
        method.run(request)
    }
}

fn noise_scale(store: &ParamStore) -> Result<f64, InferenceError> {
    store
        .vector(crate::model::NOISE_SCALE)?
        .first()
        .copied()
        .ok_or_else(|| InferenceError::Shape("empty noise scale".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::resolved;

    #[test]
    fn builtin_registry_lists_every_backend() {
        let registry = InferenceRegistry::with_builtin();
        assert_eq!(registry.names(), ["svi", "bayes", "mcmc", "ssvs", "q_regr"]);
        assert!(registry.contains("q_regr"));
        assert!(!registry.contains("nuts"));
        let config = resolved(vec![2, 1], "mcmc");
        let method = registry.resolve(&config).unwrap();
        assert_eq!(method.family(), ModelFamily::Bayesian);
        assert_eq!(method.guide_policy(), GuidePolicy::None);
        assert_eq!(registry.get("svi").unwrap().guide_policy(), GuidePolicy::Required);
    }

    #[test]
    fn infer_dispatches_on_configured_name() {
        use rand::SeedableRng;

        let registry = InferenceRegistry::with_builtin();
        let config = resolved(vec![2, 1], "bayes");
        let x = ndarray::Array2::from_shape_fn((60, 2), |(i, j)| ((i * 2 + j) as f64 * 0.17).sin());
        let y = x.column(0).mapv(|v| 1.5 * v) + x.column(1).mapv(|v| 0.01 * v.cos());
        let split = DataSplit::new(x.view(), y.view()).unwrap();
        let levels = QuantileLevels::reference();
        let ctx = ComputeContext::cpu(1);
        let mut store = ParamStore::new();
        let mut rng = SmallRng::seed_from_u64(0);
        let method = registry.resolve(&config).unwrap();
        let (model, guide) = method.build(&config, 2, &levels, &ctx, &mut store, &mut rng).unwrap();
        let outcome = registry
            .infer(InferenceRequest {
                config: &config,
                model: &model,
                guide: guide.as_ref(),
                store: &mut store,
                train: split,
                validation: None,
                test: split,
                quantiles: Some(&levels),
                ctx: &ctx,
                rng: &mut rng,
            })
            .unwrap();
        let record = outcome.diagnostics.complete().unwrap();
        assert!(record.get(diagnostics::MetricKey::Mse) < 0.01);
    }

    #[test]
    fn split_rows_must_align() {
        let inputs = ndarray::Array2::<f64>::zeros((3, 2));
        let targets = ndarray::Array1::<f64>::zeros(2);
        assert!(matches!(
            DataSplit::new(inputs.view(), targets.view()),
            Err(InferenceError::Shape(_))
        ));
    }
}
