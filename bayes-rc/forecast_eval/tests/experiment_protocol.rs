use std::{
    fmt::Write as _,
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use forecast_eval::{
    aggregate,
    model::{
        guide::{Guide, GuideKind},
        GuidePolicy, ModelFamily,
    },
    run_trials, BundleError, ComputeContext, ConfigError,
    Diagnostics, EmbeddingBundle, EmbeddingCache, Experiment, ExperimentConfig,
    ExperimentError, ExperimentTelemetry, InferenceError, InferenceMethod, InferenceOutcome,
    InferenceRegistry, InferenceRequest, MetricKey, PerMetricSeries, Predictive, QuantileLevels,
    ReservoirConfig, ReservoirEmbedder, RunMode, RunTracker, SplitKind, TrialEnv,
    Workbook,
};
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use shared_event_bus::MemoryEventBus;
use tempfile::tempdir;

/// Predicts zero with a degenerate spread.
struct ZeroPredictive;

impl Predictive for ZeroPredictive {
    fn mean(&self, inputs: ArrayView2<'_, f64>) -> Result<Array1<f64>, InferenceError> {
        Ok(Array1::zeros(inputs.nrows()))
    }

    fn quantiles(
        &self,
        inputs: ArrayView2<'_, f64>,
        levels: &[f64],
    ) -> Result<Array2<f64>, InferenceError> {
        Ok(Array2::zeros((inputs.nrows(), levels.len())))
    }
}

type Emit = fn(&mut InferenceRequest<'_>) -> Diagnostics;

/// Backend returning whatever `emit` produces, counting its runs.
struct StubBackend {
    emit: Emit,
    runs: Arc<AtomicUsize>,
    store_sizes: Arc<parking_lot::Mutex<Vec<usize>>>,
}

impl StubBackend {
    fn new(emit: Emit) -> Self {
        Self {
            emit,
            runs: Arc::new(AtomicUsize::new(0)),
            store_sizes: Arc::default(),
        }
    }
}

impl InferenceMethod for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Bayesian
    }

    fn run(&self, mut request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.store_sizes.lock().push(request.store.len());
        let diagnostics = (self.emit)(&mut request);
        Ok(InferenceOutcome {
            predictive: Box::new(ZeroPredictive),
            diagnostics,
        })
    }
}

fn fixed_pair(_: &mut InferenceRequest<'_>) -> Diagnostics {
    Diagnostics::from_pairs([("train_time", 1.0), ("cal_error", 0.1)]).unwrap()
}

fn random_metrics(request: &mut InferenceRequest<'_>) -> Diagnostics {
    Diagnostics::new()
        .with(MetricKey::CalError, request.rng.gen())
        .with(MetricKey::Mse, request.rng.gen_range(0.0..5.0))
}

fn synthetic_bundle(dim: usize) -> EmbeddingBundle {
    let rows = |n: usize, offset: usize| {
        Array2::from_shape_fn((n, dim), |(i, j)| (((i + offset) * (j + 2)) as f64 * 0.17).sin())
    };
    let (train, val, test) = (rows(80, 0), rows(20, 80), rows(20, 100));
    let target = |x: &Array2<f64>| {
        Array1::from_shape_fn(x.nrows(), |i| 0.5 * x[[i, 0]] + 0.1 + 0.05 * (i as f64 * 1.7).sin())
    };
    EmbeddingBundle::new(target(&train), train.clone(), target(&val), val, target(&test), test)
        .unwrap()
}

fn stub_config(seeds: usize) -> ExperimentConfig {
    ExperimentConfig {
        model_widths: vec![3, 1],
        inference: "stub".into(),
        seed: seeds,
        plot: false,
        ..ExperimentConfig::default()
    }
}

fn registry_with(stub: StubBackend) -> (InferenceRegistry, Arc<AtomicUsize>) {
    let runs = Arc::clone(&stub.runs);
    let mut registry = InferenceRegistry::with_builtin();
    registry.register(Arc::new(stub));
    (registry, runs)
}

fn series_for(config: ExperimentConfig, registry: &InferenceRegistry, bundle: &EmbeddingBundle) -> PerMetricSeries {
    let config = config.resolve(registry).unwrap();
    let method = registry.resolve(&config).unwrap();
    let ctx = ComputeContext::cpu(1);
    let telemetry = ExperimentTelemetry::disabled();
    let env = TrialEnv {
        ctx: &ctx,
        telemetry: &telemetry,
        artifacts: None,
    };
    run_trials(&config, bundle, &QuantileLevels::reference(), method.as_ref(), env).unwrap()
}

#[test]
fn every_series_has_one_entry_per_seed_for_any_backend() {
    let bundle = synthetic_bundle(3);
    let (registry, _) = registry_with(StubBackend::new(fixed_pair));
    for seeds in 1..=4 {
        let series = series_for(stub_config(seeds), &registry, &bundle);
        for key in MetricKey::ALL {
            assert_eq!(series.get(key).len(), seeds, "{key} with stub");
        }
    }
    for inference in ["bayes", "q_regr"] {
        let config = ExperimentConfig {
            inference: inference.into(),
            num_iterations: 30,
            ..stub_config(2)
        };
        let series = series_for(config, &registry, &bundle);
        for key in MetricKey::ALL {
            assert_eq!(series.get(key).len(), 2, "{key} with {inference}");
        }
    }
}

#[test]
fn keys_a_backend_never_produces_are_exact_zeros() {
    let bundle = synthetic_bundle(3);
    let (registry, _) = registry_with(StubBackend::new(fixed_pair));
    let series = series_for(stub_config(3), &registry, &bundle);
    assert_eq!(series.get(MetricKey::ECrps), [0.0, 0.0, 0.0]);
    assert_eq!(series.get(MetricKey::FinalLoss), [0.0, 0.0, 0.0]);

    let config = ExperimentConfig {
        inference: "q_regr".into(),
        num_iterations: 30,
        ..stub_config(2)
    };
    let series = series_for(config, &registry, &bundle);
    assert_eq!(series.get(MetricKey::ECrps), [0.0, 0.0]);
}

#[test]
fn aggregating_identical_values_gives_zero_spread() {
    for n in 1..=6 {
        let mut series = PerMetricSeries::new();
        let record = Diagnostics::new().with(MetricKey::Width, 2.5).complete().unwrap();
        for seed in 0..n {
            series.push(seed, &record);
        }
        let summary = aggregate(&series).get(MetricKey::Width);
        assert_eq!(summary.mean, 2.5);
        assert_eq!(summary.std, 0.0);
    }
}

#[test]
fn aggregate_uses_population_standard_deviation() {
    let mut series = PerMetricSeries::new();
    for (seed, mse) in [(0, 2.0), (1, 4.0)] {
        let record = Diagnostics::new().with(MetricKey::Mse, mse).complete().unwrap();
        series.push(seed, &record);
    }
    let summary = aggregate(&series).get(MetricKey::Mse);
    assert_eq!(summary.mean, 3.0);
    assert_eq!(summary.std, 1.0);
}

#[test]
fn reruns_with_the_same_seeds_are_identical() {
    let bundle = synthetic_bundle(3);
    let stub = StubBackend::new(random_metrics);
    let sizes = Arc::clone(&stub.store_sizes);
    let (registry, _) = registry_with(stub);
    let first = series_for(stub_config(4), &registry, &bundle);
    let second = series_for(stub_config(4), &registry, &bundle);
    assert_eq!(first, second);
    // Distinct seeds draw distinct values.
    let cal = first.get(MetricKey::CalError);
    assert_ne!(cal[0], cal[1]);
    // Every trial starts from a freshly built store of the same size.
    let sizes = sizes.lock();
    assert_eq!(sizes.len(), 8);
    assert!(sizes.iter().all(|size| *size == sizes[0]));
}

#[test]
fn unknown_inference_fails_before_any_trial() {
    let (registry, runs) = registry_with(StubBackend::new(fixed_pair));
    let config = ExperimentConfig {
        inference: "nuts".into(),
        ..stub_config(3)
    };
    let err = Experiment::new(
        config,
        &registry,
        ComputeContext::cpu(1),
        ExperimentTelemetry::disabled(),
    )
    .unwrap_err();
    match err {
        ExperimentError::Config(ConfigError::UnknownInference { name, known }) => {
            assert_eq!(name, "nuts");
            assert!(known.contains("stub"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let config = ExperimentConfig {
        dataset: "weather".into(),
        ..stub_config(1)
    };
    let err = Experiment::new(config, &registry, ComputeContext::cpu(1), ExperimentTelemetry::disabled())
        .unwrap_err();
    assert_eq!(err.to_string(), "weather dataset not defined");
}

#[test]
fn bundle_rejects_train_row_mismatch() {
    let err = EmbeddingBundle::new(
        Array1::zeros(9),
        Array2::zeros((10, 3)),
        Array1::zeros(2),
        Array2::zeros((2, 3)),
        Array1::zeros(2),
        Array2::zeros((2, 3)),
    )
    .unwrap_err();
    assert_eq!(
        err,
        BundleError::RowMismatch {
            split: SplitKind::Train,
            embeddings: 10,
            targets: 9,
        }
    );
}

#[test]
fn stub_backend_end_to_end_summary() {
    let dir = tempdir().unwrap();
    let bus = Arc::new(MemoryEventBus::new(256));
    let telemetry = ExperimentTelemetry::builder("experiment")
        .log_path(dir.path().join("logs/run.jsonl"))
        .event_publisher(bus.clone())
        .build()
        .unwrap();
    let (registry, runs) = registry_with(StubBackend::new(fixed_pair));
    let experiment = Experiment::new(stub_config(3), &registry, ComputeContext::cpu(1), telemetry.clone()).unwrap();
    let workbook = Workbook::in_dir(dir.path().join("results"));
    let tracker = RunTracker::new(telemetry, RunMode::for_sweep(false)).with_workbook(workbook.clone());

    let report = experiment
        .run_with_bundle(&synthetic_bundle(3), &tracker)
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    let scalars = tracker.scalars();
    assert_eq!(scalars["m_train_time"], 1.0);
    assert_eq!(scalars["s_train_time"], 0.0);
    assert!((scalars["m_cal_error"] - 0.1).abs() < 1e-12);
    assert!(scalars["s_cal_error"].abs() < 1e-12);
    for key in MetricKey::ALL {
        if matches!(key, MetricKey::TrainTime | MetricKey::CalError) {
            continue;
        }
        let summary = report.summary.get(key);
        assert_eq!((summary.mean, summary.std), (0.0, 0.0), "{key}");
        assert_eq!(scalars[format!("m_{}", key.summary_stem()).as_str()], 0.0);
        assert_eq!(scalars[format!("s_{}", key.summary_stem()).as_str()], 0.0);
    }
    assert_eq!(scalars.len(), 2 * MetricKey::ALL.len());

    let rows = workbook.read_sheet("sheet_acea_stub").unwrap().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[1]["seed"], 1.0);
    assert_eq!(rows[2]["train_times"], 1.0);
    assert_eq!(bus.of_type("experiment.trial.completed").len(), 3);
    assert_eq!(bus.of_type("experiment.metric").len(), 2 * MetricKey::ALL.len());
}

#[test]
fn backend_failures_surface_unmodified() {
    struct Failing;
    impl InferenceMethod for Failing {
        fn name(&self) -> &str {
            "stub"
        }
        fn family(&self) -> ModelFamily {
            ModelFamily::Bayesian
        }
        fn run(&self, _: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
            Err(InferenceError::Backend {
                method: "stub".into(),
                message: "diverged".into(),
            })
        }
    }
    let mut registry = InferenceRegistry::with_builtin();
    registry.register(Arc::new(Failing));
    let experiment = Experiment::new(stub_config(3), &registry, ComputeContext::cpu(1), ExperimentTelemetry::disabled()).unwrap();
    let tracker = RunTracker::new(ExperimentTelemetry::disabled(), RunMode::Offline);
    let err = experiment
        .run_with_bundle(&synthetic_bundle(3), &tracker)
        .unwrap_err();
    assert_eq!(err.to_string(), "stub failed: diverged");
    assert!(tracker.scalars().is_empty());
}

#[test]
fn raw_series_to_summary_through_the_cache() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    fs::create_dir_all(&data).unwrap();
    let mut csv = String::from("id,date,name,geo,unit,value\n");
    for day in 0..180 {
        let value = 650.0 + 40.0 * f64::from(day % 7) + (f64::from(day) * 0.2).cos() * 15.0;
        writeln!(csv, "{day},d{day},Demanda real,ES,MWh,{value}").unwrap();
    }
    fs::write(data.join(forecast_eval::dataset::SPAIN_FILE), csv).unwrap();

    let reservoir = ReservoirConfig {
        n_internal_units: 16,
        ..ReservoirConfig::default()
    };
    let cache = EmbeddingCache::new(dir.path().join("cache"), ReservoirEmbedder::new(reservoir, &data).unwrap());
    let config = ExperimentConfig {
        dataset: "spain".into(),
        model_widths: vec![16, 1],
        inference: "bayes".into(),
        seed: 2,
        plot: true,
        ..ExperimentConfig::default()
    };
    let experiment = Experiment::new(config, &InferenceRegistry::with_builtin(), ComputeContext::cpu(1), ExperimentTelemetry::disabled())
        .unwrap()
        .with_artifacts(dir.path().join("plots"));
    let tracker = RunTracker::new(ExperimentTelemetry::disabled(), RunMode::Offline)
        .with_workbook(Workbook::in_dir(dir.path().join("results")));
    let report = experiment.run(&cache, &tracker).unwrap();

    assert_eq!(report.series.trials(), 2);
    assert!(report.summary.get(MetricKey::Mse).mean > 0.0);
    assert!(cache.path_for("spain", false).is_file());
    assert!(dir.path().join("plots/spain_bayes_seed0.json").is_file());
    assert!(dir.path().join("results/results.json").is_file());
    let bundle = cache.load_or_compute("spain", false).unwrap();
    assert_eq!(bundle.embedding_dim(), 16);
    assert_eq!(bundle.rows(SplitKind::Train), 110);
}

/// Delegates to the built-in `svi` backend and records what each trial saw.
struct ObservedSvi {
    inner: Arc<dyn InferenceMethod>,
    guides: Arc<parking_lot::Mutex<Vec<Option<GuideKind>>>>,
    raw: Arc<parking_lot::Mutex<Vec<Diagnostics>>>,
}

impl InferenceMethod for ObservedSvi {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn family(&self) -> ModelFamily {
        self.inner.family()
    }

    fn guide_policy(&self) -> GuidePolicy {
        self.inner.guide_policy()
    }

    fn run(&self, request: InferenceRequest<'_>) -> Result<InferenceOutcome, InferenceError> {
        self.guides.lock().push(request.guide.map(Guide::kind));
        let outcome = self.inner.run(request)?;
        self.raw.lock().push(outcome.diagnostics.clone());
        Ok(outcome)
    }
}

fn svi_config(dim_reduction: bool) -> ExperimentConfig {
    ExperimentConfig {
        model_widths: vec![3, 1],
        inference: "svi".into(),
        dim_reduction,
        seed: 3,
        num_iterations: 80,
        lr: 0.05,
        plot: false,
        ..ExperimentConfig::default()
    }
}

fn run_observed_svi(dim_reduction: bool) -> (PerMetricSeries, Vec<Option<GuideKind>>, Vec<Diagnostics>) {
    let mut registry = InferenceRegistry::with_builtin();
    let observed = ObservedSvi {
        inner: registry.get("svi").unwrap(),
        guides: Arc::default(),
        raw: Arc::default(),
    };
    let (guides, raw) = (Arc::clone(&observed.guides), Arc::clone(&observed.raw));
    registry.register(Arc::new(observed));
    let series = series_for(svi_config(dim_reduction), &registry, &synthetic_bundle(3));
    let guides = guides.lock().clone();
    let raw = raw.lock().clone();
    (series, guides, raw)
}

fn assert_svi_protocol(dim_reduction: bool, expected_guide: GuideKind) {
    let (series, guides, raw) = run_observed_svi(dim_reduction);
    assert_eq!(series.seeds(), [0, 1, 2]);
    for key in MetricKey::ALL {
        assert_eq!(series.get(key).len(), 3, "{key}");
        assert!(series.get(key).iter().all(|v| v.is_finite()), "{key}");
    }
    assert_eq!(guides, vec![Some(expected_guide); 3]);
    for diagnostics in &raw {
        for key in [MetricKey::FinalLoss, MetricKey::InferenceTime, MetricKey::ECrps] {
            assert!(diagnostics.get(key).is_some_and(f64::is_finite), "{key} missing");
        }
    }

    let (again, _, _) = run_observed_svi(dim_reduction);
    for key in MetricKey::ALL {
        if matches!(key, MetricKey::TrainTime | MetricKey::InferenceTime) {
            continue;
        }
        assert_eq!(series.get(key), again.get(key), "{key} differs between reruns");
    }
}

#[test]
fn svi_with_reduced_embeddings_uses_full_rank_guide() {
    assert_svi_protocol(true, GuideKind::FullRank);
}

#[test]
fn svi_with_raw_embeddings_uses_low_rank_guide() {
    // Three embedding columns plus the bias feature: rank round(sqrt(4)).
    assert_svi_protocol(false, GuideKind::LowRank { rank: 2 });
}
