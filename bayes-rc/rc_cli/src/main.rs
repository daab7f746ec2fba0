use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Utc};
use clap::{Parser, Subcommand};
use forecast_eval::{
    ComputeContext, EmbeddingCache, Experiment, ExperimentConfig, ExperimentTelemetry,
    InferenceRegistry, ReservoirConfig, ReservoirEmbedder, RunMode, RunTracker, Workbook,
};
use serde::Serialize;
use serde_json::json;
use shared_event_bus::FileEventPublisher;
use shared_logging::LogLevel;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "bayes-rc", version, about = "Reservoir forecasting experiment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs one experiment described by a TOML configuration.
    Run(RunArgs),
    /// Lists the registered inference methods.
    Methods,
    /// Prints a sheet of the results workbook.
    Show {
        /// Sheet name, e.g. `sheet_acea_svi`.
        #[arg(long)]
        sheet: String,
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Reservoir hyper-parameter file (JSON); defaults apply when omitted.
    #[arg(long)]
    reservoir: Option<PathBuf>,
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,
    #[arg(long, default_value = "cache")]
    cache_dir: PathBuf,
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    /// Directory for per-seed predictive bands; plotting is skipped without it.
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Thread budget; detected when omitted.
    #[arg(long)]
    threads: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunRecord {
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    dataset: String,
    inference: String,
    sheet: String,
    log_path: PathBuf,
    summary: serde_json::Value,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => handle_run(args),
        Commands::Methods => {
            for name in InferenceRegistry::with_builtin().names() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Show { sheet, results_dir } => {
            let workbook = Workbook::in_dir(&results_dir);
            match workbook.read_sheet(&sheet)? {
                Some(rows) => println!("{}", serde_json::to_string_pretty(&rows)?),
                None => println!("sheet {sheet} not found in {}", workbook.path().display()),
            }
            Ok(())
        }
    }
}

fn handle_run(args: RunArgs) -> Result<()> {
    anyhow::ensure!(args.config.exists(), "config file {} not found", args.config.display());
    let config = ExperimentConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let reservoir = match &args.reservoir {
        Some(path) => ReservoirConfig::load(path)
            .with_context(|| format!("loading reservoir parameters {}", path.display()))?,
        None => ReservoirConfig::default(),
    };
    let ctx = args.threads.map_or_else(ComputeContext::detect, ComputeContext::cpu);

    let run_id = format!("run-{}", Uuid::new_v4());
    let log_path = compute_log_path(&args.log_dir, &run_id)?;
    let mut builder = ExperimentTelemetry::builder("experiment")
        .run_id(run_id.clone())
        .log_path(&log_path);
    if let Some(path) = &args.event_log {
        builder = builder.event_publisher(Arc::new(FileEventPublisher::new(path)?));
    }
    let telemetry = builder.build().context("building telemetry")?;

    let mode = RunMode::for_sweep(config.sweep);
    let experiment = Experiment::new(
        config,
        &InferenceRegistry::with_builtin(),
        ctx,
        telemetry.clone(),
    )?;
    let experiment = match &args.artifacts_dir {
        Some(dir) => experiment.with_artifacts(dir),
        None => experiment,
    };
    let embedder = ReservoirEmbedder::new(reservoir, &args.data_dir)?;
    let cache = EmbeddingCache::new(&args.cache_dir, embedder);
    let tracker = RunTracker::new(telemetry.clone(), mode)
        .with_workbook(Workbook::in_dir(&args.results_dir));

    let report = match experiment.run(&cache, &tracker) {
        Ok(report) => report,
        Err(err) => {
            let _ = telemetry.log(
                LogLevel::Error,
                "experiment.failed",
                json!({ "error": err.to_string() }),
            );
            return Err(err.into());
        }
    };

    let resolved = experiment.config();
    let record = RunRecord {
        run_id,
        started_at: report.started_at,
        finished_at: report.finished_at,
        dataset: resolved.dataset.clone(),
        inference: resolved.inference.clone(),
        sheet: resolved.sheet_name(),
        log_path,
        summary: serde_json::to_value(&report.summary)?,
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    for (key, summary) in report.summary.iter() {
        println!("{:<16} {:>14.6} ± {:.6}", key.name(), summary.mean, summary.std);
    }
    Ok(())
}

fn compute_log_path(base: &Path, run_id: &str) -> Result<PathBuf> {
    let now = Local::now();
    let dir = base
        .join(format!("{:04}", now.year()))
        .join(format!("{:02}", now.month()))
        .join(format!("{:02}", now.day()));
    fs::create_dir_all(&dir).with_context(|| format!("creating log dir {}", dir.display()))?;
    Ok(dir.join(format!("{run_id}.log.jsonl")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_arguments_take_defaults() {
        let cli = Cli::try_parse_from(["bayes-rc", "run", "--config", "exp.toml"]).unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("exp.toml"));
                assert_eq!(args.results_dir, PathBuf::from("results"));
                assert!(args.event_log.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn log_path_is_dated() {
        let dir = tempfile::tempdir().unwrap();
        let path = compute_log_path(dir.path(), "run-1").unwrap();
        assert!(path.ends_with("run-1.log.jsonl"));
        assert!(path.parent().unwrap().is_dir());
    }
}
