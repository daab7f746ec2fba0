use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::LogLevel;

use crate::telemetry::ExperimentTelemetry;

/// One row of an exported table, columns in insertion order.
pub type TableRow = IndexMap<String, f64>;

/// Sink for experiment results.
pub trait Reporter: Send + Sync {
    /// Records one aggregate scalar.
    fn log_scalar(&self, name: &str, value: f64) -> Result<()>;

    /// Writes the per-seed table, replacing any sheet of the same name.
    fn export_table(&self, sheet_name: &str, rows: &[TableRow]) -> Result<()>;
}

/// Whether a run is tracked live (sweeps) or only locally.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Part of a hyper-parameter sweep.
    Online,
    /// Standalone run.
    Offline,
}

impl RunMode {
    /// `online` when sweeping.
    #[must_use]
    pub const fn for_sweep(sweep: bool) -> Self {
        if sweep {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Reporter forwarding scalars to telemetry and tables to a workbook.
pub struct RunTracker {
    telemetry: ExperimentTelemetry,
    mode: RunMode,
    workbook: Option<Workbook>,
    scalars: Mutex<IndexMap<String, f64>>,
}

impl fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunTracker")
            .field("run_id", &self.telemetry.run_id())
            .field("mode", &self.mode)
            .field("workbook", &self.workbook.as_ref().map(Workbook::path))
            .finish_non_exhaustive()
    }
}

impl RunTracker {
    /// Tracker without a workbook.
    #[must_use]
    pub fn new(telemetry: ExperimentTelemetry, mode: RunMode) -> Self {
        Self {
            telemetry,
            mode,
            workbook: None,
            scalars: Mutex::new(IndexMap::new()),
        }
    }

    /// Attaches the workbook receiving exported tables.
    #[must_use]
    pub fn with_workbook(mut self, workbook: Workbook) -> Self {
        self.workbook = Some(workbook);
        self
    }

    /// Tracking mode.
    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    /// Scalars logged so far, in logging order.
    #[must_use]
    pub fn scalars(&self) -> IndexMap<String, f64> {
        self.scalars.lock().clone()
    }
}

impl Reporter for RunTracker {
    fn log_scalar(&self, name: &str, value: f64) -> Result<()> {
        self.scalars.lock().insert(name.to_string(), value);
        let payload = json!({ "name": name, "value": value, "mode": self.mode.to_string() });
        self.telemetry
            .log(LogLevel::Info, "experiment.metric", payload.clone())?;
        self.telemetry.event("experiment.metric", payload)
    }

    fn export_table(&self, sheet_name: &str, rows: &[TableRow]) -> Result<()> {
        match &self.workbook {
            Some(workbook) => workbook.write_sheet(sheet_name, rows),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkbookFile {
    sheets: IndexMap<String, Vec<TableRow>>,
}

/// JSON workbook of named sheets, shared across experiments.
#[derive(Debug, Clone)]
pub struct Workbook {
    path: PathBuf,
}

impl Workbook {
    /// File name inside the results directory.
    pub const FILE_NAME: &'static str = "results.json";

    /// Workbook at `<results_dir>/results.json`.
    #[must_use]
    pub fn in_dir(results_dir: impl AsRef<Path>) -> Self {
        Self::at(results_dir.as_ref().join(Self::FILE_NAME))
    }

    /// Workbook at an explicit path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Workbook location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces (or appends) a sheet, keeping the others.
    pub fn write_sheet(&self, name: &str, rows: &[TableRow]) -> Result<()> {
        let mut file = self.read()?;
        file.sheets.insert(name.to_string(), rows.to_vec());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating results dir {}", parent.display()))?;
        }
        let staging = self.path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(&file).context("encoding workbook")?;
        fs::write(&staging, encoded)
            .with_context(|| format!("writing workbook {}", staging.display()))?;
        fs::rename(&staging, &self.path)
            .with_context(|| format!("replacing workbook {}", self.path.display()))?;
        Ok(())
    }

    /// Rows of a sheet, if present.
    pub fn read_sheet(&self, name: &str) -> Result<Option<Vec<TableRow>>> {
        Ok(self.read()?.sheets.shift_remove(name))
    }

    /// Sheet names in creation order.
    pub fn sheet_names(&self) -> Result<Vec<String>> {
        Ok(self.read()?.sheets.into_keys().collect())
    }

    fn read(&self) -> Result<WorkbookFile> {
        if !self.path.exists() {
            return Ok(WorkbookFile::default());
        }
        let raw = fs::read(&self.path)
            .with_context(|| format!("reading workbook {}", self.path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("parsing workbook {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_event_bus::MemoryEventBus;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn row(seed: f64, mse: f64) -> TableRow {
        [("seed".to_string(), seed), ("MSE".to_string(), mse)]
            .into_iter()
            .collect()
    }

    #[test]
    fn sheets_are_replaced_not_duplicated() {
        let dir = tempdir().unwrap();
        let workbook = Workbook::in_dir(dir.path().join("results"));
        workbook.write_sheet("sheet_acea_svi", &[row(0.0, 1.0)]).unwrap();
        workbook.write_sheet("sheet_spain_svi", &[row(0.0, 3.0)]).unwrap();
        workbook
            .write_sheet("sheet_acea_svi", &[row(0.0, 2.0), row(1.0, 2.5)])
            .unwrap();
        assert_eq!(workbook.sheet_names().unwrap(), ["sheet_acea_svi", "sheet_spain_svi"]);
        let rows = workbook.read_sheet("sheet_acea_svi").unwrap().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["MSE"], 2.5);
        assert!(workbook.read_sheet("missing").unwrap().is_none());
    }

    #[test]
    fn tracker_forwards_scalars_and_tables() {
        let dir = tempdir().unwrap();
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = ExperimentTelemetry::builder("reporter")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        let tracker = RunTracker::new(telemetry, RunMode::for_sweep(false))
            .with_workbook(Workbook::in_dir(dir.path()));
        tracker.log_scalar("m_mse", 0.5).unwrap();
        tracker.export_table("sheet_acea_bayes", &[row(0.0, 0.5)]).unwrap();
        assert_eq!(tracker.scalars()["m_mse"], 0.5);
        let events = bus.of_type("experiment.metric");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["mode"], "offline");
        assert!(dir.path().join(Workbook::FILE_NAME).is_file());
    }
}
