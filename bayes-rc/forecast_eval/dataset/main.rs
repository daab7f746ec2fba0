//! Dataset catalog: raw series loaders and the de-seasonalized splits fed to
//! the reservoir.

/// Seasonal differencing, splitting and scaling.
pub mod splits;

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Datasets the loaders know about.
pub const KNOWN_DATASETS: [&str; 2] = ["acea", "spain"];

/// File holding the ACEA series, one value per line at 10-minute resolution.
pub const ACEA_FILE: &str = "TS_Acea.txt";
/// File holding the Spanish energy market export.
pub const SPAIN_FILE: &str = "spain_energy_market.csv";

const ACEA_SUBSAMPLE: usize = 6;
const ACEA_ANOMALY_START: usize = 16_000;
const ACEA_ANOMALY_LEN: usize = 168 * 11;
const SPAIN_KIND_COLUMN: usize = 2;
const SPAIN_VALUE_COLUMN: usize = 5;
const SPAIN_DEMAND: &str = "Demanda real";

/// Errors raised while reading raw series.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// Name outside [`KNOWN_DATASETS`].
    #[error(transparent)]
    Unknown(#[from] ConfigError),
    /// Raw file unreadable.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Malformed value.
    #[error("{path}:{line}: cannot parse `{value}` as a number")]
    Parse {
        /// File path.
        path: PathBuf,
        /// 1-based line.
        line: usize,
        /// Offending text.
        value: String,
    },
    /// Series too short for the requested transform.
    #[error("series of length {len} is too short: {reason}")]
    TooShort {
        /// Series length.
        len: usize,
        /// What needed more data.
        reason: String,
    },
    /// Horizon longer than the seasonal period.
    #[error("forecast horizon {horizon} exceeds seasonality {seasonality}")]
    Horizon {
        /// Forecast horizon.
        horizon: usize,
        /// Seasonal period.
        seasonality: usize,
    },
}

/// Raw univariate series with its seasonal period and forecast horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Dataset name.
    pub name: String,
    /// Observations in time order.
    pub series: Vec<f64>,
    /// Seasonal period `L`.
    pub seasonality: usize,
    /// Forecast horizon `F`.
    pub horizon: usize,
}

/// Loads a named dataset from `data_dir`.
pub fn load_dataset(name: &str, data_dir: &Path) -> Result<Dataset, DatasetError> {
    match name {
        "acea" => load_acea(&data_dir.join(ACEA_FILE)),
        "spain" => load_spain(&data_dir.join(SPAIN_FILE)),
        other => Err(ConfigError::UnknownDataset(other.to_string()).into()),
    }
}

/// Hourly ACEA series with the 11-week anomaly removed; weekly season, daily horizon.
pub fn load_acea(path: &Path) -> Result<Dataset, DatasetError> {
    let raw = read(path)?;
    let mut values = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        values.push(parse_number(path, index + 1, text)?);
    }
    let hourly: Vec<f64> = values.into_iter().step_by(ACEA_SUBSAMPLE).collect();
    let series = drop_window(hourly, ACEA_ANOMALY_START, ACEA_ANOMALY_LEN);
    Ok(Dataset {
        name: "acea".into(),
        series,
        seasonality: 24 * 7,
        horizon: 24,
    })
}

/// Daily Spanish electricity demand; weekly season, one-day horizon.
pub fn load_spain(path: &Path) -> Result<Dataset, DatasetError> {
    let raw = read(path)?;
    let mut series = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim().trim_matches('"')).collect();
        if fields.get(SPAIN_KIND_COLUMN) != Some(&SPAIN_DEMAND) {
            continue;
        }
        let value = fields.get(SPAIN_VALUE_COLUMN).copied().unwrap_or_default();
        series.push(parse_number(path, index + 1, value)?);
    }
    Ok(Dataset {
        name: "spain".into(),
        series,
        seasonality: 7,
        horizon: 1,
    })
}

fn read(path: &Path) -> Result<String, DatasetError> {
    fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_number(path: &Path, line: usize, text: &str) -> Result<f64, DatasetError> {
    text.parse().map_err(|_| DatasetError::Parse {
        path: path.to_path_buf(),
        line,
        value: text.to_string(),
    })
}

/// Removes `[start, start + len)`; windows past the end are clipped.
fn drop_window(mut values: Vec<f64>, start: usize, len: usize) -> Vec<f64> {
    if start < values.len() {
        let end = (start + len).min(values.len());
        values.drain(start..end);
    }
    values
}
