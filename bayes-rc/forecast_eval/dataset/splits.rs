use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};

use super::{Dataset, DatasetError};

/// Default share of rows held out for testing.
pub const TEST_PERCENT: f64 = 0.15;
/// Default share of rows held out for validation.
pub const VAL_PERCENT: f64 = 0.15;

/// Mean/scale standardizer fit on training data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: f64,
    scale: f64,
}

impl StandardScaler {
    /// Fits on `values`; a zero spread falls back to unit scale.
    #[must_use]
    pub fn fit(values: &[f64]) -> Self {
        let n = values.len().max(1) as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let scale = if var > 0.0 { var.sqrt() } else { 1.0 };
        Self { mean, scale }
    }

    /// `(v − mean) / scale`.
    #[must_use]
    pub fn transform(&self, v: f64) -> f64 {
        (v - self.mean) / self.scale
    }
}

/// Scaled inputs (`value, 1`) and one-step-ahead targets for one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSplit {
    /// `rows × 2`: scaled de-seasonalized input and a constant column.
    pub inputs: Array2<f64>,
    /// Scaled de-seasonalized target `horizon` steps ahead.
    pub targets: Array1<f64>,
}

/// Output of [`generate_splits`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Splits {
    /// Training split.
    pub train: SeriesSplit,
    /// Validation split.
    pub validation: SeriesSplit,
    /// Test split.
    pub test: SeriesSplit,
}

/// Seasonal differencing at lag `L`, contiguous train/validation/test split,
/// standardization fit on train, constant input column.
pub fn generate_splits(
    dataset: &Dataset,
    test_percent: f64,
    val_percent: f64,
) -> Result<Splits, DatasetError> {
    let (season, horizon) = (dataset.seasonality, dataset.horizon);
    if horizon > season {
        return Err(DatasetError::Horizon {
            horizon,
            seasonality: season,
        });
    }
    let data = &dataset.series;
    if data.len() <= season + horizon {
        return Err(DatasetError::TooShort {
            len: data.len(),
            reason: format!("needs more than {} values for lag {season}", season + horizon),
        });
    }
    let differenced: Vec<f64> = (season..data.len()).map(|t| data[t] - data[t - season]).collect();

    let x = &differenced[..differenced.len() - horizon];
    let y = &differenced[horizon..];

    let n = x.len();
    let n_test = (test_percent * n as f64).ceil() as usize;
    let n_val = (val_percent * n as f64).ceil() as usize;
    if n_test + n_val >= n {
        return Err(DatasetError::TooShort {
            len: data.len(),
            reason: format!("{n} rows cannot hold {n_test} test and {n_val} validation rows"),
        });
    }
    let n_train = n - n_test - n_val;

    let x_scaler = StandardScaler::fit(&x[..n_train]);
    let y_scaler = StandardScaler::fit(&y[..n_train]);
    let split = |range: std::ops::Range<usize>| SeriesSplit {
        inputs: with_constant(&x[range.clone()], x_scaler),
        targets: y[range].iter().map(|v| y_scaler.transform(*v)).collect(),
    };

    Ok(Splits {
        train: split(0..n_train),
        validation: split(n_train..n_train + n_val),
        test: split(n_train + n_val..n),
    })
}

fn with_constant(values: &[f64], scaler: StandardScaler) -> Array2<f64> {
    let mut inputs = Array2::<f64>::ones((values.len(), 2));
    inputs
        .slice_mut(s![.., 0])
        .assign(&values.iter().map(|v| scaler.transform(*v)).collect::<Array1<f64>>());
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(series: Vec<f64>, seasonality: usize, horizon: usize) -> Dataset {
        Dataset {
            name: "synthetic".into(),
            series,
            seasonality,
            horizon,
        }
    }

    #[test]
    fn split_sizes_use_ceiling_shares() {
        // 107 values, lag 7, horizon 1: 99 rows -> 15 test, 15 validation, 69 train.
        let series: Vec<f64> = (0..107).map(|t| (t as f64 * 0.3).sin() * 10.0 + t as f64).collect();
        let splits = generate_splits(&dataset(series, 7, 1), TEST_PERCENT, VAL_PERCENT).unwrap();
        assert_eq!(splits.train.targets.len(), 69);
        assert_eq!(splits.validation.targets.len(), 15);
        assert_eq!(splits.test.targets.len(), 15);
        assert!(splits.train.inputs.column(1).iter().all(|v| *v == 1.0));
        let mean = splits.train.inputs.column(0).mean().unwrap();
        assert!(mean.abs() < 1e-9);
        let target_mean = splits.train.targets.mean().unwrap();
        assert!(target_mean.abs() < 1e-9);
    }

    #[test]
    fn targets_lead_inputs_by_the_horizon() {
        let series: Vec<f64> = (0..60).map(|t| f64::from(t * t)).collect();
        let splits = generate_splits(&dataset(series, 4, 2), 0.2, 0.2).unwrap();
        // Differenced series d_t = s_t − s_{t−4} = 8t − 16 (t ≥ 4); target row i is d_{6+i}.
        // 54 rows: 11 test, 11 validation, 32 train.
        assert_eq!(splits.train.targets.len(), 32);
        let raw_train: Vec<f64> = (0..32).map(|i| f64::from(8 * (6 + i) - 16)).collect();
        let scaler = StandardScaler::fit(&raw_train);
        assert!((splits.train.targets[0] - scaler.transform(32.0)).abs() < 1e-9);
        assert!((splits.test.targets[10] - scaler.transform(f64::from(8 * 59 - 16))).abs() < 1e-9);
    }

    #[test]
    fn horizon_longer_than_season_is_rejected() {
        let err = generate_splits(&dataset(vec![0.0; 100], 2, 3), 0.15, 0.15).unwrap_err();
        assert!(matches!(err, DatasetError::Horizon { horizon: 3, seasonality: 2 }));
    }

    #[test]
    fn constant_series_scales_to_zero() {
        let scaler = StandardScaler::fit(&[5.0, 5.0, 5.0]);
        assert_eq!(scaler.transform(5.0), 0.0);
        assert_eq!(scaler.transform(7.0), 2.0);
    }
}
