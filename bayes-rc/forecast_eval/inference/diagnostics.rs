use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed vocabulary of per-trial diagnostics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MetricKey {
    /// Fit wall-clock seconds.
    TrainTime,
    /// Test prediction wall-clock seconds.
    InferenceTime,
    /// Mean absolute quantile calibration gap.
    CalError,
    /// Calibration gap after validation recalibration.
    NewCalError,
    /// Mean 95 % interval width.
    Width,
    /// Interval width after conformal widening.
    NewWidth,
    /// Mean squared error of the predictive mean.
    Mse,
    /// Mean squared error after bias correction.
    NewMse,
    /// Empirical 95 % interval coverage.
    Coverage,
    /// Coverage after conformal widening.
    NewCoverage,
    /// Sample-based CRPS.
    ECrps,
    /// Parametric (or quantile-approximated) CRPS.
    Crps,
    /// CRPS after validation recalibration.
    NewCrps,
    /// Final training objective.
    FinalLoss,
}

impl MetricKey {
    /// Every key, in reporting order.
    pub const ALL: [Self; 14] = [
        Self::TrainTime,
        Self::InferenceTime,
        Self::CalError,
        Self::NewCalError,
        Self::Width,
        Self::NewWidth,
        Self::Mse,
        Self::NewMse,
        Self::Coverage,
        Self::NewCoverage,
        Self::ECrps,
        Self::Crps,
        Self::NewCrps,
        Self::FinalLoss,
    ];

    /// Diagnostics key as emitted by backends.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::TrainTime => "train_time",
            Self::InferenceTime => "inference_time",
            Self::CalError => "cal_error",
            Self::NewCalError => "new_cal_error",
            Self::Width => "width",
            Self::NewWidth => "new_width",
            Self::Mse => "mse",
            Self::NewMse => "new_mse",
            Self::Coverage => "coverage",
            Self::NewCoverage => "new_coverage",
            Self::ECrps => "e_crps",
            Self::Crps => "crps",
            Self::NewCrps => "new_crps",
            Self::FinalLoss => "final_loss",
        }
    }

    /// Stem of the `m_`/`s_` tracker scalars.
    #[must_use]
    pub const fn summary_stem(self) -> &'static str {
        match self {
            Self::Coverage => "cov",
            Self::NewCoverage => "new_cov",
            other => other.name(),
        }
    }

    /// Column header in the exported per-seed table.
    #[must_use]
    pub const fn column(self) -> &'static str {
        match self {
            Self::TrainTime => "train_times",
            Self::InferenceTime => "inf_times",
            Self::CalError => "cal_errors",
            Self::NewCalError => "new_cal_errors",
            Self::Width => "width",
            Self::NewWidth => "new_width",
            Self::Mse => "MSE",
            Self::NewMse => "new_MSE",
            Self::Coverage => "coverage",
            Self::NewCoverage => "new_coverage",
            Self::ECrps => "e_CRPS",
            Self::Crps => "CRPS",
            Self::NewCrps => "new_CRPS",
            Self::FinalLoss => "final_loss",
        }
    }

    /// Parses a diagnostics key.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name() == name)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors raised while assembling diagnostics.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DiagnosticsError {
    /// Key outside the fixed vocabulary.
    #[error("unknown diagnostics key `{0}`")]
    UnknownKey(String),
    /// NaN or infinite metric.
    #[error("diagnostic `{key}` is not finite ({value})")]
    NonFinite {
        /// Offending key.
        key: MetricKey,
        /// Offending value.
        value: f64,
    },
}

/// Backend output: any subset of the vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    values: [Option<f64>; 14],
}

impl Diagnostics {
    /// Empty diagnostics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds diagnostics from `(key, value)` pairs keyed by name.
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Result<Self, DiagnosticsError> {
        let mut diagnostics = Self::new();
        for (name, value) in pairs {
            let key = MetricKey::from_name(name)
                .ok_or_else(|| DiagnosticsError::UnknownKey(name.to_string()))?;
            diagnostics.set(key, value);
        }
        Ok(diagnostics)
    }

    /// Records a value.
    pub fn set(&mut self, key: MetricKey, value: f64) {
        self.values[key.index()] = Some(value);
    }

    /// Builder-style [`Self::set`].
    #[must_use]
    pub fn with(mut self, key: MetricKey, value: f64) -> Self {
        self.set(key, value);
        self
    }

    /// Value if the backend produced it.
    #[must_use]
    pub const fn get(&self, key: MetricKey) -> Option<f64> {
        self.values[key.index()]
    }

    /// Fills absent keys with zero and rejects non-finite values.
    ///
    /// A defaulted zero is indistinguishable from a measured zero in the
    /// returned record; only the backend identity tells them apart.
    pub fn complete(&self) -> Result<DiagnosticsRecord, DiagnosticsError> {
        let mut values = [0.0; 14];
        for key in MetricKey::ALL {
            if let Some(value) = self.get(key) {
                if !value.is_finite() {
                    return Err(DiagnosticsError::NonFinite { key, value });
                }
                values[key.index()] = value;
            }
        }
        Ok(DiagnosticsRecord { values })
    }
}

/// Complete per-trial record: every key present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticsRecord {
    values: [f64; 14],
}

impl DiagnosticsRecord {
    /// Value of a key.
    #[must_use]
    pub const fn get(&self, key: MetricKey) -> f64 {
        self.values[key.index()]
    }

    /// `(key, value)` pairs in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (MetricKey, f64)> + '_ {
        MetricKey::ALL.into_iter().map(|key| (key, self.get(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_consistent() {
        for (position, key) in MetricKey::ALL.into_iter().enumerate() {
            assert_eq!(key.index(), position);
            assert_eq!(MetricKey::from_name(key.name()), Some(key));
        }
        assert_eq!(MetricKey::Coverage.summary_stem(), "cov");
        assert_eq!(MetricKey::Mse.column(), "MSE");
    }

    #[test]
    fn missing_keys_default_to_zero() {
        let diagnostics = Diagnostics::from_pairs([("train_time", 1.0), ("cal_error", 0.1)]).unwrap();
        let record = diagnostics.complete().unwrap();
        assert_eq!(record.get(MetricKey::TrainTime), 1.0);
        assert_eq!(record.get(MetricKey::CalError), 0.1);
        assert_eq!(record.get(MetricKey::FinalLoss), 0.0);
        assert_eq!(record.get(MetricKey::ECrps), 0.0);
        assert_eq!(record.iter().count(), 14);
    }

    #[test]
    fn unknown_and_non_finite_values_are_rejected() {
        assert_eq!(
            Diagnostics::from_pairs([("loss", 1.0)]).unwrap_err(),
            DiagnosticsError::UnknownKey("loss".into())
        );
        let err = Diagnostics::new()
            .with(MetricKey::Mse, f64::NAN)
            .complete()
            .unwrap_err();
        assert!(matches!(err, DiagnosticsError::NonFinite { key: MetricKey::Mse, .. }));
    }
}
