use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{inference::diagnostics::MetricKey, trials::PerMetricSeries};

/// Mean and population standard deviation of one metric across seeds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    /// Arithmetic mean.
    pub mean: f64,
    /// Population standard deviation (divides by `n`).
    pub std: f64,
}

impl MetricSummary {
    /// Summarizes a series; an empty series summarizes to zeros.
    #[must_use]
    pub fn of(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self { mean: 0.0, std: 0.0 };
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Per-metric summaries of a finished experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    trials: usize,
    metrics: IndexMap<MetricKey, MetricSummary>,
}

impl Summary {
    /// Summary of one key.
    #[must_use]
    pub fn get(&self, key: MetricKey) -> MetricSummary {
        self.metrics
            .get(&key)
            .copied()
            .unwrap_or(MetricSummary { mean: 0.0, std: 0.0 })
    }

    /// Number of trials summarized.
    #[must_use]
    pub const fn trials(&self) -> usize {
        self.trials
    }

    /// `(key, summary)` pairs in reporting order.
    pub fn iter(&self) -> impl Iterator<Item = (MetricKey, MetricSummary)> + '_ {
        self.metrics.iter().map(|(key, summary)| (*key, *summary))
    }

    /// Tracker scalars: `m_<stem>` then `s_<stem>` for every key.
    #[must_use]
    pub fn scalars(&self) -> Vec<(String, f64)> {
        self.iter()
            .flat_map(|(key, summary)| {
                let stem = key.summary_stem();
                [(format!("m_{stem}"), summary.mean), (format!("s_{stem}"), summary.std)]
            })
            .collect()
    }
}

/// Reduces every series to its mean and population standard deviation.
#[must_use]
pub fn aggregate(series: &PerMetricSeries) -> Summary {
    Summary {
        trials: series.trials(),
        metrics: series
            .iter()
            .map(|(key, values)| (key, MetricSummary::of(values)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::diagnostics::Diagnostics;

    #[test]
    fn population_std_of_two_values() {
        let summary = MetricSummary::of(&[2.0, 4.0]);
        assert_eq!(summary, MetricSummary { mean: 3.0, std: 1.0 });
    }

    #[test]
    fn identical_values_have_zero_spread() {
        for n in 1..=5 {
            let summary = MetricSummary::of(&vec![0.25; n]);
            assert_eq!(summary.mean, 0.25);
            assert_eq!(summary.std, 0.0);
        }
    }

    #[test]
    fn single_trial_std_is_zero_not_nan() {
        let summary = MetricSummary::of(&[7.5]);
        assert_eq!(summary.std, 0.0);
    }

    #[test]
    fn scalars_use_tracker_names() {
        let mut series = PerMetricSeries::new();
        let record = Diagnostics::new()
            .with(MetricKey::Coverage, 0.9)
            .complete()
            .unwrap();
        series.push(0, &record);
        let summary = aggregate(&series);
        let scalars = summary.scalars();
        assert_eq!(scalars.len(), 2 * MetricKey::ALL.len());
        assert_eq!(scalars[0].0, "m_train_time");
        assert!(scalars.contains(&("m_cov".to_string(), 0.9)));
        assert!(scalars.contains(&("s_new_cov".to_string(), 0.0)));
        assert_eq!(summary.trials(), 1);
    }
}
