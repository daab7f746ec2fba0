use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, DistributionKind};

/// Prior over a readout weight (or bias).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum WeightPrior {
    /// `N(mean, std²)`.
    Gaussian {
        /// Location.
        mean: f64,
        /// Scale.
        std: f64,
    },
    /// `U(low, high)`.
    Uniform {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
    },
}

impl WeightPrior {
    /// Builds the prior from a `(family, [a, b])` spec.
    pub fn from_spec(kind: DistributionKind, params: [f64; 2]) -> Result<Self, ConfigError> {
        let [a, b] = params;
        match kind {
            DistributionKind::Gauss if b > 0.0 && a.is_finite() && b.is_finite() => {
                Ok(Self::Gaussian { mean: a, std: b })
            }
            DistributionKind::Unif if a < b && a.is_finite() && b.is_finite() => {
                Ok(Self::Uniform { low: a, high: b })
            }
            _ => Err(ConfigError::Invalid(format!(
                "invalid {kind} prior parameters [{a}, {b}]"
            ))),
        }
    }

    /// Prior mean.
    #[must_use]
    pub fn mean(self) -> f64 {
        match self {
            Self::Gaussian { mean, .. } => mean,
            Self::Uniform { low, high } => 0.5 * (low + high),
        }
    }

    /// Prior variance; conjugate backends moment-match uniform priors with it.
    #[must_use]
    pub fn variance(self) -> f64 {
        match self {
            Self::Gaussian { std, .. } => std * std,
            Self::Uniform { low, high } => (high - low).powi(2) / 12.0,
        }
    }

    /// Draws one value.
    pub fn sample<R: Rng + ?Sized>(self, rng: &mut R) -> f64 {
        match self {
            Self::Gaussian { mean, std } => Normal::new(mean, std)
                .map_or(mean, |normal| normal.sample(rng)),
            Self::Uniform { low, high } => Uniform::new(low, high).sample(rng),
        }
    }
}

/// Uniform prior on the observation noise scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct NoisePrior {
    low: f64,
    high: f64,
}

/// Smallest noise scale any backend will use.
pub const MIN_NOISE_SCALE: f64 = 1e-4;

impl NoisePrior {
    /// Builds the prior from a `(family, [low, high])` spec; only `unif` is supported.
    pub fn from_spec(kind: DistributionKind, params: [f64; 2]) -> Result<Self, ConfigError> {
        let [low, high] = params;
        match kind {
            DistributionKind::Unif => {
                if low < 0.0 || low >= high || !high.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "noise prior bounds [{low}, {high}] must satisfy 0 <= low < high"
                    )));
                }
                Ok(Self { low, high })
            }
            DistributionKind::Gauss => Err(ConfigError::UnsupportedPrior { slot: "noise", kind }),
        }
    }

    /// Lower bound.
    #[must_use]
    pub const fn low(self) -> f64 {
        self.low
    }

    /// Upper bound.
    #[must_use]
    pub const fn high(self) -> f64 {
        self.high
    }

    /// Clamps a scale into the support.
    #[must_use]
    pub fn clamp(self, scale: f64) -> f64 {
        scale.clamp(self.low.max(MIN_NOISE_SCALE), self.high)
    }

    /// Starting scale for optimizers and samplers.
    #[must_use]
    pub fn initial(self) -> f64 {
        self.clamp(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::SmallRng, SeedableRng};

    #[test]
    fn uniform_weight_prior_moments() {
        let prior = WeightPrior::from_spec(DistributionKind::Unif, [-1.0, 1.0]).unwrap();
        assert_eq!(prior.mean(), 0.0);
        assert!((prior.variance() - 1.0 / 3.0).abs() < 1e-12);
        let mut rng = SmallRng::seed_from_u64(3);
        let draw = prior.sample(&mut rng);
        assert!((-1.0..1.0).contains(&draw));
    }

    #[test]
    fn noise_prior_clamps_into_support() {
        let prior = NoisePrior::from_spec(DistributionKind::Unif, [0.0, 10.0]).unwrap();
        assert_eq!(prior.clamp(50.0), 10.0);
        assert_eq!(prior.clamp(0.0), MIN_NOISE_SCALE);
        assert_eq!(prior.initial(), 1.0);
    }

    #[test]
    fn gaussian_noise_prior_is_unsupported() {
        let err = NoisePrior::from_spec(DistributionKind::Gauss, [0.0, 1.0]).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedPrior { slot: "noise", .. }));
    }
}
