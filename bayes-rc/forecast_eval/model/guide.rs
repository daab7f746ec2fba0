use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use super::params::{ParamStore, ParamStoreError};

/// Store key of the variational location.
pub const LOC: &str = "guide.loc";
/// Store key of the full-rank Cholesky factor.
pub const SCALE_TRIL: &str = "guide.scale_tril";
/// Store key of the low-rank diagonal scale.
pub const SCALE: &str = "guide.scale";
/// Store key of the low-rank covariance factor.
pub const COV_FACTOR: &str = "guide.cov_factor";

/// Initial posterior scale of every guide coordinate.
pub const INIT_SCALE: f64 = 0.1;

/// Covariance structure of the approximate posterior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GuideKind {
    /// Dense covariance `L Lᵀ`; used when embeddings were dimensionality-reduced.
    FullRank,
    /// `diag(s²) + W Wᵀ` with `W` of the given rank; used for raw reservoir states.
    LowRank {
        /// Columns of `W`.
        rank: usize,
    },
}

impl GuideKind {
    /// Picks the guide for a readout of `dim` coefficients.
    #[must_use]
    pub fn select(dim_reduction: bool, rank: Option<usize>, dim: usize) -> Self {
        if dim_reduction {
            Self::FullRank
        } else {
            let default_rank = (dim as f64).sqrt().round() as usize;
            Self::LowRank {
                rank: rank.unwrap_or(default_rank).clamp(1, dim.max(1)),
            }
        }
    }
}

/// Multivariate normal guide whose parameters live in the trial's [`ParamStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guide {
    kind: GuideKind,
    dim: usize,
}

impl Guide {
    /// Registers the guide parameters, initialized at `init_loc` with scale [`INIT_SCALE`].
    pub fn register<R: Rng + ?Sized>(
        kind: GuideKind,
        init_loc: ArrayView1<'_, f64>,
        store: &mut ParamStore,
        rng: &mut R,
    ) -> Result<Self, ParamStoreError> {
        let dim = init_loc.len();
        store.register(LOC, init_loc.to_owned())?;
        match kind {
            GuideKind::FullRank => {
                store.register(SCALE_TRIL, Array2::<f64>::eye(dim) * INIT_SCALE)?;
            }
            GuideKind::LowRank { rank } => {
                store.register(SCALE, Array1::<f64>::from_elem(dim, INIT_SCALE))?;
                let spread = INIT_SCALE / (rank as f64).sqrt();
                let factor = Array2::from_shape_simple_fn((dim, rank), || {
                    let z: f64 = StandardNormal.sample(rng);
                    z * spread
                });
                store.register(COV_FACTOR, factor)?;
            }
        }
        Ok(Self { kind, dim })
    }

    /// Covariance structure.
    #[must_use]
    pub const fn kind(&self) -> GuideKind {
        self.kind
    }

    /// Number of latent coefficients.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Current location.
    pub fn loc(&self, store: &ParamStore) -> Result<Array1<f64>, ParamStoreError> {
        store.vector(LOC).cloned()
    }

    /// Current covariance.
    pub fn covariance(&self, store: &ParamStore) -> Result<PosteriorCovariance, ParamStoreError> {
        Ok(match self.kind {
            GuideKind::FullRank => PosteriorCovariance::Full {
                scale_tril: store.matrix(SCALE_TRIL)?.clone(),
            },
            GuideKind::LowRank { .. } => PosteriorCovariance::LowRank {
                scale: store.vector(SCALE)?.clone(),
                factor: store.matrix(COV_FACTOR)?.clone(),
            },
        })
    }
}

/// Covariance of a Gaussian posterior over readout coefficients.
#[derive(Debug, Clone, PartialEq)]
pub enum PosteriorCovariance {
    /// `L Lᵀ` with lower-triangular `L`.
    Full {
        /// Lower Cholesky factor.
        scale_tril: Array2<f64>,
    },
    /// `diag(scale²) + factor factorᵀ`.
    LowRank {
        /// Diagonal standard deviations.
        scale: Array1<f64>,
        /// Low-rank factor.
        factor: Array2<f64>,
    },
}

impl PosteriorCovariance {
    /// `φᵀ Σ φ`.
    #[must_use]
    pub fn quad_form(&self, phi: ArrayView1<'_, f64>) -> f64 {
        match self {
            Self::Full { scale_tril } => {
                let projected = scale_tril.t().dot(&phi);
                projected.dot(&projected)
            }
            Self::LowRank { scale, factor } => {
                let diag = phi
                    .iter()
                    .zip(scale.iter())
                    .map(|(p, s)| (p * s).powi(2))
                    .sum::<f64>();
                let projected = factor.t().dot(&phi);
                diag + projected.dot(&projected)
            }
        }
    }

    /// Draws `mean + Σ^{1/2} z`.
    pub fn sample<R: Rng + ?Sized>(&self, mean: ArrayView1<'_, f64>, rng: &mut R) -> Array1<f64> {
        match self {
            Self::Full { scale_tril } => {
                let z = Array1::<f64>::from_shape_simple_fn(mean.len(), || StandardNormal.sample(rng));
                &mean + &scale_tril.dot(&z)
            }
            Self::LowRank { scale, factor } => {
                let z = Array1::<f64>::from_shape_simple_fn(mean.len(), || StandardNormal.sample(rng));
                let u = Array1::<f64>::from_shape_simple_fn(factor.ncols(), || StandardNormal.sample(rng));
                &mean + &(&z * scale) + &factor.dot(&u)
            }
        }
    }
}
