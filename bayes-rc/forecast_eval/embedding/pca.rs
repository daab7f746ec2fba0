use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{rngs::SmallRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

const SUBSPACE_ITERATIONS: usize = 200;
const SUBSPACE_SEED: u64 = 0x5eed;

/// Principal components fit on reservoir states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    mean: Array1<f64>,
    /// `features × components`, orthonormal columns ordered by variance.
    components: Array2<f64>,
}

impl Pca {
    /// Fits the leading `n_components` directions of `states`.
    ///
    /// Uses orthogonal iteration on the sample covariance from a fixed
    /// starting basis, so repeated fits on the same states agree exactly.
    #[must_use]
    pub fn fit(states: ArrayView2<'_, f64>, n_components: usize) -> Self {
        let features = states.ncols();
        let k = n_components.min(features).max(1);
        let mean = states
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(features));
        let centred = &states - &mean;
        let rows = states.nrows().max(1) as f64;
        let covariance = centred.t().dot(&centred) / rows;

        let mut rng = SmallRng::seed_from_u64(SUBSPACE_SEED);
        let mut basis = Array2::<f64>::from_shape_simple_fn((features, k), || {
            StandardNormal.sample(&mut rng)
        });
        orthonormalize(&mut basis);
        for _ in 0..SUBSPACE_ITERATIONS {
            basis = covariance.dot(&basis);
            orthonormalize(&mut basis);
        }

        // Rayleigh quotients order the columns by explained variance.
        let mut order: Vec<(usize, f64)> = basis
            .columns()
            .into_iter()
            .enumerate()
            .map(|(j, column)| (j, column.dot(&covariance.dot(&column))))
            .collect();
        order.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut components = Array2::<f64>::zeros((features, k));
        for (target, (source, _)) in order.iter().enumerate() {
            let mut column = basis.column(*source).to_owned();
            let pivot = column
                .iter()
                .copied()
                .fold(0.0_f64, |best, v| if v.abs() > best.abs() { v } else { best });
            if pivot < 0.0 {
                column.mapv_inplace(|v| -v);
            }
            components.column_mut(target).assign(&column);
        }
        Self { mean, components }
    }

    /// Projects rows onto the fitted components.
    #[must_use]
    pub fn transform(&self, states: ArrayView2<'_, f64>) -> Array2<f64> {
        (&states - &self.mean).dot(&self.components)
    }

    /// Number of retained components.
    #[must_use]
    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }
}

/// Modified Gram-Schmidt on the columns; degenerate columns are zeroed.
fn orthonormalize(basis: &mut Array2<f64>) {
    for j in 0..basis.ncols() {
        for i in 0..j {
            let previous = basis.column(i).to_owned();
            let projection = basis.column(j).dot(&previous);
            basis.column_mut(j).scaled_add(-projection, &previous);
        }
        let norm = basis.column(j).dot(&basis.column(j)).sqrt();
        if norm > 1e-12 {
            basis.column_mut(j).mapv_inplace(|v| v / norm);
        } else {
            basis.column_mut(j).fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_the_dominant_axis() {
        // Points spread along (1, 1, 0) with small noise on the third axis.
        let states = Array2::from_shape_fn((200, 3), |(i, j)| {
            let t = i as f64 / 20.0 - 5.0;
            match j {
                0 | 1 => t,
                _ => 0.01 * ((i % 7) as f64 - 3.0),
            }
        });
        let pca = Pca::fit(states.view(), 1);
        let axis = pca.components.column(0);
        let expected = 1.0 / 2.0_f64.sqrt();
        assert!((axis[0] - expected).abs() < 1e-3);
        assert!((axis[1] - expected).abs() < 1e-3);
        assert!(axis[2].abs() < 1e-3);
    }

    #[test]
    fn projections_are_centred_and_repeatable() {
        let states = Array2::from_shape_fn((50, 6), |(i, j)| ((i * (j + 1)) as f64 * 0.37).sin());
        let first = Pca::fit(states.view(), 3);
        let second = Pca::fit(states.view(), 3);
        assert_eq!(first, second);
        let projected = first.transform(states.view());
        assert_eq!(projected.dim(), (50, 3));
        for mean in projected.mean_axis(Axis(0)).unwrap() {
            assert!(mean.abs() < 1e-9);
        }
    }

    #[test]
    fn component_count_is_capped_by_width() {
        let states = Array2::from_shape_fn((10, 2), |(i, j)| (i + j) as f64);
        assert_eq!(Pca::fit(states.view(), 75).n_components(), 2);
    }
}
