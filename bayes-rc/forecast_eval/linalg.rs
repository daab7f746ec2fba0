use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// Errors raised by the dense factorizations.
#[derive(Debug, Error, PartialEq)]
pub enum LinalgError {
    /// Matrix is not symmetric positive definite.
    #[error("matrix is not positive definite (pivot {pivot} = {value})")]
    NotPositiveDefinite {
        /// Row of the failing pivot.
        pivot: usize,
        /// Value under the square root.
        value: f64,
    },
    /// Operand shapes disagree.
    #[error("shape mismatch: expected {expected}, got {actual}")]
    Shape {
        /// Expected dimension.
        expected: usize,
        /// Provided dimension.
        actual: usize,
    },
}

/// Lower Cholesky factor `L` with `A = L Lᵀ`.
pub fn cholesky(a: ArrayView2<'_, f64>) -> Result<Array2<f64>, LinalgError> {
    let d = a.nrows();
    if a.ncols() != d {
        return Err(LinalgError::Shape {
            expected: d,
            actual: a.ncols(),
        });
    }
    let mut l = Array2::<f64>::zeros((d, d));
    for i in 0..d {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for p in 0..j {
                sum -= l[[i, p]] * l[[j, p]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return Err(LinalgError::NotPositiveDefinite {
                        pivot: i,
                        value: sum,
                    });
                }
                l[[i, j]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }
    Ok(l)
}

/// Cholesky with diagonal jitter escalation for nearly singular Gram matrices.
pub fn cholesky_jittered(a: ArrayView2<'_, f64>) -> Result<Array2<f64>, LinalgError> {
    match cholesky(a) {
        Ok(l) => Ok(l),
        Err(LinalgError::Shape { expected, actual }) => {
            Err(LinalgError::Shape { expected, actual })
        }
        Err(first) => {
            let scale = a.diag().iter().map(|v| v.abs()).fold(0.0, f64::max).max(1.0);
            let mut jitter = 1e-10 * scale;
            for _ in 0..6 {
                let mut shifted = a.to_owned();
                shifted.diag_mut().mapv_inplace(|v| v + jitter);
                if let Ok(l) = cholesky(shifted.view()) {
                    return Ok(l);
                }
                jitter *= 100.0;
            }
            Err(first)
        }
    }
}

/// Solves `L x = b` by forward substitution.
#[must_use]
pub fn solve_lower(l: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let d = l.nrows();
    let mut x = Array1::<f64>::zeros(d);
    for i in 0..d {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[[i, j]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solves `Lᵀ x = b` by back substitution.
#[must_use]
pub fn solve_lower_transposed(l: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let d = l.nrows();
    let mut x = Array1::<f64>::zeros(d);
    for i in (0..d).rev() {
        let mut sum = b[i];
        for j in (i + 1)..d {
            sum -= l[[j, i]] * x[j];
        }
        x[i] = sum / l[[i, i]];
    }
    x
}

/// Solves `A x = b` given the Cholesky factor of `A`.
#[must_use]
pub fn cholesky_solve(l: ArrayView2<'_, f64>, b: ArrayView1<'_, f64>) -> Array1<f64> {
    let y = solve_lower(l, b);
    solve_lower_transposed(l, y.view())
}

/// Inverse of `A` from its Cholesky factor.
#[must_use]
pub fn cholesky_inverse(l: ArrayView2<'_, f64>) -> Array2<f64> {
    let d = l.nrows();
    let mut inverse = Array2::<f64>::zeros((d, d));
    let mut unit = Array1::<f64>::zeros(d);
    for col in 0..d {
        unit.fill(0.0);
        unit[col] = 1.0;
        let x = cholesky_solve(l, unit.view());
        inverse.column_mut(col).assign(&x);
    }
    // Symmetrize round-off.
    let transposed = inverse.t().to_owned();
    (inverse + transposed) * 0.5
}

/// `ln |A|` from the Cholesky factor of `A`.
#[must_use]
pub fn log_det(l: ArrayView2<'_, f64>) -> f64 {
    2.0 * l.diag().iter().map(|v| v.ln()).sum::<f64>()
}

/// Gram matrix `Xᵀ X`.
#[must_use]
pub fn gram(x: ArrayView2<'_, f64>) -> Array2<f64> {
    x.t().dot(&x)
}
