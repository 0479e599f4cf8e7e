//! Orthogonalization of a moment basis by a truncated Cholesky factor of its
//! estimated second-moment matrix.

use std::sync::Arc;

use nalgebra::DMatrix;
use ndarray::{Array1, Array2};
use tracing::debug;

use crate::density::MomentOrthogonalizer;
use crate::error::{EstimateError, Result};
use crate::moments::Moments;

/// Diagnostics of an orthogonalization.
#[derive(Debug, Clone, PartialEq)]
pub struct OrthogonalInfo {
    pub original_size: usize,
    pub size: usize,
    /// Squared Cholesky pivots of the kept functions.
    pub pivots: Vec<f64>,
}

/// The basis `ψ = T φ` with `T` lower triangular.
#[derive(Debug, Clone)]
pub struct OrthogonalMoments {
    base: Arc<dyn Moments>,
    transform: Array2<f64>,
}

impl OrthogonalMoments {
    pub fn base(&self) -> &Arc<dyn Moments> {
        &self.base
    }

    /// `size × base.size()` matrix mapping base evaluations to the new basis.
    pub fn transform(&self) -> &Array2<f64> {
        &self.transform
    }
}

impl Moments for OrthogonalMoments {
    fn size(&self) -> usize {
        self.transform.nrows()
    }

    fn domain(&self) -> (f64, f64) {
        self.base.domain()
    }

    fn eval(&self, value: f64) -> Array1<f64> {
        self.transform.dot(&self.base.eval(value))
    }

    fn eval_all(&self, values: &[f64]) -> Array2<f64> {
        self.base.eval_all(values).dot(&self.transform.t())
    }
}

/// Cholesky orthogonalizer. Factorization stops at the first pivot not above
/// the tolerance, dropping that function and all later ones.
#[derive(Debug, Clone, Copy, Default)]
pub struct CholeskyOrthogonalizer;

/// Lower factor of the leading block of `gram` and its squared pivots.
fn truncated_cholesky(gram: &Array2<f64>, tol: f64) -> (DMatrix<f64>, Vec<f64>) {
    let n = gram.nrows();
    let mut lower = DMatrix::zeros(n, n);
    let mut pivots = Vec::with_capacity(n);

    for j in 0..n {
        let pivot = gram[[j, j]] - (0..j).map(|k| lower[(j, k)] * lower[(j, k)]).sum::<f64>();
        if !(pivot > tol) {
            break;
        }
        let diag = pivot.sqrt();
        lower[(j, j)] = diag;
        for i in j + 1..n {
            let dot: f64 = (0..j).map(|k| lower[(i, k)] * lower[(j, k)]).sum();
            lower[(i, j)] = (gram[[i, j]] - dot) / diag;
        }
        pivots.push(pivot);
    }

    let size = pivots.len();
    (lower.view((0, 0), (size, size)).into_owned(), pivots)
}

impl MomentOrthogonalizer for CholeskyOrthogonalizer {
    fn orthogonalize(
        &self,
        moments: Arc<dyn Moments>,
        covariance: &Array2<f64>,
        tol: f64,
    ) -> Result<(Arc<dyn Moments>, OrthogonalInfo)> {
        let size = moments.size();
        if covariance.dim() != (size, size) {
            return Err(EstimateError::ShapeMismatch {
                what: "moment covariance",
                expected: size,
                found: covariance.nrows(),
            });
        }
        let gram = (covariance + &covariance.t()) / 2.0;

        let (lower, pivots) = truncated_cholesky(&gram, tol);
        let kept = pivots.len();
        if kept == 0 {
            return Err(EstimateError::InvalidParameter(format!(
                "second moment of the constant function {} is not above {}",
                gram[[0, 0]],
                tol
            )));
        }
        let inverse = lower
            .solve_lower_triangular(&DMatrix::identity(kept, kept))
            .ok_or_else(|| EstimateError::InvalidState("singular Cholesky factor".to_string()))?;

        let mut transform = Array2::zeros((kept, size));
        for i in 0..kept {
            for j in 0..=i {
                transform[[i, j]] = inverse[(i, j)];
            }
        }
        debug!(original_size = size, size = kept, "orthogonalized moments");

        let info = OrthogonalInfo {
            original_size: size,
            size: kept,
            pivots,
        };
        let orthogonal: Arc<dyn Moments> = Arc::new(OrthogonalMoments {
            base: moments,
            transform,
        });
        Ok((orthogonal, info))
    }
}
