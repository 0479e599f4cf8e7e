//! Contracts of the collaborators that turn estimated moments into a
//! probability density.

use std::fmt;
use std::sync::Arc;

use ndarray::Array2;

use crate::error::Result;
use crate::moments::Moments;
use crate::orthogonal::OrthogonalInfo;

/// A reconstructed distribution, queried pointwise.
pub trait Distribution: fmt::Debug + Send + Sync {
    fn density(&self, x: f64) -> f64;

    fn cdf(&self, x: f64) -> f64;
}

/// Fits a density to moment estimates.
pub trait DensityReconstructor {
    /// `moments_data` has one row per basis function holding the estimated
    /// mean and the variance of that estimate.
    fn reconstruct(
        &self,
        moments: Arc<dyn Moments>,
        moments_data: &Array2<f64>,
        domain: (f64, f64),
        tol: f64,
        reg_param: f64,
    ) -> Result<Box<dyn Distribution>>;
}

/// Replaces a moment basis by one orthonormal with respect to an estimated
/// second-moment matrix.
pub trait MomentOrthogonalizer {
    fn orthogonalize(
        &self,
        moments: Arc<dyn Moments>,
        covariance: &Array2<f64>,
        tol: f64,
    ) -> Result<(Arc<dyn Moments>, OrthogonalInfo)>;
}

#[derive(Debug, Clone)]
pub struct DensityConfig {
    /// Tolerance handed to the reconstructor.
    pub tol: f64,
    pub reg_param: f64,
    /// Smallest pivot kept by the orthogonalization.
    pub orthogonal_tol: f64,
    /// Use the two-pass covariance formula.
    pub stable: bool,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            tol: 1.95,
            reg_param: 0.01,
            orthogonal_tol: 1e-4,
            stable: true,
        }
    }
}
