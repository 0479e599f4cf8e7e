//! Read-only access to the samples collected on one MLMC level.

use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand::{Rng, RngCore};

use crate::error::{EstimateError, Result};
use crate::moments::Moments;
use crate::utility::quantile;

/// The per-level contract the estimators consume.
///
/// On level 0 the "difference" is the fine value itself; on every other level
/// it is `φ(fine) - φ(coarse)`.
pub trait Level {
    fn step(&self) -> f64;

    fn n_samples(&self) -> usize;

    /// Expected cost of one fine/coarse pair.
    fn n_ops_estimate(&self) -> f64;

    fn estimate_diff_mean(&self, moments: &dyn Moments) -> Result<Array1<f64>>;

    /// Sample variance (ddof = 1) of the moment differences and the number of
    /// samples it was computed from.
    fn estimate_diff_var(&self, moments: &dyn Moments) -> Result<(Array1<f64>, usize)>;

    /// Variances of the coarse and of the fine moments, `(var_coarse, var_fine)`.
    fn estimate_level_var(&self, moments: &dyn Moments) -> Result<(Array1<f64>, Array1<f64>)>;

    /// This level's contribution to the estimate of `E[φ φᵀ]`.
    fn estimate_covariance(&self, moments: &dyn Moments, stable: bool) -> Result<Array2<f64>>;

    /// Variance of the per-sample terms on the covariance diagonal.
    fn estimate_cov_diag_err(&self, moments: &dyn Moments) -> Result<Array1<f64>>;

    /// Range of the fine values, trimmed to the `(q, 1 - q)` quantiles when a
    /// quantile is given.
    fn sample_domain(&self, quantile: Option<f64>) -> Result<(f64, f64)>;
}

/// Moment evaluations of every stored sample for one moments object.
#[derive(Debug, Clone)]
struct MomentsCache {
    moments: Arc<dyn Moments>,
    domain: (f64, f64),
    fine: Array2<f64>,
    coarse: Array2<f64>,
}

impl MomentsCache {
    fn matches(&self, moments: &dyn Moments) -> bool {
        let cached = Arc::as_ptr(&self.moments) as *const ();
        let asked = moments as *const dyn Moments as *const ();
        cached == asked
            && self.domain == moments.domain()
            && self.fine.ncols() == moments.size()
    }
}

/// In-memory level: stored fine/coarse values, an optional bootstrap
/// resample and an optional cache of moment evaluations.
#[derive(Debug, Clone)]
pub struct SampleLevel {
    index: usize,
    step: f64,
    n_ops: f64,
    fine: Vec<f64>,
    coarse: Vec<f64>,
    subsample: Option<Vec<usize>>,
    cache: Option<MomentsCache>,
}

impl SampleLevel {
    pub fn new(index: usize, step: f64, n_ops: f64) -> Result<Self> {
        if !(step > 0.0 && step.is_finite()) {
            return Err(EstimateError::InvalidParameter(format!(
                "level {} step must be positive, got {}",
                index, step
            )));
        }
        if !(n_ops > 0.0 && n_ops.is_finite()) {
            return Err(EstimateError::InvalidParameter(format!(
                "level {} cost must be positive, got {}",
                index, n_ops
            )));
        }
        Ok(Self {
            index,
            step,
            n_ops,
            fine: Vec::new(),
            coarse: Vec::new(),
            subsample: None,
            cache: None,
        })
    }

    /// Level with already collected fine/coarse pairs. Coarse values given
    /// for level 0 are ignored.
    pub fn with_samples(
        index: usize,
        step: f64,
        n_ops: f64,
        fine: Vec<f64>,
        coarse: Vec<f64>,
    ) -> Result<Self> {
        let mut level = Self::new(index, step, n_ops)?;
        level.append(&fine, &coarse)?;
        Ok(level)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    /// Number of stored samples, ignoring any active resample.
    pub fn n_collected(&self) -> usize {
        self.fine.len()
    }

    pub fn is_subsampled(&self) -> bool {
        self.subsample.is_some()
    }

    pub fn append(&mut self, fine: &[f64], coarse: &[f64]) -> Result<()> {
        if fine.len() != coarse.len() {
            return Err(EstimateError::ShapeMismatch {
                what: "coarse samples",
                expected: fine.len(),
                found: coarse.len(),
            });
        }
        self.fine.extend_from_slice(fine);
        if self.is_first() {
            self.coarse.resize(self.fine.len(), 0.0);
        } else {
            self.coarse.extend_from_slice(coarse);
        }
        self.cache = None;
        Ok(())
    }

    /// Fine values visible through the current view.
    pub fn fine_values(&self) -> Vec<f64> {
        match &self.subsample {
            Some(idx) => idx.iter().map(|&i| self.fine[i]).collect(),
            None => self.fine.clone(),
        }
    }

    /// Raw differences `fine - coarse` visible through the current view.
    pub fn diff_values(&self) -> Vec<f64> {
        let diff = |i: usize| self.fine[i] - self.coarse[i];
        match &self.subsample {
            Some(idx) => idx.iter().map(|&i| diff(i)).collect(),
            None => (0..self.fine.len()).map(diff).collect(),
        }
    }

    /// Replaces the view with `size` draws, with replacement, from the stored
    /// samples.
    pub fn subsample(&mut self, size: usize, rng: &mut dyn RngCore) -> Result<()> {
        let n = self.fine.len();
        if n == 0 && size > 0 {
            return Err(EstimateError::NoSamples { level: self.index });
        }
        let idx = (0..size).map(|_| rng.gen_range(0..n)).collect();
        self.subsample = Some(idx);
        Ok(())
    }

    pub fn clean_subsample(&mut self) {
        self.subsample = None;
    }

    /// Evaluates `moments` on every stored sample and keeps the result for
    /// later calls with the same moments object.
    pub fn update_moments(&mut self, moments: &Arc<dyn Moments>) {
        let fine = moments.eval_all(&self.fine);
        let coarse = self.coarse_table(moments.as_ref(), &self.coarse);
        self.cache = Some(MomentsCache {
            moments: Arc::clone(moments),
            domain: moments.domain(),
            fine,
            coarse,
        });
    }

    fn coarse_table(&self, moments: &dyn Moments, values: &[f64]) -> Array2<f64> {
        if self.is_first() {
            Array2::zeros((values.len(), moments.size()))
        } else {
            moments.eval_all(values)
        }
    }

    /// Fine and coarse moment tables of the current view.
    fn moment_tables(&self, moments: &dyn Moments) -> (Array2<f64>, Array2<f64>) {
        if let Some(cache) = self.cache.as_ref().filter(|c| c.matches(moments)) {
            return match &self.subsample {
                Some(idx) => (
                    cache.fine.select(Axis(0), idx),
                    cache.coarse.select(Axis(0), idx),
                ),
                None => (cache.fine.clone(), cache.coarse.clone()),
            };
        }

        match &self.subsample {
            Some(idx) => {
                let fine: Vec<f64> = idx.iter().map(|&i| self.fine[i]).collect();
                let coarse: Vec<f64> = idx.iter().map(|&i| self.coarse[i]).collect();
                (moments.eval_all(&fine), self.coarse_table(moments, &coarse))
            }
            None => (
                moments.eval_all(&self.fine),
                self.coarse_table(moments, &self.coarse),
            ),
        }
    }

    fn diff_table(&self, moments: &dyn Moments) -> Array2<f64> {
        let (fine, coarse) = self.moment_tables(moments);
        fine - coarse
    }

    fn require(&self, n: usize, required: usize) -> Result<()> {
        if n == 0 {
            return Err(EstimateError::NoSamples { level: self.index });
        }
        if n < required {
            return Err(EstimateError::InsufficientSamples {
                level: self.index,
                n_samples: n,
                required,
            });
        }
        Ok(())
    }
}

impl Level for SampleLevel {
    fn step(&self) -> f64 {
        self.step
    }

    fn n_samples(&self) -> usize {
        self.subsample.as_ref().map_or(self.fine.len(), Vec::len)
    }

    fn n_ops_estimate(&self) -> f64 {
        self.n_ops
    }

    fn estimate_diff_mean(&self, moments: &dyn Moments) -> Result<Array1<f64>> {
        self.require(self.n_samples(), 1)?;
        let diff = self.diff_table(moments);
        diff.mean_axis(Axis(0))
            .ok_or(EstimateError::NoSamples { level: self.index })
    }

    fn estimate_diff_var(&self, moments: &dyn Moments) -> Result<(Array1<f64>, usize)> {
        let n = self.n_samples();
        self.require(n, 2)?;
        let diff = self.diff_table(moments);
        Ok((diff.var_axis(Axis(0), 1.0), n))
    }

    fn estimate_level_var(&self, moments: &dyn Moments) -> Result<(Array1<f64>, Array1<f64>)> {
        self.require(self.n_samples(), 2)?;
        let (fine, coarse) = self.moment_tables(moments);
        Ok((coarse.var_axis(Axis(0), 1.0), fine.var_axis(Axis(0), 1.0)))
    }

    fn estimate_covariance(&self, moments: &dyn Moments, stable: bool) -> Result<Array2<f64>> {
        let n = self.n_samples();
        self.require(n, 1)?;
        let (fine, coarse) = self.moment_tables(moments);
        let nf = n as f64;

        let second_moment = |table: &Array2<f64>| -> Array2<f64> {
            if stable {
                let mean = table.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(table.ncols()));
                let centered = table - &mean;
                let outer = mean
                    .view()
                    .insert_axis(Axis(1))
                    .dot(&mean.view().insert_axis(Axis(0)));
                centered.t().dot(&centered) / nf + outer
            } else {
                table.t().dot(table) / nf
            }
        };

        let mut cov = second_moment(&fine);
        if !self.is_first() {
            cov -= &second_moment(&coarse);
        }
        Ok(cov)
    }

    fn estimate_cov_diag_err(&self, moments: &dyn Moments) -> Result<Array1<f64>> {
        self.require(self.n_samples(), 2)?;
        let (fine, coarse) = self.moment_tables(moments);
        let terms = fine.mapv(|x| x * x) - coarse.mapv(|x| x * x);
        Ok(terms.var_axis(Axis(0), 1.0))
    }

    fn sample_domain(&self, quantile_level: Option<f64>) -> Result<(f64, f64)> {
        let values = self.fine_values();
        self.require(values.len(), 1)?;
        match quantile_level {
            None => {
                let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                Ok((lo, hi))
            }
            Some(q) if q > 0.0 && q < 0.5 => Ok((quantile(&values, q)?, quantile(&values, 1.0 - q)?)),
            Some(q) => Err(EstimateError::InvalidParameter(format!(
                "domain quantile {} outside (0, 0.5)",
                q
            ))),
        }
    }
}
