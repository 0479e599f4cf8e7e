//! Smoothing of per-level variance estimates by a regression in the log of
//! the step size:
//!
//! ```text
//! log var_{l,r} = A_r + B_r log h_l + C_r log² h_l,   l = 1 .. L-1
//! ```
//!
//! Level 0 has no coarse counterpart and moment 0 has zero variance, so both
//! are passed through untouched.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};
use statrs::distribution::{ChiSquared, Continuous};
use tracing::debug;

use crate::error::{EstimateError, Result};
use crate::utility::simpson;

/// Quadrature resolution for the log chi-squared moments.
const QUADRATURE_INTERVALS: usize = 20_000;
/// Singular values below this are treated as zero in the least squares solve.
const SVD_EPS: f64 = 1e-12;
const MOMENT_ZERO_TOL: f64 = 1e-10;

/// Which parameters are shared between moments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegressionModel {
    /// Independent `A, B, C` for every moment.
    #[default]
    PerMoment,
    /// Per-moment intercepts `A_r` with common `B, C`.
    Joint,
}

#[derive(Debug, Clone, Default)]
pub struct RegressionConfig {
    pub model: RegressionModel,
    /// Weight level rows by `1 / sqrt(Var[log s²])` from the chi-squared law
    /// of the sample variance.
    pub weighted: bool,
}

/// Variance of `log(X / df)` for `X ~ χ²(df)`, `df = n - 1`.
///
/// The first two raw moments of the log density are integrated over
/// `±100 sqrt(2 / df)`, which covers the whole mass for every `df ≥ 1`.
pub fn log_chi_squared_variance(level: usize, n_samples: usize) -> Result<f64> {
    if n_samples < 2 {
        return Err(EstimateError::InsufficientSamples {
            level,
            n_samples,
            required: 2,
        });
    }
    let df = (n_samples - 1) as f64;
    let chi2 = ChiSquared::new(df).map_err(|e| EstimateError::Quadrature(e.to_string()))?;

    let log_density = |y: f64| {
        let x = df * y.exp();
        if !(x.is_finite() && x > 0.0) {
            return 0.0;
        }
        (df.ln() + y + chi2.ln_pdf(x)).exp()
    };

    let half_width = 100.0 * (2.0 / df).sqrt();
    let mean = simpson(|y| y * log_density(y), -half_width, half_width, QUADRATURE_INTERVALS);
    let second = simpson(|y| y * y * log_density(y), -half_width, half_width, QUADRATURE_INTERVALS);
    let var = second - mean * mean;
    if !(var.is_finite() && var > 0.0) {
        return Err(EstimateError::Quadrature(format!(
            "non-positive variance {} of log chi-squared with {} degrees of freedom",
            var, df
        )));
    }
    Ok(var)
}

/// Variances of the log sample variance per level, reused while the sample
/// counts stay the same.
#[derive(Debug, Clone, Default)]
pub struct LogChiSquaredCache {
    cached: Option<(Vec<usize>, Array1<f64>)>,
    computations: usize,
}

impl LogChiSquaredCache {
    pub fn variances(&mut self, n_samples: &[usize]) -> Result<Array1<f64>> {
        if let Some((ns, values)) = &self.cached {
            if ns.as_slice() == n_samples {
                return Ok(values.clone());
            }
        }
        let values = n_samples
            .iter()
            .enumerate()
            .map(|(l, &n)| log_chi_squared_variance(l, n))
            .collect::<Result<Array1<f64>>>()?;
        self.computations += 1;
        self.cached = Some((n_samples.to_vec(), values.clone()));
        Ok(values)
    }

    /// How many times the variances were actually integrated.
    pub fn computations(&self) -> usize {
        self.computations
    }

    pub fn clear(&mut self) {
        self.cached = None;
    }
}

/// The regression component: configuration plus its own cache.
#[derive(Debug, Clone, Default)]
pub struct VarianceRegression {
    config: RegressionConfig,
    cache: LogChiSquaredCache,
}

impl VarianceRegression {
    pub fn new(config: RegressionConfig) -> Self {
        Self {
            config,
            cache: LogChiSquaredCache::default(),
        }
    }

    pub fn config(&self) -> &RegressionConfig {
        &self.config
    }

    pub fn cache(&self) -> &LogChiSquaredCache {
        &self.cache
    }

    /// Regressed copy of `raw_vars` (`L × R`). With fewer than three levels
    /// the input is returned unchanged.
    pub fn regress(&mut self, raw_vars: &Array2<f64>, sim_steps: &[f64], n_samples: &[usize]) -> Result<Array2<f64>> {
        let (n_levels, n_moments) = raw_vars.dim();
        if sim_steps.len() != n_levels {
            return Err(EstimateError::ShapeMismatch {
                what: "simulation steps",
                expected: n_levels,
                found: sim_steps.len(),
            });
        }
        if n_samples.len() != n_levels {
            return Err(EstimateError::ShapeMismatch {
                what: "sample counts",
                expected: n_levels,
                found: n_samples.len(),
            });
        }
        if n_moments == 0 {
            return Ok(raw_vars.clone());
        }
        if let Some((l, v)) = raw_vars
            .column(0)
            .iter()
            .enumerate()
            .find(|(_, v)| v.abs() > MOMENT_ZERO_TOL)
        {
            return Err(EstimateError::MomentInvariant {
                what: "variance of moment 0",
                level: Some(l),
                value: *v,
            });
        }
        if n_levels < 3 || n_moments < 2 {
            return Ok(raw_vars.clone());
        }

        let weights = if self.config.weighted {
            self.cache.variances(n_samples)?.mapv(|v| 1.0 / v.sqrt())
        } else {
            Array1::ones(n_levels)
        };

        let log_steps: Vec<f64> = sim_steps.iter().map(|h| h.ln()).collect();
        let log_vars = raw_vars.mapv(|v| v.max(f64::MIN_POSITIVE).ln());

        let fitted = match self.config.model {
            RegressionModel::PerMoment => per_moment_fit(&log_vars, &log_steps, &weights)?,
            RegressionModel::Joint => joint_fit(&log_vars, &log_steps, &weights)?,
        };

        let mut new_vars = raw_vars.clone();
        for l in 1..n_levels {
            for r in 1..n_moments {
                new_vars[[l, r]] = fitted[[l - 1, r - 1]].exp();
            }
        }
        debug!(model = ?self.config.model, weighted = self.config.weighted, "regressed level variances");
        Ok(new_vars)
    }
}

fn lstsq(x: DMatrix<f64>, y: DVector<f64>) -> Result<DVector<f64>> {
    x.svd(true, true)
        .solve(&y, SVD_EPS)
        .map_err(|e| EstimateError::Regression(e.to_string()))
}

/// Fitted log variances for levels `1..L` and moments `1..R`, one
/// independent quadratic per moment.
fn per_moment_fit(log_vars: &Array2<f64>, log_steps: &[f64], weights: &Array1<f64>) -> Result<Array2<f64>> {
    let (n_levels, n_moments) = log_vars.dim();
    let n_rows = n_levels - 1;
    let design = DMatrix::from_fn(n_rows, 3, |i, j| log_steps[i + 1].powi(j as i32));
    let weighted = DMatrix::from_fn(n_rows, 3, |i, j| weights[i + 1] * design[(i, j)]);

    let mut fitted = Array2::zeros((n_rows, n_moments - 1));
    for r in 1..n_moments {
        let rhs = DVector::from_fn(n_rows, |i, _| weights[i + 1] * log_vars[[i + 1, r]]);
        let params = lstsq(weighted.clone(), rhs)?;
        let values = &design * &params;
        for i in 0..n_rows {
            fitted[[i, r - 1]] = values[i];
        }
    }
    Ok(fitted)
}

/// Fitted log variances with shared step coefficients: unknowns are
/// `A_1 .. A_{R-1}, B, C`.
fn joint_fit(log_vars: &Array2<f64>, log_steps: &[f64], weights: &Array1<f64>) -> Result<Array2<f64>> {
    let (n_levels, n_moments) = log_vars.dim();
    let (n_rows, n_fit) = (n_levels - 1, n_moments - 1);
    let n_params = n_fit + 2;

    let mut design = DMatrix::zeros(n_rows * n_fit, n_params);
    let mut rhs = DVector::zeros(n_rows * n_fit);
    for i in 0..n_rows {
        let log_h = log_steps[i + 1];
        for r in 0..n_fit {
            let row = i * n_fit + r;
            design[(row, r)] = 1.0;
            design[(row, n_fit)] = log_h;
            design[(row, n_fit + 1)] = log_h * log_h;
            rhs[row] = weights[i + 1] * log_vars[[i + 1, r + 1]];
        }
    }
    let weighted = DMatrix::from_fn(design.nrows(), n_params, |row, j| weights[row / n_fit + 1] * design[(row, j)]);
    let params = lstsq(weighted, rhs)?;
    let values = &design * &params;

    let mut fitted = Array2::zeros((n_rows, n_fit));
    for i in 0..n_rows {
        for r in 0..n_fit {
            fitted[[i, r]] = values[i * n_fit + r];
        }
    }
    Ok(fitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn model_vars(steps: &[f64], intercepts: &[f64], b: f64, c: f64) -> Array2<f64> {
        let mut vars = Array2::zeros((steps.len(), intercepts.len() + 1));
        for (l, h) in steps.iter().enumerate() {
            let lh = h.ln();
            for (r, a) in intercepts.iter().enumerate() {
                vars[[l, r + 1]] = (a + b * lh + c * lh * lh).exp();
            }
        }
        vars
    }

    #[test]
    fn test_few_levels_pass_through() {
        let raw = Array2::from_shape_vec((2, 3), vec![0.0, 1.0, 2.0, 0.0, 0.3, 0.7]).unwrap();
        let mut regression = VarianceRegression::default();
        let out = regression.regress(&raw, &[1.0, 0.5], &[10, 10]).unwrap();
        assert_eq!(out, raw);
    }

    #[test]
    fn test_recovers_exact_model() {
        let steps = [1.0, 0.5, 0.25, 0.125, 0.0625];
        let mut raw = model_vars(&steps, &[0.1, -0.4], 1.8, 0.05);
        raw[[0, 1]] = 7.0;
        for model in [RegressionModel::PerMoment, RegressionModel::Joint] {
            let mut regression = VarianceRegression::new(RegressionConfig { model, weighted: false });
            let out = regression.regress(&raw, &steps, &[100; 5]).unwrap();
            assert_eq!(out[[0, 1]], 7.0);
            assert_eq!(out.column(0), raw.column(0));
            for l in 1..5 {
                for r in 1..3 {
                    assert_relative_eq!(out[[l, r]], raw[[l, r]], max_relative = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_three_levels_interpolate() {
        let raw = Array2::from_shape_vec((3, 2), vec![0.0, 1.1, 0.0, 0.26, 0.0, 0.061]).unwrap();
        let mut regression = VarianceRegression::default();
        let out = regression.regress(&raw, &[1.0, 0.5, 0.25], &[50; 3]).unwrap();
        assert_eq!(out.row(0), raw.row(0));
        assert_relative_eq!(out[[1, 1]], 0.26, max_relative = 1e-9);
        assert_relative_eq!(out[[2, 1]], 0.061, max_relative = 1e-9);
    }

    #[test]
    fn test_smooths_noise() {
        let steps = [1.0, 0.5, 0.25, 0.125, 0.0625, 0.03125];
        let mut raw = model_vars(&steps, &[0.0], 2.0, 0.0);
        raw[[2, 1]] *= 1.5;
        raw[[4, 1]] *= 0.7;
        let mut regression = VarianceRegression::default();
        let out = regression.regress(&raw, &steps, &[100; 6]).unwrap();
        let truth = model_vars(&steps, &[0.0], 2.0, 0.0);
        let err = |table: &Array2<f64>| -> f64 {
            (1..6).map(|l| (table[[l, 1]] / truth[[l, 1]]).ln().abs()).sum()
        };
        assert!(err(&out) < err(&raw));
    }

    #[test]
    fn test_weighted_fit_uses_cache() {
        let steps = [1.0, 0.5, 0.25, 0.125];
        let raw = model_vars(&steps, &[0.2, 0.5], 2.0, 0.1);
        let mut regression = VarianceRegression::new(RegressionConfig {
            model: RegressionModel::Joint,
            weighted: true,
        });
        let out = regression.regress(&raw, &steps, &[400, 100, 30, 10]).unwrap();
        assert_relative_eq!(out[[3, 2]], raw[[3, 2]], max_relative = 1e-8);
        regression.regress(&raw, &steps, &[400, 100, 30, 10]).unwrap();
        assert_eq!(regression.cache().computations(), 1);
        regression.regress(&raw, &steps, &[400, 100, 30, 12]).unwrap();
        assert_eq!(regression.cache().computations(), 2);
    }

    #[test]
    fn test_log_chi_squared_variance_matches_trigamma() {
        // Var[log(X/df)] = ψ'(df/2) for X ~ χ²(df)
        let trigamma = |x: f64| {
            1.0 / x + 1.0 / (2.0 * x * x) + 1.0 / (6.0 * x.powi(3)) - 1.0 / (30.0 * x.powi(5))
                + 1.0 / (42.0 * x.powi(7))
        };
        for n in [10usize, 100, 1000] {
            let df = (n - 1) as f64;
            let v = log_chi_squared_variance(0, n).unwrap();
            assert_relative_eq!(v, trigamma(df / 2.0), max_relative = 1e-4);
        }
        assert!(log_chi_squared_variance(3, 1).is_err());
    }

    #[test]
    fn test_nonzero_constant_moment_rejected() {
        let raw = Array2::from_shape_vec((3, 2), vec![0.0, 1.0, 0.1, 0.5, 0.0, 0.2]).unwrap();
        let mut regression = VarianceRegression::default();
        assert!(matches!(
            regression.regress(&raw, &[1.0, 0.5, 0.25], &[10; 3]),
            Err(EstimateError::MomentInvariant { level: Some(1), .. })
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let raw = Array2::zeros((3, 2));
        let mut regression = VarianceRegression::default();
        assert!(regression.regress(&raw, &[1.0, 0.5], &[10; 3]).is_err());
    }
}
