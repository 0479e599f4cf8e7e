//! Combination of independent per-level contributions into MLMC estimates.

use ndarray::{Array1, Array2, Axis};
use tracing::debug;

use crate::error::{EstimateError, Result};
use crate::level::Level;
use crate::moments::{check_size, Moments};

const MOMENT_ZERO_TOL: f64 = 1e-10;

fn stack_rows(rows: Vec<Array1<f64>>, n_cols: usize) -> Result<Array2<f64>> {
    let mut out = Array2::zeros((rows.len(), n_cols));
    for (mut dst, row) in out.rows_mut().into_iter().zip(rows) {
        if row.len() != n_cols {
            return Err(EstimateError::ShapeMismatch {
                what: "moment vector",
                expected: n_cols,
                found: row.len(),
            });
        }
        dst.assign(&row);
    }
    Ok(out)
}

fn check_level_moment_zero(level: usize, var: &Array1<f64>) -> Result<()> {
    match var.first() {
        Some(v) if v.abs() > MOMENT_ZERO_TOL => Err(EstimateError::MomentInvariant {
            what: "level variance",
            level: Some(level),
            value: *v,
        }),
        Some(_) => Ok(()),
        None => check_size(0),
    }
}

/// MLMC estimate of the moment means and of the variance of that estimate:
/// `Σ_l mean_l` and `Σ_l var_l / n_l`.
pub fn estimate_moments<L: Level>(levels: &[L], moments: &dyn Moments) -> Result<(Array1<f64>, Array1<f64>)> {
    if levels.is_empty() {
        return Err(EstimateError::InvalidState(
            "cannot estimate moments without levels".to_string(),
        ));
    }
    let size = moments.size();
    check_size(size)?;
    let mut means = Array1::zeros(size);
    let mut vars = Array1::zeros(size);

    for (l, level) in levels.iter().enumerate() {
        let mean = level.estimate_diff_mean(moments)?;
        let (var, n) = level.estimate_diff_var(moments)?;
        check_level_moment_zero(l, &var)?;
        means += &mean;
        vars.scaled_add(1.0 / n as f64, &var);
    }

    if (means[0] - 1.0).abs() > MOMENT_ZERO_TOL {
        return Err(EstimateError::MomentInvariant {
            what: "moment mean",
            level: None,
            value: means[0],
        });
    }
    debug!(n_levels = levels.len(), ?means, ?vars, "estimated moments");
    Ok((means, vars))
}

/// Per-level means of the moment differences, shape `L × R`.
pub fn estimate_level_means<L: Level>(levels: &[L], moments: &dyn Moments) -> Result<Array2<f64>> {
    let rows = levels
        .iter()
        .map(|level| level.estimate_diff_mean(moments))
        .collect::<Result<Vec<_>>>()?;
    stack_rows(rows, moments.size())
}

/// Per-level variances of the moment differences, shape `L × R`, and the
/// sample counts behind them.
pub fn estimate_diff_vars<L: Level>(levels: &[L], moments: &dyn Moments) -> Result<(Array2<f64>, Vec<usize>)> {
    let mut rows = Vec::with_capacity(levels.len());
    let mut n_samples = Vec::with_capacity(levels.len());
    for level in levels {
        let (var, n) = level.estimate_diff_var(moments)?;
        rows.push(var);
        n_samples.push(n);
    }
    Ok((stack_rows(rows, moments.size())?, n_samples))
}

/// Variances of the moments of the single-level approximations against
/// their step: each level transition contributes its coarse variance at the
/// previous step and its fine variance at its own step.
pub fn estimate_level_vars<L: Level>(levels: &[L], moments: &dyn Moments) -> Result<(Array1<f64>, Array2<f64>)> {
    let mut steps = Vec::with_capacity(2 * levels.len());
    let mut rows = Vec::with_capacity(2 * levels.len());
    for (l, level) in levels.iter().enumerate() {
        let (var_coarse, var_fine) = level.estimate_level_var(moments)?;
        if l > 0 {
            rows.push(var_coarse);
            steps.push(levels[l - 1].step());
        }
        rows.push(var_fine);
        steps.push(level.step());
    }
    Ok((Array1::from(steps), stack_rows(rows, moments.size())?))
}

/// MLMC estimate of `E[φ φᵀ]`, summed over `levels`.
pub fn estimate_covariance<L: Level>(levels: &[L], moments: &dyn Moments, stable: bool) -> Result<Array2<f64>> {
    let size = moments.size();
    let mut cov = Array2::zeros((size, size));
    for level in levels {
        cov += &level.estimate_covariance(moments, stable)?;
    }
    Ok(cov)
}

/// Covariance estimate together with the mean squared error of its diagonal,
/// `Σ_l err_l / n_l`.
pub fn estimate_covariance_mse<L: Level>(
    levels: &[L],
    moments: &dyn Moments,
    stable: bool,
) -> Result<(Array2<f64>, Array1<f64>)> {
    let cov = estimate_covariance(levels, moments, stable)?;
    let mut mse = Array1::zeros(moments.size());
    for level in levels {
        let err = level.estimate_cov_diag_err(moments)?;
        mse.scaled_add(1.0 / level.n_samples() as f64, &err);
    }
    Ok((cov, mse))
}

/// Union of the sample ranges of all levels.
pub fn estimate_domain<L: Level>(levels: &[L], quantile: Option<f64>) -> Result<(f64, f64)> {
    if levels.is_empty() {
        return Err(EstimateError::InvalidState(
            "cannot estimate a domain without levels".to_string(),
        ));
    }
    let mut lower = f64::INFINITY;
    let mut upper = f64::NEG_INFINITY;
    for level in levels {
        let (lo, hi) = level.sample_domain(quantile)?;
        lower = lower.min(lo);
        upper = upper.max(hi);
    }
    Ok((lower, upper))
}

/// Cost of one fine/coarse pair on every level.
pub fn estimate_level_cost<L: Level>(levels: &[L]) -> Array1<f64> {
    levels.iter().map(Level::n_ops_estimate).collect()
}

/// Total cost `Σ_l c_l · n_l`.
pub fn estimate_cost(level_costs: &Array1<f64>, n_samples: &[usize]) -> Result<f64> {
    if level_costs.len() != n_samples.len() {
        return Err(EstimateError::ShapeMismatch {
            what: "level costs",
            expected: n_samples.len(),
            found: level_costs.len(),
        });
    }
    Ok(level_costs
        .iter()
        .zip(n_samples)
        .map(|(c, &n)| c * n as f64)
        .sum())
}

/// Sum over the level axis of an `L × R` table.
pub(crate) fn sum_levels(table: &Array2<f64>) -> Array1<f64> {
    table.sum_axis(Axis(0))
}
