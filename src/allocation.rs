//! Number of samples per level needed for a target variance of the MLMC
//! moment estimates at minimal cost.
//!
//! For one moment the cost `Σ N_l c_l` under `Σ V_l / N_l ≤ ε` is minimized by
//!
//! ```text
//! N_l = sqrt(V_l / c_l) · Σ_k sqrt(V_k c_k) / ε
//! ```
//!
//! Each level is also capped at `V_l · L / ε` samples and floored at 2. Counts
//! are rounded up, not to nearest, so the achieved variance never exceeds `ε`.
//! A plan valid for all moments takes the per-level maximum over moments.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use tracing::debug;

use crate::error::{EstimateError, Result};

/// Fewest samples from which a level variance can be estimated.
pub const MIN_SAMPLES: usize = 2;

/// Sample counts per level and moment.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Plain optimum per (level, moment), rounded, without bounds.
    pub estimate: Array2<f64>,
    /// Optimum under the per-level cap, rounded up and clamped to
    /// `[MIN_SAMPLES, ceil(cap)]`.
    pub safe: Array2<usize>,
}

impl Allocation {
    /// Per-level counts meeting every moment's target at once.
    pub fn plan(&self) -> Vec<usize> {
        self.safe
            .axis_iter(Axis(0))
            .map(|row| row.iter().copied().max().unwrap_or(MIN_SAMPLES))
            .collect()
    }
}

fn validate(vars: &Array2<f64>, n_ops: &Array1<f64>, target_variance: f64) -> Result<()> {
    if !(target_variance > 0.0 && target_variance.is_finite()) {
        return Err(EstimateError::InvalidParameter(format!(
            "target variance must be positive, got {}",
            target_variance
        )));
    }
    if vars.nrows() != n_ops.len() {
        return Err(EstimateError::ShapeMismatch {
            what: "level costs",
            expected: vars.nrows(),
            found: n_ops.len(),
        });
    }
    if let Some(c) = n_ops.iter().find(|c| !(**c > 0.0 && c.is_finite())) {
        return Err(EstimateError::InvalidParameter(format!(
            "level cost must be positive, got {}",
            c
        )));
    }
    if let Some(v) = vars.iter().find(|v| !(**v >= 0.0 && v.is_finite())) {
        return Err(EstimateError::InvalidParameter(format!(
            "level variance must be finite and non-negative, got {}",
            v
        )));
    }
    Ok(())
}

/// Optimal real-valued counts for one moment with `N_l ≤ caps[l]`.
///
/// Levels whose optimum exceeds the cap are pinned there; what is left of the
/// variance budget is split over the remaining levels by the same rule until
/// no further level hits its cap.
fn capped_optimum(vars: ArrayView1<f64>, n_ops: &Array1<f64>, caps: &[f64], target: f64) -> Vec<f64> {
    let n_levels = vars.len();
    let mut pinned = vec![false; n_levels];
    let mut optimum = vec![0.0; n_levels];

    loop {
        let used: f64 = (0..n_levels)
            .filter(|&l| pinned[l])
            .map(|l| vars[l] / caps[l])
            .sum();
        let budget = target - used;
        let total: f64 = (0..n_levels)
            .filter(|&l| !pinned[l])
            .map(|l| (vars[l] * n_ops[l]).sqrt())
            .sum();
        if total <= 0.0 || budget <= 0.0 {
            break;
        }

        let free: Vec<usize> = (0..n_levels).filter(|&l| !pinned[l]).collect();
        let mut newly_pinned = false;
        for l in free {
            let n = (vars[l] / n_ops[l]).sqrt() * total / budget;
            if n > caps[l] {
                pinned[l] = true;
                newly_pinned = true;
            } else {
                optimum[l] = n;
            }
        }
        if !newly_pinned {
            break;
        }
    }

    for l in (0..n_levels).filter(|&l| pinned[l]) {
        optimum[l] = caps[l];
    }
    optimum
}

/// Sample counts for every (level, moment) reaching `target_variance`.
///
/// `vars` is the `L × R` table of level variances, `n_ops` the cost of one
/// sample on every level.
pub fn n_sample_estimate_moments(vars: &Array2<f64>, n_ops: &Array1<f64>, target_variance: f64) -> Result<Allocation> {
    validate(vars, n_ops, target_variance)?;
    let (n_levels, n_moments) = vars.dim();

    let mut estimate = Array2::zeros((n_levels, n_moments));
    let mut safe = Array2::from_elem((n_levels, n_moments), MIN_SAMPLES);

    for (r, moment_vars) in vars.axis_iter(Axis(1)).enumerate() {
        let total: f64 = moment_vars
            .iter()
            .zip(n_ops.iter())
            .map(|(v, c)| (v * c).sqrt())
            .sum();
        for l in 0..n_levels {
            estimate[[l, r]] = ((moment_vars[l] / n_ops[l]).sqrt() * total / target_variance).round();
        }

        let caps: Vec<f64> = moment_vars
            .iter()
            .map(|v| v * n_levels as f64 / target_variance)
            .collect();
        let optimum = capped_optimum(moment_vars, n_ops, &caps, target_variance);
        for l in 0..n_levels {
            let n = optimum[l].ceil().min(caps[l].ceil());
            safe[[l, r]] = (n as usize).max(MIN_SAMPLES);
        }
    }

    debug!(target_variance, ?safe, "allocated samples");
    Ok(Allocation { estimate, safe })
}

/// Variance of every moment estimate, `Σ_l V_{l,r} / N_l`, reached by `plan`.
pub fn achieved_variance(vars: &Array2<f64>, plan: &[usize]) -> Result<Array1<f64>> {
    if vars.nrows() != plan.len() {
        return Err(EstimateError::ShapeMismatch {
            what: "sample plan",
            expected: vars.nrows(),
            found: plan.len(),
        });
    }
    let mut total = Array1::zeros(vars.ncols());
    for (row, &n) in vars.axis_iter(Axis(0)).zip(plan) {
        if n == 0 {
            return Err(EstimateError::InvalidParameter(
                "plan with zero samples on a level".to_string(),
            ));
        }
        total.scaled_add(1.0 / n as f64, &row);
    }
    Ok(total)
}
