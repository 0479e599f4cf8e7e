//! Empirical convergence rates of the level hierarchy.
//!
//! With `x_l = log2(1 / h_l)` the fits
//!
//! ```text
//! -log2 |mean_l| ~ α x_l,   -log2 var_l ~ β x_l,   log2 c_l ~ γ x_l
//! ```
//!
//! over the levels `1 .. L` give the weak rate `α`, the variance decay `β`
//! and the cost growth `γ`.

use linregress::{FormulaRegressionBuilder, RegressionDataBuilder};
use tracing::debug;

use crate::aggregate;
use crate::error::{EstimateError, Result};
use crate::level::Level;
use crate::moments::Moments;

/// Fewest difference levels the rate fits are made on.
pub const MIN_FITTED_LEVELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceRates {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

fn slope(x: &[f64], y: &[f64]) -> Result<f64> {
    let columns = vec![("x", x.to_vec()), ("y", y.to_vec())];
    let data = RegressionDataBuilder::new().build_from(columns)?;
    let parameters = FormulaRegressionBuilder::new()
        .data(&data)
        .formula("y ~ x")
        .fit_without_statistics()?;
    let idx = parameters
        .regressor_names
        .iter()
        .position(|name| name == "x")
        .ok_or_else(|| EstimateError::Regression("x not found in regression".to_string()))?;
    Ok(parameters.regressor_values[idx])
}

fn log2_floored(v: f64) -> f64 {
    v.max(f64::MIN_POSITIVE).log2()
}

/// Rates of moment `moment` over `levels`.
pub fn estimate_rates<L: Level>(levels: &[L], moments: &dyn Moments, moment: usize) -> Result<ConvergenceRates> {
    if levels.len() < MIN_FITTED_LEVELS + 1 {
        return Err(EstimateError::InvalidParameter(format!(
            "rates need {} difference levels, got {}",
            MIN_FITTED_LEVELS,
            levels.len().saturating_sub(1)
        )));
    }
    if moment >= moments.size() {
        return Err(EstimateError::InvalidParameter(format!(
            "moment {} out of range for a basis of size {}",
            moment,
            moments.size()
        )));
    }

    let means = aggregate::estimate_level_means(levels, moments)?;
    let (vars, _) = aggregate::estimate_diff_vars(levels, moments)?;
    let costs = aggregate::estimate_level_cost(levels);

    let fitted = 1..levels.len();
    let x: Vec<f64> = fitted.clone().map(|l| -levels[l].step().log2()).collect();
    let y_alpha: Vec<f64> = fitted.clone().map(|l| -log2_floored(means[[l, moment]].abs())).collect();
    let y_beta: Vec<f64> = fitted.clone().map(|l| -log2_floored(vars[[l, moment]])).collect();
    let y_gamma: Vec<f64> = fitted.map(|l| costs[l].log2()).collect();

    let rates = ConvergenceRates {
        alpha: slope(&x, &y_alpha)?,
        beta: slope(&x, &y_beta)?,
        gamma: slope(&x, &y_gamma)?,
    };
    debug!(?rates, moment, "estimated convergence rates");
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::SampleLevel;
    use crate::moments::Monomial;
    use approx::assert_abs_diff_eq;

    /// Level `l` holds the differences `m_l ± s_l` with `m_l = 2^-l` and
    /// `s_l = 2^-2l`, so its mean decays with rate 1 and its variance with 4.
    fn levels(n_levels: usize) -> Vec<SampleLevel> {
        (0..n_levels)
            .map(|l| {
                let h = 0.5f64.powi(l as i32);
                let (m, s) = (h, h * h);
                let fine = vec![m + s, m - s, m + s, m - s];
                SampleLevel::with_samples(l, h, h.powi(-2), fine, vec![0.0; 4]).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_recovers_known_rates() {
        let moments = Monomial::new(2, (-1.0, 1.0)).unwrap();
        let rates = estimate_rates(&levels(5), &moments, 1).unwrap();
        assert_abs_diff_eq!(rates.alpha, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rates.beta, 4.0, epsilon = 1e-9);
        assert_abs_diff_eq!(rates.gamma, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_needs_enough_levels() {
        let moments = Monomial::new(2, (-1.0, 1.0)).unwrap();
        assert!(matches!(
            estimate_rates(&levels(3), &moments, 1),
            Err(EstimateError::InvalidParameter(_))
        ));
        assert!(estimate_rates(&levels(4), &moments, 5).is_err());
    }
}
