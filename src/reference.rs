//! Reference values of the quantities the MLMC estimator approximates,
//! computed directly from the level simulations instead of from collected
//! samples. Used to check an estimator against known answers.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_rand::rand::RngCore;
use ndarray_rand::rand_distr::Distribution;
use tracing::debug;

use crate::error::{EstimateError, Result};
use crate::moments::{check_size, Moments};
use crate::sampler::LevelSimulation;
use crate::utility::simpson;

/// Deterministic response of one level: maps an input drawn from a known
/// density to the quantity computed with step `step`.
pub struct LevelMap {
    step: f64,
    map: Box<dyn Fn(f64) -> f64 + Send + Sync>,
}

impl LevelMap {
    pub fn new<F>(step: f64, map: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + Sync + 'static,
    {
        Self {
            step,
            map: Box::new(map),
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn eval(&self, input: f64) -> f64 {
        (self.map)(input)
    }
}

impl std::fmt::Debug for LevelMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LevelMap").field("step", &self.step).finish()
    }
}

/// Mean and ddof-1 variance of the finite entries of a column.
fn finite_mean_var(level: usize, column: ArrayView1<f64>) -> Result<(f64, f64)> {
    let finite: Array1<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return Err(EstimateError::InsufficientSamples {
            level,
            n_samples: finite.len(),
            required: 2,
        });
    }
    let mean = finite.mean().unwrap_or(f64::NAN);
    Ok((mean, finite.var(1.0)))
}

/// Monte Carlo mean of the moments of `size` draws from `distr`.
/// Non-finite evaluations are left out per moment.
pub fn exact_mean<D>(distr: &D, moments: &dyn Moments, size: usize, rng: &mut dyn RngCore) -> Result<Array1<f64>>
where
    D: Distribution<f64>,
{
    check_size(moments.size())?;
    let values: Vec<f64> = (0..size).map(|_| distr.sample(&mut *rng)).collect();
    let evaluated = moments.eval_all(&values);
    evaluated
        .axis_iter(Axis(1))
        .map(|column| finite_mean_var(0, column).map(|(mean, _)| mean))
        .collect()
}

/// Per-level means and variances (`L × R`) of the moment differences,
/// estimated from `size` fresh pairs of every simulation.
///
/// Level 0 uses the fine values alone, as the estimator does.
pub fn diff_var_sampled(
    simulations: &[LevelSimulation],
    moments: &dyn Moments,
    size: usize,
    rng: &mut dyn RngCore,
) -> Result<(Array2<f64>, Array2<f64>)> {
    let n_moments = moments.size();
    check_size(n_moments)?;
    let mut means = Array2::zeros((simulations.len(), n_moments));
    let mut vars = Array2::zeros((simulations.len(), n_moments));

    for (l, sim) in simulations.iter().enumerate() {
        let batch = sim.sample(size, rng);
        let mut diff = moments.eval_all(&batch.fine.to_vec());
        if l > 0 {
            diff -= &moments.eval_all(&batch.coarse.to_vec());
        }
        for (r, column) in diff.axis_iter(Axis(1)).enumerate() {
            let (mean, var) = finite_mean_var(l, column)?;
            means[[l, r]] = mean;
            vars[[l, r]] = var;
        }
    }
    debug!(n_levels = simulations.len(), size, "sampled reference level variances");
    Ok((means, vars))
}

/// Per-level means and variances (`L × R`) of the moment differences by
/// quadrature over `domain` against the input density `pdf`.
///
/// Level `l > 0` differences `maps[l]` and `maps[l - 1]` at the same input.
pub fn diff_var_quadrature<P>(
    maps: &[LevelMap],
    pdf: P,
    moments: &dyn Moments,
    domain: (f64, f64),
    n_intervals: usize,
) -> Result<(Array2<f64>, Array2<f64>)>
where
    P: Fn(f64) -> f64,
{
    let n_moments = moments.size();
    check_size(n_moments)?;
    let (a, b) = domain;
    if !(a.is_finite() && b.is_finite() && a < b) {
        return Err(EstimateError::InvalidParameter(format!(
            "quadrature domain ({}, {}) must be a finite non-empty interval",
            a, b
        )));
    }

    let mut means = Array2::zeros((maps.len(), n_moments));
    let mut vars = Array2::zeros((maps.len(), n_moments));
    for (l, map) in maps.iter().enumerate() {
        let coarse = l.checked_sub(1).map(|k| &maps[k]);
        let diff = |x: f64| {
            let fine = moments.eval(map.eval(x));
            match coarse {
                Some(c) => fine - moments.eval(c.eval(x)),
                None => fine,
            }
        };
        for r in 0..n_moments {
            let mean = simpson(|x| diff(x)[r] * pdf(x), a, b, n_intervals);
            let var = simpson(|x| (diff(x)[r] - mean).powi(2) * pdf(x), a, b, n_intervals);
            if !(mean.is_finite() && var.is_finite()) {
                return Err(EstimateError::Quadrature(format!(
                    "non-finite integral for moment {} on level {}",
                    r, l
                )));
            }
            means[[l, r]] = mean;
            vars[[l, r]] = var;
        }
    }
    Ok((means, vars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moments::Monomial;
    use crate::synth;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Normal;
    use rand_chacha::ChaCha8Rng;

    fn std_normal_pdf(x: f64) -> f64 {
        (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
    }

    #[test]
    fn test_exact_mean_of_normal() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let normal = Normal::new(0.4, 1.0).unwrap();
        let moments = Monomial::new(3, (-1.0, 1.0)).unwrap();
        let mean = exact_mean(&normal, &moments, 200_000, &mut rng).unwrap();
        assert_eq!(mean[0], 1.0);
        assert_abs_diff_eq!(mean[1], 0.4, epsilon = 0.02);
        assert_abs_diff_eq!(mean[2], 1.16, epsilon = 0.03);
    }

    #[test]
    fn test_sampled_level_variances_follow_steps() {
        let steps = [1.0, 0.5, 0.25];
        let sims = synth::gaussian_levels(0.7, &steps, 1.0).unwrap();
        let moments = Monomial::new(2, (-1.0, 1.0)).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let (means, vars) = diff_var_sampled(&sims, &moments, 20_000, &mut rng).unwrap();

        assert_eq!(means[[0, 0]], 1.0);
        assert_abs_diff_eq!(means[[0, 1]], 0.7, epsilon = 0.05);
        for (l, h) in steps.iter().enumerate() {
            assert_eq!(vars[[l, 0]], 0.0);
            assert_relative_eq!(vars[[l, 1]], h * h, max_relative = 0.05);
        }
        assert_eq!(means[[1, 0]], 0.0);
        assert_abs_diff_eq!(means[[2, 1]], 0.0, epsilon = 0.02);
    }

    #[test]
    fn test_quadrature_of_linear_maps() {
        // level l returns (1 + h_l) x; with the domain (-10, 10) the basis
        // value is t = (1 + h_l) x / 10
        let maps = vec![LevelMap::new(1.0, |x| 2.0 * x), LevelMap::new(0.5, |x| 1.5 * x)];
        let moments = Monomial::new(3, (-10.0, 10.0)).unwrap();
        let (means, vars) = diff_var_quadrature(&maps, std_normal_pdf, &moments, (-10.0, 10.0), 400).unwrap();

        assert_abs_diff_eq!(means[[0, 0]], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(vars[[0, 0]], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(means[[0, 1]], 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(vars[[0, 1]], 0.04, epsilon = 1e-8);
        assert_abs_diff_eq!(means[[0, 2]], 0.04, epsilon = 1e-8);
        assert_abs_diff_eq!(vars[[0, 2]], 0.0032, epsilon = 1e-8);

        assert_abs_diff_eq!(means[[1, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(vars[[1, 1]], 0.0025, epsilon = 1e-8);
        assert_eq!(maps[1].step(), 0.5);
    }

    #[test]
    fn test_quadrature_rejects_bad_domain() {
        let maps = vec![LevelMap::new(1.0, |x| x)];
        let moments = Monomial::new(2, (-1.0, 1.0)).unwrap();
        assert!(matches!(
            diff_var_quadrature(&maps, std_normal_pdf, &moments, (1.0, 1.0), 10),
            Err(EstimateError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_too_few_draws() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let moments = Monomial::new(2, (-1.0, 1.0)).unwrap();
        let normal = Normal::new(0.0, 1.0).unwrap();
        assert!(matches!(
            exact_mean(&normal, &moments, 1, &mut rng),
            Err(EstimateError::InsufficientSamples { .. })
        ));
    }
}
