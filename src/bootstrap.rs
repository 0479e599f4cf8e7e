//! Bootstrap estimate of the sampling variance of the MLMC estimators.
//!
//! Every replicate redraws, with replacement, `sample_vector[l]` samples on
//! each level and recomputes the global mean and variance together with the
//! per-level means and variances. Spread across replicates gives the
//! variance of each estimator; a reference far from the replicate mean is
//! reported as possible bias.

use std::fmt;
use std::sync::Arc;

use ndarray::{Array, Array1, Array2, Dimension, Zip};
use ndarray_rand::rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, warn};

use crate::aggregate;
use crate::error::{EstimateError, Result};
use crate::moments::Moments;
use crate::regression::VarianceRegression;
use crate::sampler::Sampler;

/// Floor applied before taking logs of variance-like quantities.
pub const LOG_EPS: f64 = 1e-10;
/// Absolute slack of the bias test.
const BIAS_SLACK: f64 = 1e-20;

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Number of replicates `B`.
    pub n_subsamples: usize,
    /// Resample size per level; the current counts when `None`.
    pub sample_vector: Option<Vec<usize>>,
    /// Smooth the level variances with the variance regression.
    pub regression: bool,
    /// Work with `ln(max(v, LOG_EPS))` of the variance-like quantities.
    pub log: bool,
    /// Seed of the resampling generator; drawn from the OS when `None`.
    pub seed: Option<u64>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            n_subsamples: 100,
            sample_vector: None,
            regression: false,
            log: false,
            seed: None,
        }
    }
}

/// The four estimators examined by the bootstrap.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantities {
    /// `Σ_l mean_l`, length `R`.
    pub mean: Array1<f64>,
    /// `Σ_l var_l / sample_vector_l`, length `R`.
    pub var: Array1<f64>,
    /// Per-level means, `L × R`.
    pub level_mean: Array2<f64>,
    /// Per-level variances, `L × R`.
    pub level_var: Array2<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Mean,
    Var,
    LevelMean,
    LevelVar,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Quantity::Mean => "mean",
            Quantity::Var => "var",
            Quantity::LevelMean => "level mean",
            Quantity::LevelVar => "level var",
        };
        f.write_str(name)
    }
}

/// A reference value further than two bootstrap standard deviations from the
/// replicate mean.
#[derive(Debug, Clone, PartialEq)]
pub struct BiasFlag {
    pub quantity: Quantity,
    pub level: Option<usize>,
    pub moment: usize,
    pub reference: f64,
    pub bootstrap_mean: f64,
    pub bootstrap_var: f64,
}

/// Result of one bootstrap run.
#[derive(Debug, Clone)]
pub struct BootstrapEstimate {
    /// Run number within the owning estimate, starting at 1.
    pub run: u64,
    pub n_subsamples: usize,
    pub sample_vector: Vec<usize>,
    /// Estimates from all collected samples.
    pub reference: Quantities,
    /// Means over the replicates.
    pub mean: Quantities,
    /// Variances (ddof = 1) over the replicates. The per-level mean variance
    /// is multiplied by the level's resample size.
    pub var: Quantities,
    pub bias: Vec<BiasFlag>,
}

impl BootstrapEstimate {
    pub fn is_biased(&self) -> bool {
        !self.bias.is_empty()
    }
}

/// Evaluates the four estimators on the current view of the sampler.
fn quantities<S: Sampler>(
    sampler: &S,
    moments: &dyn Moments,
    regression: Option<&mut VarianceRegression>,
    sample_vector: &[usize],
    log: bool,
) -> Result<Quantities> {
    let levels = sampler.levels();
    let level_mean = aggregate::estimate_level_means(levels, moments)?;
    let (raw_vars, n_samples) = aggregate::estimate_diff_vars(levels, moments)?;
    let level_var = match regression {
        Some(regression) => regression.regress(&raw_vars, &sampler.sim_steps(), &n_samples)?,
        None => raw_vars,
    };

    let mean = aggregate::sum_levels(&level_mean);
    let mut var = Array1::zeros(level_var.ncols());
    for (row, &n) in level_var.outer_iter().zip(sample_vector) {
        var.scaled_add(1.0 / n as f64, &row);
    }

    let to_log = |v: f64| v.max(LOG_EPS).ln();
    Ok(if log {
        Quantities {
            mean,
            var: var.mapv(to_log),
            level_mean,
            level_var: level_var.mapv(to_log),
        }
    } else {
        Quantities {
            mean,
            var,
            level_mean,
            level_var,
        }
    })
}

/// Mean and variance (ddof = 1) over replicates, shifted by the first one so
/// that constant components come out exact.
fn spread<D: Dimension>(items: &[&Array<f64, D>]) -> (Array<f64, D>, Array<f64, D>) {
    let n = items.len() as f64;
    let shift = items[0];
    let mut sum = Array::<f64, D>::zeros(shift.raw_dim());
    let mut sum_sq = Array::<f64, D>::zeros(shift.raw_dim());
    for item in items {
        Zip::from(&mut sum)
            .and(&mut sum_sq)
            .and(*item)
            .and(shift)
            .for_each(|s, q, &x, &x0| {
                let d = x - x0;
                *s += d;
                *q += d * d;
            });
    }
    let mean_shift = &sum / n;
    let var = (&sum_sq - &(&mean_shift * &sum)) / (n - 1.0);
    (shift + &mean_shift, var.mapv(|v| v.max(0.0)))
}

fn reduce(replicates: &[Quantities], sample_vector: &[usize]) -> (Quantities, Quantities) {
    let (mean_mean, mean_var) = spread(&replicates.iter().map(|q| &q.mean).collect::<Vec<_>>());
    let (var_mean, var_var) = spread(&replicates.iter().map(|q| &q.var).collect::<Vec<_>>());
    let (level_mean_mean, mut level_mean_var) =
        spread(&replicates.iter().map(|q| &q.level_mean).collect::<Vec<_>>());
    let (level_var_mean, level_var_var) =
        spread(&replicates.iter().map(|q| &q.level_var).collect::<Vec<_>>());

    for (mut row, &n) in level_mean_var.outer_iter_mut().zip(sample_vector) {
        row *= n as f64;
    }

    (
        Quantities {
            mean: mean_mean,
            var: var_mean,
            level_mean: level_mean_mean,
            level_var: level_var_mean,
        },
        Quantities {
            mean: mean_var,
            var: var_var,
            level_mean: level_mean_var,
            level_var: level_var_var,
        },
    )
}

fn check_component(
    flags: &mut Vec<BiasFlag>,
    quantity: Quantity,
    level: Option<usize>,
    moment: usize,
    (reference, bootstrap_mean, bootstrap_var): (f64, f64, f64),
) {
    if (reference - bootstrap_mean).abs() > 2.0 * bootstrap_var.sqrt() + BIAS_SLACK {
        warn!(
            %quantity,
            ?level,
            moment,
            reference,
            bootstrap_mean,
            bootstrap_var,
            "bootstrap indicates bias"
        );
        flags.push(BiasFlag {
            quantity,
            level,
            moment,
            reference,
            bootstrap_mean,
            bootstrap_var,
        });
    }
}

/// Compares the reference with the bootstrap means. The level-mean variance
/// is compared before the rescaling by the resample size.
pub fn check_bias(reference: &Quantities, mean: &Quantities, var: &Quantities, sample_vector: &[usize]) -> Vec<BiasFlag> {
    let mut flags = Vec::new();
    for r in 0..reference.mean.len() {
        check_component(&mut flags, Quantity::Mean, None, r, (reference.mean[r], mean.mean[r], var.mean[r]));
        check_component(&mut flags, Quantity::Var, None, r, (reference.var[r], mean.var[r], var.var[r]));
    }
    for ((l, r), &value) in reference.level_mean.indexed_iter() {
        let n = sample_vector.get(l).copied().unwrap_or(1).max(1) as f64;
        let components = (value, mean.level_mean[[l, r]], var.level_mean[[l, r]] / n);
        check_component(&mut flags, Quantity::LevelMean, Some(l), r, components);
    }
    for ((l, r), &value) in reference.level_var.indexed_iter() {
        let components = (value, mean.level_var[[l, r]], var.level_var[[l, r]]);
        check_component(&mut flags, Quantity::LevelVar, Some(l), r, components);
    }
    flags
}

/// Resample sizes for a run: the configured vector (truncated to the number
/// of levels) or the current counts.
fn resolve_sample_vector<S: Sampler>(sampler: &S, config: &BootstrapConfig) -> Result<Vec<usize>> {
    let n_levels = sampler.n_levels();
    let sample_vector = match &config.sample_vector {
        Some(v) => v.iter().copied().take(n_levels).collect::<Vec<_>>(),
        None => sampler.n_samples(),
    };
    if sample_vector.len() != n_levels {
        return Err(EstimateError::ShapeMismatch {
            what: "bootstrap sample vector",
            expected: n_levels,
            found: sample_vector.len(),
        });
    }
    if let Some((l, &n)) = sample_vector.iter().enumerate().find(|(_, &n)| n < 2) {
        return Err(EstimateError::InsufficientSamples {
            level: l,
            n_samples: n,
            required: 2,
        });
    }
    Ok(sample_vector)
}

/// Runs the bootstrap on `sampler`. The resampled views are always cleared
/// before returning, also on error.
pub fn run<S: Sampler>(
    sampler: &mut S,
    moments: &Arc<dyn Moments>,
    regression: &mut VarianceRegression,
    config: &BootstrapConfig,
    run: u64,
) -> Result<BootstrapEstimate> {
    if config.n_subsamples < 2 {
        return Err(EstimateError::InvalidParameter(format!(
            "bootstrap needs at least 2 subsamples, got {}",
            config.n_subsamples
        )));
    }
    let sample_vector = resolve_sample_vector(sampler, config)?;
    sampler.update_moments(moments);

    let mut regression = config.regression.then_some(regression);
    let reference = quantities(
        sampler,
        moments.as_ref(),
        regression.as_deref_mut(),
        &sample_vector,
        config.log,
    )?;

    let mut rng = match config.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };

    let mut replicates = Vec::with_capacity(config.n_subsamples);
    let mut outcome = Ok(());
    for _ in 0..config.n_subsamples {
        let replicate = sampler.subsample(&sample_vector, &mut rng).and_then(|()| {
            quantities(
                sampler,
                moments.as_ref(),
                regression.as_deref_mut(),
                &sample_vector,
                config.log,
            )
        });
        match replicate {
            Ok(q) => replicates.push(q),
            Err(err) => {
                outcome = Err(err);
                break;
            }
        }
    }
    sampler.clean_subsamples();
    outcome?;

    let (mean, var) = reduce(&replicates, &sample_vector);
    let bias = check_bias(&reference, &mean, &var, &sample_vector);
    debug!(run, n_subsamples = config.n_subsamples, n_biased = bias.len(), "bootstrap finished");

    Ok(BootstrapEstimate {
        run,
        n_subsamples: config.n_subsamples,
        sample_vector,
        reference,
        mean,
        var,
        bias,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::SampleLevel;
    use crate::moments::Monomial;
    use crate::sampler::MemorySampler;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn sampler() -> MemorySampler {
        let fine0: Vec<f64> = (0..40).map(|i| (i as f64 * 0.37).sin()).collect();
        let fine1: Vec<f64> = (0..20).map(|i| (i as f64 * 0.91).cos()).collect();
        let coarse1: Vec<f64> = fine1.iter().map(|x| x * 0.9).collect();
        MemorySampler::from_levels(vec![
            SampleLevel::with_samples(0, 1.0, 1.0, fine0, vec![0.0; 40]).unwrap(),
            SampleLevel::with_samples(1, 0.5, 2.0, fine1, coarse1).unwrap(),
        ])
        .unwrap()
    }

    fn moments() -> Arc<dyn Moments> {
        Arc::new(Monomial::new(3, (-1.0, 1.0)).unwrap())
    }

    #[test]
    fn test_spread_of_constants_is_exact() {
        let a = array![0.1, -23.025850929940457];
        let items = vec![&a; 7];
        let (mean, var) = spread(&items);
        assert_eq!(mean, a);
        assert_eq!(var, array![0.0, 0.0]);
    }

    #[test]
    fn test_spread_matches_sample_variance() {
        let items = [array![1.0], array![2.0], array![4.0]];
        let refs: Vec<_> = items.iter().collect();
        let (mean, var) = spread(&refs);
        assert_abs_diff_eq!(mean[0], 7.0 / 3.0, epsilon = 1e-14);
        assert_abs_diff_eq!(var[0], 7.0 / 3.0, epsilon = 1e-14);
    }

    #[test]
    fn test_run_is_reproducible_and_cleans_up() {
        let mut sampler = sampler();
        let mut regression = VarianceRegression::default();
        let config = BootstrapConfig {
            n_subsamples: 30,
            seed: Some(11),
            ..BootstrapConfig::default()
        };
        let first = run(&mut sampler, &moments(), &mut regression, &config, 1).unwrap();
        assert!(sampler.levels().iter().all(|level| !level.is_subsampled()));
        let second = run(&mut sampler, &moments(), &mut regression, &config, 2).unwrap();

        assert_eq!(first.sample_vector, vec![40, 20]);
        assert_eq!(first.mean.mean, second.mean.mean);
        assert_eq!(second.run, 2);
        assert_eq!(first.reference.mean[0], 1.0);
        assert_eq!(first.var.mean[0], 0.0);
        assert_eq!(first.var.level_var.column(0).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_log_variances() {
        let mut sampler = sampler();
        let config = BootstrapConfig {
            n_subsamples: 10,
            log: true,
            seed: Some(3),
            ..BootstrapConfig::default()
        };
        let estimate = run(&mut sampler, &moments(), &mut VarianceRegression::default(), &config, 1).unwrap();
        assert_eq!(estimate.reference.var[0], LOG_EPS.ln());
        assert_eq!(estimate.mean.level_var[[1, 0]], LOG_EPS.ln());
    }

    #[test]
    fn test_sample_vector_is_truncated_and_checked() {
        let mut sampler = sampler();
        let mut regression = VarianceRegression::default();
        let config = BootstrapConfig {
            n_subsamples: 5,
            sample_vector: Some(vec![10, 8, 99]),
            seed: Some(1),
            ..BootstrapConfig::default()
        };
        let estimate = run(&mut sampler, &moments(), &mut regression, &config, 1).unwrap();
        assert_eq!(estimate.sample_vector, vec![10, 8]);

        let short = BootstrapConfig {
            sample_vector: Some(vec![10]),
            ..config.clone()
        };
        assert!(matches!(
            run(&mut sampler, &moments(), &mut regression, &short, 2),
            Err(EstimateError::ShapeMismatch { .. })
        ));
        let single = BootstrapConfig {
            n_subsamples: 1,
            ..config
        };
        assert!(matches!(
            run(&mut sampler, &moments(), &mut regression, &single, 3),
            Err(EstimateError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_bias_is_flagged_not_fatal() {
        let reference = Quantities {
            mean: array![1.0, 5.0],
            var: array![0.0, 0.1],
            level_mean: array![[1.0, 5.0]],
            level_var: array![[0.0, 1.0]],
        };
        let mean = Quantities {
            mean: array![1.0, 0.0],
            ..reference.clone()
        };
        let var = Quantities {
            mean: array![0.0, 1.0],
            var: array![0.0, 0.0],
            level_mean: array![[0.0, 0.0]],
            level_var: array![[0.0, 0.0]],
        };
        let flags = check_bias(&reference, &mean, &var, &[10]);
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].quantity, Quantity::Mean);
        assert_eq!(flags[0].moment, 1);
    }
}
