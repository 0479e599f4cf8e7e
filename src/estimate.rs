//! The estimator facade: a sampler, the current moment basis and everything
//! computed from them.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use tracing::{debug, info, warn};

use crate::aggregate;
use crate::allocation::{self, Allocation};
use crate::bootstrap::{self, BootstrapConfig, BootstrapEstimate};
use crate::density::{DensityConfig, DensityReconstructor, Distribution, MomentOrthogonalizer};
use crate::error::{EstimateError, Result};
use crate::moments::Moments;
use crate::orthogonal::OrthogonalInfo;
use crate::rates::{self, ConvergenceRates};
use crate::regression::{RegressionConfig, VarianceRegression};
use crate::sampler::{RefillConfig, Sampler};

/// MLMC estimates over the levels of a borrowed sampler.
///
/// The estimate never changes sample data. It only asks the sampler for new
/// samples, temporary resamples and moment caches.
pub struct Estimate<'a, S: Sampler> {
    sampler: &'a mut S,
    moments: Arc<dyn Moments>,
    regression: VarianceRegression,
    distribution: Option<Box<dyn Distribution>>,
    bootstrap_runs: u64,
}

impl<'a, S: Sampler> Estimate<'a, S> {
    pub fn new(sampler: &'a mut S, moments: Arc<dyn Moments>) -> Self {
        Self::with_regression(sampler, moments, RegressionConfig::default())
    }

    pub fn with_regression(sampler: &'a mut S, moments: Arc<dyn Moments>, config: RegressionConfig) -> Self {
        sampler.update_moments(&moments);
        Self {
            sampler,
            moments,
            regression: VarianceRegression::new(config),
            distribution: None,
            bootstrap_runs: 0,
        }
    }

    pub fn sampler(&self) -> &S {
        &*self.sampler
    }

    pub fn moments(&self) -> &Arc<dyn Moments> {
        &self.moments
    }

    /// Switches to another basis. A previously constructed density is
    /// dropped.
    pub fn set_moments(&mut self, moments: Arc<dyn Moments>) {
        self.sampler.update_moments(&moments);
        self.moments = moments;
        self.distribution = None;
    }

    pub fn regression(&self) -> &VarianceRegression {
        &self.regression
    }

    pub fn n_moments(&self) -> usize {
        self.moments.size()
    }

    pub fn n_levels(&self) -> usize {
        self.sampler.n_levels()
    }

    pub fn n_samples(&self) -> Vec<usize> {
        self.sampler.n_samples()
    }

    pub fn sim_steps(&self) -> Vec<f64> {
        self.sampler.sim_steps()
    }

    /// Number of bootstrap runs made so far.
    pub fn bootstrap_runs(&self) -> u64 {
        self.bootstrap_runs
    }

    /// Means of the moments and the variance of those means.
    pub fn estimate_moments(&self) -> Result<(Array1<f64>, Array1<f64>)> {
        aggregate::estimate_moments(self.sampler.levels(), self.moments.as_ref())
    }

    pub fn estimate_level_means(&self) -> Result<Array2<f64>> {
        aggregate::estimate_level_means(self.sampler.levels(), self.moments.as_ref())
    }

    pub fn estimate_diff_vars(&self) -> Result<(Array2<f64>, Vec<usize>)> {
        aggregate::estimate_diff_vars(self.sampler.levels(), self.moments.as_ref())
    }

    pub fn estimate_level_vars(&self) -> Result<(Array1<f64>, Array2<f64>)> {
        aggregate::estimate_level_vars(self.sampler.levels(), self.moments.as_ref())
    }

    /// Level variances smoothed by the variance regression, with the sample
    /// counts they come from.
    pub fn estimate_diff_vars_regression(&mut self) -> Result<(Array2<f64>, Vec<usize>)> {
        let (raw_vars, n_samples) = self.estimate_diff_vars()?;
        let vars = self.regress_vars(&raw_vars, &n_samples)?;
        Ok((vars, n_samples))
    }

    /// Regressed copy of a given `L × R` variance table.
    pub fn regress_vars(&mut self, raw_vars: &Array2<f64>, n_samples: &[usize]) -> Result<Array2<f64>> {
        let steps = self.sampler.sim_steps();
        self.regression.regress(raw_vars, &steps, n_samples)
    }

    pub fn estimate_level_cost(&self) -> Array1<f64> {
        aggregate::estimate_level_cost(self.sampler.levels())
    }

    /// `Σ_l c_l n_l`, by default with the current costs and counts.
    pub fn estimate_cost(&self, level_costs: Option<&Array1<f64>>, n_samples: Option<&[usize]>) -> Result<f64> {
        let costs = level_costs.cloned().unwrap_or_else(|| self.estimate_level_cost());
        let current;
        let n_samples = match n_samples {
            Some(n) => n,
            None => {
                current = self.n_samples();
                &current
            }
        };
        aggregate::estimate_cost(&costs, n_samples)
    }

    /// Sample counts per level and moment for `vars` at the current costs.
    pub fn n_sample_estimate_moments(&self, vars: &Array2<f64>, target_variance: f64) -> Result<Allocation> {
        allocation::n_sample_estimate_moments(vars, &self.estimate_level_cost(), target_variance)
    }

    /// Per-level sample counts reaching `target_variance` for every moment,
    /// from the regressed variances or from `prescribe_vars`.
    pub fn estimate_n_samples_for_target_variance(
        &mut self,
        target_variance: f64,
        prescribe_vars: Option<&Array2<f64>>,
    ) -> Result<Vec<usize>> {
        let vars = match prescribe_vars {
            Some(vars) => vars.clone(),
            None => self.estimate_diff_vars_regression()?.0,
        };
        let plan = self.n_sample_estimate_moments(&vars, target_variance)?.plan();
        debug!(target_variance, ?plan, "estimated sample plan");
        Ok(plan)
    }

    /// Adds samples until the plan estimated from the collected data is
    /// covered by what the sampler has scheduled. Returns the last plan.
    pub fn target_var_adding_samples(&mut self, target_variance: f64, refill: &RefillConfig) -> Result<Vec<usize>> {
        let mut plan = self.estimate_n_samples_for_target_variance(target_variance, None)?;
        for round in 1..=refill.max_rounds {
            info!(round, ?plan, "refilling levels");
            let done = self.sampler.process_adding_samples(&plan, refill)?;
            self.sampler.update_moments(&self.moments);
            if done {
                return Ok(plan);
            }
            plan = self.estimate_n_samples_for_target_variance(target_variance, None)?;
        }
        warn!(
            max_rounds = refill.max_rounds,
            ?plan,
            "stopped adding samples before the plan settled"
        );
        Ok(plan)
    }

    /// Estimate of `E[φ φᵀ]` over all levels.
    pub fn estimate_covariance(&self, stable: bool) -> Result<Array2<f64>> {
        aggregate::estimate_covariance(self.sampler.levels(), self.moments.as_ref(), stable)
    }

    /// Covariance estimate and the mean squared error of its diagonal.
    pub fn estimate_covariance_mse(&self, stable: bool) -> Result<(Array2<f64>, Array1<f64>)> {
        aggregate::estimate_covariance_mse(self.sampler.levels(), self.moments.as_ref(), stable)
    }

    pub fn estimate_domain(&self, quantile: Option<f64>) -> Result<(f64, f64)> {
        aggregate::estimate_domain(self.sampler.levels(), quantile)
    }

    /// Convergence rates of one moment over the level hierarchy.
    pub fn estimate_rates(&self, moment: usize) -> Result<ConvergenceRates> {
        rates::estimate_rates(self.sampler.levels(), self.moments.as_ref(), moment)
    }

    /// Orthogonalizes the basis against the estimated covariance, estimates
    /// the moments in the new basis and fits a density to them.
    pub fn construct_density(
        &mut self,
        reconstructor: &dyn DensityReconstructor,
        orthogonalizer: &dyn MomentOrthogonalizer,
        config: &DensityConfig,
    ) -> Result<OrthogonalInfo> {
        let covariance = self.estimate_covariance(config.stable)?;
        let (orthogonal, info) =
            orthogonalizer.orthogonalize(Arc::clone(&self.moments), &covariance, config.orthogonal_tol)?;

        let (means, vars) = aggregate::estimate_moments(self.sampler.levels(), orthogonal.as_ref())?;
        let mut moments_data = Array2::zeros((means.len(), 2));
        moments_data.column_mut(0).assign(&means);
        moments_data.column_mut(1).assign(&vars);

        let domain = orthogonal.domain();
        let distribution = reconstructor.reconstruct(orthogonal, &moments_data, domain, config.tol, config.reg_param)?;
        info!(size = info.size, original_size = info.original_size, "constructed density");
        self.distribution = Some(distribution);
        Ok(info)
    }

    pub fn distribution(&self) -> Result<&dyn Distribution> {
        self.distribution
            .as_deref()
            .ok_or_else(|| EstimateError::InvalidState("density has not been constructed".to_string()))
    }

    pub fn approx_pdf(&self, x: &[f64]) -> Result<Vec<f64>> {
        let distribution = self.distribution()?;
        Ok(x.iter().map(|&v| distribution.density(v)).collect())
    }

    pub fn approx_cdf(&self, x: &[f64]) -> Result<Vec<f64>> {
        let distribution = self.distribution()?;
        Ok(x.iter().map(|&v| distribution.cdf(v)).collect())
    }

    /// Bootstrap estimate of the variance of the mean, variance, level mean
    /// and level variance estimators.
    pub fn ref_estimates_bootstrap(&mut self, config: &BootstrapConfig) -> Result<BootstrapEstimate> {
        self.bootstrap_runs += 1;
        bootstrap::run(
            &mut *self.sampler,
            &self.moments,
            &mut self.regression,
            config,
            self.bootstrap_runs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::SampleLevel;
    use crate::moments::Monomial;
    use crate::orthogonal::CholeskyOrthogonalizer;
    use crate::sampler::{LevelSimulation, MemorySampler, SampleBatch};
    use approx::assert_abs_diff_eq;
    use std::cell::RefCell;
    use std::time::Duration;

    #[derive(Debug)]
    struct Uniform {
        domain: (f64, f64),
    }

    impl Distribution for Uniform {
        fn density(&self, x: f64) -> f64 {
            let (a, b) = self.domain;
            if (a..=b).contains(&x) {
                1.0 / (b - a)
            } else {
                0.0
            }
        }

        fn cdf(&self, x: f64) -> f64 {
            let (a, b) = self.domain;
            ((x - a) / (b - a)).clamp(0.0, 1.0)
        }
    }

    /// Records what it was given and returns the uniform law on the domain.
    #[derive(Default)]
    struct Recording {
        seen: RefCell<Option<Array2<f64>>>,
    }

    impl DensityReconstructor for Recording {
        fn reconstruct(
            &self,
            moments: Arc<dyn Moments>,
            moments_data: &Array2<f64>,
            domain: (f64, f64),
            _tol: f64,
            _reg_param: f64,
        ) -> Result<Box<dyn Distribution>> {
            assert_eq!(moments.size(), moments_data.nrows());
            *self.seen.borrow_mut() = Some(moments_data.clone());
            Ok(Box::new(Uniform { domain }))
        }
    }

    fn collected() -> MemorySampler {
        MemorySampler::from_levels(vec![
            SampleLevel::with_samples(0, 1.0, 1.0, vec![-0.5, 0.0, 0.25, 0.5, 0.75], vec![0.0; 5]).unwrap(),
            SampleLevel::with_samples(1, 0.5, 4.0, vec![0.1, 0.2, -0.1], vec![0.0, 0.3, -0.1]).unwrap(),
        ])
        .unwrap()
    }

    fn monomial(size: usize) -> Arc<dyn Moments> {
        Arc::new(Monomial::new(size, (-1.0, 1.0)).unwrap())
    }

    #[test]
    fn test_density_requires_construction() {
        let mut sampler = collected();
        let mut estimate = Estimate::new(&mut sampler, monomial(3));
        assert!(matches!(estimate.approx_pdf(&[0.0]), Err(EstimateError::InvalidState(_))));
        assert!(matches!(estimate.approx_cdf(&[0.0]), Err(EstimateError::InvalidState(_))));

        let reconstructor = Recording::default();
        let info = estimate
            .construct_density(&reconstructor, &CholeskyOrthogonalizer, &DensityConfig::default())
            .unwrap();
        assert_eq!(info.original_size, 3);

        let data = reconstructor.seen.borrow().clone().unwrap();
        assert_eq!(data.nrows(), info.size);
        assert_eq!(data[[0, 0]], 1.0);
        assert_eq!(data[[0, 1]], 0.0);
        assert!(data.column(1).iter().skip(1).all(|&v| v > 0.0));

        assert_eq!(estimate.approx_pdf(&[0.0, 2.0]).unwrap(), vec![0.5, 0.0]);
        assert_eq!(estimate.approx_cdf(&[1.0]).unwrap(), vec![1.0]);

        estimate.set_moments(monomial(2));
        assert!(estimate.distribution().is_err());
    }

    #[test]
    fn test_cost_defaults_to_current_counts() {
        let mut sampler = collected();
        let estimate = Estimate::new(&mut sampler, monomial(2));
        assert_eq!(estimate.estimate_cost(None, None).unwrap(), 5.0 + 12.0);
        assert_eq!(estimate.estimate_cost(None, Some(&[1, 1])).unwrap(), 5.0);
        let costs = Array1::from(vec![2.0, 2.0]);
        assert_eq!(estimate.estimate_cost(Some(&costs), None).unwrap(), 16.0);
    }

    #[test]
    fn test_prescribed_vars_bypass_regression() {
        let mut sampler = collected();
        let mut estimate = Estimate::new(&mut sampler, monomial(2));
        let vars = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 0.0, 0.25]).unwrap();
        let plan = estimate
            .estimate_n_samples_for_target_variance(0.25, Some(&vars))
            .unwrap();
        // sqrt(v c) = [1, 1]; optimum [8, 2] under caps [8, 2]
        assert_eq!(plan, vec![8, 2]);
    }

    #[test]
    fn test_bootstrap_runs_are_numbered() {
        let mut sampler = collected();
        let mut estimate = Estimate::new(&mut sampler, monomial(2));
        let config = BootstrapConfig {
            n_subsamples: 5,
            seed: Some(4),
            ..BootstrapConfig::default()
        };
        let first = estimate.ref_estimates_bootstrap(&config).unwrap();
        let second = estimate.ref_estimates_bootstrap(&config).unwrap();
        assert_eq!((first.run, second.run), (1, 2));
        assert_eq!(estimate.bootstrap_runs(), 2);
        assert_eq!(first.reference, second.reference);
    }

    #[test]
    fn test_refill_reaches_target() {
        let sims: Vec<LevelSimulation> = [1.0, 0.5]
            .iter()
            .enumerate()
            .map(|(l, &h)| {
                LevelSimulation::new(h, 1.0 + l as f64, move |n, _rng| {
                    // deterministic alternating values with variance close to h^2
                    let fine = Array1::from_iter((0..n).map(|i| if i % 2 == 0 { h } else { -h }));
                    let coarse = Array1::zeros(n);
                    SampleBatch { fine, coarse }
                })
            })
            .collect();
        let mut sampler = MemorySampler::new(sims, 9).unwrap();
        sampler.set_initial_n_samples(&[10, 10]).unwrap();
        let refill = RefillConfig {
            sleep: Duration::from_millis(1),
            timeout: Duration::from_millis(5),
            add_coef: 0.5,
            max_rounds: 50,
        };

        let mut estimate = Estimate::new(&mut sampler, monomial(2));
        let plan = estimate.target_var_adding_samples(0.01, &refill).unwrap();
        let n_samples = estimate.n_samples();
        assert!(plan.iter().zip(&n_samples).all(|(p, n)| p <= n));

        let (_, vars) = estimate.estimate_moments().unwrap();
        assert!(vars[1] <= 0.01 * 1.05);
        assert_abs_diff_eq!(estimate.estimate_moments().unwrap().0[0], 1.0);
    }
}
