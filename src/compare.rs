//! Side by side estimates of the same quantity from hierarchies with
//! different numbers of levels.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::aggregate;
use crate::bootstrap::{BootstrapConfig, BootstrapEstimate};
use crate::density::{DensityConfig, DensityReconstructor, MomentOrthogonalizer};
use crate::error::{EstimateError, Result};
use crate::estimate::Estimate;
use crate::moments::Moments;
use crate::orthogonal::OrthogonalInfo;
use crate::sampler::Sampler;

/// Union of the full sample ranges of every sampler.
pub fn common_domain<S: Sampler>(samplers: &[S]) -> Result<(f64, f64)> {
    if samplers.is_empty() {
        return Err(EstimateError::InvalidState(
            "cannot compare an empty set of samplers".to_string(),
        ));
    }
    samplers.iter().try_fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), sampler| {
        let (l, u) = aggregate::estimate_domain(sampler.levels(), None)?;
        Ok((lo.min(l), hi.max(u)))
    })
}

/// One [`Estimate`] per sampler, all sharing a basis on a common domain and
/// keyed by their number of levels.
pub struct CompareLevels<'a, S: Sampler> {
    domain: (f64, f64),
    moments: Arc<dyn Moments>,
    estimates: BTreeMap<usize, Estimate<'a, S>>,
}

impl<'a, S: Sampler> CompareLevels<'a, S> {
    /// `basis` builds the shared moments on `domain`, or on the common domain
    /// of the samplers when `domain` is `None`. Two samplers with the same
    /// number of levels are rejected.
    pub fn new<F>(samplers: &'a mut [S], domain: Option<(f64, f64)>, basis: F) -> Result<Self>
    where
        F: FnOnce((f64, f64)) -> Result<Arc<dyn Moments>>,
    {
        let domain = match domain {
            Some(domain) => domain,
            None => common_domain(samplers)?,
        };
        let moments = basis(domain)?;

        let mut estimates = BTreeMap::new();
        for sampler in samplers {
            let n_levels = sampler.n_levels();
            if estimates.contains_key(&n_levels) {
                return Err(EstimateError::InvalidParameter(format!(
                    "two samplers with {} levels",
                    n_levels
                )));
            }
            estimates.insert(n_levels, Estimate::new(sampler, Arc::clone(&moments)));
        }
        Ok(Self {
            domain,
            moments,
            estimates,
        })
    }

    pub fn domain(&self) -> (f64, f64) {
        self.domain
    }

    pub fn moments(&self) -> &Arc<dyn Moments> {
        &self.moments
    }

    /// Level counts present, ascending.
    pub fn n_levels(&self) -> Vec<usize> {
        self.estimates.keys().copied().collect()
    }

    pub fn get(&self, n_levels: usize) -> Option<&Estimate<'a, S>> {
        self.estimates.get(&n_levels)
    }

    pub fn get_mut(&mut self, n_levels: usize) -> Option<&mut Estimate<'a, S>> {
        self.estimates.get_mut(&n_levels)
    }

    /// Collected samples per level of every hierarchy.
    pub fn collected(&self) -> BTreeMap<usize, Vec<usize>> {
        self.estimates
            .iter()
            .map(|(&n_levels, estimate)| (n_levels, estimate.n_samples()))
            .collect()
    }

    /// Builds a density for every hierarchy.
    pub fn construct_densities(
        &mut self,
        reconstructor: &dyn DensityReconstructor,
        orthogonalizer: &dyn MomentOrthogonalizer,
        config: &DensityConfig,
    ) -> Result<BTreeMap<usize, OrthogonalInfo>> {
        let mut infos = BTreeMap::new();
        for (&n_levels, estimate) in self.estimates.iter_mut() {
            let info = estimate.construct_density(reconstructor, orthogonalizer, config)?;
            info!(n_levels, size = info.size, "density for hierarchy");
            infos.insert(n_levels, info);
        }
        Ok(infos)
    }

    pub fn ref_estimates_bootstrap(&mut self, config: &BootstrapConfig) -> Result<BTreeMap<usize, BootstrapEstimate>> {
        self.estimates
            .iter_mut()
            .map(|(&n_levels, estimate)| Ok((n_levels, estimate.ref_estimates_bootstrap(config)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::Distribution;
    use crate::moments::Legendre;
    use crate::orthogonal::CholeskyOrthogonalizer;
    use crate::sampler::MemorySampler;
    use crate::synth;
    use ndarray::Array2;

    #[derive(Debug)]
    struct Flat;

    impl Distribution for Flat {
        fn density(&self, _x: f64) -> f64 {
            1.0
        }

        fn cdf(&self, x: f64) -> f64 {
            x.clamp(0.0, 1.0)
        }
    }

    struct FlatReconstructor;

    impl DensityReconstructor for FlatReconstructor {
        fn reconstruct(
            &self,
            _moments: Arc<dyn Moments>,
            _moments_data: &Array2<f64>,
            _domain: (f64, f64),
            _tol: f64,
            _reg_param: f64,
        ) -> Result<Box<dyn Distribution>> {
            Ok(Box::new(Flat))
        }
    }

    fn hierarchy(steps: &[f64], seed: u64) -> MemorySampler {
        let sims = synth::gaussian_levels(0.5, steps, 1.0).unwrap();
        let mut sampler = MemorySampler::new(sims, seed).unwrap();
        sampler.set_initial_n_samples(&vec![200; steps.len()]).unwrap();
        sampler
    }

    fn legendre(domain: (f64, f64)) -> Result<Arc<dyn Moments>> {
        Ok(Arc::new(Legendre::new(3, domain)?))
    }

    #[test]
    fn test_estimates_keyed_by_level_count() {
        let mut samplers = vec![hierarchy(&[1.0, 0.5], 1), hierarchy(&[1.0, 0.5, 0.25], 2)];
        let union = common_domain(&samplers).unwrap();
        let each: Vec<(f64, f64)> = samplers
            .iter()
            .map(|s| aggregate::estimate_domain(s.levels(), None).unwrap())
            .collect();
        assert_eq!(union.0, each[0].0.min(each[1].0));
        assert_eq!(union.1, each[0].1.max(each[1].1));

        let mut compare = CompareLevels::new(&mut samplers, None, legendre).unwrap();
        assert_eq!(compare.domain(), union);
        assert_eq!(compare.moments().domain(), union);
        assert_eq!(compare.n_levels(), vec![2, 3]);
        assert_eq!(compare.collected()[&3], vec![200; 3]);
        assert!(compare.get(4).is_none());

        for n_levels in [2, 3] {
            let (means, _) = compare.get(n_levels).unwrap().estimate_moments().unwrap();
            assert_eq!(means[0], 1.0);
        }

        let infos = compare
            .construct_densities(&FlatReconstructor, &CholeskyOrthogonalizer, &DensityConfig::default())
            .unwrap();
        assert_eq!(infos.len(), 2);
        assert!(compare.get(2).unwrap().distribution().is_ok());
        assert!(compare.get_mut(3).unwrap().approx_pdf(&[0.0]).is_ok());
    }

    #[test]
    fn test_prescribed_domain_and_bootstrap() {
        let mut samplers = vec![hierarchy(&[1.0, 0.5], 3), hierarchy(&[1.0], 4)];
        let mut compare = CompareLevels::new(&mut samplers, Some((-6.0, 6.0)), legendre).unwrap();
        assert_eq!(compare.domain(), (-6.0, 6.0));
        let results = compare
            .ref_estimates_bootstrap(&BootstrapConfig {
                n_subsamples: 10,
                seed: Some(5),
                ..BootstrapConfig::default()
            })
            .unwrap();
        assert_eq!(results.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(results[&1].run, 1);
    }

    #[test]
    fn test_rejects_duplicate_and_empty() {
        let mut samplers = vec![hierarchy(&[1.0, 0.5], 5), hierarchy(&[1.0, 0.5], 6)];
        assert!(matches!(
            CompareLevels::new(&mut samplers, None, legendre),
            Err(EstimateError::InvalidParameter(_))
        ));
        let empty: Vec<MemorySampler> = Vec::new();
        assert!(matches!(common_domain(&empty), Err(EstimateError::InvalidState(_))));
    }
}
