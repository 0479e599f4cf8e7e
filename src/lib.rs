//! Statistical core of a Multilevel Monte Carlo method.
//!
//! Given fine/coarse sample pairs on a hierarchy of levels the crate
//! estimates moments of the quantity of interest, smooths per-level
//! variances, allocates samples for a target variance and bootstraps the
//! uncertainty of its own estimators.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mlmc_estimate::{synth, Estimate, Legendre, MemorySampler, Moments};
//!
//! let sims = synth::gaussian_levels(0.0, &[1.0, 0.5, 0.25], 1.0)?;
//! let mut sampler = MemorySampler::new(sims, 7)?;
//! sampler.set_initial_n_samples(&[200, 100, 50])?;
//! let moments: Arc<dyn Moments> = Arc::new(Legendre::new(4, (-4.0, 4.0))?);
//! let mut estimate = Estimate::new(&mut sampler, moments);
//! let plan = estimate.estimate_n_samples_for_target_variance(1e-3, None)?;
//! # Ok::<(), mlmc_estimate::EstimateError>(())
//! ```

pub mod aggregate;
pub mod allocation;
pub mod bootstrap;
pub mod compare;
pub mod density;
pub mod error;
pub mod estimate;
pub mod level;
pub mod moments;
pub mod orthogonal;
pub mod rates;
pub mod reference;
pub mod regression;
pub mod sampler;
pub mod sde;
pub mod synth;
pub mod utility;

pub use allocation::{achieved_variance, n_sample_estimate_moments, Allocation};
pub use bootstrap::{BiasFlag, BootstrapConfig, BootstrapEstimate, Quantities, Quantity};
pub use compare::{common_domain, CompareLevels};
pub use density::{DensityConfig, DensityReconstructor, Distribution, MomentOrthogonalizer};
pub use error::{EstimateError, Result};
pub use estimate::Estimate;
pub use level::{Level, SampleLevel};
pub use moments::{Fourier, Legendre, Moments, Monomial};
pub use orthogonal::{CholeskyOrthogonalizer, OrthogonalInfo, OrthogonalMoments};
pub use rates::ConvergenceRates;
pub use reference::LevelMap;
pub use regression::{RegressionConfig, RegressionModel, VarianceRegression};
pub use sampler::{LevelSimulation, MemorySampler, RefillConfig, SampleBatch, Sampler};
pub use sde::SdeParams;
