//! The sampling subsystem seen by the estimator, and an in-memory
//! implementation driven by per-level simulation functions.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ndarray::Array1;
use ndarray_rand::rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::error::{EstimateError, Result};
use crate::level::{Level, SampleLevel};
use crate::moments::Moments;

/// Parameters of the iterative refill loop.
#[derive(Debug, Clone)]
pub struct RefillConfig {
    /// Poll interval while waiting for scheduled samples.
    pub sleep: Duration,
    /// Longest single wait; running out is not an error.
    pub timeout: Duration,
    /// Fraction of the gap between scheduled and estimated counts added per round.
    pub add_coef: f64,
    /// Rounds after which the loop gives up waiting for a fixed point.
    pub max_rounds: usize,
}

impl Default for RefillConfig {
    fn default() -> Self {
        Self {
            sleep: Duration::from_secs(20),
            timeout: Duration::from_secs(600),
            add_coef: 0.1,
            max_rounds: 100,
        }
    }
}

/// Source of levels and resamples for the estimator.
pub trait Sampler {
    type Level: Level;

    /// Levels ordered from coarsest (index 0) to finest.
    fn levels(&self) -> &[Self::Level];

    fn n_levels(&self) -> usize {
        self.levels().len()
    }

    fn n_samples(&self) -> Vec<usize> {
        self.levels().iter().map(Level::n_samples).collect()
    }

    /// Step sizes, strictly decreasing with the level index.
    fn sim_steps(&self) -> Vec<f64> {
        self.levels().iter().map(Level::step).collect()
    }

    /// Makes every level expose `sample_vector[l]` draws, with replacement,
    /// from its stored samples.
    fn subsample(&mut self, sample_vector: &[usize], rng: &mut dyn RngCore) -> Result<()>;

    /// Restores the full view on every level.
    fn clean_subsamples(&mut self);

    /// Tags the stored data with `moments`, so later estimates with the same
    /// object reuse the evaluations.
    fn update_moments(&mut self, moments: &Arc<dyn Moments>);

    /// Moves the schedule toward `plan`, waits for the samples, and reports
    /// whether the schedule now covers the plan on every level.
    fn process_adding_samples(&mut self, plan: &[usize], refill: &RefillConfig) -> Result<bool>;
}

/// Polls `done` every `sleep` until it holds or `timeout` has elapsed.
/// Returns the last value of `done`.
pub fn poll_until<F>(mut done: F, sleep: Duration, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if done() {
            return true;
        }
        if start.elapsed() >= timeout {
            debug!(?timeout, "stopped waiting for samples");
            return false;
        }
        thread::sleep(sleep.min(timeout.saturating_sub(start.elapsed())));
    }
}

/// `n` fine/coarse pairs from one level.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    pub fine: Array1<f64>,
    pub coarse: Array1<f64>,
}

pub type SampleFn = Box<dyn Fn(usize, &mut dyn RngCore) -> SampleBatch + Send + Sync>;

/// Sample generator of one level: its step, cost and a sampling function
/// built once with everything it needs captured by value.
pub struct LevelSimulation {
    step: f64,
    n_ops: f64,
    sample_fn: SampleFn,
}

impl LevelSimulation {
    pub fn new<F>(step: f64, n_ops: f64, sample_fn: F) -> Self
    where
        F: Fn(usize, &mut dyn RngCore) -> SampleBatch + Send + Sync + 'static,
    {
        Self {
            step,
            n_ops,
            sample_fn: Box::new(sample_fn),
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn n_ops(&self) -> f64 {
        self.n_ops
    }

    pub fn sample(&self, n: usize, rng: &mut dyn RngCore) -> SampleBatch {
        (self.sample_fn)(n, rng)
    }
}

impl fmt::Debug for LevelSimulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelSimulation")
            .field("step", &self.step)
            .field("n_ops", &self.n_ops)
            .finish_non_exhaustive()
    }
}

fn check_steps(steps: &[f64]) -> Result<()> {
    if let Some(w) = steps.windows(2).find(|w| w[1] >= w[0]) {
        return Err(EstimateError::InvalidParameter(format!(
            "level steps must strictly decrease, got {} followed by {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

/// Initial per-level counts interpolated geometrically from `first` on level 0
/// to `last` on the finest level.
pub fn initial_n_samples(n_levels: usize, first: usize, last: usize) -> Vec<usize> {
    if n_levels == 1 {
        return vec![first];
    }
    let (a, b) = ((first.max(1) as f64).log2(), (last.max(1) as f64).log2());
    (0..n_levels)
        .map(|l| {
            let t = l as f64 / (n_levels - 1) as f64;
            (a + (b - a) * t).exp2().round() as usize
        })
        .collect()
}

/// Sampler keeping every sample in memory, generating new ones synchronously
/// from its level simulations.
#[derive(Debug)]
pub struct MemorySampler {
    levels: Vec<SampleLevel>,
    simulations: Vec<LevelSimulation>,
    scheduled: Vec<usize>,
    rng: ChaCha8Rng,
}

impl MemorySampler {
    pub fn new(simulations: Vec<LevelSimulation>, seed: u64) -> Result<Self> {
        let steps: Vec<f64> = simulations.iter().map(LevelSimulation::step).collect();
        check_steps(&steps)?;
        let levels = simulations
            .iter()
            .enumerate()
            .map(|(l, sim)| SampleLevel::new(l, sim.step(), sim.n_ops()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            scheduled: vec![0; levels.len()],
            levels,
            simulations,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Sampler over already collected levels; it cannot add samples.
    pub fn from_levels(levels: Vec<SampleLevel>) -> Result<Self> {
        let steps: Vec<f64> = levels.iter().map(Level::step).collect();
        check_steps(&steps)?;
        if let Some(level) = levels.iter().enumerate().find(|(l, level)| level.index() != *l) {
            return Err(EstimateError::InvalidParameter(format!(
                "level at position {} has index {}",
                level.0,
                level.1.index()
            )));
        }
        Ok(Self {
            scheduled: levels.iter().map(SampleLevel::n_collected).collect(),
            levels,
            simulations: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(0),
        })
    }

    pub fn scheduled(&self) -> &[usize] {
        &self.scheduled
    }

    pub fn levels_mut(&mut self) -> &mut [SampleLevel] {
        &mut self.levels
    }

    /// Generates `n` new samples on `level`.
    pub fn add_samples(&mut self, level: usize, n: usize) -> Result<()> {
        let sim = self.simulations.get(level).ok_or_else(|| {
            EstimateError::InvalidState(format!("no simulation attached to level {}", level))
        })?;
        let batch = sim.sample(n, &mut self.rng);
        if batch.fine.len() != n {
            return Err(EstimateError::ShapeMismatch {
                what: "simulated batch",
                expected: n,
                found: batch.fine.len(),
            });
        }
        let fine = batch.fine.to_vec();
        let coarse = batch.coarse.to_vec();
        self.levels[level].append(&fine, &coarse)?;
        self.scheduled[level] = self.scheduled[level].max(self.levels[level].n_collected());
        Ok(())
    }

    /// Brings every level up to at least `n_samples[l]` samples.
    pub fn set_initial_n_samples(&mut self, n_samples: &[usize]) -> Result<()> {
        if n_samples.len() != self.levels.len() {
            return Err(EstimateError::ShapeMismatch {
                what: "initial sample counts",
                expected: self.levels.len(),
                found: n_samples.len(),
            });
        }
        for (l, &n) in n_samples.iter().enumerate() {
            let missing = n.saturating_sub(self.levels[l].n_collected());
            if missing > 0 {
                self.add_samples(l, missing)?;
            }
        }
        Ok(())
    }

    fn collect_scheduled(&mut self) -> Result<()> {
        for l in 0..self.levels.len() {
            let missing = self.scheduled[l].saturating_sub(self.levels[l].n_collected());
            if missing > 0 {
                self.add_samples(l, missing)?;
            }
        }
        Ok(())
    }
}

impl Sampler for MemorySampler {
    type Level = SampleLevel;

    fn levels(&self) -> &[SampleLevel] {
        &self.levels
    }

    fn subsample(&mut self, sample_vector: &[usize], rng: &mut dyn RngCore) -> Result<()> {
        if sample_vector.len() != self.levels.len() {
            return Err(EstimateError::ShapeMismatch {
                what: "bootstrap sample vector",
                expected: self.levels.len(),
                found: sample_vector.len(),
            });
        }
        for (level, &size) in self.levels.iter_mut().zip(sample_vector) {
            level.subsample(size, rng)?;
        }
        Ok(())
    }

    fn clean_subsamples(&mut self) {
        for level in &mut self.levels {
            level.clean_subsample();
        }
    }

    fn update_moments(&mut self, moments: &Arc<dyn Moments>) {
        for level in &mut self.levels {
            level.update_moments(moments);
        }
    }

    fn process_adding_samples(&mut self, plan: &[usize], refill: &RefillConfig) -> Result<bool> {
        if plan.len() != self.levels.len() {
            return Err(EstimateError::ShapeMismatch {
                what: "sample plan",
                expected: self.levels.len(),
                found: plan.len(),
            });
        }

        let mut next = self.scheduled.clone();
        for (l, &estimated) in plan.iter().enumerate() {
            let (est, sched) = (estimated as f64, self.scheduled[l] as f64);
            if est <= sched {
                continue;
            }
            let step = if est * refill.add_coef > est - sched {
                est
            } else {
                sched + (est - sched) * refill.add_coef
            };
            next[l] = step.ceil() as usize;
        }

        if next != self.scheduled {
            info!(scheduled = ?next, estimated = ?plan, "scheduling additional samples");
        }
        self.scheduled = next;
        self.collect_scheduled()?;

        let levels = &self.levels;
        let scheduled = &self.scheduled;
        poll_until(
            || levels.iter().zip(scheduled).all(|(level, &n)| level.n_collected() >= n),
            refill.sleep,
            refill.timeout,
        );

        Ok(plan.iter().zip(&self.scheduled).all(|(est, sched)| est <= sched))
    }
}
