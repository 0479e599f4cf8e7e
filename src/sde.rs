//! Coupled Euler–Maruyama levels for `dX = -X^p dt + sqrt(2) σ dW` on `[0, T]`.
//!
//! Level `l` takes `2^l` fine steps. Its coarse path takes half as many steps,
//! each driven by the sum of the two fine Brownian increments it spans, so
//! fine and coarse endpoints stay strongly correlated.

use ndarray::Array1;
use ndarray_rand::rand::RngCore;
use ndarray_rand::rand_distr::{Distribution, StandardNormal};

use crate::error::{EstimateError, Result};
use crate::sampler::{LevelSimulation, SampleBatch};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SdeParams {
    /// Power of the drift.
    pub p: f64,
    /// Final time.
    pub t: f64,
    pub sig: f64,
    pub x0: f64,
}

impl Default for SdeParams {
    fn default() -> Self {
        Self {
            p: 1.0,
            t: 0.1,
            sig: 1.0,
            x0: 1.2,
        }
    }
}

impl SdeParams {
    fn validate(&self) -> Result<()> {
        if !(self.t > 0.0 && self.t.is_finite()) {
            return Err(EstimateError::InvalidParameter(format!(
                "final time must be positive, got {}",
                self.t
            )));
        }
        if !(self.sig >= 0.0 && self.p.is_finite() && self.x0.is_finite()) {
            return Err(EstimateError::InvalidParameter(format!("invalid SDE parameters {:?}", self)));
        }
        Ok(())
    }

    fn advance(&self, x: f64, h: f64, dw: f64) -> f64 {
        x - x.powf(self.p) * h + 2.0f64.sqrt() * self.sig * dw
    }
}

/// Fine step of level `level`.
pub fn level_step(level: usize, params: &SdeParams) -> f64 {
    params.t / (1u64 << level) as f64
}

/// `n` coupled endpoints of level `level`. On level 0 the coarse values are
/// zero.
pub fn euler_maruyama(level: usize, n: usize, params: &SdeParams, rng: &mut dyn RngCore) -> SampleBatch {
    let nf = 1usize << level;
    let hf = params.t / nf as f64;

    let mut xf = Array1::<f64>::from_elem(n, params.x0);
    let mut generate_increments = |n: usize| -> Array1<f64> {
        Array1::from_iter((0..n).map(|_| {
            let z: f64 = StandardNormal.sample(&mut *rng);
            z * hf.sqrt()
        }))
    };

    if level == 0 {
        let dwf = generate_increments(n);
        xf.zip_mut_with(&dwf, |x, &dw| *x = params.advance(*x, hf, dw));
        return SampleBatch {
            fine: xf,
            coarse: Array1::zeros(n),
        };
    }

    let hc = 2.0 * hf;
    let mut xc = Array1::<f64>::from_elem(n, params.x0);
    for _ in 0..nf / 2 {
        let dwf0 = generate_increments(n);
        let dwf1 = generate_increments(n);
        for i in 0..n {
            xf[i] = params.advance(xf[i], hf, dwf0[i]);
            xf[i] = params.advance(xf[i], hf, dwf1[i]);
            xc[i] = params.advance(xc[i], hc, dwf0[i] + dwf1[i]);
        }
    }
    SampleBatch { fine: xf, coarse: xc }
}

/// Simulations of levels `0 .. n_levels`, each costing its number of fine
/// steps.
pub fn level_simulations(params: SdeParams, n_levels: usize) -> Result<Vec<LevelSimulation>> {
    params.validate()?;
    if n_levels == 0 || n_levels > 32 {
        return Err(EstimateError::InvalidParameter(format!(
            "number of SDE levels must be in 1..=32, got {}",
            n_levels
        )));
    }
    Ok((0..n_levels)
        .map(|level| {
            let n_ops = (1u64 << level) as f64;
            LevelSimulation::new(level_step(level, &params), n_ops, move |n, rng| {
                euler_maruyama(level, n, &params, rng)
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_level_zero_has_no_coarse_path() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let batch = euler_maruyama(0, 100, &SdeParams::default(), &mut rng);
        assert_eq!(batch.fine.len(), 100);
        assert!(batch.coarse.iter().all(|&c| c == 0.0));
        assert!(batch.fine.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn test_coupling_shrinks_differences() {
        let params = SdeParams::default();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let diff_var = |level: usize, rng: &mut ChaCha8Rng| {
            let batch = euler_maruyama(level, 2000, &params, rng);
            (&batch.fine - &batch.coarse).var(1.0)
        };
        let v1 = diff_var(1, &mut rng);
        let v3 = diff_var(3, &mut rng);
        let fine = euler_maruyama(1, 2000, &params, &mut rng).fine;
        assert!(v1 < fine.var(1.0));
        assert!(v3 < v1);
    }

    #[test]
    fn test_level_simulations() {
        let sims = level_simulations(SdeParams::default(), 3).unwrap();
        let steps: Vec<f64> = sims.iter().map(LevelSimulation::step).collect();
        assert_eq!(steps, vec![0.1, 0.05, 0.025]);
        assert_eq!(sims[2].n_ops(), 4.0);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        assert_eq!(sims[1].sample(7, &mut rng).coarse.len(), 7);
        assert!(level_simulations(SdeParams::default(), 0).is_err());
    }
}
