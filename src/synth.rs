//! Gaussian levels with known statistics.
//!
//! Every fine value is `N(μ, h_0²)`. On level `l > 0` the coarse value is the
//! fine one minus an independent `N(0, h_l²)` term, so the level difference
//! has mean 0 and variance `h_l²` and the telescoping sum has mean `μ`.

use ndarray::Array1;
use ndarray_rand::rand_distr::{Distribution, StandardNormal};

use crate::error::{EstimateError, Result};
use crate::sampler::{LevelSimulation, SampleBatch};

/// One simulation per entry of `steps`, costing `h^-cost_rate` per sample.
pub fn gaussian_levels(mean: f64, steps: &[f64], cost_rate: f64) -> Result<Vec<LevelSimulation>> {
    let sigma = *steps
        .first()
        .ok_or_else(|| EstimateError::InvalidParameter("no level steps given".to_string()))?;
    if let Some(h) = steps.iter().find(|h| !(**h > 0.0 && h.is_finite())) {
        return Err(EstimateError::InvalidParameter(format!(
            "level step must be positive, got {}",
            h
        )));
    }

    Ok(steps
        .iter()
        .enumerate()
        .map(|(l, &h)| {
            LevelSimulation::new(h, h.powf(-cost_rate), move |n, rng| {
                let fine = Array1::from_iter((0..n).map(|_| {
                    let z: f64 = StandardNormal.sample(&mut *rng);
                    mean + sigma * z
                }));
                let coarse = if l == 0 {
                    Array1::zeros(n)
                } else {
                    fine.mapv(|x| {
                        let z: f64 = StandardNormal.sample(&mut *rng);
                        x - h * z
                    })
                };
                SampleBatch { fine, coarse }
            })
        })
        .collect())
}
