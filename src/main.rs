use std::sync::Arc;
use std::time::Duration;

use mlmc_estimate::sampler::initial_n_samples;
use mlmc_estimate::{sde, BootstrapConfig, Estimate, Legendre, MemorySampler, Moments, RefillConfig, Result, SdeParams};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let n_levels = 4;
    let target_variance = 1e-5;
    let params = SdeParams::default();

    let mut sampler = MemorySampler::new(sde::level_simulations(params, n_levels)?, 2024)?;
    sampler.set_initial_n_samples(&initial_n_samples(n_levels, 200, 20))?;

    let domain = {
        let probe: Arc<dyn Moments> = Arc::new(Legendre::new(1, (0.0, 1.0))?);
        Estimate::new(&mut sampler, probe).estimate_domain(Some(0.001))?
    };
    info!(?domain, "estimated domain");
    let moments: Arc<dyn Moments> = Arc::new(Legendre::new(5, domain)?);

    let mut estimate = Estimate::new(&mut sampler, moments);
    let refill = RefillConfig {
        sleep: Duration::from_millis(10),
        timeout: Duration::from_secs(1),
        ..RefillConfig::default()
    };
    let plan = estimate.target_var_adding_samples(target_variance, &refill)?;

    let (means, vars) = estimate.estimate_moments()?;
    let cost = estimate.estimate_cost(None, None)?;
    println!("Samples per level: {:?}", estimate.n_samples());
    println!("Final plan: {:?}", plan);
    println!("Moment means: {:.6}", means);
    println!("Moment variances: {:.3e}", vars);
    println!("MLMC cost: {:.1}", cost);

    if let Ok(rates) = estimate.estimate_rates(1) {
        println!("Rates: alpha {:.2}, beta {:.2}, gamma {:.2}", rates.alpha, rates.beta, rates.gamma);
    }

    let bootstrap = estimate.ref_estimates_bootstrap(&BootstrapConfig {
        n_subsamples: 100,
        seed: Some(7),
        ..BootstrapConfig::default()
    })?;
    println!("Bootstrap variance of means: {:.3e}", bootstrap.var.mean);
    println!("Bias flags: {}", bootstrap.bias.len());
    Ok(())
}
