//! A small SMC demo: estimates the posterior and the model evidence of a conjugate
//! Gaussian model and compares both with their closed forms.

use mini_smc::distributions::{GaussianLogLikelihood, GaussianLogPrior, LogPosterior};
use mini_smc::evaluator::ParallelEvaluator;
use mini_smc::smc::{SmcConfig, SmcSampler};
use mini_smc::stats;
use nalgebra::DMatrix;
use std::error::Error;
use std::f64::consts::PI;

/// Closed-form log evidence, posterior mean and posterior variance of one coordinate
/// under `y_i ~ N(x, σ²)`, `x ~ N(μ₀, τ²)`.
fn conjugate_normal(ys: &[f64], sigma: f64, mu0: f64, tau: f64) -> (f64, f64, f64) {
    let n = ys.len() as f64;
    let (s2, t2) = (sigma * sigma, tau * tau);
    let sum_y: f64 = ys.iter().sum();
    let sum_y2: f64 = ys.iter().map(|y| y * y).sum();
    let post_var = 1.0 / (n / s2 + 1.0 / t2);
    let post_mean = post_var * (sum_y / s2 + mu0 / t2);
    let log_z = -0.5 * n * (2.0 * PI * s2).ln() + 0.5 * (post_var / t2).ln()
        - 0.5 * (sum_y2 / s2 + mu0 * mu0 / t2 - post_mean * post_mean / post_var);
    (log_z, post_mean, post_var)
}

fn main() -> Result<(), Box<dyn Error>> {
    const N_PARTICLES: usize = 2000;
    const N_TEMPERATURES: usize = 30;
    const SEED: u64 = 42;
    const SIGMA: f64 = 0.8;

    let observations = vec![
        vec![1.2, -0.4],
        vec![0.7, -0.9],
        vec![1.5, -0.2],
        vec![0.9, -0.6],
        vec![1.1, -0.8],
        vec![1.4, -0.3],
    ];
    let prior = GaussianLogPrior::isotropic(2, 0.0, 2.0)?;
    let likelihood = GaussianLogLikelihood::new(observations.clone(), SIGMA)?;
    let posterior = LogPosterior::new(likelihood, prior.clone())?;

    let mut smc = SmcSampler::new(prior, posterior)?
        .with_evaluator(ParallelEvaluator::with_available_parallelism()?)
        .set_seed(SEED);
    smc.configure(
        SmcConfig::new()
            .with_particles(N_PARTICLES)
            .with_schedule(N_TEMPERATURES)
            .with_mutation_steps(3),
    )?;
    smc.initialize(&[0.0, 0.0], Some(&(DMatrix::identity(2, 2) * 4.0)))?;

    let samples = smc.run_with_progress()?;
    println!("Generated {} posterior samples", samples.nrows());

    let sample_mean = stats::mean(&samples);
    let sample_cov = stats::cov(&samples).ok_or("too few posterior samples")?;
    let mut analytic_log_z = 0.0;
    for d in 0..2 {
        let ys: Vec<f64> = observations.iter().map(|y| y[d]).collect();
        let (log_z, mean, var) = conjugate_normal(&ys, SIGMA, 0.0, 2.0);
        analytic_log_z += log_z;
        println!(
            "dim {d}: posterior mean {:.3} (exact {:.3}), variance {:.4} (exact {:.4})",
            sample_mean[d],
            mean,
            sample_cov[(d, d)],
            var
        );
    }
    println!(
        "log evidence: {:.3} ± {:.3} (exact {:.3})",
        smc.log_evidence()?,
        smc.log_evidence_stddev()?,
        analytic_log_z
    );
    println!(
        "resampled {} times, {} density evaluations",
        smc.run_state().n_resamples,
        smc.run_state().n_evaluations
    );

    #[cfg(feature = "csv")]
    {
        mini_smc::io::csv::save_samples_csv(&samples, "/tmp/smc_demo_samples.csv")?;
        mini_smc::io::csv::save_history_csv(
            smc.run_state(),
            smc.schedule(),
            "/tmp/smc_demo_history.csv",
        )?;
        println!("Saved samples and run history to /tmp");
    }

    Ok(())
}
