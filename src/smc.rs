/*!
# Sequential Monte Carlo Sampler

This module implements an SMC sampler with likelihood tempering (Del Moral, Doucet &
Jasra, 2006). A population of weighted particles is moved through a sequence of
targets

\[
\pi_\beta(x) \propto p(x)^{1-\beta}\, \pi(x)^{\beta}, \qquad 0 = \beta_0 \le \dots \le \beta_T = 1,
\]

where `p` is the prior and `π` the posterior. At every temperature the sampler

1. resamples when the effective sample size drops below a threshold (and,
   optionally, at the fixed points of the algorithm),
2. moves every particle with its own MCMC [`MutationKernel`],
3. reweights the particles towards the next temperature, accumulating the
   log-evidence on the way.

All randomness comes from a single seedable generator owned by the sampler, so
runs are reproducible whichever [`Evaluator`] is used.

## Example Usage

```rust
use mini_smc::distributions::{GaussianLogLikelihood, GaussianLogPrior, LogPosterior};
use mini_smc::smc::{SmcConfig, SmcSampler};

let prior = GaussianLogPrior::isotropic(1, 0.0, 1.0).unwrap();
let likelihood = GaussianLogLikelihood::new(vec![vec![0.5], vec![1.5]], 1.0).unwrap();
let posterior = LogPosterior::new(likelihood, prior.clone()).unwrap();

let mut smc = SmcSampler::new(prior, posterior).unwrap().set_seed(42);
smc.configure(SmcConfig::new().with_particles(100).with_schedule(5usize)).unwrap();
smc.initialize(&[0.0], None).unwrap();

let samples = smc.run().unwrap();
assert_eq!(samples.nrows(), 100);
assert!(smc.log_evidence().unwrap().is_finite());
```
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use nalgebra as na;
use rand::prelude::*;

use crate::distributions::LogDensity;
use crate::error::{Result, SmcError};
use crate::evaluator::{Evaluator, SequentialEvaluator};
use crate::kernel::{cholesky_factor, gaussian_draw, AdaptiveCovariance, MutationKernel};
use crate::population::{EvidenceIncrement, Particle, ParticlePopulation, ResamplingScheme};
use crate::schedule::{ScheduleSpec, TemperatureSchedule};

/// Smallest accepted number of particles is one more than this.
pub const MIN_PARTICLES: usize = 10;

/**
Run settings for an [`SmcSampler`].

Setters can be chained; nothing is checked until [`SmcConfig::validate`] (called by
[`SmcSampler::configure`]).

# Examples

```rust
use mini_smc::smc::SmcConfig;

let config = SmcConfig::new()
    .with_particles(500)
    .with_schedule(vec![0.0, 0.1, 0.5, 1.0])
    .with_ess_threshold(100.0)
    .with_mutation_steps(2);
assert!(config.validate().is_ok());
assert!(SmcConfig::new().with_particles(5).validate().is_err());
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct SmcConfig {
    /// Number of particles; must exceed [`MIN_PARTICLES`].
    pub n_particles: usize,
    /// Temperature schedule, as a count or explicit values.
    pub schedule: ScheduleSpec,
    /// ESS below which the population is resampled. `None` means half the particles.
    pub ess_threshold: Option<f64>,
    /// Also resample at the end of steps 2 and 3 of every iteration.
    pub resample_at_fixed_points: bool,
    /// MCMC steps per particle at each temperature.
    pub mutation_steps: usize,
    /// How resampling draws ancestors.
    pub resampling: ResamplingScheme,
    /// Number of posterior draws returned by `run`. `None` means one per particle.
    pub posterior_samples: Option<usize>,
}

impl Default for SmcConfig {
    fn default() -> Self {
        Self {
            n_particles: 1000,
            schedule: ScheduleSpec::default(),
            ess_threshold: None,
            resample_at_fixed_points: true,
            mutation_steps: 1,
            resampling: ResamplingScheme::default(),
            posterior_samples: None,
        }
    }
}

impl SmcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_particles(mut self, n_particles: usize) -> Self {
        self.n_particles = n_particles;
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<ScheduleSpec>) -> Self {
        self.schedule = schedule.into();
        self
    }

    pub fn with_ess_threshold(mut self, ess_threshold: f64) -> Self {
        self.ess_threshold = Some(ess_threshold);
        self
    }

    pub fn with_resample_at_fixed_points(mut self, resample: bool) -> Self {
        self.resample_at_fixed_points = resample;
        self
    }

    pub fn with_mutation_steps(mut self, mutation_steps: usize) -> Self {
        self.mutation_steps = mutation_steps;
        self
    }

    pub fn with_resampling(mut self, resampling: ResamplingScheme) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn with_posterior_samples(mut self, n: usize) -> Self {
        self.posterior_samples = Some(n);
        self
    }

    /// ESS threshold in effect.
    pub fn effective_ess_threshold(&self) -> f64 {
        self.ess_threshold.unwrap_or(self.n_particles as f64 / 2.0)
    }

    /// Checks every setting and builds the temperature schedule.
    pub fn validate(&self) -> Result<TemperatureSchedule> {
        if self.n_particles <= MIN_PARTICLES {
            return Err(SmcError::config(format!(
                "must have more than {MIN_PARTICLES} particles, got {}",
                self.n_particles
            )));
        }
        let threshold = self.effective_ess_threshold();
        if !(threshold > 0.0 && threshold <= self.n_particles as f64) {
            return Err(SmcError::config(format!(
                "ESS threshold must lie in (0, {}], got {threshold}",
                self.n_particles
            )));
        }
        if self.mutation_steps < 1 {
            return Err(SmcError::config(
                "number of MCMC steps per temperature must be >= 1",
            ));
        }
        TemperatureSchedule::from_spec(&self.schedule)
    }
}

/// Lifecycle of an [`SmcSampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Uninitialized,
    Initialized,
    Running,
    Complete,
    /// A run was cancelled or failed; `initialize` must be called again.
    Interrupted,
}

/// Scalar aggregates of a run, updated once per temperature.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    /// Running log-evidence estimate.
    pub log_evidence: f64,
    /// Accumulated variance of `log_evidence`.
    pub log_evidence_variance: f64,
    /// Index of the last temperature processed.
    pub iteration: usize,
    /// ESS after each reweighting, starting with initialisation.
    pub ess_history: Vec<f64>,
    /// Mean acceptance rate of the mutation step at each temperature.
    pub acceptance_rates: Vec<f64>,
    /// Whether the population was resampled during each temperature.
    pub resampled: Vec<bool>,
    /// Total number of resampling events.
    pub n_resamples: usize,
    /// Total number of log-density evaluations (prior and posterior counted separately).
    pub n_evaluations: usize,
}

impl RunState {
    pub fn log_evidence_stddev(&self) -> f64 {
        self.log_evidence_variance.sqrt()
    }

    fn fold(&mut self, increment: EvidenceIncrement) {
        self.log_evidence += increment.log_ratio;
        self.log_evidence_variance += increment.variance;
        self.ess_history.push(increment.ess);
    }
}

/// Cooperative cancellation flag, checked by the run loop between temperatures.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/**
The SMC sampler, parameterized by:
- `P`: the prior log-density,
- `L`: the posterior log-density (prior plus likelihood),
- `K`: the mutation kernel, one instance per particle,
- `E`: the batch evaluator.

The sampler exclusively owns its particle population, the kernels, and the random
number generator.
*/
pub struct SmcSampler<P, L, K = AdaptiveCovariance, E = SequentialEvaluator> {
    prior: P,
    posterior: L,
    evaluator: E,
    config: SmcConfig,
    schedule: TemperatureSchedule,
    population: Option<ParticlePopulation>,
    kernels: Vec<K>,
    run_state: RunState,
    state: SamplerState,
    seed: u64,
    rng: SmallRng,
    cancel: CancelHandle,
}

impl<P, L> SmcSampler<P, L>
where
    P: LogDensity,
    L: LogDensity,
{
    /**
    Creates a sampler with the default configuration, the [`AdaptiveCovariance`]
    kernel, and sequential evaluation.

    Fails if the prior and posterior disagree on the dimension.
    */
    pub fn new(prior: P, posterior: L) -> Result<Self> {
        if prior.dimension() != posterior.dimension() {
            return Err(SmcError::config(format!(
                "prior has dimension {} but posterior has dimension {}",
                prior.dimension(),
                posterior.dimension()
            )));
        }
        if prior.dimension() == 0 {
            return Err(SmcError::config("parameter space must have at least one dimension"));
        }
        let config = SmcConfig::default();
        let schedule = config.validate()?;
        let seed = thread_rng().gen::<u64>();
        Ok(Self {
            prior,
            posterior,
            evaluator: SequentialEvaluator,
            config,
            schedule,
            population: None,
            kernels: Vec::new(),
            run_state: RunState::default(),
            state: SamplerState::Uninitialized,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            cancel: CancelHandle::default(),
        })
    }
}

impl<P, L, K, E> SmcSampler<P, L, K, E>
where
    P: LogDensity,
    L: LogDensity,
    K: MutationKernel,
    E: Evaluator,
{
    /// Swaps the batch evaluator. Evaluation strategy never changes results.
    pub fn with_evaluator<E2: Evaluator>(self, evaluator: E2) -> SmcSampler<P, L, K, E2> {
        SmcSampler {
            prior: self.prior,
            posterior: self.posterior,
            evaluator,
            config: self.config,
            schedule: self.schedule,
            population: self.population,
            kernels: self.kernels,
            run_state: self.run_state,
            state: self.state,
            seed: self.seed,
            rng: self.rng,
            cancel: self.cancel,
        }
    }

    /// Swaps the mutation kernel type. Any existing population is discarded.
    pub fn with_kernel<K2: MutationKernel>(self) -> SmcSampler<P, L, K2, E> {
        SmcSampler {
            prior: self.prior,
            posterior: self.posterior,
            evaluator: self.evaluator,
            config: self.config,
            schedule: self.schedule,
            population: None,
            kernels: Vec::new(),
            run_state: RunState::default(),
            state: SamplerState::Uninitialized,
            seed: self.seed,
            rng: self.rng,
            cancel: self.cancel,
        }
    }

    /// Reseeds the run's random number generator.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /**
    Applies a configuration.

    Rejected with a state error while an initialised population is waiting to be run,
    since its size and weights were built for the previous settings. After a completed
    or interrupted run the old population is dropped.
    */
    pub fn configure(&mut self, config: SmcConfig) -> Result<()> {
        if matches!(self.state, SamplerState::Initialized | SamplerState::Running) {
            return Err(SmcError::state(
                "cannot reconfigure an initialised population; configure before initialize()",
            ));
        }
        self.schedule = config.validate()?;
        self.config = config;
        self.population = None;
        self.kernels.clear();
        self.run_state = RunState::default();
        self.state = SamplerState::Uninitialized;
        Ok(())
    }

    /**
    Draws the initial population from `N(mean, covariance)` and weights it for the
    first non-zero temperature.

    Without a covariance, a diagonal one with entries `0.01·|mean_j|` is used, with
    zero entries of `mean` treated as 1.
    */
    pub fn initialize(
        &mut self,
        mean: &[f64],
        covariance: Option<&na::DMatrix<f64>>,
    ) -> Result<()> {
        let dim = self.prior.dimension();
        if mean.len() != dim {
            return Err(SmcError::config(format!(
                "initial mean has length {} but the model has dimension {dim}",
                mean.len()
            )));
        }
        let covariance = match covariance {
            Some(c) => c.clone(),
            None => default_covariance(mean),
        };
        let chol_l = cholesky_factor(mean, &covariance)?;
        let kernel = K::from_covariance(mean, &covariance)?;

        let n = self.config.n_particles;
        let positions: Vec<Vec<f64>> = (0..n)
            .map(|_| gaussian_draw(mean, &chol_l, 1.0, &mut self.rng))
            .collect();
        let log_posteriors = self.evaluate_checked(Target::Posterior, &positions)?;
        let log_priors = self.evaluate_checked(Target::Prior, &positions)?;
        let particles: Vec<Particle> = positions
            .into_iter()
            .zip(log_posteriors.into_iter().zip(log_priors))
            .map(|(x, (post, prior))| Particle::new(x, post, prior))
            .collect();
        if particles
            .iter()
            .all(|p| p.log_posterior == f64::NEG_INFINITY || p.log_prior == f64::NEG_INFINITY)
        {
            return Err(SmcError::numerical(
                "every initial particle has a non-finite log-density",
            ));
        }

        let mut population = ParticlePopulation::new(particles)?;
        let increment = population.reweight(self.schedule.get(0), self.schedule.get(1))?;

        self.run_state = RunState {
            n_evaluations: 2 * n,
            ..RunState::default()
        };
        self.run_state.fold(increment);
        self.population = Some(population);
        self.kernels = vec![kernel; n];
        self.cancel.clear();
        self.state = SamplerState::Initialized;
        log::debug!(
            "initialised {n} particles in {dim} dimensions, ESS = {:.1}",
            increment.ess
        );
        Ok(())
    }

    /// Runs the sampler through the whole schedule and returns posterior samples.
    pub fn run(&mut self) -> Result<na::DMatrix<f64>> {
        self.run_guarded(None)
    }

    /**
    Like [`run`](Self::run), with an [`indicatif`] progress bar advancing once per
    temperature and showing the current temperature, ESS and acceptance rate.
    */
    pub fn run_with_progress(&mut self) -> Result<na::DMatrix<f64>> {
        let style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");
        let pb = ProgressBar::new((self.schedule.len() - 1) as u64);
        pb.set_style(style);
        pb.set_prefix("SMC");
        let result = self.run_guarded(Some(&pb));
        match &result {
            Ok(_) => pb.finish_with_message("Done!"),
            Err(e) => pb.abandon_with_message(e.to_string()),
        }
        result
    }

    fn run_guarded(&mut self, pb: Option<&ProgressBar>) -> Result<na::DMatrix<f64>> {
        match self.state {
            SamplerState::Initialized => {}
            SamplerState::Uninitialized => {
                return Err(SmcError::state("run() called before initialize()"))
            }
            SamplerState::Running | SamplerState::Complete | SamplerState::Interrupted => {
                return Err(SmcError::state(
                    "population already used; call initialize() for a fresh run",
                ))
            }
        }
        self.state = SamplerState::Running;
        let result = self.run_schedule(pb);
        self.state = if result.is_ok() {
            SamplerState::Complete
        } else {
            SamplerState::Interrupted
        };
        result
    }

    fn run_schedule(&mut self, pb: Option<&ProgressBar>) -> Result<na::DMatrix<f64>> {
        let k = self.schedule.len();
        let threshold = self.config.effective_ess_threshold();
        log::info!(
            "running SMC: {} particles, {} temperatures, {} MCMC steps, {}fixed-point resampling",
            self.config.n_particles,
            k,
            self.config.mutation_steps,
            if self.config.resample_at_fixed_points { "" } else { "no " }
        );

        for t in 1..k {
            if self.cancel.is_cancelled() {
                log::info!("SMC run cancelled after {} temperatures", t - 1);
                return Err(SmcError::Cancelled { completed: t - 1 });
            }
            let beta = self.schedule.get(t);

            // Step 2: resample on degeneracy, or unconditionally at the fixed point.
            let ess = self.population_ref()?.ess();
            let mut resampled = false;
            if ess < threshold || self.fixed_point_due()? {
                self.resample()?;
                resampled = true;
            }

            // Step 3: move at the current temperature, then weight for the next one.
            let acceptance = self.mutate(beta)?;
            if t + 1 < k {
                let next = self.schedule.get(t + 1);
                let increment = self.population_mut()?.reweight(beta, next)?;
                self.run_state.fold(increment);
                if self.fixed_point_due()? {
                    self.resample()?;
                    resampled = true;
                }
            }

            self.run_state.iteration = t;
            self.run_state.acceptance_rates.push(acceptance);
            self.run_state.resampled.push(resampled);
            let ess = self.population_ref()?.ess();
            log::debug!(
                "t={t}/{}: beta={beta:.3e} ESS={ess:.1} acc={acceptance:.3} resampled={resampled}",
                k - 1
            );
            if let Some(pb) = pb {
                pb.set_position(t as u64);
                pb.set_message(format!(
                    "beta={beta:.2e} ESS={ess:.0} AcceptRate={acceptance:.3}"
                ));
            }
        }

        let n = self
            .config
            .posterior_samples
            .unwrap_or(self.config.n_particles);
        let samples = {
            let population = self
                .population
                .as_ref()
                .ok_or_else(|| SmcError::state("no population"))?;
            population.draw(n, &mut self.rng)?
        };
        log::info!(
            "SMC finished: log evidence = {:.4} ± {:.4}, {} resampling events",
            self.run_state.log_evidence,
            self.run_state.log_evidence_stddev(),
            self.run_state.n_resamples
        );
        Ok(samples)
    }

    fn fixed_point_due(&self) -> Result<bool> {
        Ok(self.config.resample_at_fixed_points
            && self.population_ref()?.reweighted_since_resample())
    }

    /// Resamples the population; every kernel follows its particle's ancestor.
    fn resample(&mut self) -> Result<()> {
        let scheme = self.config.resampling;
        let population = self
            .population
            .as_mut()
            .ok_or_else(|| SmcError::state("no population"))?;
        let ancestors = population.resample(scheme, &mut self.rng)?;
        self.kernels = ancestors
            .iter()
            .map(|&a| self.kernels[a].clone())
            .collect();
        self.run_state.n_resamples += 1;
        Ok(())
    }

    /// Runs `mutation_steps` MCMC updates on every particle at temperature `beta`
    /// and returns the acceptance rate.
    fn mutate(&mut self, beta: f64) -> Result<f64> {
        let steps = self.config.mutation_steps;
        let mut accepted = 0usize;
        for _ in 0..steps {
            let proposals: Vec<Vec<f64>> = {
                let population = self
                    .population
                    .as_ref()
                    .ok_or_else(|| SmcError::state("no population"))?;
                population
                    .particles()
                    .iter()
                    .zip(self.kernels.iter_mut())
                    .map(|(particle, kernel)| {
                        kernel.reset(&particle.position, particle.tempered(beta));
                        kernel.propose(&mut self.rng)
                    })
                    .collect()
            };
            let log_posteriors = self.evaluate_checked(Target::Posterior, &proposals)?;
            let log_priors = self.evaluate_checked(Target::Prior, &proposals)?;
            self.run_state.n_evaluations += 2 * proposals.len();

            let population = self
                .population
                .as_mut()
                .ok_or_else(|| SmcError::state("no population"))?;
            let candidates = proposals
                .into_iter()
                .zip(log_posteriors.into_iter().zip(log_priors))
                .map(|(x, (post, prior))| Particle::new(x, post, prior));
            for ((particle, kernel), candidate) in population
                .particles_mut()
                .iter_mut()
                .zip(self.kernels.iter_mut())
                .zip(candidates)
            {
                kernel.accept_or_reject(candidate.tempered(beta), &mut self.rng)?;
                if kernel.last_accepted() {
                    *particle = candidate;
                    accepted += 1;
                }
            }
        }
        Ok(accepted as f64 / (steps * self.kernels.len()) as f64)
    }

    fn evaluate_checked(&self, target: Target, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        let values = match target {
            Target::Posterior => self.evaluator.evaluate(&self.posterior, points)?,
            Target::Prior => self.evaluator.evaluate(&self.prior, points)?,
        };
        if values.len() != points.len() {
            return Err(SmcError::Evaluation(format!(
                "evaluator returned {} values for {} points",
                values.len(),
                points.len()
            )));
        }
        Ok(values)
    }

    fn population_ref(&self) -> Result<&ParticlePopulation> {
        self.population
            .as_ref()
            .ok_or_else(|| SmcError::state("no population"))
    }

    fn population_mut(&mut self) -> Result<&mut ParticlePopulation> {
        self.population
            .as_mut()
            .ok_or_else(|| SmcError::state("no population"))
    }

    fn require_complete(&self) -> Result<()> {
        if self.state == SamplerState::Complete {
            Ok(())
        } else {
            Err(SmcError::state(format!(
                "results are only available after a completed run (state: {:?})",
                self.state
            )))
        }
    }

    /// Log marginal likelihood estimate of the completed run.
    pub fn log_evidence(&self) -> Result<f64> {
        self.require_complete()?;
        Ok(self.run_state.log_evidence)
    }

    /// Standard deviation of the log marginal likelihood estimate.
    pub fn log_evidence_stddev(&self) -> Result<f64> {
        self.require_complete()?;
        Ok(self.run_state.log_evidence_stddev())
    }

    /// Draws `n` further posterior samples from the terminal population.
    pub fn sample_posterior(&mut self, n: usize) -> Result<na::DMatrix<f64>> {
        self.require_complete()?;
        let population = self
            .population
            .as_ref()
            .ok_or_else(|| SmcError::state("no population"))?;
        population.draw(n, &mut self.rng)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    /// The current population, if one has been initialised.
    pub fn population(&self) -> Option<&ParticlePopulation> {
        self.population.as_ref()
    }

    pub fn schedule(&self) -> &TemperatureSchedule {
        &self.schedule
    }

    pub fn config(&self) -> &SmcConfig {
        &self.config
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }
}

#[derive(Debug, Clone, Copy)]
enum Target {
    Prior,
    Posterior,
}

/// Diagonal covariance with entries `0.01·|x_j|`, zero entries of `x` counted as 1.
pub fn default_covariance(x: &[f64]) -> na::DMatrix<f64> {
    let diag = na::DVector::from_iterator(
        x.len(),
        x.iter()
            .map(|v| if *v == 0.0 { 1.0 } else { v.abs() })
            .map(|v| 0.01 * v),
    );
    na::DMatrix::from_diagonal(&diag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{GaussianLogLikelihood, GaussianLogPrior, LogPosterior};
    use crate::evaluator::ParallelEvaluator;
    use crate::kernel::RandomWalk;
    use approx::assert_abs_diff_eq;
    use std::sync::atomic::AtomicUsize;

    const SEED: u64 = 42;

    /// A model that is -∞ (or NaN) everywhere.
    struct Nowhere;

    impl LogDensity for Nowhere {
        fn log_density(&self, _x: &[f64]) -> f64 {
            f64::NAN
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    /// Evaluates normally for `healthy_batches` batches, then fails or drops a value.
    struct FailingEvaluator {
        calls: AtomicUsize,
        healthy_batches: usize,
        drop_value: bool,
    }

    impl FailingEvaluator {
        fn new(healthy_batches: usize, drop_value: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                healthy_batches,
                drop_value,
            }
        }
    }

    impl Evaluator for FailingEvaluator {
        fn evaluate<F: LogDensity + ?Sized>(
            &self,
            f: &F,
            points: &[Vec<f64>],
        ) -> Result<Vec<f64>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.healthy_batches {
                SequentialEvaluator.evaluate(f, points)
            } else if self.drop_value {
                SequentialEvaluator.evaluate(f, &points[1..])
            } else {
                Err(SmcError::Evaluation("worker disconnected".to_string()))
            }
        }
    }

    fn standard_normal() -> GaussianLogPrior {
        GaussianLogPrior::isotropic(1, 0.0, 1.0).unwrap()
    }

    fn flat_sampler(
        config: SmcConfig,
        seed: u64,
    ) -> SmcSampler<GaussianLogPrior, GaussianLogPrior> {
        let mut smc = SmcSampler::new(standard_normal(), standard_normal())
            .unwrap()
            .set_seed(seed);
        smc.configure(config).unwrap();
        smc.initialize(&[0.0], Some(&na::DMatrix::identity(1, 1))).unwrap();
        smc
    }

    fn peaked_posterior() -> LogPosterior<GaussianLogLikelihood, GaussianLogPrior> {
        let data = vec![vec![2.1], vec![1.7], vec![2.4], vec![1.9], vec![2.2], vec![2.0]];
        let likelihood = GaussianLogLikelihood::new(data, 0.5).unwrap();
        LogPosterior::new(likelihood, standard_normal()).unwrap()
    }

    #[test]
    fn run_before_initialize_is_state_error() {
        let mut smc = SmcSampler::new(standard_normal(), standard_normal()).unwrap();
        assert!(matches!(smc.run(), Err(SmcError::State(_))));
        assert!(matches!(smc.log_evidence(), Err(SmcError::State(_))));
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let mut smc = SmcSampler::new(standard_normal(), standard_normal()).unwrap();
        let bad = [
            SmcConfig::new().with_particles(5),
            SmcConfig::new().with_particles(10),
            SmcConfig::new().with_particles(100).with_ess_threshold(0.0),
            SmcConfig::new().with_particles(100).with_ess_threshold(100.5),
            SmcConfig::new().with_particles(100).with_ess_threshold(f64::NAN),
            SmcConfig::new().with_mutation_steps(0),
            SmcConfig::new().with_schedule(1usize),
            SmcConfig::new().with_schedule(vec![0.5, 1.0]),
        ];
        for config in bad {
            assert!(
                matches!(smc.configure(config.clone()), Err(SmcError::Configuration(_))),
                "expected {config:?} to be rejected"
            );
        }
        assert!(smc
            .configure(SmcConfig::new().with_particles(11).with_ess_threshold(11.0))
            .is_ok());
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let prior2 = GaussianLogPrior::isotropic(2, 0.0, 1.0).unwrap();
        assert!(matches!(
            SmcSampler::new(prior2, standard_normal()),
            Err(SmcError::Configuration(_))
        ));
        let mut smc = SmcSampler::new(standard_normal(), standard_normal()).unwrap();
        assert!(matches!(
            smc.initialize(&[0.0, 1.0], None),
            Err(SmcError::Configuration(_))
        ));
        let not_pd = na::DMatrix::from_element(1, 1, -1.0);
        assert!(matches!(
            smc.initialize(&[0.0], Some(&not_pd)),
            Err(SmcError::Configuration(_))
        ));
    }

    #[test]
    fn run_twice_is_state_error() {
        let mut smc = flat_sampler(SmcConfig::new().with_particles(50).with_schedule(3usize), SEED);
        smc.run().unwrap();
        assert_eq!(smc.state(), SamplerState::Complete);
        assert!(matches!(smc.run(), Err(SmcError::State(_))));
        // a fresh population makes the sampler runnable again
        smc.initialize(&[0.0], None).unwrap();
        assert!(smc.run().is_ok());
    }

    #[test]
    fn reconfigure_after_initialize_is_state_error() {
        let mut smc = flat_sampler(SmcConfig::new().with_particles(50), SEED);
        assert!(matches!(
            smc.configure(SmcConfig::new().with_particles(60)),
            Err(SmcError::State(_))
        ));
    }

    #[test]
    fn flat_likelihood_has_zero_evidence() {
        for seed in 0..5 {
            let mut smc = flat_sampler(SmcConfig::new().with_particles(100), seed);
            smc.run().unwrap();
            assert_abs_diff_eq!(smc.log_evidence().unwrap(), 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(smc.log_evidence_stddev().unwrap(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn standard_normal_end_to_end() {
        let mut smc = SmcSampler::new(standard_normal(), standard_normal())
            .unwrap()
            .set_seed(SEED);
        smc.configure(
            SmcConfig::new()
                .with_particles(200)
                .with_schedule(10usize)
                .with_mutation_steps(1),
        )
        .unwrap();
        smc.initialize(&[0.0], None).unwrap();
        let samples = smc.run().unwrap();
        assert_eq!(samples.nrows(), 200);
        assert_eq!(samples.ncols(), 1);
        assert_abs_diff_eq!(samples.mean(), 0.0, epsilon = 0.2);
        assert_abs_diff_eq!(smc.log_evidence().unwrap(), 0.0, epsilon = 0.5);
    }

    #[test]
    fn fixed_point_resampling_leaves_uniform_terminal_weights() {
        let k = 6;
        let mut smc = SmcSampler::new(standard_normal(), peaked_posterior())
            .unwrap()
            .set_seed(SEED);
        smc.configure(
            SmcConfig::new()
                .with_particles(100)
                .with_schedule(k)
                .with_resample_at_fixed_points(true),
        )
        .unwrap();
        smc.initialize(&[0.0], Some(&na::DMatrix::identity(1, 1))).unwrap();
        smc.run().unwrap();
        let rs = smc.run_state();
        // one resample per reweighting: initialisation plus k - 2 transitions
        assert_eq!(rs.n_resamples, k - 1);
        // nothing is left to reweight at the final temperature
        assert!(rs.resampled[..k - 2].iter().all(|&r| r));
        assert!(!rs.resampled[k - 2]);
        for w in smc.population().unwrap().weights() {
            assert_abs_diff_eq!(w, 0.01, epsilon = 1e-12);
        }
    }

    #[test]
    fn flat_likelihood_without_fixed_points_never_resamples() {
        let mut smc = flat_sampler(
            SmcConfig::new()
                .with_particles(100)
                .with_resample_at_fixed_points(false),
            SEED,
        );
        smc.run().unwrap();
        assert_eq!(smc.run_state().n_resamples, 0);
        assert!(smc.run_state().ess_history.iter().all(|&e| (e - 100.0).abs() < 1e-6));
    }

    #[test]
    fn ess_trigger_resamples_degenerate_populations() {
        let mut smc = SmcSampler::new(standard_normal(), peaked_posterior())
            .unwrap()
            .set_seed(SEED);
        smc.configure(
            SmcConfig::new()
                .with_particles(200)
                .with_schedule(vec![0.0, 0.5, 1.0])
                .with_resample_at_fixed_points(false)
                .with_resampling(ResamplingScheme::Multinomial),
        )
        .unwrap();
        smc.initialize(&[0.0], Some(&na::DMatrix::identity(1, 1))).unwrap();
        // jumping straight to half the likelihood collapses the weights
        assert!(smc.population().unwrap().ess() < 100.0);
        smc.run().unwrap();
        assert!(smc.run_state().resampled[0]);
        assert!(smc.run_state().n_resamples >= 1);
    }

    #[test]
    fn cancellation_between_temperatures() {
        let mut smc = flat_sampler(SmcConfig::new().with_particles(20), SEED);
        smc.cancel_handle().cancel();
        assert!(matches!(
            smc.run(),
            Err(SmcError::Cancelled { completed: 0 })
        ));
        assert_eq!(smc.state(), SamplerState::Interrupted);
        assert!(matches!(smc.run(), Err(SmcError::State(_))));
        assert!(matches!(smc.log_evidence(), Err(SmcError::State(_))));
        // initialize clears the flag
        smc.initialize(&[0.0], None).unwrap();
        assert!(smc.run().is_ok());
    }

    #[test]
    fn nowhere_finite_model_is_numerical_error() {
        let mut smc = SmcSampler::new(standard_normal(), Nowhere).unwrap().set_seed(SEED);
        smc.configure(SmcConfig::new().with_particles(20)).unwrap();
        assert!(matches!(
            smc.initialize(&[0.0], None),
            Err(SmcError::Numerical(_))
        ));
        assert_eq!(smc.state(), SamplerState::Uninitialized);
    }

    #[test]
    fn same_seed_same_result_across_evaluators() {
        let config = SmcConfig::new()
            .with_particles(64)
            .with_schedule(5usize)
            .with_mutation_steps(2);
        let mut seq = SmcSampler::new(standard_normal(), peaked_posterior())
            .unwrap()
            .set_seed(SEED);
        seq.configure(config.clone()).unwrap();
        seq.initialize(&[0.5], None).unwrap();
        let a = seq.run().unwrap();

        let mut par = SmcSampler::new(standard_normal(), peaked_posterior())
            .unwrap()
            .with_evaluator(ParallelEvaluator::new(3).unwrap())
            .set_seed(SEED);
        par.configure(config).unwrap();
        par.initialize(&[0.5], None).unwrap();
        let b = par.run().unwrap();

        assert_eq!(a, b);
        assert_eq!(seq.log_evidence().unwrap(), par.log_evidence().unwrap());
    }

    #[test]
    fn random_walk_kernel_and_extra_draws() {
        let mut smc = SmcSampler::new(standard_normal(), peaked_posterior())
            .unwrap()
            .with_kernel::<RandomWalk>()
            .set_seed(SEED);
        smc.configure(
            SmcConfig::new()
                .with_particles(300)
                .with_schedule(8usize)
                .with_mutation_steps(3)
                .with_posterior_samples(50),
        )
        .unwrap();
        smc.initialize(&[0.0], Some(&na::DMatrix::identity(1, 1))).unwrap();
        let samples = smc.run().unwrap();
        assert_eq!(samples.nrows(), 50);
        let more = smc.sample_posterior(1000).unwrap();
        assert_eq!(more.nrows(), 1000);
        // conjugate posterior mean: (Σy / σ²) / (n / σ² + 1) = 49.2 / 25
        assert_abs_diff_eq!(more.mean(), 1.968, epsilon = 0.15);
        let rs = smc.run_state();
        assert_eq!(rs.acceptance_rates.len(), 7);
        assert!(rs.acceptance_rates.iter().all(|a| (0.0..=1.0).contains(a)));
        assert_eq!(rs.n_evaluations, 2 * 300 + 7 * 3 * 2 * 300);
    }

    #[test]
    fn evaluator_failures_interrupt_the_run() {
        // two batches for initialisation, two per mutation round
        for drop_value in [false, true] {
            let mut smc = SmcSampler::new(standard_normal(), peaked_posterior())
                .unwrap()
                .with_evaluator(FailingEvaluator::new(4, drop_value))
                .set_seed(SEED);
            smc.configure(SmcConfig::new().with_particles(20).with_schedule(5usize)).unwrap();
            smc.initialize(&[0.0], None).unwrap();
            assert!(matches!(smc.run(), Err(SmcError::Evaluation(_))));
            assert_eq!(smc.state(), SamplerState::Interrupted);
            assert_eq!(smc.run_state().iteration, 1);
            assert!(matches!(smc.log_evidence(), Err(SmcError::State(_))));
        }
    }

    #[test]
    fn evaluator_failure_during_initialization_is_propagated() {
        let mut smc = SmcSampler::new(standard_normal(), standard_normal())
            .unwrap()
            .with_evaluator(FailingEvaluator::new(1, false))
            .set_seed(SEED);
        smc.configure(SmcConfig::new().with_particles(20)).unwrap();
        assert!(matches!(
            smc.initialize(&[0.0], None),
            Err(SmcError::Evaluation(_))
        ));
        assert_eq!(smc.state(), SamplerState::Uninitialized);
    }

    #[test]
    fn kernels_follow_their_particles_through_resampling() {
        let mut smc = SmcSampler::new(standard_normal(), peaked_posterior())
            .unwrap()
            .set_seed(SEED);
        smc.configure(
            SmcConfig::new()
                .with_particles(50)
                .with_schedule(vec![0.0, 0.5, 1.0]),
        )
        .unwrap();
        smc.initialize(&[0.0], Some(&na::DMatrix::identity(1, 1))).unwrap();
        smc.mutate(0.5).unwrap();

        let before_positions: Vec<Vec<f64>> = smc
            .population()
            .unwrap()
            .particles()
            .iter()
            .map(|p| p.position.clone())
            .collect();
        let before_mus: Vec<na::DVector<f64>> =
            smc.kernels.iter().map(|k| k.mu().clone()).collect();
        for (kernel, position) in smc.kernels.iter().zip(&before_positions) {
            assert_eq!(kernel.current(), position.as_slice());
        }

        smc.resample().unwrap();

        let particles = smc.population().unwrap().particles();
        assert_eq!(smc.kernels.len(), particles.len());
        for (kernel, particle) in smc.kernels.iter().zip(particles) {
            let ancestor = before_positions
                .iter()
                .position(|p| *p == particle.position)
                .unwrap();
            assert_eq!(kernel.current(), particle.position.as_slice());
            assert_eq!(kernel.mu(), &before_mus[ancestor]);
        }
    }

    #[test]
    fn default_covariance_scales_initial_point() {
        let c = default_covariance(&[0.0, -20.0]);
        assert_eq!(c[(0, 0)], 0.01);
        assert_eq!(c[(1, 1)], 0.2);
        assert_eq!(c[(0, 1)], 0.0);
    }

    #[test]
    fn progress_run_matches_plain_run() {
        let config = SmcConfig::new().with_particles(40).with_schedule(4usize);
        let mut a = flat_sampler(config.clone(), SEED);
        let mut b = flat_sampler(config, SEED);
        assert_eq!(a.run().unwrap(), b.run_with_progress().unwrap());
    }
}
