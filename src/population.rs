/*!
The weighted particle population and its step functions: tempering arithmetic,
incremental reweighting, resampling, and weighted draws.

Log-weights are kept normalised (`logsumexp(log_weights) == 0`) after every update,
so the normalised weights always form a probability vector.
*/

use nalgebra as na;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

use crate::error::{Result, SmcError};
use crate::stats;

/// Maps any non-finite log-density to `-∞`.
pub fn sanitize(log_density: f64) -> f64 {
    if log_density.is_finite() {
        log_density
    } else {
        f64::NEG_INFINITY
    }
}

/// `β·log_posterior + (1 − β)·log_prior`, with `-∞` wherever either term rules the point out.
pub fn tempered_log_density(beta: f64, log_posterior: f64, log_prior: f64) -> f64 {
    if log_prior == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if beta == 0.0 {
        return log_prior;
    }
    if log_posterior == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    beta * log_posterior + (1.0 - beta) * log_prior
}

/// Log incremental weight `target(x, β_new) − target(x, β_old)` of a particle.
pub fn incremental_log_weight(
    beta_old: f64,
    beta_new: f64,
    log_posterior: f64,
    log_prior: f64,
) -> f64 {
    if log_prior == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let delta = beta_new - beta_old;
    if delta == 0.0 {
        return 0.0;
    }
    if log_posterior == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    delta * (log_posterior - log_prior)
}

/// A point in parameter space with its cached log-densities.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    pub position: Vec<f64>,
    pub log_posterior: f64,
    pub log_prior: f64,
}

impl Particle {
    pub fn new(position: Vec<f64>, log_posterior: f64, log_prior: f64) -> Self {
        Self {
            position,
            log_posterior: sanitize(log_posterior),
            log_prior: sanitize(log_prior),
        }
    }

    pub fn tempered(&self, beta: f64) -> f64 {
        tempered_log_density(beta, self.log_posterior, self.log_prior)
    }
}

/// How particles are drawn when the population is resampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResamplingScheme {
    /// One uniform offset, `N` evenly spaced pointers. Lower variance.
    #[default]
    Systematic,
    /// `N` independent categorical draws.
    Multinomial,
}

impl ResamplingScheme {
    /// Draws `n` ancestor indices with probability proportional to `weights`.
    pub fn indices<R: Rng + ?Sized>(
        &self,
        weights: &[f64],
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        match self {
            ResamplingScheme::Multinomial => {
                let dist = WeightedIndex::new(weights)
                    .map_err(|e| SmcError::numerical(format!("cannot resample: {e}")))?;
                Ok((0..n).map(|_| dist.sample(rng)).collect())
            }
            ResamplingScheme::Systematic => systematic_indices(weights, n, rng),
        }
    }
}

fn systematic_indices<R: Rng + ?Sized>(
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Result<Vec<usize>> {
    let mut cumulative = Vec::with_capacity(weights.len());
    let mut total = 0.0;
    for &w in weights {
        if !(w >= 0.0) || !w.is_finite() {
            return Err(SmcError::numerical(format!("cannot resample: invalid weight {w}")));
        }
        total += w;
        cumulative.push(total);
    }
    let Some(last_positive) = weights.iter().rposition(|&w| w > 0.0) else {
        return Err(SmcError::numerical("cannot resample: all weights are zero"));
    };

    let start: f64 = rng.gen::<f64>() / n as f64;
    let mut j = 0;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let pointer = (start + i as f64 / n as f64) * total;
        while j < last_positive && (cumulative[j] < pointer || weights[j] == 0.0) {
            j += 1;
        }
        out.push(j);
    }
    Ok(out)
}

/// The evidence contribution of one reweighting step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidenceIncrement {
    /// `log Σ_i W_i exp(w̃_i)` with the weights `W` before the update.
    pub log_ratio: f64,
    /// Delta-method variance of `log_ratio`.
    pub variance: f64,
    /// ESS of the weights after the update.
    pub ess: f64,
}

/**
A fixed-size population of particles with normalised log-weights.

# Examples

```rust
use mini_smc::population::{Particle, ParticlePopulation};

let particles = (0..20).map(|i| Particle::new(vec![i as f64], -1.0, -0.5)).collect();
let mut population = ParticlePopulation::new(particles).unwrap();
assert!((population.ess() - 20.0).abs() < 1e-9);

let inc = population.reweight(0.0, 0.5).unwrap();
assert!((population.weights().iter().sum::<f64>() - 1.0).abs() < 1e-12);
assert!(inc.log_ratio.is_finite());
```
*/
#[derive(Debug, Clone)]
pub struct ParticlePopulation {
    particles: Vec<Particle>,
    log_weights: Vec<f64>,
    resample_count: usize,
    reweighted_since_resample: bool,
}

impl ParticlePopulation {
    /// Wraps particles with uniform weights.
    pub fn new(particles: Vec<Particle>) -> Result<Self> {
        if particles.is_empty() {
            return Err(SmcError::config("a population needs at least one particle"));
        }
        let n = particles.len();
        Ok(Self {
            particles,
            log_weights: vec![-(n as f64).ln(); n],
            resample_count: 0,
            reweighted_since_resample: false,
        })
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub(crate) fn particles_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    /// Normalised log-weights.
    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// Normalised weights.
    pub fn weights(&self) -> Vec<f64> {
        stats::weights_from_log(&self.log_weights)
    }

    pub fn ess(&self) -> f64 {
        stats::effective_sample_size(&self.weights())
    }

    /// Number of resampling events so far.
    pub fn resample_count(&self) -> usize {
        self.resample_count
    }

    /// True when weights carry information that a resample has not yet consumed.
    pub fn reweighted_since_resample(&self) -> bool {
        self.reweighted_since_resample
    }

    /**
    Adds log incremental weights and renormalises.

    Fails with a numerical error, leaving the population untouched, if every
    resulting weight is zero.
    */
    pub fn apply_increments(&mut self, increments: &[f64]) -> Result<EvidenceIncrement> {
        if increments.len() != self.len() {
            return Err(SmcError::state(format!(
                "expected {} incremental weights, got {}",
                self.len(),
                increments.len()
            )));
        }
        let ess_before = self.ess();
        let mut updated: Vec<f64> = self
            .log_weights
            .iter()
            .zip(increments)
            .map(|(w, inc)| sanitize_weight(w + sanitize_weight(*inc)))
            .collect();
        let Some(log_ratio) = stats::normalize_log_weights(&mut updated) else {
            return Err(SmcError::numerical(
                "all particles have zero weight; prior and posterior do not overlap",
            ));
        };

        let variance = self
            .log_weights
            .iter()
            .zip(increments)
            .map(|(w, inc)| {
                let r = (sanitize_weight(*inc) - log_ratio).exp();
                w.exp() * (r - 1.0) * (r - 1.0)
            })
            .sum::<f64>()
            / ess_before;

        self.log_weights = updated;
        self.reweighted_since_resample = true;
        Ok(EvidenceIncrement {
            log_ratio,
            variance,
            ess: self.ess(),
        })
    }

    /// Moves the weights from the target at `beta_old` to the target at `beta_new`.
    pub fn reweight(&mut self, beta_old: f64, beta_new: f64) -> Result<EvidenceIncrement> {
        let increments: Vec<f64> = self
            .particles
            .iter()
            .map(|p| incremental_log_weight(beta_old, beta_new, p.log_posterior, p.log_prior))
            .collect();
        self.apply_increments(&increments)
    }

    /// Replaces the population by `N` draws proportional to weight and resets weights to `1/N`.
    ///
    /// Returns the ancestor index of every new particle.
    pub fn resample<R: Rng + ?Sized>(
        &mut self,
        scheme: ResamplingScheme,
        rng: &mut R,
    ) -> Result<Vec<usize>> {
        let n = self.len();
        let ancestors = scheme.indices(&self.weights(), n, rng)?;
        self.particles = ancestors
            .iter()
            .map(|&a| self.particles[a].clone())
            .collect();
        self.log_weights = vec![-(n as f64).ln(); n];
        self.resample_count += 1;
        self.reweighted_since_resample = false;
        Ok(ancestors)
    }

    /// Draws `n` positions with replacement, proportional to weight, as an `n × d` matrix.
    pub fn draw<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<na::DMatrix<f64>> {
        let dim = self.particles[0].position.len();
        let dist = WeightedIndex::new(self.weights())
            .map_err(|e| SmcError::numerical(format!("cannot draw posterior samples: {e}")))?;
        let flat: Vec<f64> = (0..n)
            .flat_map(|_| self.particles[dist.sample(rng)].position.iter().copied())
            .collect();
        Ok(na::DMatrix::from_row_slice(n, dim, &flat))
    }
}

/// NaN weights become zero weights.
fn sanitize_weight(w: f64) -> f64 {
    if w.is_nan() {
        f64::NEG_INFINITY
    } else {
        w
    }
}
