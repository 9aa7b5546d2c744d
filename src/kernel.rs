/*!
MCMC mutation kernels used to move particles at a fixed temperature.

A kernel is a single Metropolis chain driven from outside in "ask/tell" style: the
sampler asks for a proposal with [`MutationKernel::propose`], evaluates the tempered
target there, and hands the value back through [`MutationKernel::accept_or_reject`].
The SMC sampler keeps one kernel per particle so that adaptive state is never mixed
between unrelated particles.

All randomness comes from the generator passed in by the caller.
*/

use nalgebra as na;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, SmcError};

/// A single-chain MCMC proposal engine.
pub trait MutationKernel: Clone + Send {
    /// Builds a kernel starting at `initial` with proposal scale derived from `covariance`.
    fn from_covariance(initial: &[f64], covariance: &na::DMatrix<f64>) -> Result<Self>
    where
        Self: Sized;

    /// Moves the chain to `position`, whose log-density under the current target is
    /// `log_density`. Adaptive state is kept; a pending proposal is dropped.
    fn reset(&mut self, position: &[f64], log_density: f64);

    /// Proposes a candidate point.
    fn propose<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<f64>;

    /// Accepts or rejects the pending proposal given its log-density and returns the
    /// chain's new position (unchanged on rejection).
    fn accept_or_reject<R: Rng + ?Sized>(&mut self, log_density: f64, rng: &mut R)
        -> Result<&[f64]>;

    /// Whether the last call to `accept_or_reject` accepted.
    fn last_accepted(&self) -> bool;

    /// Current position of the chain.
    fn current(&self) -> &[f64];
}

/// Checks shapes and returns the lower Cholesky factor of `covariance`.
pub(crate) fn cholesky_factor(
    initial: &[f64],
    covariance: &na::DMatrix<f64>,
) -> Result<na::DMatrix<f64>> {
    let d = initial.len();
    if d == 0 {
        return Err(SmcError::config("initial point must not be empty"));
    }
    if covariance.nrows() != d || covariance.ncols() != d {
        return Err(SmcError::config(format!(
            "covariance must be {d}x{d}, got {}x{}",
            covariance.nrows(),
            covariance.ncols()
        )));
    }
    na::Cholesky::new(covariance.clone())
        .map(|c| c.l())
        .ok_or_else(|| SmcError::config("covariance must be symmetric positive definite"))
}

/// Draws `center + scale · L z` with `z ~ N(0, I)`.
pub(crate) fn gaussian_draw<R: Rng + ?Sized>(
    center: &[f64],
    chol_l: &na::DMatrix<f64>,
    scale: f64,
    rng: &mut R,
) -> Vec<f64> {
    let z = na::DVector::<f64>::from_iterator(
        center.len(),
        (0..center.len()).map(|_| rng.sample(StandardNormal)),
    );
    let step = chol_l * z * scale;
    center.iter().zip(step.iter()).map(|(c, s)| c + s).collect()
}

/// Metropolis rule in log space. A uniform is always drawn so the random stream
/// does not depend on the outcome.
fn metropolis_accept<R: Rng + ?Sized>(current: f64, proposed: f64, rng: &mut R) -> bool {
    let u: f64 = rng.gen();
    proposed.is_finite() && u.ln() < proposed - current
}

/// Adaptation counter at construction; the first step size is `2^-η`.
const INITIAL_ADAPTATIONS: usize = 2;

/**
Adaptive-covariance random-walk Metropolis (Haario–Bardenet).

Proposals are drawn from `N(x, λ·Σ)`. After every accept/reject the running mean `μ`,
the covariance `Σ`, and the global scale `log λ` are updated with step size
`γ = n^(-η)`, `n = 2, 3, …`, pushing the acceptance rate towards 0.234.

# Examples

```rust
use mini_smc::kernel::{AdaptiveCovariance, MutationKernel};
use nalgebra::DMatrix;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut rng = SmallRng::seed_from_u64(42);
let mut kernel =
    AdaptiveCovariance::from_covariance(&[0.0, 0.0], &DMatrix::identity(2, 2)).unwrap();
kernel.reset(&[0.0, 0.0], 0.0);
let proposal = kernel.propose(&mut rng);
assert_eq!(proposal.len(), 2);
let next = kernel.accept_or_reject(0.5, &mut rng).unwrap();
assert_eq!(next, proposal.as_slice());
```
*/
#[derive(Debug, Clone)]
pub struct AdaptiveCovariance {
    current: Vec<f64>,
    current_log_density: f64,
    proposed: Option<Vec<f64>>,
    mu: na::DVector<f64>,
    sigma: na::DMatrix<f64>,
    chol_l: na::DMatrix<f64>,
    log_lambda: f64,
    adaptations: usize,
    eta: f64,
    target_acceptance: f64,
    accepted: bool,
}

impl AdaptiveCovariance {
    /// Decay exponent of the adaptation step size.
    pub const DEFAULT_ETA: f64 = 0.6;
    /// Acceptance rate the global scale is tuned towards.
    pub const TARGET_ACCEPTANCE: f64 = 0.234;

    pub fn set_eta(mut self, eta: f64) -> Result<Self> {
        if !(eta > 0.0) || !eta.is_finite() {
            return Err(SmcError::config("eta must be positive and finite"));
        }
        self.eta = eta;
        Ok(self)
    }

    /// Running mean of visited positions.
    pub fn mu(&self) -> &na::DVector<f64> {
        &self.mu
    }

    pub fn sigma(&self) -> &na::DMatrix<f64> {
        &self.sigma
    }

    pub fn log_lambda(&self) -> f64 {
        self.log_lambda
    }

    fn adapt(&mut self) {
        let gamma = (self.adaptations as f64).powf(-self.eta);
        self.adaptations += 1;

        let x = na::DVector::from_column_slice(&self.current);
        self.mu = &self.mu * (1.0 - gamma) + &x * gamma;
        let diff = x - &self.mu;
        self.sigma = &self.sigma * (1.0 - gamma) + (&diff * diff.transpose()) * gamma;

        let accepted = if self.accepted { 1.0 } else { 0.0 };
        self.log_lambda += gamma * (accepted - self.target_acceptance);

        match na::Cholesky::new(self.sigma.clone()) {
            Some(c) => self.chol_l = c.l(),
            None => log::warn!(
                "adapted covariance not positive definite after {} updates; keeping old factor",
                self.adaptations
            ),
        }
    }
}

impl MutationKernel for AdaptiveCovariance {
    fn from_covariance(initial: &[f64], covariance: &na::DMatrix<f64>) -> Result<Self> {
        let chol_l = cholesky_factor(initial, covariance)?;
        Ok(Self {
            current: initial.to_vec(),
            current_log_density: f64::NEG_INFINITY,
            proposed: None,
            mu: na::DVector::from_column_slice(initial),
            sigma: covariance.clone(),
            chol_l,
            log_lambda: 0.0,
            adaptations: INITIAL_ADAPTATIONS,
            eta: Self::DEFAULT_ETA,
            target_acceptance: Self::TARGET_ACCEPTANCE,
            accepted: false,
        })
    }

    fn reset(&mut self, position: &[f64], log_density: f64) {
        self.current.clear();
        self.current.extend_from_slice(position);
        self.current_log_density = log_density;
        self.proposed = None;
    }

    fn propose<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<f64> {
        let scale = (0.5 * self.log_lambda).exp();
        let proposed = gaussian_draw(&self.current, &self.chol_l, scale, rng);
        self.proposed = Some(proposed.clone());
        proposed
    }

    fn accept_or_reject<R: Rng + ?Sized>(
        &mut self,
        log_density: f64,
        rng: &mut R,
    ) -> Result<&[f64]> {
        let proposed = self
            .proposed
            .take()
            .ok_or_else(|| SmcError::state("accept_or_reject called without a pending proposal"))?;
        self.accepted = metropolis_accept(self.current_log_density, log_density, rng);
        if self.accepted {
            self.current = proposed;
            self.current_log_density = log_density;
        }
        self.adapt();
        Ok(self.current.as_slice())
    }

    fn last_accepted(&self) -> bool {
        self.accepted
    }

    fn current(&self) -> &[f64] {
        &self.current
    }
}

/// Random-walk Metropolis with a fixed Gaussian proposal `N(x, s²·Σ₀)`, `s = 2.38/√d`.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    current: Vec<f64>,
    current_log_density: f64,
    proposed: Option<Vec<f64>>,
    chol_l: na::DMatrix<f64>,
    scale: f64,
    accepted: bool,
}

impl RandomWalk {
    /// Overrides the proposal scale multiplying the Cholesky factor of `Σ₀`.
    pub fn set_scale(mut self, scale: f64) -> Result<Self> {
        if !(scale > 0.0) || !scale.is_finite() {
            return Err(SmcError::config("proposal scale must be positive and finite"));
        }
        self.scale = scale;
        Ok(self)
    }
}

impl MutationKernel for RandomWalk {
    fn from_covariance(initial: &[f64], covariance: &na::DMatrix<f64>) -> Result<Self> {
        let chol_l = cholesky_factor(initial, covariance)?;
        Ok(Self {
            current: initial.to_vec(),
            current_log_density: f64::NEG_INFINITY,
            proposed: None,
            chol_l,
            scale: 2.38 / (initial.len() as f64).sqrt(),
            accepted: false,
        })
    }

    fn reset(&mut self, position: &[f64], log_density: f64) {
        self.current.clear();
        self.current.extend_from_slice(position);
        self.current_log_density = log_density;
        self.proposed = None;
    }

    fn propose<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Vec<f64> {
        let proposed = gaussian_draw(&self.current, &self.chol_l, self.scale, rng);
        self.proposed = Some(proposed.clone());
        proposed
    }

    fn accept_or_reject<R: Rng + ?Sized>(
        &mut self,
        log_density: f64,
        rng: &mut R,
    ) -> Result<&[f64]> {
        let proposed = self
            .proposed
            .take()
            .ok_or_else(|| SmcError::state("accept_or_reject called without a pending proposal"))?;
        self.accepted = metropolis_accept(self.current_log_density, log_density, rng);
        if self.accepted {
            self.current = proposed;
            self.current_log_density = log_density;
        }
        Ok(self.current.as_slice())
    }

    fn last_accepted(&self) -> bool {
        self.accepted
    }

    fn current(&self) -> &[f64] {
        &self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    const SEED: u64 = 42;

    fn std_normal(x: &[f64]) -> f64 {
        -0.5 * x.iter().map(|v| v * v).sum::<f64>()
    }

    /// Runs a kernel as a plain MCMC chain on a standard normal and returns the samples.
    fn run_chain<K: MutationKernel>(kernel: &mut K, n_steps: usize) -> Vec<Vec<f64>> {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let start = kernel.current().to_vec();
        kernel.reset(&start, std_normal(&start));
        (0..n_steps)
            .map(|_| {
                let proposed = kernel.propose(&mut rng);
                let lp = std_normal(&proposed);
                kernel.accept_or_reject(lp, &mut rng).unwrap().to_vec()
            })
            .collect()
    }

    #[test]
    fn accept_without_proposal_is_a_state_error() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut kernel =
            AdaptiveCovariance::from_covariance(&[0.0], &na::DMatrix::identity(1, 1)).unwrap();
        assert!(matches!(
            kernel.accept_or_reject(0.0, &mut rng),
            Err(SmcError::State(_))
        ));
    }

    #[test]
    fn rejects_invalid_covariance() {
        let bad = na::DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(matches!(
            RandomWalk::from_covariance(&[0.0, 0.0], &bad),
            Err(SmcError::Configuration(_))
        ));
        assert!(AdaptiveCovariance::from_covariance(&[0.0], &na::DMatrix::identity(2, 2)).is_err());
    }

    #[test]
    fn non_finite_proposals_are_rejected() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut kernel = RandomWalk::from_covariance(&[1.0], &na::DMatrix::identity(1, 1)).unwrap();
        kernel.reset(&[1.0], -0.5);
        kernel.propose(&mut rng);
        let next = kernel.accept_or_reject(f64::NEG_INFINITY, &mut rng).unwrap();
        assert_eq!(next, &[1.0]);
        assert!(!kernel.last_accepted());
    }

    #[test]
    fn better_proposals_are_always_accepted() {
        let mut rng = SmallRng::seed_from_u64(SEED);
        let mut kernel = RandomWalk::from_covariance(&[3.0], &na::DMatrix::identity(1, 1)).unwrap();
        for _ in 0..20 {
            kernel.reset(&[3.0], f64::NEG_INFINITY);
            let proposed = kernel.propose(&mut rng);
            let next = kernel.accept_or_reject(0.0, &mut rng).unwrap().to_vec();
            assert_eq!(next, proposed);
            assert!(kernel.last_accepted());
        }
    }

    #[test]
    fn first_adaptation_keeps_covariance_positive_definite() {
        for dim in [1, 3] {
            let mut rng = SmallRng::seed_from_u64(SEED);
            let x0 = vec![0.0; dim];
            let mut kernel =
                AdaptiveCovariance::from_covariance(&x0, &na::DMatrix::identity(dim, dim))
                    .unwrap();
            for _ in 0..dim {
                kernel.reset(&x0, std_normal(&x0));
                let proposed = kernel.propose(&mut rng);
                kernel.accept_or_reject(std_normal(&proposed), &mut rng).unwrap();
                assert!(kernel.sigma()[(0, 0)] > 0.0);
                assert!(na::Cholesky::new(kernel.sigma().clone()).is_some());
            }
        }
    }

    #[test]
    fn random_walk_samples_standard_normal() {
        let mut kernel =
            RandomWalk::from_covariance(&[0.0, 0.0], &na::DMatrix::identity(2, 2)).unwrap();
        let samples = run_chain(&mut kernel, 40_000);
        let flat: Vec<f64> = samples[5_000..].concat();
        let m = na::DMatrix::from_row_slice(flat.len() / 2, 2, &flat);
        let mean = crate::stats::mean(&m);
        let cov = crate::stats::cov(&m).unwrap();
        assert_abs_diff_eq!(mean[0], 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(mean[1], 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(cov[(0, 0)], 1.0, epsilon = 0.15);
        assert_abs_diff_eq!(cov[(1, 1)], 1.0, epsilon = 0.15);
    }

    #[test]
    fn adaptive_covariance_learns_scale() {
        // Start with a proposal far too narrow for the target.
        let mut kernel =
            AdaptiveCovariance::from_covariance(&[0.0], &na::DMatrix::from_element(1, 1, 1e-4))
                .unwrap();
        let samples = run_chain(&mut kernel, 20_000);
        let tail: Vec<f64> = samples[10_000..].iter().map(|s| s[0]).collect();
        let n = tail.len() as f64;
        let mean = tail.iter().sum::<f64>() / n;
        let var = tail.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
        assert!(kernel.sigma()[(0, 0)] > 0.1, "covariance did not grow");
        assert_abs_diff_eq!(mean, 0.0, epsilon = 0.2);
        assert_abs_diff_eq!(var, 1.0, epsilon = 0.3);
    }
}
