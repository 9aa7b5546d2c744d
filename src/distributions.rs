/*!
Log-density models consumed by the SMC sampler.

Everything the sampler needs from a probability model is captured by the
[`LogDensity`] trait: a log-density value, optionally its gradient, and the
dimension of the parameter space. This module also provides the usual
building blocks to assemble a posterior from a likelihood and a prior.

# Examples

```rust
use mini_smc::distributions::{GaussianLogLikelihood, GaussianLogPrior, LogDensity, LogPosterior};

let prior = GaussianLogPrior::isotropic(2, 0.0, 1.0).unwrap();
let likelihood = GaussianLogLikelihood::new(vec![vec![0.5, -0.5]], 1.0).unwrap();
let posterior = LogPosterior::new(likelihood, prior).unwrap();

assert_eq!(posterior.dimension(), 2);
assert!(posterior.log_density(&[0.0, 0.0]).is_finite());
```
*/

use std::f64::consts::PI;

use crate::error::{Result, SmcError};

/// A (possibly unnormalised) log-density over a real parameter space.
pub trait LogDensity: Send + Sync {
    /// Returns `log p(x)`. May be `-∞` outside the support.
    fn log_density(&self, x: &[f64]) -> f64;

    /// Returns `log p(x)` together with its gradient, if the model provides one.
    fn log_density_and_gradient(&self, _x: &[f64]) -> Option<(f64, Vec<f64>)> {
        None
    }

    /// Number of parameters.
    fn dimension(&self) -> usize;
}

impl<D: LogDensity + ?Sized> LogDensity for Box<D> {
    fn log_density(&self, x: &[f64]) -> f64 {
        (**self).log_density(x)
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        (**self).log_density_and_gradient(x)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

impl<D: LogDensity + ?Sized> LogDensity for &D {
    fn log_density(&self, x: &[f64]) -> f64 {
        (**self).log_density(x)
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        (**self).log_density_and_gradient(x)
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }
}

/**
The sum of a likelihood and a prior defined on the same parameter space.

The prior is evaluated first; if it is `-∞` the likelihood is not evaluated at all.
*/
#[derive(Debug, Clone)]
pub struct LogPosterior<L, P> {
    likelihood: L,
    prior: P,
}

impl<L: LogDensity, P: LogDensity> LogPosterior<L, P> {
    /// Creates a posterior, failing if the two densities disagree on the dimension.
    pub fn new(likelihood: L, prior: P) -> Result<Self> {
        if likelihood.dimension() != prior.dimension() {
            return Err(SmcError::config(format!(
                "likelihood has dimension {} but prior has dimension {}",
                likelihood.dimension(),
                prior.dimension()
            )));
        }
        Ok(Self { likelihood, prior })
    }

    pub fn likelihood(&self) -> &L {
        &self.likelihood
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }
}

impl<L: LogDensity, P: LogDensity> LogDensity for LogPosterior<L, P> {
    fn log_density(&self, x: &[f64]) -> f64 {
        let log_prior = self.prior.log_density(x);
        if log_prior == f64::NEG_INFINITY {
            return f64::NEG_INFINITY;
        }
        log_prior + self.likelihood.log_density(x)
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        let (a, da) = self.prior.log_density_and_gradient(x)?;
        let (b, db) = self.likelihood.log_density_and_gradient(x)?;
        Some((a + b, da.iter().zip(&db).map(|(p, q)| p + q).collect()))
    }

    fn dimension(&self) -> usize {
        self.prior.dimension()
    }
}

/// Sum of independent log-densities sharing one parameter space,
/// e.g. likelihoods of the same model on independent data sets.
pub struct SumOfIndependentLogPdfs {
    pdfs: Vec<Box<dyn LogDensity>>,
}

impl SumOfIndependentLogPdfs {
    pub fn new(pdfs: Vec<Box<dyn LogDensity>>) -> Result<Self> {
        let Some(first) = pdfs.first() else {
            return Err(SmcError::config("at least one log-pdf is required"));
        };
        let dim = first.dimension();
        if pdfs.iter().any(|p| p.dimension() != dim) {
            return Err(SmcError::config("all log-pdfs must have the same dimension"));
        }
        Ok(Self { pdfs })
    }
}

impl LogDensity for SumOfIndependentLogPdfs {
    fn log_density(&self, x: &[f64]) -> f64 {
        self.pdfs.iter().map(|p| p.log_density(x)).sum()
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        let mut total = 0.0;
        let mut grad = vec![0.0; self.dimension()];
        for pdf in &self.pdfs {
            let (v, g) = pdf.log_density_and_gradient(x)?;
            total += v;
            grad.iter_mut().zip(&g).for_each(|(a, b)| *a += b);
        }
        Some((total, grad))
    }

    fn dimension(&self) -> usize {
        self.pdfs[0].dimension()
    }
}

/**
A sum of log-pdfs where selected parameters are shared ("pooled") across all of them.

With `n` pdfs of `d` parameters each, of which `p` are pooled, the search space has
`n·(d − p) + p` parameters: the unpooled parameters of each pdf in order, followed by
the pooled parameters.
*/
pub struct PooledLogPdf {
    pdfs: Vec<Box<dyn LogDensity>>,
    pooled: Vec<bool>,
    n_pooled: usize,
    n_unpooled: usize,
}

impl PooledLogPdf {
    pub fn new(pdfs: Vec<Box<dyn LogDensity>>, pooled: Vec<bool>) -> Result<Self> {
        if pdfs.len() < 2 {
            return Err(SmcError::config("pooling requires at least two log-pdfs"));
        }
        let dim = pdfs[0].dimension();
        if pdfs.iter().any(|p| p.dimension() != dim) {
            return Err(SmcError::config("all pooled log-pdfs must have the same dimension"));
        }
        if pooled.len() != dim {
            return Err(SmcError::config(format!(
                "pooling mask has length {} but the log-pdfs have {} parameters",
                pooled.len(),
                dim
            )));
        }
        let n_pooled = pooled.iter().filter(|&&p| p).count();
        Ok(Self {
            pdfs,
            n_unpooled: dim - n_pooled,
            n_pooled,
            pooled,
        })
    }

    /// Builds the parameter vector of the `idx`-th pdf from the pooled search-space point.
    fn individual(&self, x: &[f64], idx: usize) -> Vec<f64> {
        let shared = &x[x.len() - self.n_pooled..];
        let own = &x[idx * self.n_unpooled..(idx + 1) * self.n_unpooled];
        let (mut s, mut o) = (shared.iter(), own.iter());
        self.pooled
            .iter()
            .map(|&p| if p { s.next() } else { o.next() })
            .map(|v| v.copied().unwrap_or(f64::NAN))
            .collect()
    }
}

impl LogDensity for PooledLogPdf {
    fn log_density(&self, x: &[f64]) -> f64 {
        self.pdfs
            .iter()
            .enumerate()
            .map(|(i, pdf)| pdf.log_density(&self.individual(x, i)))
            .sum()
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        let n = self.dimension();
        let mut total = 0.0;
        let mut grad = vec![0.0; n];
        for (i, pdf) in self.pdfs.iter().enumerate() {
            let (v, partials) = pdf.log_density_and_gradient(&self.individual(x, i))?;
            total += v;
            let mut unpooled = i * self.n_unpooled;
            let mut pooled = n - self.n_pooled;
            for (&is_pooled, d) in self.pooled.iter().zip(&partials) {
                if is_pooled {
                    grad[pooled] += d;
                    pooled += 1;
                } else {
                    grad[unpooled] = *d;
                    unpooled += 1;
                }
            }
        }
        Some((total, grad))
    }

    fn dimension(&self) -> usize {
        self.n_pooled + self.pdfs.len() * self.n_unpooled
    }
}

/// Independent normal prior `x_j ~ N(mean_j, sd_j²)`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianLogPrior {
    pub mean: Vec<f64>,
    pub sd: Vec<f64>,
}

impl GaussianLogPrior {
    pub fn new(mean: Vec<f64>, sd: Vec<f64>) -> Result<Self> {
        if mean.len() != sd.len() || mean.is_empty() {
            return Err(SmcError::config("mean and sd must be non-empty and of equal length"));
        }
        if sd.iter().any(|s| !(*s > 0.0) || !s.is_finite()) {
            return Err(SmcError::config("standard deviations must be positive and finite"));
        }
        Ok(Self { mean, sd })
    }

    /// Same normal for every one of `dim` coordinates.
    pub fn isotropic(dim: usize, mean: f64, sd: f64) -> Result<Self> {
        Self::new(vec![mean; dim], vec![sd; dim])
    }
}

impl LogDensity for GaussianLogPrior {
    fn log_density(&self, x: &[f64]) -> f64 {
        x.iter()
            .zip(self.mean.iter().zip(&self.sd))
            .map(|(&xi, (&m, &s))| {
                let z = (xi - m) / s;
                -0.5 * z * z - s.ln() - 0.5 * (2.0 * PI).ln()
            })
            .sum()
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        let grad = x
            .iter()
            .zip(self.mean.iter().zip(&self.sd))
            .map(|(&xi, (&m, &s))| -(xi - m) / (s * s))
            .collect();
        Some((self.log_density(x), grad))
    }

    fn dimension(&self) -> usize {
        self.mean.len()
    }
}

/// Uniform prior on the box `[lower, upper]`.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformLogPrior {
    lower: Vec<f64>,
    upper: Vec<f64>,
    log_volume: f64,
}

impl UniformLogPrior {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        if lower.len() != upper.len() || lower.is_empty() {
            return Err(SmcError::config("bounds must be non-empty and of equal length"));
        }
        if lower.iter().zip(&upper).any(|(l, u)| !(u > l) || !(u - l).is_finite()) {
            return Err(SmcError::config("upper bounds must be finite and exceed lower bounds"));
        }
        let log_volume = lower.iter().zip(&upper).map(|(l, u)| (u - l).ln()).sum();
        Ok(Self {
            lower,
            upper,
            log_volume,
        })
    }
}

impl LogDensity for UniformLogPrior {
    fn log_density(&self, x: &[f64]) -> f64 {
        let inside = x
            .iter()
            .zip(self.lower.iter().zip(&self.upper))
            .all(|(xi, (l, u))| xi >= l && xi <= u);
        if inside {
            -self.log_volume
        } else {
            f64::NEG_INFINITY
        }
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        Some((self.log_density(x), vec![0.0; x.len()]))
    }

    fn dimension(&self) -> usize {
        self.lower.len()
    }
}

/**
Likelihood of iid observations `y_k ~ N(x, σ² I)` of the parameter vector `x`.

Together with a [`GaussianLogPrior`] this forms a conjugate model with a closed-form
evidence, which makes it a convenient reference problem.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianLogLikelihood {
    observations: Vec<Vec<f64>>,
    sigma: f64,
    dim: usize,
}

impl GaussianLogLikelihood {
    pub fn new(observations: Vec<Vec<f64>>, sigma: f64) -> Result<Self> {
        let Some(dim) = observations.first().map(|o| o.len()) else {
            return Err(SmcError::config("at least one observation is required"));
        };
        if dim == 0 || observations.iter().any(|o| o.len() != dim) {
            return Err(SmcError::config("observations must share a non-zero dimension"));
        }
        if !(sigma > 0.0) || !sigma.is_finite() {
            return Err(SmcError::config("sigma must be positive and finite"));
        }
        Ok(Self {
            observations,
            sigma,
            dim,
        })
    }

    pub fn observations(&self) -> &[Vec<f64>] {
        &self.observations
    }

    pub fn sigma(&self) -> f64 {
        self.sigma
    }
}

impl LogDensity for GaussianLogLikelihood {
    fn log_density(&self, x: &[f64]) -> f64 {
        let var = self.sigma * self.sigma;
        let norm = -0.5 * (2.0 * PI * var).ln() * self.dim as f64;
        self.observations
            .iter()
            .map(|y| {
                let sq: f64 = y.iter().zip(x).map(|(a, b)| (a - b) * (a - b)).sum();
                norm - 0.5 * sq / var
            })
            .sum()
    }

    fn log_density_and_gradient(&self, x: &[f64]) -> Option<(f64, Vec<f64>)> {
        let var = self.sigma * self.sigma;
        let mut grad = vec![0.0; self.dim];
        for y in &self.observations {
            grad.iter_mut()
                .zip(y.iter().zip(x))
                .for_each(|(g, (a, b))| *g += (a - b) / var);
        }
        Some((self.log_density(x), grad))
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Counts how often it is evaluated, to check short-circuiting.
    struct Counting(std::sync::atomic::AtomicUsize);

    impl LogDensity for Counting {
        fn log_density(&self, _x: &[f64]) -> f64 {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            0.0
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    #[test]
    fn gaussian_prior_matches_standard_normal_pdf() {
        let prior = GaussianLogPrior::isotropic(1, 0.0, 1.0).unwrap();
        let p = prior.log_density(&[1.0]).exp();
        assert_abs_diff_eq!(p, 0.24197072451914337, epsilon = 1e-12);
    }

    #[test]
    fn gaussian_prior_gradient() {
        let prior = GaussianLogPrior::new(vec![1.0, -1.0], vec![2.0, 0.5]).unwrap();
        let (_, g) = prior.log_density_and_gradient(&[3.0, 0.0]).unwrap();
        assert_abs_diff_eq!(g[0], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(g[1], -4.0, epsilon = 1e-12);
    }

    #[test]
    fn uniform_prior_support() {
        let prior = UniformLogPrior::new(vec![0.0, 0.0], vec![2.0, 5.0]).unwrap();
        assert_abs_diff_eq!(prior.log_density(&[1.0, 1.0]), -(10.0_f64).ln(), epsilon = 1e-12);
        assert_eq!(prior.log_density(&[-0.1, 1.0]), f64::NEG_INFINITY);
        assert!(UniformLogPrior::new(vec![1.0], vec![1.0]).is_err());
    }

    #[test]
    fn posterior_skips_likelihood_outside_prior_support() {
        let prior = UniformLogPrior::new(vec![0.0], vec![1.0]).unwrap();
        let posterior = LogPosterior::new(Counting(0.into()), prior).unwrap();
        assert_eq!(posterior.log_density(&[2.0]), f64::NEG_INFINITY);
        assert_eq!(posterior.likelihood().0.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_abs_diff_eq!(posterior.log_density(&[0.5]), 0.0, epsilon = 1e-12);
        assert_eq!(posterior.likelihood().0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn posterior_rejects_dimension_mismatch() {
        let prior = GaussianLogPrior::isotropic(2, 0.0, 1.0).unwrap();
        let likelihood = GaussianLogLikelihood::new(vec![vec![0.0]], 1.0).unwrap();
        assert!(matches!(
            LogPosterior::new(likelihood, prior),
            Err(SmcError::Configuration(_))
        ));
    }

    #[test]
    fn posterior_gradient_is_sum_of_parts() {
        let prior = GaussianLogPrior::isotropic(1, 0.0, 1.0).unwrap();
        let likelihood = GaussianLogLikelihood::new(vec![vec![2.0], vec![4.0]], 1.0).unwrap();
        let posterior = LogPosterior::new(likelihood, prior).unwrap();
        let (v, g) = posterior.log_density_and_gradient(&[1.0]).unwrap();
        assert_abs_diff_eq!(v, posterior.log_density(&[1.0]), epsilon = 1e-12);
        // prior: -1, likelihood: (2-1) + (4-1) = 4
        assert_abs_diff_eq!(g[0], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn sum_of_independent_pdfs_adds_values() {
        let a = GaussianLogLikelihood::new(vec![vec![0.0]], 1.0).unwrap();
        let b = GaussianLogLikelihood::new(vec![vec![1.0]], 2.0).unwrap();
        let expected = a.log_density(&[0.3]) + b.log_density(&[0.3]);
        let sum = SumOfIndependentLogPdfs::new(vec![Box::new(a), Box::new(b)]).unwrap();
        assert_abs_diff_eq!(sum.log_density(&[0.3]), expected, epsilon = 1e-12);
        assert!(SumOfIndependentLogPdfs::new(vec![]).is_err());
    }

    #[test]
    fn pooled_pdf_layout_and_gradient() {
        let a = GaussianLogPrior::new(vec![0.0, 0.0], vec![1.0, 1.0]).unwrap();
        let b = GaussianLogPrior::new(vec![1.0, 1.0], vec![1.0, 1.0]).unwrap();
        let pooled = PooledLogPdf::new(
            vec![Box::new(a.clone()), Box::new(b.clone())],
            vec![false, true],
        )
        .unwrap();
        // layout: [a_0, b_0, shared]
        assert_eq!(pooled.dimension(), 3);
        let x = [0.5, 2.0, -1.0];
        let expected = a.log_density(&[0.5, -1.0]) + b.log_density(&[2.0, -1.0]);
        assert_abs_diff_eq!(pooled.log_density(&x), expected, epsilon = 1e-12);

        let (_, g) = pooled.log_density_and_gradient(&x).unwrap();
        assert_abs_diff_eq!(g[0], -0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(g[1], -1.0, epsilon = 1e-12);
        // shared partials: a gives 1.0, b gives 2.0
        assert_abs_diff_eq!(g[2], 3.0, epsilon = 1e-12);
    }

    #[test]
    fn pooled_pdf_validates_inputs() {
        let a = GaussianLogPrior::isotropic(2, 0.0, 1.0).unwrap();
        assert!(PooledLogPdf::new(vec![Box::new(a.clone())], vec![true, false]).is_err());
        assert!(PooledLogPdf::new(
            vec![Box::new(a.clone()), Box::new(a.clone())],
            vec![true]
        )
        .is_err());
    }
}
