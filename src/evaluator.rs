//! Batch evaluation of a log-density over many points, sequentially or on a rayon pool.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::distributions::LogDensity;
use crate::error::{Result, SmcError};

/// Evaluates a log-density at many points, returning values in input order.
pub trait Evaluator: Send + Sync {
    fn evaluate<F: LogDensity + ?Sized>(&self, f: &F, points: &[Vec<f64>]) -> Result<Vec<f64>>;
}

/// Evaluates points one after another on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialEvaluator;

impl Evaluator for SequentialEvaluator {
    fn evaluate<F: LogDensity + ?Sized>(&self, f: &F, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(points.iter().map(|x| f.log_density(x)).collect())
    }
}

/**
Evaluates points in parallel on a dedicated rayon thread pool.

Results are collected in input order, so switching between this and
[`SequentialEvaluator`] never changes what the sampler computes.

# Examples

```rust
use mini_smc::distributions::GaussianLogPrior;
use mini_smc::evaluator::{Evaluator, ParallelEvaluator};

let prior = GaussianLogPrior::isotropic(1, 0.0, 1.0).unwrap();
let evaluator = ParallelEvaluator::new(2).unwrap();
let values = evaluator.evaluate(&prior, &[vec![0.0], vec![1.0]]).unwrap();
assert!(values[0] > values[1]);
```
*/
pub struct ParallelEvaluator {
    pool: ThreadPool,
    n_workers: usize,
}

impl ParallelEvaluator {
    pub fn new(n_workers: usize) -> Result<Self> {
        if n_workers == 0 {
            return Err(SmcError::config("a parallel evaluator needs at least one worker"));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_workers)
            .thread_name(|i| format!("smc-eval-{i}"))
            .build()
            .map_err(|e| SmcError::Evaluation(format!("could not start worker pool: {e}")))?;
        Ok(Self { pool, n_workers })
    }

    /// One worker per available core.
    pub fn with_available_parallelism() -> Result<Self> {
        let n_workers = match std::thread::available_parallelism() {
            Ok(v) => v.get(),
            Err(e) => {
                log::warn!("could not get number of threads ({e}); defaulting to 1");
                1
            }
        };
        Self::new(n_workers)
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }
}

impl std::fmt::Debug for ParallelEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelEvaluator")
            .field("n_workers", &self.n_workers)
            .finish()
    }
}

impl Evaluator for ParallelEvaluator {
    fn evaluate<F: LogDensity + ?Sized>(&self, f: &F, points: &[Vec<f64>]) -> Result<Vec<f64>> {
        Ok(self
            .pool
            .install(|| points.par_iter().map(|x| f.log_density(x)).collect()))
    }
}
