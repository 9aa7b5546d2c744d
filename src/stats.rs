//! Numerically stable weight arithmetic and summary statistics for particle populations.

use nalgebra as na;
use num_traits::Float;

/// Computes `log(Σ exp(x_i))` without overflow.
///
/// Returns negative infinity for an empty slice or when every entry is `-∞`.
pub fn log_sum_exp<T: Float>(values: &[T]) -> T {
    let max = values
        .iter()
        .copied()
        .fold(T::neg_infinity(), |acc, v| if v > acc { v } else { acc });
    if max == T::neg_infinity() || max == T::infinity() {
        return max;
    }
    let sum = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - max).exp());
    max + sum.ln()
}

/// Shifts log-weights in place so that they exponentiate to a probability vector.
///
/// Returns the log normaliser that was subtracted, or `None` if every
/// weight is `-∞` (nothing to normalise).
pub fn normalize_log_weights<T: Float>(log_weights: &mut [T]) -> Option<T> {
    let lse = log_sum_exp(log_weights);
    if !lse.is_finite() {
        return None;
    }
    log_weights.iter_mut().for_each(|w| *w = *w - lse);
    Some(lse)
}

/// Exponentiates normalised log-weights.
pub fn weights_from_log<T: Float>(log_weights: &[T]) -> Vec<T> {
    log_weights.iter().map(|w| w.exp()).collect()
}

/// Effective sample size `1 / Σ w_i²` of a normalised weight vector.
pub fn effective_sample_size<T: Float>(weights: &[T]) -> T {
    let sum_sq = weights.iter().fold(T::zero(), |acc, &w| acc + w * w);
    if sum_sq > T::zero() {
        T::one() / sum_sq
    } else {
        T::zero()
    }
}

/// Row mean of a sample matrix (`n_samples × dim`).
pub fn mean(samples: &na::DMatrix<f64>) -> na::DVector<f64> {
    samples.row_mean().transpose()
}

/// Unbiased sample covariance of a sample matrix (`n_samples × dim`).
///
/// Returns `None` when fewer than two samples are available.
pub fn cov(samples: &na::DMatrix<f64>) -> Option<na::DMatrix<f64>> {
    let n = samples.nrows();
    if n < 2 {
        return None;
    }
    let mean = samples.row_mean();
    let mut centered = samples.clone();
    for mut row in centered.row_iter_mut() {
        row -= &mean;
    }
    Some(centered.transpose() * centered / (n as f64 - 1.0))
}
