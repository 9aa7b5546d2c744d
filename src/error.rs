//! Error types for the SMC sampler.

use thiserror::Error;

/// Errors raised while configuring or running an [`SmcSampler`](crate::smc::SmcSampler).
#[derive(Error, Debug)]
pub enum SmcError {
    /// Invalid settings, detected before any particle is touched.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation was called in the wrong lifecycle state.
    #[error("state error: {0}")]
    State(String),

    /// The particle population degenerated beyond recovery.
    #[error("numerical error: {0}")]
    Numerical(String),

    /// The batch evaluator could not evaluate the log-density.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// The run was interrupted between two temperatures.
    #[error("run cancelled after {completed} temperatures")]
    Cancelled { completed: usize },

    /// I/O error
    #[cfg(feature = "csv")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV formatting error
    #[cfg(feature = "csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SmcError>;

impl SmcError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SmcError::Configuration(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        SmcError::State(msg.into())
    }

    pub(crate) fn numerical(msg: impl Into<String>) -> Self {
        SmcError::Numerical(msg.into())
    }
}
