pub mod distributions;
pub mod error;
pub mod evaluator;
pub mod io;
pub mod kernel;
pub mod population;
pub mod schedule;
pub mod smc;
pub mod stats;
