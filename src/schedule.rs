//! Temperature schedules for annealing from the prior (`β = 0`) to the posterior (`β = 1`).

use crate::error::{Result, SmcError};

/// Smallest non-zero temperature of a generated geometric schedule.
pub const MIN_TEMPERATURE: f64 = 1e-4;

/// How a schedule is requested: a number of temperatures, or the temperatures themselves.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
    Count(usize),
    Explicit(Vec<f64>),
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        ScheduleSpec::Count(10)
    }
}

impl From<usize> for ScheduleSpec {
    fn from(k: usize) -> Self {
        ScheduleSpec::Count(k)
    }
}

impl From<Vec<f64>> for ScheduleSpec {
    fn from(values: Vec<f64>) -> Self {
        ScheduleSpec::Explicit(values)
    }
}

/**
An immutable, non-decreasing sequence of temperatures `0 = β₀ ≤ β₁ ≤ … ≤ β_T = 1`.

# Examples

```rust
use mini_smc::schedule::TemperatureSchedule;

let schedule = TemperatureSchedule::geometric(5).unwrap();
assert_eq!(schedule.len(), 5);
assert_eq!(schedule.get(0), 0.0);
assert_eq!(schedule.last(), 1.0);

assert!(TemperatureSchedule::new(vec![0.1, 1.0]).is_err());
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureSchedule {
    temperatures: Vec<f64>,
}

impl TemperatureSchedule {
    /// Validates an explicit schedule.
    pub fn new(temperatures: Vec<f64>) -> Result<Self> {
        if temperatures.len() < 2 {
            return Err(SmcError::config(
                "a schedule must contain at least two temperatures",
            ));
        }
        if temperatures[0] != 0.0 {
            return Err(SmcError::config(
                "first element of temperature schedule must be 0",
            ));
        }
        if let Some(t) = temperatures.iter().find(|t| !(0.0..=1.0).contains(*t)) {
            return Err(SmcError::config(format!(
                "temperatures must lie in [0, 1], got {t}"
            )));
        }
        if temperatures.windows(2).any(|w| w[1] < w[0]) {
            return Err(SmcError::config("temperatures must be non-decreasing"));
        }
        if temperatures[temperatures.len() - 1] != 1.0 {
            return Err(SmcError::config(
                "last element of temperature schedule must be 1",
            ));
        }
        Ok(Self { temperatures })
    }

    /// `k` temperatures: zero, followed by `k - 1` values spaced uniformly on the
    /// log scale between [`MIN_TEMPERATURE`] and 1.
    pub fn geometric(k: usize) -> Result<Self> {
        if k < 2 {
            return Err(SmcError::config(
                "a schedule must contain at least two temperatures",
            ));
        }
        let n = k - 1;
        let a_min = MIN_TEMPERATURE.ln();
        let mut temperatures = Vec::with_capacity(k);
        temperatures.push(0.0);
        if n == 1 {
            temperatures.push(1.0);
        } else {
            temperatures.extend((0..n).map(|i| {
                let frac = i as f64 / (n - 1) as f64;
                (a_min * (1.0 - frac)).exp()
            }));
        }
        Ok(Self { temperatures })
    }

    pub fn from_spec(spec: &ScheduleSpec) -> Result<Self> {
        match spec {
            ScheduleSpec::Count(k) => Self::geometric(*k),
            ScheduleSpec::Explicit(values) => Self::new(values.clone()),
        }
    }

    pub fn len(&self) -> usize {
        self.temperatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.temperatures.is_empty()
    }

    pub fn get(&self, i: usize) -> f64 {
        self.temperatures[i]
    }

    pub fn last(&self) -> f64 {
        self.temperatures[self.temperatures.len() - 1]
    }

    pub fn temperatures(&self) -> &[f64] {
        &self.temperatures
    }
}
