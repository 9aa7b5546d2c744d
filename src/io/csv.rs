/*!
# I/O Utilities for Saving SMC Output to CSV

Functions to save posterior samples and per-temperature run diagnostics as CSV files.
Enable via the `csv` feature.
*/

use std::fs::File;
use std::path::Path;

use csv::Writer;
use nalgebra as na;

use crate::error::{Result, SmcError};
use crate::schedule::TemperatureSchedule;
use crate::smc::RunState;

/**
Saves posterior samples (one row per sample) as a CSV file.

The file has a header row `sample,dim_0,dim_1,...` followed by one row per sample.

# Examples

```rust
use mini_smc::io::csv::save_samples_csv;
use nalgebra::DMatrix;

// 2 samples in 3 dimensions
let samples = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
save_samples_csv(&samples, "/tmp/smc_samples.csv")?;
# Ok::<(), mini_smc::error::SmcError>(())
```
*/
pub fn save_samples_csv<P: AsRef<Path>>(samples: &na::DMatrix<f64>, path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);

    let mut header = vec!["sample".to_string()];
    header.extend((0..samples.ncols()).map(|i| format!("dim_{i}")));
    wtr.write_record(&header)?;

    for (sample_idx, row) in samples.row_iter().enumerate() {
        let mut record = vec![sample_idx.to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    Ok(())
}

/**
Saves the per-temperature history of a run.

Columns are `iteration,temperature,ess,acceptance_rate,resampled`. Row `t` describes
temperature `β_t`: the ESS of the weights targeting it, the acceptance rate of the
mutation step run at it, and whether the population was resampled during it.
*/
pub fn save_history_csv<P: AsRef<Path>>(
    run_state: &RunState,
    schedule: &TemperatureSchedule,
    path: P,
) -> Result<()> {
    let n = run_state.acceptance_rates.len();
    if n >= schedule.len() || run_state.resampled.len() != n {
        return Err(SmcError::state(
            "run history does not match the temperature schedule",
        ));
    }
    let mut wtr = Writer::from_writer(File::create(path)?);
    wtr.write_record(["iteration", "temperature", "ess", "acceptance_rate", "resampled"])?;

    for t in 1..=n {
        let ess = run_state
            .ess_history
            .get(t - 1)
            .map(|e| e.to_string())
            .unwrap_or_default();
        wtr.write_record(&[
            t.to_string(),
            schedule.get(t).to_string(),
            ess,
            run_state.acceptance_rates[t - 1].to_string(),
            run_state.resampled[t - 1].to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
