//! Latency statistics over per-iteration timings.

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::Summary;

/// Summarize raw timings of one run.
///
/// The first sample is the cold-start warm-up and is discarded. The rest are
/// sorted ascending for display and reduced to a mean and a Bessel-corrected
/// standard deviation. A single retained sample has a deviation of zero.
pub fn summarize(name: &str, raw_samples: &[f64]) -> Result<Summary> {
    let mut samples = match raw_samples.split_first() {
        Some((_, rest)) if !rest.is_empty() => rest.to_vec(),
        _ => {
            return Err(Error::InsufficientSamples {
                name: name.to_string(),
            })
        }
    };
    samples.sort_by(|a, b| a.total_cmp(b));

    let mean_ms = mean(&samples);
    let std_ms = sample_std(&samples, mean_ms);

    Ok(Summary {
        run_id: Uuid::new_v4(),
        name: name.to_string(),
        mean_ms,
        std_ms,
        samples,
        completed_at: Utc::now(),
    })
}

fn mean(samples: &[f64]) -> f64 {
    samples.iter().sum::<f64>() / samples.len() as f64
}

fn sample_std(samples: &[f64], mean: f64) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|s| (s - mean) * (s - mean)).sum();
    (sum_sq / (samples.len() - 1) as f64).sqrt()
}
