//! Reduces a window of raw detector readings to one pitch estimate.

use crate::error::NoPitchDetected;
use std::ops::RangeInclusive;

/// Fundamentals a six-string can plausibly produce, with margin on both ends.
/// Anything outside is an octave error, a harmonic or noise.
pub const PLAUSIBLE_HZ: RangeInclusive<f64> = 60.0..=375.0;

/// Keep plausible readings, sort them, and return the element at `n / 2`.
///
/// For an even count this is the upper of the two middle readings rather
/// than their mean, so the estimate is always a frequency that was actually
/// observed.
pub fn reduce(samples: &[f64]) -> Result<f64, NoPitchDetected> {
    let mut kept: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|hz| PLAUSIBLE_HZ.contains(hz))
        .collect();
    if kept.is_empty() {
        return Err(NoPitchDetected);
    }
    kept.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    Ok(kept[kept.len() / 2])
}
