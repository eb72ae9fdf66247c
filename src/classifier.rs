//! Live tuning feedback: how far a reading is from the string's target.

use serde::{Deserialize, Serialize};

/// Readings further than this from the target are treated as noise or the
/// wrong string and produce no visual update.
pub const IGNORE_BEYOND_HZ: f64 = 10.0;
/// Open interval around the target that counts as in tune.
pub const IN_TUNE_WITHIN_HZ: f64 = 1.0;
/// Gauge half-span in percent. Consumers add a 50% baseline to centre it.
pub const GAUGE_HALF_SPAN: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    InTune,
    /// Sharp: the string must be lowered.
    TooHigh,
    /// Flat: the string must be raised.
    TooLow,
    Ignored,
}

impl Classification {
    pub fn advice(&self) -> &'static str {
        match self {
            Classification::InTune => "In tune",
            Classification::TooHigh => "Too high, loosen the string",
            Classification::TooLow => "Too low, tighten the string",
            Classification::Ignored => "Out of range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviationResult {
    /// detected - target, in Hz.
    pub diff: f64,
    /// Gauge needle offset in [-50, 50].
    pub indicator_percent: f64,
    pub classification: Classification,
}

/// A non-finite reading (NaN or infinite) is `Ignored` with the needle
/// left at the centre.
pub fn classify(detected: f64, target: f64) -> DeviationResult {
    let diff = detected - target;
    if !diff.is_finite() {
        return DeviationResult {
            diff,
            indicator_percent: 0.0,
            classification: Classification::Ignored,
        };
    }
    let indicator_percent = (diff / IGNORE_BEYOND_HZ).clamp(-1.0, 1.0) * GAUGE_HALF_SPAN;
    let classification = if diff.abs() > IGNORE_BEYOND_HZ {
        Classification::Ignored
    } else if diff.abs() < IN_TUNE_WITHIN_HZ {
        Classification::InTune
    } else if diff > 0.0 {
        Classification::TooHigh
    } else {
        Classification::TooLow
    };
    DeviationResult {
        diff,
        indicator_percent,
        classification,
    }
}
