use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Note events from the pitch detector ────────────────────────────────────

/// One resolved (or unresolved) pitch reading pushed by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// Note name as reported by the detector, e.g. "E2".
    pub name: String,
    /// Fundamental frequency in Hz. None when the detector heard something
    /// but could not resolve a pitch.
    pub frequency: Option<f64>,
}

impl NoteEvent {
    pub fn pitched(frequency: f64) -> Self {
        Self {
            name: hz_to_note_name(frequency),
            frequency: Some(frequency),
        }
    }

    pub fn unpitched() -> Self {
        Self {
            name: "---".to_string(),
            frequency: None,
        }
    }
}

impl fmt::Display for NoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frequency {
            Some(hz) => write!(f, "{} ({:.2} Hz)", self.name, hz),
            None => write!(f, "{} (no pitch)", self.name),
        }
    }
}

// ─── Constants ──────────────────────────────────────────────────────────────

pub const STRING_COUNT: usize = 6;

/// Standard tuning, index 0 = 1st string (high E).
pub const STANDARD_TUNING: [f64; STRING_COUNT] = [329.63, 246.94, 196.00, 146.83, 110.00, 82.41];

pub const STRING_NAMES: [&str; STRING_COUNT] = ["1:E4", "2:B3", "3:G3", "4:D3", "5:A2", "6:E2"];

pub fn default_string_names() -> [String; STRING_COUNT] {
    STRING_NAMES.map(str::to_string)
}

// ─── Pitch helpers ──────────────────────────────────────────────────────────

/// Nearest note name with a cents suffix, e.g. "E2", "A2+7", "B3-12".
pub fn hz_to_note_name(hz: f64) -> String {
    if hz.is_nan() || hz < 20.0 {
        return "---".to_string();
    }
    let midi = 69.0 + 12.0 * (hz / 440.0).log2();
    let note_num = midi.round() as i32;
    let cents = ((midi - note_num as f64) * 100.0).round() as i32;

    let note_names = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let name = note_names[((note_num % 12 + 12) % 12) as usize];
    let octave = (note_num / 12) - 1;

    if cents == 0 {
        format!("{}{}", name, octave)
    } else if cents > 0 {
        format!("{}{}+{}", name, octave, cents)
    } else {
        format!("{}{}{}", name, octave, cents)
    }
}
