//! Per-string progression of a guided tuning session.
//!
//! Two passes over the six strings:
//!   1. recording: each string is plucked, its estimate is staged, and the
//!      user confirms (commit + next string) or retries. After the sixth
//!      confirm the session waits on the calibration exchange.
//!   2. tuning: with targets from the calibration service, each string is
//!      tuned live until the user marks it in tune.
//!
//! `TuningSession` is pure state. It never touches the detector, timers or
//! the network; the controller drives it and owns it exclusively.

use crate::classifier::{Classification, DeviationResult};
use crate::error::{CalibrationError, NoPitchDetected, SessionError};
use crate::types::{default_string_names, STANDARD_TUNING, STRING_COUNT};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

const LAST_STRING: usize = STRING_COUNT - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Recording,
    AwaitingConfirm,
    SendingCalibration,
    ReadyToTune,
    Tuning,
    StringTuned,
    Complete,
}

#[derive(Debug, Clone)]
pub struct TuningSession {
    phase: Phase,
    string_index: usize,
    detected_pitches: [Option<f64>; STRING_COUNT],
    staged_pitch: Option<f64>,
    target_frequencies: [f64; STRING_COUNT],
    default_targets: [f64; STRING_COUNT],
    string_names: [String; STRING_COUNT],
    last_calibration_error: Option<CalibrationError>,
}

impl Default for TuningSession {
    fn default() -> Self {
        Self::new(STANDARD_TUNING, default_string_names())
    }
}

impl TuningSession {
    pub fn new(default_targets: [f64; STRING_COUNT], string_names: [String; STRING_COUNT]) -> Self {
        Self {
            phase: Phase::Idle,
            string_index: 0,
            detected_pitches: [None; STRING_COUNT],
            staged_pitch: None,
            target_frequencies: default_targets,
            default_targets,
            string_names,
            last_calibration_error: None,
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────────

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn string_index(&self) -> usize {
        self.string_index
    }

    pub fn string_name(&self) -> &str {
        &self.string_names[self.string_index]
    }

    pub fn string_names(&self) -> &[String; STRING_COUNT] {
        &self.string_names
    }

    pub fn detected_pitches(&self) -> &[Option<f64>; STRING_COUNT] {
        &self.detected_pitches
    }

    pub fn staged_pitch(&self) -> Option<f64> {
        self.staged_pitch
    }

    pub fn target_frequencies(&self) -> &[f64; STRING_COUNT] {
        &self.target_frequencies
    }

    pub fn current_target(&self) -> f64 {
        self.target_frequencies[self.string_index]
    }

    pub fn committed_count(&self) -> usize {
        self.detected_pitches.iter().filter(|p| p.is_some()).count()
    }

    pub fn last_calibration_error(&self) -> Option<&CalibrationError> {
        self.last_calibration_error.as_ref()
    }

    fn expect(&self, intent: &'static str, allowed: &[Phase]) -> Result<(), SessionError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                intent,
                phase: self.phase,
            })
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("Session: {:?} → {:?} (string {})", self.phase, phase, self.string_index + 1);
        self.phase = phase;
    }

    // ─── Recording pass ─────────────────────────────────────────────────

    /// Full reset to the initial state, from any phase.
    pub fn reset(&mut self) {
        info!("Session reset");
        self.phase = Phase::Idle;
        self.string_index = 0;
        self.detected_pitches = [None; STRING_COUNT];
        self.staged_pitch = None;
        self.target_frequencies = self.default_targets;
        self.last_calibration_error = None;
    }

    pub fn begin_recording(&mut self) -> Result<(), SessionError> {
        self.expect("record", &[Phase::Idle])?;
        self.enter(Phase::Recording);
        Ok(())
    }

    pub fn finish_recording(
        &mut self,
        estimate: Result<f64, NoPitchDetected>,
    ) -> Result<(), SessionError> {
        self.expect("finish recording", &[Phase::Recording])?;
        match estimate {
            Ok(hz) => {
                self.staged_pitch = Some(hz);
                self.enter(Phase::AwaitingConfirm);
            }
            Err(NoPitchDetected) => {
                warn!("No pitch detected on string {}", self.string_index + 1);
                self.enter(Phase::Idle);
            }
        }
        Ok(())
    }

    /// Abandon an in-progress recording, keeping the string index.
    pub fn cancel_recording(&mut self) -> Result<(), SessionError> {
        self.expect("cancel recording", &[Phase::Recording])?;
        self.enter(Phase::Idle);
        Ok(())
    }

    pub fn retry(&mut self) -> Result<(), SessionError> {
        self.expect("retry", &[Phase::AwaitingConfirm])?;
        self.staged_pitch = None;
        self.enter(Phase::Idle);
        Ok(())
    }

    pub fn confirm(&mut self) -> Result<(), SessionError> {
        self.expect("confirm", &[Phase::AwaitingConfirm])?;
        let earlier_missing = self.detected_pitches[..LAST_STRING].contains(&None);
        if self.string_index == LAST_STRING && earlier_missing {
            return Err(SessionError::IncompletePitches {
                committed: self.committed_count(),
            });
        }
        let Some(hz) = self.staged_pitch.take() else {
            // AwaitingConfirm is only entered with a staged value.
            return Err(SessionError::InvalidTransition {
                intent: "confirm",
                phase: self.phase,
            });
        };
        self.detected_pitches[self.string_index] = Some(hz);
        info!("String {} committed at {:.2} Hz", self.string_index + 1, hz);

        if self.string_index < LAST_STRING {
            self.string_index += 1;
            self.enter(Phase::Idle);
        } else {
            self.enter(Phase::SendingCalibration);
        }
        Ok(())
    }

    // ─── Calibration exchange ───────────────────────────────────────────

    /// The six committed pitches, available only while the exchange is due.
    pub fn pitches_for_calibration(&self) -> Result<[f64; STRING_COUNT], SessionError> {
        self.expect("send pitches", &[Phase::SendingCalibration])?;
        let mut pitches = [0.0; STRING_COUNT];
        for (slot, pitch) in pitches.iter_mut().zip(self.detected_pitches.iter()) {
            *slot = pitch.ok_or_else(|| SessionError::IncompletePitches {
                committed: self.committed_count(),
            })?;
        }
        Ok(pitches)
    }

    pub fn calibration_succeeded(
        &mut self,
        targets: [f64; STRING_COUNT],
    ) -> Result<(), SessionError> {
        self.expect("accept targets", &[Phase::SendingCalibration])?;
        self.target_frequencies = targets;
        self.string_index = 0;
        self.last_calibration_error = None;
        info!("Calibration targets: {:?}", targets);
        self.enter(Phase::ReadyToTune);
        Ok(())
    }

    /// Record a failed exchange. The session stays in `SendingCalibration`
    /// with every committed pitch intact so the same request can be retried.
    pub fn calibration_failed(&mut self, err: CalibrationError) -> Result<(), SessionError> {
        self.expect("record calibration failure", &[Phase::SendingCalibration])?;
        warn!("Calibration failed: {}", err);
        self.last_calibration_error = Some(err);
        Ok(())
    }

    // ─── Tuning pass ────────────────────────────────────────────────────

    pub fn begin_tuning(&mut self) -> Result<(), SessionError> {
        self.expect("begin tuning", &[Phase::ReadyToTune])?;
        self.enter(Phase::Tuning);
        Ok(())
    }

    /// Track the latest live reading: an in-tune reading moves the string to
    /// `StringTuned`, a sharp or flat one moves it back to `Tuning`.
    pub fn observe(&mut self, deviation: &DeviationResult) {
        match (self.phase, deviation.classification) {
            (Phase::Tuning, Classification::InTune) => self.enter(Phase::StringTuned),
            (Phase::StringTuned, Classification::TooHigh | Classification::TooLow) => {
                self.enter(Phase::Tuning)
            }
            _ => {}
        }
    }

    pub fn string_in_tune(&mut self) -> Result<(), SessionError> {
        self.expect("mark string in tune", &[Phase::Tuning, Phase::StringTuned])?;
        if self.string_index < LAST_STRING {
            self.string_index += 1;
            self.enter(Phase::ReadyToTune);
        } else {
            info!("All strings tuned");
            self.enter(Phase::Complete);
        }
        Ok(())
    }
}
