//! Error taxonomy for tuning sessions.
//!
//! Every error here is recoverable from the user's point of view: the
//! controller turns them into status text and leaves the session in a state
//! where the same intent can be issued again.

use crate::session::Phase;
use thiserror::Error;

/// The recording window produced no plausible pitch. Retry the same string.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No pitch detected")]
pub struct NoPitchDetected;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// The service answered but refused the pitches (`success: false` or a
    /// response without six targets).
    #[error("Calibration rejected: {0}")]
    Rejected(String),
    /// The service could not be reached or did not answer with JSON.
    #[error("Connection error: {0}")]
    Unreachable(String),
}

/// Misuse of the detector's callback slot. The controller prevents these by
/// construction; seeing one means a caller broke the activate/deactivate
/// discipline.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyError {
    #[error("note callback is already intercepted")]
    AlreadyActive,
    #[error("note callback slot is intercepted; host callback not installed")]
    SlotBusy,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot {intent} while {phase:?}")]
    InvalidTransition { intent: &'static str, phase: Phase },
    #[error("only {committed} of 6 string pitches committed")]
    IncompletePitches { committed: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Invalid Tunings for a Guitar")]
    InvalidTuning,
    #[error(
        "bridge model did not converge after {iterations} iterations (residual {residual:.3e} Hz)"
    )]
    DidNotConverge { iterations: usize, residual: f64 },
    #[error("bridge model Jacobian is singular")]
    Singular,
}
