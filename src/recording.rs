//! Time-boxed collection of detector readings for one string.
//!
//! A window ends in one of two ways:
//!   - early stop: a reading arrives after `early_stop` has elapsed. This path
//!     is driven by events only; a silent window never takes it.
//!   - hard timeout: the `deadline` channel fires after `hard_timeout`,
//!     whether or not anything was heard.
//!
//! Both paths go through `finish`, which is single-shot. The first caller
//! consumes the window and swaps the deadline for `never()`, so a timer that
//! was already queued behind an early stop is a no-op.

use crate::error::NoPitchDetected;
use crate::filter;
use crate::types::NoteEvent;
use crossbeam_channel::{at, never, Receiver};
use log::{debug, info};
use std::time::{Duration, Instant};

pub const EARLY_STOP_MS: u64 = 1000;
pub const HARD_TIMEOUT_MS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTiming {
    pub early_stop: Duration,
    pub hard_timeout: Duration,
}

impl Default for WindowTiming {
    fn default() -> Self {
        Self {
            early_stop: Duration::from_millis(EARLY_STOP_MS),
            hard_timeout: Duration::from_millis(HARD_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowTrigger {
    EarlyStop,
    HardTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    pub attempt: u64,
    pub trigger: WindowTrigger,
    pub sample_count: usize,
    pub estimate: Result<f64, NoPitchDetected>,
}

pub struct RecordingWindow {
    attempt: u64,
    samples: Vec<f64>,
    started: Instant,
    timing: WindowTiming,
    deadline: Receiver<Instant>,
    finished: bool,
}

impl RecordingWindow {
    pub fn start(attempt: u64, timing: WindowTiming) -> Self {
        Self::start_at(attempt, timing, Instant::now())
    }

    pub fn start_at(attempt: u64, timing: WindowTiming, started: Instant) -> Self {
        debug!(
            "Recording window #{} opened (early stop {:?}, hard timeout {:?})",
            attempt, timing.early_stop, timing.hard_timeout
        );
        Self {
            attempt,
            samples: Vec::new(),
            started,
            timing,
            deadline: at(started + timing.hard_timeout),
            finished: false,
        }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fires once at the hard timeout; `never()` after the window finishes.
    pub fn deadline(&self) -> &Receiver<Instant> {
        &self.deadline
    }

    /// Record one reading. Returns the outcome if this reading ended the window.
    pub fn on_note(&mut self, event: &NoteEvent, now: Instant) -> Option<WindowOutcome> {
        if self.finished {
            return None;
        }
        if let Some(hz) = event.frequency {
            self.samples.push(hz);
        }
        if now.saturating_duration_since(self.started) > self.timing.early_stop {
            return self.finish(WindowTrigger::EarlyStop);
        }
        None
    }

    /// The deadline fired. Returns None if the window already finished.
    pub fn on_timeout(&mut self) -> Option<WindowOutcome> {
        self.finish(WindowTrigger::HardTimeout)
    }

    /// Abandon the window without an outcome. Returns false if it had
    /// already finished.
    pub fn cancel(&mut self) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.deadline = never();
        debug!("Recording window #{} cancelled", self.attempt);
        true
    }

    fn finish(&mut self, trigger: WindowTrigger) -> Option<WindowOutcome> {
        if self.finished {
            return None;
        }
        self.finished = true;
        self.deadline = never();

        let estimate = filter::reduce(&self.samples);
        info!(
            "Recording window #{} finished by {:?}: {} readings → {}",
            self.attempt,
            trigger,
            self.samples.len(),
            match estimate {
                Ok(hz) => format!("{:.2} Hz", hz),
                Err(e) => e.to_string(),
            }
        );
        Some(WindowOutcome {
            attempt: self.attempt,
            trigger,
            sample_count: self.samples.len(),
            estimate,
        })
    }
}
