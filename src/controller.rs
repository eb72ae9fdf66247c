use crate::calibration::CalibrationService;
use crate::classifier::{classify, Classification, DeviationResult};
use crate::detector::{Interception, NoteDetector};
use crate::error::{ProxyError, SessionError};
use crate::pitch_log::PitchRound;
use crate::recording::{RecordingWindow, WindowOutcome, WindowTiming};
use crate::session::{Phase, TuningSession};
use crate::types::{hz_to_note_name, NoteEvent, STRING_COUNT};
use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use std::time::Instant;

/// What the presentation layer can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIntent {
    /// Open the tuner. Always starts a fresh session.
    Activate,
    /// Close the tuner, abandoning any recording or live loop.
    Deactivate,
    RecordString,
    Confirm,
    /// Discard the staged pitch, or re-send the pitches after a failed exchange.
    Retry,
    BeginTuning,
    StringInTune,
}

pub enum ControlEvent {
    Intent(UserIntent),
    /// A reading forwarded by an interception. `subscription` identifies the
    /// interception that produced it; readings from released ones are dropped.
    Note { subscription: u64, event: NoteEvent },
    Shutdown,
}

/// Sending half handed to the presentation layer.
#[derive(Clone)]
pub struct Intents {
    tx: Sender<ControlEvent>,
}

impl Intents {
    /// Returns false once the controller has stopped.
    pub fn send(&self, intent: UserIntent) -> bool {
        self.tx.send(ControlEvent::Intent(intent)).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ControlEvent::Shutdown);
    }
}

/// Snapshot of everything a display needs. Views are rebuilt from the
/// session after every change; nothing in them is retained UI state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    pub active: bool,
    pub phase: Phase,
    pub string_index: usize,
    pub string_name: String,
    pub string_names: [String; STRING_COUNT],
    pub status: String,
    pub staged_pitch: Option<f64>,
    pub target_hz: f64,
    pub detected_pitches: [Option<f64>; STRING_COUNT],
    pub target_frequencies: [f64; STRING_COUNT],
    pub deviation: Option<DeviationResult>,
    pub calibration_error: Option<String>,
}

/// Everything the controller talks to, handed in at construction.
pub struct SessionContext {
    pub detector: NoteDetector,
    pub calibration: Box<dyn CalibrationService + Send>,
    pub view_txs: Vec<Sender<SessionView>>,
    pub pitch_log_tx: Option<Sender<PitchRound>>,
    pub timing: WindowTiming,
}

/// Owns the `TuningSession` and is the only thing that mutates it.
///
/// All stimuli (user intents, forwarded detector readings, window deadlines)
/// arrive on one thread and are handled in order, so no two transitions ever
/// run concurrently. The detector thread never touches the session: an
/// interception only forwards readings into the controller's channel.
pub struct SessionController {
    rx: Receiver<ControlEvent>,
    tx: Sender<ControlEvent>,
    ctx: SessionContext,
    session: TuningSession,
    active: bool,
    window: Option<RecordingWindow>,
    interception: Option<Interception>,
    subscription: u64,
    attempts: u64,
    status: String,
    deviation: Option<DeviationResult>,
}

impl SessionController {
    pub fn new(ctx: SessionContext, session: TuningSession) -> (Self, Intents) {
        let (tx, rx) = unbounded();
        let intents = Intents { tx: tx.clone() };
        let controller = Self {
            rx,
            tx,
            ctx,
            session,
            active: false,
            window: None,
            interception: None,
            subscription: 0,
            attempts: 0,
            status: "Tuner closed".to_string(),
            deviation: None,
        };
        (controller, intents)
    }

    /// Process events until `Shutdown`. Blocks the calling thread.
    pub fn run(&mut self) {
        info!(
            "Session controller running (early stop {:?}, hard timeout {:?})",
            self.ctx.timing.early_stop, self.ctx.timing.hard_timeout
        );
        self.publish();

        let rx = self.rx.clone();
        loop {
            let deadline = self
                .window
                .as_ref()
                .map(|w| w.deadline().clone())
                .unwrap_or_else(never);
            select! {
                recv(rx) -> msg => match msg {
                    Ok(ControlEvent::Intent(intent)) => self.handle_intent(intent),
                    Ok(ControlEvent::Note { subscription, event }) => {
                        self.handle_note(subscription, &event)
                    }
                    Ok(ControlEvent::Shutdown) | Err(_) => break,
                },
                recv(deadline) -> _ => self.handle_timeout(),
            }
        }

        self.release();
        info!("Session controller stopped");
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            active: self.active,
            phase: self.session.phase(),
            string_index: self.session.string_index(),
            string_name: self.session.string_name().to_string(),
            string_names: self.session.string_names().clone(),
            status: self.status.clone(),
            staged_pitch: self.session.staged_pitch(),
            target_hz: self.session.current_target(),
            detected_pitches: *self.session.detected_pitches(),
            target_frequencies: *self.session.target_frequencies(),
            deviation: self.deviation,
            calibration_error: self.session.last_calibration_error().map(|e| e.to_string()),
        }
    }

    fn publish(&self) {
        let view = self.view();
        for tx in &self.ctx.view_txs {
            let _ = tx.send(view.clone());
        }
    }

    // ─── Detector subscription ──────────────────────────────────────────

    fn listen(&mut self) -> Result<(), ProxyError> {
        self.stop_listening();
        self.subscription += 1;
        let subscription = self.subscription;
        let tx = self.tx.clone();
        let interception = self.ctx.detector.intercept(Box::new(move |event: &NoteEvent| {
            let _ = tx.send(ControlEvent::Note {
                subscription,
                event: event.clone(),
            });
        }))?;
        self.interception = Some(interception);
        Ok(())
    }

    fn stop_listening(&mut self) {
        if let Some(interception) = self.interception.take() {
            interception.deactivate();
        }
    }

    /// Cancel any pending window and give the callback slot back.
    fn release(&mut self) {
        if let Some(mut window) = self.window.take() {
            window.cancel();
        }
        self.stop_listening();
    }

    // ─── Intents ────────────────────────────────────────────────────────

    fn handle_intent(&mut self, intent: UserIntent) {
        debug!("Intent {:?} in {:?}", intent, self.session.phase());
        if !self.active && intent != UserIntent::Activate {
            debug!("Tuner inactive; ignoring {:?}", intent);
            return;
        }
        let result = match intent {
            UserIntent::Activate => {
                self.activate();
                Ok(())
            }
            UserIntent::Deactivate => {
                self.deactivate();
                Ok(())
            }
            UserIntent::RecordString => self.record_string(),
            UserIntent::Confirm => self.confirm(),
            UserIntent::Retry => self.retry(),
            UserIntent::BeginTuning => self.begin_tuning(),
            UserIntent::StringInTune => self.string_in_tune(),
        };
        if let Err(e) = result {
            warn!("Ignoring {:?}: {}", intent, e);
        }
        self.publish();
    }

    fn activate(&mut self) {
        self.release();
        self.session.reset();
        self.active = true;
        self.deviation = None;
        self.status = format!("Pluck {} and press record", self.session.string_name());
        info!("Tuner activated");
    }

    fn deactivate(&mut self) {
        if self.session.phase() == Phase::Recording {
            let _ = self.session.cancel_recording();
        }
        self.release();
        self.active = false;
        self.deviation = None;
        self.status = "Tuner closed".to_string();
        info!("Tuner deactivated in {:?}", self.session.phase());
    }

    fn record_string(&mut self) -> Result<(), SessionError> {
        self.session.begin_recording()?;
        self.attempts += 1;
        self.window = Some(RecordingWindow::start(self.attempts, self.ctx.timing));
        if let Err(e) = self.listen() {
            error!("Cannot record: {}", e);
            self.release();
            let _ = self.session.cancel_recording();
            self.status = format!("Detector unavailable: {}", e);
            return Ok(());
        }
        self.status = format!("Listening to {}...", self.session.string_name());
        Ok(())
    }

    fn confirm(&mut self) -> Result<(), SessionError> {
        self.session.confirm()?;
        if self.session.phase() == Phase::SendingCalibration {
            self.status = "Sending pitches to the calibration service...".to_string();
            self.publish();
            self.calibrate();
        } else {
            self.status = format!("Pluck {} and press record", self.session.string_name());
        }
        Ok(())
    }

    fn retry(&mut self) -> Result<(), SessionError> {
        if self.session.phase() == Phase::SendingCalibration {
            info!("Re-sending pitches");
            self.calibrate();
            return Ok(());
        }
        self.session.retry()?;
        self.status = format!("Pluck {} again and press record", self.session.string_name());
        Ok(())
    }

    fn begin_tuning(&mut self) -> Result<(), SessionError> {
        self.session.begin_tuning()?;
        self.deviation = None;
        if let Err(e) = self.listen() {
            error!("Cannot start live tuning: {}", e);
            self.status = format!("Detector unavailable: {}", e);
            return Ok(());
        }
        self.status = self.tune_prompt();
        Ok(())
    }

    fn string_in_tune(&mut self) -> Result<(), SessionError> {
        self.session.string_in_tune()?;
        self.stop_listening();
        self.deviation = None;
        self.status = if self.session.phase() == Phase::Complete {
            "All strings tuned".to_string()
        } else {
            format!("Next: {}. Press tune when ready", self.session.string_name())
        };
        Ok(())
    }

    fn tune_prompt(&self) -> String {
        let target = self.session.current_target();
        format!(
            "Tune {} to {:.2} Hz ({})",
            self.session.string_name(),
            target,
            hz_to_note_name(target)
        )
    }

    // ─── Calibration exchange ───────────────────────────────────────────

    /// Runs on the controller thread, so no second exchange can start while
    /// this one is outstanding.
    fn calibrate(&mut self) {
        let pitches = match self.session.pitches_for_calibration() {
            Ok(p) => p,
            Err(e) => {
                error!("Calibration requested without pitches: {}", e);
                return;
            }
        };
        info!("Requesting targets for {:?}", pitches);
        match self.ctx.calibration.send_pitches(&pitches) {
            Ok(targets) => {
                if let Err(e) = self.session.calibration_succeeded(targets) {
                    error!("Targets arrived in the wrong phase: {}", e);
                    return;
                }
                if let Some(tx) = &self.ctx.pitch_log_tx {
                    let _ = tx.send(PitchRound::now(pitches, targets));
                }
                self.status = format!("Targets received. {}", self.tune_prompt());
            }
            Err(e) => {
                self.status = format!("{}. Press retry to send again", e);
                if let Err(e) = self.session.calibration_failed(e) {
                    error!("{}", e);
                }
            }
        }
    }

    // ─── Detector readings and deadlines ────────────────────────────────

    fn handle_note(&mut self, subscription: u64, event: &NoteEvent) {
        if subscription != self.subscription || self.interception.is_none() {
            trace!("Dropping reading from released subscription {}", subscription);
            return;
        }
        match self.session.phase() {
            Phase::Recording => {
                let outcome = match self.window.as_mut() {
                    Some(window) => window.on_note(event, Instant::now()),
                    None => return,
                };
                if let Some(outcome) = outcome {
                    self.finish_window(outcome);
                }
            }
            Phase::Tuning | Phase::StringTuned => {
                let Some(hz) = event.frequency else {
                    return;
                };
                let deviation = classify(hz, self.session.current_target());
                if deviation.classification == Classification::Ignored {
                    trace!("{:.2} Hz out of range for {}", hz, self.session.string_name());
                    return;
                }
                self.session.observe(&deviation);
                self.deviation = Some(deviation);
                self.status = format!(
                    "{}: {:+.2} Hz. {}",
                    self.session.string_name(),
                    deviation.diff,
                    deviation.classification.advice()
                );
                self.publish();
            }
            _ => {}
        }
    }

    fn handle_timeout(&mut self) {
        let outcome = self.window.as_mut().and_then(|w| w.on_timeout());
        if let Some(outcome) = outcome {
            self.finish_window(outcome);
        }
    }

    fn finish_window(&mut self, outcome: WindowOutcome) {
        self.window = None;
        self.stop_listening();
        let name = self.session.string_name().to_string();
        if let Err(e) = self.session.finish_recording(outcome.estimate) {
            error!("Window #{} finished outside recording: {}", outcome.attempt, e);
            return;
        }
        self.status = match outcome.estimate {
            Ok(hz) => format!("{}: {:.2} Hz ({}). Confirm or retry", name, hz, hz_to_note_name(hz)),
            Err(e) => format!("{}: {}. Pluck again and press record", name, e),
        };
        self.publish();
    }
}
