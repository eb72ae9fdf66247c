use crate::bridge::BridgeModel;
use crate::controller::SessionView;
use crate::detector::NoteDetector;
use crate::error::ModelError;
use crate::session::Phase;
use crate::types::{NoteEvent, STRING_COUNT};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Relative pitch jitter of a single reading.
const JITTER: f64 = 0.002;
const DROPOUT_CHANCE: f64 = 0.05;
const OCTAVE_ERROR_CHANCE: f64 = 0.05;

/// What the simulated player is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct PlayerState {
    string: usize,
    plucking: bool,
    /// Pitch the player is turning the peg toward, if tuning.
    turning_to: Option<f64>,
}

/// Lets the session drive the simulated player: pluck the string the view
/// names, and turn its peg toward the view's target while tuning.
#[derive(Clone, Default)]
pub struct PlayerHandle {
    state: Arc<Mutex<PlayerState>>,
}

impl PlayerHandle {
    pub fn follow(&self, view: &SessionView) {
        let next = PlayerState {
            string: view.string_index,
            plucking: view.active
                && matches!(view.phase, Phase::Recording | Phase::Tuning | Phase::StringTuned),
            turning_to: match view.phase {
                Phase::Tuning | Phase::StringTuned if view.active => Some(view.target_hz),
                _ => None,
            },
        };
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            debug!("Player: {:?}", next);
            *state = next;
        }
    }

    fn get(&self) -> PlayerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A guitar on a floating bridge, played into a `NoteDetector`.
///
/// Readings are noisy the way a real pitch tracker's are: small jitter,
/// occasional readings with no pitch, and occasional octave errors.
pub struct Simulator {
    detector: NoteDetector,
    model: BridgeModel,
    offsets: [f64; STRING_COUNT],
    player: PlayerHandle,
    rate_hz: u32,
    /// How fast the player turns a peg, in Hz of pitch per second.
    turn_rate: f64,
    rng: StdRng,
    stop: Arc<AtomicBool>,
}

impl Simulator {
    pub fn new(
        detector: NoteDetector,
        model: BridgeModel,
        start_pitches: &[f64; STRING_COUNT],
        rate_hz: u32,
    ) -> Result<Self, ModelError> {
        let offsets = model.solve_offsets(start_pitches)?;
        Ok(Self {
            detector,
            model,
            offsets,
            player: PlayerHandle::default(),
            rate_hz: rate_hz.max(1),
            turn_rate: 4.0,
            rng: StdRng::from_entropy(),
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_turn_rate(mut self, hz_per_second: f64) -> Self {
        self.turn_rate = hz_per_second;
        self
    }

    pub fn player(&self) -> PlayerHandle {
        self.player.clone()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Current sounding pitch of every string.
    pub fn pitches(&self) -> Option<[f64; STRING_COUNT]> {
        self.model.frequencies(&self.offsets)
    }

    /// Advance by `dt`: turn the peg if the player is tuning, then pluck.
    /// Returns the reading the detector would report, if any.
    pub fn tick(&mut self, dt: Duration) -> Option<NoteEvent> {
        let player = self.player.get();
        if !player.plucking {
            return None;
        }
        let string = player.string.min(STRING_COUNT - 1);

        if let Some(target) = player.turning_to {
            self.turn_peg(string, target, dt);
        }

        let hz = self.pitches()?[string];
        if self.rng.gen_bool(DROPOUT_CHANCE) {
            return Some(NoteEvent::unpitched());
        }
        let mut reading = hz * (1.0 + self.rng.gen_range(-JITTER..=JITTER));
        if self.rng.gen_bool(OCTAVE_ERROR_CHANCE) {
            reading *= if self.rng.gen_bool(0.5) { 2.0 } else { 0.5 };
        }
        Some(NoteEvent::pitched(reading))
    }

    fn turn_peg(&mut self, string: usize, target: f64, dt: Duration) {
        let Some(current) = self.pitches().map(|hz| hz[string]) else {
            return;
        };
        let max_step = self.turn_rate * dt.as_secs_f64();
        let next = current + (target - current).clamp(-max_step, max_step);
        if let Err(e) = self.model.tune_string(&mut self.offsets, string, next) {
            warn!("Peg on string {} stuck: {}", string + 1, e);
        }
    }

    /// Play until the stop flag is set. Blocks the calling thread.
    pub fn run(&mut self) {
        let dt = Duration::from_micros(1_000_000 / self.rate_hz as u64);
        info!("Simulated guitar at {:?}, {} readings/s", self.pitches(), self.rate_hz);
        while !self.stop.load(Ordering::Relaxed) {
            if let Some(event) = self.tick(dt) {
                self.detector.dispatch(&event);
            }
            thread::sleep(dt);
        }
        info!("Simulator stopped at {:?}", self.pitches());
    }
}
