//! End-to-end tests for guided tuning sessions.
//!
//! These run the session controller on its own thread, exactly as the binary
//! does, and drive it with intents and detector readings from the test thread:
//!   intents / NoteDetector::dispatch → SessionController → SessionView channel → assertions

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bridge_tuner::bridge::BridgeModel;
use bridge_tuner::calibration::{CalibrationService, HttpCalibrationClient};
use bridge_tuner::controller::{Intents, SessionContext, SessionController, SessionView, UserIntent};
use bridge_tuner::detector::NoteDetector;
use bridge_tuner::error::CalibrationError;
use bridge_tuner::pitch_log::PitchRound;
use bridge_tuner::recording::WindowTiming;
use bridge_tuner::service::CalibrationServer;
use bridge_tuner::session::{Phase, TuningSession};
use bridge_tuner::simulator::Simulator;
use bridge_tuner::types::{NoteEvent, STANDARD_TUNING, STRING_COUNT};

// ─── Helpers ───────────────────────────────────────────────────────────────

const PITCHES: [f64; STRING_COUNT] = [331.0, 246.0, 195.0, 147.0, 109.5, 82.0];
const TARGETS: [f64; STRING_COUNT] = [330.4, 247.5, 196.6, 146.1, 110.3, 82.41];
const WAIT: Duration = Duration::from_secs(10);

/// Calibration service that fails a scripted number of times, then answers
/// `TARGETS`.
struct FakeService {
    failures: Mutex<u32>,
    requests: Arc<Mutex<Vec<[f64; STRING_COUNT]>>>,
}

impl CalibrationService for FakeService {
    fn send_pitches(
        &self,
        pitches: &[f64; STRING_COUNT],
    ) -> Result<[f64; STRING_COUNT], CalibrationError> {
        self.requests.lock().unwrap().push(*pitches);
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(CalibrationError::Rejected("Invalid Tunings for a Guitar".into()));
        }
        Ok(TARGETS)
    }
}

struct Harness {
    intents: Intents,
    views: Receiver<SessionView>,
    detector: NoteDetector,
    requests: Arc<Mutex<Vec<[f64; STRING_COUNT]>>>,
    pitch_log: Receiver<PitchRound>,
    handle: JoinHandle<()>,
}

impl Harness {
    fn start(timing: WindowTiming, failures: u32) -> Self {
        let detector = NoteDetector::new();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let service = FakeService {
            failures: Mutex::new(failures),
            requests: requests.clone(),
        };
        Self::with_service(detector, Box::new(service), timing, requests)
    }

    fn with_service(
        detector: NoteDetector,
        calibration: Box<dyn CalibrationService + Send>,
        timing: WindowTiming,
        requests: Arc<Mutex<Vec<[f64; STRING_COUNT]>>>,
    ) -> Self {
        let (view_tx, views) = unbounded();
        let (log_tx, pitch_log) = unbounded();
        let ctx = SessionContext {
            detector: detector.clone(),
            calibration,
            view_txs: vec![view_tx],
            pitch_log_tx: Some(log_tx),
            timing,
        };
        let (mut controller, intents) = SessionController::new(ctx, TuningSession::default());
        let handle = thread::spawn(move || controller.run());
        Self {
            intents,
            views,
            detector,
            requests,
            pitch_log,
            handle,
        }
    }

    fn send(&self, intent: UserIntent) {
        assert!(self.intents.send(intent));
    }

    /// Block until a view satisfies `pred`.
    fn wait_for(&self, what: &str, pred: impl Fn(&SessionView) -> bool) -> SessionView {
        let deadline = Instant::now() + WAIT;
        loop {
            match self.views.recv_deadline(deadline) {
                Ok(view) if pred(&view) => return view,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => panic!("timed out waiting for {}", what),
                Err(RecvTimeoutError::Disconnected) => {
                    panic!("controller gone waiting for {}", what)
                }
            }
        }
    }

    fn wait_phase(&self, phase: Phase) -> SessionView {
        self.wait_for(&format!("{:?}", phase), |v| v.phase == phase)
    }

    /// Keep playing `hz` into the detector until a view satisfies `pred`.
    fn play_until(&self, hz: f64, pred: impl Fn(&SessionView) -> bool) -> SessionView {
        let deadline = Instant::now() + WAIT;
        loop {
            assert!(Instant::now() < deadline, "no matching view while playing {} Hz", hz);
            self.detector.dispatch(&NoteEvent::pitched(hz));
            if let Ok(view) = self.views.recv_timeout(Duration::from_millis(10)) {
                if pred(&view) {
                    return view;
                }
            }
        }
    }

    fn record_all(&self) {
        for (i, &hz) in PITCHES.iter().enumerate() {
            self.send(UserIntent::RecordString);
            self.wait_phase(Phase::Recording);
            let view = self.play_until(hz, |v| v.phase == Phase::AwaitingConfirm);
            assert_eq!(view.string_index, i);
            assert_eq!(view.staged_pitch, Some(hz));
            self.send(UserIntent::Confirm);
        }
    }

    fn stop(self) -> NoteDetector {
        self.intents.shutdown();
        self.handle.join().unwrap();
        self.detector
    }
}

fn fast_timing() -> WindowTiming {
    WindowTiming {
        early_stop: Duration::from_millis(50),
        hard_timeout: Duration::from_secs(5),
    }
}

// ─── Session flow ──────────────────────────────────────────────────────────

#[test]
fn test_full_session_with_fake_service() {
    let h = Harness::start(fast_timing(), 0);
    h.detector
        .set_host_callback(Some(Box::new(|_: &NoteEvent| {})))
        .unwrap();

    h.send(UserIntent::Activate);
    h.wait_for("active", |v| v.active && v.phase == Phase::Idle);

    h.record_all();
    let ready = h.wait_phase(Phase::ReadyToTune);
    assert_eq!(ready.target_frequencies, TARGETS);
    assert_eq!(ready.detected_pitches, PITCHES.map(Some));
    assert_eq!(ready.string_index, 0);
    assert_eq!(*h.requests.lock().unwrap(), vec![PITCHES]);

    let round = h.pitch_log.try_recv().expect("pitch round logged");
    assert_eq!(round.pitches, PITCHES);
    assert_eq!(round.targets, TARGETS);

    for (i, &target) in TARGETS.iter().enumerate() {
        h.send(UserIntent::BeginTuning);
        h.wait_phase(Phase::Tuning);

        let sharp = h.play_until(target + 4.0, |v| v.deviation.is_some());
        assert!((sharp.deviation.unwrap().indicator_percent - 20.0).abs() < 1e-6);
        assert_eq!(sharp.phase, Phase::Tuning);

        let tuned = h.play_until(target + 0.2, |v| v.phase == Phase::StringTuned);
        assert_eq!(tuned.string_index, i);

        h.send(UserIntent::StringInTune);
        if i + 1 < STRING_COUNT {
            let next = h.wait_phase(Phase::ReadyToTune);
            assert_eq!(next.string_index, i + 1);
            assert_eq!(next.deviation, None);
        }
    }
    h.wait_phase(Phase::Complete);

    let detector = h.stop();
    assert!(!detector.is_intercepted());
    assert!(detector.has_host_callback());
}

#[test]
fn test_silent_window_times_out_once() {
    let h = Harness::start(
        WindowTiming {
            early_stop: Duration::from_millis(50),
            hard_timeout: Duration::from_millis(200),
        },
        0,
    );
    h.send(UserIntent::Activate);
    h.send(UserIntent::RecordString);
    h.wait_phase(Phase::Recording);

    let view = h.wait_for("timeout", |v| v.phase == Phase::Idle);
    assert!(view.status.contains("No pitch detected"), "{}", view.status);
    assert_eq!(view.string_index, 0);
    assert_eq!(view.staged_pitch, None);
    assert!(!h.detector.is_intercepted());

    // Nothing else arrives from that window.
    assert!(h.views.recv_timeout(Duration::from_millis(400)).is_err());
    h.stop();
}

#[test]
fn test_out_of_range_readings_only() {
    let h = Harness::start(
        WindowTiming {
            early_stop: Duration::from_millis(20),
            hard_timeout: Duration::from_secs(5),
        },
        0,
    );
    h.send(UserIntent::Activate);
    h.send(UserIntent::RecordString);
    h.wait_phase(Phase::Recording);
    // Early stop still fires on the first reading past the threshold.
    let view = h.play_until(1000.0, |v| v.phase != Phase::Recording);
    assert_eq!(view.phase, Phase::Idle);
    assert!(view.status.contains("No pitch detected"));
    h.stop();
}

#[test]
fn test_rejection_then_retry_resends_same_pitches() {
    let h = Harness::start(fast_timing(), 1);
    h.send(UserIntent::Activate);
    h.record_all();

    let failed = h.wait_for("rejection", |v| v.calibration_error.is_some());
    assert_eq!(failed.phase, Phase::SendingCalibration);
    assert!(failed.status.contains("Invalid Tunings for a Guitar"));
    assert_eq!(failed.detected_pitches, PITCHES.map(Some));

    // Nothing but retry (or closing) moves it on.
    h.send(UserIntent::BeginTuning);
    h.send(UserIntent::Retry);
    let ready = h.wait_phase(Phase::ReadyToTune);
    assert_eq!(ready.calibration_error, None);

    let requests = h.requests.lock().unwrap().clone();
    assert_eq!(requests, vec![PITCHES, PITCHES]);
    assert_eq!(h.pitch_log.try_iter().count(), 1);
    h.stop();
}

#[test]
fn test_reactivation_after_complete_starts_over() {
    let h = Harness::start(fast_timing(), 0);
    h.send(UserIntent::Activate);
    h.record_all();
    h.wait_phase(Phase::ReadyToTune);
    for &target in TARGETS.iter() {
        h.send(UserIntent::BeginTuning);
        h.wait_phase(Phase::Tuning);
        h.play_until(target, |v| v.phase == Phase::StringTuned);
        h.send(UserIntent::StringInTune);
    }
    h.wait_phase(Phase::Complete);

    h.send(UserIntent::Activate);
    let fresh = h.wait_for("fresh session", |v| v.phase == Phase::Idle);
    assert_eq!(fresh.string_index, 0);
    assert_eq!(fresh.detected_pitches, [None; STRING_COUNT]);
    assert_eq!(fresh.target_frequencies, STANDARD_TUNING);
    h.stop();
}

#[test]
fn test_deactivate_while_tuning_releases_detector() {
    let h = Harness::start(fast_timing(), 0);
    h.send(UserIntent::Activate);
    h.record_all();
    h.wait_phase(Phase::ReadyToTune);
    h.send(UserIntent::BeginTuning);
    h.wait_phase(Phase::Tuning);
    assert!(h.detector.is_intercepted());

    h.send(UserIntent::Deactivate);
    h.wait_for("inactive", |v| !v.active);
    assert!(!h.detector.is_intercepted());

    // Readings and intents are ignored while closed.
    h.detector.dispatch(&NoteEvent::pitched(330.0));
    h.send(UserIntent::StringInTune);
    assert!(h.views.recv_timeout(Duration::from_millis(200)).is_err());
    h.stop();
}

// ─── HTTP calibration service ──────────────────────────────────────────────

fn local_service() -> String {
    let server = CalibrationServer::bind("127.0.0.1:0", BridgeModel::fitted()).unwrap();
    format!("http://{}", server.spawn().unwrap())
}

#[test]
fn test_http_client_against_local_service() {
    let client = HttpCalibrationClient::new(&local_service(), Duration::from_secs(5)).unwrap();

    let targets = client.send_pitches(&STANDARD_TUNING).unwrap();
    for (t, s) in targets.iter().zip(STANDARD_TUNING.iter()) {
        assert!((t - s).abs() < 1e-6, "{} vs {}", t, s);
    }

    let flat = [327.0, 244.0, 193.0, 144.0, 108.0, 81.0];
    let targets = client.send_pitches(&flat).unwrap();
    assert!(targets[0] > STANDARD_TUNING[0]);
    assert!((targets[5] - STANDARD_TUNING[5]).abs() < 1e-6);

    assert_eq!(
        client.send_pitches(&[-50.0; STRING_COUNT]),
        Err(CalibrationError::Rejected("Invalid Tunings for a Guitar".into()))
    );
}

#[test]
fn test_http_client_unreachable() {
    // Bind then drop to get a port nothing listens on.
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{}", port);
    let client = HttpCalibrationClient::new(&url, Duration::from_secs(2)).unwrap();
    let err = client.send_pitches(&STANDARD_TUNING).unwrap_err();
    assert!(matches!(err, CalibrationError::Unreachable(_)), "{:?}", err);
}

// ─── Simulated guitar, real service ────────────────────────────────────────

#[test]
fn test_simulated_guitar_ends_in_standard_tuning() {
    let detector = NoteDetector::new();
    let start = [325.0, 249.0, 193.5, 148.0, 108.7, 83.0];
    let mut sim = Simulator::new(detector.clone(), BridgeModel::fitted(), &start, 200)
        .unwrap()
        .with_seed(42)
        .with_turn_rate(200.0);
    let player = sim.player();
    let stop = sim.stop_flag();
    let sim_handle = thread::spawn(move || {
        sim.run();
        sim
    });

    let client = HttpCalibrationClient::new(&local_service(), Duration::from_secs(5)).unwrap();
    let h = Harness::with_service(
        detector,
        Box::new(client),
        WindowTiming {
            early_stop: Duration::from_millis(150),
            hard_timeout: Duration::from_secs(3),
        },
        Arc::new(Mutex::new(Vec::new())),
    );
    let wait = |what: &str, pred: &dyn Fn(&SessionView) -> bool| {
        h.wait_for(what, |v| {
            player.follow(v);
            pred(v)
        })
    };

    h.send(UserIntent::Activate);
    for i in 0..STRING_COUNT {
        h.send(UserIntent::RecordString);
        let view = wait("staged pitch", &|v| v.phase == Phase::AwaitingConfirm);
        let staged = view.staged_pitch.unwrap();
        assert!((staged - start[i]).abs() < 1.5, "string {}: {}", i + 1, staged);
        h.send(UserIntent::Confirm);
    }
    wait("targets", &|v| v.phase == Phase::ReadyToTune);

    for _ in 0..STRING_COUNT {
        h.send(UserIntent::BeginTuning);
        wait("in tune", &|v| v.phase == Phase::StringTuned);
        // Let the peg settle on the target before moving on.
        thread::sleep(Duration::from_millis(100));
        h.send(UserIntent::StringInTune);
        wait("next string", &|v| matches!(v.phase, Phase::ReadyToTune | Phase::Complete));
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    let sim = sim_handle.join().unwrap();
    let detector = h.stop();
    assert!(!detector.is_intercepted());

    let final_pitches = sim.pitches().unwrap();
    for i in 0..STRING_COUNT {
        assert!(
            (final_pitches[i] - STANDARD_TUNING[i]).abs() < 1.0,
            "string {} ended at {:.2} Hz",
            i + 1,
            final_pitches[i]
        );
    }
}
