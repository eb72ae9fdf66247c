use crate::classifier::{Classification, DeviationResult, GAUGE_HALF_SPAN};
use crate::controller::{SessionView, UserIntent};
use crate::session::Phase;
use crate::types::hz_to_note_name;
use crossbeam_channel::Receiver;
use std::fmt::Write as _;
use std::io::{self, Write};

const GAUGE_WIDTH: usize = 41;

/// A console keystroke: either an intent for the controller or quit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyCommand {
    Intent(UserIntent),
    Quit,
}

pub fn parse_key(line: &str) -> Option<KeyCommand> {
    let cmd = match line.trim().chars().next()?.to_ascii_lowercase() {
        'a' => KeyCommand::Intent(UserIntent::Activate),
        's' => KeyCommand::Intent(UserIntent::Deactivate),
        'r' => KeyCommand::Intent(UserIntent::RecordString),
        'c' => KeyCommand::Intent(UserIntent::Confirm),
        'x' => KeyCommand::Intent(UserIntent::Retry),
        't' => KeyCommand::Intent(UserIntent::BeginTuning),
        'd' => KeyCommand::Intent(UserIntent::StringInTune),
        'q' => KeyCommand::Quit,
        _ => return None,
    };
    Some(cmd)
}

/// Keys that do something in the view's current phase.
pub fn key_hints(view: &SessionView) -> Vec<(char, &'static str)> {
    if !view.active {
        return vec![('a', "open tuner"), ('q', "quit")];
    }
    let mut hints = match view.phase {
        Phase::Idle => vec![('r', "record")],
        Phase::Recording => vec![],
        Phase::AwaitingConfirm => vec![('c', "confirm"), ('x', "retry")],
        Phase::SendingCalibration => vec![('x', "send again")],
        Phase::ReadyToTune => vec![('t', "tune")],
        Phase::Tuning | Phase::StringTuned => vec![('d', "string in tune")],
        Phase::Complete => vec![('a', "start over")],
    };
    hints.push(('s', "close"));
    hints.push(('q', "quit"));
    hints
}

/// Needle at `50 + indicator_percent` percent of the gauge, centre mark in
/// the middle.
pub fn gauge(deviation: &DeviationResult) -> String {
    let percent = (GAUGE_HALF_SPAN + deviation.indicator_percent).clamp(0.0, 100.0);
    let needle = (percent / 100.0 * (GAUGE_WIDTH - 1) as f64).round() as usize;
    let centre = GAUGE_WIDTH / 2;
    let cells: String = (0..GAUGE_WIDTH)
        .map(|i| {
            if i == needle {
                '●'
            } else if i == centre {
                '│'
            } else {
                '─'
            }
        })
        .collect();
    format!("♭ [{}] ♯", cells)
}

pub fn render(view: &SessionView) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "╔══════════════════════════════════════════════════════════╗");
    let _ = writeln!(out, "║  BRIDGE TUNER                                            ║");
    let _ = writeln!(out, "╚══════════════════════════════════════════════════════════╝");
    if !view.active {
        let _ = writeln!(out, "  {}", view.status);
        let _ = writeln!(out);
        write_hints(&mut out, view);
        return out;
    }

    let _ = writeln!(out, "  Phase: {:?}    String: {}", view.phase, view.string_name);
    let _ = writeln!(out, "  {}", view.status);
    if let Some(err) = &view.calibration_error {
        let _ = writeln!(out, "  Last calibration error: {}", err);
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "  {:<8} {:>10} {:>10}", "String", "Recorded", "Target");
    for (i, name) in view.string_names.iter().enumerate() {
        let recorded = match (view.detected_pitches[i], view.staged_pitch) {
            (Some(hz), _) => format!("{:.2}", hz),
            (None, Some(hz)) if i == view.string_index => format!("({:.2})", hz),
            _ => "---".to_string(),
        };
        let marker = if i == view.string_index { "◀" } else { "" };
        let _ = writeln!(
            out,
            "  {:<8} {:>10} {:>10.2} {}",
            name, recorded, view.target_frequencies[i], marker
        );
    }

    if matches!(view.phase, Phase::Tuning | Phase::StringTuned) {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  Target {:.2} Hz ({})",
            view.target_hz,
            hz_to_note_name(view.target_hz)
        );
        match &view.deviation {
            Some(d) => {
                let _ = writeln!(out, "  {}", gauge(d));
                let label = match d.classification {
                    Classification::InTune => "IN TUNE",
                    Classification::TooHigh => "HIGH",
                    Classification::TooLow => "LOW",
                    Classification::Ignored => "",
                };
                let _ = writeln!(out, "  {:+.2} Hz {}", d.diff, label);
            }
            None => {
                let _ = writeln!(out, "  Pluck the string");
            }
        }
    }

    let _ = writeln!(out);
    write_hints(&mut out, view);
    out
}

fn write_hints(out: &mut String, view: &SessionView) {
    let hints: Vec<String> = key_hints(view)
        .into_iter()
        .map(|(k, what)| format!("[{}] {}", k, what))
        .collect();
    let _ = writeln!(out, "  {}", hints.join("  "));
}

/// Redraws the terminal on every session view.
pub struct ConsoleDisplay {
    rx: Receiver<SessionView>,
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<SessionView>) -> Self {
        Self { rx }
    }

    pub fn run(&self) {
        let mut stdout = io::stdout();
        for view in self.rx.iter() {
            // Clear screen and move cursor home
            print!("\x1b[2J\x1b[H{}", render(&view));
            let _ = stdout.flush();
        }
    }
}
