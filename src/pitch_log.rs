use crate::types::STRING_COUNT;
use crossbeam_channel::Receiver;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// One calibration exchange: the six recorded pitches and what the service
/// answered. The log is an export for fitting new bridge parameters offline;
/// see `export_pitches_csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchRound {
    pub timestamp_s: f64,
    pub pitches: [f64; STRING_COUNT],
    pub targets: [f64; STRING_COUNT],
}

impl PitchRound {
    pub fn now(pitches: [f64; STRING_COUNT], targets: [f64; STRING_COUNT]) -> Self {
        let timestamp_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            timestamp_s,
            pitches,
            targets,
        }
    }
}

/// Appends every received round to a JSONL file.
pub struct PitchLogger {
    rx: Receiver<PitchRound>,
    path: PathBuf,
}

impl PitchLogger {
    pub fn new(rx: Receiver<PitchRound>, path: &Path) -> Self {
        Self {
            rx,
            path: path.to_path_buf(),
        }
    }

    /// Run the logger until every sender is gone. Blocks the calling thread.
    pub fn run(&self) -> io::Result<u64> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = BufWriter::new(file);
        info!("Pitch log → {:?}", self.path);

        let mut count = 0u64;
        for round in self.rx.iter() {
            let line = serde_json::to_string(&round).map_err(io::Error::other)?;
            if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
                error!("Failed to write pitch round: {}", e);
                continue;
            }
            count += 1;
        }
        info!("Pitch log closed: {} rounds", count);
        Ok(count)
    }
}

/// Read back every round in a log. Unparseable lines are skipped.
pub fn read_rounds(path: &Path) -> io::Result<Vec<PitchRound>> {
    let reader = BufReader::new(File::open(path)?);
    let mut rounds = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(r) => rounds.push(r),
            Err(e) => warn!("Skipping bad pitch log line: {}", e),
        }
    }
    Ok(rounds)
}

/// Write the recorded pitches of every round as CSV, one round per row,
/// six comma-separated values, 1st string first. No header.
pub fn export_pitches_csv(rounds: &[PitchRound], path: &Path) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for round in rounds {
        let row: Vec<String> = round.pitches.iter().map(|hz| hz.to_string()).collect();
        writeln!(writer, "{}", row.join(","))?;
    }
    writer.flush()?;
    info!("Exported {} pitch rounds → {:?}", rounds.len(), path);
    Ok(())
}
