//! Tuner configuration: service location, window timing, labels and defaults.
//!
//! Stored as JSON. Missing fields fall back to their defaults, so a file
//! containing only `{"service_url": "..."}` is valid.

use crate::recording::{WindowTiming, EARLY_STOP_MS, HARD_TIMEOUT_MS};
use crate::session::TuningSession;
use crate::types::{default_string_names, STANDARD_TUNING, STRING_COUNT};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Base URL of the calibration service (without `/tune_guitar`).
    pub service_url: String,
    pub request_timeout_ms: u64,
    pub early_stop_ms: u64,
    pub hard_timeout_ms: u64,
    pub string_names: [String; STRING_COUNT],
    /// Targets used until the calibration service answers.
    pub default_targets: [f64; STRING_COUNT],
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:5000".to_string(),
            request_timeout_ms: 5000,
            early_stop_ms: EARLY_STOP_MS,
            hard_timeout_ms: HARD_TIMEOUT_MS,
            string_names: default_string_names(),
            default_targets: STANDARD_TUNING,
        }
    }
}

impl TunerConfig {
    /// Load from a JSON file. Returns None if file is absent or malformed.
    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&data) {
            Ok(c) => {
                info!("Loaded tuner config from {:?}", path);
                Some(c)
            }
            Err(e) => {
                warn!("Failed to parse tuner config {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)?;
        info!("Tuner config saved to {:?}", path);
        Ok(())
    }

    pub fn window_timing(&self) -> WindowTiming {
        WindowTiming {
            early_stop: Duration::from_millis(self.early_stop_ms),
            hard_timeout: Duration::from_millis(self.hard_timeout_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn new_session(&self) -> TuningSession {
        TuningSession::new(self.default_targets, self.string_names.clone())
    }
}
