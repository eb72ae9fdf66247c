//! Calibration exchange: six recorded pitches out, six target frequencies back.
//!
//! Wire contract (`POST /tune_guitar`):
//!   request  `{"pitches": [f0, .., f5]}`, 1st string first
//!   response `{"success": true, "target_frequencies": [t0, .., t5]}`
//!         or `{"success": false, "error": "<message>"}`

use crate::error::CalibrationError;
use crate::types::STRING_COUNT;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const TUNE_PATH: &str = "/tune_guitar";

/// Used when the service refuses without saying why.
pub const GENERIC_REJECTION: &str = "Calibration service did not return six target frequencies";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRequest {
    pub pitches: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_frequencies: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TuneResponse {
    pub fn ok(targets: [f64; STRING_COUNT]) -> Self {
        Self {
            success: true,
            target_frequencies: Some(targets.to_vec()),
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            target_frequencies: None,
            error: Some(message.into()),
        }
    }

    /// Accept only `success: true` with exactly six targets.
    pub fn into_targets(self) -> Result<[f64; STRING_COUNT], CalibrationError> {
        let rejection = || {
            CalibrationError::Rejected(
                self.error
                    .clone()
                    .unwrap_or_else(|| GENERIC_REJECTION.to_string()),
            )
        };
        if !self.success {
            return Err(rejection());
        }
        match self.target_frequencies.as_deref() {
            Some(targets) => <[f64; STRING_COUNT]>::try_from(targets).map_err(|_| rejection()),
            None => Err(rejection()),
        }
    }
}

/// Parse a raw response body. A body that is not a JSON object is a
/// transport failure, not a rejection.
pub fn interpret_response(body: &str) -> Result<[f64; STRING_COUNT], CalibrationError> {
    let response: TuneResponse = serde_json::from_str(body)
        .map_err(|e| CalibrationError::Unreachable(format!("malformed response: {}", e)))?;
    response.into_targets()
}

/// Anything that can turn six pitches into six targets.
pub trait CalibrationService {
    fn send_pitches(
        &self,
        pitches: &[f64; STRING_COUNT],
    ) -> Result<[f64; STRING_COUNT], CalibrationError>;
}

/// Blocking HTTP client for the calibration service.
pub struct HttpCalibrationClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpCalibrationClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CalibrationError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CalibrationError::Unreachable(e.to_string()))?;
        let endpoint = format!("{}{}", base_url.trim_end_matches('/'), TUNE_PATH);
        info!("Calibration endpoint: {}", endpoint);
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CalibrationService for HttpCalibrationClient {
    fn send_pitches(
        &self,
        pitches: &[f64; STRING_COUNT],
    ) -> Result<[f64; STRING_COUNT], CalibrationError> {
        let request = TuneRequest {
            pitches: pitches.to_vec(),
        };
        debug!("POST {} {:?}", self.endpoint, request.pitches);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .map_err(|e| CalibrationError::Unreachable(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| CalibrationError::Unreachable(e.to_string()))?;
        debug!("Calibration service answered {}: {}", status, body);
        interpret_response(&body)
    }
}
