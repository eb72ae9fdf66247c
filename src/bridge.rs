//! Floating-bridge (tremolo) guitar model.
//!
//! String tension pulls the bridge forward; springs behind it pull back.
//! Tuning one string moves the bridge and detunes all the others, so a
//! guitar cannot be tuned by bringing each string straight to pitch. Given
//! the current pitches, the model computes the frequency each string must be
//! tuned to, in order, so that the guitar lands on the reference tuning once
//! the last string is done.
//!
//! # Model
//!
//! Each string `i` has a peg offset `o_i` (metres of extra stretch relative to
//! the balanced state). For a bridge displacement `x`:
//!
//!   T_i = T0_i + k_i · (x + o_i)
//!   f_i = sqrt(T_i / μ_i) / (2 · (L_i + x))
//!
//! and torque balance around the pivot gives
//!
//!   x = (r_spr·T_spr0 − r_str·Σ(T0_i + k_i·o_i)) / (r_spr·k_spr + r_str·Σk_i)
//!
//! with `T_spr0 = ΣT0 · r_str / r_spr` (springs balanced at rest).

use crate::error::ModelError;
use crate::types::{STANDARD_TUNING, STRING_COUNT};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::io;
use std::path::Path;

const N: usize = STRING_COUNT;
const INCH: f64 = 0.0254;

const MAX_ITERATIONS: usize = 50;
const TOLERANCE_HZ: f64 = 1e-8;
/// Finite-difference step for the Jacobian, in metres of peg travel.
const STEP_M: f64 = 1e-7;

// ─── Physical description ───────────────────────────────────────────────────

/// Directly measurable properties of the instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    /// Lever arm of the string force around the bridge pivot (m).
    pub r_str: f64,
    /// Lever arm of the spring force (m).
    pub r_spr: f64,
    /// Young's modulus of the string material (Pa).
    pub youngs_modulus: f64,
    /// Total spring constant of the tremolo springs (N/m).
    pub k_spr: f64,
    /// String material density (kg/m³).
    pub string_density: f64,
    pub scale_length: [f64; N],
    /// Pitches at which the bridge sits at its rest position.
    pub balanced_freq: [f64; N],
    pub diameters: [f64; N],
}

impl Default for Measurements {
    fn default() -> Self {
        Self {
            r_str: 0.02,
            r_spr: 0.04,
            youngs_modulus: 2.0e11,
            // three springs at 20 N/mm
            k_spr: 3.0 * 20_000.0,
            string_density: 7850.0,
            scale_length: [25.5 * INCH; N],
            balanced_freq: STANDARD_TUNING,
            diameters: [0.010, 0.013, 0.017, 0.026, 0.036, 0.046].map(|d| d * INCH),
        }
    }
}

impl Measurements {
    pub fn to_params(&self) -> BridgeParams {
        let mut k_str = [0.0; N];
        let mut t_str0 = [0.0; N];
        let mut lin_mass_density = [0.0; N];
        for i in 0..N {
            let area = PI * (self.diameters[i] / 2.0).powi(2);
            lin_mass_density[i] = area * self.string_density;
            k_str[i] = self.youngs_modulus * area / self.scale_length[i];
            // Bridge at rest when the strings sound their balanced pitches.
            t_str0[i] = (2.0 * self.scale_length[i] * self.balanced_freq[i]).powi(2)
                * lin_mass_density[i];
        }
        BridgeParams {
            r_str: self.r_str,
            r_spr: self.r_spr,
            k_spr: self.k_spr,
            k_str,
            t_str0,
            scale_length: self.scale_length,
            lin_mass_density,
        }
    }
}

/// Model parameters, either derived from `Measurements` or fitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeParams {
    pub r_str: f64,
    pub r_spr: f64,
    pub k_spr: f64,
    /// Per-string axial stiffness (N/m).
    pub k_str: [f64; N],
    /// Per-string tension at the balanced state (N).
    pub t_str0: [f64; N],
    pub scale_length: [f64; N],
    pub lin_mass_density: [f64; N],
}

impl Default for BridgeParams {
    fn default() -> Self {
        Measurements::default().to_params()
    }
}

/// Length of the flat parameter layout used by `BridgeParams::from_flat`.
pub const FLAT_LEN: usize = 3 + 4 * N;

/// Parameters fitted to recorded detuning rounds on a real guitar.
pub const FITTED_GUITAR: [f64; FLAT_LEN] = [
    0.003999999999999999,
    0.05524938811609182,
    60000.00007204304,
    // k_str
    15646.363464920685,
    26442.35421639301,
    45217.990315999006,
    105769.41665287623,
    202776.86981357756,
    331077.04982716136,
    // t_str0
    72.52512062656356,
    68.78663780217832,
    74.10452394971462,
    97.27718738731768,
    104.6706993118599,
    95.92026722935172,
    // scale_length
    0.8368477731442122,
    0.836817275027336,
    0.4585183847445688,
    0.8368437423578716,
    0.8367803831731069,
    0.4588194505632681,
    // lin_mass_density
    8.358488981090071e-05,
    0.000134444695428939,
    0.0008182382235060834,
    0.0017961154597214424,
    0.00322602427328139,
    0.014614149157429299,
];

impl BridgeParams {
    /// Unpack `[r_str, r_spr, k_spr, k_str×6, t_str0×6, scale_length×6,
    /// lin_mass_density×6]`.
    pub fn from_flat(v: &[f64; FLAT_LEN]) -> Self {
        let block = |b: usize| -> [f64; N] { std::array::from_fn(|i| v[3 + b * N + i]) };
        Self {
            r_str: v[0],
            r_spr: v[1],
            k_spr: v[2],
            k_str: block(0),
            t_str0: block(1),
            scale_length: block(2),
            lin_mass_density: block(3),
        }
    }

    pub fn fitted() -> Self {
        Self::from_flat(&FITTED_GUITAR)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let params = serde_json::from_str(&data).map_err(io::Error::other)?;
        info!("Loaded bridge parameters from {:?}", path);
        Ok(params)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)
    }
}

// ─── Model ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeModel {
    params: BridgeParams,
    t_spr0: f64,
    k_str_total: f64,
}

impl Default for BridgeModel {
    fn default() -> Self {
        Self::new(BridgeParams::default())
    }
}

impl BridgeModel {
    /// The model the calibration service answers with unless given a
    /// parameter file.
    pub fn fitted() -> Self {
        Self::new(BridgeParams::fitted())
    }

    pub fn new(params: BridgeParams) -> Self {
        let t_spr0 = params.t_str0.iter().sum::<f64>() * params.r_str / params.r_spr;
        let k_str_total = params.k_str.iter().sum();
        Self {
            params,
            t_spr0,
            k_str_total,
        }
    }

    /// Bridge displacement for the given peg offsets.
    pub fn equilibrium(&self, offsets: &[f64; N]) -> f64 {
        let p = &self.params;
        let tension: f64 = (0..N).map(|i| p.t_str0[i] + p.k_str[i] * offsets[i]).sum();
        (p.r_spr * self.t_spr0 - p.r_str * tension)
            / (p.r_spr * p.k_spr + p.r_str * self.k_str_total)
    }

    /// Sounding frequency of every string, or None if any string would be
    /// slack (negative tension) or the parameters are unphysical.
    pub fn frequencies(&self, offsets: &[f64; N]) -> Option<[f64; N]> {
        let p = &self.params;
        let x = self.equilibrium(offsets);
        let mut hz = [0.0; N];
        for i in 0..N {
            let tension = p.t_str0[i] + p.k_str[i] * (x + offsets[i]);
            let length = p.scale_length[i] + x;
            if tension < 0.0 || p.lin_mass_density[i] <= 0.0 || length <= 0.0 {
                return None;
            }
            hz[i] = (tension / p.lin_mass_density[i]).sqrt() / (2.0 * length);
        }
        Some(hz)
    }

    /// Peg offsets that make the guitar sound `targets`.
    pub fn solve_offsets(&self, targets: &[f64; N]) -> Result<[f64; N], ModelError> {
        let mut offsets = [0.0; N];
        let mut residual = f64::INFINITY;
        for iteration in 0..MAX_ITERATIONS {
            let hz = self.frequencies(&offsets).ok_or(ModelError::InvalidTuning)?;
            let error: [f64; N] = std::array::from_fn(|i| hz[i] - targets[i]);
            residual = error.iter().fold(0.0_f64, |m, e| m.max(e.abs()));
            if residual < TOLERANCE_HZ {
                trace!("Offsets converged after {} iterations", iteration);
                return Ok(offsets);
            }
            let step = solve_linear(self.jacobian(&offsets)?, error)?;
            for (o, s) in offsets.iter_mut().zip(step.iter()) {
                *o -= s;
            }
        }
        Err(ModelError::DidNotConverge {
            iterations: MAX_ITERATIONS,
            residual,
        })
    }

    /// Turn one peg, holding the others, until that string sounds `target`.
    pub fn tune_string(
        &self,
        offsets: &mut [f64; N],
        string: usize,
        target: f64,
    ) -> Result<(), ModelError> {
        for _ in 0..MAX_ITERATIONS {
            let hz = self.frequencies(offsets).ok_or(ModelError::InvalidTuning)?;
            let error = hz[string] - target;
            if error.abs() < TOLERANCE_HZ {
                return Ok(());
            }
            let slope = self.column(offsets, string)?[string];
            if slope.abs() < f64::EPSILON {
                return Err(ModelError::Singular);
            }
            offsets[string] -= error / slope;
        }
        Err(ModelError::DidNotConverge {
            iterations: MAX_ITERATIONS,
            residual: self
                .frequencies(offsets)
                .map_or(f64::INFINITY, |hz| (hz[string] - target).abs()),
        })
    }

    /// Frequency each string must be tuned to, in string order, starting
    /// from `current` and ending at `tuned`.
    ///
    /// String `i`'s target is what it sounds like once strings `0..=i` sit at
    /// their final peg offsets and the rest are still at their current ones.
    pub fn intermediate_targets(
        &self,
        current: &[f64; N],
        tuned: &[f64; N],
    ) -> Result<[f64; N], ModelError> {
        let mut offsets = self.solve_offsets(current)?;
        let tuned_offsets = self.solve_offsets(tuned)?;
        debug!("Current offsets {:?}, tuned offsets {:?}", offsets, tuned_offsets);

        let mut targets = [0.0; N];
        for i in 0..N {
            offsets[i] = tuned_offsets[i];
            let hz = self.frequencies(&offsets).ok_or(ModelError::InvalidTuning)?;
            targets[i] = hz[i];
        }
        Ok(targets)
    }

    /// d f / d o_j for every string (central difference).
    fn column(&self, offsets: &[f64; N], j: usize) -> Result<[f64; N], ModelError> {
        let mut hi = *offsets;
        let mut lo = *offsets;
        hi[j] += STEP_M;
        lo[j] -= STEP_M;
        let f_hi = self.frequencies(&hi).ok_or(ModelError::InvalidTuning)?;
        let f_lo = self.frequencies(&lo).ok_or(ModelError::InvalidTuning)?;
        Ok(std::array::from_fn(|i| (f_hi[i] - f_lo[i]) / (2.0 * STEP_M)))
    }

    fn jacobian(&self, offsets: &[f64; N]) -> Result<[[f64; N]; N], ModelError> {
        let mut jac = [[0.0; N]; N];
        for j in 0..N {
            let col = self.column(offsets, j)?;
            for i in 0..N {
                jac[i][j] = col[i];
            }
        }
        Ok(jac)
    }
}

/// Gaussian elimination with partial pivoting.
fn solve_linear(mut a: [[f64; N]; N], mut b: [f64; N]) -> Result<[f64; N], ModelError> {
    for col in 0..N {
        let pivot = (col..N)
            .max_by(|&i, &j| {
                a[i][col]
                    .abs()
                    .partial_cmp(&a[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if a[pivot][col].is_nan() || a[pivot][col].abs() <= 1e-12 {
            return Err(ModelError::Singular);
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        let pivot_row = a[col];
        for row in col + 1..N {
            let factor = a[row][col] / pivot_row[col];
            for k in col..N {
                a[row][k] -= factor * pivot_row[k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0; N];
    for row in (0..N).rev() {
        let tail: f64 = (row + 1..N).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Ok(x)
}
