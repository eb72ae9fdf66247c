pub mod bridge;
pub mod calibration;
pub mod classifier;
pub mod config;
pub mod console_display;
pub mod controller;
pub mod detector;
pub mod error;
pub mod filter;
pub mod pitch_log;
pub mod recording;
pub mod service;
pub mod session;
pub mod simulator;
pub mod types;
