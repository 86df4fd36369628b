//! NoiseCleanse - Acoustic Deconvolution Engine
//!
//! Recovers clean audio from recordings made through a room or a
//! playback/recording chain, given that chain's impulse response.
//!
//! # Architecture
//!
//! - `dsp`: the regularized inverse filter, FFT convolution, sweeps and alignment
//! - `ir`: preparation of uploaded IRs and sweep-based IR measurement
//! - `offline`: whole-file deconvolution with diagnostic plot data
//! - `live`: streaming deconvolution between two audio devices
//! - `recording`: raw input capture to WAV
//! - `session`: the controller every request goes through
//! - `control`: the JSON-lines control plane over TCP or stdio

pub mod audio;
pub mod cli;
pub mod config;
pub mod control;
pub mod dsp;
pub mod engine;
pub mod error;
pub mod ir;
pub mod live;
pub mod offline;
pub mod recording;
pub mod session;

pub use config::EngineConfig;
pub use engine::AudioBuffer;
pub use error::{EngineError, ErrorKind, Result};
pub use ir::ImpulseResponse;
pub use session::SessionController;
