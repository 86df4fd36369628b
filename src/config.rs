//! Engine configuration
//!
//! Defaults mirror the measurement setup the engine was tuned with
//! (44.1 kHz, 10 s log sweep, 256-tap IRs, 1024-frame live blocks).
//! A JSON file can override any subset of fields; environment variables
//! override the file.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub audio: AudioConfig,
    pub paths: PathsConfig,
    pub sweep: SweepConfig,
    pub ir: IrConfig,
    pub deconvolution: DeconvolutionConfig,
    pub live: LiveConfig,
    pub recording: RecordingConfig,
    pub alignment: AlignmentConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Engine sample rate; every imported file is resampled to it
    pub sample_rate: u32,
    /// Bit depth of written WAV artifacts (16, 24 or 32)
    pub bit_depth: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            bit_depth: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: PathBuf,
    pub plot_dir: PathBuf,
    pub upload_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            plot_dir: PathBuf::from("temp_plots"),
            upload_dir: PathBuf::from("temp_uploads"),
        }
    }
}

impl PathsConfig {
    /// Place all three directories under a common root
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            output_dir: root.join("output"),
            plot_dir: root.join("temp_plots"),
            upload_dir: root.join("temp_uploads"),
        }
    }
}

/// Log sweep probe parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub duration_secs: f32,
    pub start_hz: f32,
    pub end_hz: f32,
    pub fade_secs: f32,
    /// Amplitude of the normalized sweep
    pub level: f32,
    /// Extra capture time after the sweep ends, for the room tail
    pub tail_secs: f32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10.0,
            start_hz: 20.0,
            end_hz: 20000.0,
            fade_secs: 0.05,
            level: 0.8,
            tail_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrConfig {
    /// Prepared IR length in samples
    pub impulse_length: usize,
    /// Tail samples below this fraction of the peak are trimmed
    pub tail_threshold: f32,
    /// Longest accepted IR recording
    pub max_duration_secs: f32,
    /// Longest IR kept after extraction from a sweep capture
    pub capture_max_secs: f32,
    /// Fade-out applied to the end of an extracted IR
    pub capture_fade_secs: f32,
    /// Relative ε used when dividing a capture by the probe spectrum
    pub capture_regularization: f32,
}

impl Default for IrConfig {
    fn default() -> Self {
        Self {
            impulse_length: 256,
            tail_threshold: 0.001,
            max_duration_secs: 10.0,
            capture_max_secs: 0.5,
            capture_fade_secs: 0.05,
            capture_regularization: 1e-5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeconvolutionConfig {
    /// ε relative to the peak power of the IR spectrum
    pub regularization: f32,
    /// Smallest inverse-filter design length; rounded up to a power of two
    pub min_design_len: usize,
    /// Default gain applied to recovered output
    pub default_gain: f32,
    /// Most points written per plot series
    pub max_plot_points: usize,
    pub postprocess: PostProcessConfig,
}

impl Default for DeconvolutionConfig {
    fn default() -> Self {
        Self {
            regularization: 1e-6,
            min_design_len: 2048,
            default_gain: 1.0,
            max_plot_points: 2048,
            postprocess: PostProcessConfig::default(),
        }
    }
}

/// Clean-up applied to offline output after the inverse filter
///
/// Off by default so recovered audio is the exact inverse-filter output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostProcessConfig {
    pub enabled: bool,
    /// Mains hum and harmonics to notch out
    pub notch_hz: Vec<f32>,
    pub notch_bandwidth_hz: f32,
    pub high_pass_hz: Option<f32>,
    /// Skipped when at or above Nyquist
    pub low_pass_hz: Option<f32>,
    /// Scale to full-scale peak and clip before gating
    pub normalize: bool,
    pub spectral_gate: bool,
    pub gate_window: usize,
    /// Bins below this multiple of their median magnitude are gated
    pub gate_threshold: f32,
    pub gate_attenuation: f32,
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            notch_hz: vec![60.0, 120.0, 180.0, 240.0],
            notch_bandwidth_hz: 2.0,
            high_pass_hz: Some(80.0),
            low_pass_hz: Some(15000.0),
            normalize: true,
            spectral_gate: true,
            gate_window: 512,
            gate_threshold: 1.5,
            gate_attenuation: 0.0,
        }
    }
}

/// Attenuation of near-silent live output blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnergyGateConfig {
    pub enabled: bool,
    /// Mean power per sample below which a block is attenuated
    pub threshold: f32,
    pub attenuation: f32,
}

impl Default for EnergyGateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 1e-4,
            attenuation: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Frames per processing block
    pub frame_size: usize,
    pub max_volume: f32,
    /// Consecutive underruns tolerated before the session fails
    pub underrun_threshold: u32,
    /// Upper bound on opening devices
    pub device_timeout_ms: u64,
    /// Ring buffer capacity, in blocks
    pub ring_blocks: usize,
    pub energy_gate: EnergyGateConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            frame_size: 1024,
            max_volume: 1.5,
            underrun_threshold: 50,
            device_timeout_ms: 3000,
            ring_blocks: 8,
            energy_gate: EnergyGateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Recording stops appending after this long
    pub max_secs: f32,
    /// Fewer samples than this makes the recording unusable
    pub min_samples: usize,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            max_secs: 600.0,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Required ratio of correlation peak to mean correlation magnitude
    pub min_confidence: f32,
    /// Largest playback-to-capture latency searched
    pub max_latency_secs: f32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            min_confidence: 10.0,
            max_latency_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP control-plane address
    pub listen: String,
    /// Largest accepted request body, in megabytes
    pub max_upload_mb: usize,
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            max_upload_mb: 256,
        }
    }
}

impl EngineConfig {
    /// Load configuration: file (if any), then environment, then validation
    ///
    /// # Errors
    /// * `FileNotFound` - if `path` is given but missing
    /// * `Serialization` - if the file is not valid JSON
    /// * `InvalidInput` - if a value is out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::FileNotFound {
            path: path.display().to_string(),
            source: Some(e),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `NOISECLEANSE_*` environment overrides
    pub fn apply_env(&mut self) {
        if let Ok(dir) = env::var("NOISECLEANSE_OUTPUT_DIR") {
            let root = PathBuf::from(dir);
            self.paths = PathsConfig::rooted_at(&root);
        }
        if let Ok(listen) = env::var("NOISECLEANSE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(rate) = env::var("NOISECLEANSE_SAMPLE_RATE")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            self.audio.sample_rate = rate;
        }
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: &str| Err(EngineError::invalid_input(reason.to_string()));

        if self.audio.sample_rate == 0 {
            return bad("audio.sample_rate must be positive");
        }
        if !matches!(self.audio.bit_depth, 16 | 24 | 32) {
            return bad("audio.bit_depth must be 16, 24 or 32");
        }
        if self.ir.impulse_length == 0 {
            return bad("ir.impulse_length must be positive");
        }
        if !(self.deconvolution.regularization > 0.0) {
            return bad("deconvolution.regularization must be positive");
        }
        if self.live.frame_size == 0 || self.live.ring_blocks < 2 {
            return bad("live.frame_size must be positive and live.ring_blocks at least 2");
        }
        if !(self.live.max_volume > 0.0) {
            return bad("live.max_volume must be positive");
        }
        if !(self.sweep.start_hz > 0.0 && self.sweep.end_hz > self.sweep.start_hz) {
            return bad("sweep.start_hz must be positive and below sweep.end_hz");
        }
        if !(self.sweep.duration_secs > 0.0) {
            return bad("sweep.duration_secs must be positive");
        }
        let post = &self.deconvolution.postprocess;
        if post.enabled && !(post.notch_bandwidth_hz > 0.0 && post.gate_window >= 4) {
            return bad("postprocess.notch_bandwidth_hz must be positive and gate_window at least 4");
        }
        if !(0.0..=1.0).contains(&post.gate_attenuation) || !(0.0..=1.0).contains(&self.live.energy_gate.attenuation) {
            return bad("gate attenuation must be within [0, 1]");
        }
        if self.server.max_upload_mb == 0 {
            return bad("server.max_upload_mb must be positive");
        }
        Ok(())
    }
}
