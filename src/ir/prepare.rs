//! IR Preparation
//!
//! Turns an uploaded impulse-response recording into the canonical form used
//! by deconvolution: mono, engine rate, DC-free, starting at its peak, fixed
//! length, unit peak. Preparation is deterministic, so preparing the same
//! file twice yields a bit-identical spectrum.

use std::path::{Path, PathBuf};

use rustfft::num_complex::Complex32;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{DeconvolutionConfig, IrConfig};
use crate::dsp::fft::forward;
use crate::dsp::inverse::{design_length, InverseFilter};
use crate::engine::buffer::{calculate_mean, AudioBounds, AudioBuffer, DC_OFFSET_THRESHOLD};
use crate::engine::io::{import_audio, resample};
use crate::error::{EngineError, Result};

/// Energy below which an IR cannot be inverted
const MIN_IR_ENERGY: f64 = 1e-12;

/// Parameters for preparing and inverting an IR
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareOptions {
    pub impulse_length: usize,
    pub tail_threshold: f32,
    pub max_duration_secs: f32,
    pub min_design_len: usize,
    pub regularization: f32,
}

impl PrepareOptions {
    pub fn from_config(ir: &IrConfig, deconvolution: &DeconvolutionConfig) -> Self {
        Self {
            impulse_length: ir.impulse_length,
            tail_threshold: ir.tail_threshold,
            max_duration_secs: ir.max_duration_secs,
            min_design_len: deconvolution.min_design_len,
            regularization: deconvolution.regularization,
        }
    }
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self::from_config(&IrConfig::default(), &DeconvolutionConfig::default())
    }
}

/// A prepared impulse response and its spectrum at the design length
#[derive(Debug, Clone)]
pub struct ImpulseResponse {
    buffer: AudioBuffer,
    spectrum: Vec<Complex32>,
    regularization: f32,
    fingerprint: String,
    source: Option<PathBuf>,
}

/// Client-facing description of an [`ImpulseResponse`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrSummary {
    pub fingerprint: String,
    pub length: usize,
    pub sample_rate: u32,
    pub design_len: usize,
    pub regularization: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl ImpulseResponse {
    /// Wrap a mono buffer, computing its spectrum
    ///
    /// # Errors
    /// * `InvalidInput` - if the buffer is not mono or is empty
    /// * `DegenerateIr` - if the buffer has near-zero energy
    pub fn new(buffer: AudioBuffer, min_design_len: usize, regularization: f32) -> Result<Self> {
        if buffer.channels() != 1 || buffer.is_empty() {
            return Err(EngineError::invalid_input(format!(
                "impulse response must be non-empty mono, got {} channel(s) of {} samples",
                buffer.channels(),
                buffer.len()
            )));
        }
        let energy = buffer.energy();
        if !(energy > MIN_IR_ENERGY) {
            return Err(EngineError::DegenerateIr {
                reason: format!("energy {:e} across the whole band", energy),
            });
        }

        let design_len = design_length(buffer.len(), min_design_len);
        let spectrum = forward(buffer.channel(0), design_len);
        let fingerprint = fingerprint(&spectrum, regularization);

        Ok(Self {
            buffer,
            spectrum,
            regularization,
            fingerprint,
            source: None,
        })
    }

    /// Record the file this IR was prepared from
    pub fn with_source(mut self, source: PathBuf) -> Self {
        self.source = Some(source);
        self
    }

    pub fn samples(&self) -> &[f32] {
        self.buffer.channel(0)
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    pub fn sample_rate(&self) -> u32 {
        self.buffer.sample_rate
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Spectrum at the design length
    pub fn spectrum(&self) -> &[Complex32] {
        &self.spectrum
    }

    pub fn design_len(&self) -> usize {
        self.spectrum.len()
    }

    pub fn regularization(&self) -> f32 {
        self.regularization
    }

    /// SHA-256 of the spectrum and regularization, hex encoded
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Design the regularized inverse filter for this IR
    pub fn inverse_filter(&self) -> Result<InverseFilter> {
        InverseFilter::from_spectrum(&self.spectrum, self.regularization)
    }

    /// Resample to `rate`, recomputing the spectrum
    pub fn resampled(&self, rate: u32, min_design_len: usize) -> Result<Self> {
        if rate == self.sample_rate() {
            return Ok(self.clone());
        }
        let mut ir = Self::new(resample(&self.buffer, rate), min_design_len, self.regularization)?;
        ir.source = self.source.clone();
        Ok(ir)
    }

    pub fn summary(&self) -> IrSummary {
        IrSummary {
            fingerprint: self.fingerprint.clone(),
            length: self.len(),
            sample_rate: self.sample_rate(),
            design_len: self.design_len(),
            regularization: self.regularization,
            source: self.source.clone(),
        }
    }
}

/// Decode, validate and normalize an IR file
///
/// # Errors
/// * `FileNotFound` / `UnsupportedFormat` - from decoding
/// * `EmptyOrInvalidAudio` - if the audio is empty, silent, too long or clipped
pub fn prepare_ir(path: &Path, sample_rate: u32, options: &PrepareOptions) -> Result<ImpulseResponse> {
    let decoded = import_audio(path, sample_rate)?;
    let ir = prepare_buffer(&decoded, options)?.with_source(path.to_path_buf());

    info!(
        path = %path.display(),
        fingerprint = %ir.fingerprint(),
        length = ir.len(),
        "prepared impulse response"
    );
    Ok(ir)
}

/// Normalize an in-memory IR recording
pub fn prepare_buffer(decoded: &AudioBuffer, options: &PrepareOptions) -> Result<ImpulseResponse> {
    let mut mono = decoded.to_mono();

    mono.validate(&AudioBounds {
        min_samples: 1,
        max_duration_secs: options.max_duration_secs as f64,
    })?;

    let mean = calculate_mean(&mono);
    if mean.abs() > DC_OFFSET_THRESHOLD {
        debug!(mean, "removing DC offset from IR");
        mono.remove_dc();
    }

    let samples = mono.channel(0);
    let peak_index = samples
        .iter()
        .enumerate()
        .fold((0, 0.0_f32), |best, (i, &s)| if s.abs() > best.1 { (i, s.abs()) } else { best })
        .0;
    let peak = samples[peak_index].abs();

    // From the peak to the last sample that still matters
    let threshold = peak * options.tail_threshold;
    let tail_end = samples
        .iter()
        .rposition(|s| s.abs() > threshold)
        .map_or(peak_index + 1, |i| i + 1)
        .max(peak_index + 1);

    let mut trimmed = samples[peak_index..tail_end].to_vec();
    trimmed.resize(options.impulse_length, 0.0);

    let mut ir = AudioBuffer::from_mono(trimmed, mono.sample_rate);
    ir.normalize_peak(1.0);

    debug!(peak_index, tail_end, length = ir.len(), "normalized IR");
    ImpulseResponse::new(ir, options.min_design_len, options.regularization)
}

fn fingerprint(spectrum: &[Complex32], regularization: f32) -> String {
    let mut hasher = Sha256::new();
    for bin in spectrum {
        hasher.update(bin.re.to_le_bytes());
        hasher.update(bin.im.to_le_bytes());
    }
    hasher.update(regularization.to_le_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
