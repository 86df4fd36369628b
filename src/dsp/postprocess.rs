//! Optional clean-up of recovered audio
//!
//! Mains-hum notches, a high/low band limit, peak normalization and a
//! spectral gate for offline output, plus a per-block energy gate for the
//! live path. Nothing here runs unless enabled in configuration.

use std::f64::consts::PI;

use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

use crate::config::{EnergyGateConfig, PostProcessConfig};
use crate::engine::buffer::AudioBuffer;

/// Q of the band-limiting sections (Butterworth)
const BUTTERWORTH_Q: f64 = std::f64::consts::FRAC_1_SQRT_2;

// ============================================================================
// Biquad
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadKind {
    HighPass,
    LowPass,
    Notch,
}

/// Second-order section with coefficients normalized by a0
///
/// H(z) = (b0 + b1*z^-1 + b2*z^-2) / (1 + a1*z^-1 + a2*z^-2)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Audio EQ Cookbook coefficients
    ///
    /// `frequency` is clamped below Nyquist.
    pub fn new(kind: BiquadKind, sample_rate: u32, frequency: f64, q: f64) -> Self {
        let sample_rate = sample_rate.max(1) as f64;
        let freq = frequency.clamp(1.0, sample_rate / 2.0 * 0.999);
        let q = q.max(0.05);

        let w0 = 2.0 * PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let (b0, b1, b2, a0, a1, a2) = match kind {
            BiquadKind::LowPass => (
                (1.0 - cos_w0) / 2.0,
                1.0 - cos_w0,
                (1.0 - cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            BiquadKind::HighPass => (
                (1.0 + cos_w0) / 2.0,
                -(1.0 + cos_w0),
                (1.0 + cos_w0) / 2.0,
                1.0 + alpha,
                -2.0 * cos_w0,
                1.0 - alpha,
            ),
            BiquadKind::Notch => (1.0, -2.0 * cos_w0, 1.0, 1.0 + alpha, -2.0 * cos_w0, 1.0 - alpha),
        };

        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Notch of `bandwidth_hz` centered on `frequency`
    pub fn notch(sample_rate: u32, frequency: f64, bandwidth_hz: f64) -> Self {
        Self::new(BiquadKind::Notch, sample_rate, frequency, frequency / bandwidth_hz.max(1e-3))
    }

    /// Filter `signal` in place, starting from rest
    pub fn process(&self, signal: &mut [f32]) {
        let (mut x1, mut x2, mut y1, mut y2) = (0.0_f64, 0.0_f64, 0.0_f64, 0.0_f64);
        for sample in signal.iter_mut() {
            let x = *sample as f64;
            let y = self.b0 * x + self.b1 * x1 + self.b2 * x2 - self.a1 * y1 - self.a2 * y2;
            x2 = x1;
            x1 = x;
            y2 = y1;
            y1 = y;
            *sample = y as f32;
        }
    }

    /// Forward then backward pass: zero phase, squared magnitude response
    pub fn filtfilt(&self, signal: &mut [f32]) {
        self.process(signal);
        signal.reverse();
        self.process(signal);
        signal.reverse();
    }
}

// ============================================================================
// Spectral gate
// ============================================================================

/// Attenuate stationary spectral content
///
/// Frames of `window` samples (rounded up to a power of two) overlap by
/// half under a periodic Hann window. Each bin's noise floor is its median
/// magnitude over all frames; bins below `threshold` times that floor are
/// scaled by `attenuation`. With nothing gated the input is reconstructed.
pub fn spectral_gate(signal: &[f32], window: usize, threshold: f32, attenuation: f32) -> Vec<f32> {
    if signal.is_empty() {
        return Vec::new();
    }

    let window = window.max(4).next_power_of_two();
    let hop = window / 2;
    let frames = (signal.len() + hop).div_ceil(hop);

    let mut padded = vec![0.0_f32; (frames + 1) * hop];
    padded[hop..hop + signal.len()].copy_from_slice(signal);

    let hann: Vec<f32> = (0..window)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / window as f32).cos()))
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    let forward = planner.plan_fft_forward(window);
    let inverse = planner.plan_fft_inverse(window);

    let mut spectra: Vec<Vec<Complex32>> = (0..frames)
        .map(|k| {
            let start = k * hop;
            let mut frame: Vec<Complex32> = padded[start..start + window]
                .iter()
                .zip(&hann)
                .map(|(&s, &w)| Complex32::new(s * w, 0.0))
                .collect();
            forward.process(&mut frame);
            frame
        })
        .collect();

    let bins = window / 2 + 1;
    let floor: Vec<f32> = (0..bins)
        .map(|bin| {
            let mut magnitudes: Vec<f32> = spectra.iter().map(|frame| frame[bin].norm()).collect();
            magnitudes.sort_by(|a, b| a.total_cmp(b));
            magnitudes[magnitudes.len() / 2]
        })
        .collect();

    let mut output = vec![0.0_f32; padded.len()];
    let scale = 1.0 / window as f32;
    for (k, frame) in spectra.iter_mut().enumerate() {
        for (i, value) in frame.iter_mut().enumerate() {
            let bin = i.min(window - i);
            if value.norm() < threshold * floor[bin] {
                *value *= attenuation;
            }
        }
        inverse.process(frame);

        let start = k * hop;
        for (out, value) in output[start..start + window].iter_mut().zip(frame.iter()) {
            *out += value.re * scale;
        }
    }

    output.drain(..hop);
    output.truncate(signal.len());
    output
}

// ============================================================================
// Offline chain
// ============================================================================

/// The configured offline clean-up chain
#[derive(Debug, Clone)]
pub struct PostProcessor {
    sections: Vec<Biquad>,
    normalize: bool,
    gate: Option<(usize, f32, f32)>,
}

impl PostProcessor {
    /// `None` when post-processing is disabled
    ///
    /// Sections at or above Nyquist are left out.
    pub fn from_config(config: &PostProcessConfig, sample_rate: u32) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let nyquist = sample_rate as f32 / 2.0;
        let below_nyquist = |hz: f32| hz > 0.0 && hz < nyquist;

        let mut sections: Vec<Biquad> = config
            .notch_hz
            .iter()
            .copied()
            .filter(|&hz| below_nyquist(hz))
            .map(|hz| Biquad::notch(sample_rate, hz as f64, config.notch_bandwidth_hz as f64))
            .collect();
        if let Some(hz) = config.high_pass_hz.filter(|&hz| below_nyquist(hz)) {
            sections.push(Biquad::new(BiquadKind::HighPass, sample_rate, hz as f64, BUTTERWORTH_Q));
        }
        if let Some(hz) = config.low_pass_hz.filter(|&hz| below_nyquist(hz)) {
            sections.push(Biquad::new(BiquadKind::LowPass, sample_rate, hz as f64, BUTTERWORTH_Q));
        }

        Some(Self {
            sections,
            normalize: config.normalize,
            gate: config
                .spectral_gate
                .then_some((config.gate_window, config.gate_threshold, config.gate_attenuation)),
        })
    }

    pub fn apply(&self, buffer: &mut AudioBuffer) {
        for channel in &mut buffer.samples {
            for section in &self.sections {
                section.filtfilt(channel);
            }
        }

        if self.normalize {
            buffer.normalize_peak(1.0);
            buffer
                .samples
                .iter_mut()
                .flatten()
                .for_each(|s| *s = s.clamp(-1.0, 1.0));
        }

        if let Some((window, threshold, attenuation)) = self.gate {
            for channel in &mut buffer.samples {
                *channel = spectral_gate(channel, window, threshold, attenuation);
            }
        }
    }
}

// ============================================================================
// Live energy gate
// ============================================================================

/// Scales down blocks whose mean power is below a threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyGate {
    threshold: f32,
    attenuation: f32,
}

impl EnergyGate {
    pub fn from_config(config: &EnergyGateConfig) -> Option<Self> {
        config.enabled.then_some(Self {
            threshold: config.threshold,
            attenuation: config.attenuation,
        })
    }

    /// Returns `true` if the block was attenuated
    pub fn apply(&self, block: &mut [f32]) -> bool {
        if block.is_empty() {
            return false;
        }
        let power = block.iter().map(|s| s * s).sum::<f32>() / block.len() as f32;
        if power < self.threshold {
            block.iter_mut().for_each(|s| *s *= self.attenuation);
            true
        } else {
            false
        }
    }
}
