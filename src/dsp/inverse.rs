//! Regularized inverse filtering
//!
//! The single inversion used everywhere in the engine:
//!
//! ```text
//! H_inv(f) = conj(H(f)) / (|H(f)|^2 + ε),   ε = regularization · max|H(f)|^2
//! ```
//!
//! Relative ε keeps the filter scale-invariant and bounds its gain by
//! `1 / (2·sqrt(ε))` at spectral nulls. The time-domain inverse is rotated by
//! a modeling delay of half the design length so the FIR is causal and can
//! be run block-by-block; offline application compensates that delay.

use rustfft::num_complex::Complex32;

use crate::dsp::convolution::fft_convolve;
use crate::dsp::fft::{forward, inverse_real, next_fast_len};
use crate::error::{EngineError, Result};

/// Peak spectral power below which an IR is treated as silent
const MIN_PEAK_POWER: f32 = 1e-20;

/// Design length for an IR of `ir_len` samples
///
/// Eight times the IR length leaves room for the (longer) inverse response
/// before circular wrap-around.
pub fn design_length(ir_len: usize, min_design_len: usize) -> usize {
    next_fast_len(ir_len.saturating_mul(8).max(min_design_len))
}

/// Apply `conj(H) / (|H|^2 + ε)` to a spectrum
///
/// Returns the inverse spectrum and the absolute ε used.
///
/// # Errors
/// `DegenerateIr` if the spectrum has no usable energy
pub fn regularized_inverse(
    spectrum: &[Complex32],
    regularization: f32,
) -> Result<(Vec<Complex32>, f32)> {
    let peak_power = spectrum
        .iter()
        .map(|h| h.norm_sqr())
        .fold(0.0_f32, f32::max);

    if !peak_power.is_finite() || peak_power < MIN_PEAK_POWER {
        return Err(EngineError::DegenerateIr {
            reason: format!("peak spectral power {:e} is too small to invert", peak_power),
        });
    }

    let epsilon = regularization * peak_power;
    let inverse = spectrum
        .iter()
        .map(|h| h.conj() / (h.norm_sqr() + epsilon))
        .collect();

    Ok((inverse, epsilon))
}

/// Causal FIR inverse of an impulse response
#[derive(Debug, Clone)]
pub struct InverseFilter {
    spectrum: Vec<Complex32>,
    taps: Vec<f32>,
    delay: usize,
    epsilon: f32,
}

impl InverseFilter {
    /// Design the inverse of `ir` at `design_len` (a power of two)
    ///
    /// # Errors
    /// * `InvalidInput` - if the IR is empty or longer than the design length
    /// * `DegenerateIr` - if the IR has near-zero energy
    pub fn design(ir: &[f32], design_len: usize, regularization: f32) -> Result<Self> {
        if ir.is_empty() || ir.len() > design_len {
            return Err(EngineError::invalid_input(format!(
                "IR length {} does not fit design length {}",
                ir.len(),
                design_len
            )));
        }

        Self::from_spectrum(&forward(ir, design_len), regularization)
    }

    /// Design from an IR spectrum that was already computed at the design length
    pub fn from_spectrum(ir_spectrum: &[Complex32], regularization: f32) -> Result<Self> {
        let (spectrum, epsilon) = regularized_inverse(ir_spectrum, regularization)?;

        let design_len = spectrum.len();
        let delay = design_len / 2;
        let raw = inverse_real(spectrum.clone());

        let mut taps = vec![0.0_f32; design_len];
        for (n, tap) in taps.iter_mut().enumerate() {
            *tap = raw[(n + design_len - delay) % design_len];
        }

        Ok(Self {
            spectrum,
            taps,
            delay,
            epsilon,
        })
    }

    /// Inverse spectrum at the design length
    pub fn spectrum(&self) -> &[Complex32] {
        &self.spectrum
    }

    /// Delayed FIR taps
    pub fn taps(&self) -> &[f32] {
        &self.taps
    }

    /// Modeling delay in samples
    pub fn delay(&self) -> usize {
        self.delay
    }

    /// Absolute regularization term
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Largest gain the filter applies at any frequency
    pub fn max_gain(&self) -> f32 {
        self.spectrum.iter().map(|c| c.norm()).fold(0.0, f32::max)
    }

    /// Filter a whole signal, returning the time-aligned estimate
    ///
    /// The result has the same length as `signal`; the modeling delay is
    /// removed so output sample `n` corresponds to input sample `n`.
    pub fn apply(&self, signal: &[f32]) -> Vec<f32> {
        if signal.is_empty() {
            return Vec::new();
        }
        let full = fft_convolve(signal, &self.taps);
        full[self.delay..self.delay + signal.len()].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_design_length() {
        assert_eq!(design_length(256, 2048), 2048);
        assert_eq!(design_length(300, 2048), 4096);
        assert_eq!(design_length(1, 16), 16);
    }

    #[test]
    fn test_identity_ir_gives_delayed_impulse() {
        let filter = InverseFilter::design(&[1.0], 64, 1e-6).unwrap();

        assert_eq!(filter.delay(), 32);
        assert_abs_diff_eq!(filter.taps()[32], 1.0, epsilon = 1e-5);
        let off_peak: f32 = filter
            .taps()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 32)
            .map(|(_, t)| t.abs())
            .sum();
        assert!(off_peak < 1e-4);
    }

    #[test]
    fn test_apply_compensates_delay() {
        let filter = InverseFilter::design(&[0.5], 128, 1e-6).unwrap();
        let signal: Vec<f32> = (0..300).map(|i| (i as f32 * 0.1).sin()).collect();
        let observed: Vec<f32> = signal.iter().map(|s| s * 0.5).collect();

        let recovered = filter.apply(&observed);

        assert_eq!(recovered.len(), signal.len());
        for (a, b) in signal.iter().zip(&recovered) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_silent_ir_is_degenerate() {
        let result = InverseFilter::design(&[0.0; 32], 64, 1e-6);
        assert!(matches!(result, Err(EngineError::DegenerateIr { .. })));
    }

    #[test]
    fn test_oversized_ir_is_rejected() {
        let result = InverseFilter::design(&[0.1; 100], 64, 1e-6);
        assert!(matches!(result, Err(EngineError::InvalidInput { .. })));
    }

    #[test]
    fn test_gain_bounded_at_spectral_null() {
        // [1, 1] has an exact null at Nyquist
        let regularization = 1e-4;
        let filter = InverseFilter::design(&[1.0, 1.0], 256, regularization).unwrap();

        let bound = 1.0 / (2.0 * filter.epsilon().sqrt());
        assert!(filter.spectrum().iter().all(|c| c.re.is_finite() && c.im.is_finite()));
        assert!(filter.max_gain() <= bound * 1.0001);
        assert!(filter.taps().iter().all(|t| t.is_finite()));
    }
}
