//! FFT helpers shared by the offline and streaming paths

use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;

/// Smallest power of two that is at least `n`
///
/// Power-of-two sizes are the fast path for rustfft's radix-4 kernels.
pub fn next_fast_len(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Zero-pad `signal` to `size` and return its spectrum
///
/// # Panics
/// Panics if `signal` is longer than `size`
pub fn forward(signal: &[f32], size: usize) -> Vec<Complex32> {
    assert!(signal.len() <= size, "signal longer than transform size");

    let mut buffer: Vec<Complex32> = signal
        .iter()
        .map(|&s| Complex32::new(s, 0.0))
        .chain(std::iter::repeat(Complex32::new(0.0, 0.0)))
        .take(size)
        .collect();

    let mut planner = FftPlanner::<f32>::new();
    planner.plan_fft_forward(size).process(&mut buffer);
    buffer
}

/// Inverse transform of a spectrum, returning the scaled real part
pub fn inverse_real(mut spectrum: Vec<Complex32>) -> Vec<f32> {
    let size = spectrum.len();
    if size == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::<f32>::new();
    planner.plan_fft_inverse(size).process(&mut spectrum);

    let scale = 1.0 / size as f32;
    spectrum.iter().map(|c| c.re * scale).collect()
}
