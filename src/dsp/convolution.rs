//! FFT convolution
//!
//! Whole-signal linear convolution for offline work, and an overlap-save
//! block convolver for streaming. Both produce the same linear convolution;
//! the block convolver simply emits it `block_size` samples at a time.

use std::sync::Arc;

use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::dsp::fft::{forward, inverse_real, next_fast_len};

/// Full linear convolution of `signal` with `kernel`
///
/// Output length is `signal.len() + kernel.len() - 1`.
pub fn fft_convolve(signal: &[f32], kernel: &[f32]) -> Vec<f32> {
    if signal.is_empty() || kernel.is_empty() {
        return Vec::new();
    }

    let out_len = signal.len() + kernel.len() - 1;
    let size = next_fast_len(out_len);

    let mut product = forward(signal, size);
    let kernel_spectrum = forward(kernel, size);
    for (x, g) in product.iter_mut().zip(&kernel_spectrum) {
        *x *= *g;
    }

    let mut out = inverse_real(product);
    out.truncate(out_len);
    out
}

/// Streaming FIR convolution by overlap-save
///
/// All buffers are allocated up front; [`process_block`](Self::process_block)
/// does not allocate, so it is safe to call from a real-time worker.
pub struct OverlapSaveConvolver {
    block_size: usize,
    fft_size: usize,
    kernel_spectrum: Vec<Complex32>,
    history: Vec<f32>,
    work: Vec<Complex32>,
    scratch: Vec<Complex32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
}

impl OverlapSaveConvolver {
    /// Prepare a convolver for `kernel` fed in blocks of `block_size`
    ///
    /// # Panics
    /// Panics if `kernel` is empty or `block_size` is zero
    pub fn new(kernel: &[f32], block_size: usize) -> Self {
        assert!(!kernel.is_empty(), "kernel must not be empty");
        assert!(block_size > 0, "block size must be positive");

        let fft_size = next_fast_len(block_size + kernel.len() - 1);

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(fft_size);
        let ifft = planner.plan_fft_inverse(fft_size);

        // Fold the inverse-transform normalization into the kernel
        let scale = 1.0 / fft_size as f32;
        let mut kernel_spectrum = forward(kernel, fft_size);
        for bin in kernel_spectrum.iter_mut() {
            *bin *= scale;
        }

        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());

        Self {
            block_size,
            fft_size,
            kernel_spectrum,
            history: vec![0.0; fft_size],
            work: vec![Complex32::new(0.0, 0.0); fft_size],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            fft,
            ifft,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Convolve one block
    ///
    /// `input` and `output` must both be exactly `block_size` long.
    pub fn process_block(&mut self, input: &[f32], output: &mut [f32]) {
        debug_assert_eq!(input.len(), self.block_size);
        debug_assert_eq!(output.len(), self.block_size);

        let b = self.block_size;
        let n = self.fft_size;

        self.history.copy_within(b.., 0);
        self.history[n - b..].copy_from_slice(input);

        for (w, &h) in self.work.iter_mut().zip(&self.history) {
            *w = Complex32::new(h, 0.0);
        }
        self.fft.process_with_scratch(&mut self.work, &mut self.scratch);
        for (w, g) in self.work.iter_mut().zip(&self.kernel_spectrum) {
            *w *= *g;
        }
        self.ifft.process_with_scratch(&mut self.work, &mut self.scratch);

        for (out, w) in output.iter_mut().zip(&self.work[n - b..]) {
            *out = w.re;
        }
    }

    /// Forget all input history
    pub fn reset(&mut self) {
        self.history.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use test_case::test_case;

    fn direct_convolve(signal: &[f32], kernel: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0; signal.len() + kernel.len() - 1];
        for (i, &s) in signal.iter().enumerate() {
            for (j, &k) in kernel.iter().enumerate() {
                out[i + j] += s * k;
            }
        }
        out
    }

    #[test]
    fn test_fft_convolve_matches_direct() {
        let signal: Vec<f32> = (0..50).map(|i| ((i * 7) % 11) as f32 / 11.0 - 0.5).collect();
        let kernel = [0.5, -0.25, 0.125, 0.0, 0.3];

        let fast = fft_convolve(&signal, &kernel);
        let slow = direct_convolve(&signal, &kernel);

        assert_eq!(fast.len(), slow.len());
        for (a, b) in fast.iter().zip(&slow) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_fft_convolve_empty() {
        assert!(fft_convolve(&[], &[1.0]).is_empty());
        assert!(fft_convolve(&[1.0], &[]).is_empty());
    }

    #[test_case(1; "single sample blocks")]
    #[test_case(7; "odd blocks")]
    #[test_case(64; "power of two blocks")]
    #[test_case(100; "blocks longer than kernel")]
    fn test_overlap_save_matches_linear_convolution(block_size: usize) {
        let kernel: Vec<f32> = (0..37).map(|i| ((i * 5) % 9) as f32 / 9.0 - 0.4).collect();
        let signal: Vec<f32> = (0..block_size * 6).map(|i| (i as f32 * 0.37).sin()).collect();
        let expected = direct_convolve(&signal, &kernel);

        let mut convolver = OverlapSaveConvolver::new(&kernel, block_size);
        let mut streamed = Vec::new();
        let mut out = vec![0.0; block_size];
        for block in signal.chunks(block_size) {
            convolver.process_block(block, &mut out);
            streamed.extend_from_slice(&out);
        }

        for (a, b) in streamed.iter().zip(&expected) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_reset_clears_history() {
        let mut convolver = OverlapSaveConvolver::new(&[0.0, 1.0], 4);
        let mut out = [0.0; 4];
        convolver.process_block(&[1.0, 1.0, 1.0, 1.0], &mut out);
        convolver.reset();
        convolver.process_block(&[0.0; 4], &mut out);
        assert!(out.iter().all(|s| s.abs() < 1e-6));
    }
}
