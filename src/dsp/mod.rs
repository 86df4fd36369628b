//! DSP Core
//!
//! Frequency-domain machinery shared by IR capture, offline deconvolution
//! and the live engine. Everything here is pure computation on slices.

pub mod alignment;
pub mod analysis;
pub mod convolution;
pub mod fft;
pub mod inverse;
pub mod postprocess;
pub mod sweep;

pub use alignment::{align, Alignment};
pub use analysis::{magnitude_spectrum, waveform, PlotSeries};
pub use convolution::{fft_convolve, OverlapSaveConvolver};
pub use fft::next_fast_len;
pub use inverse::{design_length, regularized_inverse, InverseFilter};
pub use postprocess::{spectral_gate, Biquad, BiquadKind, EnergyGate, PostProcessor};
pub use sweep::log_sweep;
