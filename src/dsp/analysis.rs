//! Diagnostic plot data
//!
//! Produces decimated time- and frequency-domain series for a recovered
//! signal. Rendering them is left to the client.

use rustfft::num_complex::Complex32;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// One plottable series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotSeries {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub x: Vec<f32>,
    pub y: Vec<f32>,
}

impl PlotSeries {
    /// Point with the largest y value
    pub fn peak(&self) -> Option<(f32, f32)> {
        self.x
            .iter()
            .zip(&self.y)
            .fold(None, |best: Option<(f32, f32)>, (&x, &y)| match best {
                Some((_, by)) if by >= y => best,
                _ => Some((x, y)),
            })
    }
}

/// Waveform envelope: one point per bucket, keeping the sample of largest
/// magnitude (with its sign) so transients survive decimation
pub fn waveform(samples: &[f32], sample_rate: u32, max_points: usize) -> PlotSeries {
    let bucket = bucket_size(samples.len(), max_points);
    let mut x = Vec::with_capacity(samples.len() / bucket + 1);
    let mut y = Vec::with_capacity(samples.len() / bucket + 1);

    for (b, chunk) in samples.chunks(bucket).enumerate() {
        let (offset, value) = chunk
            .iter()
            .enumerate()
            .fold((0, 0.0_f32), |best, (i, &s)| if s.abs() > best.1.abs() { (i, s) } else { best });
        x.push((b * bucket + offset) as f32 / sample_rate as f32);
        y.push(value);
    }

    PlotSeries {
        title: "Recovered signal (time domain)".to_string(),
        x_label: "Time (s)".to_string(),
        y_label: "Amplitude".to_string(),
        x,
        y,
    }
}

/// Single-sided magnitude spectrum of the whole signal
///
/// Uses a transform of exactly `samples.len()` points, so bin spacing is
/// `sample_rate / len`. Magnitudes are scaled so a full-scale sine reads
/// 1.0. Decimation keeps each bucket's largest bin at its true frequency.
pub fn magnitude_spectrum(samples: &[f32], sample_rate: u32, max_points: usize) -> PlotSeries {
    let n = samples.len();
    let mut x = Vec::new();
    let mut y = Vec::new();

    if n > 0 {
        let mut buffer: Vec<Complex32> = samples.iter().map(|&s| Complex32::new(s, 0.0)).collect();
        FftPlanner::<f32>::new()
            .plan_fft_forward(n)
            .process(&mut buffer);

        let bins = n / 2 + 1;
        let bin_hz = sample_rate as f32 / n as f32;
        let scale = 2.0 / n as f32;
        let bucket = bucket_size(bins, max_points);

        for (b, chunk) in buffer[..bins].chunks(bucket).enumerate() {
            let (offset, magnitude) = chunk
                .iter()
                .map(|c| c.norm() * scale)
                .enumerate()
                .fold((0, 0.0_f32), |best, (i, m)| if m > best.1 { (i, m) } else { best });
            x.push((b * bucket + offset) as f32 * bin_hz);
            y.push(magnitude);
        }
    }

    PlotSeries {
        title: "Recovered signal (frequency domain)".to_string(),
        x_label: "Frequency (Hz)".to_string(),
        y_label: "Magnitude".to_string(),
        x,
        y,
    }
}

fn bucket_size(len: usize, max_points: usize) -> usize {
    let max_points = max_points.max(1);
    ((len + max_points - 1) / max_points).max(1)
}
