//! Probe-to-recording alignment by cross-correlation

use serde::{Deserialize, Serialize};

use crate::dsp::fft::{forward, inverse_real, next_fast_len};
use crate::error::{EngineError, Result};

/// Where the probe starts inside a recording
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alignment {
    /// Offset of the probe in the recording, in samples
    pub lag: usize,
    /// Peak correlation magnitude divided by the mean magnitude over the search window
    pub confidence: f32,
}

/// Find the lag at which `probe` best matches `recorded`
///
/// Searches lags `0..=max_lag` (clamped to the recording length) for the
/// largest cross-correlation magnitude.
///
/// # Errors
/// * `InvalidInput` - if either input is empty
/// * `AlignmentFailed` - if the peak is not `min_confidence` times the mean
pub fn align(
    probe: &[f32],
    recorded: &[f32],
    max_lag: usize,
    min_confidence: f32,
) -> Result<Alignment> {
    if probe.is_empty() || recorded.is_empty() {
        return Err(EngineError::invalid_input(
            "alignment needs a non-empty probe and recording",
        ));
    }

    let size = next_fast_len(recorded.len() + probe.len());
    let mut cross = forward(recorded, size);
    let probe_spectrum = forward(probe, size);
    for (r, p) in cross.iter_mut().zip(&probe_spectrum) {
        *r *= p.conj();
    }
    let correlation = inverse_real(cross);

    let window = &correlation[..=max_lag.min(recorded.len() - 1)];
    let (lag, peak) = window
        .iter()
        .map(|c| c.abs())
        .enumerate()
        .fold((0, 0.0_f32), |best, (i, m)| if m > best.1 { (i, m) } else { best });

    let mean = window.iter().map(|c| c.abs()).sum::<f32>() / window.len() as f32;
    let confidence = if mean > 0.0 && window.len() > 1 {
        peak / mean
    } else {
        0.0
    };

    if !(confidence >= min_confidence) {
        return Err(EngineError::AlignmentFailed {
            confidence,
            required: min_confidence,
        });
    }

    Ok(Alignment { lag, confidence })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::dsp::sweep::log_sweep;

    fn probe() -> Vec<f32> {
        let config = SweepConfig {
            duration_secs: 0.25,
            ..SweepConfig::default()
        };
        log_sweep(&config, 44100).samples.remove(0)
    }

    /// Deterministic white-ish noise
    fn noise(len: usize, seed: u32) -> Vec<f32> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect()
    }

    #[test]
    fn test_finds_known_delay() {
        let probe = probe();
        let mut recorded = vec![0.0; 1234];
        recorded.extend(probe.iter().map(|s| s * 0.3));
        recorded.extend(vec![0.0; 5000]);

        let alignment = align(&probe, &recorded, 44100, 10.0).unwrap();

        assert_eq!(alignment.lag, 1234);
        assert!(alignment.confidence > 10.0);
    }

    #[test]
    fn test_finds_delay_under_noise() {
        let probe = probe();
        let mut recorded: Vec<f32> = noise(probe.len() + 8000, 7).iter().map(|n| n * 0.05).collect();
        for (i, s) in probe.iter().enumerate() {
            recorded[3000 + i] += s * 0.5;
        }

        let alignment = align(&probe, &recorded, 44100, 10.0).unwrap();
        assert_eq!(alignment.lag, 3000);
    }

    #[test]
    fn test_unrelated_recording_fails() {
        let probe = probe();
        let recorded = noise(44100, 99);

        let result = align(&probe, &recorded, 44100, 10.0);
        assert!(matches!(result, Err(EngineError::AlignmentFailed { .. })));
    }

    #[test]
    fn test_silent_recording_fails() {
        let result = align(&probe(), &vec![0.0; 20000], 44100, 10.0);
        match result {
            Err(EngineError::AlignmentFailed { confidence, .. }) => assert_eq!(confidence, 0.0),
            other => panic!("expected AlignmentFailed, got {:?}", other),
        }
    }
}
