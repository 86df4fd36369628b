//! Exponential (log) sine sweep probe

use std::f64::consts::PI;

use crate::config::SweepConfig;
use crate::engine::buffer::AudioBuffer;

/// Generate the measurement sweep described by `config`
///
/// The instantaneous frequency rises exponentially from `start_hz` to
/// `end_hz`; linear fades at both ends avoid clicks. The result is scaled so
/// its peak equals `config.level`.
pub fn log_sweep(config: &SweepConfig, sample_rate: u32) -> AudioBuffer {
    let fs = sample_rate as f64;
    let duration = config.duration_secs as f64;
    let len = (duration * fs).round() as usize;

    let ratio_ln = (config.end_hz as f64 / config.start_hz as f64).ln();
    let k = 2.0 * PI * config.start_hz as f64 * duration / ratio_ln;
    let l = duration / ratio_ln;

    let mut samples: Vec<f32> = (0..len)
        .map(|n| {
            let t = n as f64 / fs;
            (k * ((t / l).exp() - 1.0)).sin() as f32
        })
        .collect();

    let fade_len = ((config.fade_secs as f64 * fs).round() as usize).min(len / 2);
    for i in 0..fade_len {
        let gain = i as f32 / fade_len as f32;
        samples[i] *= gain;
        samples[len - 1 - i] *= gain;
    }

    let mut sweep = AudioBuffer::from_mono(samples, sample_rate);
    sweep.normalize_peak(config.level);
    sweep
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn short_sweep() -> SweepConfig {
        SweepConfig {
            duration_secs: 0.5,
            ..SweepConfig::default()
        }
    }

    #[test]
    fn test_length_and_level() {
        let sweep = log_sweep(&short_sweep(), 44100);
        assert_eq!(sweep.len(), 22050);
        assert_abs_diff_eq!(sweep.peak(), 0.8, epsilon = 1e-6);
    }

    #[test]
    fn test_fades_start_and_end_at_zero() {
        let sweep = log_sweep(&short_sweep(), 44100);
        let samples = sweep.channel(0);
        assert_eq!(samples[0], 0.0);
        assert!(samples[samples.len() - 1].abs() < 1e-6);
    }

    #[test]
    fn test_frequency_rises() {
        // Count zero crossings in the first and last 50 ms (inside the fades
        // the sign changes are still intact)
        let sweep = log_sweep(&short_sweep(), 44100);
        let samples = sweep.channel(0);
        let crossings = |s: &[f32]| s.windows(2).filter(|w| w[0].signum() != w[1].signum()).count();

        let window = 2205;
        let early = crossings(&samples[..window]);
        let late = crossings(&samples[samples.len() - window..]);
        assert!(late > early * 10, "early {} late {}", early, late);
    }
}
