//! Per-block live processing: inverse filter, optional energy gate, then
//! output gain

use crate::dsp::convolution::OverlapSaveConvolver;
use crate::dsp::inverse::InverseFilter;
use crate::dsp::postprocess::EnergyGate;

/// Clamp a requested volume into `[0, max_volume]`
///
/// Non-finite requests are treated as silence.
pub fn clamp_volume(volume: f32, max_volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, max_volume)
    } else {
        0.0
    }
}

/// Streaming inverse filter for fixed-size blocks
///
/// Holds every buffer it needs; [`process`](Self::process) performs no
/// allocation.
pub struct LiveProcessor {
    convolver: OverlapSaveConvolver,
    volume: f32,
    latency: usize,
    gate: Option<EnergyGate>,
}

impl LiveProcessor {
    pub fn new(filter: &InverseFilter, block_size: usize, volume: f32) -> Self {
        Self {
            convolver: OverlapSaveConvolver::new(filter.taps(), block_size),
            volume,
            latency: filter.delay(),
            gate: None,
        }
    }

    pub fn with_energy_gate(mut self, gate: Option<EnergyGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn block_size(&self) -> usize {
        self.convolver.block_size()
    }

    /// Samples between an input sample and its recovered output
    pub fn latency(&self) -> usize {
        self.latency
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    /// Filter one block of `block_size` samples
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        self.convolver.process_block(input, output);
        if let Some(gate) = &self.gate {
            gate.apply(output);
        }
        if self.volume != 1.0 {
            for sample in output.iter_mut() {
                *sample *= self.volume;
            }
        }
    }

    pub fn reset(&mut self) {
        self.convolver.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(0.7, 1.5), 0.7);
        assert_eq!(clamp_volume(3.0, 1.5), 1.5);
        assert_eq!(clamp_volume(-1.0, 1.5), 0.0);
        assert_eq!(clamp_volume(f32::NAN, 1.5), 0.0);
    }

    #[test]
    fn test_identity_filter_delays_and_scales() {
        let filter = InverseFilter::design(&[1.0], 64, 1e-6).unwrap();
        let mut processor = LiveProcessor::new(&filter, 16, 0.5);
        assert_eq!(processor.latency(), 32);

        let mut input = vec![0.0_f32; 16];
        input[0] = 1.0;
        let mut output = vec![0.0_f32; 16];
        let mut rendered = Vec::new();

        processor.process(&input, &mut output);
        rendered.extend_from_slice(&output);
        input[0] = 0.0;
        for _ in 0..3 {
            processor.process(&input, &mut output);
            rendered.extend_from_slice(&output);
        }

        assert_abs_diff_eq!(rendered[32], 0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(rendered[31], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn test_energy_gate_softens_quiet_blocks() {
        let filter = InverseFilter::design(&[1.0], 64, 1e-6).unwrap();
        let gate = EnergyGate::from_config(&crate::config::EnergyGateConfig {
            enabled: true,
            ..Default::default()
        });
        let mut gated = LiveProcessor::new(&filter, 16, 1.0).with_energy_gate(gate);
        let mut plain = LiveProcessor::new(&filter, 16, 1.0);

        let quiet = vec![0.001_f32; 16];
        let mut a = vec![0.0_f32; 16];
        let mut b = vec![0.0_f32; 16];
        for _ in 0..4 {
            gated.process(&quiet, &mut a);
            plain.process(&quiet, &mut b);
        }

        assert_abs_diff_eq!(a[8], 0.2 * b[8], epsilon = 1e-6);
        assert!(b[8].abs() > 5e-4);
    }
}
