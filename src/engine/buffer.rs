//! Audio Buffer Management
//!
//! Non-interleaved 32-bit float buffers, mono or stereo, that always carry
//! their own sample rate. Every decoded file, IR, probe and recovered signal
//! passes through [`AudioBuffer`].

use crate::error::{EngineError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Peak level below which audio counts as silent (-120 dBFS)
pub const SILENCE_PEAK: f32 = 1e-6;

/// Mean sample value above which an IR has its DC removed
pub const DC_OFFSET_THRESHOLD: f32 = 0.01;

/// Magnitude treated as full scale when looking for clipping
pub const CLIP_SAMPLE_THRESHOLD: f32 = 0.999;

/// Consecutive full-scale samples that count as a clipped run
pub const CLIP_RUN_LENGTH: usize = 3;

/// Mean sample value over all channels; 0.0 for an empty buffer
pub fn calculate_mean(buffer: &AudioBuffer) -> f32 {
    let count = buffer.channels() * buffer.len();
    if count == 0 {
        return 0.0;
    }
    let sum: f64 = buffer.samples.iter().flatten().map(|&s| s as f64).sum();
    (sum / count as f64) as f32
}

/// Longest run of full-scale samples in any channel
///
/// A lone 1.0 (a normalized impulse) is a run of one, not clipping.
pub fn longest_clipped_run(buffer: &AudioBuffer) -> usize {
    buffer
        .samples
        .iter()
        .map(|channel| {
            channel
                .iter()
                .fold((0usize, 0usize), |(run, longest), &s| {
                    let run = if s.abs() >= CLIP_SAMPLE_THRESHOLD { run + 1 } else { 0 };
                    (run, longest.max(run))
                })
                .1
        })
        .max()
        .unwrap_or(0)
}

// ============================================================================
// Channel Layout
// ============================================================================

/// Supported channel configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelLayout {
    #[default]
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn num_channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    /// `None` for anything other than one or two channels
    pub fn from_count(count: usize) -> Option<Self> {
        match count {
            1 => Some(ChannelLayout::Mono),
            2 => Some(ChannelLayout::Stereo),
            _ => None,
        }
    }
}

/// Length limits a buffer must satisfy in [`AudioBuffer::validate`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioBounds {
    pub min_samples: usize,
    pub max_duration_secs: f64,
}

impl Default for AudioBounds {
    fn default() -> Self {
        Self {
            min_samples: 1,
            max_duration_secs: 2.0 * 60.0 * 60.0,
        }
    }
}

// ============================================================================
// Audio Buffer
// ============================================================================

/// Non-interleaved audio: `samples[channel][frame]`
///
/// # Example
/// ```
/// use noisecleanse::engine::AudioBuffer;
///
/// let buffer = AudioBuffer::from_mono(vec![0.0, 0.5, -0.25], 48000);
/// assert_eq!(buffer.channels(), 1);
/// assert_eq!(buffer.peak(), 0.5);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<Vec<f32>>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn from_mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: vec![samples],
            sample_rate,
        }
    }

    /// Split interleaved frames into channels
    ///
    /// # Errors
    /// `EmptyOrInvalidAudio` if the length is not a whole number of frames
    pub fn from_interleaved(interleaved: &[f32], layout: ChannelLayout, sample_rate: u32) -> Result<Self> {
        let channels = layout.num_channels();
        if interleaved.len() % channels != 0 {
            return Err(EngineError::invalid_audio(format!(
                "{} interleaved samples do not divide into {} channels",
                interleaved.len(),
                channels
            )));
        }

        let samples = (0..channels)
            .map(|ch| interleaved.iter().skip(ch).step_by(channels).copied().collect())
            .collect();

        Ok(Self { samples, sample_rate })
    }

    pub fn to_interleaved(&self) -> Vec<f32> {
        (0..self.len())
            .flat_map(|frame| self.samples.iter().map(move |channel| channel[frame]))
            .collect()
    }

    /// Average all channels into one
    pub fn to_mono(&self) -> AudioBuffer {
        if self.channels() <= 1 {
            return self.clone();
        }

        let scale = 1.0 / self.channels() as f32;
        let mixed = (0..self.len())
            .map(|i| self.samples.iter().map(|ch| ch[i]).sum::<f32>() * scale)
            .collect();

        AudioBuffer::from_mono(mixed, self.sample_rate)
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.samples.len()
    }

    /// Frames per channel
    #[inline]
    pub fn len(&self) -> usize {
        self.samples.first().map_or(0, Vec::len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.len() as f64 / self.sample_rate as f64
        }
    }

    /// # Panics
    /// Panics if `index` is not a channel of this buffer
    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.samples[index]
    }

    /// Largest absolute sample across all channels
    pub fn peak(&self) -> f32 {
        self.samples
            .iter()
            .flatten()
            .fold(0.0_f32, |peak, &s| peak.max(s.abs()))
    }

    /// Sum of squares across all channels
    pub fn energy(&self) -> f64 {
        self.samples.iter().flatten().map(|&s| (s as f64).powi(2)).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.samples.iter().flatten().all(|s| s.is_finite())
    }

    /// Reject buffers that cannot be processed
    ///
    /// Checks, in order: emptiness, length bounds, non-finite samples,
    /// silence, clipping.
    ///
    /// # Errors
    /// `EmptyOrInvalidAudio` describing the first failed check
    pub fn validate(&self, bounds: &AudioBounds) -> Result<()> {
        if self.is_empty() {
            return Err(EngineError::invalid_audio("audio contains no samples"));
        }
        if self.len() < bounds.min_samples || self.duration_secs() > bounds.max_duration_secs {
            return Err(EngineError::invalid_audio(format!(
                "{} samples ({:.3}s) outside accepted range ({} samples to {:.1}s)",
                self.len(),
                self.duration_secs(),
                bounds.min_samples,
                bounds.max_duration_secs
            )));
        }
        if !self.is_finite() {
            return Err(EngineError::invalid_audio("audio contains NaN or infinite samples"));
        }
        if self.peak() <= SILENCE_PEAK {
            return Err(EngineError::invalid_audio("audio is silent"));
        }
        let clipped = longest_clipped_run(self);
        if clipped >= CLIP_RUN_LENGTH {
            return Err(EngineError::invalid_audio(format!(
                "clipping detected ({} consecutive full-scale samples)",
                clipped
            )));
        }
        Ok(())
    }

    /// Subtract each channel's mean
    pub fn remove_dc(&mut self) {
        for channel in &mut self.samples {
            if channel.is_empty() {
                continue;
            }
            let mean = (channel.iter().map(|&s| s as f64).sum::<f64>() / channel.len() as f64) as f32;
            channel.iter_mut().for_each(|s| *s -= mean);
        }
    }

    pub fn scale(&mut self, factor: f32) {
        self.samples
            .iter_mut()
            .flatten()
            .for_each(|s| *s *= factor);
    }

    /// Scale so the peak equals `target`; silent buffers are left alone
    pub fn normalize_peak(&mut self, target: f32) {
        let peak = self.peak();
        if peak > 0.0 {
            self.scale(target / peak);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(samples: Vec<Vec<f32>>) -> AudioBuffer {
        AudioBuffer {
            samples,
            sample_rate: 44100,
        }
    }

    #[test]
    fn test_mean_and_remove_dc() {
        let mut b = buffer(vec![vec![0.5, 0.7, 0.3, 0.5]]);
        assert!((calculate_mean(&b) - 0.5).abs() < 1e-6);

        b.remove_dc();
        assert!(calculate_mean(&b).abs() < 1e-6);
        assert!((b.channel(0)[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_single_full_scale_sample_is_not_clipping() {
        let mut samples = vec![0.0; 256];
        samples[0] = 1.0;
        let b = buffer(vec![samples]);

        assert_eq!(longest_clipped_run(&b), 1);
        assert!(b.validate(&AudioBounds::default()).is_ok());
    }

    #[test]
    fn test_flat_top_is_clipping() {
        let mut samples = vec![0.2; 100];
        samples[40..45].fill(-1.0);
        let b = buffer(vec![vec![0.1; 100], samples]);

        assert_eq!(longest_clipped_run(&b), 5);
        let result = b.validate(&AudioBounds::default());
        assert!(matches!(result, Err(EngineError::EmptyOrInvalidAudio { .. })));
    }

    #[test]
    fn test_interleaving() {
        let interleaved = vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let b = AudioBuffer::from_interleaved(&interleaved, ChannelLayout::Stereo, 44100).unwrap();

        assert_eq!(b.channels(), 2);
        assert_eq!(b.channel(0), &[0.1, 0.3, 0.5]);
        assert_eq!(b.channel(1), &[0.2, 0.4, 0.6]);
        assert_eq!(b.to_interleaved(), interleaved);

        assert!(AudioBuffer::from_interleaved(&[0.1; 5], ChannelLayout::Stereo, 44100).is_err());
        assert_eq!(ChannelLayout::from_count(6), None);
    }

    #[test]
    fn test_to_mono_averages_channels() {
        let b = buffer(vec![vec![1.0, 0.0, 0.5], vec![0.0, 1.0, 0.5]]);
        let mono = b.to_mono();

        assert_eq!(mono.channels(), 1);
        assert_eq!(mono.channel(0), &[0.5, 0.5, 0.5]);
        assert_eq!(mono.sample_rate, 44100);
    }

    #[test]
    fn test_normalize_peak() {
        let mut b = buffer(vec![vec![0.1, -0.4, 0.2]]);
        b.normalize_peak(1.0);
        assert_eq!(b.channel(0)[1], -1.0);

        let mut silent = buffer(vec![vec![0.0; 8]]);
        silent.normalize_peak(1.0);
        assert!(silent.is_finite());
        assert_eq!(silent.peak(), 0.0);
    }

    #[test]
    fn test_validation_failures() {
        let bounds = AudioBounds::default();
        assert!(buffer(vec![vec![]]).validate(&bounds).is_err());
        assert!(buffer(vec![vec![0.0; 1000]]).validate(&bounds).is_err());
        assert!(buffer(vec![vec![0.1, f32::NAN]]).validate(&bounds).is_err());

        let short = AudioBounds {
            min_samples: 1,
            max_duration_secs: 0.01,
        };
        assert!(buffer(vec![vec![0.1; 44100]]).validate(&short).is_err());
    }
}
