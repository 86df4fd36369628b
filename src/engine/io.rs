//! Audio file I/O
//!
//! Handles importing and exporting audio files. WAV is read and written with
//! `hound`; any other container is decoded through `symphonia`.
//!
//! Imported audio is converted to 32-bit float and resampled to the engine
//! sample rate. Sample rate conversion uses linear interpolation.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::debug;

use crate::engine::buffer::{AudioBuffer, ChannelLayout};
use crate::error::{EngineError, Result};

/// Export format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportFormat {
    /// Bit depth: 16, 24, or 32 (default: 24)
    pub bit_depth: u16,
}

impl Default for ExportFormat {
    fn default() -> Self {
        ExportFormat { bit_depth: 24 }
    }
}

impl ExportFormat {
    pub fn new(bit_depth: u16) -> Self {
        ExportFormat { bit_depth }
    }

    /// 32-bit float, lossless for engine buffers
    pub fn float() -> Self {
        ExportFormat { bit_depth: 32 }
    }

    fn wav_spec(&self, channels: u16, sample_rate: u32) -> Result<WavSpec> {
        if !matches!(self.bit_depth, 16 | 24 | 32) {
            return Err(EngineError::UnsupportedFormat {
                format: format!("{}-bit audio (only 16, 24, 32 supported)", self.bit_depth),
            });
        }
        Ok(WavSpec {
            channels,
            sample_rate,
            bits_per_sample: self.bit_depth,
            sample_format: if self.bit_depth == 32 {
                SampleFormat::Float
            } else {
                SampleFormat::Int
            },
        })
    }
}

/// Import an audio file and convert to the engine format
///
/// # Arguments
/// * `path` - Path to the audio file
/// * `target_rate` - Engine sample rate to resample to
///
/// # Errors
/// * `FileNotFound` - If the file does not exist
/// * `UnsupportedFormat` - If no decoder accepts the file, or it has more than 2 channels
/// * `EmptyOrInvalidAudio` - If the file decodes to zero frames
pub fn import_audio(path: &Path, target_rate: u32) -> Result<AudioBuffer> {
    if !path.exists() {
        return Err(EngineError::FileNotFound {
            path: path.display().to_string(),
            source: None,
        });
    }

    let (interleaved, source_rate, channels) = match WavReader::open(path) {
        Ok(reader) => {
            let spec = reader.spec();
            let samples = read_samples_as_f32(reader, spec.bits_per_sample, spec.sample_format)?;
            (samples, spec.sample_rate, spec.channels as usize)
        }
        Err(wav_err) => {
            debug!(path = %path.display(), error = %wav_err, "not a WAV file, probing container");
            decode_container(path)?
        }
    };

    // Reject multi-channel audio (>2 channels)
    let layout = ChannelLayout::from_count(channels).ok_or_else(|| {
        EngineError::UnsupportedFormat {
            format: format!("{}-channel audio (only mono/stereo supported)", channels),
        }
    })?;

    if interleaved.len() < channels || source_rate == 0 {
        return Err(EngineError::invalid_audio(format!(
            "{} contains no audio frames",
            path.display()
        )));
    }

    let buffer = AudioBuffer::from_interleaved(&interleaved, layout, source_rate)?;
    let buffer = resample(&buffer, target_rate);

    debug!(
        path = %path.display(),
        channels,
        source_rate,
        frames = buffer.len(),
        "imported audio"
    );

    Ok(buffer)
}

/// Export an AudioBuffer to a WAV file at the buffer's own sample rate
///
/// # Errors
/// * `UnsupportedFormat` - If the bit depth is not 16, 24 or 32
/// * `Io` - If the file cannot be written
pub fn export_audio(buffer: &AudioBuffer, path: &Path, format: ExportFormat) -> Result<()> {
    let mut sink = WavSink::create(path, buffer.channels() as u16, buffer.sample_rate, format)?;
    sink.write_interleaved(&buffer.to_interleaved())?;
    sink.finalize()?;
    Ok(())
}

/// Incremental WAV writer
///
/// Used where samples arrive over time (recording) rather than as a whole
/// buffer. Samples are expected in [-1.0, 1.0]; integer formats clamp.
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    bit_depth: u16,
    frames_written: u64,
    channels: u16,
}

impl WavSink {
    pub fn create(path: &Path, channels: u16, sample_rate: u32, format: ExportFormat) -> Result<Self> {
        let spec = format.wav_spec(channels, sample_rate)?;
        let writer = WavWriter::create(path, spec).map_err(wav_error)?;
        Ok(Self {
            writer,
            bit_depth: format.bit_depth,
            frames_written: 0,
            channels,
        })
    }

    /// Append interleaved samples
    pub fn write_interleaved(&mut self, samples: &[f32]) -> Result<()> {
        match self.bit_depth {
            16 => {
                for &sample in samples {
                    let scaled = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    self.writer.write_sample(scaled).map_err(wav_error)?;
                }
            }
            24 => {
                for &sample in samples {
                    // 24-bit stored as i32 in hound
                    let scaled = (sample * 8388607.0).clamp(-8388608.0, 8388607.0) as i32;
                    self.writer.write_sample(scaled).map_err(wav_error)?;
                }
            }
            _ => {
                for &sample in samples {
                    self.writer.write_sample(sample).map_err(wav_error)?;
                }
            }
        }
        self.frames_written += (samples.len() / self.channels.max(1) as usize) as u64;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Patch the header and close the file
    pub fn finalize(self) -> Result<u64> {
        let frames = self.frames_written;
        self.writer.finalize().map_err(wav_error)?;
        Ok(frames)
    }
}

/// Resample a buffer to `target_rate`, returning a copy when rates match
pub fn resample(buffer: &AudioBuffer, target_rate: u32) -> AudioBuffer {
    if buffer.sample_rate == target_rate || buffer.sample_rate == 0 {
        return buffer.clone();
    }

    let ratio = target_rate as f64 / buffer.sample_rate as f64;
    AudioBuffer {
        samples: buffer
            .samples
            .iter()
            .map(|channel| resample_linear(channel, ratio))
            .collect(),
        sample_rate: target_rate,
    }
}

/// Linear interpolation resampling
///
/// Linear interpolation introduces aliasing when downsampling. It is
/// adequate for IRs and speech at the rates the engine works at.
pub fn resample_linear(samples: &[f32], ratio: f64) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }

    let source_len = samples.len();
    let target_len = ((source_len as f64) * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(target_len);

    for i in 0..target_len {
        // Map output index to source position
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = (src_pos - src_idx as f64) as f32;

        let sample = if src_idx + 1 < source_len {
            samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac
        } else if src_idx < source_len {
            samples[src_idx]
        } else {
            0.0
        };

        output.push(sample);
    }

    output
}

/// Generate a test tone (sine wave)
///
/// # Arguments
/// * `frequency` - Frequency of the sine wave in Hz
/// * `amplitude` - Peak amplitude
/// * `duration_secs` - Duration of the tone in seconds
/// * `sample_rate` - Sample rate in Hz
pub fn generate_test_tone(
    frequency: f32,
    amplitude: f32,
    duration_secs: f32,
    sample_rate: u32,
) -> AudioBuffer {
    let num_samples = (duration_secs * sample_rate as f32).round() as usize;
    let angular_freq = 2.0 * std::f64::consts::PI * frequency as f64 / sample_rate as f64;

    let samples = (0..num_samples)
        .map(|i| amplitude * (angular_freq * i as f64).sin() as f32)
        .collect();

    AudioBuffer::from_mono(samples, sample_rate)
}

// ============================================================================
// Internal helper functions
// ============================================================================

fn wav_error(e: hound::Error) -> EngineError {
    match e {
        hound::Error::IoError(io) => EngineError::Io(io),
        other => EngineError::internal(format!("WAV write failed: {}", other)),
    }
}

/// Read samples from WAV reader and convert to f32
fn read_samples_as_f32<R: std::io::Read>(
    mut reader: WavReader<R>,
    bits_per_sample: u16,
    sample_format: SampleFormat,
) -> Result<Vec<f32>> {
    let read_failed = |e: hound::Error| EngineError::EmptyOrInvalidAudio {
        reason: format!("Failed to read {}-bit samples: {}", bits_per_sample, e),
        source: Some(Box::new(e)),
    };

    match sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<f32>, _>>()
            .map_err(read_failed),
        SampleFormat::Int => {
            let scale = match bits_per_sample {
                8 => 128.0,
                16 => 32768.0,
                24 => 8388608.0,
                32 => 2147483648.0,
                _ => {
                    return Err(EngineError::UnsupportedFormat {
                        format: format!("{}-bit integer audio", bits_per_sample),
                    })
                }
            };
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<f32>, _>>()
                .map_err(read_failed)
        }
    }
}

/// Decode a non-WAV container with symphonia
///
/// Returns interleaved samples, sample rate and channel count.
fn decode_container(path: &Path) -> Result<(Vec<f32>, u32, usize)> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::errors::Error as SymphoniaError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let unsupported = |reason: String| EngineError::UnsupportedFormat {
        format: format!("{}: {}", path.display(), reason),
    };

    let file = File::open(path).map_err(|e| EngineError::FileNotFound {
        path: path.display().to_string(),
        source: Some(e),
    })?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| unsupported("no audio track".to_string()))?;
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| unsupported("unknown sample rate".to_string()))?;
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| unsupported(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "stopped reading packets");
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(unsupported(e.to_string())),
        };

        if sample_buf.is_none() {
            let spec = *decoded.spec();
            channels = spec.channels.count();
            sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
        }

        if let Some(buf) = sample_buf.as_mut() {
            buf.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buf.samples());
        }
    }

    Ok((samples, sample_rate, channels.max(1)))
}

// ============================================================================
// Tests
// ============================================================================
