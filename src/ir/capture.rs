//! IR Capture
//!
//! A log sweep is played through the system under test while the response
//! is recorded; the impulse response is the recording divided by the sweep
//! in the frequency domain. The recording is first aligned against the
//! probe so playback latency does not end up as pre-delay in the IR.
//!
//! The offline variant works on two existing buffers; the live variant
//! drives a duplex device stream to produce the recording itself.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::audio::backend::{spawn_stream_worker, AudioBackend, DuplexStream, StreamRequest};
use crate::config::{EngineConfig, SweepConfig};
use crate::dsp::alignment::{align, Alignment};
use crate::dsp::fft::{forward, inverse_real, next_fast_len};
use crate::dsp::inverse::regularized_inverse;
use crate::dsp::sweep::log_sweep;
use crate::engine::buffer::AudioBuffer;
use crate::error::{EngineError, Result};

/// Poll interval of the live capture loop
const CAPTURE_POLL: Duration = Duration::from_millis(2);

/// Extra wall-clock time a live capture may take beyond its nominal length
const CAPTURE_SLACK: Duration = Duration::from_secs(2);

/// Parameters shared by both capture variants
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub sweep: SweepConfig,
    pub max_latency_secs: f32,
    pub min_confidence: f32,
    pub max_ir_secs: f32,
    pub fade_secs: f32,
    pub regularization: f32,
}

impl CaptureSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            sweep: config.sweep.clone(),
            max_latency_secs: config.alignment.max_latency_secs,
            min_confidence: config.alignment.min_confidence,
            max_ir_secs: config.ir.capture_max_secs,
            fade_secs: config.ir.capture_fade_secs,
            regularization: config.ir.capture_regularization,
        }
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Result of an IR measurement
#[derive(Debug, Clone)]
pub struct CapturedIr {
    /// Mono IR starting at its peak, faded out and peak-normalized
    pub buffer: AudioBuffer,
    pub alignment: Alignment,
}

/// Raw material of a live measurement, at the negotiated device rate
#[derive(Debug, Clone)]
pub struct LiveRecording {
    pub probe: AudioBuffer,
    pub recorded: AudioBuffer,
}

/// Derive the impulse response linking `probe` to `recorded`
///
/// # Errors
/// * `InvalidInput` - if either signal is empty
/// * `AlignmentFailed` - if the probe cannot be located in the recording
/// * `DegenerateIr` - if the probe has no usable spectrum
pub fn extract_ir(
    probe: &[f32],
    recorded: &[f32],
    sample_rate: u32,
    settings: &CaptureSettings,
) -> Result<CapturedIr> {
    let max_lag = (settings.max_latency_secs * sample_rate as f32) as usize;
    let alignment = align(probe, recorded, max_lag, settings.min_confidence)?;
    debug!(lag = alignment.lag, confidence = alignment.confidence, "aligned capture");

    let aligned = &recorded[alignment.lag..];
    let size = next_fast_len(aligned.len() + probe.len());

    let (probe_inverse, _) = regularized_inverse(&forward(probe, size), settings.regularization)?;
    let mut spectrum = forward(aligned, size);
    for (bin, inv) in spectrum.iter_mut().zip(&probe_inverse) {
        *bin *= inv;
    }
    let response = inverse_real(spectrum);

    let peak_index = response
        .iter()
        .enumerate()
        .fold((0, 0.0_f32), |best, (i, &s)| if s.abs() > best.1 { (i, s.abs()) } else { best })
        .0;

    let max_len = ((settings.max_ir_secs * sample_rate as f32) as usize).max(1);
    let end = (peak_index + max_len).min(response.len());
    let mut ir = response[peak_index..end].to_vec();

    let fade_len = ((settings.fade_secs * sample_rate as f32) as usize).min(ir.len() / 2);
    let len = ir.len();
    for i in 0..fade_len {
        ir[len - 1 - i] *= i as f32 / fade_len as f32;
    }

    let mut buffer = AudioBuffer::from_mono(ir, sample_rate);
    if !buffer.is_finite() || buffer.peak() <= 0.0 {
        return Err(EngineError::DegenerateIr {
            reason: "extracted impulse response is silent".to_string(),
        });
    }
    buffer.normalize_peak(1.0);

    Ok(CapturedIr { buffer, alignment })
}

/// Capture from a probe file and the recorded room response
///
/// # Errors
/// `LengthMismatch` if the two buffers are at different rates; otherwise
/// as [`extract_ir`]
pub fn capture_offline(
    probe: &AudioBuffer,
    response: &AudioBuffer,
    settings: &CaptureSettings,
) -> Result<CapturedIr> {
    if probe.sample_rate != response.sample_rate {
        return Err(EngineError::LengthMismatch {
            signal_rate: response.sample_rate,
            ir_rate: probe.sample_rate,
        });
    }

    let probe = probe.to_mono();
    let response = response.to_mono();
    let captured = extract_ir(probe.channel(0), response.channel(0), probe.sample_rate, settings)?;

    info!(
        lag = captured.alignment.lag,
        confidence = captured.alignment.confidence,
        length = captured.buffer.len(),
        "captured impulse response offline"
    );
    Ok(captured)
}

/// Play a sweep through the selected devices and record the response
///
/// The sweep is generated at whatever rate the devices negotiate. The call
/// blocks for the sweep plus `sweep.tail_secs`.
///
/// # Errors
/// * `DeviceNotFound` / `DeviceOpen` / `DeviceTimeout` - opening the stream
/// * `StreamFault` - the input stopped delivering samples
pub fn record_live(
    backend: Arc<dyn AudioBackend>,
    request: StreamRequest,
    sweep: SweepConfig,
    device_timeout: Duration,
) -> Result<LiveRecording> {
    let open_backend = Arc::clone(&backend);
    let open_request = request.clone();

    let (handle, sample_rate) = spawn_stream_worker(
        "ir-capture",
        device_timeout,
        move || open_backend.open_duplex(&open_request),
        move |stream| play_and_record(stream, &sweep),
    )?;
    debug!(sample_rate, backend = backend.name(), "capture stream open");

    match handle.join() {
        Ok(Some(result)) => result,
        Ok(None) => Err(EngineError::internal("capture worker exited without a result")),
        Err(_) => Err(EngineError::internal("capture worker panicked")),
    }
}

fn play_and_record(mut stream: DuplexStream, sweep: &SweepConfig) -> Result<LiveRecording> {
    let rate = stream.sample_rate;
    let probe = log_sweep(sweep, rate);
    let tail = (sweep.tail_secs.max(0.0) * rate as f32) as usize;
    let total = probe.len() + tail;

    let nominal = Duration::from_secs_f64(total as f64 / rate as f64);
    let deadline = Instant::now() + nominal + CAPTURE_SLACK;

    let source = probe.channel(0);
    let mut played = 0usize;
    let mut recorded = Vec::with_capacity(total);

    while recorded.len() < total {
        if Instant::now() > deadline {
            warn!(recorded = recorded.len(), expected = total, "capture input stalled");
            return Err(EngineError::StreamFault {
                reason: format!(
                    "input delivered {} of {} samples before the deadline",
                    recorded.len(),
                    total
                ),
            });
        }

        while played < total && stream.output.slots() > 0 {
            let sample = source.get(played).copied().unwrap_or(0.0);
            if stream.output.push(sample).is_err() {
                break;
            }
            played += 1;
        }

        while recorded.len() < total {
            match stream.input.pop() {
                Ok(sample) => recorded.push(sample),
                Err(_) => break,
            }
        }

        thread::sleep(CAPTURE_POLL);
    }

    if stream.health.faults() > 0 {
        warn!(faults = stream.health.faults(), "stream faults during capture");
    }

    Ok(LiveRecording {
        probe,
        recorded: AudioBuffer::from_mono(recorded, rate),
    })
}
