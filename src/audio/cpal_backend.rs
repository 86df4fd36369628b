//! Hardware backend on the default cpal host
//!
//! Input callbacks mix every captured frame down to mono and push it into
//! the input ring; output callbacks pop one mono sample per frame and copy
//! it to every channel, playing silence when the ring is empty. Callbacks
//! never block or allocate.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info};

use crate::audio::backend::{
    AudioBackend, CaptureStream, DuplexStream, StreamGuard, StreamHealth, StreamRequest,
};
use crate::audio::device::DeviceDescriptor;
use crate::error::{DeviceDirection, EngineError, Result};

/// Backend over `cpal::default_host()`
///
/// The host is looked up on every call so device lists are never stale.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    fn device_at(&self, index: Option<usize>, direction: DeviceDirection) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match index {
            Some(index) => host
                .devices()
                .map_err(|e| EngineError::AudioUnavailable {
                    reason: e.to_string(),
                })?
                .nth(index)
                .ok_or(EngineError::DeviceNotFound { index, direction }),
            None => {
                let device = match direction {
                    DeviceDirection::Input => host.default_input_device(),
                    DeviceDirection::Output => host.default_output_device(),
                };
                device.ok_or_else(|| EngineError::DeviceOpen {
                    reason: format!("no default {} device", direction),
                })
            }
        }
    }
}

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let host = cpal::default_host();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let devices = host.devices().map_err(|e| EngineError::AudioUnavailable {
            reason: e.to_string(),
        })?;

        let descriptors: Vec<DeviceDescriptor> = devices
            .enumerate()
            .map(|(index, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Device {}", index));
                let max_input_channels = device
                    .supported_input_configs()
                    .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
                    .unwrap_or(0);
                let max_output_channels = device
                    .supported_output_configs()
                    .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
                    .unwrap_or(0);

                DeviceDescriptor {
                    index,
                    is_default_input: default_input.as_deref() == Some(name.as_str()),
                    is_default_output: default_output.as_deref() == Some(name.as_str()),
                    name,
                    max_input_channels,
                    max_output_channels,
                }
            })
            .collect();

        debug!(count = descriptors.len(), host = ?host.id(), "enumerated audio devices");
        Ok(descriptors)
    }

    fn open_duplex(&self, request: &StreamRequest) -> Result<DuplexStream> {
        let input_device = self.device_at(request.input_device, DeviceDirection::Input)?;
        let output_device = self.device_at(request.output_device, DeviceDirection::Output)?;

        let input_ranges = supported_ranges(&input_device, DeviceDirection::Input)?;
        let output_ranges = supported_ranges(&output_device, DeviceDirection::Output)?;

        let sample_rate = negotiate_rate(
            request.sample_rate,
            &input_ranges,
            &output_ranges,
            default_rate(&input_device, DeviceDirection::Input),
            default_rate(&output_device, DeviceDirection::Output),
        )?;

        let input_config = pick_config(&input_ranges, sample_rate, DeviceDirection::Input)?;
        let output_config = pick_config(&output_ranges, sample_rate, DeviceDirection::Output)?;

        let health = Arc::new(StreamHealth::default());
        let (input_producer, input_consumer) = RingBuffer::<f32>::new(request.ring_capacity);
        let (output_producer, output_consumer) = RingBuffer::<f32>::new(request.ring_capacity);

        let input_stream = build_input(&input_device, &input_config, input_producer, &health)?;
        let output_stream = build_output(&output_device, &output_config, output_consumer, &health)?;

        input_stream.play().map_err(|e| EngineError::DeviceOpen {
            reason: format!("failed to start input stream: {}", e),
        })?;
        output_stream.play().map_err(|e| EngineError::DeviceOpen {
            reason: format!("failed to start output stream: {}", e),
        })?;

        info!(
            input = %input_device.name().unwrap_or_default(),
            output = %output_device.name().unwrap_or_default(),
            sample_rate,
            "opened duplex stream"
        );

        Ok(DuplexStream {
            input: input_consumer,
            output: output_producer,
            sample_rate,
            health,
            guard: StreamGuard::new((input_stream, output_stream)),
        })
    }

    fn open_capture(&self, request: &StreamRequest) -> Result<CaptureStream> {
        let device = self.device_at(request.input_device, DeviceDirection::Input)?;
        let ranges = supported_ranges(&device, DeviceDirection::Input)?;

        let sample_rate = if ranges.iter().any(|r| supports_rate(r, request.sample_rate)) {
            request.sample_rate
        } else {
            default_rate(&device, DeviceDirection::Input).ok_or_else(|| EngineError::DeviceOpen {
                reason: format!("input device does not support {} Hz", request.sample_rate),
            })?
        };
        let config = pick_config(&ranges, sample_rate, DeviceDirection::Input)?;

        let health = Arc::new(StreamHealth::default());
        let (producer, consumer) = RingBuffer::<f32>::new(request.ring_capacity);
        let stream = build_input(&device, &config, producer, &health)?;
        stream.play().map_err(|e| EngineError::DeviceOpen {
            reason: format!("failed to start input stream: {}", e),
        })?;

        info!(
            input = %device.name().unwrap_or_default(),
            sample_rate,
            "opened capture stream"
        );

        Ok(CaptureStream {
            input: consumer,
            sample_rate,
            health,
            guard: StreamGuard::new(stream),
        })
    }
}

// ============================================================================
// Configuration
// ============================================================================

fn supported_ranges(
    device: &cpal::Device,
    direction: DeviceDirection,
) -> Result<Vec<cpal::SupportedStreamConfigRange>> {
    let ranges: Vec<_> = match direction {
        DeviceDirection::Input => device.supported_input_configs().map(|c| c.collect()),
        DeviceDirection::Output => device.supported_output_configs().map(|c| c.collect()),
    }
    .map_err(|e| EngineError::DeviceOpen {
        reason: e.to_string(),
    })?;

    if ranges.is_empty() {
        return Err(EngineError::DeviceOpen {
            reason: format!("device has no supported {} configurations", direction),
        });
    }
    Ok(ranges)
}

fn supports_rate(range: &cpal::SupportedStreamConfigRange, rate: u32) -> bool {
    range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0
}

fn default_rate(device: &cpal::Device, direction: DeviceDirection) -> Option<u32> {
    match direction {
        DeviceDirection::Input => device.default_input_config(),
        DeviceDirection::Output => device.default_output_config(),
    }
    .ok()
    .map(|c| c.sample_rate().0)
}

/// One rate both directions can run at
///
/// The preferred rate wins when both devices support it; otherwise the two
/// defaults must agree.
fn negotiate_rate(
    preferred: u32,
    input: &[cpal::SupportedStreamConfigRange],
    output: &[cpal::SupportedStreamConfigRange],
    input_default: Option<u32>,
    output_default: Option<u32>,
) -> Result<u32> {
    let input_ok = input.iter().any(|r| supports_rate(r, preferred));
    let output_ok = output.iter().any(|r| supports_rate(r, preferred));
    if input_ok && output_ok {
        return Ok(preferred);
    }

    match (input_default, output_default) {
        (Some(a), Some(b)) if a == b => {
            debug!(preferred, negotiated = a, "devices share a default rate");
            Ok(a)
        }
        _ => Err(EngineError::DeviceOpen {
            reason: format!(
                "input and output cannot agree on a sample rate (preferred {} Hz, defaults {:?} / {:?})",
                preferred, input_default, output_default
            ),
        }),
    }
}

fn pick_config(
    ranges: &[cpal::SupportedStreamConfigRange],
    rate: u32,
    direction: DeviceDirection,
) -> Result<cpal::SupportedStreamConfig> {
    let matching = ranges.iter().filter(|r| supports_rate(r, rate));
    let best = matching
        .clone()
        .find(|r| r.sample_format() == SampleFormat::F32)
        .or_else(|| matching.clone().next())
        .ok_or_else(|| EngineError::DeviceOpen {
            reason: format!("{} device does not support {} Hz", direction, rate),
        })?;

    Ok(best.clone().with_sample_rate(cpal::SampleRate(rate)))
}

// ============================================================================
// Streams
// ============================================================================

fn build_input(
    device: &cpal::Device,
    supported: &cpal::SupportedStreamConfig,
    producer: Producer<f32>,
    health: &Arc<StreamHealth>,
) -> Result<Stream> {
    let config = supported.config();
    match supported.sample_format() {
        SampleFormat::F32 => input_stream::<f32>(device, &config, producer, health),
        SampleFormat::I16 => input_stream::<i16>(device, &config, producer, health),
        SampleFormat::U16 => input_stream::<u16>(device, &config, producer, health),
        SampleFormat::I32 => input_stream::<i32>(device, &config, producer, health),
        other => Err(EngineError::DeviceOpen {
            reason: format!("unsupported input sample format {:?}", other),
        }),
    }
}

fn build_output(
    device: &cpal::Device,
    supported: &cpal::SupportedStreamConfig,
    consumer: Consumer<f32>,
    health: &Arc<StreamHealth>,
) -> Result<Stream> {
    let config = supported.config();
    match supported.sample_format() {
        SampleFormat::F32 => output_stream::<f32>(device, &config, consumer, health),
        SampleFormat::I16 => output_stream::<i16>(device, &config, consumer, health),
        SampleFormat::U16 => output_stream::<u16>(device, &config, consumer, health),
        SampleFormat::I32 => output_stream::<i32>(device, &config, consumer, health),
        other => Err(EngineError::DeviceOpen {
            reason: format!("unsupported output sample format {:?}", other),
        }),
    }
}

fn input_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: Producer<f32>,
    health: &Arc<StreamHealth>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let scale = 1.0 / channels as f32;
    let data_health = Arc::clone(health);
    let error_health = Arc::clone(health);

    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                for frame in data.chunks(channels) {
                    let mono: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum::<f32>() * scale;
                    if producer.push(mono).is_err() {
                        data_health.record_input_overflow();
                    }
                }
            },
            move |err| error_health.record_fault(err.to_string()),
            None,
        )
        .map_err(|e| EngineError::DeviceOpen {
            reason: format!("failed to build input stream: {}", e),
        })
}

fn output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut consumer: Consumer<f32>,
    health: &Arc<StreamHealth>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let data_health = Arc::clone(health);
    let error_health = Arc::clone(health);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let value = match consumer.pop() {
                        Ok(sample) => sample,
                        Err(_) => {
                            data_health.record_output_underflow();
                            0.0
                        }
                    };
                    for out in frame.iter_mut() {
                        *out = T::from_sample(value);
                    }
                }
            },
            move |err| error_health.record_fault(err.to_string()),
            None,
        )
        .map_err(|e| EngineError::DeviceOpen {
            reason: format!("failed to build output stream: {}", e),
        })
}
