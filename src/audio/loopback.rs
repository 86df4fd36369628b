//! Virtual devices for hardware-free operation
//!
//! A driver thread stands in for the sound card. It runs in real time:
//! every tick it takes what the engine rendered (the "speakers"), optionally
//! passes it through a simulated room, adds the configured source signal and
//! feeds the result back as the "microphone". Faults can be injected to
//! exercise slow opens, failing opens and input starvation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rtrb::{Consumer, Producer, RingBuffer};
use tracing::debug;

use crate::audio::backend::{
    AudioBackend, CaptureStream, DuplexStream, StreamGuard, StreamHealth, StreamRequest,
};
use crate::audio::device::{validate_selection, DeviceDescriptor};
use crate::error::{EngineError, Result};

/// Driver tick; samples are produced to match wall-clock time at each tick
const DRIVER_TICK: Duration = Duration::from_millis(2);

/// Blocks of input the driver keeps queued ahead of real time
const LEAD_BLOCKS: usize = 2;

#[derive(Debug, Clone, Default)]
struct LoopbackOptions {
    device_rate: Option<u32>,
    source: Vec<f32>,
    loop_source: bool,
    room: Option<(Vec<f32>, usize)>,
    open_delay: Option<Duration>,
    open_failure: Option<String>,
    stall_input_after: Option<usize>,
    unavailable: bool,
}

/// Backend with three virtual devices
///
/// | index | name | in | out |
/// |---|---|---|---|
/// | 0 | Loopback Microphone | 1 | 0 |
/// | 1 | Loopback Speakers | 0 | 2 |
/// | 2 | Loopback Duplex | 2 | 2 |
#[derive(Debug, Clone, Default)]
pub struct LoopbackBackend {
    options: LoopbackOptions,
    rendered: Arc<Mutex<Vec<f32>>>,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal heard by the microphone in addition to the room
    pub fn with_source(mut self, samples: Vec<f32>, looped: bool) -> Self {
        self.options.source = samples;
        self.options.loop_source = looped;
        self
    }

    /// Feed rendered output back to the input through `ir` after `latency` samples
    pub fn with_room(mut self, ir: Vec<f32>, latency: usize) -> Self {
        self.options.room = Some((ir, latency));
        self
    }

    /// Run the devices at a fixed rate instead of the requested one
    pub fn with_device_rate(mut self, rate: u32) -> Self {
        self.options.device_rate = Some(rate);
        self
    }

    /// Make every open block for `delay` before completing
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.options.open_delay = Some(delay);
        self
    }

    /// Make every open fail with `reason`
    pub fn with_open_failure(mut self, reason: impl Into<String>) -> Self {
        self.options.open_failure = Some(reason.into());
        self
    }

    /// Stop delivering input after `samples` samples
    pub fn with_input_stall_after(mut self, samples: usize) -> Self {
        self.options.stall_input_after = Some(samples);
        self
    }

    /// Behave as if the host has no audio subsystem
    pub fn unavailable(mut self) -> Self {
        self.options.unavailable = true;
        self
    }

    /// Everything the engine has rendered so far, in order
    pub fn rendered(&self) -> Vec<f32> {
        self.rendered.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn clear_rendered(&self) {
        if let Ok(mut rendered) = self.rendered.lock() {
            rendered.clear();
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.options.unavailable {
            return Err(EngineError::AudioUnavailable {
                reason: "loopback host configured as unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn simulate_open(&self) -> Result<()> {
        if let Some(delay) = self.options.open_delay {
            thread::sleep(delay);
        }
        match &self.options.open_failure {
            Some(reason) => Err(EngineError::DeviceOpen {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn spawn_driver(
        &self,
        request: &StreamRequest,
        sample_rate: u32,
        input: Producer<f32>,
        output: Option<Consumer<f32>>,
        health: Arc<StreamHealth>,
    ) -> Result<Driver> {
        let stop = Arc::new(AtomicBool::new(false));
        let state = DriverState {
            options: self.options.clone(),
            frame_size: request.frame_size.max(1),
            sample_rate,
            input,
            output,
            rendered: Arc::clone(&self.rendered),
            health,
            played: Vec::new(),
            produced: 0,
        };

        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("loopback-driver".to_string())
            .spawn(move || state.run(&thread_stop))
            .map_err(|e| EngineError::DeviceOpen {
                reason: format!("failed to start loopback driver: {}", e),
            })?;

        Ok(Driver {
            stop,
            handle: Some(handle),
        })
    }
}

impl AudioBackend for LoopbackBackend {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.check_available()?;

        let device = |index, name: &str, inputs, outputs, default_in, default_out| DeviceDescriptor {
            index,
            name: name.to_string(),
            max_input_channels: inputs,
            max_output_channels: outputs,
            is_default_input: default_in,
            is_default_output: default_out,
        };

        Ok(vec![
            device(0, "Loopback Microphone", 1, 0, true, false),
            device(1, "Loopback Speakers", 0, 2, false, true),
            device(2, "Loopback Duplex", 2, 2, false, false),
        ])
    }

    fn open_duplex(&self, request: &StreamRequest) -> Result<DuplexStream> {
        validate_selection(&self.list_devices()?, request.input_device, request.output_device)?;
        self.simulate_open()?;

        let sample_rate = self.options.device_rate.unwrap_or(request.sample_rate);
        let health = Arc::new(StreamHealth::default());
        let (input_producer, input_consumer) = RingBuffer::<f32>::new(request.ring_capacity);
        let (output_producer, output_consumer) = RingBuffer::<f32>::new(request.ring_capacity);

        let driver = self.spawn_driver(
            request,
            sample_rate,
            input_producer,
            Some(output_consumer),
            Arc::clone(&health),
        )?;
        debug!(sample_rate, "opened loopback duplex stream");

        Ok(DuplexStream {
            input: input_consumer,
            output: output_producer,
            sample_rate,
            health,
            guard: StreamGuard::new(driver),
        })
    }

    fn open_capture(&self, request: &StreamRequest) -> Result<CaptureStream> {
        validate_selection(&self.list_devices()?, request.input_device, None)?;
        self.simulate_open()?;

        let sample_rate = self.options.device_rate.unwrap_or(request.sample_rate);
        let health = Arc::new(StreamHealth::default());
        let (producer, consumer) = RingBuffer::<f32>::new(request.ring_capacity);

        let driver = self.spawn_driver(request, sample_rate, producer, None, Arc::clone(&health))?;
        debug!(sample_rate, "opened loopback capture stream");

        Ok(CaptureStream {
            input: consumer,
            sample_rate,
            health,
            guard: StreamGuard::new(driver),
        })
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Stops and joins the driver thread on drop
struct Driver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct DriverState {
    options: LoopbackOptions,
    frame_size: usize,
    sample_rate: u32,
    input: Producer<f32>,
    output: Option<Consumer<f32>>,
    rendered: Arc<Mutex<Vec<f32>>>,
    health: Arc<StreamHealth>,
    /// Speaker signal history, silence included, for the room model
    played: Vec<f32>,
    produced: usize,
}

impl DriverState {
    fn run(mut self, stop: &AtomicBool) {
        let started = Instant::now();
        let lead = self.frame_size * LEAD_BLOCKS;

        while !stop.load(Ordering::Acquire) {
            let elapsed = started.elapsed().as_secs_f64();
            let due = (elapsed * self.sample_rate as f64) as usize + lead;
            if due > self.produced {
                self.advance(due - self.produced);
            }
            thread::sleep(DRIVER_TICK);
        }
    }

    fn advance(&mut self, count: usize) {
        let mut rendered = Vec::with_capacity(count);

        for _ in 0..count {
            let speaker = match self.output.as_mut() {
                Some(output) => match output.pop() {
                    Ok(sample) => {
                        rendered.push(sample);
                        sample
                    }
                    Err(_) => 0.0,
                },
                None => 0.0,
            };
            self.played.push(speaker);

            let n = self.produced;
            self.produced += 1;

            if self
                .options
                .stall_input_after
                .is_some_and(|limit| n >= limit)
            {
                continue;
            }

            let sample = self.source_at(n) + self.room_at(n);
            if self.input.push(sample).is_err() {
                self.health.record_input_overflow();
            }
        }

        if !rendered.is_empty() {
            if let Ok(mut sink) = self.rendered.lock() {
                sink.extend_from_slice(&rendered);
            }
        }
    }

    fn source_at(&self, n: usize) -> f32 {
        let source = &self.options.source;
        if source.is_empty() {
            0.0
        } else if self.options.loop_source {
            source[n % source.len()]
        } else {
            source.get(n).copied().unwrap_or(0.0)
        }
    }

    fn room_at(&self, n: usize) -> f32 {
        let Some((ir, latency)) = &self.options.room else {
            return 0.0;
        };
        let Some(newest) = n.checked_sub(*latency) else {
            return 0.0;
        };

        ir.iter()
            .enumerate()
            .take(newest + 1)
            .map(|(k, &h)| h * self.played[newest - k])
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(input: Option<usize>, output: Option<usize>) -> StreamRequest {
        StreamRequest {
            input_device: input,
            output_device: output,
            sample_rate: 8000,
            frame_size: 64,
            ring_capacity: 64 * 8,
        }
    }

    fn drain(consumer: &mut Consumer<f32>, want: usize) -> Vec<f32> {
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut out = Vec::new();
        while out.len() < want && Instant::now() < deadline {
            match consumer.pop() {
                Ok(s) => out.push(s),
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        out
    }

    #[test]
    fn test_lists_virtual_devices() {
        let devices = LoopbackBackend::new().list_devices().unwrap();
        assert_eq!(devices.len(), 3);
        assert!(devices[0].is_default_input);
        assert_eq!(devices[1].max_output_channels, 2);
    }

    #[test]
    fn test_unavailable_host() {
        let backend = LoopbackBackend::new().unavailable();
        assert!(matches!(
            backend.list_devices(),
            Err(EngineError::AudioUnavailable { .. })
        ));
    }

    #[test]
    fn test_capture_delivers_source() {
        let source: Vec<f32> = (0..256).map(|i| i as f32 / 256.0).collect();
        let backend = LoopbackBackend::new().with_source(source.clone(), false);

        let mut stream = backend.open_capture(&request(Some(0), None)).unwrap();
        let captured = drain(&mut stream.input, 256);

        assert_eq!(captured, source);
    }

    #[test]
    fn test_duplex_rejects_output_only_input() {
        let backend = LoopbackBackend::new();
        let result = backend.open_duplex(&request(Some(1), Some(1)));
        assert!(matches!(result, Err(EngineError::DeviceCapability { .. })));
    }

    #[test]
    fn test_room_echoes_rendered_output() {
        let backend = LoopbackBackend::new().with_room(vec![0.5], 16);
        let mut stream = backend.open_duplex(&request(Some(2), Some(2))).unwrap();

        for _ in 0..8 {
            stream.output.push(1.0).unwrap();
        }
        let captured = drain(&mut stream.input, 400);

        // The first rendered samples come back at half level after the latency
        assert!(captured.iter().any(|&s| (s - 0.5).abs() < 1e-6));
        assert_eq!(backend.rendered(), vec![1.0; 8]);
    }

    #[test]
    fn test_stalled_input() {
        let backend = LoopbackBackend::new()
            .with_source(vec![0.25; 1000], true)
            .with_input_stall_after(100);
        let mut stream = backend.open_capture(&request(Some(0), None)).unwrap();

        let captured = drain(&mut stream.input, 200);
        assert_eq!(captured.len(), 100);
    }
}
