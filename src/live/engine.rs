//! Live Deconvolution Engine
//!
//! State machine:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!                        |
//!                        +-> Failed -> Idle   (on stop, start or reset)
//! ```
//!
//! Transitions are serialized by a single transition lock. The worker
//! thread owns the device stream and the filter state; everything else sees
//! the session only through the [`LiveStatus`] snapshot.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audio::backend::{spawn_stream_worker, AudioBackend, DuplexStream, OpenedStream, StreamRequest};
use crate::audio::device::validate_selection;
use crate::config::LiveConfig;
use crate::dsp::postprocess::EnergyGate;
use crate::error::{EngineError, Result};
use crate::ir::ImpulseResponse;
use crate::live::processor::{clamp_volume, LiveProcessor};

/// Live session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LiveState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl fmt::Display for LiveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LiveState::Idle => write!(f, "Idle"),
            LiveState::Starting => write!(f, "Starting"),
            LiveState::Running => write!(f, "Running"),
            LiveState::Stopping => write!(f, "Stopping"),
            LiveState::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot of the live session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub state: LiveState,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub volume: f32,
    pub ir_fingerprint: Option<String>,
    pub sample_rate: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub blocks_processed: u64,
    pub underruns: u64,
    /// Output samples dropped because the output ring was full
    pub overruns: u64,
    pub last_error: Option<String>,
}

impl LiveStatus {
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            LiveState::Starting | LiveState::Running | LiveState::Stopping
        )
    }
}

/// Parameters of one live session
#[derive(Debug, Clone)]
pub struct LiveRequest {
    pub ir: Arc<ImpulseResponse>,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub volume: f32,
}

/// Stream plus the filter designed for its negotiated rate
struct PreparedSession {
    stream: DuplexStream,
    processor: LiveProcessor,
}

impl OpenedStream for PreparedSession {
    fn sample_rate(&self) -> u32 {
        self.stream.sample_rate
    }
}

/// Owner of the process-wide live session
pub struct LiveEngine {
    backend: Arc<dyn AudioBackend>,
    config: LiveConfig,
    engine_rate: u32,
    min_design_len: usize,
    status: Arc<Mutex<LiveStatus>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<Option<()>>>>,
    transition: Mutex<()>,
}

impl LiveEngine {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: LiveConfig,
        engine_rate: u32,
        min_design_len: usize,
    ) -> Self {
        Self {
            backend,
            config,
            engine_rate,
            min_design_len,
            status: Arc::new(Mutex::new(LiveStatus::default())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            transition: Mutex::new(()),
        }
    }

    /// Current snapshot; never blocks on the worker
    pub fn status(&self) -> LiveStatus {
        lock(&self.status).clone()
    }

    pub fn state(&self) -> LiveState {
        lock(&self.status).state
    }

    /// Validate devices, open the duplex stream and start processing
    ///
    /// Returns once the stream is open and the session is `Running`.
    ///
    /// # Errors
    /// * `StateConflict` - a session is already active
    /// * `DeviceNotFound` / `DeviceCapability` - bad device indices (nothing is opened)
    /// * `DeviceOpen` / `DeviceTimeout` - opening failed; the state returns to `Idle`
    /// * `DegenerateIr` - the IR cannot be inverted at the device rate
    pub fn start(&self, request: LiveRequest) -> Result<LiveStatus> {
        let _transition = lock(&self.transition);

        let current = self.status();
        if current.is_active() {
            warn!(state = %current.state, "live start rejected");
            return Err(EngineError::state_conflict(format!(
                "live session is {}",
                current.state
            )));
        }
        self.join_worker();
        *lock(&self.status) = LiveStatus::default();

        let devices = self.backend.list_devices()?;
        validate_selection(&devices, request.input_device, request.output_device)?;

        let volume = clamp_volume(request.volume, self.config.max_volume);
        *lock(&self.status) = LiveStatus {
            state: LiveState::Starting,
            input_device: request.input_device,
            output_device: request.output_device,
            volume,
            ir_fingerprint: Some(request.ir.fingerprint().to_string()),
            ..LiveStatus::default()
        };
        self.stop.store(false, Ordering::Release);
        info!(
            input = ?request.input_device,
            output = ?request.output_device,
            volume,
            "starting live session"
        );

        let frame_size = self.config.frame_size;
        let stream_request = StreamRequest {
            input_device: request.input_device,
            output_device: request.output_device,
            sample_rate: self.engine_rate,
            frame_size,
            ring_capacity: frame_size * self.config.ring_blocks,
        };

        let backend = Arc::clone(&self.backend);
        let ir = Arc::clone(&request.ir);
        let min_design_len = self.min_design_len;
        let gate = EnergyGate::from_config(&self.config.energy_gate);
        let open = move || -> Result<PreparedSession> {
            let stream = backend.open_duplex(&stream_request)?;
            let processor = design_processor(&ir, stream.sample_rate, min_design_len, frame_size, volume)?
                .with_energy_gate(gate);
            Ok(PreparedSession { stream, processor })
        };

        let worker = Worker {
            status: Arc::clone(&self.status),
            stop: Arc::clone(&self.stop),
            underrun_threshold: self.config.underrun_threshold,
        };

        let timeout = Duration::from_millis(self.config.device_timeout_ms);
        match spawn_stream_worker("live-engine", timeout, open, move |session| worker.run(session)) {
            Ok((handle, sample_rate)) => {
                *lock(&self.worker) = Some(handle);
                let mut status = lock(&self.status);
                if status.state == LiveState::Starting {
                    status.state = LiveState::Running;
                }
                status.sample_rate = Some(sample_rate);
                status.started_at = Some(Utc::now());
                info!(sample_rate, "live session running");
                Ok(status.clone())
            }
            Err(e) => {
                error!(error = %e, "live session failed to start");
                let mut status = lock(&self.status);
                *status = LiveStatus {
                    last_error: Some(e.to_string()),
                    ..LiveStatus::default()
                };
                Err(e)
            }
        }
    }

    /// Stop the session and return to `Idle`
    ///
    /// Returns `false` when there was nothing to stop.
    pub fn stop(&self) -> Result<bool> {
        let _transition = lock(&self.transition);

        let previous = {
            let mut status = lock(&self.status);
            let previous = status.state;
            if previous == LiveState::Running || previous == LiveState::Starting {
                status.state = LiveState::Stopping;
            }
            previous
        };

        let has_worker = lock(&self.worker).is_some();
        if previous == LiveState::Idle && !has_worker {
            debug!("live stop requested while idle");
            return Ok(false);
        }

        self.stop.store(true, Ordering::Release);
        let joined = self.join_worker();

        let mut status = lock(&self.status);
        let last_error = status.last_error.take();
        *status = LiveStatus {
            last_error,
            ..LiveStatus::default()
        };
        info!(from = %previous, "live session stopped");

        if joined {
            Ok(true)
        } else {
            Err(EngineError::internal("live worker panicked"))
        }
    }

    /// Tear down any session and forget its last error
    pub fn reset(&self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "live teardown during reset");
        }
        *lock(&self.status) = LiveStatus::default();
    }

    /// Join a finished or stopping worker; `false` if it panicked
    fn join_worker(&self) -> bool {
        match lock(&self.worker).take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }
}

impl Drop for LiveEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.join_worker();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn design_processor(
    ir: &ImpulseResponse,
    sample_rate: u32,
    min_design_len: usize,
    frame_size: usize,
    volume: f32,
) -> Result<LiveProcessor> {
    let filter = if ir.sample_rate() == sample_rate {
        ir.inverse_filter()?
    } else {
        debug!(from = ir.sample_rate(), to = sample_rate, "resampling IR for device rate");
        ir.resampled(sample_rate, min_design_len)?.inverse_filter()?
    };
    Ok(LiveProcessor::new(&filter, frame_size, volume))
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    status: Arc<Mutex<LiveStatus>>,
    stop: Arc<AtomicBool>,
    underrun_threshold: u32,
}

impl Worker {
    fn run(self, session: PreparedSession) {
        let PreparedSession {
            stream,
            mut processor,
        } = session;
        let DuplexStream {
            mut input,
            mut output,
            sample_rate,
            health,
            guard,
        } = stream;

        let block = processor.block_size();
        let period = Duration::from_secs_f64(block as f64 / sample_rate as f64);
        let underrun_after = period * 2;
        let idle_wait = (period / 8).max(Duration::from_micros(500));

        let mut in_block = vec![0.0_f32; block];
        let mut out_block = vec![0.0_f32; block];
        let mut filled = 0usize;
        let mut waiting_since = Instant::now();
        let mut consecutive = 0u32;
        let mut seen_faults = health.faults();

        // One block of silence so the output starts with a cushion
        for _ in 0..block {
            if output.push(0.0).is_err() {
                break;
            }
        }

        while !self.stop.load(Ordering::Acquire) {
            while filled < block {
                match input.pop() {
                    Ok(sample) => {
                        in_block[filled] = sample;
                        filled += 1;
                    }
                    Err(_) => break,
                }
            }

            let faults = health.faults();
            let faulted = faults != seen_faults;
            seen_faults = faults;

            let underrun = filled < block && waiting_since.elapsed() >= underrun_after;
            if filled < block && !underrun && !faulted {
                thread::sleep(idle_wait);
                continue;
            }

            if underrun || faulted {
                let missing = pad_block(&mut in_block, filled);
                consecutive += 1;
                if consecutive == 1 {
                    warn!(underrun, faulted, missing, "live input interrupted, substituting silence");
                }
                if consecutive > self.underrun_threshold {
                    let reason = format!(
                        "{} consecutive buffers without input",
                        consecutive
                    );
                    error!(%reason, "live session failed");
                    let mut status = lock(&self.status);
                    status.state = LiveState::Failed;
                    status.underruns += 1;
                    status.last_error = Some(reason);
                    break;
                }
            } else {
                if consecutive > 0 {
                    debug!(consecutive, "live input recovered");
                }
                consecutive = 0;
            }

            processor.process(&in_block, &mut out_block);
            filled = 0;
            waiting_since = Instant::now();

            let mut dropped = 0u64;
            for &sample in out_block.iter() {
                if output.push(sample).is_err() {
                    dropped += 1;
                }
            }

            let mut status = lock(&self.status);
            status.blocks_processed += 1;
            status.overruns += dropped;
            if underrun || faulted {
                status.underruns += 1;
            }
        }

        drop(guard);
        debug!("live worker exited");
    }
}

/// Silence the part of `block` past `filled`; returns how many samples that was
fn pad_block(block: &mut [f32], filled: usize) -> usize {
    let filled = filled.min(block.len());
    block[filled..].fill(0.0);
    block.len() - filled
}
