//! Recording Subsystem
//!
//! Captures raw input to a WAV file between explicit start and stop calls.
//! A worker thread owns the capture stream and the file writer; the caller
//! only sees [`RecordingStatus`] snapshots until `stop` joins the worker and
//! the file is finalized.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rtrb::Consumer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::backend::{spawn_stream_worker, AudioBackend, CaptureStream, OpenedStream, StreamRequest};
use crate::audio::device::validate_selection;
use crate::config::{LiveConfig, RecordingConfig};
use crate::engine::io::{ExportFormat, WavSink};
use crate::error::{EngineError, Result};

/// Samples pulled from the ring per write
const WRITE_CHUNK: usize = 4096;

/// Snapshot of the recording session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub running: bool,
    pub file: Option<PathBuf>,
    pub input_device: Option<usize>,
    pub sample_rate: Option<u32>,
    pub samples_written: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Set once `max_secs` is reached; later input is discarded
    pub limit_reached: bool,
    /// Why the last recording ended on its own, if it did
    pub last_error: Option<String>,
}

/// A finished recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub file: PathBuf,
    pub samples: u64,
    pub sample_rate: u32,
    pub duration_secs: f64,
}

/// Outcome of a start request
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(RecordingStatus),
    /// A recording was already running; nothing changed
    AlreadyRecording(RecordingStatus),
}

struct OpenRecording {
    stream: CaptureStream,
    sink: WavSink,
}

impl OpenedStream for OpenRecording {
    fn sample_rate(&self) -> u32 {
        self.stream.sample_rate
    }
}

/// Owner of the process-wide recording session
pub struct Recorder {
    backend: Arc<dyn AudioBackend>,
    config: RecordingConfig,
    stream: LiveConfig,
    engine_rate: u32,
    format: ExportFormat,
    status: Arc<Mutex<RecordingStatus>>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<Option<Result<u64>>>>>,
    transition: Mutex<()>,
}

impl Recorder {
    /// # Arguments
    /// * `stream` - frame size, ring size and open timeout for the capture stream
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        config: RecordingConfig,
        stream: LiveConfig,
        engine_rate: u32,
        format: ExportFormat,
    ) -> Self {
        Self {
            backend,
            config,
            stream,
            engine_rate,
            format,
            status: Arc::new(Mutex::new(RecordingStatus::default())),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            transition: Mutex::new(()),
        }
    }

    pub fn status(&self) -> RecordingStatus {
        lock(&self.status).clone()
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.status).running
    }

    /// Start capturing `input_device` into `path`
    ///
    /// # Errors
    /// * `DeviceNotFound` / `DeviceCapability` - bad input index
    /// * `DeviceOpen` / `DeviceTimeout` - the stream could not be opened
    /// * `Io` / `InvalidInput` - the output file could not be created
    pub fn start(&self, path: &Path, input_device: Option<usize>) -> Result<StartOutcome> {
        let _transition = lock(&self.transition);

        let current = self.status();
        if current.running {
            warn!(file = ?current.file, "recording already running");
            return Ok(StartOutcome::AlreadyRecording(current));
        }

        let devices = self.backend.list_devices()?;
        validate_selection(&devices, input_device, None)?;

        let request = StreamRequest {
            input_device,
            output_device: None,
            sample_rate: self.engine_rate,
            frame_size: self.stream.frame_size,
            ring_capacity: self.stream.frame_size * self.stream.ring_blocks,
        };

        let backend = Arc::clone(&self.backend);
        let file = path.to_path_buf();
        let format = self.format;
        let open = move || -> Result<OpenRecording> {
            let stream = backend.open_capture(&request)?;
            let sink = WavSink::create(&file, 1, stream.sample_rate, format)?;
            Ok(OpenRecording { stream, sink })
        };

        // A worker that ended on its own is still parked here
        if let Some(finished) = lock(&self.worker).take() {
            let _ = finished.join();
        }

        self.stop.store(false, Ordering::Release);
        *lock(&self.status) = RecordingStatus {
            running: true,
            file: Some(path.to_path_buf()),
            input_device,
            started_at: Some(Utc::now()),
            ..RecordingStatus::default()
        };

        let worker = RecordWorker {
            status: Arc::clone(&self.status),
            stop: Arc::clone(&self.stop),
            max_secs: self.config.max_secs,
        };

        let timeout = Duration::from_millis(self.stream.device_timeout_ms);
        let (handle, sample_rate) =
            match spawn_stream_worker("recorder", timeout, open, move |session| worker.run(session)) {
                Ok(spawned) => spawned,
                Err(e) => {
                    *lock(&self.status) = RecordingStatus {
                        last_error: Some(e.to_string()),
                        ..RecordingStatus::default()
                    };
                    return Err(e);
                }
            };
        *lock(&self.worker) = Some(handle);

        let mut status = lock(&self.status);
        status.sample_rate = Some(sample_rate);
        info!(file = %path.display(), sample_rate, "recording started");
        Ok(StartOutcome::Started(status.clone()))
    }

    /// Stop capturing and finalize the file
    ///
    /// # Errors
    /// * `StateConflict` - nothing is recording
    /// * `InvalidInput` - fewer than `min_samples` samples were captured
    pub fn stop(&self) -> Result<RecordingSummary> {
        let _transition = lock(&self.transition);

        let current = self.status();
        let (Some(file), true) = (current.file.clone(), current.running) else {
            return Err(match current.last_error {
                Some(reason) => EngineError::state_conflict(format!("recording already ended: {}", reason)),
                None => EngineError::state_conflict("not recording"),
            });
        };

        self.stop.store(true, Ordering::Release);
        let outcome = lock(&self.worker).take().map(|handle| handle.join());
        lock(&self.status).running = false;

        let samples = match outcome {
            Some(Ok(Some(result))) => result?,
            Some(Ok(None)) | None => {
                return Err(EngineError::internal("recording worker exited without a result"))
            }
            Some(Err(_)) => return Err(EngineError::internal("recording worker panicked")),
        };

        let sample_rate = current.sample_rate.unwrap_or(self.engine_rate);
        info!(file = %file.display(), samples, "recording stopped");

        if samples < self.config.min_samples as u64 {
            warn!(samples, min = self.config.min_samples, "recording too short");
            return Err(EngineError::invalid_input(format!(
                "recording too short: {} samples",
                samples
            )));
        }

        Ok(RecordingSummary {
            file,
            samples,
            sample_rate,
            duration_secs: samples as f64 / sample_rate.max(1) as f64,
        })
    }

    /// Stop any recording and forget it
    pub fn reset(&self) {
        if self.is_recording() {
            if let Err(e) = self.stop() {
                debug!(error = %e, "recording discarded during reset");
            }
        }
        *lock(&self.status) = RecordingStatus::default();
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RecordWorker {
    status: Arc<Mutex<RecordingStatus>>,
    stop: Arc<AtomicBool>,
    max_secs: f32,
}

impl RecordWorker {
    /// Capture until stopped; a failure ends the recording in the status too
    fn run(self, session: OpenRecording) -> Result<u64> {
        let result = self.capture(session);
        if let Err(e) = &result {
            warn!(error = %e, "recording ended with an error");
            let mut status = lock(&self.status);
            status.running = false;
            status.last_error = Some(e.to_string());
        }
        result
    }

    fn capture(&self, session: OpenRecording) -> Result<u64> {
        let OpenRecording {
            stream:
                CaptureStream {
                    mut input,
                    sample_rate,
                    guard,
                    ..
                },
            mut sink,
        } = session;

        let limit = (self.max_secs.max(0.0) as f64 * sample_rate as f64).round() as u64;
        let idle_wait = Duration::from_millis(5);
        let mut chunk = vec![0.0_f32; WRITE_CHUNK];
        let mut written = 0u64;

        while !self.stop.load(Ordering::Acquire) {
            let count = pop_into(&mut input, &mut chunk);
            if count == 0 {
                thread::sleep(idle_wait);
                continue;
            }
            written = self.write(&mut sink, &chunk[..count], written, limit)?;
        }

        // Input queued before the stop request still belongs to the take
        let mut pending = input.slots();
        while pending > 0 {
            let count = pop_into(&mut input, &mut chunk[..pending.min(WRITE_CHUNK)]);
            if count == 0 {
                break;
            }
            pending -= count;
            written = self.write(&mut sink, &chunk[..count], written, limit)?;
        }

        drop(guard);
        sink.finalize()
    }

    /// Append what fits under `limit`; returns the new total
    fn write(&self, sink: &mut WavSink, chunk: &[f32], written: u64, limit: u64) -> Result<u64> {
        let room = limit.saturating_sub(written) as usize;
        let take = chunk.len().min(room);
        if take > 0 {
            sink.write_interleaved(&chunk[..take])?;
        }
        let written = written + take as u64;

        let mut status = lock(&self.status);
        status.samples_written = written;
        if take < chunk.len() && !status.limit_reached {
            status.limit_reached = true;
            warn!(max_secs = self.max_secs, "recording limit reached");
        }
        Ok(written)
    }
}

fn pop_into(input: &mut Consumer<f32>, chunk: &mut [f32]) -> usize {
    let mut count = 0;
    while count < chunk.len() {
        match input.pop() {
            Ok(sample) => {
                chunk[count] = sample;
                count += 1;
            }
            Err(_) => break,
        }
    }
    count
}
