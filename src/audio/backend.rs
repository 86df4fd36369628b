//! Audio backend abstraction
//!
//! Device callbacks never touch engine state directly: they move mono `f32`
//! samples through lock-free SPSC ring buffers. The engine side of those
//! rings is handed out as a [`DuplexStream`] or [`CaptureStream`], whose
//! guard keeps the underlying device streams alive until dropped.
//!
//! Some hosts' stream handles cannot cross threads, so streams are opened
//! and dropped on the worker that consumes them. [`spawn_stream_worker`]
//! does that and bounds how long the caller waits for the open.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rtrb::{Consumer, Producer};
use tracing::warn;

use crate::audio::device::DeviceDescriptor;
use crate::error::{EngineError, Result};

/// What to open
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    /// Preferred sample rate; the backend may negotiate another
    pub sample_rate: u32,
    pub frame_size: usize,
    /// Capacity of each ring buffer, in samples
    pub ring_capacity: usize,
}

/// Counters shared between device callbacks and the worker
#[derive(Debug, Default)]
pub struct StreamHealth {
    faults: AtomicU64,
    input_overflows: AtomicU64,
    output_underflows: AtomicU64,
    last_fault: Mutex<Option<String>>,
}

impl StreamHealth {
    /// Record a stream-level error reported by the host
    pub fn record_fault(&self, reason: String) {
        warn!(%reason, "audio stream fault");
        self.faults.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut last) = self.last_fault.lock() {
            *last = Some(reason);
        }
    }

    pub fn record_input_overflow(&self) {
        self.input_overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_output_underflow(&self) {
        self.output_underflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn input_overflows(&self) -> u64 {
        self.input_overflows.load(Ordering::Relaxed)
    }

    pub fn output_underflows(&self) -> u64 {
        self.output_underflows.load(Ordering::Relaxed)
    }

    pub fn last_fault(&self) -> Option<String> {
        self.last_fault.lock().ok().and_then(|last| last.clone())
    }
}

/// Keeps backend stream handles alive; dropping it stops the devices
pub struct StreamGuard {
    _inner: Box<dyn Any>,
}

impl StreamGuard {
    pub fn new<T: 'static>(inner: T) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

/// Engine-side ends of a simultaneous capture + playback pair
pub struct DuplexStream {
    /// Mono samples captured from the input device
    pub input: Consumer<f32>,
    /// Mono samples to render on every output channel
    pub output: Producer<f32>,
    pub sample_rate: u32,
    pub health: Arc<StreamHealth>,
    pub guard: StreamGuard,
}

/// Engine-side end of a capture-only stream
pub struct CaptureStream {
    pub input: Consumer<f32>,
    pub sample_rate: u32,
    pub health: Arc<StreamHealth>,
    pub guard: StreamGuard,
}

/// Streams that report their negotiated sample rate
pub trait OpenedStream {
    fn sample_rate(&self) -> u32;
}

impl OpenedStream for DuplexStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl OpenedStream for CaptureStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Host audio access
pub trait AudioBackend: Send + Sync {
    /// Short backend name for logs and status
    fn name(&self) -> &'static str;

    /// Enumerate devices, queried fresh on every call
    ///
    /// # Errors
    /// `AudioUnavailable` if the host audio subsystem cannot be used
    fn list_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Open input and output together at one sample rate
    fn open_duplex(&self, request: &StreamRequest) -> Result<DuplexStream>;

    /// Open an input device only
    fn open_capture(&self, request: &StreamRequest) -> Result<CaptureStream>;
}

/// Run `body` on a new thread with a stream opened by `open` on that thread
///
/// Returns once the stream is open (with its sample rate), or with the open
/// error, or with `DeviceTimeout` after `timeout`. A worker whose open
/// completes after the caller gave up drops the stream without running
/// `body`, so its handle yields `None`.
pub fn spawn_stream_worker<S, O, B, T>(
    thread_name: &str,
    timeout: Duration,
    open: O,
    body: B,
) -> Result<(JoinHandle<Option<T>>, u32)>
where
    S: OpenedStream,
    O: FnOnce() -> Result<S> + Send + 'static,
    B: FnOnce(S) -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<Result<u32>>(1);

    let handle = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || match open() {
            Ok(stream) => {
                if tx.send(Ok(stream.sample_rate())).is_err() {
                    return None;
                }
                Some(body(stream))
            }
            Err(e) => {
                let _ = tx.send(Err(e));
                None
            }
        })
        .map_err(|e| EngineError::internal(format!("failed to spawn {}: {}", thread_name, e)))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(sample_rate)) => Ok((handle, sample_rate)),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(mpsc::RecvTimeoutError::Timeout) => Err(EngineError::DeviceTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            let _ = handle.join();
            Err(EngineError::internal(format!("{} exited while opening devices", thread_name)))
        }
    }
}
