//! Session/Status Controller
//!
//! The one object every control-plane request goes through. Requests are
//! stateless; the controller holds what persists between them: the working
//! IR, the last offline job, the last recording, and the live and recording
//! sessions running in the background.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audio::backend::{AudioBackend, StreamRequest};
use crate::audio::device::{validate_selection, DeviceDescriptor};
use crate::config::EngineConfig;
use crate::dsp::sweep::log_sweep;
use crate::engine::artifacts::ArtifactStore;
use crate::engine::io::{export_audio, import_audio, resample, ExportFormat};
use crate::error::{EngineError, Result};
use crate::ir::{
    capture_offline, extract_ir, prepare_buffer, prepare_ir, record_live, CaptureSettings,
    CapturedIr, ImpulseResponse, IrSummary, PrepareOptions,
};
use crate::live::{LiveEngine, LiveRequest, LiveStatus};
use crate::offline::{run_job, DeconvolutionJob, PlotArtifacts};
use crate::recording::{Recorder, RecordingStatus, RecordingSummary, StartOutcome};

/// Result of an IR capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub ir_file: PathBuf,
    pub lag_samples: usize,
    pub confidence: f32,
    pub ir: IrSummary,
    /// Live session started with the captured IR, if requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStatus>,
}

/// Everything a client can poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub live: LiveStatus,
    pub recording: RecordingStatus,
    pub ir: Option<IrSummary>,
    pub job: Option<DeconvolutionJob>,
    pub last_recording: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub version: String,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Owner of all engine state
pub struct SessionController {
    config: EngineConfig,
    store: ArtifactStore,
    backend: Arc<dyn AudioBackend>,
    working_ir: RwLock<Option<Arc<ImpulseResponse>>>,
    last_job: Mutex<Option<DeconvolutionJob>>,
    last_recording: Mutex<Option<PathBuf>>,
    offline: Mutex<()>,
    live: LiveEngine,
    recorder: Recorder,
    started_at: DateTime<Utc>,
}

impl SessionController {
    /// Create the controller and its working directories
    pub fn new(config: EngineConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;
        let store = ArtifactStore::open(config.paths.clone())?;

        let live = LiveEngine::new(
            Arc::clone(&backend),
            config.live.clone(),
            config.audio.sample_rate,
            config.deconvolution.min_design_len,
        );
        let recorder = Recorder::new(
            Arc::clone(&backend),
            config.recording.clone(),
            config.live.clone(),
            config.audio.sample_rate,
            ExportFormat::new(config.audio.bit_depth),
        );

        info!(backend = backend.name(), sample_rate = config.audio.sample_rate, "session ready");

        Ok(Self {
            config,
            store,
            backend,
            working_ir: RwLock::new(None),
            last_job: Mutex::new(None),
            last_recording: Mutex::new(None),
            offline: Mutex::new(()),
            live,
            recorder,
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn format(&self) -> ExportFormat {
        ExportFormat::new(self.config.audio.bit_depth)
    }

    fn prepare_options(&self) -> PrepareOptions {
        PrepareOptions::from_config(&self.config.ir, &self.config.deconvolution)
    }

    // ========================================================================
    // Devices and IRs
    // ========================================================================

    pub fn list_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.backend.list_devices()
    }

    /// Currently prepared IR, if any
    pub fn working_ir(&self) -> Option<Arc<ImpulseResponse>> {
        self.working_ir
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_working_ir(&self, ir: ImpulseResponse) -> Arc<ImpulseResponse> {
        let ir = Arc::new(ir);
        self.install_ir(&ir);
        ir
    }

    /// Stage, prepare and install an uploaded IR
    pub fn prepare_ir(&self, path: &Path) -> Result<IrSummary> {
        let ir = self.load_ir(path)?;
        Ok(self.set_working_ir(ir).summary())
    }

    fn load_ir(&self, path: &Path) -> Result<ImpulseResponse> {
        let staged = self.store.stage_upload(path)?;
        Ok(prepare_ir(&staged, self.config.audio.sample_rate, &self.prepare_options())?
            .with_source(path.to_path_buf()))
    }

    /// The IR at `path`, prepared but not installed, or the working IR
    ///
    /// The flag is `true` for a freshly prepared IR, which the caller
    /// installs once its request succeeds.
    fn ir_or_working(&self, path: Option<&Path>) -> Result<(Arc<ImpulseResponse>, bool)> {
        match path {
            Some(path) => Ok((Arc::new(self.load_ir(path)?), true)),
            None => self
                .working_ir()
                .map(|ir| (ir, false))
                .ok_or_else(|| EngineError::invalid_input("no impulse response prepared")),
        }
    }

    fn install_ir(&self, ir: &Arc<ImpulseResponse>) {
        *self
            .working_ir
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(ir));
    }

    /// Measure the IR from a probe file and its recorded response
    ///
    /// Without a probe, `sine_sweep.wav` is used (generated if missing);
    /// without a response, `room_recorded.wav` must exist.
    pub fn capture_ir_offline(&self, probe: Option<&Path>, response: Option<&Path>) -> Result<CaptureReport> {
        let rate = self.config.audio.sample_rate;

        let probe = match probe {
            Some(path) => import_audio(&self.store.stage_upload(path)?, rate)?,
            None => {
                let sweep_path = self.store.sweep();
                if sweep_path.is_file() {
                    import_audio(&sweep_path, rate)?
                } else {
                    let sweep = log_sweep(&self.config.sweep, rate);
                    export_audio(&sweep, &sweep_path, self.format())?;
                    info!(path = %sweep_path.display(), "generated probe sweep");
                    sweep
                }
            }
        };

        let response_path = match response {
            Some(path) => self.store.stage_upload(path)?,
            None => self.store.room_response(),
        };
        let response = import_audio(&response_path, rate)?;

        let captured = capture_offline(&probe, &response, &CaptureSettings::from_config(&self.config))?;
        self.install_capture(captured, None)
    }

    /// Play the sweep through the devices, extract the IR and optionally go live
    ///
    /// # Errors
    /// `StateConflict` if a live session holds the devices
    pub fn capture_ir_live(
        &self,
        input_device: Option<usize>,
        output_device: Option<usize>,
        start_live: bool,
        volume: Option<f32>,
    ) -> Result<CaptureReport> {
        if self.live.status().is_active() {
            return Err(EngineError::state_conflict(
                "stop the live session before capturing an IR",
            ));
        }
        validate_selection(&self.backend.list_devices()?, input_device, output_device)?;

        let request = StreamRequest {
            input_device,
            output_device,
            sample_rate: self.config.audio.sample_rate,
            frame_size: self.config.live.frame_size,
            ring_capacity: self.config.live.frame_size * self.config.live.ring_blocks,
        };
        let recording = record_live(
            Arc::clone(&self.backend),
            request,
            self.config.sweep.clone(),
            Duration::from_millis(self.config.live.device_timeout_ms),
        )?;

        export_audio(&recording.probe, &self.store.sweep(), self.format())?;
        export_audio(&recording.recorded, &self.store.room_response(), self.format())?;

        let settings = CaptureSettings::from_config(&self.config);
        let mut captured = extract_ir(
            recording.probe.channel(0),
            recording.recorded.channel(0),
            recording.probe.sample_rate,
            &settings,
        )?;
        captured.buffer = resample(&captured.buffer, self.config.audio.sample_rate);

        let live = if start_live {
            Some((input_device, output_device, volume))
        } else {
            None
        };
        self.install_capture(captured, live)
    }

    fn install_capture(
        &self,
        captured: CapturedIr,
        start_live: Option<(Option<usize>, Option<usize>, Option<f32>)>,
    ) -> Result<CaptureReport> {
        let ir_file = self.store.impulse_response();
        export_audio(&captured.buffer, &ir_file, self.format())?;

        let ir = prepare_buffer(&captured.buffer, &self.prepare_options())?.with_source(ir_file.clone());
        let summary = self.set_working_ir(ir).summary();
        info!(
            lag = captured.alignment.lag,
            confidence = captured.alignment.confidence,
            fingerprint = %summary.fingerprint,
            "impulse response captured"
        );

        let live = match start_live {
            Some((input, output, volume)) => Some(self.start_live(None, input, output, volume)?),
            None => None,
        };

        Ok(CaptureReport {
            ir_file,
            lag_samples: captured.alignment.lag,
            confidence: captured.alignment.confidence,
            ir: summary,
            live,
        })
    }

    // ========================================================================
    // Offline
    // ========================================================================

    /// Recover `signal` (or the last recording) through `ir` (or the working IR)
    ///
    /// # Errors
    /// * `StateConflict` - another offline job is running
    /// * `InvalidInput` - no signal or no IR available
    /// * anything from decoding, preparation or [`run_job`]
    pub fn deconvolve(
        &self,
        signal: Option<&Path>,
        ir: Option<&Path>,
        gain: Option<f32>,
    ) -> Result<DeconvolutionJob> {
        let _running = match self.offline.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(EngineError::state_conflict("an offline deconvolution is already running"))
            }
        };

        // A new request replaces the previous result even if it fails
        *lock(&self.last_job) = None;

        let signal_path = match signal {
            Some(path) => self.store.stage_upload(path)?,
            None => lock(&self.last_recording).clone().ok_or_else(|| {
                EngineError::invalid_input("no signal given and nothing has been recorded")
            })?,
        };
        let (ir, fresh) = self.ir_or_working(ir)?;
        let audio = import_audio(&signal_path, self.config.audio.sample_rate)?;

        let mut job = DeconvolutionJob::new(
            signal_path,
            ir.fingerprint().to_string(),
            self.store.recovered(),
            gain.unwrap_or(self.config.deconvolution.default_gain),
        );
        let result = run_job(
            &mut job,
            &audio,
            &ir,
            &self.store,
            self.format(),
            &self.config.deconvolution,
        );
        *lock(&self.last_job) = Some(job.clone());
        result?;

        if fresh {
            self.install_ir(&ir);
        }
        Ok(job)
    }

    /// Plot files of the last completed job
    pub fn fetch_plots(&self) -> Result<PlotArtifacts> {
        lock(&self.last_job)
            .as_ref()
            .filter(|job| job.is_completed())
            .and_then(|job| job.plots.clone())
            .ok_or_else(|| EngineError::invalid_input("no completed deconvolution to plot"))
    }

    pub fn last_job(&self) -> Option<DeconvolutionJob> {
        lock(&self.last_job).clone()
    }

    // ========================================================================
    // Live and recording
    // ========================================================================

    pub fn start_live(
        &self,
        ir: Option<&Path>,
        input_device: Option<usize>,
        output_device: Option<usize>,
        volume: Option<f32>,
    ) -> Result<LiveStatus> {
        if self.live.status().is_active() {
            return Err(EngineError::state_conflict("live session already running"));
        }
        let (ir, fresh) = self.ir_or_working(ir)?;
        let status = self.live.start(LiveRequest {
            ir: Arc::clone(&ir),
            input_device,
            output_device,
            volume: volume.unwrap_or(1.0),
        })?;

        if fresh {
            self.install_ir(&ir);
        }
        Ok(status)
    }

    /// `true` if a session was torn down
    pub fn stop_live(&self) -> Result<bool> {
        self.live.stop()
    }

    pub fn live_status(&self) -> LiveStatus {
        self.live.status()
    }

    pub fn start_recording(&self, input_device: Option<usize>) -> Result<StartOutcome> {
        self.recorder.start(&self.store.recording(), input_device)
    }

    /// Stop recording; the file becomes the default deconvolution signal
    pub fn stop_recording(&self) -> Result<RecordingSummary> {
        let summary = self.recorder.stop()?;
        *lock(&self.last_recording) = Some(summary.file.clone());
        Ok(summary)
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            live: self.live.status(),
            recording: self.recorder.status(),
            ir: self.working_ir().map(|ir| ir.summary()),
            job: self.last_job(),
            last_recording: lock(&self.last_recording).clone(),
        }
    }

    /// Stop everything and forget all session state
    pub fn reset(&self) {
        self.live.reset();
        self.recorder.reset();
        *self
            .working_ir
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        *lock(&self.last_job) = None;
        *lock(&self.last_recording) = None;
        info!("session reset");
    }

    pub fn health(&self) -> HealthReport {
        let now = Utc::now();
        HealthReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            backend: self.backend.name().to_string(),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
        }
    }

    /// Remove staged uploads
    pub fn clear_temp(&self) -> Result<usize> {
        let in_use = self.recorder.is_recording() || self.offline.try_lock().is_err();
        if in_use {
            warn!("clearing uploads while work is in progress");
        }
        self.store.clear_uploads()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::LoopbackBackend;
    use crate::config::PathsConfig;
    use crate::engine::buffer::AudioBuffer;
    use crate::error::ErrorKind;
    use crate::live::LiveState;
    use tempfile::{tempdir, TempDir};

    fn controller() -> (SessionController, TempDir) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.paths = PathsConfig::rooted_at(dir.path());
        config.audio.sample_rate = 8000;
        config.live.frame_size = 128;
        let session = SessionController::new(config, Arc::new(LoopbackBackend::new())).unwrap();
        (session, dir)
    }

    fn write_ir(dir: &Path) -> PathBuf {
        let path = dir.join("ir.wav");
        let mut samples = vec![0.0_f32; 200];
        samples[0] = 1.0;
        samples[5] = 0.3;
        export_audio(&AudioBuffer::from_mono(samples, 8000), &path, ExportFormat::float()).unwrap();
        path
    }

    #[test]
    fn test_deconvolve_without_inputs() {
        let (session, _dir) = controller();
        let err = session.deconvolve(None, None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_fetch_plots_before_job() {
        let (session, _dir) = controller();
        assert!(session.fetch_plots().is_err());
    }

    #[test]
    fn test_prepare_then_deconvolve() {
        let (session, dir) = controller();
        let ir_path = write_ir(dir.path());
        let signal_path = dir.path().join("signal.wav");
        let tone: Vec<f32> = (0..4000).map(|n| 0.3 * (n as f32 * 0.05).sin()).collect();
        export_audio(&AudioBuffer::from_mono(tone, 8000), &signal_path, ExportFormat::float()).unwrap();

        let summary = session.prepare_ir(&ir_path).unwrap();
        assert_eq!(summary.length, 256);

        let job = session.deconvolve(Some(&signal_path), None, None).unwrap();
        assert!(job.is_completed());
        assert_eq!(job.ir_fingerprint, summary.fingerprint);
        assert!(session.fetch_plots().is_ok());
    }

    #[test]
    fn test_failed_deconvolve_discards_previous_job() {
        let (session, dir) = controller();
        let signal_path = dir.path().join("signal.wav");
        let tone: Vec<f32> = (0..4000).map(|n| 0.3 * (n as f32 * 0.05).sin()).collect();
        export_audio(&AudioBuffer::from_mono(tone, 8000), &signal_path, ExportFormat::float()).unwrap();
        session.prepare_ir(&write_ir(dir.path())).unwrap();
        session.deconvolve(Some(&signal_path), None, None).unwrap();
        assert!(session.fetch_plots().is_ok());

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, b"definitely not audio").unwrap();
        assert!(session.deconvolve(Some(&garbage), None, None).is_err());

        assert!(session.last_job().is_none());
        assert!(session.fetch_plots().is_err());
    }

    #[test]
    fn test_start_live_with_bad_device_keeps_working_ir() {
        let (session, dir) = controller();
        let installed = session.prepare_ir(&write_ir(dir.path())).unwrap();

        let other_path = dir.path().join("other_ir.wav");
        let mut other = vec![0.0_f32; 100];
        other[0] = 1.0;
        other[40] = -0.5;
        export_audio(&AudioBuffer::from_mono(other, 8000), &other_path, ExportFormat::float()).unwrap();

        let err = session
            .start_live(Some(&other_path), Some(9), Some(1), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceError);
        assert_eq!(session.working_ir().unwrap().fingerprint(), installed.fingerprint);

        let status = session.start_live(Some(&other_path), Some(0), Some(1), None).unwrap();
        assert_eq!(session.working_ir().unwrap().fingerprint(), status.ir_fingerprint.unwrap());
        session.stop_live().unwrap();
    }

    #[test]
    fn test_start_live_needs_ir() {
        let (session, _dir) = controller();
        let err = session.start_live(None, Some(0), Some(1), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_reset_clears_everything() {
        let (session, dir) = controller();
        session.prepare_ir(&write_ir(dir.path())).unwrap();
        session.start_live(None, Some(0), Some(1), Some(1.0)).unwrap();
        session.start_recording(Some(0)).unwrap();

        session.reset();

        let status = session.status();
        assert_eq!(status.live.state, LiveState::Idle);
        assert!(!status.recording.running);
        assert!(status.ir.is_none());
        assert!(status.job.is_none());
        assert!(status.last_recording.is_none());
    }
}
