//! IR Capture Tests
//!
//! Sweep measurement through the session controller, from files on disk and
//! through the loopback devices with a simulated room.

use std::path::Path;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use tempfile::{tempdir, TempDir};

use noisecleanse::audio::LoopbackBackend;
use noisecleanse::config::{EngineConfig, PathsConfig, SweepConfig};
use noisecleanse::dsp::{fft_convolve, log_sweep};
use noisecleanse::engine::{export_audio, import_audio, AudioBuffer, ExportFormat};
use noisecleanse::error::ErrorKind;
use noisecleanse::live::LiveState;
use noisecleanse::SessionController;

const RATE: u32 = 44100;

fn config(root: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.paths = PathsConfig::rooted_at(root);
    config.audio.sample_rate = RATE;
    config.sweep = SweepConfig {
        duration_secs: 0.5,
        tail_secs: 0.3,
        ..SweepConfig::default()
    };
    config.live.frame_size = 1024;
    config
}

fn session(backend: LoopbackBackend) -> (SessionController, TempDir) {
    let dir = tempdir().unwrap();
    let session = SessionController::new(config(dir.path()), Arc::new(backend)).unwrap();
    (session, dir)
}

fn room() -> Vec<f32> {
    let mut ir = vec![0.0_f32; 200];
    ir[0] = 0.8;
    ir[120] = 0.4;
    ir
}

/// Index and magnitude of the largest sample in `range`
fn argmax_in(samples: &[f32], range: std::ops::Range<usize>) -> (usize, f32) {
    let start = range.start;
    let (i, level) = samples[range]
        .iter()
        .enumerate()
        .fold((0, 0.0_f32), |best, (i, &s)| if s.abs() > best.1 { (i, s.abs()) } else { best });
    (start + i, level)
}

fn check_room_shape(ir: &[f32]) {
    let (direct, direct_level) = argmax_in(ir, 0..60);
    let (reflection, reflection_level) = argmax_in(ir, 60..200);

    assert_eq!(direct, 0);
    assert_abs_diff_eq!(direct_level, 1.0, epsilon = 1e-6);
    assert_eq!(reflection, 120);
    assert!((reflection_level - 0.5).abs() < 0.1, "reflection {}", reflection_level);
}

#[test]
fn test_offline_capture_from_files() {
    let (session, dir) = session(LoopbackBackend::new());
    let sweep = log_sweep(&session.config().sweep, RATE);

    let mut response = vec![0.0_f32; 700];
    response.extend(fft_convolve(sweep.channel(0), &room()));
    let probe_path = dir.path().join("probe.wav");
    let response_path = dir.path().join("response.wav");
    export_audio(&sweep, &probe_path, ExportFormat::float()).unwrap();
    export_audio(&AudioBuffer::from_mono(response, RATE), &response_path, ExportFormat::float()).unwrap();

    let report = session
        .capture_ir_offline(Some(&probe_path), Some(&response_path))
        .unwrap();

    assert_eq!(report.lag_samples, 700);
    assert!(report.confidence >= session.config().alignment.min_confidence);
    assert!(report.live.is_none());

    let ir = import_audio(&report.ir_file, RATE).unwrap();
    check_room_shape(ir.channel(0));

    let working = session.working_ir().unwrap();
    assert_eq!(working.fingerprint(), report.ir.fingerprint);
}

#[test]
fn test_offline_capture_generates_default_probe() {
    let (session, _dir) = session(LoopbackBackend::new());
    let sweep = log_sweep(&session.config().sweep, RATE);
    let response = fft_convolve(sweep.channel(0), &room());
    export_audio(
        &AudioBuffer::from_mono(response, RATE),
        &session.store().room_response(),
        ExportFormat::float(),
    )
    .unwrap();

    let report = session.capture_ir_offline(None, None).unwrap();

    assert!(session.store().sweep().is_file());
    assert_eq!(report.lag_samples, 0);
}

#[test]
fn test_offline_capture_without_response() {
    let (session, _dir) = session(LoopbackBackend::new());
    let err = session.capture_ir_offline(None, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(session.working_ir().is_none());
}

#[test]
fn test_live_capture_through_simulated_room() {
    let backend = LoopbackBackend::new().with_room(room(), 64);
    let (session, _dir) = session(backend);

    let report = session.capture_ir_live(Some(0), Some(1), false, None).unwrap();

    assert!(report.lag_samples >= 64);
    assert!(session.store().room_response().is_file());

    let ir = import_audio(&report.ir_file, RATE).unwrap();
    check_room_shape(ir.channel(0));
}

#[test]
fn test_live_capture_can_start_live() {
    let backend = LoopbackBackend::new().with_room(room(), 32);
    let (session, _dir) = session(backend);

    let report = session.capture_ir_live(Some(2), Some(2), true, Some(0.5)).unwrap();

    let live = report.live.unwrap();
    assert_eq!(live.state, LiveState::Running);
    assert_eq!(live.ir_fingerprint.as_deref(), Some(report.ir.fingerprint.as_str()));

    // Capturing again while live holds the devices is refused
    let err = session.capture_ir_live(Some(2), Some(2), false, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    assert!(session.stop_live().unwrap());
}

#[test]
fn test_live_capture_rejects_bad_device() {
    let (session, _dir) = session(LoopbackBackend::new());
    let err = session.capture_ir_live(Some(1), Some(1), false, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
}
