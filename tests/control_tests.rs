//! Control Plane Tests
//!
//! Full request sequences through the JSON-lines dispatcher.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use test_case::test_case;

use noisecleanse::audio::LoopbackBackend;
use noisecleanse::config::{EngineConfig, PathsConfig};
use noisecleanse::control::Dispatcher;
use noisecleanse::engine::{export_audio, AudioBuffer, ExportFormat};
use noisecleanse::SessionController;

const RATE: u32 = 16000;

struct Harness {
    dispatcher: Dispatcher,
    dir: TempDir,
}

impl Harness {
    fn new(backend: LoopbackBackend) -> Self {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.paths = PathsConfig::rooted_at(&dir.path().join("work"));
        config.audio.sample_rate = RATE;
        config.live.frame_size = 256;
        config.recording.min_samples = 100;

        let session = SessionController::new(config, Arc::new(backend)).unwrap();
        Self {
            dispatcher: Dispatcher::new(Arc::new(session)),
            dir,
        }
    }

    fn call(&self, request: Value) -> Value {
        let line = self.dispatcher.handle_line(&request.to_string());
        serde_json::from_str(&line).unwrap()
    }

    fn write(&self, name: &str, samples: Vec<f32>) -> PathBuf {
        let path = self.dir.path().join(name);
        export_audio(&AudioBuffer::from_mono(samples, RATE), &path, ExportFormat::float()).unwrap();
        path
    }

    fn write_ir(&self) -> PathBuf {
        let mut ir = vec![0.0_f32; 400];
        ir[0] = 1.0;
        ir[30] = 0.4;
        ir[90] = -0.15;
        self.write("room_ir.wav", ir)
    }

    fn write_signal(&self) -> PathBuf {
        let tone = (0..RATE as usize)
            .map(|n| 0.4 * (2.0 * std::f32::consts::PI * 500.0 * n as f32 / RATE as f32).sin())
            .collect();
        self.write("speech.wav", tone)
    }
}

fn path(p: &Path) -> String {
    p.display().to_string()
}

// === Offline flow ===

#[test]
fn test_prepare_deconvolve_plot_sequence() {
    let h = Harness::new(LoopbackBackend::new());
    let ir = h.write_ir();
    let signal = h.write_signal();

    let prepared = h.call(json!({"op": "prepare_ir", "ir": path(&ir)}));
    assert_eq!(prepared["status"], "IR prepared");
    let fingerprint = prepared["fingerprint"].as_str().unwrap().to_string();
    assert_eq!(fingerprint.len(), 64);

    let done = h.call(json!({"op": "deconvolve", "signal": path(&signal), "gain": 0.8}));
    assert_eq!(done["status"], "done");
    assert!(Path::new(done["output_file"].as_str().unwrap()).is_file());
    assert_eq!(done["job"]["status"], "completed");
    assert_eq!(done["job"]["ir_fingerprint"], fingerprint.as_str());

    let plots = h.call(json!({"op": "fetch_plots"}));
    assert_eq!(plots["status"], "plot generated");
    assert!(Path::new(plots["time_plot"].as_str().unwrap()).is_file());
    assert!(Path::new(plots["freq_plot"].as_str().unwrap()).is_file());

    let status = h.call(json!({"op": "status"}));
    assert_eq!(status["ir_loaded"], true);
    assert_eq!(status["job"]["status"], "completed");
}

#[test]
fn test_deconvolve_with_inline_ir_replaces_working_ir() {
    let h = Harness::new(LoopbackBackend::new());
    let signal = h.write_signal();
    let ir = h.write_ir();

    let done = h.call(json!({"op": "deconvolve", "signal": path(&signal), "ir": path(&ir)}));
    assert_eq!(done["status"], "done");

    let status = h.call(json!({"op": "status"}));
    assert_eq!(status["ir_loaded"], true);
    assert_eq!(status["ir"]["fingerprint"], done["job"]["ir_fingerprint"]);
}

// === Error kinds ===

#[test_case(json!({"op": "deconvolve"}), "InvalidInput" ; "deconvolve without inputs")]
#[test_case(json!({"op": "fetch_plots"}), "InvalidInput" ; "plots before any job")]
#[test_case(json!({"op": "prepare_ir", "ir": "/no/such/file.wav"}), "InvalidInput" ; "missing ir file")]
#[test_case(json!({"op": "start_live"}), "InvalidInput" ; "live without ir")]
#[test_case(json!({"op": "stop_recording"}), "StateConflict" ; "stop recording when idle")]
#[test_case(json!({"op": "capture_ir", "mode": "live", "input_device": 7}), "DeviceError" ; "bad capture device")]
#[test_case(json!({"op": "prepare_ir"}), "InvalidInput" ; "missing required field")]
fn test_error_kinds(request: Value, kind: &str) {
    let h = Harness::new(LoopbackBackend::new());
    let response = h.call(request);

    assert_eq!(response["status"], "error");
    assert_eq!(response["kind"], kind);
    assert!(response["code"].is_string());
    assert!(response["reason"].is_string());
}

#[test]
fn test_silent_ir_rejected() {
    let h = Harness::new(LoopbackBackend::new());
    let silent = h.write("silent.wav", vec![0.0; 500]);

    let response = h.call(json!({"op": "prepare_ir", "ir": path(&silent)}));

    assert_eq!(response["status"], "error");
    assert_eq!(response["kind"], "InvalidInput");
}

#[test]
fn test_unavailable_audio_host() {
    let h = Harness::new(LoopbackBackend::new().unavailable());
    let response = h.call(json!({"op": "list_devices"}));
    assert_eq!(response["kind"], "AudioUnavailable");
}

// === Live and recording ===

#[test]
fn test_live_session_lifecycle() {
    let h = Harness::new(LoopbackBackend::new());
    let ir = h.write_ir();

    let started = h.call(json!({
        "op": "start_live", "ir": path(&ir), "input_device": 0, "output_device": 1, "volume": 0.7
    }));
    assert_eq!(started["status"], "live started");
    assert_eq!(started["live"]["state"], "Running");

    let again = h.call(json!({"op": "start_live", "input_device": 0, "output_device": 1}));
    assert_eq!(again["kind"], "StateConflict");

    let polled = h.call(json!({"op": "live_status"}));
    assert_eq!(polled["running"], true);

    assert_eq!(h.call(json!({"op": "stop_live"}))["status"], "stopped");
    assert_eq!(h.call(json!({"op": "stop_live"}))["status"], "not running");
    assert_eq!(h.call(json!({"op": "live_status"}))["running"], false);
}

#[test]
fn test_recording_feeds_deconvolution() {
    let h = Harness::new(LoopbackBackend::new().with_source(vec![0.1, 0.3, -0.2, 0.05], true));
    let ir = h.write_ir();
    h.call(json!({"op": "prepare_ir", "ir": path(&ir)}));

    assert_eq!(h.call(json!({"op": "start_recording", "input_device": 0}))["status"], "recording started");
    assert_eq!(h.call(json!({"op": "start_recording"}))["status"], "already recording");
    thread::sleep(Duration::from_millis(200));

    let recorded = h.call(json!({"op": "stop_recording"}));
    assert_eq!(recorded["status"], "recorded");
    assert!(Path::new(recorded["file"].as_str().unwrap()).is_file());

    // With no signal given the last recording is used
    let done = h.call(json!({"op": "deconvolve"}));
    assert_eq!(done["status"], "done");
    assert_eq!(done["job"]["signal"], recorded["file"]);
}

#[test]
fn test_reset_and_clear_temp() {
    let h = Harness::new(LoopbackBackend::new());
    let ir = h.write_ir();
    h.call(json!({"op": "prepare_ir", "ir": path(&ir)}));
    h.call(json!({"op": "start_live", "input_device": 0, "output_device": 1}));

    assert_eq!(h.call(json!({"op": "reset"}))["status"], "reset");

    let status = h.call(json!({"op": "status"}));
    assert_eq!(status["ir_loaded"], false);
    assert_eq!(status["live"]["state"], "Idle");
    assert!(status.get("job").is_none());

    let cleared = h.call(json!({"op": "clear_temp"}));
    assert_eq!(cleared["status"], "temp files cleared");
    assert_eq!(cleared["removed"], 1);
}

#[test]
fn test_health() {
    let h = Harness::new(LoopbackBackend::new());
    let health = h.call(json!({"op": "health"}));
    assert_eq!(health["status"], "ok");
    assert_eq!(health["health"]["version"], env!("CARGO_PKG_VERSION"));
}
