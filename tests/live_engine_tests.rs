//! Live Engine Tests
//!
//! State-machine and streaming behavior of the live session, run against
//! the loopback backend.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use noisecleanse::audio::LoopbackBackend;
use noisecleanse::config::LiveConfig;
use noisecleanse::engine::AudioBuffer;
use noisecleanse::error::{EngineError, ErrorKind};
use noisecleanse::ir::ImpulseResponse;
use noisecleanse::live::{LiveEngine, LiveRequest, LiveState, LiveStatus};

const RATE: u32 = 8000;
const BLOCK: usize = 128;

fn config() -> LiveConfig {
    LiveConfig {
        frame_size: BLOCK,
        ..LiveConfig::default()
    }
}

fn engine(backend: LoopbackBackend, config: LiveConfig) -> LiveEngine {
    LiveEngine::new(Arc::new(backend), config, RATE, 1024)
}

fn room_ir() -> Arc<ImpulseResponse> {
    let mut samples = vec![0.0_f32; 64];
    samples[0] = 1.0;
    samples[11] = 0.3;
    Arc::new(ImpulseResponse::new(AudioBuffer::from_mono(samples, RATE), 1024, 1e-6).unwrap())
}

fn request(input: usize, output: usize) -> LiveRequest {
    LiveRequest {
        ir: room_ir(),
        input_device: Some(input),
        output_device: Some(output),
        volume: 1.0,
    }
}

/// Poll until `done` holds or two seconds pass
fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

// === State machine ===

#[test]
fn test_start_then_stop_returns_to_idle() {
    let live = engine(LoopbackBackend::new(), config());

    let status = live.start(request(0, 1)).unwrap();
    assert_eq!(status.state, LiveState::Running);
    assert_eq!(status.sample_rate, Some(RATE));
    assert!(wait_for(|| live.status().blocks_processed > 2));

    assert!(live.stop().unwrap());
    assert_eq!(live.state(), LiveState::Idle);
    assert!(!live.stop().unwrap());
}

#[test]
fn test_second_start_is_rejected() {
    let live = engine(LoopbackBackend::new(), config());
    live.start(request(0, 1)).unwrap();

    let err = live.start(request(2, 2)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    let status = live.status();
    assert_eq!(status.state, LiveState::Running);
    assert_eq!(status.input_device, Some(0));

    live.stop().unwrap();
}

#[test]
fn test_invalid_device_leaves_idle() {
    let live = engine(LoopbackBackend::new(), config());

    let err = live.start(request(9, 1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert!(matches!(err, EngineError::DeviceNotFound { index: 9, .. }));
    assert_eq!(live.state(), LiveState::Idle);
}

#[test]
fn test_open_timeout_fails_fast() {
    let backend = LoopbackBackend::new().with_open_delay(Duration::from_millis(800));
    let live = engine(
        backend,
        LiveConfig {
            device_timeout_ms: 100,
            ..config()
        },
    );

    let started = Instant::now();
    let err = live.start(request(0, 1)).unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(600));
    assert!(matches!(err, EngineError::DeviceTimeout { timeout_ms: 100 }));
    assert_eq!(err.kind(), ErrorKind::DeviceError);
    assert_eq!(live.state(), LiveState::Idle);
}

#[test]
fn test_starved_input_escalates_to_failed() {
    let backend = LoopbackBackend::new().with_input_stall_after(BLOCK * 2);
    let live = engine(
        backend,
        LiveConfig {
            underrun_threshold: 3,
            ..config()
        },
    );

    live.start(request(0, 1)).unwrap();
    assert!(wait_for(|| live.state() == LiveState::Failed));

    let status = live.status();
    assert!(status.underruns > 0);
    assert!(status.last_error.is_some());

    // Stopping a failed session cleans up but keeps the reason
    assert!(live.stop().unwrap());
    let status = live.status();
    assert_eq!(status.state, LiveState::Idle);
    assert!(status.last_error.is_some());
}

#[test]
fn test_restart_after_failure() {
    let live = engine(
        LoopbackBackend::new().with_open_failure("device busy"),
        config(),
    );
    assert!(live.start(request(0, 1)).is_err());
    assert_eq!(live.status().last_error.as_deref().map(|e| e.contains("device busy")), Some(true));

    let live = engine(LoopbackBackend::new(), config());
    live.start(request(0, 1)).unwrap();
    live.stop().unwrap();
    live.start(request(2, 2)).unwrap();
    assert_eq!(live.status().input_device, Some(2));
    live.stop().unwrap();
}

#[test]
fn test_reset_from_running() {
    let live = engine(LoopbackBackend::new(), config());
    live.start(request(0, 1)).unwrap();

    live.reset();

    assert_eq!(live.status(), LiveStatus::default());
}

// === Streaming ===

#[test]
fn test_rendered_output_matches_offline_filter() {
    let ir = room_ir();
    let filter = ir.inverse_filter().unwrap();
    let source: Vec<f32> = (0..3000)
        .map(|n| 0.3 * (n as f32 * 0.07).sin() + 0.1 * (n as f32 * 0.31).cos())
        .collect();
    let expected = filter.apply(&source);

    let backend = LoopbackBackend::new().with_source(source.clone(), false);
    let live = engine(backend.clone(), config());
    live.start(LiveRequest {
        ir: Arc::clone(&ir),
        input_device: Some(0),
        output_device: Some(1),
        volume: 1.0,
    })
    .unwrap();

    // One block of start-up silence, then the modeling delay
    let offset = BLOCK + filter.delay();
    let needed = offset + source.len();
    assert!(wait_for(|| backend.rendered().len() >= needed));
    live.stop().unwrap();

    let rendered = backend.rendered();
    assert!(rendered[..BLOCK].iter().all(|&s| s == 0.0));
    let worst = expected
        .iter()
        .zip(&rendered[offset..needed])
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f32, f32::max);
    assert!(worst < 1e-3, "max deviation {}", worst);
}

#[test]
fn test_partial_block_survives_input_stall() {
    let identity = Arc::new(
        ImpulseResponse::new(AudioBuffer::from_mono(vec![1.0], RATE), 1024, 1e-6).unwrap(),
    );
    let filter = identity.inverse_filter().unwrap();

    // The stall lands mid-block, leaving a partial block behind
    let delivered = BLOCK * 2 + 50;
    let source: Vec<f32> = (0..4000).map(|n| 0.2 + 0.1 * (n as f32 * 0.05).sin()).collect();
    let expected = filter.apply(&source[..delivered]);

    let backend = LoopbackBackend::new()
        .with_source(source, false)
        .with_input_stall_after(delivered);
    let live = engine(
        backend.clone(),
        LiveConfig {
            underrun_threshold: 10,
            ..config()
        },
    );
    live.start(LiveRequest {
        ir: identity,
        input_device: Some(0),
        output_device: Some(1),
        volume: 1.0,
    })
    .unwrap();

    let offset = BLOCK + filter.delay();
    let needed = offset + delivered;
    assert!(wait_for(|| backend.rendered().len() >= needed));
    live.stop().unwrap();

    let rendered = backend.rendered();
    let worst = expected
        .iter()
        .zip(&rendered[offset..needed])
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f32, f32::max);
    assert!(worst < 1e-3, "max deviation {}", worst);
}

#[test]
fn test_volume_is_clamped() {
    let live = engine(
        LoopbackBackend::new(),
        LiveConfig {
            max_volume: 1.5,
            ..config()
        },
    );

    let status = live
        .start(LiveRequest {
            volume: 9.0,
            ..request(0, 1)
        })
        .unwrap();
    assert_eq!(status.volume, 1.5);
    live.stop().unwrap();
}
