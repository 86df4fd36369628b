//! CLI Command Implementations
//!
//! Each command drives the same [`SessionController`] the control plane
//! uses, then prints a short human-readable report.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use crate::audio::{AudioBackend, CpalBackend, LoopbackBackend};
use crate::config::EngineConfig;
use crate::control::{serve_lines, Dispatcher};
use crate::error::{EngineError, Result};
use crate::session::{CaptureReport, SessionController};

/// Load configuration and build the session on the selected backend.
pub fn build_session(config: Option<&Path>, loopback: bool) -> Result<Arc<SessionController>> {
    let config = EngineConfig::load(config)?;
    let backend: Arc<dyn AudioBackend> = if loopback {
        Arc::new(LoopbackBackend::new())
    } else {
        Arc::new(CpalBackend)
    };
    Ok(Arc::new(SessionController::new(config, backend)?))
}

/// Serve the control plane over HTTP, JSON lines on TCP, or stdio.
pub fn serve(session: Arc<SessionController>, listen: Option<String>, lines: Option<String>, stdio: bool) -> Result<()> {
    let dispatcher = Dispatcher::new(session);

    if stdio {
        info!("serving control plane on stdio");
        let stdin = io::stdin();
        return serve_lines(&dispatcher, stdin.lock(), io::stdout());
    }

    match lines {
        Some(address) => serve_network(dispatcher, &address, Transport::Lines),
        None => {
            let address = listen.unwrap_or_else(|| dispatcher.session().config().server.listen.clone());
            serve_network(dispatcher, &address, Transport::Http)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Transport {
    Http,
    Lines,
}

#[cfg(feature = "server")]
fn serve_network(dispatcher: Dispatcher, listen: &str, transport: Transport) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let dispatcher = Arc::new(dispatcher);
    runtime.block_on(async {
        match transport {
            Transport::Http => crate::control::serve_http(dispatcher, listen).await,
            Transport::Lines => crate::control::serve_tcp(dispatcher, listen).await,
        }
    })
}

#[cfg(not(feature = "server"))]
fn serve_network(_dispatcher: Dispatcher, listen: &str, transport: Transport) -> Result<()> {
    Err(EngineError::invalid_input(format!(
        "cannot serve {:?} on {}: built without the `server` feature, use --stdio",
        transport, listen
    )))
}

/// List audio devices.
pub fn list_devices(session: &SessionController) -> Result<()> {
    let devices = session.list_devices()?;

    if devices.is_empty() {
        println!("No audio devices found.");
        return Ok(());
    }

    println!("{:>3}  {:<40} {:>3} {:>3}", "#", "name", "in", "out");
    println!("{:-<54}", "");
    for device in devices {
        let mut marks = Vec::new();
        if device.is_default_input {
            marks.push("default input");
        }
        if device.is_default_output {
            marks.push("default output");
        }
        println!(
            "{:>3}  {:<40} {:>3} {:>3}  {}",
            device.index,
            device.name,
            device.max_input_channels,
            device.max_output_channels,
            marks.join(", ")
        );
    }

    Ok(())
}

/// Prepare an impulse response and print its summary.
pub fn prepare_ir(session: &SessionController, ir: &Path) -> Result<()> {
    let summary = session.prepare_ir(ir)?;

    println!("IR prepared: {}", ir.display());
    println!("Fingerprint: {}", summary.fingerprint);
    println!("Length: {} samples @ {} Hz", summary.length, summary.sample_rate);
    println!("Design length: {}", summary.design_len);

    Ok(())
}

/// Run one offline deconvolution.
pub fn deconvolve(session: &SessionController, signal: &Path, ir: &Path, gain: Option<f32>) -> Result<()> {
    let job = session.deconvolve(Some(signal), Some(ir), gain)?;

    println!("Recovered: {}", job.output_file.display());
    if let Some(plots) = &job.plots {
        println!("Time plot: {}", plots.time_plot.display());
        println!("Frequency plot: {}", plots.freq_plot.display());
    }

    Ok(())
}

/// Derive the IR from files already on disk.
pub fn capture_offline(session: &SessionController, probe: Option<&Path>, response: Option<&Path>) -> Result<()> {
    let report = session.capture_ir_offline(probe, response)?;
    print_capture(&report);
    Ok(())
}

/// Measure the IR through the audio devices.
pub fn capture_live(session: &SessionController, input: Option<usize>, output: Option<usize>) -> Result<()> {
    println!("Playing sweep...");
    let report = session.capture_ir_live(input, output, false, None)?;
    print_capture(&report);
    Ok(())
}

fn print_capture(report: &CaptureReport) {
    println!("IR recorded: {}", report.ir_file.display());
    println!("Latency: {} samples", report.lag_samples);
    println!("Confidence: {:.3}", report.confidence);
    println!("Fingerprint: {}", report.ir.fingerprint);
}

/// Run live deconvolution until Enter is pressed.
pub fn live(
    session: &SessionController,
    ir: Option<PathBuf>,
    input: Option<usize>,
    output: Option<usize>,
    volume: f32,
) -> Result<()> {
    let status = session.start_live(ir.as_deref(), input, output, Some(volume))?;
    println!(
        "Live deconvolution running at {} Hz (volume {:.2}). Press Enter to stop.",
        status.sample_rate.unwrap_or_default(),
        status.volume
    );
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    let status = session.live_status();
    session.stop_live()?;

    println!("Blocks processed: {}", status.blocks_processed);
    println!("Underruns: {}", status.underruns);
    if let Some(error) = status.last_error {
        println!("Last error: {}", error);
    }

    Ok(())
}

/// Record the input device for a fixed time.
pub fn record(session: &SessionController, input: Option<usize>, seconds: f32) -> Result<()> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return Err(EngineError::invalid_input(format!("invalid recording length {}", seconds)));
    }

    session.start_recording(input)?;
    println!("Recording for {:.1} s...", seconds);
    thread::sleep(Duration::from_secs_f32(seconds));

    let summary = session.stop_recording()?;
    println!("Recorded: {}", summary.file.display());
    println!("Duration: {:.2} s ({} samples)", summary.duration_secs, summary.samples);

    Ok(())
}
