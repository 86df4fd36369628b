//! Request dispatch
//!
//! Maps each [`Request`] onto a [`SessionController`] call and folds the
//! outcome into a [`Response`]. Errors never escape: every failure becomes
//! an error response and the connection carries on.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::control::protocol::{CaptureMode, Request, Response};
use crate::error::{EngineError, Result};
use crate::recording::StartOutcome;
use crate::session::SessionController;

/// Returned if a response itself cannot be serialized
const FALLBACK_RESPONSE: &str =
    r#"{"status":"error","kind":"InternalFault","code":"INTERNAL_ERROR","reason":"response serialization failed"}"#;

pub struct Dispatcher {
    session: Arc<SessionController>,
}

impl Dispatcher {
    pub fn new(session: Arc<SessionController>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionController> {
        &self.session
    }

    /// Handle one request line and return one response line (no newline)
    pub fn handle_line(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(error = %e, "malformed request");
                Response::error(&EngineError::invalid_input(format!("malformed request: {}", e)))
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|_| FALLBACK_RESPONSE.to_string())
    }

    pub fn handle(&self, request: Request) -> Response {
        let op = request.op();
        debug!(op, "dispatching request");

        match self.execute(request) {
            Ok(response) => response,
            Err(e) => {
                warn!(op, kind = %e.kind(), error = %e, "request failed");
                Response::error(&e)
            }
        }
    }

    fn execute(&self, request: Request) -> Result<Response> {
        let session = &self.session;

        let response = match request {
            Request::PrepareIr { ir } => {
                let summary = session.prepare_ir(&ir)?;
                Response {
                    ir_file: Some(ir),
                    fingerprint: Some(summary.fingerprint.clone()),
                    ir: Some(summary),
                    ..Response::ok("IR prepared")
                }
            }

            Request::CaptureIr {
                mode,
                probe,
                response,
                input_device,
                output_device,
                start_live,
                volume,
            } => {
                let report = match mode {
                    CaptureMode::Offline => {
                        session.capture_ir_offline(probe.as_deref(), response.as_deref())?
                    }
                    CaptureMode::Live => {
                        session.capture_ir_live(input_device, output_device, start_live, volume)?
                    }
                };
                Response {
                    ir_file: Some(report.ir_file),
                    lag_samples: Some(report.lag_samples),
                    confidence: Some(report.confidence),
                    fingerprint: Some(report.ir.fingerprint.clone()),
                    ir: Some(report.ir),
                    live: report.live,
                    ..Response::ok("IR recorded")
                }
            }

            Request::Deconvolve { signal, ir, gain } => {
                let job = session.deconvolve(signal.as_deref(), ir.as_deref(), gain)?;
                Response {
                    output_file: Some(job.output_file.clone()),
                    job: Some(job),
                    ..Response::ok("done")
                }
            }

            Request::FetchPlots => {
                let plots = session.fetch_plots()?;
                Response {
                    time_plot: Some(plots.time_plot),
                    freq_plot: Some(plots.freq_plot),
                    ..Response::ok("plot generated")
                }
            }

            Request::StartLive {
                ir,
                input_device,
                output_device,
                volume,
            } => {
                let live = session.start_live(ir.as_deref(), input_device, output_device, volume)?;
                Response {
                    live: Some(live),
                    ..Response::ok("live started")
                }
            }

            Request::StopLive => {
                if session.stop_live()? {
                    Response::ok("stopped")
                } else {
                    Response::ok("not running")
                }
            }

            Request::LiveStatus => {
                let live = session.live_status();
                Response {
                    running: Some(live.is_active()),
                    live: Some(live),
                    ..Response::ok("ok")
                }
            }

            Request::StartRecording { input_device } => match session.start_recording(input_device)? {
                StartOutcome::Started(recording) => Response {
                    file: recording.file.clone(),
                    recording: Some(recording),
                    ..Response::ok("recording started")
                },
                StartOutcome::AlreadyRecording(recording) => Response {
                    file: recording.file.clone(),
                    recording: Some(recording),
                    ..Response::ok("already recording")
                },
            },

            Request::StopRecording => {
                let summary = session.stop_recording()?;
                Response {
                    file: Some(summary.file),
                    samples: Some(summary.samples),
                    duration_secs: Some(summary.duration_secs),
                    ..Response::ok("recorded")
                }
            }

            Request::ListDevices => Response {
                devices: Some(session.list_devices()?),
                ..Response::ok("ok")
            },

            Request::Status => {
                let status = session.status();
                Response {
                    running: Some(status.live.is_active()),
                    ir_loaded: Some(status.ir.is_some()),
                    ir: status.ir,
                    live: Some(status.live),
                    recording: Some(status.recording),
                    job: status.job,
                    last_recording: status.last_recording,
                    ..Response::ok("ok")
                }
            }

            Request::Reset => {
                session.reset();
                Response::ok("reset")
            }

            Request::Health => Response {
                health: Some(session.health()),
                ..Response::ok("ok")
            },

            Request::ClearTemp => Response {
                removed: Some(session.clear_temp()?),
                ..Response::ok("temp files cleared")
            },
        };

        Ok(response)
    }
}

/// Serve newline-delimited requests from `reader` until end of input
///
/// Blank lines are skipped. Used for the stdio transport.
pub fn serve_lines<R: BufRead, W: Write>(dispatcher: &Dispatcher, reader: R, mut writer: W) -> Result<()> {
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatcher.handle_line(&line);
        writeln!(writer, "{}", response)?;
        writer.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::LoopbackBackend;
    use crate::config::{EngineConfig, PathsConfig};
    use tempfile::{tempdir, TempDir};

    fn dispatcher() -> (Dispatcher, TempDir) {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.paths = PathsConfig::rooted_at(dir.path());
        let session = SessionController::new(config, Arc::new(LoopbackBackend::new())).unwrap();
        (Dispatcher::new(Arc::new(session)), dir)
    }

    fn call(dispatcher: &Dispatcher, line: &str) -> serde_json::Value {
        serde_json::from_str(&dispatcher.handle_line(line)).unwrap()
    }

    #[test]
    fn test_malformed_line() {
        let (dispatcher, _dir) = dispatcher();
        let response = call(&dispatcher, "{not json");
        assert_eq!(response["status"], "error");
        assert_eq!(response["kind"], "InvalidInput");
    }

    #[test]
    fn test_unknown_op() {
        let (dispatcher, _dir) = dispatcher();
        let response = call(&dispatcher, r#"{"op":"launch_rockets"}"#);
        assert_eq!(response["kind"], "InvalidInput");
    }

    #[test]
    fn test_stop_live_when_idle() {
        let (dispatcher, _dir) = dispatcher();
        assert_eq!(call(&dispatcher, r#"{"op":"stop_live"}"#)["status"], "not running");
    }

    #[test]
    fn test_list_devices() {
        let (dispatcher, _dir) = dispatcher();
        let response = call(&dispatcher, r#"{"op":"list_devices"}"#);
        assert_eq!(response["devices"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_serve_lines_skips_blanks() {
        let (dispatcher, _dir) = dispatcher();
        let input = b"{\"op\":\"health\"}\n\n{\"op\":\"status\"}\n";
        let mut output = Vec::new();

        serve_lines(&dispatcher, &input[..], &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"ir_loaded\":false"));
    }
}
