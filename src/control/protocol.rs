//! Control-plane wire format
//!
//! One JSON object per line in each direction. Requests are tagged by `op`;
//! responses always carry `status` and only the fields relevant to the
//! operation. Failures carry `status: "error"` plus `kind`, `code` and
//! `reason`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::audio::device::DeviceDescriptor;
use crate::error::{EngineError, ErrorKind};
use crate::ir::IrSummary;
use crate::live::LiveStatus;
use crate::offline::DeconvolutionJob;
use crate::recording::RecordingStatus;
use crate::session::HealthReport;

/// How `capture_ir` obtains the room response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    #[default]
    Offline,
    Live,
}

/// A control-plane request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    PrepareIr {
        ir: PathBuf,
    },
    CaptureIr {
        #[serde(default)]
        mode: CaptureMode,
        probe: Option<PathBuf>,
        response: Option<PathBuf>,
        input_device: Option<usize>,
        output_device: Option<usize>,
        #[serde(default)]
        start_live: bool,
        volume: Option<f32>,
    },
    Deconvolve {
        signal: Option<PathBuf>,
        ir: Option<PathBuf>,
        gain: Option<f32>,
    },
    FetchPlots,
    StartLive {
        ir: Option<PathBuf>,
        input_device: Option<usize>,
        output_device: Option<usize>,
        volume: Option<f32>,
    },
    StopLive,
    LiveStatus,
    StartRecording {
        input_device: Option<usize>,
    },
    StopRecording,
    ListDevices,
    Status,
    Reset,
    Health,
    ClearTemp,
}

impl Request {
    /// The `op` tag, for logging
    pub fn op(&self) -> &'static str {
        match self {
            Request::PrepareIr { .. } => "prepare_ir",
            Request::CaptureIr { .. } => "capture_ir",
            Request::Deconvolve { .. } => "deconvolve",
            Request::FetchPlots => "fetch_plots",
            Request::StartLive { .. } => "start_live",
            Request::StopLive => "stop_live",
            Request::LiveStatus => "live_status",
            Request::StartRecording { .. } => "start_recording",
            Request::StopRecording => "stop_recording",
            Request::ListDevices => "list_devices",
            Request::Status => "status",
            Request::Reset => "reset",
            Request::Health => "health",
            Request::ClearTemp => "clear_temp",
        }
    }
}

/// A control-plane response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recoverable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_plot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freq_plot: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ir_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ir: Option<IrSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<RecordingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ir_loaded: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<DeconvolutionJob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_recording: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<usize>,
    /// Download URLs for artifact paths, filled in by the HTTP transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<BTreeMap<String, String>>,
}

impl Response {
    /// Successful response with only a status message
    pub fn ok(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Self::default()
        }
    }

    pub fn error(error: &EngineError) -> Self {
        Self {
            status: "error".to_string(),
            kind: Some(error.kind()),
            code: Some(error.error_code().to_string()),
            reason: Some(error.to_string()),
            recoverable: Some(error.is_recoverable()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == "error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_unit_request() {
        let request: Request = serde_json::from_str(r#"{"op":"fetch_plots"}"#).unwrap();
        assert_eq!(request, Request::FetchPlots);
    }

    #[test]
    fn test_parse_optional_fields() {
        let request: Request =
            serde_json::from_str(r#"{"op":"start_live","input_device":0,"output_device":1}"#).unwrap();
        assert_eq!(
            request,
            Request::StartLive {
                ir: None,
                input_device: Some(0),
                output_device: Some(1),
                volume: None,
            }
        );
    }

    #[test]
    fn test_capture_mode_defaults_to_offline() {
        let request: Request = serde_json::from_str(r#"{"op":"capture_ir"}"#).unwrap();
        match request {
            Request::CaptureIr { mode, start_live, .. } => {
                assert_eq!(mode, CaptureMode::Offline);
                assert!(!start_live);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let err = EngineError::state_conflict("live session is Running");
        let json = serde_json::to_value(Response::error(&err)).unwrap();

        assert_eq!(json["status"], "error");
        assert_eq!(json["kind"], "StateConflict");
        assert_eq!(json["code"], err.error_code());
        assert!(json.get("output_file").is_none());
    }

    #[test]
    fn test_degenerate_kind_name() {
        let err = EngineError::DegenerateIr {
            reason: "silent".to_string(),
        };
        let json = serde_json::to_value(Response::error(&err)).unwrap();
        assert_eq!(json["kind"], "DegenerateIR");
    }
}
