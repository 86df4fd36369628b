//! Error handling for NoiseCleanse
//!
//! Every error maps onto a small machine-readable taxonomy ([`ErrorKind`])
//! so control-plane clients can branch on the kind while humans read the
//! reason string.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse error categories exposed to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed, empty or mismatched audio, missing files, bad requests
    InvalidInput,
    /// Device lookup, open, open timeout or stream fault
    DeviceError,
    /// The host audio subsystem cannot be used at all
    AudioUnavailable,
    /// IR capture could not find a confident alignment peak
    AlignmentFailed,
    /// IR has near-zero energy across the band
    #[serde(rename = "DegenerateIR")]
    DegenerateIr,
    /// Operation incompatible with an active session
    StateConflict,
    /// Anything unexpected, including artifact I/O failures
    InternalFault,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "InvalidInput",
            ErrorKind::DeviceError => "DeviceError",
            ErrorKind::AudioUnavailable => "AudioUnavailable",
            ErrorKind::AlignmentFailed => "AlignmentFailed",
            ErrorKind::DegenerateIr => "DegenerateIR",
            ErrorKind::StateConflict => "StateConflict",
            ErrorKind::InternalFault => "InternalFault",
        };
        write!(f, "{}", name)
    }
}

/// Direction of a device request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

impl fmt::Display for DeviceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDirection::Input => write!(f, "input"),
            DeviceDirection::Output => write!(f, "output"),
        }
    }
}

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    // File / input errors
    #[error("File not found: {path}")]
    FileNotFound {
        path: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Unsupported audio format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Empty or invalid audio: {reason}")]
    EmptyOrInvalidAudio {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Sample rate mismatch: signal is {signal_rate} Hz but IR is {ir_rate} Hz")]
    LengthMismatch { signal_rate: u32, ir_rate: u32 },

    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    // DSP errors
    #[error("Degenerate impulse response: {reason}")]
    DegenerateIr { reason: String },

    #[error("Alignment failed: confidence {confidence:.2} below required {required:.2}")]
    AlignmentFailed { confidence: f32, required: f32 },

    // Device errors
    #[error("Audio subsystem unavailable: {reason}")]
    AudioUnavailable { reason: String },

    #[error("No {direction} device at index {index}")]
    DeviceNotFound {
        index: usize,
        direction: DeviceDirection,
    },

    #[error("Device {index} has no {direction} channels")]
    DeviceCapability {
        index: usize,
        direction: DeviceDirection,
    },

    #[error("Failed to open audio stream: {reason}")]
    DeviceOpen { reason: String },

    #[error("Audio device did not open within {timeout_ms} ms")]
    DeviceTimeout { timeout_ms: u64 },

    #[error("Audio stream fault: {reason}")]
    StreamFault { reason: String },

    // Session errors
    #[error("State conflict: {reason}")]
    StateConflict { reason: String },

    #[error("Internal fault: {reason}")]
    Internal { reason: String },

    // I/O Errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for [`EngineError::InvalidInput`]
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`EngineError::EmptyOrInvalidAudio`] without a source
    pub fn invalid_audio(reason: impl Into<String>) -> Self {
        EngineError::EmptyOrInvalidAudio {
            reason: reason.into(),
            source: None,
        }
    }

    /// Shorthand for [`EngineError::StateConflict`]
    pub fn state_conflict(reason: impl Into<String>) -> Self {
        EngineError::StateConflict {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`EngineError::Internal`]
    pub fn internal(reason: impl Into<String>) -> Self {
        EngineError::Internal {
            reason: reason.into(),
        }
    }

    /// Get the taxonomy kind for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::FileNotFound { .. }
            | EngineError::UnsupportedFormat { .. }
            | EngineError::EmptyOrInvalidAudio { .. }
            | EngineError::LengthMismatch { .. }
            | EngineError::InvalidInput { .. } => ErrorKind::InvalidInput,
            EngineError::DegenerateIr { .. } => ErrorKind::DegenerateIr,
            EngineError::AlignmentFailed { .. } => ErrorKind::AlignmentFailed,
            EngineError::AudioUnavailable { .. } => ErrorKind::AudioUnavailable,
            EngineError::DeviceNotFound { .. }
            | EngineError::DeviceCapability { .. }
            | EngineError::DeviceOpen { .. }
            | EngineError::DeviceTimeout { .. }
            | EngineError::StreamFault { .. } => ErrorKind::DeviceError,
            EngineError::StateConflict { .. } => ErrorKind::StateConflict,
            EngineError::Internal { .. }
            | EngineError::Io(_)
            | EngineError::Serialization(_) => ErrorKind::InternalFault,
        }
    }

    /// Get the error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::FileNotFound { .. } => "FILE_NOT_FOUND",
            EngineError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            EngineError::EmptyOrInvalidAudio { .. } => "EMPTY_OR_INVALID_AUDIO",
            EngineError::LengthMismatch { .. } => "LENGTH_MISMATCH",
            EngineError::InvalidInput { .. } => "INVALID_INPUT",
            EngineError::DegenerateIr { .. } => "DEGENERATE_IR",
            EngineError::AlignmentFailed { .. } => "ALIGNMENT_FAILED",
            EngineError::AudioUnavailable { .. } => "AUDIO_UNAVAILABLE",
            EngineError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
            EngineError::DeviceCapability { .. } => "DEVICE_CAPABILITY",
            EngineError::DeviceOpen { .. } => "DEVICE_OPEN_FAILED",
            EngineError::DeviceTimeout { .. } => "DEVICE_TIMEOUT",
            EngineError::StreamFault { .. } => "STREAM_FAULT",
            EngineError::StateConflict { .. } => "STATE_CONFLICT",
            EngineError::Internal { .. } => "INTERNAL_FAULT",
            EngineError::Io(_) => "IO_ERROR",
            EngineError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Check if retrying (possibly with different input) can succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::AudioUnavailable { .. } => false,
            EngineError::Internal { .. } => false,
            _ => !matches!(self.kind(), ErrorKind::InternalFault),
        }
    }

    /// Get recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            EngineError::FileNotFound { .. } => vec![
                "Check the file path is correct",
                "Verify the file hasn't been moved or deleted",
            ],
            EngineError::UnsupportedFormat { .. } => vec![
                "Convert the file to mono or stereo WAV",
                "Supported containers: WAV, FLAC, MP3, OGG, AAC",
            ],
            EngineError::EmptyOrInvalidAudio { .. } => vec![
                "Check if the file plays in another application",
                "Re-record the impulse response at a lower input gain",
            ],
            EngineError::LengthMismatch { .. } => {
                vec!["Resample the impulse response to the signal's sample rate"]
            }
            EngineError::DegenerateIr { .. } => vec![
                "The impulse response is silent; capture it again",
                "Check the microphone is connected during capture",
            ],
            EngineError::AlignmentFailed { .. } => vec![
                "Raise the playback volume during capture",
                "Make sure the selected input hears the selected output",
            ],
            EngineError::DeviceNotFound { .. } | EngineError::DeviceCapability { .. } => vec![
                "List devices again; indices change when hardware is plugged in or removed",
            ],
            EngineError::DeviceOpen { .. } | EngineError::DeviceTimeout { .. } => vec![
                "Close other applications using the device",
                "Try a different device or sample rate",
            ],
            EngineError::StateConflict { .. } => {
                vec!["Stop the active session first, or call reset"]
            }
            _ => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = EngineError::FileNotFound {
            path: "test.wav".to_string(),
            source: None,
        };
        assert_eq!(err.error_code(), "FILE_NOT_FOUND");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_device_errors_share_kind() {
        let not_found = EngineError::DeviceNotFound {
            index: 42,
            direction: DeviceDirection::Input,
        };
        let timeout = EngineError::DeviceTimeout { timeout_ms: 3000 };

        assert_eq!(not_found.kind(), ErrorKind::DeviceError);
        assert_eq!(timeout.kind(), ErrorKind::DeviceError);
        assert_ne!(not_found.error_code(), timeout.error_code());
        assert_eq!(not_found.to_string(), "No input device at index 42");
    }

    #[test]
    fn test_audio_unavailable_is_distinct() {
        let err = EngineError::AudioUnavailable {
            reason: "no host".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::AudioUnavailable);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_kind_serializes_to_taxonomy_names() {
        let json = serde_json::to_string(&ErrorKind::DegenerateIr).unwrap();
        assert_eq!(json, "\"DegenerateIR\"");
        assert_eq!(ErrorKind::DegenerateIr.to_string(), "DegenerateIR");

        let back: ErrorKind = serde_json::from_str("\"StateConflict\"").unwrap();
        assert_eq!(back, ErrorKind::StateConflict);
    }

    #[test]
    fn test_recovery_suggestions() {
        let err = EngineError::state_conflict("live session already running");
        assert!(!err.recovery_suggestions().is_empty());
        assert!(err.is_recoverable());
    }
}
