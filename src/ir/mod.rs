//! Impulse responses: preparation of uploaded IRs and sweep measurement

pub mod capture;
pub mod prepare;

pub use capture::{capture_offline, extract_ir, record_live, CaptureSettings, CapturedIr, LiveRecording};
pub use prepare::{prepare_buffer, prepare_ir, ImpulseResponse, IrSummary, PrepareOptions};
