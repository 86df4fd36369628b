//! Real-time deconvolution between an input and an output device

pub mod engine;
pub mod processor;

pub use engine::{LiveEngine, LiveRequest, LiveState, LiveStatus};
pub use processor::{clamp_volume, LiveProcessor};
