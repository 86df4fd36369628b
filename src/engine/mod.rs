//! Audio Engine Module
//!
//! Core audio plumbing shared by every processing path:
//! - Audio buffer management
//! - File I/O operations
//! - Working-file layout

pub mod artifacts;
pub mod buffer;
pub mod io;

pub use artifacts::ArtifactStore;
pub use buffer::{AudioBounds, AudioBuffer, ChannelLayout};
pub use io::{export_audio, generate_test_tone, import_audio, resample, ExportFormat, WavSink};
