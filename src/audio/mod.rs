//! Audio device access
//!
//! [`AudioBackend`] is the seam between the engine and the host: the cpal
//! implementation talks to real hardware, the loopback implementation runs
//! virtual devices for tests and dry runs.

pub mod backend;
pub mod cpal_backend;
pub mod device;
pub mod loopback;

pub use backend::{
    spawn_stream_worker, AudioBackend, CaptureStream, DuplexStream, OpenedStream, StreamGuard,
    StreamHealth, StreamRequest,
};
pub use cpal_backend::CpalBackend;
pub use device::{validate_selection, DeviceDescriptor};
pub use loopback::LoopbackBackend;
