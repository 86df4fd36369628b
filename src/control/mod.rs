//! Control plane
//!
//! The HTTP transport serves the operator panel's routes. Newline-delimited
//! JSON over TCP or stdio is the secondary transport. All of them go through
//! the same [`Dispatcher`].

pub mod dispatcher;
#[cfg(feature = "server")]
pub mod http;
pub mod protocol;
#[cfg(feature = "server")]
pub mod server;

pub use dispatcher::{serve_lines, Dispatcher};
pub use protocol::{CaptureMode, Request, Response};
#[cfg(feature = "server")]
pub use http::{router, serve_http};
#[cfg(feature = "server")]
pub use server::{accept_loop, serve_tcp};
