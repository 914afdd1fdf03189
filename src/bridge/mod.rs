//! # Host-isolation bridge
//!
//! Runs the engine in a worker process and streams commands and image
//! buffers across its stdin/stdout pipes.
//!
//! - [`protocol`] — the length-framed command protocol and the Pod wire
//!   records.
//! - [`notify`] — the background reader with one-shot readiness
//!   callbacks, and the acknowledged timed writer.
//! - [`client`] — the host side: process lifecycle, request/response,
//!   timeouts and retry.
//! - [`server`] — the worker side: the command loop around a
//!   [`Controller`](crate::controller::Controller).

pub mod client;
pub mod notify;
pub mod protocol;
pub mod server;
