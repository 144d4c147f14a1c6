//! frameline-daemon - multi-client frame telemetry service.
//!
//! The daemon accepts concurrent client connections over a named Unix
//! domain socket, mediates contention on the shared tracing parameters
//! (telemetry sampling period, event-flush period), tracks per-process
//! streaming lifetime, and serves gathered frame records back to
//! clients.
//!
//! # Modules
//!
//! - [`control`]: control-channel wire codec, command grammar, and the
//!   accept/connection loop
//! - [`broker`]: the single-threaded session and parameter broker
//! - [`registry`]: process streaming registry (pid reference counting)
//! - [`stream`]: per-pid frame channels and row gathering
//! - [`source`]: tracing-source seam and the simulated backend
//! - [`daemon`]: wiring that assembles the above into a running service

pub mod broker;
pub mod control;
pub mod daemon;
pub mod registry;
pub mod session;
pub mod source;
pub mod stream;

pub use daemon::{Daemon, DaemonConfig};
