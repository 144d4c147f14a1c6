//! Tracing-source seam.
//!
//! The raw OS tracing backend is an external collaborator; the daemon
//! only depends on the [`TraceSource`] trait. The broker pushes the
//! arbitrated parameter values down through it and obtains per-pid
//! frame feeds from it. [`simulated::SimulatedSource`] is the built-in
//! backend used by tests and development runs.

pub mod simulated;

pub use simulated::{SimulatedConfig, SimulatedSource};

use frameline_core::{FrameData, ServiceError};
use tokio::sync::mpsc;

/// Stream of raw frame records for one watched process. The feed ends
/// (receives `None`) when the target process goes away.
pub type FrameFeed = mpsc::Receiver<FrameData>;

/// Session-wide timing anchor of a tracing source.
#[derive(Debug, Clone, Copy)]
pub struct SourceAnchor {
    /// Timestamp the session's relative times are measured from.
    pub qpc_start: u64,
    /// Milliseconds per counter tick.
    pub counter_period_ms: f64,
}

/// The tracing backend as seen by the broker.
pub trait TraceSource: Send {
    /// The source's timing anchor, fixed at open time.
    fn anchor(&self) -> SourceAnchor;

    /// Applies the effective telemetry sampling period.
    fn set_telemetry_period(&mut self, ms: u32);

    /// Applies the effective event-flush period.
    fn set_flush_period(&mut self, ms: u32);

    /// Starts observing a process and returns its frame feed.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::TargetLost`] when the process does not
    /// exist at watch time.
    fn watch_process(&mut self, pid: u32) -> Result<FrameFeed, ServiceError>;

    /// Stops observing a process. Idempotent.
    fn unwatch_process(&mut self, pid: u32);
}
