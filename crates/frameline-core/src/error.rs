//! Service error taxonomy.
//!
//! Every recoverable failure the service reports to a client maps to
//! one variant here. The broker recovers all of them locally; only
//! [`ServiceError::SourceInit`] is fatal, and only at startup.

use crate::metric::Metric;

/// Errors surfaced to clients over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// A query referenced two different non-universal devices.
    #[error("cannot reference two non-universal devices in one query ({first} and {second})")]
    DuplicateDevice {
        /// Device id referenced first.
        first: u32,
        /// Conflicting device id.
        second: u32,
    },

    /// A registration parameter fell outside the service bounds.
    #[error("{parameter} value {value} outside [{min}, {max}]")]
    OutOfRange {
        /// Human name of the parameter.
        parameter: &'static str,
        /// Requested value.
        value: u32,
        /// Inclusive lower bound.
        min: u32,
        /// Inclusive upper bound.
        max: u32,
    },

    /// A query element named a metric with no event-time derivation.
    #[error("metric {0} is not gatherable from frame events")]
    UnknownMetric(Metric),

    /// A tracked target process terminated.
    #[error("tracked process {pid} terminated")]
    TargetLost {
        /// Pid of the lost target.
        pid: u32,
    },

    /// A client's control channel ruptured without an orderly quit.
    #[error("control channel ruptured")]
    ChannelRupture,

    /// The tracing source could not be opened at startup.
    #[error("tracing source initialization failed: {reason}")]
    SourceInit {
        /// Backend-specific failure description.
        reason: String,
    },
}

impl ServiceError {
    /// The stable enum name carried in `err-check-ok:<NAME>` replies.
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::DuplicateDevice { .. } => "DUPLICATE_DEVICE",
            Self::OutOfRange { .. } => "OUT_OF_RANGE",
            Self::UnknownMetric(_) => "UNKNOWN_METRIC",
            Self::TargetLost { .. } => "TARGET_LOST",
            Self::ChannelRupture => "CHANNEL_RUPTURE",
            Self::SourceInit { .. } => "SOURCE_INIT",
        }
    }
}
