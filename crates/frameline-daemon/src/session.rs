//! Client session state.
//!
//! One [`ClientSession`] exists per connected control channel. The
//! broker owns all sessions exclusively; connection tasks refer to
//! them only by id.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use frameline_core::query::{FrameQuery, QueryElement};
use frameline_core::ServiceError;
use uuid::Uuid;

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S-{}", self.0)
    }
}

/// A frame query compiled for a session, with the element layout kept
/// for readback.
#[derive(Debug, Clone)]
pub struct CompiledClientQuery {
    /// The compiled plan.
    pub query: FrameQuery,
    /// Elements with back-filled offsets, in query order.
    pub elements: Vec<QueryElement>,
}

/// State of one connected client.
#[derive(Debug)]
pub struct ClientSession {
    /// Session identifier.
    pub id: SessionId,
    /// Monotonic connect-order rank; lower is older. Never reused.
    pub ordering_rank: u64,
    /// This session's telemetry-period request, if any.
    pub requested_telemetry_period_ms: Option<u32>,
    /// This session's flush-period request, if any.
    pub requested_etw_flush_period_ms: Option<u32>,
    /// Pids this session is streaming.
    pub tracked_pids: HashSet<u32>,
    /// Most recent registration error, surfaced via `err-check`.
    pub last_error: Option<ServiceError>,
    /// Query used to gather rows for `get-frames`.
    pub query: Option<CompiledClientQuery>,
    /// Per-pid read cursor into the frame channel (frame sequence).
    pub cursors: HashMap<u32, u64>,
    /// Advisory recording duration from registration.
    pub run_time: Option<Duration>,
}

impl ClientSession {
    /// Fresh session with the given connect-order rank.
    #[must_use]
    pub fn new(ordering_rank: u64) -> Self {
        Self {
            id: SessionId::generate(),
            ordering_rank,
            requested_telemetry_period_ms: None,
            requested_etw_flush_period_ms: None,
            tracked_pids: HashSet::new(),
            last_error: None,
            query: None,
            cursors: HashMap::new(),
            run_time: None,
        }
    }
}
