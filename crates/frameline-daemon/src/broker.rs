//! Session and parameter broker.
//!
//! The broker is the single-threaded cooperative core of the service:
//! one task owning every client session, the streaming registry, and
//! the tracing source. Connection tasks feed it events over an mpsc
//! queue and await replies on oneshot channels, which preserves
//! arrival order within a session and serializes all state mutation.
//!
//! Parameter contention is resolved on every relevant event
//! (registration, withdrawal, disconnect of either kind) by the pure
//! arbitration rules in [`frameline_core::params`], and the effective
//! values are pushed down into the tracing source when they change.

use std::collections::HashMap;

use frameline_core::metric::Metric;
use frameline_core::params::{
    effective_etw_flush_period, effective_telemetry_period, validate_etw_flush_period,
    validate_telemetry_period,
};
use frameline_core::query::{FrameQuery, QueryElement};
use frameline_core::ServiceError;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::control::{ControlRequest, PeriodRequest, RegisterParams};
use crate::registry::StreamRegistry;
use crate::session::{ClientSession, CompiledClientQuery, SessionId};
use crate::source::TraceSource;
use crate::stream::gather_rows;

/// Depth of the broker's event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Frames of neighbour history kept behind a session's read cursor.
const CURSOR_HISTORY: u64 = 16;

/// Metrics gathered for `get-frames` rows.
const CLIENT_QUERY_METRICS: &[Metric] = &[
    Metric::Application,
    Metric::PresentMode,
    Metric::AllowsTearing,
    Metric::FrameType,
    Metric::DroppedFrames,
    Metric::CpuFrameTime,
    Metric::CpuBusy,
    Metric::CpuWait,
    Metric::GpuBusy,
    Metric::GpuTime,
    Metric::GpuWait,
    Metric::GpuLatency,
    Metric::DisplayLatency,
    Metric::DisplayedTime,
    Metric::ClickToPhotonLatency,
    Metric::AnimationError,
];

/// Why a session went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent `quit` and the channel closed in order.
    Graceful,
    /// The channel ruptured without an orderly quit.
    Rupture,
}

/// A reply to one control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Payload to frame back to the client.
    pub payload: String,
    /// Whether the connection closes after this reply.
    pub close: bool,
}

impl Reply {
    fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            close: false,
        }
    }
}

/// Events consumed by the broker task.
#[derive(Debug)]
pub enum BrokerEvent {
    /// A client connected; reply carries the new session id.
    Connect {
        /// Oneshot for the assigned session id.
        reply: oneshot::Sender<SessionId>,
    },
    /// A command line arrived on a session's channel.
    Line {
        /// Originating session.
        session: SessionId,
        /// Raw command line (sigil already stripped).
        line: String,
        /// Oneshot for the reply.
        reply: oneshot::Sender<Reply>,
    },
    /// A session's channel closed.
    Disconnect {
        /// The session that went away.
        session: SessionId,
        /// How it went away.
        reason: DisconnectReason,
    },
    /// A streamed target process went away.
    TargetLost {
        /// Pid of the lost target.
        pid: u32,
    },
    /// Orderly service shutdown: close every stream and exit.
    Shutdown,
}

/// Errors talking to the broker task.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker task has exited.
    #[error("broker task is gone")]
    Closed,
}

/// Cloneable handle feeding events to the broker task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<BrokerEvent>,
}

impl BrokerHandle {
    /// Registers a new connection and returns its session id.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] when the broker task is gone.
    pub async fn connect(&self) -> Result<SessionId, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BrokerEvent::Connect { reply: reply_tx })
            .await
            .map_err(|_| BrokerError::Closed)?;
        reply_rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Submits one command line and awaits the reply.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Closed`] when the broker task is gone.
    pub async fn line(&self, session: SessionId, line: String) -> Result<Reply, BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BrokerEvent::Line {
                session,
                line,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BrokerError::Closed)?;
        reply_rx.await.map_err(|_| BrokerError::Closed)
    }

    /// Reports a closed session channel.
    pub async fn disconnect(&self, session: SessionId, reason: DisconnectReason) {
        let _ = self
            .tx
            .send(BrokerEvent::Disconnect { session, reason })
            .await;
    }

    /// Requests orderly broker shutdown.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(BrokerEvent::Shutdown).await;
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Prefix for per-pid frame channel names.
    pub nsm_prefix: String,
    /// Name of the introspection region advertised to clients.
    pub intro_nsm: String,
    /// Whether the test-control surface (`status`, `err-check`,
    /// `get-frames`) is enabled.
    pub enable_test_control: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            nsm_prefix: "frameline-nsm".to_owned(),
            intro_nsm: "frameline-intro".to_owned(),
            enable_test_control: true,
        }
    }
}

/// Service status snapshot returned by the `status` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Pids currently streamed, sorted.
    pub nsm_streamed_pids: Vec<u32>,
    /// Effective telemetry sampling period.
    pub telemetry_period_ms: u32,
    /// Effective event-flush period.
    pub etw_flush_period_ms: u32,
}

/// The broker task state.
pub struct Broker {
    rx: mpsc::Receiver<BrokerEvent>,
    sessions: HashMap<SessionId, ClientSession>,
    registry: StreamRegistry,
    source: Box<dyn TraceSource>,
    config: BrokerConfig,
    next_rank: u64,
    applied_telemetry_ms: Option<u32>,
    applied_flush_ms: Option<u32>,
}

impl Broker {
    /// Creates the broker and its handle.
    #[must_use]
    pub fn new(config: BrokerConfig, source: Box<dyn TraceSource>) -> (Self, BrokerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let registry = StreamRegistry::new(config.nsm_prefix.clone(), tx.clone());
        let broker = Self {
            rx,
            sessions: HashMap::new(),
            registry,
            source,
            config,
            next_rank: 0,
            applied_telemetry_ms: None,
            applied_flush_ms: None,
        };
        (broker, BrokerHandle { tx })
    }

    /// Runs the broker until every handle is dropped.
    pub async fn run(mut self) {
        // Push the defaults down before the first client shows up.
        self.recompute_parameters();
        info!(intro_nsm = %self.config.intro_nsm, "broker running");
        while let Some(event) = self.rx.recv().await {
            match event {
                BrokerEvent::Connect { reply } => {
                    let session = ClientSession::new(self.next_rank);
                    self.next_rank += 1;
                    let id = session.id;
                    debug!(session = %id, rank = session.ordering_rank, "session connected");
                    self.sessions.insert(id, session);
                    let _ = reply.send(id);
                }
                BrokerEvent::Line {
                    session,
                    line,
                    reply,
                } => {
                    let _ = reply.send(self.handle_line(session, &line));
                }
                BrokerEvent::Disconnect { session, reason } => {
                    self.handle_disconnect(session, reason);
                }
                BrokerEvent::TargetLost { pid } => {
                    self.handle_target_lost(pid);
                }
                BrokerEvent::Shutdown => {
                    info!("broker shutting down");
                    self.registry.close_all(self.source.as_mut());
                    return;
                }
            }
        }
        debug!("broker event queue closed, exiting");
    }

    fn handle_line(&mut self, session_id: SessionId, line: &str) -> Reply {
        if !self.sessions.contains_key(&session_id) {
            return Reply::text("err:unknown-session");
        }
        let request = match ControlRequest::parse(line) {
            Ok(request) => request,
            Err(err) => return Reply::text(format!("err:{err}")),
        };
        match request {
            ControlRequest::Ping => Reply::text("ping-ok"),
            ControlRequest::Quit => Reply {
                payload: "quit-ok".to_owned(),
                close: true,
            },
            ControlRequest::Status => self.test_control(|broker| {
                let snapshot = broker.status_snapshot();
                Reply::text(serde_json::to_string(&snapshot).expect("status serializes"))
            }),
            ControlRequest::ErrCheck => self.test_control(|broker| {
                let session = &broker.sessions[&session_id];
                let name = session
                    .last_error
                    .as_ref()
                    .map_or("OK", ServiceError::wire_name);
                Reply::text(format!("err-check-ok:{name}"))
            }),
            ControlRequest::GetFrames => {
                self.test_control(|broker| broker.handle_get_frames(session_id))
            }
            ControlRequest::Register(params) => self.handle_register(session_id, &params),
        }
    }

    fn test_control(&mut self, f: impl FnOnce(&mut Self) -> Reply) -> Reply {
        if self.config.enable_test_control {
            f(self)
        } else {
            Reply::text("err:test-control-disabled")
        }
    }

    fn status_snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            nsm_streamed_pids: self.registry.active_pids(),
            telemetry_period_ms: self.effective_telemetry(),
            etw_flush_period_ms: self.effective_flush(),
        }
    }

    fn effective_telemetry(&self) -> u32 {
        effective_telemetry_period(
            self.sessions
                .values()
                .map(|s| (s.ordering_rank, s.requested_telemetry_period_ms)),
        )
    }

    fn effective_flush(&self) -> u32 {
        effective_etw_flush_period(
            self.sessions
                .values()
                .map(|s| s.requested_etw_flush_period_ms),
        )
    }

    /// Recomputes both effective parameters and applies changes to the
    /// tracing source.
    fn recompute_parameters(&mut self) {
        let telemetry = self.effective_telemetry();
        if self.applied_telemetry_ms != Some(telemetry) {
            info!(
                previous = self.applied_telemetry_ms,
                effective = telemetry,
                "telemetry period changed"
            );
            self.source.set_telemetry_period(telemetry);
            self.applied_telemetry_ms = Some(telemetry);
        }
        let flush = self.effective_flush();
        if self.applied_flush_ms != Some(flush) {
            info!(
                previous = self.applied_flush_ms,
                effective = flush,
                "etw flush period changed"
            );
            self.source.set_flush_period(flush);
            self.applied_flush_ms = Some(flush);
        }
    }

    fn handle_register(&mut self, session_id: SessionId, params: &RegisterParams) -> Reply {
        // Validate everything before any state change: a rejected
        // registration must not affect arbitration or streaming.
        let validation = params
            .telemetry_period_ms
            .iter()
            .filter_map(|req| match req {
                PeriodRequest::Set(ms) => Some(validate_telemetry_period(*ms)),
                PeriodRequest::Clear => None,
            })
            .chain(params.etw_flush_period_ms.iter().filter_map(|req| match req {
                PeriodRequest::Set(ms) => Some(validate_etw_flush_period(*ms)),
                PeriodRequest::Clear => None,
            }))
            .find_map(Result::err);

        if let Some(err) = validation {
            warn!(session = %session_id, error = %err, "registration rejected");
            let reply = self.register_error_reply(session_id, err, params.expect_error);
            return reply;
        }

        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("session checked in handle_line");
        match params.telemetry_period_ms {
            Some(PeriodRequest::Set(ms)) => session.requested_telemetry_period_ms = Some(ms),
            Some(PeriodRequest::Clear) => session.requested_telemetry_period_ms = None,
            None => {}
        }
        match params.etw_flush_period_ms {
            Some(PeriodRequest::Set(ms)) => session.requested_etw_flush_period_ms = Some(ms),
            Some(PeriodRequest::Clear) => session.requested_etw_flush_period_ms = None,
            None => {}
        }
        session.run_time = params.run_time.or(session.run_time);
        self.recompute_parameters();

        if let Some(pid) = params.process_id {
            if let Err(err) = self.begin_streaming(session_id, pid) {
                warn!(session = %session_id, pid, error = %err, "stream start failed");
                return self.register_error_reply(session_id, err, params.expect_error);
            }
        }

        Reply::text("register-ok")
    }

    fn register_error_reply(
        &mut self,
        session_id: SessionId,
        err: ServiceError,
        expect_error: bool,
    ) -> Reply {
        let name = err.wire_name();
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.last_error = Some(err);
        }
        if expect_error {
            Reply::text("register-ok")
        } else {
            Reply::text(format!("register-err:{name}"))
        }
    }

    fn begin_streaming(&mut self, session_id: SessionId, pid: u32) -> Result<(), ServiceError> {
        self.registry
            .start_stream(pid, session_id, self.source.as_mut())?;
        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("session checked in handle_line");
        session.tracked_pids.insert(pid);
        session.cursors.entry(pid).or_insert(0);
        if session.query.is_none() {
            let mut elements: Vec<QueryElement> = CLIENT_QUERY_METRICS
                .iter()
                .map(|&m| QueryElement::new(m))
                .collect();
            let query = FrameQuery::compile(&mut elements)?;
            session.query = Some(CompiledClientQuery { query, elements });
        }
        Ok(())
    }

    fn handle_get_frames(&mut self, session_id: SessionId) -> Reply {
        let anchor = self.source.anchor();
        let session = self
            .sessions
            .get_mut(&session_id)
            .expect("session checked in handle_line");
        let ClientSession {
            query,
            tracked_pids,
            cursors,
            ..
        } = session;

        let mut rows = Vec::new();
        if let Some(compiled) = query {
            let mut pids: Vec<u32> = tracked_pids.iter().copied().collect();
            pids.sort_unstable();
            for pid in pids {
                let Some(channel) = self.registry.channel(pid) else {
                    continue;
                };
                let cursor = cursors.get(&pid).copied().unwrap_or(0);
                let (first_seq, frames) =
                    channel.snapshot_from(cursor.saturating_sub(CURSOR_HISTORY));
                let emit_from = cursor.max(first_seq);
                #[allow(clippy::cast_possible_truncation)]
                let first_emit = (emit_from - first_seq) as usize;
                let gathered = gather_rows(
                    &frames,
                    first_emit,
                    &compiled.query,
                    &compiled.elements,
                    anchor,
                );
                cursors.insert(pid, emit_from + gathered.consumed);
                rows.extend(gathered.rows);
            }
        }

        let body = serde_json::json!({
            "status": "get-frames-ok",
            "frames": rows,
        });
        Reply::text(body.to_string())
    }

    fn handle_disconnect(&mut self, session_id: SessionId, reason: DisconnectReason) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };
        let dropped = self
            .registry
            .remove_session(session_id, self.source.as_mut());
        info!(
            session = %session_id,
            rank = session.ordering_rank,
            ?reason,
            dropped_pids = dropped.len(),
            "session disconnected"
        );
        self.recompute_parameters();
    }

    fn handle_target_lost(&mut self, pid: u32) {
        let orphaned = self.registry.drop_pid(pid, self.source.as_mut());
        if orphaned.is_empty() {
            return;
        }
        warn!(pid, sessions = orphaned.len(), "streamed target lost");
        for session_id in orphaned {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.tracked_pids.remove(&pid);
                session.last_error = Some(ServiceError::TargetLost { pid });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SimulatedConfig, SimulatedSource};
    use std::time::Duration;

    fn spawn_broker() -> BrokerHandle {
        let source = SimulatedSource::open(SimulatedConfig {
            frame_interval: Duration::from_millis(1),
            ..SimulatedConfig::default()
        })
        .unwrap();
        let (broker, handle) = Broker::new(BrokerConfig::default(), Box::new(source));
        tokio::spawn(broker.run());
        handle
    }

    async fn status(handle: &BrokerHandle, session: SessionId) -> StatusSnapshot {
        let reply = handle.line(session, "status".into()).await.unwrap();
        serde_json::from_str(&reply.payload).unwrap()
    }

    #[tokio::test]
    async fn defaults_reported_with_no_requests() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        let snapshot = status(&handle, s).await;
        assert_eq!(snapshot.nsm_streamed_pids, Vec::<u32>::new());
        assert_eq!(snapshot.telemetry_period_ms, 16);
        assert_eq!(snapshot.etw_flush_period_ms, 1000);
    }

    #[tokio::test]
    async fn ping_and_quit_replies() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        let reply = handle.line(s, "ping".into()).await.unwrap();
        assert_eq!(reply, Reply::text("ping-ok"));
        let reply = handle.line(s, "quit".into()).await.unwrap();
        assert_eq!(reply.payload, "quit-ok");
        assert!(reply.close);
    }

    #[tokio::test]
    async fn out_of_range_registration_leaves_state_untouched() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        let reply = handle
            .line(
                s,
                "register --telemetry-period-ms 3 --test-expect-error".into(),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload, "register-ok");
        let reply = handle.line(s, "err-check".into()).await.unwrap();
        assert_eq!(reply.payload, "err-check-ok:OUT_OF_RANGE");
        // The rejected request must not have affected arbitration.
        assert_eq!(status(&handle, s).await.telemetry_period_ms, 16);
    }

    #[tokio::test]
    async fn rejected_registration_without_expectation_reports_error() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        let reply = handle
            .line(s, "register --etw-flush-period-ms 1500".into())
            .await
            .unwrap();
        assert_eq!(reply.payload, "register-err:OUT_OF_RANGE");
    }

    #[tokio::test]
    async fn withdrawal_reverts_to_default() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        handle
            .line(s, "register --telemetry-period-ms 63".into())
            .await
            .unwrap();
        assert_eq!(status(&handle, s).await.telemetry_period_ms, 63);
        handle
            .line(s, "register --telemetry-period-ms none".into())
            .await
            .unwrap();
        assert_eq!(status(&handle, s).await.telemetry_period_ms, 16);
    }

    #[tokio::test]
    async fn unknown_command_reports_parse_error() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        let reply = handle.line(s, "explode".into()).await.unwrap();
        assert_eq!(reply.payload, "err:unknown command 'explode'");
    }

    #[tokio::test]
    async fn get_frames_eventually_returns_rows() {
        let handle = spawn_broker();
        let s = handle.connect().await.unwrap();
        let reply = handle
            .line(s, "register --process-id 555 --run-time 0.2".into())
            .await
            .unwrap();
        assert_eq!(reply.payload, "register-ok");

        let mut total = 0;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let reply = handle.line(s, "get-frames".into()).await.unwrap();
            let body: serde_json::Value = serde_json::from_str(&reply.payload).unwrap();
            assert_eq!(body["status"], "get-frames-ok");
            total += body["frames"].as_array().unwrap().len();
            if total >= 20 {
                break;
            }
        }
        assert!(total >= 20, "only {total} frames gathered");
    }

    #[tokio::test]
    async fn target_loss_untracks_and_surfaces_error() {
        let source = SimulatedSource::open(SimulatedConfig {
            frame_interval: Duration::from_millis(1),
            process_lifetime: Some(Duration::from_millis(20)),
            ..SimulatedConfig::default()
        })
        .unwrap();
        let (broker, handle) = Broker::new(BrokerConfig::default(), Box::new(source));
        tokio::spawn(broker.run());

        let s = handle.connect().await.unwrap();
        handle
            .line(s, "register --process-id 777".into())
            .await
            .unwrap();
        assert_eq!(status(&handle, s).await.nsm_streamed_pids, vec![777]);

        // Wait past the simulated lifetime for the loss to propagate.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(status(&handle, s).await.nsm_streamed_pids, Vec::<u32>::new());
        let reply = handle.line(s, "err-check".into()).await.unwrap();
        assert_eq!(reply.payload, "err-check-ok:TARGET_LOST");
    }
}
