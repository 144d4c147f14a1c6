//! Process streaming registry.
//!
//! Maps each streamed pid to the set of sessions referring to it and
//! to its shared frame channel. The channel opens on the first
//! distinct reference and closes when the referring set empties, so a
//! pid is registered iff at least one session references it. All
//! mutation happens under the broker's single-threaded discipline.

use std::collections::{HashMap, HashSet};

use frameline_core::ServiceError;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::BrokerEvent;
use crate::session::SessionId;
use crate::source::TraceSource;
use crate::stream::FrameChannel;

/// One streamed pid with its referring sessions.
#[derive(Debug)]
struct StreamedPid {
    referring_sessions: HashSet<SessionId>,
    channel: FrameChannel,
}

/// Registry of streamed pids.
#[derive(Debug)]
pub struct StreamRegistry {
    streams: HashMap<u32, StreamedPid>,
    nsm_prefix: String,
    events: mpsc::Sender<BrokerEvent>,
}

impl StreamRegistry {
    /// Creates an empty registry. `events` receives `TargetLost`
    /// notifications from the channels it opens.
    #[must_use]
    pub fn new(nsm_prefix: String, events: mpsc::Sender<BrokerEvent>) -> Self {
        Self {
            streams: HashMap::new(),
            nsm_prefix,
            events,
        }
    }

    /// Adds a session reference to `pid`, opening the frame channel on
    /// the first reference. Idempotent per `(pid, session)`.
    ///
    /// # Errors
    ///
    /// Propagates the source's failure to watch the process; no
    /// reference is recorded in that case.
    pub fn start_stream(
        &mut self,
        pid: u32,
        session: SessionId,
        source: &mut dyn TraceSource,
    ) -> Result<(), ServiceError> {
        if let Some(stream) = self.streams.get_mut(&pid) {
            stream.referring_sessions.insert(session);
            return Ok(());
        }
        let feed = source.watch_process(pid)?;
        let channel = FrameChannel::open(pid, &self.nsm_prefix, feed, self.events.clone());
        info!(pid, channel = channel.name(), "stream opened");
        let mut referring_sessions = HashSet::new();
        referring_sessions.insert(session);
        self.streams.insert(
            pid,
            StreamedPid {
                referring_sessions,
                channel,
            },
        );
        Ok(())
    }

    /// Drops a session reference from `pid`, closing the channel when
    /// the last reference goes away.
    pub fn stop_stream(&mut self, pid: u32, session: SessionId, source: &mut dyn TraceSource) {
        let Some(stream) = self.streams.get_mut(&pid) else {
            return;
        };
        if !stream.referring_sessions.remove(&session) {
            return;
        }
        if stream.referring_sessions.is_empty() {
            let stream = self.streams.remove(&pid).expect("stream present");
            stream.channel.close();
            source.unwatch_process(pid);
            info!(pid, "stream closed, last reference gone");
        } else {
            debug!(
                pid,
                remaining = stream.referring_sessions.len(),
                "stream dereferenced"
            );
        }
    }

    /// Drops every reference a session holds. Returns the pids the
    /// session was dereferenced from.
    pub fn remove_session(&mut self, session: SessionId, source: &mut dyn TraceSource) -> Vec<u32> {
        let pids: Vec<u32> = self
            .streams
            .iter()
            .filter(|(_, s)| s.referring_sessions.contains(&session))
            .map(|(&pid, _)| pid)
            .collect();
        for &pid in &pids {
            self.stop_stream(pid, session, source);
        }
        pids
    }

    /// Forgets a pid entirely (target process went away). The channel
    /// is closed regardless of remaining references.
    pub fn drop_pid(&mut self, pid: u32, source: &mut dyn TraceSource) -> Vec<SessionId> {
        let Some(stream) = self.streams.remove(&pid) else {
            return Vec::new();
        };
        stream.channel.close();
        source.unwatch_process(pid);
        stream.referring_sessions.into_iter().collect()
    }

    /// Closes every stream, for service shutdown.
    pub fn close_all(&mut self, source: &mut dyn TraceSource) {
        for (pid, stream) in self.streams.drain() {
            stream.channel.close();
            source.unwatch_process(pid);
        }
    }

    /// Currently streamed pids, sorted.
    #[must_use]
    pub fn active_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.streams.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// The frame channel of a streamed pid.
    #[must_use]
    pub fn channel(&self, pid: u32) -> Option<&FrameChannel> {
        self.streams.get(&pid).map(|s| &s.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SimulatedConfig, SimulatedSource};

    fn setup() -> (StreamRegistry, SimulatedSource) {
        let (tx, _rx) = mpsc::channel(16);
        let registry = StreamRegistry::new("nsm-test".to_owned(), tx);
        let source = SimulatedSource::open(SimulatedConfig::default()).unwrap();
        (registry, source)
    }

    #[tokio::test]
    async fn pid_active_iff_referenced() {
        let (mut registry, mut source) = setup();
        let s1 = SessionId::generate();
        let s2 = SessionId::generate();

        assert!(registry.active_pids().is_empty());

        registry.start_stream(100, s1, &mut source).unwrap();
        registry.start_stream(100, s2, &mut source).unwrap();
        // Idempotent per (pid, session).
        registry.start_stream(100, s1, &mut source).unwrap();
        assert_eq!(registry.active_pids(), vec![100]);

        registry.stop_stream(100, s1, &mut source);
        assert_eq!(registry.active_pids(), vec![100]);

        registry.stop_stream(100, s2, &mut source);
        assert!(registry.active_pids().is_empty());
    }

    #[tokio::test]
    async fn remove_session_drops_all_references() {
        let (mut registry, mut source) = setup();
        let s1 = SessionId::generate();
        let s2 = SessionId::generate();

        registry.start_stream(100, s1, &mut source).unwrap();
        registry.start_stream(200, s1, &mut source).unwrap();
        registry.start_stream(200, s2, &mut source).unwrap();

        let mut dropped = registry.remove_session(s1, &mut source);
        dropped.sort_unstable();
        assert_eq!(dropped, vec![100, 200]);
        // 200 is still referenced by s2.
        assert_eq!(registry.active_pids(), vec![200]);
    }

    #[tokio::test]
    async fn drop_pid_forgets_all_sessions() {
        let (mut registry, mut source) = setup();
        let s1 = SessionId::generate();
        let s2 = SessionId::generate();
        registry.start_stream(300, s1, &mut source).unwrap();
        registry.start_stream(300, s2, &mut source).unwrap();

        let mut orphaned = registry.drop_pid(300, &mut source);
        orphaned.sort_by_key(std::string::ToString::to_string);
        assert_eq!(orphaned.len(), 2);
        assert!(registry.active_pids().is_empty());
    }

    #[tokio::test]
    async fn channels_are_named_by_prefix() {
        let (mut registry, mut source) = setup();
        let s1 = SessionId::generate();
        registry.start_stream(42, s1, &mut source).unwrap();
        assert_eq!(registry.channel(42).unwrap().name(), "nsm-test-42");
        assert!(registry.channel(43).is_none());
    }
}
