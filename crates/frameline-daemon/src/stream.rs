//! Per-pid frame channels and row gathering.
//!
//! A [`FrameChannel`] is the shared delivery surface for one streamed
//! pid: a worker task drains the tracing source's feed into a bounded
//! ring of raw frame records, and readers gather blobs out of that
//! ring with their own compiled query. The channel is named
//! `<nsm-prefix>-<pid>`; the name is what travels over the control
//! channel.
//!
//! Gathering a frame needs its neighbours in presentation order (the
//! previous present for the CPU start, the displayed frames around it
//! for display-derived metrics), so a frame only becomes gatherable
//! once a later displayed frame exists. [`gather_rows`] walks a ring
//! snapshot, resolves each frame's neighbour window, and emits one row
//! per displayed subframe.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use frameline_core::blob::read_element;
use frameline_core::frame::FrameData;
use frameline_core::query::{Context, FrameNeighbors, FrameQuery, QueryElement};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::broker::BrokerEvent;
use crate::source::{FrameFeed, SourceAnchor};

/// Frames retained per channel before the oldest are evicted.
const RING_CAPACITY: usize = 4096;

/// Bounded ring of raw frames with a monotonically increasing
/// sequence number per frame.
#[derive(Debug, Default)]
pub struct FrameRing {
    frames: VecDeque<FrameData>,
    /// Sequence number of `frames[0]`.
    base_seq: u64,
}

impl FrameRing {
    /// Appends a frame, evicting the oldest at capacity.
    pub fn push(&mut self, frame: FrameData) {
        if self.frames.len() == RING_CAPACITY {
            self.frames.pop_front();
            self.base_seq += 1;
        }
        self.frames.push_back(frame);
    }

    /// Sequence number one past the newest frame.
    #[must_use]
    pub fn head_seq(&self) -> u64 {
        self.base_seq + self.frames.len() as u64
    }

    /// Snapshot of the frames at or after `seq`, together with the
    /// sequence number of the first returned frame.
    #[must_use]
    pub fn snapshot_from(&self, seq: u64) -> (u64, Vec<FrameData>) {
        let start = seq.saturating_sub(self.base_seq) as usize;
        let start = start.min(self.frames.len());
        let first_seq = self.base_seq + start as u64;
        (first_seq, self.frames.iter().skip(start).cloned().collect())
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the ring holds no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Shared frame delivery surface for one streamed pid.
#[derive(Debug)]
pub struct FrameChannel {
    name: String,
    ring: Arc<Mutex<FrameRing>>,
    worker: JoinHandle<()>,
}

impl FrameChannel {
    /// Opens the channel: spawns the worker that drains `feed` into
    /// the ring. If the feed ends on its own (target process went
    /// away) a `TargetLost` event is pushed at the broker.
    #[must_use]
    pub fn open(
        pid: u32,
        nsm_prefix: &str,
        mut feed: FrameFeed,
        events: mpsc::Sender<BrokerEvent>,
    ) -> Self {
        let name = format!("{nsm_prefix}-{pid}");
        let ring = Arc::new(Mutex::new(FrameRing::default()));
        let worker_ring = Arc::clone(&ring);
        let worker = tokio::spawn(async move {
            while let Some(frame) = feed.recv().await {
                trace!(pid, "frame received");
                worker_ring
                    .lock()
                    .expect("frame ring lock poisoned")
                    .push(frame);
            }
            debug!(pid, "frame feed ended");
            let _ = events.send(BrokerEvent::TargetLost { pid }).await;
        });
        Self { name, ring, worker }
    }

    /// The channel's shared-memory name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of buffered frames at or after `seq`.
    #[must_use]
    pub fn snapshot_from(&self, seq: u64) -> (u64, Vec<FrameData>) {
        self.ring
            .lock()
            .expect("frame ring lock poisoned")
            .snapshot_from(seq)
    }

    /// Closes the channel, stopping the worker.
    pub fn close(self) {
        self.worker.abort();
    }
}

/// Result of gathering rows from a ring snapshot.
#[derive(Debug, Default)]
pub struct GatheredRows {
    /// One JSON object per gathered blob (per displayed subframe).
    pub rows: Vec<Value>,
    /// Frames consumed counting from `first_emit`; the caller
    /// advances its cursor by this much.
    pub consumed: u64,
}

/// Gathers rows from a contiguous run of frames.
///
/// Frames before `first_emit` are history: they only serve as
/// neighbours for later frames and emit no rows. A frame is gatherable
/// when a previous present exists and some later frame in the run was
/// displayed; the trailing frames that still lack a next-displayed
/// neighbour stay unconsumed for the next call. Each gatherable frame
/// yields one blob per displayed subframe; undisplayed (dropped)
/// frames yield a single blob.
#[must_use]
pub fn gather_rows(
    frames: &[FrameData],
    first_emit: usize,
    query: &FrameQuery,
    elements: &[QueryElement],
    anchor: SourceAnchor,
) -> GatheredRows {
    let mut out = GatheredRows::default();
    // The stream's very first frame has no previous present and is
    // only ever a neighbour.
    let start = first_emit.max(1);
    if start >= frames.len() {
        return out;
    }

    let mut blob = vec![0u8; query.blob_size() as usize];
    let mut last_displayed = frames[..start]
        .iter()
        .rposition(|f| f.present.displayed_count > 0);

    for i in start..frames.len() {
        let Some(next_displayed) = frames[i + 1..]
            .iter()
            .position(|f| f.present.displayed_count > 0)
            .map(|off| i + 1 + off)
        else {
            // No later displayed frame yet; everything from here on
            // stays buffered.
            break;
        };

        let neighbors = FrameNeighbors {
            next_displayed: &frames[next_displayed],
            last_presented: &frames[i - 1],
            last_displayed: last_displayed.map(|j| &frames[j]),
            previous_of_last_displayed: last_displayed
                .and_then(|j| j.checked_sub(1))
                .map(|j| &frames[j]),
        };
        let mut ctx = Context::prepare(
            &frames[i],
            &neighbors,
            anchor.qpc_start,
            anchor.counter_period_ms,
        );

        loop {
            blob.fill(0);
            query.gather_to_blob(&ctx, &mut blob);
            out.rows.push(row_to_json(&blob, elements));
            if !ctx.advance_display() {
                break;
            }
        }

        if frames[i].present.displayed_count > 0 {
            last_displayed = Some(i);
        }
        out.consumed = (i - first_emit + 1) as u64;
    }
    out
}

/// Decodes one blob into a JSON object keyed by metric wire names.
fn row_to_json(blob: &[u8], elements: &[QueryElement]) -> Value {
    let mut row = Map::with_capacity(elements.len());
    for element in elements {
        if let Some(value) = read_element(blob, element) {
            row.insert(element.metric.wire_name().to_owned(), value.to_json());
        }
    }
    Value::Object(row)
}
