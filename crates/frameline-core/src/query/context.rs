//! Per-frame gather context.
//!
//! A [`Context`] is a transient scratchpad prepared once per frame
//! from the frame's neighbours in presentation order. Gather commands
//! read the source record and the derived scalars here and nothing
//! else, which keeps the engine pure and lets multiple gather threads
//! run against distinct destination buffers.

use crate::frame::{FrameData, MAX_DISPLAYED_SUBFRAMES};

/// The neighbouring frames needed to derive a frame's context.
///
/// Optional neighbours are absent near stream start; every scalar
/// derived from an absent neighbour is 0, and the per-metric gather
/// rules encode what 0 means for them.
#[derive(Debug, Clone, Copy)]
pub struct FrameNeighbors<'a> {
    /// The next frame that reached the screen after the source frame.
    pub next_displayed: &'a FrameData,
    /// The frame presented immediately before the source frame.
    pub last_presented: &'a FrameData,
    /// The most recent frame displayed before the source frame.
    pub last_displayed: Option<&'a FrameData>,
    /// The frame presented immediately before `last_displayed`.
    pub previous_of_last_displayed: Option<&'a FrameData>,
}

/// Scratchpad for gathering one frame into blobs.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// The source frame record.
    pub frame: &'a FrameData,
    /// Index of the displayed subframe currently being gathered.
    pub display_index: u32,
    /// Whether the source frame never reached the screen.
    pub dropped: bool,
    /// QPC at which CPU work for this frame began (end of the
    /// previous frame's present call); 0 if unknown.
    pub cpu_start: u64,
    /// First screen time of the next displayed frame; 0 if unknown.
    pub next_displayed_qpc: u64,
    /// Last screen time of the previously displayed frame; 0 if none.
    pub previous_displayed_qpc: u64,
    /// CPU start of the previously displayed frame; 0 if none.
    pub previous_displayed_cpu_start_qpc: u64,
    /// Session anchor timestamp.
    pub qpc_start: u64,
    /// Milliseconds per QPC tick.
    pub performance_counter_period_ms: f64,
}

impl<'a> Context<'a> {
    /// Prepares a context for `frame` from its neighbours.
    ///
    /// The display index starts at 0; the streaming layer advances it
    /// across displayed subframes with [`Context::advance_display`].
    #[must_use]
    pub fn prepare(
        frame: &'a FrameData,
        neighbors: &FrameNeighbors<'a>,
        qpc_start: u64,
        performance_counter_period_ms: f64,
    ) -> Self {
        let last = &neighbors.last_presented.present;
        let previous_displayed_qpc = neighbors
            .last_displayed
            .map(|f| &f.present)
            .filter(|p| p.displayed_count > 0)
            .map_or(0, |p| {
                p.displayed_screen_time[(p.displayed_count - 1) as usize]
            });
        let previous_displayed_cpu_start_qpc = neighbors
            .previous_of_last_displayed
            .map_or(0, |f| f.present.present_start_time + f.present.time_in_present);

        Self {
            frame,
            display_index: 0,
            dropped: frame.present.is_dropped(),
            cpu_start: last.present_start_time + last.time_in_present,
            next_displayed_qpc: neighbors.next_displayed.present.displayed_screen_time[0],
            previous_displayed_qpc,
            previous_displayed_cpu_start_qpc,
            qpc_start,
            performance_counter_period_ms,
        }
    }

    /// Moves to the next displayed subframe. Returns `false` once all
    /// of the frame's subframes have been visited.
    pub fn advance_display(&mut self) -> bool {
        if self.display_index + 1 < self.frame.present.displayed_count {
            self.display_index += 1;
            true
        } else {
            false
        }
    }

    /// Screen time of the subframe currently being gathered.
    #[must_use]
    pub fn screen_time(&self) -> u64 {
        let idx = (self.display_index as usize).min(MAX_DISPLAYED_SUBFRAMES - 1);
        self.frame.present.displayed_screen_time[idx]
    }

    /// Screen time bounding the current subframe's display interval:
    /// the next subframe of this frame, or the next displayed frame's
    /// first screen time for the last subframe.
    #[must_use]
    pub fn next_screen_time(&self) -> u64 {
        let present = &self.frame.present;
        let next = self.display_index + 1;
        if next < present.displayed_count && (next as usize) < MAX_DISPLAYED_SUBFRAMES {
            present.displayed_screen_time[next as usize]
        } else {
            self.next_displayed_qpc
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PresentResult;

    fn presented_frame(start: u64, in_present: u64, screen_times: &[u64]) -> FrameData {
        let mut f = FrameData::default();
        f.present.present_start_time = start;
        f.present.time_in_present = in_present;
        f.present.final_state = PresentResult::Presented;
        for (i, &t) in screen_times.iter().enumerate() {
            f.present.displayed_screen_time[i] = t;
        }
        f.present.displayed_count = u32::try_from(screen_times.len()).unwrap();
        f
    }

    #[test]
    fn derived_scalars_follow_neighbours() {
        let source = presented_frame(1000, 50, &[1200]);
        let next = presented_frame(1300, 40, &[1500]);
        let last_presented = presented_frame(800, 60, &[]);
        let last_displayed = presented_frame(700, 30, &[900, 950]);
        let before_last_displayed = presented_frame(600, 20, &[]);

        let ctx = Context::prepare(
            &source,
            &FrameNeighbors {
                next_displayed: &next,
                last_presented: &last_presented,
                last_displayed: Some(&last_displayed),
                previous_of_last_displayed: Some(&before_last_displayed),
            },
            100,
            0.0001,
        );

        assert!(!ctx.dropped);
        assert_eq!(ctx.cpu_start, 860);
        assert_eq!(ctx.next_displayed_qpc, 1500);
        // Last screen time of the displayed neighbour.
        assert_eq!(ctx.previous_displayed_qpc, 950);
        assert_eq!(ctx.previous_displayed_cpu_start_qpc, 620);
        assert_eq!(ctx.display_index, 0);
    }

    #[test]
    fn absent_neighbours_zero_their_scalars() {
        let source = presented_frame(1000, 50, &[1200]);
        let next = presented_frame(1300, 40, &[1500]);
        let last_presented = presented_frame(800, 60, &[]);

        let ctx = Context::prepare(
            &source,
            &FrameNeighbors {
                next_displayed: &next,
                last_presented: &last_presented,
                last_displayed: None,
                previous_of_last_displayed: None,
            },
            100,
            0.0001,
        );

        assert_eq!(ctx.previous_displayed_qpc, 0);
        assert_eq!(ctx.previous_displayed_cpu_start_qpc, 0);
    }

    #[test]
    fn display_advance_walks_subframes() {
        let source = presented_frame(1000, 50, &[1200, 1210, 1220]);
        let next = presented_frame(1300, 40, &[1500]);
        let last_presented = presented_frame(800, 60, &[]);

        let mut ctx = Context::prepare(
            &source,
            &FrameNeighbors {
                next_displayed: &next,
                last_presented: &last_presented,
                last_displayed: None,
                previous_of_last_displayed: None,
            },
            100,
            0.0001,
        );

        assert_eq!(ctx.screen_time(), 1200);
        assert_eq!(ctx.next_screen_time(), 1210);
        assert!(ctx.advance_display());
        assert_eq!(ctx.screen_time(), 1210);
        assert_eq!(ctx.next_screen_time(), 1220);
        assert!(ctx.advance_display());
        assert_eq!(ctx.screen_time(), 1220);
        // Last subframe hands off to the next displayed frame.
        assert_eq!(ctx.next_screen_time(), 1500);
        assert!(!ctx.advance_display());
    }
}
