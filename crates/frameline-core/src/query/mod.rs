//! Frame query compilation and gathering.
//!
//! A client describes the metrics it wants as a sequence of
//! [`QueryElement`]s. [`FrameQuery::compile`] turns that sequence into
//! an immutable plan: one typed gather command per supported element,
//! each carrying a precomputed output offset inside a fixed-size binary
//! record (the blob). [`FrameQuery::gather_to_blob`] then applies the
//! plan against a per-frame [`Context`], writing every metric value at
//! its compiled offset.
//!
//! # Layout rules
//!
//! Commands are placed consecutively in element order. Each command
//! pads its start up to its output type's natural alignment, so the
//! element's `data_offset` is always aligned. The final blob size is
//! rounded up to a multiple of 16 so that arrays of blobs stay aligned.
//!
//! # Invariants
//!
//! - `blob_size % 16 == 0`.
//! - Every command writes only within `[0, blob_size)`.
//! - For each compiled element, `data_offset`/`data_size` equal the
//!   command's output offset and size.

mod context;
mod gather;

pub use context::{Context, FrameNeighbors};
pub use gather::{CopyField, GatherCommand, GatherOp, PresentTimestamp};

use tracing::warn;

use crate::error::ServiceError;
use crate::metric::Metric;

/// Blob records are padded so consecutive records start 16-aligned.
const BLOB_ALIGN: u32 = 16;

/// One requested metric within a frame query.
///
/// `data_offset` and `data_size` are outputs of compilation; they
/// describe where the metric's value lands inside each blob record.
/// An element whose metric cannot be gathered keeps `data_size == 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryElement {
    /// Requested metric.
    pub metric: Metric,
    /// Device the metric is scoped to; 0 is the universal device.
    pub device_id: u32,
    /// Index for array-valued metrics (fan sensors).
    pub array_index: u16,
    /// Byte offset of the value within the blob (compiler output).
    pub data_offset: u32,
    /// Byte size of the value within the blob (compiler output).
    pub data_size: u32,
}

impl QueryElement {
    /// Element for `metric` on the universal device, index 0.
    #[must_use]
    pub const fn new(metric: Metric) -> Self {
        Self {
            metric,
            device_id: 0,
            array_index: 0,
            data_offset: 0,
            data_size: 0,
        }
    }

    /// Element scoped to a specific device.
    #[must_use]
    pub const fn with_device(metric: Metric, device_id: u32) -> Self {
        Self {
            device_id,
            ..Self::new(metric)
        }
    }

    /// Element with an explicit array index.
    #[must_use]
    pub const fn with_index(metric: Metric, array_index: u16) -> Self {
        Self {
            array_index,
            ..Self::new(metric)
        }
    }
}

/// A compiled, immutable frame query.
#[derive(Debug, Clone)]
pub struct FrameQuery {
    gather_commands: Vec<GatherCommand>,
    blob_size: u32,
    referenced_device: Option<u32>,
}

impl FrameQuery {
    /// Compiles a sequence of query elements into a gather plan.
    ///
    /// Elements are processed in input order; each element's
    /// `data_offset`/`data_size` are back-filled from the command that
    /// compiled for it. Elements whose metric has no event-time
    /// derivation are skipped with a warning and keep `data_size = 0`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::DuplicateDevice`] if two elements name
    /// different non-universal devices. Only one device may be polled
    /// per query.
    pub fn compile(elements: &mut [QueryElement]) -> Result<Self, ServiceError> {
        let mut query = Self {
            gather_commands: Vec::with_capacity(elements.len()),
            blob_size: 0,
            referenced_device: None,
        };

        for element in elements.iter_mut() {
            if element.device_id != 0 {
                match query.referenced_device {
                    None => query.referenced_device = Some(element.device_id),
                    Some(first) if first != element.device_id => {
                        return Err(ServiceError::DuplicateDevice {
                            first,
                            second: element.device_id,
                        });
                    }
                    Some(_) => {}
                }
            }

            let Some(cmd) =
                GatherCommand::for_metric(element.metric, element.array_index, query.blob_size)
            else {
                warn!(metric = %element.metric, "skipping metric with no frame-event derivation");
                element.data_offset = 0;
                element.data_size = 0;
                continue;
            };

            element.data_offset = cmd.output_offset();
            element.data_size = cmd.data_size();
            query.blob_size += cmd.total_size();
            query.gather_commands.push(cmd);
        }

        query.blob_size += padding_for(query.blob_size, BLOB_ALIGN);
        Ok(query)
    }

    /// Applies every gather command, in compiled order, against `ctx`,
    /// writing each metric value into `blob`.
    ///
    /// Commands only write; they are independent within one call, but
    /// the in-order contract is kept so future composite commands may
    /// read earlier outputs.
    ///
    /// # Panics
    ///
    /// Panics if `blob` is shorter than [`Self::blob_size`].
    pub fn gather_to_blob(&self, ctx: &Context<'_>, blob: &mut [u8]) {
        assert!(
            blob.len() >= self.blob_size as usize,
            "destination blob {} smaller than compiled size {}",
            blob.len(),
            self.blob_size
        );
        for cmd in &self.gather_commands {
            cmd.gather(ctx, blob);
        }
    }

    /// Size in bytes of one blob record. Always a multiple of 16.
    #[must_use]
    pub const fn blob_size(&self) -> u32 {
        self.blob_size
    }

    /// The single non-universal device this query references, if any.
    #[must_use]
    pub const fn referenced_device(&self) -> Option<u32> {
        self.referenced_device
    }

    /// The compiled gather commands, in application order.
    #[must_use]
    pub fn commands(&self) -> &[GatherCommand] {
        &self.gather_commands
    }
}

/// Bytes needed to advance `offset` to the next multiple of `align`.
pub(crate) const fn padding_for(offset: u32, align: u32) -> u32 {
    (align - (offset % align)) % align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_reaches_alignment() {
        assert_eq!(padding_for(0, 8), 0);
        assert_eq!(padding_for(1, 8), 7);
        assert_eq!(padding_for(8, 8), 0);
        assert_eq!(padding_for(9, 4), 3);
        assert_eq!(padding_for(17, 16), 15);
    }

    #[test]
    fn duplicate_device_rejected() {
        let mut elements = [
            QueryElement::with_device(Metric::GpuPower, 1),
            QueryElement::with_device(Metric::GpuTemperature, 2),
        ];
        let err = FrameQuery::compile(&mut elements).unwrap_err();
        assert_eq!(
            err,
            ServiceError::DuplicateDevice {
                first: 1,
                second: 2
            }
        );
    }

    #[test]
    fn repeated_device_accepted() {
        let mut elements = [
            QueryElement::with_device(Metric::GpuPower, 3),
            QueryElement::with_device(Metric::GpuTemperature, 3),
            QueryElement::new(Metric::CpuBusy),
        ];
        let query = FrameQuery::compile(&mut elements).unwrap();
        assert_eq!(query.referenced_device(), Some(3));
    }

    #[test]
    fn unsupported_metric_is_skipped() {
        let mut elements = [
            QueryElement::new(Metric::CpuVendor),
            QueryElement::new(Metric::GpuBusy),
        ];
        let query = FrameQuery::compile(&mut elements).unwrap();
        assert_eq!(query.commands().len(), 1);
        assert_eq!(elements[0].data_size, 0);
        assert_eq!(elements[1].data_size, 8);
    }

    #[test]
    fn blob_size_is_16_aligned_and_nonzero_layouts_backfill() {
        let mut elements = [
            QueryElement::new(Metric::DroppedFrames), // 1 byte
            QueryElement::new(Metric::GpuBusy),       // f64, needs 7 pad
            QueryElement::new(Metric::AllowsTearing), // 1 byte
        ];
        let query = FrameQuery::compile(&mut elements).unwrap();
        assert_eq!(elements[0].data_offset, 0);
        assert_eq!(elements[1].data_offset, 8);
        assert_eq!(elements[2].data_offset, 16);
        assert_eq!(query.blob_size(), 32);
        assert_eq!(query.blob_size() % 16, 0);
    }

    #[test]
    fn command_offsets_match_backfilled_elements() {
        let mut elements = [
            QueryElement::new(Metric::CpuFrameTime),
            QueryElement::new(Metric::DroppedFrames),
            QueryElement::new(Metric::SwapChainAddress),
            QueryElement::new(Metric::PresentMode),
        ];
        let query = FrameQuery::compile(&mut elements).unwrap();
        for (element, cmd) in elements.iter().zip(query.commands()) {
            assert_eq!(element.data_offset, cmd.output_offset());
            assert_eq!(element.data_size, cmd.data_size());
            assert_eq!(cmd.end_offset() - cmd.output_offset(), cmd.data_size());
            assert!(cmd.end_offset() <= query.blob_size());
        }
    }
}
