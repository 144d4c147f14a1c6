//! Typed readback of gathered blobs.
//!
//! A blob is an opaque byte record whose layout is only meaningful
//! together with the query elements that compiled it. This module
//! decodes one element's value back out of a blob, primarily for the
//! `get-frames` reply path and for tests that assert on gathered
//! values.

use serde_json::Value;

use crate::metric::OutputKind;
use crate::query::QueryElement;

/// A decoded blob field.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobValue {
    /// 64-bit float.
    F64(f64),
    /// 64-bit unsigned integer.
    U64(u64),
    /// 32-bit unsigned integer.
    U32(u32),
    /// 32-bit signed integer.
    I32(i32),
    /// Boolean byte.
    Bool(bool),
    /// Null-terminated text.
    Text(String),
}

impl BlobValue {
    /// Converts to a JSON value; non-finite floats become `null`
    /// (JSON has no NaN).
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::F64(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
            Self::U64(v) => Value::from(*v),
            Self::U32(v) => Value::from(*v),
            Self::I32(v) => Value::from(*v),
            Self::Bool(v) => Value::from(*v),
            Self::Text(v) => Value::from(v.clone()),
        }
    }

    /// The float payload, if this value is one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Reads one compiled element's value out of a blob record.
///
/// Returns `None` for elements that did not compile (`data_size == 0`)
/// or whose declared span falls outside the blob.
#[must_use]
pub fn read_element(blob: &[u8], element: &QueryElement) -> Option<BlobValue> {
    if element.data_size == 0 {
        return None;
    }
    let kind = element.metric.output_kind()?;
    let start = element.data_offset as usize;
    let end = start + element.data_size as usize;
    let bytes = blob.get(start..end)?;

    let value = match kind {
        OutputKind::F64 => BlobValue::F64(f64::from_le_bytes(bytes.try_into().ok()?)),
        OutputKind::U64 => BlobValue::U64(u64::from_le_bytes(bytes.try_into().ok()?)),
        OutputKind::U32 => BlobValue::U32(u32::from_le_bytes(bytes.try_into().ok()?)),
        OutputKind::I32 => BlobValue::I32(i32::from_le_bytes(bytes.try_into().ok()?)),
        OutputKind::Bool => BlobValue::Bool(bytes[0] != 0),
        OutputKind::Text => {
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            BlobValue::Text(String::from_utf8_lossy(&bytes[..len]).into_owned())
        }
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameData, PresentResult};
    use crate::metric::Metric;
    use crate::query::{Context, FrameQuery};

    #[test]
    fn roundtrip_through_compiled_layout() {
        let mut elements = [
            QueryElement::new(Metric::Application),
            QueryElement::new(Metric::SwapChainAddress),
            QueryElement::new(Metric::DroppedFrames),
            QueryElement::new(Metric::GpuBusy),
        ];
        let query = FrameQuery::compile(&mut elements).unwrap();

        let mut frame = FrameData::default();
        frame.present.set_application("blob.exe");
        frame.present.swap_chain_address = 42;
        frame.present.gpu_duration = 1_000;
        frame.present.final_state = PresentResult::Presented;

        let ctx = Context {
            frame: &frame,
            display_index: 0,
            dropped: false,
            cpu_start: 0,
            next_displayed_qpc: 0,
            previous_displayed_qpc: 0,
            previous_displayed_cpu_start_qpc: 0,
            qpc_start: 0,
            performance_counter_period_ms: 0.001,
        };
        let mut blob = vec![0u8; query.blob_size() as usize];
        query.gather_to_blob(&ctx, &mut blob);

        assert_eq!(
            read_element(&blob, &elements[0]),
            Some(BlobValue::Text("blob.exe".into()))
        );
        assert_eq!(read_element(&blob, &elements[1]), Some(BlobValue::U64(42)));
        assert_eq!(
            read_element(&blob, &elements[2]),
            Some(BlobValue::Bool(false))
        );
        assert_eq!(
            read_element(&blob, &elements[3]),
            Some(BlobValue::F64(1.0))
        );
    }

    #[test]
    fn uncompiled_element_reads_none() {
        let mut elements = [QueryElement::new(Metric::CpuVendor)];
        let _ = FrameQuery::compile(&mut elements).unwrap();
        assert_eq!(read_element(&[0u8; 16], &elements[0]), None);
    }

    #[test]
    fn nan_decodes_to_json_null() {
        assert_eq!(BlobValue::F64(f64::NAN).to_json(), Value::Null);
        assert_eq!(BlobValue::F64(1.5).to_json(), Value::from(1.5));
    }
}
