//! Public metric enumeration.
//!
//! Every metric a client may request in a frame query. The compiler in
//! [`crate::query`] maps each metric to exactly one gather command;
//! metrics with no event-time derivation (the static introspection
//! entries at the bottom) are skipped at compile time and reported with
//! `data_size = 0`.

use serde::{Deserialize, Serialize};

/// Identifier of one queryable metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Metric {
    /// Application executable name.
    Application,
    /// Swap chain address the present was issued on.
    SwapChainAddress,
    /// Present mode.
    PresentMode,
    /// Graphics runtime of the present.
    PresentRuntime,
    /// Present flags.
    PresentFlags,
    /// Sync interval requested by the application.
    SyncInterval,
    /// Whether the swap chain supports tearing.
    AllowsTearing,
    /// Type of the displayed subframe.
    FrameType,
    /// Whether the frame was dropped before display.
    DroppedFrames,

    /// CPU start of the frame, raw QPC.
    CpuStartQpc,
    /// CPU start of the frame, milliseconds from the session anchor.
    CpuStartTime,
    /// Full CPU frame time, ms.
    CpuFrameTime,
    /// CPU busy portion of the frame, ms.
    CpuBusy,
    /// CPU wait portion of the frame (time in present), ms.
    CpuWait,

    /// GPU busy time attributed to the frame, ms.
    GpuBusy,
    /// Wall time from first GPU work to frame ready, ms.
    GpuTime,
    /// GPU idle gap inside the frame's GPU interval, ms.
    GpuWait,
    /// CPU start to first GPU work, ms.
    GpuLatency,

    /// Time this frame stayed on screen, ms.
    DisplayedTime,
    /// CPU start to screen, ms.
    DisplayLatency,
    /// Input event to screen, ms.
    ClickToPhotonLatency,
    /// Animation-time error versus CPU pacing, ms.
    AnimationError,

    /// GPU package power, W.
    GpuPower,
    /// GPU core voltage, V.
    GpuVoltage,
    /// GPU core frequency, MHz.
    GpuFrequency,
    /// GPU temperature, C.
    GpuTemperature,
    /// GPU fan speed, RPM (indexed by `array_index`).
    GpuFanSpeed,
    /// GPU overall utilization, percent.
    GpuUtilization,
    /// GPU render/compute utilization, percent.
    GpuRenderComputeUtilization,
    /// GPU media utilization, percent.
    GpuMediaUtilization,
    /// VRAM power, W.
    GpuMemPower,
    /// VRAM voltage, V.
    GpuMemVoltage,
    /// VRAM frequency, MHz.
    GpuMemFrequency,
    /// VRAM effective data rate, Gbps.
    GpuMemEffectiveFrequency,
    /// VRAM temperature, C.
    GpuMemTemperature,
    /// Total VRAM, bytes.
    GpuMemSize,
    /// VRAM in use, bytes.
    GpuMemUsed,
    /// Peak memory bandwidth, bps.
    GpuMemMaxBandwidth,
    /// Observed memory write bandwidth, bps.
    GpuMemWriteBandwidth,
    /// Observed memory read bandwidth, bps.
    GpuMemReadBandwidth,
    /// GPU power limiter engaged.
    GpuPowerLimited,
    /// GPU temperature limiter engaged.
    GpuTemperatureLimited,
    /// GPU current limiter engaged.
    GpuCurrentLimited,
    /// GPU voltage limiter engaged.
    GpuVoltageLimited,
    /// GPU utilization limiter engaged.
    GpuUtilizationLimited,
    /// VRAM power limiter engaged.
    GpuMemPowerLimited,
    /// VRAM temperature limiter engaged.
    GpuMemTemperatureLimited,
    /// VRAM current limiter engaged.
    GpuMemCurrentLimited,
    /// VRAM voltage limiter engaged.
    GpuMemVoltageLimited,
    /// VRAM utilization limiter engaged.
    GpuMemUtilizationLimited,

    /// CPU utilization, percent.
    CpuUtilization,
    /// CPU package power, W.
    CpuPower,
    /// CPU temperature, C.
    CpuTemperature,
    /// CPU frequency, GHz.
    CpuFrequency,

    /// CPU vendor string (static introspection; not event-gatherable).
    CpuVendor,
    /// GPU vendor string (static introspection; not event-gatherable).
    GpuVendor,
}

/// Shape of a metric's value inside the blob, used for typed readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Little-endian f64.
    F64,
    /// Little-endian u64.
    U64,
    /// Little-endian u32.
    U32,
    /// Little-endian i32.
    I32,
    /// One byte, 0 or 1.
    Bool,
    /// Null-terminated fixed text buffer.
    Text,
}

impl Metric {
    /// camelCase name used as the JSON key in `get-frames` rows.
    #[must_use]
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Application => "application",
            Self::SwapChainAddress => "swapChainAddress",
            Self::PresentMode => "presentMode",
            Self::PresentRuntime => "presentRuntime",
            Self::PresentFlags => "presentFlags",
            Self::SyncInterval => "syncInterval",
            Self::AllowsTearing => "allowsTearing",
            Self::FrameType => "frameType",
            Self::DroppedFrames => "droppedFrames",
            Self::CpuStartQpc => "cpuStartQpc",
            Self::CpuStartTime => "cpuStartTime",
            Self::CpuFrameTime => "cpuFrameTime",
            Self::CpuBusy => "cpuBusy",
            Self::CpuWait => "cpuWait",
            Self::GpuBusy => "gpuBusy",
            Self::GpuTime => "gpuTime",
            Self::GpuWait => "gpuWait",
            Self::GpuLatency => "gpuLatency",
            Self::DisplayedTime => "displayedTime",
            Self::DisplayLatency => "displayLatency",
            Self::ClickToPhotonLatency => "clickToPhotonLatency",
            Self::AnimationError => "animationError",
            Self::GpuPower => "gpuPower",
            Self::GpuVoltage => "gpuVoltage",
            Self::GpuFrequency => "gpuFrequency",
            Self::GpuTemperature => "gpuTemperature",
            Self::GpuFanSpeed => "gpuFanSpeed",
            Self::GpuUtilization => "gpuUtilization",
            Self::GpuRenderComputeUtilization => "gpuRenderComputeUtilization",
            Self::GpuMediaUtilization => "gpuMediaUtilization",
            Self::GpuMemPower => "gpuMemPower",
            Self::GpuMemVoltage => "gpuMemVoltage",
            Self::GpuMemFrequency => "gpuMemFrequency",
            Self::GpuMemEffectiveFrequency => "gpuMemEffectiveFrequency",
            Self::GpuMemTemperature => "gpuMemTemperature",
            Self::GpuMemSize => "gpuMemSize",
            Self::GpuMemUsed => "gpuMemUsed",
            Self::GpuMemMaxBandwidth => "gpuMemMaxBandwidth",
            Self::GpuMemWriteBandwidth => "gpuMemWriteBandwidth",
            Self::GpuMemReadBandwidth => "gpuMemReadBandwidth",
            Self::GpuPowerLimited => "gpuPowerLimited",
            Self::GpuTemperatureLimited => "gpuTemperatureLimited",
            Self::GpuCurrentLimited => "gpuCurrentLimited",
            Self::GpuVoltageLimited => "gpuVoltageLimited",
            Self::GpuUtilizationLimited => "gpuUtilizationLimited",
            Self::GpuMemPowerLimited => "gpuMemPowerLimited",
            Self::GpuMemTemperatureLimited => "gpuMemTemperatureLimited",
            Self::GpuMemCurrentLimited => "gpuMemCurrentLimited",
            Self::GpuMemVoltageLimited => "gpuMemVoltageLimited",
            Self::GpuMemUtilizationLimited => "gpuMemUtilizationLimited",
            Self::CpuUtilization => "cpuUtilization",
            Self::CpuPower => "cpuPower",
            Self::CpuTemperature => "cpuTemperature",
            Self::CpuFrequency => "cpuFrequency",
            Self::CpuVendor => "cpuVendor",
            Self::GpuVendor => "gpuVendor",
        }
    }

    /// The blob encoding of this metric's value, or `None` for metrics
    /// that never compile into a gather command.
    #[must_use]
    pub fn output_kind(self) -> Option<OutputKind> {
        use OutputKind::{Bool, Text, F64, I32, U32, U64};
        let kind = match self {
            Self::Application => Text,
            Self::SwapChainAddress
            | Self::CpuStartQpc
            | Self::GpuMemSize
            | Self::GpuMemUsed
            | Self::GpuMemMaxBandwidth
            | Self::GpuMemWriteBandwidth
            | Self::GpuMemReadBandwidth => U64,
            Self::PresentMode | Self::PresentRuntime | Self::SyncInterval | Self::FrameType => I32,
            Self::PresentFlags => U32,
            Self::AllowsTearing
            | Self::DroppedFrames
            | Self::GpuPowerLimited
            | Self::GpuTemperatureLimited
            | Self::GpuCurrentLimited
            | Self::GpuVoltageLimited
            | Self::GpuUtilizationLimited
            | Self::GpuMemPowerLimited
            | Self::GpuMemTemperatureLimited
            | Self::GpuMemCurrentLimited
            | Self::GpuMemVoltageLimited
            | Self::GpuMemUtilizationLimited => Bool,
            Self::CpuVendor | Self::GpuVendor => return None,
            _ => F64,
        };
        Some(kind)
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_metrics_have_no_output_kind() {
        assert_eq!(Metric::CpuVendor.output_kind(), None);
        assert_eq!(Metric::GpuVendor.output_kind(), None);
    }

    #[test]
    fn derived_latencies_decode_as_f64() {
        for m in [
            Metric::CpuFrameTime,
            Metric::GpuLatency,
            Metric::DisplayLatency,
            Metric::ClickToPhotonLatency,
            Metric::AnimationError,
        ] {
            assert_eq!(m.output_kind(), Some(OutputKind::F64), "{m}");
        }
    }
}
