//! Gather commands: the typed instructions of a compiled frame query.
//!
//! Each command encodes how to derive one metric from a prepared
//! [`Context`] and where to place it inside the destination blob. The
//! derivation rules form a small closed set ([`GatherOp`]); the
//! compiler maps every gatherable metric to exactly one op with fixed
//! flags.
//!
//! Values are written little-endian at the command's output offset.
//! Derivations that are ill-defined for a given frame (dropped frame,
//! missing input event, absent neighbour) produce NaN rather than an
//! error; gather-time math never fails.

use crate::frame::{PresentEvent, APP_NAME_MAX, MAX_GPU_FANS};
use crate::metric::Metric;
use crate::query::{padding_for, Context};

/// QPC-valued present-event fields usable as derivation endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentTimestamp {
    /// Start of the present call.
    PresentStartTime,
    /// Ticks spent inside the present call.
    TimeInPresent,
    /// Start of GPU work for the frame.
    GpuStartTime,
    /// Frame ready for display.
    ReadyTime,
    /// GPU busy ticks attributed to the frame.
    GpuDuration,
    /// Input event the frame was rendered from.
    InputTime,
}

impl PresentTimestamp {
    fn read(self, present: &PresentEvent) -> u64 {
        match self {
            Self::PresentStartTime => present.present_start_time,
            Self::TimeInPresent => present.time_in_present,
            Self::GpuStartTime => present.gpu_start_time,
            Self::ReadyTime => present.ready_time,
            Self::GpuDuration => present.gpu_duration,
            Self::InputTime => present.input_time,
        }
    }
}

/// Directly copyable frame-record fields, tagged by substructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)] // names map one-to-one onto frame-record fields
pub enum CopyField {
    // present event
    Application,
    SwapChainAddress,
    PresentMode,
    PresentRuntime,
    SyncInterval,
    PresentFlags,
    AllowsTearing,
    DisplayedFrameType,
    // gpu power telemetry
    GpuPower,
    GpuVoltage,
    GpuFrequency,
    GpuTemperature,
    GpuFanSpeed,
    GpuUtilization,
    GpuRenderComputeUtilization,
    GpuMediaUtilization,
    VramPower,
    VramVoltage,
    VramFrequency,
    VramEffectiveFrequency,
    VramTemperature,
    GpuMemTotalSize,
    GpuMemUsed,
    GpuMemMaxBandwidth,
    GpuMemWriteBandwidth,
    GpuMemReadBandwidth,
    GpuPowerLimited,
    GpuTemperatureLimited,
    GpuCurrentLimited,
    GpuVoltageLimited,
    GpuUtilizationLimited,
    VramPowerLimited,
    VramTemperatureLimited,
    VramCurrentLimited,
    VramVoltageLimited,
    VramUtilizationLimited,
    // cpu telemetry
    CpuUtilization,
    CpuPower,
    CpuTemperature,
    CpuFrequency,
}

impl CopyField {
    const fn output_size(self) -> u32 {
        match self {
            Self::Application => APP_NAME_MAX as u32,
            Self::SwapChainAddress
            | Self::GpuMemTotalSize
            | Self::GpuMemUsed
            | Self::GpuMemMaxBandwidth
            | Self::GpuMemWriteBandwidth
            | Self::GpuMemReadBandwidth => 8,
            Self::PresentMode
            | Self::PresentRuntime
            | Self::SyncInterval
            | Self::PresentFlags
            | Self::DisplayedFrameType => 4,
            Self::AllowsTearing
            | Self::GpuPowerLimited
            | Self::GpuTemperatureLimited
            | Self::GpuCurrentLimited
            | Self::GpuVoltageLimited
            | Self::GpuUtilizationLimited
            | Self::VramPowerLimited
            | Self::VramTemperatureLimited
            | Self::VramCurrentLimited
            | Self::VramVoltageLimited
            | Self::VramUtilizationLimited => 1,
            _ => 8, // f64 scalars
        }
    }

    const fn output_align(self) -> u32 {
        match self {
            // A char buffer has byte alignment; everything else aligns
            // to its own size.
            Self::Application => 1,
            other => other.output_size(),
        }
    }

    fn gather(self, ctx: &Context<'_>, input_index: u16, blob: &mut [u8], offset: u32) {
        let present = &ctx.frame.present;
        let gpu = &ctx.frame.gpu;
        let cpu = &ctx.frame.cpu;
        match self {
            Self::Application => put_cstr(blob, offset, &present.application),
            Self::SwapChainAddress => put_u64(blob, offset, present.swap_chain_address),
            Self::PresentMode => put_i32(blob, offset, present.present_mode),
            Self::PresentRuntime => put_i32(blob, offset, present.runtime),
            Self::SyncInterval => put_i32(blob, offset, present.sync_interval),
            Self::PresentFlags => put_u32(blob, offset, present.present_flags),
            Self::AllowsTearing => put_bool(blob, offset, present.supports_tearing),
            Self::DisplayedFrameType => {
                let idx = (ctx.display_index as usize)
                    .min(present.displayed_frame_type.len() - 1);
                put_i32(blob, offset, present.displayed_frame_type[idx] as i32);
            }
            Self::GpuPower => put_f64(blob, offset, gpu.gpu_power_w),
            Self::GpuVoltage => put_f64(blob, offset, gpu.gpu_voltage_v),
            Self::GpuFrequency => put_f64(blob, offset, gpu.gpu_frequency_mhz),
            Self::GpuTemperature => put_f64(blob, offset, gpu.gpu_temperature_c),
            Self::GpuFanSpeed => {
                let idx = (input_index as usize).min(MAX_GPU_FANS - 1);
                put_f64(blob, offset, gpu.fan_speed_rpm[idx]);
            }
            Self::GpuUtilization => put_f64(blob, offset, gpu.gpu_utilization),
            Self::GpuRenderComputeUtilization => {
                put_f64(blob, offset, gpu.gpu_render_compute_utilization);
            }
            Self::GpuMediaUtilization => put_f64(blob, offset, gpu.gpu_media_utilization),
            Self::VramPower => put_f64(blob, offset, gpu.vram_power_w),
            Self::VramVoltage => put_f64(blob, offset, gpu.vram_voltage_v),
            Self::VramFrequency => put_f64(blob, offset, gpu.vram_frequency_mhz),
            Self::VramEffectiveFrequency => {
                put_f64(blob, offset, gpu.vram_effective_frequency_gbps);
            }
            Self::VramTemperature => put_f64(blob, offset, gpu.vram_temperature_c),
            Self::GpuMemTotalSize => put_u64(blob, offset, gpu.gpu_mem_total_size_b),
            Self::GpuMemUsed => put_u64(blob, offset, gpu.gpu_mem_used_b),
            Self::GpuMemMaxBandwidth => put_u64(blob, offset, gpu.gpu_mem_max_bandwidth_bps),
            Self::GpuMemWriteBandwidth => {
                put_u64(blob, offset, gpu.gpu_mem_write_bandwidth_bps);
            }
            Self::GpuMemReadBandwidth => put_u64(blob, offset, gpu.gpu_mem_read_bandwidth_bps),
            Self::GpuPowerLimited => put_bool(blob, offset, gpu.gpu_power_limited),
            Self::GpuTemperatureLimited => put_bool(blob, offset, gpu.gpu_temperature_limited),
            Self::GpuCurrentLimited => put_bool(blob, offset, gpu.gpu_current_limited),
            Self::GpuVoltageLimited => put_bool(blob, offset, gpu.gpu_voltage_limited),
            Self::GpuUtilizationLimited => {
                put_bool(blob, offset, gpu.gpu_utilization_limited);
            }
            Self::VramPowerLimited => put_bool(blob, offset, gpu.vram_power_limited),
            Self::VramTemperatureLimited => {
                put_bool(blob, offset, gpu.vram_temperature_limited);
            }
            Self::VramCurrentLimited => put_bool(blob, offset, gpu.vram_current_limited),
            Self::VramVoltageLimited => put_bool(blob, offset, gpu.vram_voltage_limited),
            Self::VramUtilizationLimited => {
                put_bool(blob, offset, gpu.vram_utilization_limited);
            }
            Self::CpuUtilization => put_f64(blob, offset, cpu.cpu_utilization),
            Self::CpuPower => put_f64(blob, offset, cpu.cpu_power_w),
            Self::CpuTemperature => put_f64(blob, offset, cpu.cpu_temperature),
            Self::CpuFrequency => put_f64(blob, offset, cpu.cpu_frequency),
        }
    }
}

/// Derivation rule of one gather command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOp {
    /// Raw copy of a frame-record field.
    Copy {
        /// Field to copy.
        field: CopyField,
        /// Index for array-valued fields.
        input_index: u16,
    },
    /// QPC tick count scaled to ms; 0 stays 0.0.
    QpcDuration {
        /// Field holding the tick count.
        field: PresentTimestamp,
    },
    /// Difference of two QPC fields scaled to ms.
    QpcDifference {
        /// Start timestamp.
        start: PresentTimestamp,
        /// End timestamp.
        end: PresentTimestamp,
        /// NaN when the start timestamp is 0.
        zero_check: bool,
        /// NaN when the frame was dropped.
        dropped_check: bool,
        /// Emit a signed difference instead of clamping to 0.
        allow_negative: bool,
    },
    /// Difference from the session anchor, always computed.
    StartDifference {
        /// End timestamp.
        end: PresentTimestamp,
    },
    /// The frame's CPU start as a raw u64 QPC.
    CpuFrameQpc,
    /// Unsigned ms from the frame's CPU start to a present timestamp.
    CpuFrameQpcDifference {
        /// End timestamp.
        end: PresentTimestamp,
        /// NaN when the frame was dropped.
        dropped_check: bool,
    },
    /// Full CPU frame time: busy portion plus time in present.
    CpuFrameTime,
    /// GPU idle gap: wall interval minus busy time, clamped at 0.
    GpuWait,
    /// On-screen duration of the current displayed subframe.
    DisplayedTime,
    /// CPU start to screen for the current subframe.
    DisplayLatency,
    /// Input event to screen for the current subframe.
    ClickToPhoton,
    /// Animation-time error against CPU pacing.
    AnimationError,
    /// The dropped flag as one byte.
    Dropped,
}

impl GatherOp {
    const fn output_size(self) -> u32 {
        match self {
            Self::Copy { field, .. } => field.output_size(),
            Self::CpuFrameQpc => 8,
            Self::Dropped => 1,
            _ => 8, // f64 derivations
        }
    }

    const fn output_align(self) -> u32 {
        match self {
            Self::Copy { field, .. } => field.output_align(),
            other => other.output_size(),
        }
    }
}

/// One compiled gather instruction: a derivation rule plus its
/// precomputed placement inside the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatherCommand {
    op: GatherOp,
    output_offset: u32,
    output_padding: u16,
}

impl GatherCommand {
    /// Builds a command for `op` at the next available byte offset,
    /// padding up to the op's output alignment.
    #[must_use]
    pub fn new(op: GatherOp, next_available_offset: u32) -> Self {
        let padding = padding_for(next_available_offset, op.output_align());
        Self {
            op,
            output_offset: next_available_offset + padding,
            #[allow(clippy::cast_possible_truncation)] // padding < align <= 16
            output_padding: padding as u16,
        }
    }

    /// Maps a metric to its gather command, or `None` for metrics with
    /// no event-time derivation.
    ///
    /// This table is exhaustive over the public metric enumeration and
    /// is the single source of truth for per-metric flags.
    #[must_use]
    pub fn for_metric(metric: Metric, array_index: u16, next_available_offset: u32) -> Option<Self> {
        use CopyField as F;
        use GatherOp as Op;
        use PresentTimestamp as Ts;

        let copy = |field| Op::Copy {
            field,
            input_index: 0,
        };

        let op = match metric {
            Metric::Application => copy(F::Application),
            Metric::SwapChainAddress => copy(F::SwapChainAddress),
            Metric::PresentMode => copy(F::PresentMode),
            Metric::PresentRuntime => copy(F::PresentRuntime),
            Metric::SyncInterval => copy(F::SyncInterval),
            Metric::PresentFlags => copy(F::PresentFlags),
            Metric::AllowsTearing => copy(F::AllowsTearing),
            Metric::FrameType => copy(F::DisplayedFrameType),
            Metric::DroppedFrames => Op::Dropped,

            Metric::CpuStartQpc => Op::CpuFrameQpc,
            Metric::CpuStartTime => Op::StartDifference {
                end: Ts::PresentStartTime,
            },
            Metric::CpuFrameTime => Op::CpuFrameTime,
            Metric::CpuBusy => Op::CpuFrameQpcDifference {
                end: Ts::PresentStartTime,
                dropped_check: false,
            },
            Metric::CpuWait => Op::QpcDuration {
                field: Ts::TimeInPresent,
            },

            Metric::GpuBusy => Op::QpcDuration {
                field: Ts::GpuDuration,
            },
            Metric::GpuTime => Op::QpcDifference {
                start: Ts::GpuStartTime,
                end: Ts::ReadyTime,
                zero_check: false,
                dropped_check: false,
                allow_negative: false,
            },
            Metric::GpuWait => Op::GpuWait,
            // Carries the dropped check: a dropped frame has no
            // meaningful GPU latency and must read back NaN.
            Metric::GpuLatency => Op::CpuFrameQpcDifference {
                end: Ts::GpuStartTime,
                dropped_check: true,
            },

            Metric::DisplayedTime => Op::DisplayedTime,
            Metric::DisplayLatency => Op::DisplayLatency,
            Metric::ClickToPhotonLatency => Op::ClickToPhoton,
            Metric::AnimationError => Op::AnimationError,

            Metric::GpuPower => copy(F::GpuPower),
            Metric::GpuVoltage => copy(F::GpuVoltage),
            Metric::GpuFrequency => copy(F::GpuFrequency),
            Metric::GpuTemperature => copy(F::GpuTemperature),
            Metric::GpuFanSpeed => Op::Copy {
                field: F::GpuFanSpeed,
                input_index: array_index,
            },
            Metric::GpuUtilization => copy(F::GpuUtilization),
            Metric::GpuRenderComputeUtilization => copy(F::GpuRenderComputeUtilization),
            Metric::GpuMediaUtilization => copy(F::GpuMediaUtilization),
            Metric::GpuMemPower => copy(F::VramPower),
            Metric::GpuMemVoltage => copy(F::VramVoltage),
            Metric::GpuMemFrequency => copy(F::VramFrequency),
            Metric::GpuMemEffectiveFrequency => copy(F::VramEffectiveFrequency),
            Metric::GpuMemTemperature => copy(F::VramTemperature),
            Metric::GpuMemSize => copy(F::GpuMemTotalSize),
            Metric::GpuMemUsed => copy(F::GpuMemUsed),
            Metric::GpuMemMaxBandwidth => copy(F::GpuMemMaxBandwidth),
            Metric::GpuMemWriteBandwidth => copy(F::GpuMemWriteBandwidth),
            Metric::GpuMemReadBandwidth => copy(F::GpuMemReadBandwidth),
            Metric::GpuPowerLimited => copy(F::GpuPowerLimited),
            Metric::GpuTemperatureLimited => copy(F::GpuTemperatureLimited),
            Metric::GpuCurrentLimited => copy(F::GpuCurrentLimited),
            Metric::GpuVoltageLimited => copy(F::GpuVoltageLimited),
            Metric::GpuUtilizationLimited => copy(F::GpuUtilizationLimited),
            Metric::GpuMemPowerLimited => copy(F::VramPowerLimited),
            Metric::GpuMemTemperatureLimited => copy(F::VramTemperatureLimited),
            Metric::GpuMemCurrentLimited => copy(F::VramCurrentLimited),
            Metric::GpuMemVoltageLimited => copy(F::VramVoltageLimited),
            Metric::GpuMemUtilizationLimited => copy(F::VramUtilizationLimited),

            Metric::CpuUtilization => copy(F::CpuUtilization),
            Metric::CpuPower => copy(F::CpuPower),
            Metric::CpuTemperature => copy(F::CpuTemperature),
            Metric::CpuFrequency => copy(F::CpuFrequency),

            _ => return None,
        };
        Some(Self::new(op, next_available_offset))
    }

    /// Derives the metric value and writes it at the output offset.
    pub fn gather(&self, ctx: &Context<'_>, blob: &mut [u8]) {
        let present = &ctx.frame.present;
        let period = ctx.performance_counter_period_ms;
        let offset = self.output_offset;

        match self.op {
            GatherOp::Copy { field, input_index } => {
                field.gather(ctx, input_index, blob, offset);
            }
            GatherOp::QpcDuration { field } => {
                let ticks = field.read(present);
                let value = if ticks == 0 {
                    0.0
                } else {
                    ticks_to_ms(ticks, period)
                };
                put_f64(blob, offset, value);
            }
            GatherOp::QpcDifference {
                start,
                end,
                zero_check,
                dropped_check,
                allow_negative,
            } => {
                if dropped_check && ctx.dropped {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                let start = start.read(present);
                if zero_check && start == 0 {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                let end = end.read(present);
                let value = if allow_negative {
                    #[allow(clippy::cast_precision_loss)]
                    let ticks = end as f64 - start as f64;
                    period * ticks
                } else {
                    unsigned_delta_ms(start, end, period)
                };
                put_f64(blob, offset, value);
            }
            GatherOp::StartDifference { end } => {
                #[allow(clippy::cast_precision_loss)]
                let ticks = end.read(present) as f64 - ctx.qpc_start as f64;
                put_f64(blob, offset, period * ticks);
            }
            GatherOp::CpuFrameQpc => put_u64(blob, offset, ctx.cpu_start),
            GatherOp::CpuFrameQpcDifference { end, dropped_check } => {
                if dropped_check && ctx.dropped {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                let value = unsigned_delta_ms(ctx.cpu_start, end.read(present), period);
                put_f64(blob, offset, value);
            }
            GatherOp::CpuFrameTime => {
                let busy = unsigned_delta_ms(ctx.cpu_start, present.present_start_time, period);
                let value = busy + ticks_to_ms(present.time_in_present, period);
                put_f64(blob, offset, value);
            }
            GatherOp::GpuWait => {
                let interval =
                    unsigned_delta_ms(present.gpu_start_time, present.ready_time, period);
                let busy = ticks_to_ms(present.gpu_duration, period);
                put_f64(blob, offset, (interval - busy).max(0.0));
            }
            GatherOp::DisplayedTime => {
                if ctx.dropped {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                let value = unsigned_delta_ms(ctx.screen_time(), ctx.next_screen_time(), period);
                put_f64(blob, offset, if value == 0.0 { f64::NAN } else { value });
            }
            GatherOp::DisplayLatency => {
                if ctx.dropped {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                let value = unsigned_delta_ms(ctx.cpu_start, ctx.screen_time(), period);
                put_f64(blob, offset, value);
            }
            GatherOp::ClickToPhoton => {
                if ctx.dropped || present.input_time == 0 {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                let value = unsigned_delta_ms(present.input_time, ctx.screen_time(), period);
                put_f64(blob, offset, value);
            }
            GatherOp::AnimationError => {
                if ctx.dropped {
                    put_f64(blob, offset, f64::NAN);
                    return;
                }
                if ctx.previous_displayed_cpu_start_qpc == 0 {
                    put_f64(blob, offset, 0.0);
                    return;
                }
                #[allow(clippy::cast_precision_loss)]
                let display_delta =
                    ctx.screen_time() as f64 - ctx.previous_displayed_qpc as f64;
                #[allow(clippy::cast_precision_loss)]
                let cpu_delta =
                    ctx.cpu_start as f64 - ctx.previous_displayed_cpu_start_qpc as f64;
                put_f64(blob, offset, period * (display_delta - cpu_delta));
            }
            GatherOp::Dropped => put_bool(blob, offset, ctx.dropped),
        }
    }

    /// The derivation rule.
    #[must_use]
    pub const fn op(&self) -> GatherOp {
        self.op
    }

    /// Byte offset where the value is written.
    #[must_use]
    pub const fn output_offset(&self) -> u32 {
        self.output_offset
    }

    /// First byte this command occupies, including leading padding.
    #[must_use]
    pub const fn begin_offset(&self) -> u32 {
        self.output_offset - self.output_padding as u32
    }

    /// One past the last byte this command writes.
    #[must_use]
    pub const fn end_offset(&self) -> u32 {
        self.output_offset + self.op.output_size()
    }

    /// Size of the written value.
    #[must_use]
    pub const fn data_size(&self) -> u32 {
        self.end_offset() - self.output_offset()
    }

    /// Bytes this command consumes in the layout, padding included.
    #[must_use]
    pub const fn total_size(&self) -> u32 {
        self.end_offset() - self.begin_offset()
    }
}

/// QPC tick count to milliseconds.
#[allow(clippy::cast_precision_loss)]
fn ticks_to_ms(ticks: u64, period_ms: f64) -> f64 {
    period_ms * ticks as f64
}

/// Unsigned timestamp delta in ms: 0.0 when `from` is unobserved or
/// the interval is empty or inverted.
fn unsigned_delta_ms(from: u64, to: u64, period_ms: f64) -> f64 {
    if from == 0 || to <= from {
        0.0
    } else {
        ticks_to_ms(to - from, period_ms)
    }
}

#[inline]
fn put_f64(blob: &mut [u8], offset: u32, value: f64) {
    let o = offset as usize;
    blob[o..o + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u64(blob: &mut [u8], offset: u32, value: u64) {
    let o = offset as usize;
    blob[o..o + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u32(blob: &mut [u8], offset: u32, value: u32) {
    let o = offset as usize;
    blob[o..o + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_i32(blob: &mut [u8], offset: u32, value: i32) {
    let o = offset as usize;
    blob[o..o + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_bool(blob: &mut [u8], offset: u32, value: bool) {
    blob[offset as usize] = u8::from(value);
}

/// Copies a null-terminated fixed buffer in full.
fn put_cstr(blob: &mut [u8], offset: u32, src: &[u8; APP_NAME_MAX]) {
    let o = offset as usize;
    blob[o..o + APP_NAME_MAX].copy_from_slice(src);
    // Keep the terminator even if the source buffer was fully packed.
    blob[o + APP_NAME_MAX - 1] = 0;
}
