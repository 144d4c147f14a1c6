//! Raw frame record model.
//!
//! The tracing source delivers one [`FrameData`] record per present
//! event. The record is plain data: a present-event substructure plus
//! the GPU and CPU telemetry snapshots sampled closest to the present.
//! Gather commands read from these substructures and nothing else.
//!
//! Field names follow the source structure they are decoded from; they
//! are part of the compatibility contract with the tracing backend and
//! must not be renamed casually.

use serde::{Deserialize, Serialize};

/// Maximum length of the null-terminated application name, in bytes.
pub const APP_NAME_MAX: usize = 260;

/// Maximum number of displayed subframes a single present can carry.
pub const MAX_DISPLAYED_SUBFRAMES: usize = 8;

/// Maximum number of GPU fan sensors reported by the power telemetry.
pub const MAX_GPU_FANS: usize = 5;

/// Terminal state of a present event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum PresentResult {
    /// State not yet known (present still in flight when sampled).
    Unknown = 0,
    /// The frame reached the screen.
    Presented = 1,
    /// The frame was discarded before display.
    Discarded = 2,
}

impl Default for PresentResult {
    fn default() -> Self {
        Self::Unknown
    }
}

/// Classification of a displayed subframe.
///
/// Values are carried through the blob verbatim as `i32`, so the
/// discriminants are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum FrameType {
    /// Subframe slot not populated.
    NotSet = 0,
    /// Origin of the frame could not be determined.
    Unspecified = 1,
    /// Frame rendered by the application itself.
    Application = 2,
    /// Repeated presentation of an earlier frame.
    Repeated = 3,
    /// Frame synthesized by Intel XeSS frame generation.
    IntelXefg = 50,
    /// Frame synthesized by AMD fluid motion frames.
    AmdAfmf = 100,
}

impl Default for FrameType {
    fn default() -> Self {
        Self::NotSet
    }
}

/// The present-event substructure of a frame record.
///
/// All `*_time` fields are QPC timestamps; `time_in_present` and
/// `gpu_duration` are QPC tick deltas. A value of 0 in a timestamp
/// means the corresponding event was not observed.
#[derive(Debug, Clone)]
pub struct PresentEvent {
    /// Process executable name, null-terminated.
    pub application: [u8; APP_NAME_MAX],
    /// Address of the swap chain that presented.
    pub swap_chain_address: u64,
    /// Present mode (flip model discriminant from the source).
    pub present_mode: i32,
    /// Graphics runtime that issued the present.
    pub runtime: i32,
    /// Sync interval requested by the application.
    pub sync_interval: i32,
    /// Raw present flags.
    pub present_flags: u32,
    /// Whether the swap chain allows tearing.
    pub supports_tearing: bool,
    /// QPC at which the present call began.
    pub present_start_time: u64,
    /// QPC ticks spent inside the present call.
    pub time_in_present: u64,
    /// QPC at which GPU work for this frame began.
    pub gpu_start_time: u64,
    /// QPC at which the frame became ready for display.
    pub ready_time: u64,
    /// QPC ticks of GPU busy time attributed to this frame.
    pub gpu_duration: u64,
    /// QPC of the input event this frame was rendered from; 0 if none.
    pub input_time: u64,
    /// Screen times of each displayed subframe.
    pub displayed_screen_time: [u64; MAX_DISPLAYED_SUBFRAMES],
    /// Frame type of each displayed subframe.
    pub displayed_frame_type: [FrameType; MAX_DISPLAYED_SUBFRAMES],
    /// Number of valid entries in the displayed arrays.
    pub displayed_count: u32,
    /// Terminal state of the present.
    pub final_state: PresentResult,
}

impl Default for PresentEvent {
    fn default() -> Self {
        Self {
            application: [0; APP_NAME_MAX],
            swap_chain_address: 0,
            present_mode: 0,
            runtime: 0,
            sync_interval: 0,
            present_flags: 0,
            supports_tearing: false,
            present_start_time: 0,
            time_in_present: 0,
            gpu_start_time: 0,
            ready_time: 0,
            gpu_duration: 0,
            input_time: 0,
            displayed_screen_time: [0; MAX_DISPLAYED_SUBFRAMES],
            displayed_frame_type: [FrameType::NotSet; MAX_DISPLAYED_SUBFRAMES],
            displayed_count: 0,
            final_state: PresentResult::Unknown,
        }
    }
}

impl PresentEvent {
    /// Sets the application name from a string, truncating to fit the
    /// fixed buffer with a terminating null.
    pub fn set_application(&mut self, name: &str) {
        self.application = [0; APP_NAME_MAX];
        let n = name.len().min(APP_NAME_MAX - 1);
        self.application[..n].copy_from_slice(&name.as_bytes()[..n]);
    }

    /// Returns true if the frame never reached the screen.
    #[must_use]
    pub fn is_dropped(&self) -> bool {
        self.final_state != PresentResult::Presented
    }
}

/// GPU power-telemetry snapshot.
///
/// Scalar units are encoded in the field names. The `*_limited` flags
/// report whether the corresponding limiter was active when sampled.
#[derive(Debug, Clone, Default)]
#[allow(clippy::struct_excessive_bools)] // mirrors the source telemetry layout
pub struct GpuTelemetry {
    /// Package power draw in watts.
    pub gpu_power_w: f64,
    /// Core voltage in volts.
    pub gpu_voltage_v: f64,
    /// Core clock in MHz.
    pub gpu_frequency_mhz: f64,
    /// Die temperature in degrees C.
    pub gpu_temperature_c: f64,
    /// Overall utilization, percent.
    pub gpu_utilization: f64,
    /// Render/compute engine utilization, percent.
    pub gpu_render_compute_utilization: f64,
    /// Media engine utilization, percent.
    pub gpu_media_utilization: f64,
    /// VRAM power draw in watts.
    pub vram_power_w: f64,
    /// VRAM voltage in volts.
    pub vram_voltage_v: f64,
    /// VRAM clock in MHz.
    pub vram_frequency_mhz: f64,
    /// VRAM effective data rate in Gbps.
    pub vram_effective_frequency_gbps: f64,
    /// VRAM temperature in degrees C.
    pub vram_temperature_c: f64,
    /// Fan speeds in RPM, indexed by fan sensor.
    pub fan_speed_rpm: [f64; MAX_GPU_FANS],
    /// Total VRAM size in bytes.
    pub gpu_mem_total_size_b: u64,
    /// VRAM currently in use, bytes.
    pub gpu_mem_used_b: u64,
    /// Peak theoretical memory bandwidth, bits per second.
    pub gpu_mem_max_bandwidth_bps: u64,
    /// Observed memory write bandwidth, bits per second.
    pub gpu_mem_write_bandwidth_bps: u64,
    /// Observed memory read bandwidth, bits per second.
    pub gpu_mem_read_bandwidth_bps: u64,
    /// Power limiter active.
    pub gpu_power_limited: bool,
    /// Temperature limiter active.
    pub gpu_temperature_limited: bool,
    /// Current limiter active.
    pub gpu_current_limited: bool,
    /// Voltage limiter active.
    pub gpu_voltage_limited: bool,
    /// Utilization limiter active.
    pub gpu_utilization_limited: bool,
    /// VRAM power limiter active.
    pub vram_power_limited: bool,
    /// VRAM temperature limiter active.
    pub vram_temperature_limited: bool,
    /// VRAM current limiter active.
    pub vram_current_limited: bool,
    /// VRAM voltage limiter active.
    pub vram_voltage_limited: bool,
    /// VRAM utilization limiter active.
    pub vram_utilization_limited: bool,
}

/// CPU telemetry snapshot.
#[derive(Debug, Clone, Default)]
pub struct CpuTelemetry {
    /// Overall CPU utilization, percent.
    pub cpu_utilization: f64,
    /// Package power draw in watts.
    pub cpu_power_w: f64,
    /// Package temperature in degrees C.
    pub cpu_temperature: f64,
    /// Effective frequency in GHz.
    pub cpu_frequency: f64,
}

/// One complete frame record as delivered by the tracing source.
#[derive(Debug, Clone, Default)]
pub struct FrameData {
    /// Present-event fields.
    pub present: PresentEvent,
    /// GPU power telemetry sampled nearest this present.
    pub gpu: GpuTelemetry,
    /// CPU telemetry sampled nearest this present.
    pub cpu: CpuTelemetry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_name_is_null_terminated() {
        let mut pe = PresentEvent::default();
        pe.set_application("presenter.exe");
        assert_eq!(&pe.application[..13], b"presenter.exe");
        assert_eq!(pe.application[13], 0);
    }

    #[test]
    fn application_name_truncates_to_buffer() {
        let mut pe = PresentEvent::default();
        let long = "x".repeat(APP_NAME_MAX * 2);
        pe.set_application(&long);
        assert_eq!(pe.application[APP_NAME_MAX - 1], 0);
        assert_eq!(pe.application[APP_NAME_MAX - 2], b'x');
    }

    #[test]
    fn dropped_follows_final_state() {
        let mut pe = PresentEvent::default();
        assert!(pe.is_dropped());
        pe.final_state = PresentResult::Presented;
        assert!(!pe.is_dropped());
        pe.final_state = PresentResult::Discarded;
        assert!(pe.is_dropped());
    }
}
