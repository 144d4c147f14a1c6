//! Shared tracing-parameter arbitration.
//!
//! The service exposes two global tracing parameters that every client
//! may request a value for: the device telemetry sampling period and
//! the event-flush period. Contention is resolved by fixed rules:
//!
//! - **Telemetry period**: first writer wins. The oldest still-connected
//!   session holding a request determines the effective value.
//! - **Flush period**: smallest value wins across all requests.
//!
//! Both fall back to their defaults when no session holds a request.
//! The functions here are pure; the broker owns the session list and
//! feeds `(ordering_rank, request)` pairs in.

use crate::error::ServiceError;

/// Effective telemetry period when no client has requested one, ms.
pub const DEFAULT_TELEMETRY_PERIOD_MS: u32 = 16;

/// Effective event-flush period when no client has requested one, ms.
pub const DEFAULT_ETW_FLUSH_PERIOD_MS: u32 = 1000;

/// Inclusive telemetry-period bounds accepted at registration, ms.
pub const TELEMETRY_PERIOD_BOUNDS_MS: (u32, u32) = (4, 4000);

/// Inclusive event-flush-period bounds accepted at registration, ms.
pub const ETW_FLUSH_PERIOD_BOUNDS_MS: (u32, u32) = (1, 1000);

/// Validates a requested telemetry sampling period.
///
/// # Errors
///
/// Returns [`ServiceError::OutOfRange`] when the value falls outside
/// [`TELEMETRY_PERIOD_BOUNDS_MS`].
pub fn validate_telemetry_period(ms: u32) -> Result<(), ServiceError> {
    let (min, max) = TELEMETRY_PERIOD_BOUNDS_MS;
    if ms < min || ms > max {
        return Err(ServiceError::OutOfRange {
            parameter: "telemetry period",
            value: ms,
            min,
            max,
        });
    }
    Ok(())
}

/// Validates a requested event-flush period.
///
/// # Errors
///
/// Returns [`ServiceError::OutOfRange`] when the value falls outside
/// [`ETW_FLUSH_PERIOD_BOUNDS_MS`].
pub fn validate_etw_flush_period(ms: u32) -> Result<(), ServiceError> {
    let (min, max) = ETW_FLUSH_PERIOD_BOUNDS_MS;
    if ms < min || ms > max {
        return Err(ServiceError::OutOfRange {
            parameter: "etw flush period",
            value: ms,
            min,
            max,
        });
    }
    Ok(())
}

/// Resolves the effective telemetry period: the request of the session
/// with the lowest ordering rank, else the default.
///
/// Ranks are assigned at connect time from a monotonic counter and
/// never reused, so "lowest rank" is "oldest still-connected".
pub fn effective_telemetry_period<I>(requests: I) -> u32
where
    I: IntoIterator<Item = (u64, Option<u32>)>,
{
    requests
        .into_iter()
        .filter_map(|(rank, req)| req.map(|ms| (rank, ms)))
        .min_by_key(|&(rank, _)| rank)
        .map_or(DEFAULT_TELEMETRY_PERIOD_MS, |(_, ms)| ms)
}

/// Resolves the effective event-flush period: the minimum across all
/// requests, else the default.
pub fn effective_etw_flush_period<I>(requests: I) -> u32
where
    I: IntoIterator<Item = Option<u32>>,
{
    requests
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(DEFAULT_ETW_FLUSH_PERIOD_MS)
}
