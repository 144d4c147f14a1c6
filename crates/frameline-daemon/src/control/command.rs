//! Control command grammar.
//!
//! Commands arrive as single lines. Most are bare words; `register`
//! carries the client registration parameters as long flags, using the
//! same names clients pass on their own command lines.

use std::time::Duration;

/// A parsed control-channel command.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    /// Liveness probe.
    Ping,
    /// Orderly disconnect.
    Quit,
    /// Service status snapshot (test control).
    Status,
    /// Last registration error of this session (test control).
    ErrCheck,
    /// Gathered frame rows for this session (test control).
    GetFrames,
    /// Session registration / parameter update.
    Register(RegisterParams),
}

/// A request for one shared tracing parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodRequest {
    /// Request this value.
    Set(u32),
    /// Withdraw any previous request.
    Clear,
}

/// Parameters of a `register` command. Unset fields leave the
/// session's previous registration untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegisterParams {
    /// Telemetry sampling period request.
    pub telemetry_period_ms: Option<PeriodRequest>,
    /// Event-flush period request.
    pub etw_flush_period_ms: Option<PeriodRequest>,
    /// Target process to stream.
    pub process_id: Option<u32>,
    /// Advisory recording duration.
    pub run_time: Option<Duration>,
    /// Tolerate a registration error (negative tests).
    pub expect_error: bool,
}

/// Command parse failures, reported back over the channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The verb was not recognised.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    /// A flag was not recognised.
    #[error("unknown flag '{0}'")]
    UnknownFlag(String),
    /// A flag needed a value but none followed.
    #[error("flag '{0}' requires a value")]
    MissingValue(String),
    /// A flag value did not parse.
    #[error("invalid value '{value}' for flag '{flag}'")]
    InvalidValue {
        /// Flag name.
        flag: String,
        /// Offending value.
        value: String,
    },
}

impl ControlRequest {
    /// Parses one command line.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] describing the first offending token.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut tokens = line.split_whitespace();
        let verb = tokens.next().unwrap_or_default();
        match verb {
            "ping" => Ok(Self::Ping),
            "quit" => Ok(Self::Quit),
            "status" => Ok(Self::Status),
            "err-check" => Ok(Self::ErrCheck),
            "get-frames" => Ok(Self::GetFrames),
            "register" => parse_register(tokens).map(Self::Register),
            other => Err(ParseError::UnknownCommand(other.to_owned())),
        }
    }
}

fn parse_register<'a, I>(mut tokens: I) -> Result<RegisterParams, ParseError>
where
    I: Iterator<Item = &'a str>,
{
    let mut params = RegisterParams::default();
    while let Some(flag) = tokens.next() {
        match flag {
            "--telemetry-period-ms" => {
                params.telemetry_period_ms = Some(parse_period(flag, tokens.next())?);
            }
            "--etw-flush-period-ms" => {
                params.etw_flush_period_ms = Some(parse_period(flag, tokens.next())?);
            }
            "--process-id" => {
                let value = required(flag, tokens.next())?;
                params.process_id = Some(parse_u32(flag, value)?);
            }
            "--run-time" => {
                let value = required(flag, tokens.next())?;
                let secs: f64 = value.parse().map_err(|_| ParseError::InvalidValue {
                    flag: flag.to_owned(),
                    value: value.to_owned(),
                })?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(ParseError::InvalidValue {
                        flag: flag.to_owned(),
                        value: value.to_owned(),
                    });
                }
                params.run_time = Some(Duration::from_secs_f64(secs));
            }
            "--test-expect-error" => params.expect_error = true,
            other => return Err(ParseError::UnknownFlag(other.to_owned())),
        }
    }
    Ok(params)
}

fn required<'a>(flag: &str, value: Option<&'a str>) -> Result<&'a str, ParseError> {
    value.ok_or_else(|| ParseError::MissingValue(flag.to_owned()))
}

fn parse_u32(flag: &str, value: &str) -> Result<u32, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidValue {
        flag: flag.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_period(flag: &str, value: Option<&str>) -> Result<PeriodRequest, ParseError> {
    let value = required(flag, value)?;
    if value == "none" {
        return Ok(PeriodRequest::Clear);
    }
    Ok(PeriodRequest::Set(parse_u32(flag, value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_verbs_parse() {
        assert_eq!(ControlRequest::parse("ping"), Ok(ControlRequest::Ping));
        assert_eq!(ControlRequest::parse("quit"), Ok(ControlRequest::Quit));
        assert_eq!(ControlRequest::parse("status"), Ok(ControlRequest::Status));
        assert_eq!(
            ControlRequest::parse("err-check"),
            Ok(ControlRequest::ErrCheck)
        );
        assert_eq!(
            ControlRequest::parse("get-frames"),
            Ok(ControlRequest::GetFrames)
        );
    }

    #[test]
    fn register_flags_parse() {
        let parsed = ControlRequest::parse(
            "register --telemetry-period-ms 63 --etw-flush-period-ms 8 \
             --process-id 4242 --run-time 1.15 --test-expect-error",
        )
        .unwrap();
        let ControlRequest::Register(params) = parsed else {
            panic!("expected register");
        };
        assert_eq!(params.telemetry_period_ms, Some(PeriodRequest::Set(63)));
        assert_eq!(params.etw_flush_period_ms, Some(PeriodRequest::Set(8)));
        assert_eq!(params.process_id, Some(4242));
        assert_eq!(params.run_time, Some(Duration::from_secs_f64(1.15)));
        assert!(params.expect_error);
    }

    #[test]
    fn register_none_withdraws_a_request() {
        let parsed = ControlRequest::parse("register --telemetry-period-ms none").unwrap();
        let ControlRequest::Register(params) = parsed else {
            panic!("expected register");
        };
        assert_eq!(params.telemetry_period_ms, Some(PeriodRequest::Clear));
        assert_eq!(params.etw_flush_period_ms, None);
    }

    #[test]
    fn bad_input_is_reported() {
        assert_eq!(
            ControlRequest::parse("reboot"),
            Err(ParseError::UnknownCommand("reboot".into()))
        );
        assert_eq!(
            ControlRequest::parse("register --process-id"),
            Err(ParseError::MissingValue("--process-id".into()))
        );
        assert_eq!(
            ControlRequest::parse("register --telemetry-period-ms fast"),
            Err(ParseError::InvalidValue {
                flag: "--telemetry-period-ms".into(),
                value: "fast".into()
            })
        );
        assert_eq!(
            ControlRequest::parse("register --frobnicate"),
            Err(ParseError::UnknownFlag("--frobnicate".into()))
        );
    }
}
