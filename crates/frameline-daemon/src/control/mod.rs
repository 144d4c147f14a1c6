//! Control channel: wire format, command grammar, connection handling.
//!
//! The control channel is a named duplex byte stream (a Unix domain
//! socket). The two directions are framed asymmetrically:
//!
//! ```text
//! client -> service   one command per line, optionally prefixed '%'
//! service -> client   %%{<payload>}%%\r\n
//! ```
//!
//! Clients strip everything up to and including the start marker, then
//! read through the end marker. The markers let replies carry free-form
//! payloads (including JSON) over a stream that may also carry logging
//! noise.
//!
//! # Modules
//!
//! - [`codec`]: [`CommandCodec`] (service side) and [`ReplyCodec`]
//!   (client side) as `tokio_util` codec pairs
//! - [`command`]: the parsed command grammar ([`ControlRequest`])
//! - [`server`]: socket bind, accept loop, per-connection task

pub mod codec;
pub mod command;
pub mod server;

pub use codec::{CommandCodec, ControlError, ReplyCodec};
pub use command::{ControlRequest, ParseError, PeriodRequest, RegisterParams};
pub use server::ControlServer;
