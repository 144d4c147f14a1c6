//! # frameline-core
//!
//! Core library for frameline, a multi-client frame telemetry service.
//!
//! This crate holds the pieces of the service that are pure with respect
//! to their inputs and therefore usable from any thread:
//!
//! - **Frame data model**: the raw per-frame record consumed from the
//!   tracing source ([`frame::FrameData`] and its substructures).
//! - **Query compiler**: translates a client-supplied metric list into a
//!   stable binary record layout plus a vector of typed gather commands
//!   ([`query::FrameQuery`]).
//! - **Gather engine**: fills a caller-owned blob from a prepared
//!   per-frame [`query::Context`].
//! - **Parameter arbitration**: the pure rules that pick one effective
//!   tracing parameter from many client requests ([`params`]).
//!
//! The session broker, streaming registry, and control channel live in
//! `frameline-daemon`; they drive this crate but own all mutable state.
//!
//! ## Example
//!
//! ```rust
//! use frameline_core::metric::Metric;
//! use frameline_core::query::{FrameQuery, QueryElement};
//!
//! let mut elements = [
//!     QueryElement::new(Metric::CpuFrameTime),
//!     QueryElement::new(Metric::GpuBusy),
//! ];
//! let query = FrameQuery::compile(&mut elements).unwrap();
//! assert_eq!(query.blob_size() % 16, 0);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod blob;
pub mod error;
pub mod frame;
pub mod metric;
pub mod params;
pub mod query;

pub use error::ServiceError;
pub use frame::FrameData;
pub use metric::Metric;
pub use query::{Context, FrameQuery, QueryElement};
