//! Client runtime for the mesh bus: lifecycle management, handler and
//! plugin registration, RPC/event dispatch, and the observability and
//! resilience utilities the runtime and the transport crates share.
//!
//! - [`client`] — [`BusClient`], its lifecycle state machine, and the
//!   supervised background tasks that drive consumption.
//! - [`metrics`] — Prometheus counters and histograms for RPC calls,
//!   event traffic, schema operations, reconnects and resilience.
//! - [`retry`] — exponential backoff for transient transport failures.
//! - [`circuit_breaker`] — trip/recover logic for a failing dependency.

pub mod circuit_breaker;
pub mod client;
pub mod metrics;
pub mod retry;

pub use client::{BusClient, ClientError, ClientState};
