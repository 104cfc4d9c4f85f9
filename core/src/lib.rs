//! # Mesh Bus Core
//!
//! Transport-agnostic types and traits for the mesh bus client runtime: a
//! message bus that unifies request/response RPC and consumer-group
//! event streaming over a pluggable transport abstraction.
//!
//! A process that hosts the bus exposes named APIs ([`api::Api`])
//! composed of RPC procedures and events; peer processes invoke those
//! procedures ([`transport::RpcTransport`]) and subscribe to those events
//! ([`transport::EventTransport`]) by hierarchical name
//! (`auth.user_created`). This crate defines the message types, the
//! serialization strategies, the four transport capabilities, the
//! transport registry that resolves an API to a transport instance, the
//! schema registry, and the plugin hook pipeline. Concrete transports
//! (Redis Streams, Redis lists) live in `meshbus-redis`; the client
//! lifecycle that wires all of this together lives in `meshbus-runtime`.
//!
//! ## Module map
//!
//! - [`message`] — `RpcMessage`, `ResultMessage`, `EventMessage`.
//! - [`serializer`] — stream field-dictionary encode/decode strategies.
//! - [`transport`] — the four pluggable capabilities.
//! - [`registry`] — API → transport resolution with `default` fallback.
//! - [`schema`] — the distributed, TTL-refreshed schema store.
//! - [`plugin`] — the ordered hook pipeline.
//! - [`config`] — the typed configuration surface.
//! - [`api`] — declaring an API's procedures and events.
//! - [`error`] — the cross-cutting [`error::BusError`] type.

pub mod api;
pub mod config;
pub mod error;
pub mod message;
pub mod plugin;
pub mod registry;
pub mod schema;
pub mod serializer;
pub mod transport;

pub use error::{BusError, BusResult};
pub use message::{EventMessage, Kwargs, ResultMessage, RpcMessage, StreamId};
