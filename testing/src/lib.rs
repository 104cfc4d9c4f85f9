//! # Mesh Bus Testing
//!
//! In-memory transport implementations for exercising `meshbus-core` and
//! `meshbus-runtime` without a live Redis instance.
//!
//! These are test doubles, not a production transport: spec.md §1 keeps
//! the reference bus's debug/direct transports out of scope as a
//! *production* bypass, but ambient test tooling is carried regardless
//! of that non-goal (see SPEC_FULL.md's ambient-stack section). Each
//! in-memory transport below implements the same
//! [`meshbus_core::transport`] traits the Redis transports do, so a test
//! can swap one for the other without touching the code under test.
//!
//! - [`event::InMemoryEventTransport`] — a consumer-grouped, ack/reclaim
//!   capable event transport backed by a `Vec` per stream rather than a
//!   Redis Stream.
//! - [`rpc::InMemoryRpcTransport`] / [`rpc::InMemoryResultTransport`] —
//!   call-queue and return-path halves of RPC, backed by in-process
//!   channels.
//! - [`schema::InMemorySchemaTransport`] — a plain `HashMap` schema
//!   store with TTL bookkeeping but no network round trip.

pub mod event;
pub mod rpc;
pub mod schema;

pub use event::InMemoryEventTransport;
pub use rpc::{InMemoryResultTransport, InMemoryRpcTransport};
pub use schema::InMemorySchemaTransport;
