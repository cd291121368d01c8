//! Transport-free distributed mutual-exclusion engine: leader election
//! plus a replicated Bakery Algorithm (Lamport, 1974) over a ticket store.
//!
//! This crate has no network code; `lockd-server` wires it to gRPC and
//! `lockd-client` consumes its wire message types from the other side.

pub mod cache;
pub mod elector;
pub mod engine;
pub mod error;
pub mod messages;
pub mod node;
pub mod readiness;
pub mod store;
pub mod store_memory;
pub mod ticket;
pub mod timer;
pub mod transport;

pub use engine::Engine;
pub use error::{LockdError, Result};
