//! Peer-to-peer subscription coordination: a control-bus protocol that keeps
//! every bus instance's local subscription table converged with its peers,
//! idempotently and without a central coordinator.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

/// Consumes wire-level protocol messages, applying the discard rules.
pub mod consumer;

/// Bridges subscription notifications into the local dispatcher.
pub mod connector;

/// Per-(message type, correlation) aggregation of peer interest.
pub mod endpoint_subscription;

/// Wire protocol messages and their envelope.
pub mod messages;

/// The authoritative peer and peer-subscription table.
pub mod peer_cache;

/// Emits this instance's own protocol messages onto the control bus.
pub mod producer;

/// The single-task router owning the peer table.
pub mod router;

pub use error::Error;
