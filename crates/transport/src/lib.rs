//! Policy-driven connection handling, channel bindings, and publisher
//! confirmation tracking over a pluggable broker transport.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

/// The pluggable broker connection and channel traits.
pub mod connection;

/// Consumer-side channel binding.
pub mod consumer;

/// Transport factory and the inbound/outbound transport wrappers.
pub mod factory;

/// Policy-driven connection handling.
pub mod handler;

/// Producer-side channel binding with publisher-confirm tracking.
pub mod producer;

pub use error::ConnectivityError;
