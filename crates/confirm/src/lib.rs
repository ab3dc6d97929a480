//! Publisher-confirm durability: tracks in-flight publishes, buffers under
//! backpressure, persists to a backing store while the broker is down, and
//! replays everything on recovery.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

/// Durable repositories for unconfirmed messages.
pub mod backing_store;

/// The pending-confirmation table.
pub mod confirmer;

/// The outbound endpoint seam toward the transport.
pub mod endpoint;

/// The publisher with its circuit breaker and recovery sweep.
pub mod publisher;

/// Publish tuning settings and their validation.
pub mod settings;

pub use error::Error;
