//! Core types and collaborator boundaries for the hive message bus.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Endpoint addresses and connection identity.
pub mod address;

/// The external message dispatcher boundary.
pub mod dispatcher;

/// Confirmable messages and typed payloads.
pub mod message;
