//! AMQP 0.9.1 broker transport backed by `lapin`. Maps the transport
//! connection and channel traits onto real broker connections, including
//! queue declaration arguments, consumer prefetch, and publisher confirms.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;

pub use connection::{AmqpChannel, AmqpConnection, AmqpConnector};
