use thiserror::Error as ThisError;

/// Errors raised by the subscription coordination layer.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A protocol envelope could not be encoded or decoded.
    #[error("subscription envelope codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// The router task is no longer accepting commands.
    #[error("subscription router is not running")]
    RouterStopped,

    /// The router did not drain within the shutdown bound.
    #[error("subscription router shutdown timed out")]
    ShutdownTimeout,

    /// The control endpoint could not transmit a protocol message.
    #[error("control endpoint send failed: {0}")]
    Endpoint(String),
}
