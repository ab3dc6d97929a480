use thiserror::Error as ThisError;

/// Errors raised by the publish-confirm durability layer.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Settings validation failed; the message lists every problem found.
    #[error("invalid publish settings:\n{0}")]
    InvalidSettings(String),

    /// The backing store could not be read or written.
    #[error("backing store failure: {0}")]
    Storage(#[from] std::io::Error),

    /// A stored message could not be serialized or deserialized.
    #[error("stored message codec failure: {0}")]
    Codec(#[from] serde_json::Error),

    /// The publish endpoint could not transmit.
    #[error("publish endpoint failure: {0}")]
    Endpoint(String),
}
