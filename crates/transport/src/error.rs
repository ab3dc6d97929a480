use thiserror::Error;
use url::Url;

/// Connectivity faults surfaced by transport operations.
///
/// These are explicit error kinds rather than exception-driven control flow:
/// the connection handler's reconnect policy and the publish-confirm layer
/// react to them, the transport layer itself never retries silently.
#[derive(Clone, Debug, Error)]
pub enum ConnectivityError {
    /// An action ran while the connection was not established.
    #[error("invalid connection to {uri}: {reason}")]
    InvalidConnection {
        /// The endpoint the action targeted.
        uri: String,
        /// Why the connection was considered invalid.
        reason: String,
    },

    /// The broker could not be reached.
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The channel closed underneath an operation.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// An in-flight operation was interrupted.
    #[error("operation interrupted: {0}")]
    Interrupted(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection handler was disposed.
    #[error("connection handler disposed")]
    Disposed,
}

impl ConnectivityError {
    /// An action ran while the connection was not established.
    pub fn invalid_connection(uri: &Url, reason: impl Into<String>) -> Self {
        Self::InvalidConnection {
            uri: uri.to_string(),
            reason: reason.into(),
        }
    }
}
