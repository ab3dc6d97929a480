use std::error::Error as StdError;
use std::fmt::Debug;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Header carried on outbound transport messages to correlate broker-level
/// confirm sequence numbers back to application-level message identity.
pub const CLIENT_MESSAGE_ID: &str = "ClientMessageId";

/// Header carrying the declared message type name of the payload.
pub const MESSAGE_NAME: &str = "MessageName";

/// A typed bus payload: convertible to and from raw bytes, with a stable
/// message name used for routing and subscription coordination.
pub trait BusMessage<D, S>
where
    Self: Clone + Debug + Send + Sync + TryFrom<Bytes, Error = D> + TryInto<Bytes, Error = S> + 'static,
    D: Debug + StdError + Send + Sync + 'static,
    S: Debug + StdError + Send + Sync + 'static,
{
    /// The stable name of this message type on the wire.
    fn message_name() -> &'static str;
}

/// An outbound message tracked through the publish-confirm durability
/// pipeline by a globally unique client-assigned id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfirmableMessage {
    /// Client-assigned unique id.
    pub id: String,
    /// The declared message type name.
    pub message_name: String,
    /// The serialized payload.
    pub body: Bytes,
}

impl ConfirmableMessage {
    /// Wraps a serialized payload with a freshly assigned client message id.
    #[must_use]
    pub fn new(message_name: impl Into<String>, body: Bytes) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_name: message_name.into(),
            body,
        }
    }

    /// Wraps a typed payload, serializing it through its byte conversion.
    ///
    /// # Errors
    ///
    /// Returns the payload's serialization error.
    pub fn from_message<T, D, S>(message: T) -> Result<Self, S>
    where
        T: BusMessage<D, S>,
        D: Debug + StdError + Send + Sync + 'static,
        S: Debug + StdError + Send + Sync + 'static,
    {
        Ok(Self::new(T::message_name(), message.try_into()?))
    }
}
