use std::error::Error as StdError;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Marker trait for dispatcher errors.
pub trait DispatchError: StdError + Send + Sync + 'static {}

/// Describes one local subscription the dispatcher should serve: which
/// message type, an optional correlation discriminator, and the endpoint the
/// messages arrive on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionDescriptor {
    /// The message type name.
    pub message_name: String,
    /// Optional correlation-id discriminator for correlated subscriptions.
    pub correlation_id: Option<String>,
    /// The endpoint the subscription is served from.
    pub endpoint_uri: Url,
}

/// Handle returned by [`Dispatcher::connect_consumer`]; dropping it keeps the
/// subscription alive, calling [`Self::unsubscribe`] tears it down.
#[derive(Clone, Debug)]
pub struct UnsubscribeHandle {
    token: CancellationToken,
}

impl UnsubscribeHandle {
    /// Creates a handle from a cancellation token owned by the dispatcher.
    #[must_use]
    pub const fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Tears the subscription down.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    /// Whether the subscription has been torn down.
    #[must_use]
    pub fn is_unsubscribed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The external message dispatch pipeline. The bus core hands deserialized
/// messages to it and asks it to wire up consumers for coordinated
/// subscriptions; everything behind this seam (type-based consumer
/// invocation, selective consumers, saga correlation) is out of scope here.
#[async_trait]
pub trait Dispatcher
where
    Self: Debug + Send + Sync + 'static,
{
    /// The error type for dispatch operations.
    type Error: DispatchError;

    /// Connects a consumer for the described subscription, returning a
    /// handle that tears it down.
    async fn connect_consumer(
        &self,
        descriptor: SubscriptionDescriptor,
    ) -> Result<UnsubscribeHandle, Self::Error>;

    /// Dispatches an inbound message payload to its consumers.
    async fn dispatch(&self, message_name: &str, payload: Bytes) -> Result<(), Self::Error>;
}
