use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::Error;
use crate::messages::{PeerSubscription, SubscriptionEnvelope, SubscriptionMessage, now_ms};

/// Transmits protocol envelopes onto the control bus. The confirm-tracked
/// outbound transport sits behind this seam.
#[async_trait]
pub trait ControlEndpoint
where
    Self: Debug + Send + Sync + 'static,
{
    /// Sends one envelope to every peer on the control bus.
    async fn send(&self, envelope: &SubscriptionEnvelope) -> Result<(), Error>;
}

/// Emits this instance's own subscription protocol messages: an `AddPeer`
/// announcement on start, add/remove subscription messages carrying
/// monotonically increasing message numbers, and a `RemovePeer` on
/// completion.
#[derive(Debug)]
pub struct SubscriptionMessageProducer {
    peer_id: Uuid,
    peer_uri: Url,
    network: String,
    endpoint: Arc<dyn ControlEndpoint>,
    message_number: AtomicU64,
}

impl SubscriptionMessageProducer {
    /// Creates a producer announcing as the given peer identity.
    #[must_use]
    pub fn new(
        peer_id: Uuid,
        peer_uri: Url,
        network: impl Into<String>,
        endpoint: Arc<dyn ControlEndpoint>,
    ) -> Self {
        Self {
            peer_id,
            peer_uri,
            network: network.into(),
            endpoint,
            message_number: AtomicU64::new(1),
        }
    }

    /// Announces this peer to the network.
    ///
    /// # Errors
    ///
    /// Returns the endpoint's send failure.
    pub async fn start(&self) -> Result<(), Error> {
        info!(peer_id = %self.peer_id, "announcing peer");
        self.transmit(SubscriptionMessage::AddPeer {
            peer_id: self.peer_id,
            peer_uri: self.peer_uri.clone(),
            timestamp_ms: now_ms(),
        })
        .await
    }

    /// Broadcasts that this peer gained interest in a message type.
    ///
    /// # Errors
    ///
    /// Returns the endpoint's send failure.
    pub async fn add_subscription(
        &self,
        subscription_id: Uuid,
        message_name: &str,
        correlation_id: Option<&str>,
        endpoint_uri: &Url,
    ) -> Result<(), Error> {
        let subscription =
            self.subscription(subscription_id, message_name, correlation_id, endpoint_uri);
        self.transmit(SubscriptionMessage::AddPeerSubscription(subscription))
            .await
    }

    /// Broadcasts that this peer lost interest in a message type.
    ///
    /// # Errors
    ///
    /// Returns the endpoint's send failure.
    pub async fn remove_subscription(
        &self,
        subscription_id: Uuid,
        message_name: &str,
        correlation_id: Option<&str>,
        endpoint_uri: &Url,
    ) -> Result<(), Error> {
        let subscription =
            self.subscription(subscription_id, message_name, correlation_id, endpoint_uri);
        self.transmit(SubscriptionMessage::RemovePeerSubscription(subscription))
            .await
    }

    /// Announces this peer's departure.
    ///
    /// # Errors
    ///
    /// Returns the endpoint's send failure.
    pub async fn complete(&self) -> Result<(), Error> {
        info!(peer_id = %self.peer_id, "announcing peer departure");
        self.transmit(SubscriptionMessage::RemovePeer {
            peer_id: self.peer_id,
            peer_uri: self.peer_uri.clone(),
            timestamp_ms: now_ms(),
        })
        .await
    }

    fn subscription(
        &self,
        subscription_id: Uuid,
        message_name: &str,
        correlation_id: Option<&str>,
        endpoint_uri: &Url,
    ) -> PeerSubscription {
        PeerSubscription {
            peer_id: self.peer_id,
            subscription_id,
            message_number: self.message_number.fetch_add(1, Ordering::SeqCst),
            endpoint_uri: endpoint_uri.clone(),
            message_name: message_name.to_string(),
            correlation_id: correlation_id.map(ToString::to_string),
        }
    }

    async fn transmit(&self, message: SubscriptionMessage) -> Result<(), Error> {
        let envelope = SubscriptionEnvelope {
            network: self.network.clone(),
            source: self.peer_uri.clone(),
            message,
        };
        self.endpoint.send(&envelope).await
    }
}
