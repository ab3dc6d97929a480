use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use bytes::Bytes;
use hive_bus::address::EndpointAddress;
use hive_bus::message::CLIENT_MESSAGE_ID;
use tokio::sync::{broadcast, mpsc};

use crate::ConnectivityError;

/// Broker-level resolution of a published message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The broker accepted the message.
    Ack,
    /// The broker rejected the message.
    Nack,
}

/// A publisher-confirmation event delivered on a producer channel.
///
/// `multiple` means everything up to and including `delivery_tag` is
/// resolved, not just the single tag.
#[derive(Clone, Copy, Debug)]
pub struct ConfirmEvent {
    /// The channel publish sequence number being confirmed.
    pub delivery_tag: u64,
    /// Whether all tags up to and including this one are confirmed.
    pub multiple: bool,
    /// Ack or nack.
    pub outcome: ConfirmOutcome,
}

/// Properties attached to an outbound transport message.
#[derive(Clone, Debug, Default)]
pub struct MessageProperties {
    /// Transport-level message id.
    pub message_id: Option<String>,
    /// Whether the message survives a broker restart.
    pub persistent: bool,
    /// Per-message expiration in milliseconds.
    pub expiration_ms: Option<u64>,
    /// Content type of the body.
    pub content_type: Option<String>,
    /// Application headers.
    pub headers: HashMap<String, String>,
}

impl MessageProperties {
    /// The client message id header, if set.
    #[must_use]
    pub fn client_message_id(&self) -> Option<&str> {
        self.headers.get(CLIENT_MESSAGE_ID).map(String::as_str)
    }
}

/// An inbound message delivered on a consumer channel.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The channel delivery tag, used to acknowledge.
    pub delivery_tag: u64,
    /// Whether the broker flagged this delivery as a retry.
    pub redelivered: bool,
    /// Message properties.
    pub properties: MessageProperties,
    /// The payload.
    pub body: Bytes,
}

impl Delivery {
    /// A fingerprint stable across redeliveries of the same message, used
    /// for at-most-once dispatch tracking. Falls back to the delivery tag
    /// when the publisher set no message id.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.properties
            .message_id
            .clone()
            .unwrap_or_else(|| format!("tag-{}", self.delivery_tag))
    }
}

/// A broker channel: the unit of publishing, consuming, and confirm
/// tracking. Channels are opened from a [`Connection`] by bindings and torn
/// down when the binding unbinds.
#[async_trait]
pub trait Channel
where
    Self: Debug + Send + Sync + 'static,
{
    /// Puts the channel into publisher-confirm mode.
    async fn enable_confirms(&self) -> Result<(), ConnectivityError>;

    /// The sequence number the next publish on this channel will carry.
    fn next_publish_sequence(&self) -> u64;

    /// Publishes a message to the named destination.
    async fn publish(
        &self,
        destination: &str,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<(), ConnectivityError>;

    /// Subscribes to ack/nack events for publishes on this channel.
    fn confirm_events(&self) -> broadcast::Receiver<ConfirmEvent>;

    /// Declares the queue described by the address, with its durability,
    /// exclusivity, auto-delete, ttl, and mirroring options.
    async fn declare_queue(&self, address: &EndpointAddress) -> Result<(), ConnectivityError>;

    /// Starts consuming from the queue described by the address, honoring
    /// its prefetch setting.
    async fn consume(
        &self,
        address: &EndpointAddress,
    ) -> Result<mpsc::Receiver<Delivery>, ConnectivityError>;

    /// Acknowledges a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectivityError>;

    /// Closes the channel.
    async fn close(&self) -> Result<(), ConnectivityError>;
}

/// A single transport connection to a broker. Implementations are created
/// unconnected; the connection handler decides when to connect.
#[async_trait]
pub trait Connection
where
    Self: Debug + Send + Sync + 'static,
{
    /// The channel type opened on this connection.
    type Channel: Channel;

    /// Establishes the connection.
    async fn connect(&self) -> Result<(), ConnectivityError>;

    /// Tears the connection down.
    async fn disconnect(&self) -> Result<(), ConnectivityError>;

    /// Opens a new channel. Fails when not connected.
    async fn open_channel(&self) -> Result<Self::Channel, ConnectivityError>;
}

/// Receives resolved publisher confirmations from producer bindings. The
/// durability pipeline sits behind this seam.
#[async_trait]
pub trait ConfirmSink
where
    Self: Debug + Send + Sync + 'static,
{
    /// The broker acknowledged these client message ids.
    async fn record_success(&self, message_ids: Vec<String>);

    /// The broker rejected these client message ids, or their channel went
    /// away while they were pending.
    async fn record_failure(&self, message_ids: Vec<String>);
}
