use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use hive_bus::address::{ConnectionId, EndpointAddress};
use hive_bus::message::{CLIENT_MESSAGE_ID, ConfirmableMessage, MESSAGE_NAME};
use tokio::sync::{Mutex, OnceCell, mpsc};
use tracing::{debug, info, warn};

use crate::ConnectivityError;
use crate::connection::{ConfirmSink, Connection, Delivery, MessageProperties};
use crate::consumer::ConsumerBinding;
use crate::handler::{ConnectionBinding, ConnectionHandler};
use crate::producer::{ProducerBinding, ProducerSettings};

/// Creates unconnected transport connections for endpoint addresses. The
/// factory calls this once per distinct broker identity and caches the
/// resulting connection handler.
pub trait Connector
where
    Self: Debug + Send + Sync + 'static,
{
    /// The connection type produced.
    type Connection: Connection;

    /// Builds an unconnected connection for the addressed broker.
    fn create(&self, address: &EndpointAddress) -> Self::Connection;
}

/// Transport-wide tuning knobs.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    /// How long a failed connection sits out before actions reconnect it.
    pub reconnect_delay: Duration,
    /// Producer binding settings.
    pub producer: ProducerSettings,
    /// How many delivery fingerprints the inbound duplicate filter retains.
    pub dedup_window: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
            producer: ProducerSettings::default(),
            dedup_window: 1024,
        }
    }
}

type HandlerCache<C> = Mutex<HashMap<ConnectionId, Arc<ConnectionHandler<C>>>>;

/// Builds inbound and outbound transports, sharing one connection handler
/// per broker identity and direction. Inbound and outbound traffic never
/// share a connection, so a consumer flooding the socket cannot stall
/// publish confirmations.
#[derive(Debug)]
pub struct TransportFactory<Cn>
where
    Cn: Connector,
{
    connector: Cn,
    settings: TransportSettings,
    inbound: HandlerCache<Cn::Connection>,
    outbound: HandlerCache<Cn::Connection>,
}

impl<Cn> TransportFactory<Cn>
where
    Cn: Connector,
{
    /// Creates a factory over the given connector.
    #[must_use]
    pub fn new(connector: Cn, settings: TransportSettings) -> Self {
        Self {
            connector,
            settings,
            inbound: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
        }
    }

    /// Builds an outbound transport for the addressed destination. The
    /// underlying connection is established lazily on first send.
    pub async fn build_outbound(
        &self,
        address: EndpointAddress,
        sink: Arc<dyn ConfirmSink>,
    ) -> OutboundTransport<Cn::Connection> {
        let handler = self.handler_for(&self.outbound, &address).await;
        OutboundTransport {
            address,
            reconnect_delay: self.settings.reconnect_delay,
            producer_settings: self.settings.producer.clone(),
            sink,
            handler,
            producer: OnceCell::new(),
        }
    }

    /// Builds an inbound transport for the addressed queue, declaring it and
    /// starting consumption immediately.
    ///
    /// # Errors
    ///
    /// Returns the connect, declare, or consume failure.
    pub async fn build_inbound(
        &self,
        address: EndpointAddress,
    ) -> Result<InboundTransport<Cn::Connection>, ConnectivityError> {
        let handler = self.handler_for(&self.inbound, &address).await;

        let capacity = usize::from(address.prefetch()).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let binding = Arc::new(ConsumerBinding::new(address.clone(), sender));
        let as_binding: Arc<dyn ConnectionBinding<Cn::Connection>> = binding.clone();
        handler.add_binding(as_binding).await?;
        handler.connect().await?;

        info!(queue = address.name(), "inbound transport ready");
        Ok(InboundTransport {
            address,
            handler,
            binding,
            deliveries: Mutex::new(receiver),
            seen: StdMutex::new(SeenSet::new(self.settings.dedup_window)),
        })
    }

    /// Disposes every cached connection handler, inbound and outbound.
    pub async fn dispose(&self) {
        for cache in [&self.inbound, &self.outbound] {
            let handlers: Vec<_> = cache.lock().await.drain().map(|(_, h)| h).collect();
            for handler in handlers {
                handler.dispose().await;
            }
        }
    }

    async fn handler_for(
        &self,
        cache: &HandlerCache<Cn::Connection>,
        address: &EndpointAddress,
    ) -> Arc<ConnectionHandler<Cn::Connection>> {
        let mut cache = cache.lock().await;
        if let Some(handler) = cache.get(address.connection_id()) {
            return Arc::clone(handler);
        }
        let handler = Arc::new(ConnectionHandler::new(self.connector.create(address)));
        cache.insert(address.connection_id().clone(), Arc::clone(&handler));
        handler
    }
}

/// A send-side transport for one destination. Adds its producer binding on
/// first use and pushes a reconnect policy onto the shared connection
/// handler whenever a send hits a connectivity fault.
#[derive(Debug)]
pub struct OutboundTransport<C>
where
    C: Connection,
{
    address: EndpointAddress,
    reconnect_delay: Duration,
    producer_settings: ProducerSettings,
    sink: Arc<dyn ConfirmSink>,
    handler: Arc<ConnectionHandler<C>>,
    producer: OnceCell<Arc<ProducerBinding<C>>>,
}

impl<C> OutboundTransport<C>
where
    C: Connection,
{
    /// The destination address.
    #[must_use]
    pub const fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Sends a raw message to the destination.
    ///
    /// # Errors
    ///
    /// Returns the connectivity fault. A reconnect is scheduled before the
    /// error is returned, so the caller's retry waits out the delay.
    pub async fn send(
        &self,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<(), ConnectivityError> {
        let producer = self.producer_binding().await?;
        let destination = self.address.name();

        let result = self
            .handler
            .with_connection(|_connection| async move {
                producer.publish(destination, properties, body).await
            })
            .await;

        if let Err(error) = &result {
            if !matches!(error, ConnectivityError::Disposed) {
                warn!(%error, uri = %self.address.uri(), "send failed, scheduling reconnect");
                self.handler.force_reconnect(self.reconnect_delay).await;
            }
        }
        result
    }

    /// Sends a confirm-tracked message: persistent, carrying its client
    /// message id both as the transport message id and as a header, so the
    /// broker's confirm resolves back to it.
    ///
    /// # Errors
    ///
    /// Returns the connectivity fault, as for [`Self::send`].
    pub async fn send_confirmable(
        &self,
        message: &ConfirmableMessage,
    ) -> Result<(), ConnectivityError> {
        let mut properties = MessageProperties {
            message_id: Some(message.id.clone()),
            persistent: true,
            expiration_ms: self.address.ttl_ms().map(u64::from),
            content_type: Some("application/json".to_string()),
            headers: HashMap::new(),
        };
        properties
            .headers
            .insert(CLIENT_MESSAGE_ID.to_string(), message.id.clone());
        properties
            .headers
            .insert(MESSAGE_NAME.to_string(), message.message_name.clone());

        self.send(properties, message.body.clone()).await
    }

    /// Unbinds the producer, draining pending confirms first.
    pub async fn close(&self) {
        if let Some(producer) = self.producer.get() {
            let as_binding: Arc<dyn ConnectionBinding<C>> = producer.clone();
            self.handler.remove_binding(&as_binding).await;
        }
    }

    async fn producer_binding(&self) -> Result<Arc<ProducerBinding<C>>, ConnectivityError> {
        self.producer
            .get_or_try_init(|| async {
                let binding = Arc::new(ProducerBinding::new(
                    self.address.clone(),
                    self.producer_settings.clone(),
                    Arc::clone(&self.sink),
                ));
                let as_binding: Arc<dyn ConnectionBinding<C>> = binding.clone();
                self.handler.add_binding(as_binding).await?;
                Ok(binding)
            })
            .await
            .map(Arc::clone)
    }
}

/// A receive-side transport for one queue. Deliveries are deduplicated by
/// fingerprint across redeliveries; duplicates are acknowledged and dropped
/// before the caller sees them.
#[derive(Debug)]
pub struct InboundTransport<C>
where
    C: Connection,
{
    address: EndpointAddress,
    handler: Arc<ConnectionHandler<C>>,
    binding: Arc<ConsumerBinding<C>>,
    deliveries: Mutex<mpsc::Receiver<Delivery>>,
    seen: StdMutex<SeenSet>,
}

impl<C> InboundTransport<C>
where
    C: Connection,
{
    /// The queue address.
    #[must_use]
    pub const fn address(&self) -> &EndpointAddress {
        &self.address
    }

    /// Receives the next non-duplicate delivery, or `None` once the
    /// underlying consumer stream ends.
    pub async fn receive(&self) -> Option<Delivery> {
        loop {
            let delivery = self.deliveries.lock().await.recv().await?;
            let fingerprint = delivery.fingerprint();
            if self.seen.lock().unwrap().insert(fingerprint.clone()) {
                return Some(delivery);
            }

            debug!(%fingerprint, "duplicate delivery discarded");
            if let Err(error) = self.binding.ack(delivery.delivery_tag).await {
                warn!(%error, "failed to ack duplicate delivery");
            }
        }
    }

    /// Acknowledges a delivery previously returned by [`Self::receive`].
    ///
    /// # Errors
    ///
    /// Returns the channel's ack failure.
    pub async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectivityError> {
        self.binding.ack(delivery_tag).await
    }

    /// Stops consuming and releases the channel.
    pub async fn close(&self) {
        let as_binding: Arc<dyn ConnectionBinding<C>> = self.binding.clone();
        self.handler.remove_binding(&as_binding).await;
    }
}

/// A bounded first-seen filter over delivery fingerprints.
#[derive(Debug)]
struct SeenSet {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashSet<String>,
}

impl SeenSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashSet::new(),
        }
    }

    /// Returns `true` when the fingerprint was not seen within the window.
    fn insert(&mut self, fingerprint: String) -> bool {
        if self.entries.contains(&fingerprint) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
        self.order.push_back(fingerprint.clone());
        self.entries.insert(fingerprint);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_set_reports_first_occurrence_only() {
        let mut seen = SeenSet::new(8);
        assert!(seen.insert("a".to_string()));
        assert!(!seen.insert("a".to_string()));
        assert!(seen.insert("b".to_string()));
    }

    #[test]
    fn seen_set_evicts_oldest_at_capacity() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert("a".to_string()));
        assert!(seen.insert("b".to_string()));
        assert!(seen.insert("c".to_string()));

        // "a" fell out of the window and counts as new again.
        assert!(seen.insert("a".to_string()));
        assert!(!seen.insert("c".to_string()));
    }

    #[test]
    fn default_settings_are_sane() {
        let settings = TransportSettings::default();
        assert_eq!(settings.reconnect_delay, Duration::from_secs(10));
        assert!(settings.producer.confirms);
        assert!(settings.dedup_window >= 1);
    }
}
