//! In-memory broker transport. Queues, deliveries, and publisher confirms
//! all live inside one process, with configurable confirm behavior and
//! fault injection for exercising the resilience paths.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use hive_bus::address::EndpointAddress;
use hive_transport::ConnectivityError;
use hive_transport::connection::{
    Channel, ConfirmEvent, ConfirmOutcome, Connection, Delivery, MessageProperties,
};
use hive_transport::factory::Connector;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// How the broker resolves publisher confirms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmMode {
    /// Ack every publish individually.
    AckEach,
    /// Ack with `multiple` set once every `n` publishes, confirming the
    /// whole batch at once.
    AckMultipleEvery(u64),
    /// Nack every publish individually.
    NackEach,
    /// Never emit confirms, leaving every publish pending.
    DropConfirms,
}

#[derive(Debug, Default)]
struct QueueState {
    declared: bool,
    backlog: VecDeque<Delivery>,
    consumer: Option<mpsc::Sender<Delivery>>,
    next_delivery_tag: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    acked_tags: Vec<u64>,
}

/// An instance-scoped in-memory broker. Connections created from the same
/// broker share its queues; separate brokers are fully isolated.
#[derive(Clone, Debug)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    confirm_mode: Arc<Mutex<ConfirmMode>>,
    fail_publishes: Arc<AtomicBool>,
    fail_connects: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Creates an empty broker that acks every publish.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            confirm_mode: Arc::new(Mutex::new(ConfirmMode::AckEach)),
            fail_publishes: Arc::new(AtomicBool::new(false)),
            fail_connects: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A connector producing connections against this broker.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Changes how subsequent publishes are confirmed.
    pub fn set_confirm_mode(&self, mode: ConfirmMode) {
        *self.confirm_mode.lock().unwrap() = mode;
    }

    /// Makes every subsequent publish fail with a connectivity error.
    pub fn set_publish_failures(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent connect attempt fail.
    pub fn set_connect_failures(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }

    /// Delivery tags acknowledged so far, across all queues.
    #[must_use]
    pub fn acked_tags(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked_tags.clone()
    }

    /// Number of messages sitting in the named queue with no consumer.
    #[must_use]
    pub fn backlog_len(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    fn confirm_mode(&self) -> ConfirmMode {
        *self.confirm_mode.lock().unwrap()
    }

    fn route(&self, destination: &str, properties: MessageProperties, body: Bytes) {
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.entry(destination.to_string()).or_default();
        queue.next_delivery_tag += 1;
        let delivery = Delivery {
            delivery_tag: queue.next_delivery_tag,
            redelivered: false,
            properties,
            body,
        };

        if let Some(consumer) = &queue.consumer {
            match consumer.try_send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(delivery)
                | mpsc::error::TrySendError::Closed(delivery)) => {
                    queue.backlog.push_back(delivery);
                }
            }
        } else {
            queue.backlog.push_back(delivery);
        }
    }

    fn declare(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.queues.entry(name.to_string()).or_default().declared = true;
    }

    fn attach_consumer(&self, name: &str, capacity: usize) -> mpsc::Receiver<Delivery> {
        let (sender, receiver) = mpsc::channel(capacity);
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.entry(name.to_string()).or_default();
        while let Some(delivery) = queue.backlog.pop_front() {
            if let Err(mpsc::error::TrySendError::Full(delivery)) = sender.try_send(delivery) {
                queue.backlog.push_front(delivery);
                break;
            }
        }
        queue.consumer = Some(sender);
        receiver
    }

    fn record_ack(&self, delivery_tag: u64) {
        self.state.lock().unwrap().acked_tags.push(delivery_tag);
    }
}

/// Builds [`MemoryConnection`]s against one shared broker.
#[derive(Debug)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn create(&self, address: &EndpointAddress) -> MemoryConnection {
        debug!(uri = %address.uri(), "creating in-memory connection");
        MemoryConnection {
            broker: self.broker.clone(),
            connected: AtomicBool::new(false),
        }
    }
}

/// A connection into an in-memory broker.
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    connected: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<(), ConnectivityError> {
        if self.broker.fail_connects.load(Ordering::SeqCst) {
            return Err(ConnectivityError::Unreachable(
                "in-memory broker refusing connections".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ConnectivityError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn open_channel(&self) -> Result<MemoryChannel, ConnectivityError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConnectivityError::ChannelClosed(
                "connection not established".to_string(),
            ));
        }
        let (confirm_sender, _) = broadcast::channel(256);
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            sequence: AtomicU64::new(1),
            confirms_enabled: AtomicBool::new(false),
            confirm_sender,
        })
    }
}

/// A channel on an in-memory connection.
#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    sequence: AtomicU64,
    confirms_enabled: AtomicBool,
    confirm_sender: broadcast::Sender<ConfirmEvent>,
}

impl MemoryChannel {
    fn emit_confirm(&self, delivery_tag: u64) {
        if !self.confirms_enabled.load(Ordering::SeqCst) {
            return;
        }
        let event = match self.broker.confirm_mode() {
            ConfirmMode::AckEach => ConfirmEvent {
                delivery_tag,
                multiple: false,
                outcome: ConfirmOutcome::Ack,
            },
            ConfirmMode::AckMultipleEvery(n) => {
                if n == 0 || delivery_tag % n != 0 {
                    return;
                }
                ConfirmEvent {
                    delivery_tag,
                    multiple: true,
                    outcome: ConfirmOutcome::Ack,
                }
            }
            ConfirmMode::NackEach => ConfirmEvent {
                delivery_tag,
                multiple: false,
                outcome: ConfirmOutcome::Nack,
            },
            ConfirmMode::DropConfirms => return,
        };
        let _ = self.confirm_sender.send(event);
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn enable_confirms(&self) -> Result<(), ConnectivityError> {
        self.confirms_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn next_publish_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        destination: &str,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<(), ConnectivityError> {
        if self.broker.fail_publishes.load(Ordering::SeqCst) {
            return Err(ConnectivityError::Unreachable(
                "in-memory broker rejecting publishes".to_string(),
            ));
        }
        let delivery_tag = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.broker.route(destination, properties, body);
        self.emit_confirm(delivery_tag);
        Ok(())
    }

    fn confirm_events(&self) -> broadcast::Receiver<ConfirmEvent> {
        self.confirm_sender.subscribe()
    }

    async fn declare_queue(&self, address: &EndpointAddress) -> Result<(), ConnectivityError> {
        self.broker.declare(address.name());
        Ok(())
    }

    async fn consume(
        &self,
        address: &EndpointAddress,
    ) -> Result<mpsc::Receiver<Delivery>, ConnectivityError> {
        let capacity = usize::from(address.prefetch()).max(1);
        Ok(self.broker.attach_consumer(address.name(), capacity))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConnectivityError> {
        self.broker.record_ack(delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectivityError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(name: &str) -> EndpointAddress {
        EndpointAddress::parse(&format!("rabbitmq://localhost/{name}")).unwrap()
    }

    #[tokio::test]
    async fn publishes_reach_an_attached_consumer() {
        let broker = MemoryBroker::new();
        let connection = broker.connector().create(&address("orders"));
        connection.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        channel.declare_queue(&address("orders")).await.unwrap();
        let mut deliveries = channel.consume(&address("orders")).await.unwrap();

        channel
            .publish("orders", MessageProperties::default(), Bytes::from_static(b"hi"))
            .await
            .unwrap();

        let delivery = deliveries.recv().await.unwrap();
        assert_eq!(delivery.body, Bytes::from_static(b"hi"));
        assert_eq!(delivery.delivery_tag, 1);
    }

    #[tokio::test]
    async fn backlog_drains_when_consumer_attaches() {
        let broker = MemoryBroker::new();
        let connection = broker.connector().create(&address("orders"));
        connection.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        channel
            .publish("orders", MessageProperties::default(), Bytes::from_static(b"a"))
            .await
            .unwrap();
        assert_eq!(broker.backlog_len("orders"), 1);

        let mut deliveries = channel.consume(&address("orders")).await.unwrap();
        assert_eq!(deliveries.recv().await.unwrap().body, Bytes::from_static(b"a"));
        assert_eq!(broker.backlog_len("orders"), 0);
    }

    #[tokio::test]
    async fn confirm_modes_shape_events() {
        let broker = MemoryBroker::new();
        broker.set_confirm_mode(ConfirmMode::AckMultipleEvery(2));
        let connection = broker.connector().create(&address("q"));
        connection.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel.enable_confirms().await.unwrap();
        let mut events = channel.confirm_events();

        for _ in 0..2 {
            channel
                .publish("q", MessageProperties::default(), Bytes::new())
                .await
                .unwrap();
        }

        let event = events.recv().await.unwrap();
        assert_eq!(event.delivery_tag, 2);
        assert!(event.multiple);
        assert_eq!(event.outcome, ConfirmOutcome::Ack);
    }

    #[tokio::test]
    async fn publish_failures_can_be_injected() {
        let broker = MemoryBroker::new();
        broker.set_publish_failures(true);
        let connection = broker.connector().create(&address("q"));
        connection.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();

        let result = channel
            .publish("q", MessageProperties::default(), Bytes::new())
            .await;
        assert!(matches!(result, Err(ConnectivityError::Unreachable(_))));
    }

    #[tokio::test]
    async fn open_channel_requires_connect() {
        let broker = MemoryBroker::new();
        let connection = broker.connector().create(&address("q"));

        let result = connection.open_channel().await;
        assert!(matches!(result, Err(ConnectivityError::ChannelClosed(_))));
    }
}
