//! End-to-end tests running the transport factory, connection handler, and
//! producer/consumer bindings over the in-memory broker.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hive_bus::address::EndpointAddress;
use hive_bus::message::ConfirmableMessage;
use hive_transport::connection::ConfirmSink;
use hive_transport::factory::{TransportFactory, TransportSettings};
use hive_transport::producer::ProducerSettings;
use hive_transport_memory::{ConfirmMode, MemoryBroker};

#[derive(Debug, Default)]
struct RecordingSink {
    successes: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

#[async_trait]
impl ConfirmSink for RecordingSink {
    async fn record_success(&self, message_ids: Vec<String>) {
        self.successes.lock().unwrap().extend(message_ids);
    }

    async fn record_failure(&self, message_ids: Vec<String>) {
        self.failures.lock().unwrap().extend(message_ids);
    }
}

fn address(name: &str) -> EndpointAddress {
    EndpointAddress::parse(&format!("rabbitmq://localhost/{name}")).unwrap()
}

fn settings() -> TransportSettings {
    TransportSettings {
        reconnect_delay: Duration::from_millis(20),
        producer: ProducerSettings {
            pending_confirm_timeout: Duration::from_millis(50),
            ..ProducerSettings::default()
        },
        dedup_window: 64,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn confirmed_publish_reports_success() {
    let broker = MemoryBroker::new();
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());

    let outbound = factory
        .build_outbound(address("orders"), sink.clone())
        .await;
    let message = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    outbound.send_confirmable(&message).await.unwrap();

    let id = message.id.clone();
    wait_until(|| sink.successes.lock().unwrap().contains(&id)).await;
    assert!(sink.failures.lock().unwrap().is_empty());
}

#[tokio::test]
async fn nacked_publish_reports_failure() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::NackEach);
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());

    let outbound = factory
        .build_outbound(address("orders"), sink.clone())
        .await;
    let message = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    outbound.send_confirmable(&message).await.unwrap();

    let id = message.id.clone();
    wait_until(|| sink.failures.lock().unwrap().contains(&id)).await;
}

#[tokio::test]
async fn batched_multiple_ack_confirms_every_pending_message() {
    let broker = MemoryBroker::new();
    broker.set_confirm_mode(ConfirmMode::AckMultipleEvery(3));
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());

    let outbound = factory
        .build_outbound(address("orders"), sink.clone())
        .await;
    let mut ids = Vec::new();
    for n in 0..3 {
        let message = ConfirmableMessage::new("OrderPlaced", Bytes::from(format!("{{\"n\":{n}}}")));
        ids.push(message.id.clone());
        outbound.send_confirmable(&message).await.unwrap();
    }

    wait_until(|| sink.successes.lock().unwrap().len() == 3).await;
    let mut confirmed = sink.successes.lock().unwrap().clone();
    confirmed.sort();
    ids.sort();
    assert_eq!(confirmed, ids);
}

#[tokio::test]
async fn failed_send_schedules_reconnect_and_recovers() {
    let broker = MemoryBroker::new();
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());
    let outbound = factory
        .build_outbound(address("orders"), sink.clone())
        .await;

    broker.set_publish_failures(true);
    let message = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    assert!(outbound.send_confirmable(&message).await.is_err());

    // The next send waits out the reconnect delay, rebinds, and succeeds.
    broker.set_publish_failures(false);
    let retry = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    outbound.send_confirmable(&retry).await.unwrap();

    let id = retry.id.clone();
    wait_until(|| sink.successes.lock().unwrap().contains(&id)).await;
}

#[tokio::test]
async fn close_releases_producer_and_consumer_bindings() {
    let broker = MemoryBroker::new();
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());

    let inbound = factory.build_inbound(address("orders")).await.unwrap();
    let outbound = factory
        .build_outbound(address("orders"), sink.clone())
        .await;

    let message = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    outbound.send_confirmable(&message).await.unwrap();
    let id = message.id.clone();
    wait_until(|| sink.successes.lock().unwrap().contains(&id)).await;

    outbound.close().await;
    inbound.close().await;

    // The producer channel is gone until a reconnect rebinds it.
    let late = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    assert!(outbound.send_confirmable(&late).await.is_err());
}

#[tokio::test]
async fn inbound_receives_published_messages_and_acks() {
    let broker = MemoryBroker::new();
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());

    let inbound = factory.build_inbound(address("orders")).await.unwrap();
    let outbound = factory.build_outbound(address("orders"), sink).await;

    let message = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{\"n\":1}"));
    outbound.send_confirmable(&message).await.unwrap();

    let delivery = inbound.receive().await.unwrap();
    assert_eq!(delivery.body, Bytes::from_static(b"{\"n\":1}"));
    assert_eq!(delivery.properties.message_id.as_deref(), Some(message.id.as_str()));

    inbound.ack(delivery.delivery_tag).await.unwrap();
    assert_eq!(broker.acked_tags(), vec![delivery.delivery_tag]);
}

#[tokio::test]
async fn duplicate_deliveries_are_acked_and_dropped() {
    let broker = MemoryBroker::new();
    let factory = TransportFactory::new(broker.connector(), settings());
    let sink = Arc::new(RecordingSink::default());

    let inbound = factory.build_inbound(address("orders")).await.unwrap();
    let outbound = factory.build_outbound(address("orders"), sink).await;

    // Two messages sharing one client id model a broker redelivery.
    let first = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));
    let duplicate = first.clone();
    let distinct = ConfirmableMessage::new("OrderPlaced", Bytes::from_static(b"{}"));

    outbound.send_confirmable(&first).await.unwrap();
    outbound.send_confirmable(&duplicate).await.unwrap();
    outbound.send_confirmable(&distinct).await.unwrap();

    let a = inbound.receive().await.unwrap();
    let b = inbound.receive().await.unwrap();

    assert_eq!(a.properties.message_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(b.properties.message_id.as_deref(), Some(distinct.id.as_str()));
    // The duplicate was acked on our behalf when it was filtered.
    wait_until(|| broker.acked_tags().len() == 1).await;
}
