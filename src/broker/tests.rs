use futures::StreamExt;

use super::topic::{Binding, topic_matches};
use super::{Connector, MemoryBroker, PublishMessage, PublishOutcome};
use crate::utils::error::BrokerError;

fn message(topic: &str, body: &str) -> PublishMessage {
    PublishMessage::new(topic, body.as_bytes().to_vec())
}

fn broker_with_queue(queue: &str, routing_key: &str) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.declare_exchange("pipeline.messages");
    broker.declare_queue(queue);
    broker
        .bind_queue(queue, "pipeline.messages", routing_key)
        .unwrap();
    broker
}

#[test]
fn test_topic_exact_match() {
    assert!(topic_matches("decode", "decode"));
    assert!(!topic_matches("decode", "store"));
    assert!(!topic_matches("decode", "decode.extra"));
}

#[test]
fn test_topic_wildcards() {
    assert!(topic_matches("worker.*", "worker.ttn"));
    assert!(!topic_matches("worker.*", "worker"));
    assert!(!topic_matches("worker.*", "worker.ttn.v1"));
    assert!(topic_matches("worker.#", "worker"));
    assert!(topic_matches("worker.#", "worker.ttn.v1"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(topic_matches("*.errors", "storage.errors"));
}

#[test]
fn test_binding_routes_only_its_exchange() {
    let binding = Binding::new("pipeline.messages", "worker_store", "store");
    assert!(binding.routes("pipeline.messages", "store"));
    assert!(!binding.routes("other", "store"));
}

#[test]
fn test_publish_without_binding_is_unroutable() {
    let broker = broker_with_queue("worker_store", "store");
    let outcome = broker
        .publish("pipeline.messages", &message("nowhere", "{}"))
        .unwrap();
    assert_eq!(outcome, PublishOutcome::Unroutable);
    assert_eq!(broker.queue_depth("worker_store"), 0);
}

#[test]
fn test_publish_to_unknown_exchange_fails() {
    let broker = MemoryBroker::new();
    let result = broker.publish("missing", &message("store", "{}"));
    assert!(matches!(result, Err(BrokerError::Channel(_))));
}

#[test]
fn test_bind_requires_declared_queue() {
    let broker = MemoryBroker::new();
    broker.declare_exchange("pipeline.messages");
    assert!(broker.bind_queue("nope", "pipeline.messages", "store").is_err());
}

#[test]
fn test_published_message_waits_in_queue() {
    let broker = broker_with_queue("worker_store", "store");
    broker
        .publish(
            "pipeline.messages",
            &message("store", "hello").with_message_id("trace-1"),
        )
        .unwrap();

    assert_eq!(broker.queue_depth("worker_store"), 1);
    let ready = broker.take_ready("worker_store");
    assert_eq!(ready[0].body, b"hello");
    assert_eq!(ready[0].message_id.as_deref(), Some("trace-1"));
    assert!(!ready[0].redelivered);
}

#[tokio::test]
async fn test_unreachable_broker_fails_dial() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    assert!(matches!(broker.connect().await, Err(BrokerError::Dial(_))));

    broker.set_reachable(true);
    assert!(broker.connect().await.is_ok());
    assert_eq!(broker.open_connections(), 1);
}

#[tokio::test]
async fn test_consume_ack_removes_message() {
    let broker = broker_with_queue("worker_store", "store");
    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    let mut stream = channel.consume("worker_store").await.unwrap();

    broker
        .publish("pipeline.messages", &message("store", "m1"))
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();
    assert_eq!(delivery.body, b"m1");
    assert_eq!(delivery.routing_key, "store");
    assert_eq!(broker.unacked_count(), 1);

    delivery.ack().await.unwrap();
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("worker_store"), 0);
    assert!(matches!(
        delivery.ack().await,
        Err(BrokerError::UnknownDeliveryTag(_))
    ));
}

#[tokio::test]
async fn test_nack_requeue_marks_redelivered() {
    let broker = broker_with_queue("worker_store", "store");
    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    let mut stream = channel.consume("worker_store").await.unwrap();

    broker
        .publish("pipeline.messages", &message("store", "retry me"))
        .unwrap();
    let first = stream.next().await.unwrap().unwrap();
    assert!(!first.redelivered);
    first.nack(true).await.unwrap();

    let second = stream.next().await.unwrap().unwrap();
    assert!(second.redelivered);
    assert_eq!(second.body, b"retry me");

    second.nack(false).await.unwrap();
    let dead = broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"retry me");
    assert_eq!(broker.queue_depth("worker_store"), 0);
}

#[tokio::test]
async fn test_prefetch_limits_in_flight_deliveries() {
    let broker = broker_with_queue("worker_store", "store");
    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel.set_prefetch(1).await.unwrap();
    let mut stream = channel.consume("worker_store").await.unwrap();

    for body in ["a", "b"] {
        broker
            .publish("pipeline.messages", &message("store", body))
            .unwrap();
    }
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(broker.unacked_count(), 1);
    assert_eq!(broker.queue_depth("worker_store"), 1);

    first.ack().await.unwrap();
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(second.body, b"b");
}

#[tokio::test]
async fn test_sever_requeues_unacked_and_ends_streams() {
    let broker = broker_with_queue("worker_store", "store");
    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    let mut stream = channel.consume("worker_store").await.unwrap();

    broker
        .publish("pipeline.messages", &message("store", "in flight"))
        .unwrap();
    let delivery = stream.next().await.unwrap().unwrap();

    broker.sever_connections();
    connection.closed().await;
    assert!(stream.next().await.is_none());
    assert_eq!(broker.open_connections(), 0);
    assert!(matches!(
        connection.open_channel().await,
        Err(BrokerError::ConnectionClosed)
    ));

    // the broker already took the message back
    assert!(delivery.ack().await.is_err());
    let ready = broker.take_ready("worker_store");
    assert_eq!(ready.len(), 1);
    assert!(ready[0].redelivered);
}

#[tokio::test]
async fn test_round_robin_between_consumers() {
    let broker = broker_with_queue("worker_store", "store");
    let connection = broker.connect().await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    let mut first = channel.consume("worker_store").await.unwrap();
    let mut second = channel.consume("worker_store").await.unwrap();

    for body in ["1", "2"] {
        broker
            .publish("pipeline.messages", &message("store", body))
            .unwrap();
    }
    assert_eq!(first.next().await.unwrap().unwrap().body, b"1");
    assert_eq!(second.next().await.unwrap().unwrap().body, b"2");
}
