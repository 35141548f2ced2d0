use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use super::processor::{DeliveryProcessor, QueueProcessor, classify, settle};
use super::{ConnectionState, SetupStep, decode_json, requeue_decision, start_queue_processor};
use crate::broker::{Delivery, MemoryBroker, PublishMessage};
use crate::test_support::{
    EXCHANGE, Recorder, Settled, WAIT, eventually, fast_policy, publish_when_bound,
    start_connection,
};
use crate::utils::error::{BrokerError, ProcessError};

fn consumer_setup(queue: &str, topic: &str) -> Vec<SetupStep> {
    vec![
        SetupStep::defaults(10),
        SetupStep::topic_binding(queue, EXCHANGE, topic),
    ]
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F> DeliveryProcessor for FnProcessor<F>
where
    F: FnMut(&Delivery) -> Result<(), ProcessError> + Send + 'static,
{
    async fn process(&mut self, delivery: &Delivery) -> Result<(), ProcessError> {
        (self.0)(delivery)
    }
}

#[tokio::test]
async fn test_subscriber_receives_current_connection() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));
    connection.wait_until_ready().await.unwrap();
    assert!(connection.is_ready());
    assert!(connection.is_healthy());

    let mut subscription = connection.subscribe();
    assert!(subscription.try_next().is_some());

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_early_subscriber_gets_first_connection() {
    let broker = MemoryBroker::new();
    let connection = crate::mq::BrokerConnection::new(Arc::new(broker.clone()), fast_policy(3));
    let mut subscription = connection.subscribe();
    assert!(subscription.try_next().is_none());
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    let runner = connection.clone();
    let handle = tokio::spawn(async move { runner.start().await });
    assert!(timeout(WAIT, subscription.next()).await.unwrap().is_some());

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_reconnects_after_connection_loss() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));
    let mut subscription = connection.subscribe();
    let first = timeout(WAIT, subscription.next()).await.unwrap().unwrap();

    broker.sever_connections();
    first.closed().await;
    let second = timeout(WAIT, subscription.next()).await.unwrap().unwrap();
    assert!(second.open_channel().await.is_ok());
    eventually(|| connection.is_ready()).await;

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_gives_up_after_max_retries() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let connection = crate::mq::BrokerConnection::new(Arc::new(broker.clone()), fast_policy(2));
    let mut subscription = connection.subscribe();

    let result = timeout(WAIT, connection.start()).await.unwrap();
    assert!(matches!(result, Err(BrokerError::RetriesExhausted(2))));
    assert_eq!(connection.state(), ConnectionState::Unreachable);
    assert!(!connection.is_healthy());
    assert!(matches!(
        connection.wait_until_ready().await,
        Err(BrokerError::RetriesExhausted(2))
    ));
    // no further connections will follow
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn test_recovers_when_broker_comes_back() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let (connection, handle) = start_connection(&broker, fast_policy(50));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!connection.is_ready());
    broker.set_reachable(true);
    timeout(WAIT, connection.wait_until_ready())
        .await
        .unwrap()
        .unwrap();

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_shutdown_closes_subscribers() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));
    connection.wait_until_ready().await.unwrap();
    let mut subscription = connection.subscribe();

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(broker.open_connections(), 0);

    // the connection delivered on subscribe is still queued, then the end
    timeout(WAIT, async { while subscription.next().await.is_some() {} })
        .await
        .unwrap();
    let mut late = connection.subscribe();
    assert!(late.next().await.is_none());
    assert!(matches!(
        connection.wait_until_ready().await,
        Err(BrokerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_consumer_bridge_streams_deliveries() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));
    let mut deliveries = connection.consume("worker_store", consumer_setup("worker_store", "store"));

    publish_when_bound(&broker, "store", b"m1").await;
    let delivery = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body, b"m1");
    assert_eq!(delivery.routing_key, "store");
    delivery.ack().await.unwrap();

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
    assert!(timeout(WAIT, deliveries.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_consumer_bridge_survives_reconnect() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));
    let mut deliveries = connection.consume("worker_store", consumer_setup("worker_store", "store"));

    publish_when_bound(&broker, "store", b"in flight").await;
    let first = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    assert!(!first.redelivered);

    broker.sever_connections();
    let again = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(again.body, b"in flight");
    assert!(again.redelivered);
    again.ack().await.unwrap();

    publish_when_bound(&broker, "store", b"after").await;
    let next = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(next.body, b"after");

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_publisher_bridge_stamps_and_routes() {
    let broker = MemoryBroker::new();
    broker.declare_exchange(EXCHANGE);
    broker.declare_queue("worker_store");
    broker.bind_queue("worker_store", EXCHANGE, "store").unwrap();

    let (connection, handle) = start_connection(&broker, fast_policy(3));
    let publisher = connection.publisher(EXCHANGE, vec![SetupStep::Exchange(EXCHANGE.to_string())]);
    publisher
        .send(PublishMessage::new("store", b"{}".to_vec()).with_message_id("trace-1"))
        .await
        .unwrap();
    publisher
        .send(PublishMessage::new("nobody.listens", b"{}".to_vec()))
        .await
        .unwrap();

    eventually(|| broker.queue_depth("worker_store") == 1).await;
    let stored = broker.take_ready("worker_store");
    assert_eq!(stored[0].message_id.as_deref(), Some("trace-1"));
    assert!(stored[0].timestamp.is_some());

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_publisher_holds_messages_until_connected() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    broker.declare_exchange(EXCHANGE);
    broker.declare_queue("worker_store");
    broker.bind_queue("worker_store", EXCHANGE, "store").unwrap();

    let (connection, handle) = start_connection(&broker, fast_policy(50));
    let publisher = connection.publisher(EXCHANGE, Vec::new());
    publisher
        .send(PublishMessage::new("store", b"queued".to_vec()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(broker.queue_depth("worker_store"), 0);

    broker.set_reachable(true);
    eventually(|| broker.queue_depth("worker_store") == 1).await;

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_consumer_retries_setup_on_next_connection() {
    let broker = MemoryBroker::new();
    broker.declare_exchange(EXCHANGE);
    let (connection, handle) = start_connection(&broker, fast_policy(3));

    // nothing declares the queue, so consuming it fails
    let mut deliveries = connection.consume("worker_late", vec![SetupStep::defaults(10)]);
    connection.wait_until_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(deliveries.try_recv().is_err());

    broker.declare_queue("worker_late");
    broker.bind_queue("worker_late", EXCHANGE, "late").unwrap();
    broker.sever_connections();

    publish_when_bound(&broker, "late", b"after setup").await;
    let delivery = timeout(WAIT, deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(delivery.body, b"after setup");
    delivery.ack().await.unwrap();

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_publisher_retries_failed_publish() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));

    // the exchange does not exist yet, so the first publish fails
    let publisher = connection.publisher(EXCHANGE, Vec::new());
    publisher
        .send(PublishMessage::new("store", b"held".to_vec()))
        .await
        .unwrap();
    connection.wait_until_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.declare_exchange(EXCHANGE);
    broker.declare_queue("worker_store");
    broker.bind_queue("worker_store", EXCHANGE, "store").unwrap();

    eventually(|| broker.queue_depth("worker_store") == 1).await;
    assert_eq!(broker.take_ready("worker_store")[0].body, b"held");

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_publisher_stops_when_connection_shuts_down() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let (connection, handle) = start_connection(&broker, fast_policy(50));

    let publisher = connection.publisher(EXCHANGE, Vec::new());
    publisher
        .send(PublishMessage::new("store", b"stranded".to_vec()))
        .await
        .unwrap();

    connection.shutdown();
    timeout(WAIT, publisher.closed()).await.unwrap();
    assert!(
        publisher
            .send(PublishMessage::new("store", b"late".to_vec()))
            .await
            .is_err()
    );
    let _ = handle.await.unwrap();
}

#[test]
fn test_requeue_decision() {
    let malformed = ProcessError::malformed("bad json");
    let transient = ProcessError::from(anyhow::anyhow!("database unavailable"));

    assert!(!requeue_decision(&malformed, false));
    assert!(!requeue_decision(&malformed, true));
    assert!(requeue_decision(&transient, false));
    assert!(!requeue_decision(&transient, true));
}

#[test]
fn test_classify_recovers_malformed() {
    let malformed = classify(anyhow::Error::from(ProcessError::malformed("short payload")));
    assert!(malformed.is_malformed());
    assert_eq!(malformed.to_string(), "malformed message: short payload");

    let transient = classify(anyhow::anyhow!("timeout"));
    assert!(!transient.is_malformed());
}

#[test]
fn test_decode_json_rejects_garbage_as_malformed() {
    let recorder = Arc::new(Recorder::default());
    let good = recorder.delivery(1, br#"{"value": 3}"#, false);
    let decoded: serde_json::Value = decode_json(&good).unwrap();
    assert_eq!(decoded["value"], 3);

    let bad = recorder.delivery(2, b"not json", false);
    let result: Result<serde_json::Value, _> = decode_json(&bad);
    assert!(result.unwrap_err().is_malformed());
}

#[tokio::test]
async fn test_settle_applies_policy() {
    let recorder = Arc::new(Recorder::default());

    settle(&recorder.delivery(1, b"", false), Ok(())).await;
    settle(
        &recorder.delivery(2, b"", false),
        Err(ProcessError::malformed("bad")),
    )
    .await;
    settle(
        &recorder.delivery(3, b"", false),
        Err(anyhow::anyhow!("flaky").into()),
    )
    .await;
    settle(
        &recorder.delivery(4, b"", true),
        Err(anyhow::anyhow!("still flaky").into()),
    )
    .await;

    assert_eq!(
        recorder.settled(),
        vec![
            (1, Settled::Ack),
            (2, Settled::Nack { requeue: false }),
            (3, Settled::Nack { requeue: true }),
            (4, Settled::Nack { requeue: false }),
        ]
    );
}

#[tokio::test]
async fn test_queue_processor_builds_one_processor_per_worker() {
    let recorder = Arc::new(Recorder::default());
    let (sender, receiver) = tokio::sync::mpsc::channel(8);
    for tag in 1..=4 {
        sender.send(recorder.delivery(tag, b"{}", false)).await.unwrap();
    }
    drop(sender);

    let built = Arc::new(Mutex::new(Vec::new()));
    let factory = {
        let built = built.clone();
        move |worker: usize| {
            built.lock().unwrap().push(worker);
            FnProcessor(|_: &Delivery| Ok::<(), ProcessError>(()))
        }
    };
    timeout(WAIT, QueueProcessor::new(receiver, 3).run(factory))
        .await
        .unwrap();

    let mut built = built.lock().unwrap().clone();
    built.sort_unstable();
    assert_eq!(built, vec![0, 1, 2]);

    let mut acked: Vec<u64> = recorder.settled().into_iter().map(|(tag, _)| tag).collect();
    acked.sort_unstable();
    assert_eq!(acked, vec![1, 2, 3, 4]);
    assert!(recorder.settled().iter().all(|(_, s)| *s == Settled::Ack));
}

#[tokio::test]
async fn test_transient_failure_is_retried_once_then_dead_lettered() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));

    let attempts = Arc::new(Mutex::new(Vec::new()));
    let processor = {
        let connection = connection.clone();
        let attempts = attempts.clone();
        tokio::spawn(async move {
            start_queue_processor(&connection, "worker_store", EXCHANGE, "store", 2, move |_: usize| {
                let attempts = attempts.clone();
                FnProcessor(move |delivery: &Delivery| {
                    attempts.lock().unwrap().push(delivery.redelivered);
                    Err(ProcessError::from(anyhow::anyhow!("downstream unavailable")))
                })
            })
            .await;
        })
    };

    publish_when_bound(&broker, "store", b"{}").await;
    eventually(|| broker.dead_letters().len() == 1).await;
    assert_eq!(*attempts.lock().unwrap(), vec![false, true]);

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
    timeout(WAIT, processor).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_malformed_delivery_is_never_requeued() {
    let broker = MemoryBroker::new();
    let (connection, handle) = start_connection(&broker, fast_policy(3));

    let processor = {
        let connection = connection.clone();
        tokio::spawn(async move {
            start_queue_processor(&connection, "worker_decode", EXCHANGE, "decode", 1, |_: usize| {
                FnProcessor(|delivery: &Delivery| {
                    decode_json::<serde_json::Value>(delivery).map(|_| ())
                })
            })
            .await;
        })
    };

    publish_when_bound(&broker, "decode", b"not json").await;
    eventually(|| broker.dead_letters().len() == 1).await;
    assert_eq!(broker.queue_depth("worker_decode"), 0);

    connection.shutdown();
    assert!(handle.await.unwrap().is_ok());
    timeout(WAIT, processor).await.unwrap().unwrap();
}
