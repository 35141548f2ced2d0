//! Shared helpers for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{Acknowledge, Delivery, MemoryBroker, PublishMessage, PublishOutcome};
use crate::mq::{BrokerConnection, ReconnectPolicy};
use crate::utils::error::BrokerError;

pub const EXCHANGE: &str = "pipeline.messages";
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Ack,
    Nack { requeue: bool },
}

/// Records how deliveries were settled instead of talking to a broker.
#[derive(Default)]
pub struct Recorder {
    settled: Mutex<Vec<(u64, Settled)>>,
}

impl Recorder {
    pub fn settled(&self) -> Vec<(u64, Settled)> {
        self.settled.lock().unwrap().clone()
    }

    pub fn delivery(self: &Arc<Self>, tag: u64, body: &[u8], redelivered: bool) -> Delivery {
        Delivery::new(tag, body.to_vec(), self.clone()).redelivered(redelivered)
    }
}

#[async_trait]
impl Acknowledge for Recorder {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.settled.lock().unwrap().push((delivery_tag, Settled::Ack));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        self.settled
            .lock()
            .unwrap()
            .push((delivery_tag, Settled::Nack { requeue }));
        Ok(())
    }
}

pub fn fast_policy(max_retries: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        max_retries,
        backoff: Duration::from_millis(10),
    }
}

/// Starts a reconnect loop against `broker` in the background.
pub fn start_connection(
    broker: &MemoryBroker,
    policy: ReconnectPolicy,
) -> (
    BrokerConnection,
    tokio::task::JoinHandle<Result<(), BrokerError>>,
) {
    let connection = BrokerConnection::new(Arc::new(broker.clone()), policy);
    let runner = connection.clone();
    let handle = tokio::spawn(async move { runner.start().await });
    (connection, handle)
}

/// Polls `check` until it holds, panicking after [`WAIT`].
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Publishes once a queue is bound for `topic`; earlier attempts are unroutable.
pub async fn publish_when_bound(broker: &MemoryBroker, topic: &str, body: &[u8]) {
    eventually(|| {
        matches!(
            broker.publish(EXCHANGE, &PublishMessage::new(topic, body.to_vec())),
            Ok(PublishOutcome::Routed)
        )
    })
    .await;
}
