//! Queue processor
//!
//! Runs a fixed number of workers over one consumer queue. Each worker owns
//! its own [`DeliveryProcessor`] and settles every delivery it takes:
//! - success: ack
//! - malformed: nack, never requeued
//! - transient: nack with requeue, unless the delivery was already
//!   redelivered once, in which case it is dead-lettered

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::Delivery;
use crate::mq::connection::BrokerConnection;
use crate::mq::setup::SetupStep;
use crate::utils::error::ProcessError;

#[async_trait]
pub trait DeliveryProcessor: Send + 'static {
    async fn process(&mut self, delivery: &Delivery) -> Result<(), ProcessError>;
}

/// Builds one processor per worker; the argument is the worker index.
pub trait ProcessorFactory {
    type Processor: DeliveryProcessor;

    fn build(&self, worker: usize) -> Self::Processor;
}

impl<F, P> ProcessorFactory for F
where
    F: Fn(usize) -> P,
    P: DeliveryProcessor,
{
    type Processor = P;

    fn build(&self, worker: usize) -> P {
        self(worker)
    }
}

/// Whether a failed delivery goes back on its queue.
pub fn requeue_decision(err: &ProcessError, redelivered: bool) -> bool {
    !err.is_malformed() && !redelivered
}

/// Recovers a [`ProcessError`] carried inside an `anyhow::Error`; anything
/// else is transient.
pub fn classify(err: anyhow::Error) -> ProcessError {
    match err.downcast::<ProcessError>() {
        Ok(err) => err,
        Err(err) => ProcessError::Transient(err),
    }
}

/// Decodes a JSON delivery body. A body that does not decode is malformed.
pub fn decode_json<T: DeserializeOwned>(delivery: &Delivery) -> Result<T, ProcessError> {
    serde_json::from_slice(&delivery.body).map_err(ProcessError::malformed)
}

/// Acks or nacks `delivery` according to the processing result.
pub async fn settle(delivery: &Delivery, result: Result<(), ProcessError>) {
    match result {
        Ok(()) => {
            if let Err(err) = delivery.ack().await {
                warn!(delivery_tag = delivery.delivery_tag, error = %err, "ack failed");
            }
        }
        Err(err) => {
            let requeue = requeue_decision(&err, delivery.redelivered);
            warn!(
                delivery_tag = delivery.delivery_tag,
                redelivered = delivery.redelivered,
                requeue,
                error = %err,
                "processing delivery failed"
            );
            if let Err(err) = delivery.nack(requeue).await {
                warn!(delivery_tag = delivery.delivery_tag, error = %err, "nack failed");
            }
        }
    }
}

pub struct QueueProcessor {
    deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    concurrency: usize,
}

impl QueueProcessor {
    pub fn new(deliveries: mpsc::Receiver<Delivery>, concurrency: usize) -> Self {
        Self {
            deliveries: Arc::new(Mutex::new(deliveries)),
            concurrency: concurrency.max(1),
        }
    }

    /// Runs until the delivery queue closes and every worker has finished
    /// the delivery it was handling.
    pub async fn run<F: ProcessorFactory>(self, factory: F) {
        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let processor = factory.build(worker);
            workers.spawn(work(worker, self.deliveries.clone(), processor));
        }
        info!(concurrency = self.concurrency, "queue processor started");

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "queue processor worker failed");
            }
        }
        info!("queue processor stopped");
    }
}

async fn work<P: DeliveryProcessor>(
    worker: usize,
    deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    mut processor: P,
) {
    loop {
        let next = deliveries.lock().await.recv().await;
        let Some(delivery) = next else {
            debug!(worker, "delivery queue closed");
            return;
        };
        let result = processor.process(&delivery).await;
        settle(&delivery, result).await;
    }
}

/// Consumes `queue` bound to `exchange` on `topic` with one worker per unit
/// of `concurrency`. Prefetch equals the concurrency.
pub async fn start_queue_processor<F: ProcessorFactory>(
    connection: &BrokerConnection,
    queue: &str,
    exchange: &str,
    topic: &str,
    concurrency: usize,
    factory: F,
) {
    let concurrency = concurrency.max(1);
    let prefetch = u16::try_from(concurrency).unwrap_or(u16::MAX);
    let deliveries = connection.consume(
        queue,
        vec![
            SetupStep::defaults(prefetch),
            SetupStep::topic_binding(queue, exchange, topic),
        ],
    );
    QueueProcessor::new(deliveries, concurrency)
        .run(factory)
        .await;
}
