//! Worker runtime
//!
//! A worker is one step of a pipeline. It consumes its own queue, runs a
//! transform over every message and forwards the result to the message's
//! next step on the shared exchange:
//!
//! ```text
//! decode -> transform -> next_step -> publish -> ack
//! ```
//!
//! Any failure along the way is published as a [`PipelineError`] on the
//! error topic and the delivery is nacked without requeue. One message's
//! failure never stops the loop. Transform errors are classified as
//! malformed or transient for the log only; both are dead-lettered here,
//! retry-once handling lives in [`crate::mq::QueueProcessor`].
//!
//! A delivery is acked once its forward is queued on the publisher bridge.
//! An interrupt shuts the connection down right away, so forwards still
//! queued at that moment are lost even though their deliveries were acked.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpConnector, Connector, Delivery, MemoryBroker, PublishMessage};
use crate::config::{Settings, WorkerSettings};
use crate::mq::{BrokerConnection, ReconnectPolicy, SetupStep, classify};
use crate::pipeline::{PipelineError, PipelineMessage};

pub struct Worker<F> {
    settings: WorkerSettings,
    consumer: mpsc::Receiver<Delivery>,
    publisher: mpsc::Sender<PublishMessage>,
    error_publisher: mpsc::Sender<PublishMessage>,
    transform: F,
    connection: Option<BrokerConnection>,
}

enum Outcome {
    Forward(PublishMessage),
    Reject(Box<PipelineError>),
}

impl<F> Worker<F>
where
    F: FnMut(&mut PipelineMessage) -> anyhow::Result<()> + Send,
{
    /// Wires the worker's consumer, pipeline publisher and error publisher
    /// onto `connection`.
    pub fn new(settings: &Settings, connection: &BrokerConnection, transform: F) -> Self {
        let broker = &settings.broker;
        let worker = &settings.worker;

        let consumer = connection.consume(
            &worker.queue,
            vec![
                SetupStep::defaults(broker.prefetch),
                SetupStep::topic_binding(&worker.queue, &broker.exchange, &worker.id),
            ],
        );
        let exchange_setup = vec![SetupStep::Exchange(broker.exchange.clone())];
        let publisher = connection.publisher(&broker.exchange, exchange_setup.clone());
        let error_publisher = connection.publisher(&broker.exchange, exchange_setup);

        let mut worker = Self::from_parts(
            worker.clone(),
            consumer,
            publisher,
            error_publisher,
            transform,
        );
        worker.connection = Some(connection.clone());
        worker
    }

    /// Builds a worker over explicit queues. Nothing is shut down when the
    /// consumer closes.
    pub fn from_parts(
        settings: WorkerSettings,
        consumer: mpsc::Receiver<Delivery>,
        publisher: mpsc::Sender<PublishMessage>,
        error_publisher: mpsc::Sender<PublishMessage>,
        transform: F,
    ) -> Self {
        Self {
            settings,
            consumer,
            publisher,
            error_publisher,
            transform,
            connection: None,
        }
    }

    /// Processes deliveries until the consumer queue closes, then signals
    /// the broker connection to shut down.
    pub async fn run(mut self) {
        info!(
            worker = %self.settings.id,
            version = %self.settings.version,
            queue = %self.settings.queue,
            "worker running"
        );

        while let Some(delivery) = self.consumer.recv().await {
            self.handle(delivery).await;
        }

        info!(worker = %self.settings.id, "consumer closed, worker stopping");
        if let Some(connection) = &self.connection {
            connection.shutdown();
        }
    }

    async fn handle(&mut self, delivery: Delivery) {
        match self.process(&delivery) {
            Outcome::Forward(message) => {
                let topic = message.topic.clone();
                if self.publisher.send(message).await.is_err() {
                    error!(worker = %self.settings.id, "pipeline publisher is gone, requeueing delivery");
                    nack(&delivery, true).await;
                    return;
                }
                debug!(worker = %self.settings.id, %topic, "message forwarded");
                if let Err(err) = delivery.ack().await {
                    warn!(delivery_tag = delivery.delivery_tag, error = %err, "ack failed");
                }
            }
            Outcome::Reject(report) => {
                warn!(
                    worker = %self.settings.id,
                    tracing_id = report.tracing_id().unwrap_or_default(),
                    error = %report.error,
                    "processing failed"
                );
                self.report(&report).await;
                nack(&delivery, false).await;
            }
        }
    }

    fn process(&mut self, delivery: &Delivery) -> Outcome {
        let received: PipelineMessage = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(err) => {
                return self.reject(format!("could not decode pipeline message: {err}"));
            }
        };

        let mut attempt = received.clone();
        if let Err(err) = (self.transform)(&mut attempt) {
            let reason = format!("{err:#}");
            let malformed = classify(err).is_malformed();
            debug!(worker = %self.settings.id, malformed, "transform failed");
            return self.reject_with(reason, received, attempt);
        }

        let next = attempt.next_step().map(str::to_string);
        let topic = match next {
            Ok(topic) => topic,
            Err(err) => return self.reject_with(err.to_string(), received, attempt),
        };

        match serde_json::to_vec(&attempt) {
            Ok(body) => {
                let mut message = PublishMessage::new(topic, body);
                if !attempt.tracing_id.is_empty() {
                    message = message.with_message_id(attempt.tracing_id.as_str());
                }
                Outcome::Forward(message)
            }
            Err(err) => self.reject_with(
                format!("could not encode pipeline message: {err}"),
                received,
                attempt,
            ),
        }
    }

    fn reject(&self, error: String) -> Outcome {
        Outcome::Reject(Box::new(PipelineError::new(
            &self.settings.id,
            &self.settings.queue,
            error,
        )))
    }

    fn reject_with(
        &self,
        error: String,
        received: PipelineMessage,
        attempt: PipelineMessage,
    ) -> Outcome {
        Outcome::Reject(Box::new(
            PipelineError::new(&self.settings.id, &self.settings.queue, error)
                .with_received(received)
                .with_attempt(attempt),
        ))
    }

    async fn report(&self, report: &PipelineError) {
        let body = match serde_json::to_vec(report) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "could not encode pipeline error");
                return;
            }
        };
        let mut message = PublishMessage::new(self.settings.error_topic.as_str(), body);
        if let Some(tracing_id) = report.tracing_id().filter(|id| !id.is_empty()) {
            message = message.with_message_id(tracing_id);
        }
        if self.error_publisher.send(message).await.is_err() {
            error!(worker = %self.settings.id, "error publisher is gone, pipeline error dropped");
        }
    }
}

async fn nack(delivery: &Delivery, requeue: bool) {
    if let Err(err) = delivery.nack(requeue).await {
        warn!(delivery_tag = delivery.delivery_tag, error = %err, "nack failed");
    }
}

/// Picks the transport for a broker URL.
pub fn connector_for(host: &str) -> anyhow::Result<Arc<dyn Connector>> {
    if host.starts_with("memory://") {
        Ok(Arc::new(MemoryBroker::new()))
    } else if host.starts_with("amqp://") || host.starts_with("amqps://") {
        Ok(Arc::new(AmqpConnector::new(host)))
    } else {
        anyhow::bail!("unsupported broker url '{host}', expected amqp:// or memory://")
    }
}

/// Runs a worker with `transform` until the consumer closes or the process
/// is interrupted. Fails when the broker stays unreachable past the retry
/// ceiling.
pub async fn run_worker<F>(settings: Settings, transform: F) -> anyhow::Result<()>
where
    F: FnMut(&mut PipelineMessage) -> anyhow::Result<()> + Send,
{
    let connector = connector_for(&settings.broker.host)?;
    run_worker_with(settings, connector, transform).await
}

/// [`run_worker`] over an explicit connector.
pub async fn run_worker_with<F>(
    settings: Settings,
    connector: Arc<dyn Connector>,
    transform: F,
) -> anyhow::Result<()>
where
    F: FnMut(&mut PipelineMessage) -> anyhow::Result<()> + Send,
{
    let connection = BrokerConnection::new(connector, ReconnectPolicy::from(&settings.broker));
    let worker = Worker::new(&settings, &connection, transform);

    let reconnect = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    let interrupt = {
        let connection = connection.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                connection.shutdown();
            }
        })
    };

    worker.run().await;
    interrupt.abort();
    connection.shutdown();

    reconnect.await??;
    info!("worker stopped");
    Ok(())
}
