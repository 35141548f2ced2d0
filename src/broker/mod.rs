//! Broker transport
//!
//! The runtime talks to its message broker through three small traits that
//! mirror AMQP 0-9-1 primitives: a [`Connector`] dials a physical
//! [`Connection`], a connection opens logical [`Channel`]s, and a channel
//! declares topology, consumes and publishes.
//!
//! Two transports are provided:
//! - `amqp`: a real broker via `lapin`
//! - `engine`: an in-process topic-exchange broker (`MemoryBroker`)

pub mod amqp;
pub mod engine;
pub mod message;
pub mod topic;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::BrokerError;

pub use amqp::AmqpConnector;
pub use engine::MemoryBroker;
pub use message::{Acknowledge, Delivery, PublishMessage, PublishOutcome};

/// Inbound deliveries of one `basic.consume`. Ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError>;

    /// Resolves once the broker reports this connection closed.
    async fn closed(&self);

    async fn close(&self);
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError>;

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        message: &PublishMessage,
    ) -> Result<PublishOutcome, BrokerError>;
}

#[cfg(test)]
mod tests;
