//! Message definitions for the broker transport
//!
//! `Delivery` is an inbound message handed out by a consumer; it carries the
//! handle needed to settle it (ack / nack) with the broker that produced it.
//! `PublishMessage` is an outbound message written to a publisher queue.
//!
//! Notes on fields:
//! - `routing_key` / `topic`: the pipeline step name used for routing
//! - `body`: JSON-encoded pipeline message (the protocol is JSON)
//! - `message_id`: the tracing id of the pipeline message, when known
//! - `timestamp`: milliseconds since UNIX epoch; stamped by the publisher bridge
//! - `redelivered`: set by the broker when the delivery was requeued before

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::utils::error::BrokerError;

/// Settles deliveries on behalf of the transport that produced them.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: Vec<u8>, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            delivery_tag,
            routing_key: String::new(),
            redelivered: false,
            message_id: None,
            body,
            acker,
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub timestamp: Option<i64>,
}

impl PublishMessage {
    pub fn new(topic: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            body,
            message_id: None,
            timestamp: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Broker verdict on a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Routed,
    /// No queue was bound for the routing key.
    Unroutable,
}
