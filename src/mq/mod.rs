//! Messaging layer over the broker transport: a reconnecting
//! [`BrokerConnection`], consumer and publisher bridges that survive
//! reconnects, and the [`QueueProcessor`] retry policy.

pub mod connection;
pub mod consumer;
pub mod processor;
pub mod publisher;
pub mod setup;
pub mod subscriber;

pub use connection::{BrokerConnection, ConnectionState, ReconnectPolicy};
pub use processor::{
    DeliveryProcessor, ProcessorFactory, QueueProcessor, classify, decode_json, requeue_decision,
    start_queue_processor,
};
pub use setup::{DEFAULT_PREFETCH, SetupStep};
pub use subscriber::{Subscriber, Subscription};

#[cfg(test)]
mod tests;
