//! In-memory broker engine
//!
//! A topic-exchange broker living inside the process. It backs the test
//! suite and `memory://` runs, and is faithful to the parts of AMQP the
//! runtime depends on:
//! - exchanges, durable queues and topic bindings
//! - per-consumer prefetch windows with round-robin dispatch
//! - unacked tracking; `nack(requeue)` puts the message back at the head of
//!   its queue flagged `redelivered`, `nack(!requeue)` dead-letters it
//! - a broker-side close requeues everything the closed connection held
//!
//! Concurrency and usage notes:
//! - All state sits behind one `std::sync::Mutex`. The lock is never held
//!   across an `.await`; deliveries are handed to consumers through
//!   unbounded channels so dispatch never blocks.
//! - `MemoryBroker` is cheap to clone; clones share the same engine.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::broker::message::{Acknowledge, Delivery, PublishMessage, PublishOutcome};
use crate::broker::topic::Binding;
use crate::broker::{Channel, Connection, Connector, DeliveryStream};
use crate::utils::error::BrokerError;

/// A message at rest in a queue, or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub timestamp: Option<i64>,
    pub redelivered: bool,
}

#[derive(Debug)]
struct ConsumerSlot {
    id: u64,
    connection_id: u64,
    prefetch: u16,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerSlot {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer_id: u64,
    connection_id: u64,
    message: StoredMessage,
}

#[derive(Debug, Default)]
struct Engine {
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    unacked: BTreeMap<u64, Unacked>,
    dead_letters: Vec<StoredMessage>,
    connections: HashMap<u64, watch::Sender<bool>>,
    next_tag: u64,
    next_id: u64,
}

impl Engine {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_open(&self, connection_id: u64) -> Result<(), BrokerError> {
        if self.connections.contains_key(&connection_id) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }

    fn bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("no queue '{queue}'")));
        }
        if !self.exchanges.contains(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }
        let binding = Binding::new(exchange, queue, routing_key);
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        message: &PublishMessage,
        acker: &Arc<dyn Acknowledge>,
    ) -> Result<PublishOutcome, BrokerError> {
        if !self.exchanges.contains(exchange) {
            return Err(BrokerError::Channel(format!("no exchange '{exchange}'")));
        }

        let targets: HashSet<String> = self
            .bindings
            .iter()
            .filter(|b| b.routes(exchange, &message.topic))
            .map(|b| b.queue.clone())
            .collect();
        if targets.is_empty() {
            return Ok(PublishOutcome::Unroutable);
        }

        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(StoredMessage {
                    routing_key: message.topic.clone(),
                    body: message.body.clone(),
                    message_id: message.message_id.clone(),
                    timestamp: message.timestamp,
                    redelivered: false,
                });
            }
            self.dispatch(&name, acker);
        }
        Ok(PublishOutcome::Routed)
    }

    fn add_consumer(
        &mut self,
        queue: &str,
        connection_id: u64,
        prefetch: u16,
        acker: &Arc<dyn Acknowledge>,
    ) -> Result<mpsc::UnboundedReceiver<Delivery>, BrokerError> {
        if !self.queues.contains_key(queue) {
            return Err(BrokerError::Channel(format!("no queue '{queue}'")));
        }
        let id = self.next_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(q) = self.queues.get_mut(queue) {
            q.consumers.push(ConsumerSlot {
                id,
                connection_id,
                prefetch,
                in_flight: 0,
                sender,
            });
        }
        self.dispatch(queue, acker);
        Ok(receiver)
    }

    /// Hands ready messages to consumers with free prefetch capacity.
    fn dispatch(&mut self, name: &str, acker: &Arc<dyn Acknowledge>) {
        let Some(queue) = self.queues.get_mut(name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let count = queue.consumers.len();
            let Some(idx) = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| queue.consumers[idx].has_capacity())
            else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let delivery = Delivery::new(tag, message.body.clone(), acker.clone())
                .with_routing_key(message.routing_key.clone())
                .with_message_id(message.message_id.clone())
                .redelivered(message.redelivered);

            let consumer = &mut queue.consumers[idx];
            if consumer.sender.send(delivery).is_err() {
                // consumer stream was dropped
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                queue.cursor = 0;
                continue;
            }
            consumer.in_flight += 1;
            queue.cursor = (idx + 1) % count;
            self.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    consumer_id: consumer.id,
                    connection_id: consumer.connection_id,
                    message,
                },
            );
        }
    }

    fn settle(
        &mut self,
        tag: u64,
        requeue: Option<bool>,
        acker: &Arc<dyn Acknowledge>,
    ) -> Result<(), BrokerError> {
        let mut entry = self
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownDeliveryTag(tag))?;

        if let Some(queue) = self.queues.get_mut(&entry.queue) {
            if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer_id) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
            match requeue {
                None => {}
                Some(true) => {
                    entry.message.redelivered = true;
                    queue.ready.push_front(entry.message);
                }
                Some(false) => self.dead_letters.push(entry.message),
            }
        }
        self.dispatch(&entry.queue, acker);
        Ok(())
    }

    fn close_connection(&mut self, connection_id: u64, acker: &Arc<dyn Acknowledge>) {
        if let Some(closed) = self.connections.remove(&connection_id) {
            closed.send_replace(true);
        }
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.connection_id != connection_id);
            queue.cursor = 0;
        }

        let orphaned: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        // reverse so the head of each queue keeps the original delivery order
        for tag in orphaned.into_iter().rev() {
            if let Some(mut entry) = self.unacked.remove(&tag) {
                entry.message.redelivered = true;
                if let Some(queue) = self.queues.get_mut(&entry.queue) {
                    queue.ready.push_front(entry.message);
                }
            }
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name, acker);
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    engine: Mutex<Engine>,
    unreachable: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn acker_for(shared: &Arc<Shared>) -> Arc<dyn Acknowledge> {
    Arc::new(MemoryAcker {
        shared: shared.clone(),
    })
}

struct MemoryAcker {
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let acker = acker_for(&self.shared);
        self.shared.lock().settle(delivery_tag, None, &acker)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let acker = acker_for(&self.shared);
        self.shared.lock().settle(delivery_tag, Some(requeue), &acker)
    }
}

/// In-process topic-exchange broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// When unreachable, every dial fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Closes every open connection from the broker side, as an outage would.
    pub fn sever_connections(&self) {
        let acker = acker_for(&self.shared);
        let mut engine = self.shared.lock();
        let ids: Vec<u64> = engine.connections.keys().copied().collect();
        info!(connections = ids.len(), "memory broker severing connections");
        for id in ids {
            engine.close_connection(id, &acker);
        }
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn declare_exchange(&self, exchange: &str) {
        self.shared.lock().exchanges.insert(exchange.to_string());
    }

    pub fn declare_queue(&self, queue: &str) {
        self.shared.lock().queues.entry(queue.to_string()).or_default();
    }

    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), BrokerError> {
        self.shared.lock().bind(queue, exchange, routing_key)
    }

    /// Publishes without a client connection.
    pub fn publish(
        &self,
        exchange: &str,
        message: &PublishMessage,
    ) -> Result<PublishOutcome, BrokerError> {
        let acker = acker_for(&self.shared);
        self.shared.lock().publish(exchange, message, &acker)
    }

    /// Number of messages waiting in `queue`, excluding unacked ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self) -> usize {
        self.shared.lock().unacked.len()
    }

    /// Removes and returns the ready messages of `queue`.
    pub fn take_ready(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<StoredMessage> {
        self.shared.lock().dead_letters.clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        if self.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Dial("memory broker is unreachable".to_string()));
        }
        let mut engine = self.shared.lock();
        let id = engine.next_id();
        let (closed_tx, closed_rx) = watch::channel(false);
        engine.connections.insert(id, closed_tx);
        debug!(connection_id = id, "memory broker accepted connection");

        Ok(Arc::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
            closed: closed_rx,
        }))
    }
}

struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
        self.shared.lock().ensure_open(self.id)?;
        Ok(Box::new(MemoryChannel {
            connection_id: self.id,
            shared: self.shared.clone(),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // a dropped sender also means closed
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) {
        let acker = acker_for(&self.shared);
        self.shared.lock().close_connection(self.id, &acker);
    }
}

struct MemoryChannel {
    connection_id: u64,
    shared: Arc<Shared>,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn open_engine(&self) -> Result<MutexGuard<'_, Engine>, BrokerError> {
        let engine = self.shared.lock();
        engine.ensure_open(self.connection_id)?;
        Ok(engine)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &str) -> Result<(), BrokerError> {
        self.open_engine()?.exchanges.insert(exchange.to_string());
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.open_engine()?
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.open_engine()?.bind(queue, exchange, routing_key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.open_engine()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError> {
        let acker = acker_for(&self.shared);
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let receiver =
            self.open_engine()?
                .add_consumer(queue, self.connection_id, prefetch, &acker)?;

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &PublishMessage,
    ) -> Result<PublishOutcome, BrokerError> {
        let acker = acker_for(&self.shared);
        self.open_engine()?.publish(exchange, message, &acker)
    }
}
