//! Broker connection
//!
//! `BrokerConnection` owns one physical broker connection for the lifetime
//! of the process and shares it between any number of consumers and
//! publishers:
//! - `start` runs the reconnect loop until `shutdown` or until the retry
//!   ceiling is exceeded
//! - `subscribe` registers a subscriber that receives every connection the
//!   loop establishes, including the current one if already connected
//! - `shutdown` closes every subscriber and releases the physical connection
//!
//! Concurrency and usage notes:
//! - The current handle and the subscriber list live behind one mutex;
//!   registering a subscriber and broadcasting a new connection both happen
//!   under it, so a subscriber can never miss a connection.
//! - The lifecycle phase is published through a `watch` channel so callers
//!   can suspend until a live connection exists (`wait_until_ready`).

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::broker::{Connection, Connector, Delivery, PublishMessage};
use crate::config::BrokerSettings;
use crate::mq::setup::SetupStep;
use crate::mq::subscriber::{Subscriber, Subscription};
use crate::mq::{consumer, publisher};
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Reconnecting,
    Connected,
    /// The retry ceiling was exceeded; the loop has terminated.
    Unreachable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    /// The n-th consecutive failed dial waits `n * backoff`.
    pub backoff: Duration,
}

impl ReconnectPolicy {
    pub const DEFAULT_MAX_RETRIES: u32 = 10;
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

impl From<&BrokerSettings> for ReconnectPolicy {
    fn from(settings: &BrokerSettings) -> Self {
        Self {
            max_retries: settings.max_reconnect_retries,
            backoff: Duration::from_millis(settings.reconnect_backoff_ms),
        }
    }
}

#[derive(Default)]
struct Registry {
    current: Option<Arc<dyn Connection>>,
    subscribers: Vec<Subscriber>,
    closed: bool,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    registry: Mutex<Registry>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                registry: Mutex::new(Registry::default()),
                state,
                shutdown,
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A live connection is available.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The reconnect loop has not given up.
    pub fn is_healthy(&self) -> bool {
        self.state() != ConnectionState::Unreachable
    }

    /// Registers a subscriber. If a connection is live it is delivered
    /// immediately; after shutdown the subscription is already closed.
    pub fn subscribe(&self) -> Subscription {
        let (subscriber, subscription) = Subscriber::new();
        let mut registry = self.registry();
        if registry.closed {
            return subscription;
        }
        if let Some(current) = &registry.current {
            subscriber.deliver(current.clone());
        }
        registry.subscribers.push(subscriber);
        subscription
    }

    /// Suspends until a live connection exists.
    pub async fn wait_until_ready(&self) -> Result<(), BrokerError> {
        let mut state = self.inner.state.subscribe();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::select! {
            reached = state.wait_for(|s| {
                matches!(s, ConnectionState::Connected | ConnectionState::Unreachable)
            }) => match reached.map(|s| *s) {
                Ok(ConnectionState::Connected) => Ok(()),
                Ok(_) => Err(BrokerError::RetriesExhausted(self.inner.policy.max_retries)),
                Err(_) => Err(BrokerError::ShuttingDown),
            },
            _ = shutdown.wait_for(|stop| *stop) => Err(BrokerError::ShuttingDown),
        }
    }

    /// Signals the reconnect loop to stop and closes every subscriber.
    pub fn shutdown(&self) {
        info!("broker connection shutdown requested");
        {
            let mut registry = self.registry();
            registry.closed = true;
            registry.subscribers.clear();
        }
        self.inner.shutdown.send_replace(true);
    }

    /// Runs the reconnect loop until `shutdown`. Returns
    /// `BrokerError::RetriesExhausted` when the broker stays unreachable.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let result = self.reconnect_loop().await;
        self.teardown().await;
        result
    }

    async fn reconnect_loop(&self) -> Result<(), BrokerError> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let max_retries = self.inner.policy.max_retries;
        let mut retries: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            info!("broker connection (re)connecting");
            self.set_state(ConnectionState::Reconnecting);

            let dialed = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                dialed = self.inner.connector.connect() => dialed,
            };
            let connection = match dialed {
                Ok(connection) => connection,
                Err(err) => {
                    retries += 1;
                    warn!(error = %err, retries, "broker connection failed");
                    if retries > max_retries {
                        self.set_state(ConnectionState::Unreachable);
                        error!(max_retries, "maximum reconnect retries reached, giving up");
                        return Err(BrokerError::RetriesExhausted(max_retries));
                    }
                    let delay = self.inner.policy.backoff * retries;
                    info!(delay_ms = delay.as_millis() as u64, "retrying broker connection");
                    tokio::select! {
                        _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            retries = 0;
            if !self.broadcast(connection.clone()) {
                connection.close().await;
                return Ok(());
            }
            info!("broker connection established");

            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                _ = connection.closed() => {}
            }

            warn!("broker connection lost");
            self.registry().current = None;
            self.set_state(ConnectionState::Reconnecting);
            connection.close().await;
        }
    }

    /// Hands a fresh connection to every subscriber. Returns false if
    /// shutdown already closed the registry.
    fn broadcast(&self, connection: Arc<dyn Connection>) -> bool {
        let mut registry = self.registry();
        if registry.closed {
            return false;
        }
        registry
            .subscribers
            .retain(|subscriber| subscriber.deliver(connection.clone()));
        registry.current = Some(connection);
        self.set_state(ConnectionState::Connected);
        true
    }

    async fn teardown(&self) {
        info!("broker connection stopping");
        let current = {
            let mut registry = self.registry();
            registry.closed = true;
            registry.subscribers.clear();
            registry.current.take()
        };
        if let Some(connection) = current {
            connection.close().await;
        }
        if self.state() != ConnectionState::Unreachable {
            self.set_state(ConnectionState::Disconnected);
        }
        info!("broker connection stopped");
    }

    /// See [`consumer::consume`].
    pub fn consume(&self, queue: &str, setup: Vec<SetupStep>) -> mpsc::Receiver<Delivery> {
        consumer::consume(self, queue, setup)
    }

    /// See [`publisher::publisher`].
    pub fn publisher(&self, exchange: &str, setup: Vec<SetupStep>) -> mpsc::Sender<PublishMessage> {
        publisher::publisher(self, exchange, setup)
    }
}
