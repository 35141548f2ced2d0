use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::broker::Connection;

/// A registered receiver of live broker connections.
///
/// Each subscriber is uniquely identified by an `id` and is handed every
/// connection the `BrokerConnection` establishes. Dropping the subscriber
/// closes its `Subscription`, meaning no further connections will follow.
pub struct Subscriber {
    /// Unique identifier for the subscriber.
    pub id: String,

    sender: UnboundedSender<Arc<dyn Connection>>,
}

impl Subscriber {
    pub fn new() -> (Self, Subscription) {
        let id = format!("subscriber-{}", uuid::Uuid::new_v4());
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: id.clone(),
                sender,
            },
            Subscription { id, receiver },
        )
    }

    /// Returns false once the subscription side is gone.
    pub(crate) fn deliver(&self, connection: Arc<dyn Connection>) -> bool {
        self.sender.send(connection).is_ok()
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).finish()
    }
}

/// The receiving half of a [`Subscriber`].
pub struct Subscription {
    pub id: String,
    receiver: UnboundedReceiver<Arc<dyn Connection>>,
}

impl Subscription {
    /// Waits for the next live connection. `None` means the broker
    /// connection shut down.
    pub async fn next(&mut self) -> Option<Arc<dyn Connection>> {
        self.receiver.recv().await
    }

    /// Non-blocking variant of [`Subscription::next`]; `None` when nothing is queued.
    pub fn try_next(&mut self) -> Option<Arc<dyn Connection>> {
        self.receiver.try_recv().ok()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
