use std::fmt;

use crate::broker::Channel;
use crate::utils::error::BrokerError;

/// Prefetch applied when a consumer does not ask for something else.
pub const DEFAULT_PREFETCH: u16 = 50;

/// One declaration run against a fresh channel before a bridge starts using it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    Prefetch(u16),
    Exchange(String),
    Queue(String),
    /// Declares the exchange and the queue, then binds them on `topic`.
    TopicBinding {
        queue: String,
        exchange: String,
        topic: String,
    },
}

impl SetupStep {
    pub fn defaults(prefetch: u16) -> Self {
        SetupStep::Prefetch(prefetch)
    }

    pub fn topic_binding(queue: &str, exchange: &str, topic: &str) -> Self {
        SetupStep::TopicBinding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            topic: topic.to_string(),
        }
    }

    pub async fn apply(&self, channel: &dyn Channel) -> Result<(), BrokerError> {
        let result = match self {
            SetupStep::Prefetch(count) => channel.set_prefetch(*count).await,
            SetupStep::Exchange(exchange) => channel.declare_exchange(exchange).await,
            SetupStep::Queue(queue) => channel.declare_queue(queue).await,
            SetupStep::TopicBinding {
                queue,
                exchange,
                topic,
            } => {
                channel.declare_exchange(exchange).await?;
                channel.declare_queue(queue).await?;
                channel.bind_queue(queue, exchange, topic).await
            }
        };
        result.map_err(|err| BrokerError::Setup {
            step: self.to_string(),
            reason: err.to_string(),
        })
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupStep::Prefetch(count) => write!(f, "prefetch({count})"),
            SetupStep::Exchange(exchange) => write!(f, "exchange({exchange})"),
            SetupStep::Queue(queue) => write!(f, "queue({queue})"),
            SetupStep::TopicBinding {
                queue,
                exchange,
                topic,
            } => write!(f, "bind({queue} <- {exchange}:{topic})"),
        }
    }
}

/// Applies every step in order, stopping at the first failure.
pub async fn setup_channel(channel: &dyn Channel, steps: &[SetupStep]) -> Result<(), BrokerError> {
    for step in steps {
        step.apply(channel).await?;
    }
    Ok(())
}

/// Buffer size for a consumer bridge: the prefetch it asked for.
pub(crate) fn buffer_capacity(steps: &[SetupStep]) -> usize {
    steps
        .iter()
        .find_map(|step| match step {
            SetupStep::Prefetch(count) if *count > 0 => Some(usize::from(*count)),
            _ => None,
        })
        .unwrap_or(usize::from(DEFAULT_PREFETCH))
}
