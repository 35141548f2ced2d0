//! Consumer bridge
//!
//! Turns the reconnecting broker connection into one long-lived in-process
//! queue of deliveries. The bridge is a small state machine:
//!
//! ```text
//! WaitingForConnection --connection--> SettingUp --ok--> Streaming
//!          ^                               |                 |
//!          +------------setup failed-------+                 |
//!          +------------stream ended (connection lost)-------+
//! ```
//!
//! The output queue is bounded by the prefetch, so a slow reader pushes
//! back on the broker instead of buffering without limit. It is closed once
//! the broker connection shuts down for good.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{Channel, Connection, Delivery, DeliveryStream};
use crate::mq::connection::BrokerConnection;
use crate::mq::setup::{SetupStep, buffer_capacity, setup_channel};
use crate::mq::subscriber::Subscription;
use crate::utils::error::BrokerError;

enum BridgeState {
    WaitingForConnection,
    SettingUp(Arc<dyn Connection>),
    Streaming {
        // the stream only lives as long as its channel
        _channel: Box<dyn Channel>,
        deliveries: DeliveryStream,
    },
}

/// Starts a consumer bridge for `queue` and returns its delivery queue.
///
/// `setup` runs on every fresh channel before consuming, so declarations
/// and bindings survive reconnects.
pub fn consume(
    connection: &BrokerConnection,
    queue: &str,
    setup: Vec<SetupStep>,
) -> mpsc::Receiver<Delivery> {
    let (output, deliveries) = mpsc::channel(buffer_capacity(&setup));
    let subscription = connection.subscribe();
    tokio::spawn(run_consumer(subscription, queue.to_string(), setup, output));
    deliveries
}

async fn run_consumer(
    mut subscription: Subscription,
    queue: String,
    setup: Vec<SetupStep>,
    output: mpsc::Sender<Delivery>,
) {
    let mut state = BridgeState::WaitingForConnection;

    loop {
        state = match state {
            BridgeState::WaitingForConnection => match subscription.next().await {
                Some(connection) => BridgeState::SettingUp(connection),
                None => {
                    info!(%queue, "consumer stopped, broker connection is gone");
                    return;
                }
            },

            BridgeState::SettingUp(connection) => {
                match open_stream(connection.as_ref(), &queue, &setup).await {
                    Ok((channel, deliveries)) => {
                        info!(%queue, "consumer streaming");
                        BridgeState::Streaming {
                            _channel: channel,
                            deliveries,
                        }
                    }
                    Err(err) => {
                        warn!(%queue, error = %err, "consumer setup failed, waiting for next connection");
                        BridgeState::WaitingForConnection
                    }
                }
            }

            BridgeState::Streaming {
                _channel,
                mut deliveries,
            } => {
                let next = tokio::select! {
                    next = deliveries.next() => next,
                    _ = output.closed() => {
                        debug!(%queue, "consumer output dropped");
                        return;
                    }
                };
                match next {
                    Some(Ok(delivery)) => {
                        if output.send(delivery).await.is_err() {
                            debug!(%queue, "consumer output dropped");
                            return;
                        }
                        BridgeState::Streaming {
                            _channel,
                            deliveries,
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%queue, error = %err, "delivery stream failed");
                        BridgeState::WaitingForConnection
                    }
                    None => {
                        warn!(%queue, "delivery stream closed");
                        BridgeState::WaitingForConnection
                    }
                }
            }
        };
    }
}

async fn open_stream(
    connection: &dyn Connection,
    queue: &str,
    setup: &[SetupStep],
) -> Result<(Box<dyn Channel>, DeliveryStream), BrokerError> {
    let channel = connection.open_channel().await?;
    setup_channel(channel.as_ref(), setup).await?;
    let deliveries = channel.consume(queue).await?;
    Ok((channel, deliveries))
}
