//! Publisher bridge
//!
//! The mirror image of the consumer bridge: callers write messages into a
//! bounded in-process queue and the bridge publishes them to `exchange` on
//! whatever connection is live. A message whose publish failed is held and
//! retried on a fresh channel before anything else is read, so an
//! outage turns into backpressure on the writers rather than loss.
//!
//! Delivery is best effort across shutdown: once the broker connection is
//! shut down the bridge stops, and whatever is still queued is dropped and
//! logged.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::{Channel, Connection, PublishMessage, PublishOutcome};
use crate::mq::connection::BrokerConnection;
use crate::mq::setup::{DEFAULT_PREFETCH, SetupStep, setup_channel};
use crate::mq::subscriber::Subscription;
use crate::utils::error::BrokerError;

const REPUBLISH_DELAY: Duration = Duration::from_millis(500);

enum BridgeState {
    WaitingForConnection,
    SettingUp(Arc<dyn Connection>),
    Publishing {
        connection: Arc<dyn Connection>,
        channel: Box<dyn Channel>,
    },
}

/// Starts a publisher bridge for `exchange` and returns its input queue.
///
/// The bridge exits once every sender is dropped and the queue is drained,
/// or when the broker connection shuts down.
pub fn publisher(
    connection: &BrokerConnection,
    exchange: &str,
    setup: Vec<SetupStep>,
) -> mpsc::Sender<PublishMessage> {
    let (input, messages) = mpsc::channel(usize::from(DEFAULT_PREFETCH));
    let subscription = connection.subscribe();
    tokio::spawn(run_publisher(
        subscription,
        exchange.to_string(),
        setup,
        messages,
    ));
    input
}

async fn run_publisher(
    mut subscription: Subscription,
    exchange: String,
    setup: Vec<SetupStep>,
    mut messages: mpsc::Receiver<PublishMessage>,
) {
    let mut state = BridgeState::WaitingForConnection;
    let mut pending: Option<PublishMessage> = None;

    loop {
        state = match state {
            BridgeState::WaitingForConnection => match subscription.next().await {
                Some(connection) => BridgeState::SettingUp(connection),
                None => {
                    let dropped = messages.len() + usize::from(pending.is_some());
                    if dropped > 0 {
                        warn!(%exchange, dropped, "publisher stopped with unpublished messages");
                    }
                    info!(%exchange, "publisher stopped, broker connection is gone");
                    return;
                }
            },

            BridgeState::SettingUp(connection) => match open_channel(connection.as_ref(), &setup).await {
                Ok(channel) => {
                    info!(%exchange, "publisher ready");
                    BridgeState::Publishing {
                        connection,
                        channel,
                    }
                }
                Err(err) => {
                    warn!(%exchange, error = %err, "publisher setup failed, waiting for next connection");
                    BridgeState::WaitingForConnection
                }
            },

            BridgeState::Publishing {
                connection,
                channel,
            } => {
                let next = match pending.take() {
                    Some(message) => Some(message),
                    None => tokio::select! {
                        received = messages.recv() => match received {
                            Some(message) => Some(message),
                            None => {
                                debug!(%exchange, "publisher input closed");
                                return;
                            }
                        },
                        _ = connection.closed() => None,
                    },
                };

                match next {
                    None => {
                        warn!(%exchange, "publisher lost its connection");
                        BridgeState::WaitingForConnection
                    }
                    Some(mut message) => {
                        message.timestamp = Some(Utc::now().timestamp_millis());
                        match channel.publish(&exchange, &message).await {
                            Ok(PublishOutcome::Routed) => {
                                debug!(%exchange, topic = %message.topic, "message published");
                                BridgeState::Publishing {
                                    connection,
                                    channel,
                                }
                            }
                            Ok(PublishOutcome::Unroutable) => {
                                warn!(%exchange, topic = %message.topic, "no queue bound for topic, message dropped");
                                BridgeState::Publishing {
                                    connection,
                                    channel,
                                }
                            }
                            Err(err) => {
                                warn!(%exchange, topic = %message.topic, error = %err, "publish failed, retrying on a fresh channel");
                                pending = Some(message);
                                tokio::time::sleep(REPUBLISH_DELAY).await;
                                BridgeState::SettingUp(connection)
                            }
                        }
                    }
                }
            }
        };
    }
}

async fn open_channel(
    connection: &dyn Connection,
    setup: &[SetupStep],
) -> Result<Box<dyn Channel>, BrokerError> {
    let channel = connection.open_channel().await?;
    setup_channel(channel.as_ref(), setup).await?;
    Ok(channel)
}
