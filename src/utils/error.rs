//! The `error` module defines the error types used within `sensorpipe`.
//!
//! Errors are split along the failure taxonomy of the runtime:
//! - [`BrokerError`]: connectivity and channel-setup failures, recovered by
//!   the reconnect loop and the bridges.
//! - [`MessageError`]: step routing and measurement assembly on a
//!   pipeline message.
//! - [`ProcessError`]: the outcome of processing one delivery, classified
//!   as malformed (never retried) or transient (retried once).

use std::fmt::Display;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("could not connect to broker: {0}")]
    Dial(String),

    #[error("broker connection is closed")]
    ConnectionClosed,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("setup step '{step}' failed: {reason}")]
    Setup { step: String, reason: String },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("maximum reconnect retries of {0} reached")]
    RetriesExhausted(u32),

    #[error("broker connection is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessageError {
    #[error("pipeline message has no steps remaining")]
    NoStepsRemaining,

    #[error("sensor external id must not be empty")]
    EmptySensorId,

    #[error("measurement value {0} is not a finite number")]
    InvalidValue(f64),

    #[error("measurement has no value set")]
    MissingValue,

    #[error("invalid location: latitude {latitude}, longitude {longitude}")]
    InvalidLocation { latitude: f64, longitude: f64 },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    /// The delivery can never be processed, retrying is pointless.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl ProcessError {
    pub fn malformed(reason: impl Display) -> Self {
        Self::Malformed(reason.to_string())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}
