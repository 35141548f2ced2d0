//! # sensorpipe
//!
//! `sensorpipe` is the execution runtime for the workers of an IoT
//! sensor-data pipeline. A worker receives a pipeline message from the
//! broker, transforms it and forwards it to the next step named in the
//! message itself, surviving broker outages along the way.
//!
//! ## Core Modules
//!
//! - `broker`: transport seam (`Connector` / `Connection` / `Channel`) with an
//!   AMQP implementation and an in-process broker.
//! - `mq`: the reconnecting `BrokerConnection`, reconnect-transparent consumer
//!   and publisher bridges, and the `QueueProcessor` retry policy.
//! - `pipeline`: the wire message, its step routing, measurements and the
//!   error report.
//! - `worker`: the decode → transform → forward loop.
//! - `decoders`: device-specific transforms.
//! - `config`: loading worker settings from files and the environment.
//! - `utils`: error types and logging.

pub mod broker;
pub mod config;
pub mod decoders;
pub mod mq;
pub mod pipeline;
pub mod utils;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
