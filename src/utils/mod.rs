//! The `utils` module provides definitions shared across the `sensorpipe`
//! runtime: the error taxonomy and the logging bootstrap.

pub mod error;
pub mod logging;
