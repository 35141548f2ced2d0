//! Pipeline data model: the wire message with its step routing, the
//! measurements workers attach to it, and the error report.

pub mod error;
pub mod measurement;
pub mod message;

pub use error::PipelineError;
pub use measurement::{Measurement, MeasurementBuilder};
pub use message::{Device, PipelineMessage, Sensor};
