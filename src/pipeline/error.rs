use std::fmt::Display;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::pipeline::message::PipelineMessage;

/// Failure report published to the error topic. It is data for the
/// tracing services, never put back on the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    /// The message as it arrived, when it could be decoded.
    pub received_by_worker: Option<PipelineMessage>,
    /// The message as the transform left it.
    pub processing_attempt: Option<PipelineMessage>,
    pub worker: String,
    pub queue: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub error: String,
}

impl PipelineError {
    pub fn new(worker: &str, queue: &str, error: impl Display) -> Self {
        Self {
            received_by_worker: None,
            processing_attempt: None,
            worker: worker.to_string(),
            queue: queue.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            error: error.to_string(),
        }
    }

    pub fn with_received(mut self, message: PipelineMessage) -> Self {
        self.received_by_worker = Some(message);
        self
    }

    pub fn with_attempt(mut self, message: PipelineMessage) -> Self {
        self.processing_attempt = Some(message);
        self
    }

    /// Tracing id of whichever snapshot is present.
    pub fn tracing_id(&self) -> Option<&str> {
        self.received_by_worker
            .as_ref()
            .or(self.processing_attempt.as_ref())
            .map(|m| m.tracing_id.as_str())
    }
}
