//! The pipeline wire message and its step-routing state.
//!
//! A `PipelineMessage` carries its own itinerary: `pipeline_steps` is the
//! ordered list of step names (each one a routing key) and `step_index`
//! points at the step currently handling it. Workers only ever move the
//! index forward and append measurements.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pipeline::measurement::{Measurement, MeasurementBuilder};
use crate::utils::error::MessageError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineMessage {
    pub tracing_id: String,
    pub access_token: String,
    pub tenant_id: i64,
    /// Unix milliseconds at ingress.
    pub received_at: i64,
    pub pipeline_id: String,
    pub step_index: usize,
    pub pipeline_steps: Vec<String>,
    /// Unix milliseconds; the default timestamp of new measurements.
    pub timestamp: i64,
    pub device: Option<Device>,
    pub measurements: Vec<Measurement>,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub metadata: Map<String, Value>,
}

impl PipelineMessage {
    pub fn new(pipeline_id: impl Into<String>, steps: Vec<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            tracing_id: Uuid::new_v4().to_string(),
            received_at: now,
            pipeline_id: pipeline_id.into(),
            pipeline_steps: steps,
            timestamp: now,
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn current_step(&self) -> Result<&str, MessageError> {
        self.pipeline_steps
            .get(self.step_index)
            .map(String::as_str)
            .ok_or(MessageError::NoStepsRemaining)
    }

    /// Advances to the next step and returns its name. Fails without
    /// touching `step_index` when the current step is the last one.
    pub fn next_step(&mut self) -> Result<&str, MessageError> {
        let next = self
            .step_index
            .checked_add(1)
            .filter(|next| *next < self.pipeline_steps.len())
            .ok_or(MessageError::NoStepsRemaining)?;
        self.step_index = next;
        Ok(&self.pipeline_steps[next])
    }

    /// Starts a measurement that is appended to this message on `add()`.
    pub fn new_measurement(&mut self) -> MeasurementBuilder<'_> {
        MeasurementBuilder::new(self)
    }
}

/// Snapshot of the device a message originates from, attached upstream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub id: i64,
    pub code: String,
    pub description: String,
    pub tenant_id: i64,
    pub properties: Map<String, Value>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub location_description: String,
    pub sensors: Vec<Sensor>,
}

impl Device {
    pub fn sensor_by_external_id(&self, external_id: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| s.external_id == external_id)
    }

    /// Latitude, longitude and altitude, when the device has a position.
    pub fn location(&self) -> Option<(f64, f64, Option<f64>)> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some((latitude, longitude, self.altitude)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Sensor {
    pub id: i64,
    pub code: String,
    pub description: String,
    pub external_id: String,
    pub brand: String,
    pub properties: Map<String, Value>,
}

/// Bytes as a standard base64 string; `null` reads as empty.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) => STANDARD
                .decode(encoded.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
