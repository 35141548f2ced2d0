use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pipeline::message::PipelineMessage;
use crate::utils::error::MessageError;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Measurement {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub sensor_external_id: String,
    pub value: f64,
    pub observed_property: String,
    pub unit_of_measurement: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub properties: Map<String, Value>,
}

/// Fluent builder for one measurement on a [`PipelineMessage`].
///
/// The first setter that rejects its input records the error; later
/// setters are skipped and [`MeasurementBuilder::add`] returns it without
/// touching the message.
#[must_use = "a measurement is only stored by calling `add()`"]
pub struct MeasurementBuilder<'a> {
    message: &'a mut PipelineMessage,
    measurement: Measurement,
    has_value: bool,
    has_location: bool,
    error: Option<MessageError>,
}

impl<'a> MeasurementBuilder<'a> {
    pub(crate) fn new(message: &'a mut PipelineMessage) -> Self {
        let measurement = Measurement {
            timestamp: message.timestamp,
            ..Default::default()
        };
        Self {
            message,
            measurement,
            has_value: false,
            has_location: false,
            error: None,
        }
    }

    fn record(mut self, step: impl FnOnce(&mut Self) -> Result<(), MessageError>) -> Self {
        if self.error.is_none() {
            if let Err(err) = step(&mut self) {
                self.error = Some(err);
            }
        }
        self
    }

    pub fn set_timestamp(self, timestamp: i64) -> Self {
        self.record(|b| {
            b.measurement.timestamp = timestamp;
            Ok(())
        })
    }

    pub fn set_sensor(self, external_id: &str) -> Self {
        self.record(|b| {
            if external_id.trim().is_empty() {
                return Err(MessageError::EmptySensorId);
            }
            b.measurement.sensor_external_id = external_id.to_string();
            Ok(())
        })
    }

    pub fn set_value(self, value: f64, observed_property: &str, unit_of_measurement: &str) -> Self {
        self.record(|b| {
            if !value.is_finite() {
                return Err(MessageError::InvalidValue(value));
            }
            b.measurement.value = value;
            b.measurement.observed_property = observed_property.to_string();
            b.measurement.unit_of_measurement = unit_of_measurement.to_string();
            b.has_value = true;
            Ok(())
        })
    }

    pub fn set_metadata(self, properties: Map<String, Value>) -> Self {
        self.record(|b| {
            b.measurement.properties = properties;
            Ok(())
        })
    }

    pub fn set_location(self, latitude: f64, longitude: f64, altitude: f64) -> Self {
        self.record(|b| {
            if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                return Err(MessageError::InvalidLocation {
                    latitude,
                    longitude,
                });
            }
            b.measurement.latitude = Some(latitude);
            b.measurement.longitude = Some(longitude);
            b.measurement.altitude = Some(altitude);
            b.has_location = true;
            Ok(())
        })
    }

    /// Appends the measurement, or returns the first recorded error.
    pub fn add(self) -> Result<(), MessageError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if !self.has_value {
            return Err(MessageError::MissingValue);
        }

        let mut measurement = self.measurement;
        if !self.has_location {
            if let Some((latitude, longitude, altitude)) =
                self.message.device.as_ref().and_then(|d| d.location())
            {
                measurement.latitude = Some(latitude);
                measurement.longitude = Some(longitude);
                measurement.altitude = altitude;
            }
        }
        self.message.measurements.push(measurement);
        Ok(())
    }
}
