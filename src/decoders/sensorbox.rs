//! Decoder for the PZLD sensorbox.
//!
//! Uplinks on LoRa port 1 carry 19 little-endian signed 16-bit channels.
//! Each channel is scaled into one measurement; messages on other ports
//! pass through untouched.

use anyhow::Context;
use serde_json::Value;

use crate::pipeline::PipelineMessage;
use crate::utils::error::ProcessError;

pub const WORKER_ID: &str = "pzld-sensorbox";
pub const MEASUREMENT_PORT: u8 = 1;

struct Channel {
    observed_property: &'static str,
    sensor: &'static str,
    unit: &'static str,
    divisor: f64,
}

const fn channel(
    observed_property: &'static str,
    sensor: &'static str,
    unit: &'static str,
    divisor: f64,
) -> Channel {
    Channel {
        observed_property,
        sensor,
        unit,
        divisor,
    }
}

/// Wire order of the uplink channels.
const CHANNELS: [Channel; 19] = [
    channel("no2", "no2b43f", "ppb", 1.0),
    channel("no2_op1", "no2b43f", "mV", 10.0),
    channel("no2_op2", "no2b43f", "mV", 10.0),
    channel("ox", "oxb431", "ppb", 1.0),
    channel("ox_op1", "oxb431", "mV", 10.0),
    channel("ox_op2", "oxb431", "mV", 10.0),
    channel("humidity", "prht", "%", 100.0),
    channel("pressure", "prht", "hPa", 10.0),
    channel("temperature", "prht", "Cel", 100.0),
    channel("pm_mc_1", "sps30", "ug/m3", 1.0),
    channel("pm_mc_2_5", "sps30", "ug/m3", 1.0),
    channel("pm_mc_4", "sps30", "ug/m3", 1.0),
    channel("pm_mc_10", "sps30", "ug/m3", 1.0),
    channel("pm_nc_0_5", "sps30", "1/cm3", 1.0),
    channel("pm_nc_1", "sps30", "1/cm3", 1.0),
    channel("pm_nc_2_5", "sps30", "1/cm3", 1.0),
    channel("pm_nc_4", "sps30", "1/cm3", 1.0),
    channel("pm_nc_10", "sps30", "1/cm3", 1.0),
    channel("pm_typical_size", "sps30", "nm", 1000.0),
];

pub const UPLINK_LEN: usize = CHANNELS.len() * 2;

/// Scaled channel values in wire order.
pub fn decode_uplink(data: &[u8]) -> Result<Vec<f64>, ProcessError> {
    if data.len() < UPLINK_LEN {
        return Err(ProcessError::malformed(format!(
            "insufficient data length: {} bytes, need {UPLINK_LEN}",
            data.len()
        )));
    }
    Ok(CHANNELS
        .iter()
        .zip(data.chunks_exact(2))
        .map(|(channel, raw)| f64::from(i16::from_le_bytes([raw[0], raw[1]])) / channel.divisor)
        .collect())
}

/// The worker transform.
pub fn process(message: &mut PipelineMessage) -> anyhow::Result<()> {
    // network servers may send the port as 1 or 1.0
    let fport = message.metadata.get("fport").and_then(Value::as_f64);
    if fport != Some(f64::from(MEASUREMENT_PORT)) {
        return Ok(());
    }

    let values = decode_uplink(&message.payload).context("decode uplink")?;
    for (channel, value) in CHANNELS.iter().zip(values) {
        message
            .new_measurement()
            .set_sensor(channel.sensor)
            .set_value(value, channel.observed_property, channel.unit)
            .add()?;
    }
    Ok(())
}
