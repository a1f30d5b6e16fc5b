// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Archival gate payload handling.
//!
//! Converts a `sensorDataResponse` payload into a [`SensorReading`].
//! Chips report numeric fields as JSON numbers or numeric strings;
//! both parse to integers here. The gate itself (the per-interval rate
//! limit) lives in [`super::registry::DeviceRegistry::touch_archived`];
//! this module only shapes the data once the gate has opened.

use farmlink_store::SensorReading;
use serde_json::Value;
use thiserror::Error;

/// Payload faults that prevent archiving a reading.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("field {field} is not an integer: {value}")]
    NotAnInteger { field: &'static str, value: String },
}

/// Build a reading from the raw `sensorDataResponse` fields.
pub fn build_reading(
    chip_id: &str,
    temperature: &Value,
    humidity: &Value,
    soil_moisture: &Value,
    light_intensity: &Value,
    motor_status: &Value,
) -> Result<SensorReading, ArchiveError> {
    Ok(SensorReading {
        chip_id: chip_id.to_string(),
        temperature: parse_int("temperature", temperature)?,
        humidity: parse_int("humidity", humidity)?,
        soil_moisture: parse_int("soilMoisture", soil_moisture)?,
        light_intensity: parse_int("lightIntensity", light_intensity)?,
        motor_status: stringify(motor_status),
    })
}

/// Parse a JSON number or numeric string as an integer. Fractional
/// values truncate toward zero, matching what the chips' firmware sends
/// for sensors that report whole units.
fn parse_int(field: &'static str, value: &Value) -> Result<i64, ArchiveError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    };

    parsed.ok_or_else(|| ArchiveError::NotAnInteger {
        field,
        value: value.to_string(),
    })
}

/// Stringify the motor status the way the original firmware expects:
/// strings pass through, anything else renders as its JSON text.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
