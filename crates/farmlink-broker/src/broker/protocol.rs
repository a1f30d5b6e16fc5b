// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Broker wire protocol.
//!
//! Length-prefixed JSON, one object per frame:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON payload      |
//! +----------------+-------------------+
//! ```
//!
//! Every payload is tagged with a `"type"` field. The message set is a
//! closed sum type: required fields are enforced by deserialization, so
//! handlers never probe for field presence at runtime. `heartbeat`,
//! `motorStatusResponse`, `motor_action` and `sensorDataResponse` may
//! carry extra chip-specific fields, which are preserved verbatim
//! through relaying.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broker protocol message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// Chip announces itself under its `chipId`.
    #[serde(rename = "register", rename_all = "camelCase")]
    Register { chip_id: String },

    /// Broker acknowledges a chip registration.
    #[serde(rename = "registerConfirm", rename_all = "camelCase")]
    RegisterConfirm { chip_id: String },

    /// Client replaces its subscription set wholesale.
    #[serde(rename = "clientRegister", rename_all = "camelCase")]
    ClientRegister { chip_ids: Vec<String> },

    /// Broker confirms one subscribed chip id is registered.
    #[serde(rename = "success", rename_all = "camelCase")]
    Success { chip_id: String, message: String },

    /// Client commands a chip's motor; forwarded verbatim.
    #[serde(rename = "motor_action", rename_all = "camelCase")]
    MotorAction {
        chip_id: String,
        status: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Ask a chip for a fresh sensor reading.
    #[serde(rename = "sensorDataRequest", rename_all = "camelCase")]
    SensorDataRequest { chip_id: String },

    /// Chip reports a sensor reading.
    ///
    /// Numeric fields are kept as raw JSON values here: chips in the
    /// field send numbers or numeric strings interchangeably, and
    /// fan-out must not reshape what subscribers see. The archival gate
    /// does the integer parsing.
    #[serde(rename = "sensorDataResponse", rename_all = "camelCase")]
    SensorDataResponse {
        chip_id: String,
        #[serde(default)]
        temperature: Value,
        #[serde(default)]
        humidity: Value,
        #[serde(default)]
        soil_moisture: Value,
        #[serde(default)]
        light_intensity: Value,
        #[serde(default)]
        motor_status: Value,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Chip reports its motor status.
    #[serde(rename = "motorStatusResponse", rename_all = "camelCase")]
    MotorStatusResponse {
        chip_id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Chip liveness signal; relayed to subscribers, archival-inert.
    #[serde(rename = "heartbeat", rename_all = "camelCase")]
    Heartbeat {
        #[serde(default)]
        chip_id: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },

    /// Broker-initiated: a subscribed chip came online.
    #[serde(rename = "chipConnected", rename_all = "camelCase")]
    ChipConnected { chip_id: String, status: String },

    /// Broker-initiated: a subscribed chip went offline.
    #[serde(rename = "chipDisconnected", rename_all = "camelCase")]
    ChipDisconnected { chip_id: String, status: String },

    /// Broker-initiated: validation or routing failure.
    #[serde(rename = "error")]
    Error { message: String },
}

impl Message {
    /// Build an `error` reply.
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Build a `chipConnected` notification.
    pub fn chip_connected(chip_id: impl Into<String>) -> Self {
        Message::ChipConnected {
            chip_id: chip_id.into(),
            status: "connected".into(),
        }
    }

    /// Build a `chipDisconnected` notification.
    pub fn chip_disconnected(chip_id: impl Into<String>) -> Self {
        Message::ChipDisconnected {
            chip_id: chip_id.into(),
            status: "disconnected".into(),
        }
    }

    /// Wire name of this message's type tag (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "register",
            Message::RegisterConfirm { .. } => "registerConfirm",
            Message::ClientRegister { .. } => "clientRegister",
            Message::Success { .. } => "success",
            Message::MotorAction { .. } => "motor_action",
            Message::SensorDataRequest { .. } => "sensorDataRequest",
            Message::SensorDataResponse { .. } => "sensorDataResponse",
            Message::MotorStatusResponse { .. } => "motorStatusResponse",
            Message::Heartbeat { .. } => "heartbeat",
            Message::ChipConnected { .. } => "chipConnected",
            Message::ChipDisconnected { .. } => "chipDisconnected",
            Message::Error { .. } => "error",
        }
    }
}
