// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Farmlink Telemetry Broker
//!
//! Central relay between field chips (sensor/actuator units) and
//! monitoring clients:
//!
//! - chips register under an opaque `chipId` and push sensor readings,
//!   motor status and heartbeats
//! - clients subscribe to a set of chip ids and receive every message
//!   those chips produce, plus connect/disconnect notifications
//! - a process-wide scheduler polls chips whose readings have gone
//!   stale, and accepted readings are archived through
//!   [`farmlink_store::ReadingStore`]
//!
//! # Architecture
//!
//! ```text
//! Broker
//! +-- accept loop          (one task per TCP connection)
//! +-- BrokerState          (DeviceRegistry + SubscriptionTable, one lock)
//! +-- Router               (ConnId -> outbound channel, fan-out)
//! +-- poll scheduler       (single recurring task)
//! +-- ReadingStore         (archival, off the critical section)
//! ```

pub mod broker;
pub mod config;

pub use broker::Broker;
pub use config::BrokerConfig;
