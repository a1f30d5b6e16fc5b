// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Farmlink reading archive
//!
//! Durable storage for sensor readings relayed by the broker.
//!
//! The broker only sees the [`ReadingStore`] trait; which backend sits
//! behind it is a deployment decision. The default backend is SQLite
//! ([`SqliteStore`]), which needs no external services. [`MemoryStore`]
//! exists for tests.
//!
//! Calls carry no ordering guarantee relative to each other and callers
//! must not assume success: a failed write is reported, not retried.

pub mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

/// One archived sensor reading from a chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Chip identifier (externally assigned, opaque).
    pub chip_id: String,

    /// Temperature, integer units as reported by the chip.
    pub temperature: i64,

    /// Relative humidity.
    pub humidity: i64,

    /// Soil moisture level.
    pub soil_moisture: i64,

    /// Light intensity.
    pub light_intensity: i64,

    /// Motor (pump) status, stringified.
    pub motor_status: String,
}

/// Reference to a stored reading (backend row/document id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentRef(pub i64);

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage backend for sensor readings.
///
/// Implementations must be callable from blocking worker threads; the
/// broker invokes `store_reading` outside its state critical section.
pub trait ReadingStore: Send + Sync {
    /// Persist one reading, returning a reference to the stored row.
    fn store_reading(&self, reading: &SensorReading) -> Result<DocumentRef>;
}

/// In-memory store for tests.
///
/// Keeps readings in insertion order; `DocumentRef` is the index.
#[derive(Debug, Default)]
pub struct MemoryStore {
    readings: Mutex<Vec<SensorReading>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored so far.
    pub fn readings(&self) -> Vec<SensorReading> {
        self.readings.lock().unwrap().clone()
    }

    /// Number of stored readings.
    pub fn len(&self) -> usize {
        self.readings.lock().unwrap().len()
    }

    /// True if nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReadingStore for MemoryStore {
    fn store_reading(&self, reading: &SensorReading) -> Result<DocumentRef> {
        let mut readings = self.readings.lock().unwrap();
        readings.push(reading.clone());
        Ok(DocumentRef(readings.len() as i64 - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_reading(chip_id: &str) -> SensorReading {
        SensorReading {
            chip_id: chip_id.into(),
            temperature: 24,
            humidity: 61,
            soil_moisture: 512,
            light_intensity: 800,
            motor_status: "OFF".into(),
        }
    }

    #[test]
    fn memory_store_returns_sequential_refs() {
        let store = MemoryStore::new();
        let r1 = store.store_reading(&sample_reading("dev1")).unwrap();
        let r2 = store.store_reading(&sample_reading("dev2")).unwrap();
        assert_eq!(r1, DocumentRef(0));
        assert_eq!(r2, DocumentRef(1));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn memory_store_keeps_insertion_order() {
        let store = MemoryStore::new();
        store.store_reading(&sample_reading("a")).unwrap();
        store.store_reading(&sample_reading("b")).unwrap();
        let readings = store.readings();
        assert_eq!(readings[0].chip_id, "a");
        assert_eq!(readings[1].chip_id, "b");
    }

    #[test]
    fn document_ref_display() {
        assert_eq!(DocumentRef(42).to_string(), "42");
    }
}
