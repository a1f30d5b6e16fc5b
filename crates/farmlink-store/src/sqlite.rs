// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! SQLite archive backend
//!
//! Default durable storage, no external services required.

use crate::{DocumentRef, ReadingStore, SensorReading};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// SQLite reading store.
///
/// Thread-safe via internal Mutex (SQLite `Connection` is not Sync).
///
/// # Schema
///
/// ```sql
/// CREATE TABLE readings (
///     id INTEGER PRIMARY KEY AUTOINCREMENT,
///     chip_id TEXT NOT NULL,
///     temperature INTEGER NOT NULL,
///     humidity INTEGER NOT NULL,
///     soil_moisture INTEGER NOT NULL,
///     light_intensity INTEGER NOT NULL,
///     motor_status TEXT NOT NULL,
///     stored_at_ns INTEGER NOT NULL
/// );
/// CREATE INDEX idx_chip_id ON readings(chip_id);
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a file-based database.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database at {}", path.display()))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to create in-memory SQLite database")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chip_id TEXT NOT NULL,
                temperature INTEGER NOT NULL,
                humidity INTEGER NOT NULL,
                soil_moisture INTEGER NOT NULL,
                light_intensity INTEGER NOT NULL,
                motor_status TEXT NOT NULL,
                stored_at_ns INTEGER NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chip_id ON readings(chip_id)",
            [],
        )?;

        Ok(())
    }

    /// Load all readings for a chip, oldest first.
    pub fn readings_for_chip(&self, chip_id: &str) -> Result<Vec<SensorReading>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chip_id, temperature, humidity, soil_moisture, light_intensity, motor_status
             FROM readings WHERE chip_id = ?1 ORDER BY id ASC",
        )?;

        let rows = stmt.query_map(params![chip_id], |row| {
            Ok(SensorReading {
                chip_id: row.get(0)?,
                temperature: row.get(1)?,
                humidity: row.get(2)?,
                soil_moisture: row.get(3)?,
                light_intensity: row.get(4)?,
                motor_status: row.get(5)?,
            })
        })?;

        let mut readings = Vec::new();
        for row in rows {
            readings.push(row?);
        }
        Ok(readings)
    }

    /// Total number of stored readings.
    pub fn reading_count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM readings", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl ReadingStore for SqliteStore {
    fn store_reading(&self, reading: &SensorReading) -> Result<DocumentRef> {
        let stored_at_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO readings
                (chip_id, temperature, humidity, soil_moisture, light_intensity, motor_status, stored_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                reading.chip_id,
                reading.temperature,
                reading.humidity,
                reading.soil_moisture,
                reading.light_intensity,
                reading.motor_status,
                stored_at_ns,
            ],
        )
        .context("Failed to insert reading")?;

        Ok(DocumentRef(conn.last_insert_rowid()))
    }
}
