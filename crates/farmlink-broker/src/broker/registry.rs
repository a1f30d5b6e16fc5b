// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Device registry: chip id -> live connection + archival timestamp.
//!
//! One entry per known chip. At most one live connection per chip id
//! (last register wins). `last_archived_at` only ever advances, and it
//! advances when an archival attempt is initiated, not when it
//! completes; that keeps one attempt per chip per interval even if the
//! storage write later fails.

use super::router::ConnId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Outcome of a register call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterResult {
    /// True if the chip id was already known; its handle was replaced
    /// and its archival history kept.
    pub already_connected: bool,
}

#[derive(Debug)]
struct DeviceEntry {
    conn: ConnId,
    /// None = never archived, always due.
    last_archived_at: Option<Instant>,
}

/// Registry of connected chips.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, DeviceEntry>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chip under `chip_id`.
    ///
    /// A fresh entry starts with no archival history. Re-registering an
    /// existing id only swaps the connection handle: archival history
    /// survives reconnects as long as the entry itself does.
    pub fn register(&mut self, chip_id: &str, conn: ConnId) -> RegisterResult {
        match self.devices.get_mut(chip_id) {
            Some(entry) => {
                entry.conn = conn;
                RegisterResult {
                    already_connected: true,
                }
            }
            None => {
                self.devices.insert(
                    chip_id.to_string(),
                    DeviceEntry {
                        conn,
                        last_archived_at: None,
                    },
                );
                RegisterResult {
                    already_connected: false,
                }
            }
        }
    }

    /// Connection handle for a chip, if registered.
    pub fn lookup(&self, chip_id: &str) -> Option<ConnId> {
        self.devices.get(chip_id).map(|entry| entry.conn)
    }

    /// Archival gate: advance `last_archived_at` to `now` if at least
    /// `interval` has passed since the last accepted attempt.
    ///
    /// Returns true exactly when the caller should attempt an archival
    /// write. False for unknown chips and for attempts inside the
    /// interval.
    pub fn touch_archived(&mut self, chip_id: &str, now: Instant, interval: Duration) -> bool {
        let Some(entry) = self.devices.get_mut(chip_id) else {
            return false;
        };

        let due = match entry.last_archived_at {
            None => true,
            // saturates to zero if now < last, so the timestamp can
            // never move backward
            Some(last) => now.duration_since(last) >= interval,
        };

        if due {
            entry.last_archived_at = Some(now);
        }
        due
    }

    /// Chips whose last accepted archival is at least `interval` old,
    /// with their connection handles. Does not advance any timestamp.
    pub fn due_for_poll(&self, now: Instant, interval: Duration) -> Vec<(String, ConnId)> {
        self.devices
            .iter()
            .filter(|(_, entry)| match entry.last_archived_at {
                None => true,
                Some(last) => now.duration_since(last) >= interval,
            })
            .map(|(chip_id, entry)| (chip_id.clone(), entry.conn))
            .collect()
    }

    /// Delete the entry whose current handle is `conn`, returning its
    /// chip id.
    ///
    /// Linear scan over all devices. Fine at the expected fleet scale
    /// (tens to low hundreds of chips); revisit with a reverse index if
    /// that ever changes.
    pub fn remove_by_handle(&mut self, conn: ConnId) -> Option<String> {
        let chip_id = self
            .devices
            .iter()
            .find(|(_, entry)| entry.conn == conn)
            .map(|(chip_id, _)| chip_id.clone())?;

        self.devices.remove(&chip_id);
        Some(chip_id)
    }

    /// Number of registered chips.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    #[cfg(test)]
    fn last_archived_at(&self, chip_id: &str) -> Option<Instant> {
        self.devices.get(chip_id).and_then(|e| e.last_archived_at)
    }
}
