// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Client subscription table: connection -> set of chip ids.
//!
//! Each `clientRegister` replaces the client's set wholesale (last
//! write wins, no merge). The table is read fresh on every fan-out, so
//! there is no cached iterator state to go stale.

use super::router::ConnId;
use std::collections::{HashMap, HashSet};

/// Subscriptions of all connected clients.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscriptions: HashMap<ConnId, HashSet<String>>,
}

impl SubscriptionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a client's subscription set wholesale.
    pub fn set_subscription(&mut self, conn: ConnId, chip_ids: HashSet<String>) {
        self.subscriptions.insert(conn, chip_ids);
    }

    /// Clients currently subscribed to `chip_id`.
    pub fn subscribers_of<'a>(&'a self, chip_id: &'a str) -> impl Iterator<Item = ConnId> + 'a {
        self.subscriptions
            .iter()
            .filter(move |(_, chips)| chips.contains(chip_id))
            .map(|(conn, _)| *conn)
    }

    /// Drop a client's subscriptions.
    pub fn remove_by_handle(&mut self, conn: ConnId) {
        self.subscriptions.remove(&conn);
    }

    /// Number of clients with a subscription set.
    pub fn client_count(&self) -> usize {
        self.subscriptions.len()
    }
}
