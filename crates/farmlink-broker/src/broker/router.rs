// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Outbound message routing.
//!
//! Every accepted TCP connection gets a [`ConnId`] and an mpsc channel
//! to its writer task. The router owns the `ConnId -> sender` map and
//! is the only way handlers address a peer; routing is by logical id
//! membership, never by touching the socket directly.
//!
//! Deliveries never block: `try_send` hands the message to the writer
//! task's queue or fails immediately. A peer that stops reading fills
//! its own queue and loses messages, it cannot stall routing for
//! anyone else. The transport makes no delivery guarantee, so a full
//! queue counts the same as a dead peer.

use super::protocol::Message;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Opaque handle for one live connection.
///
/// Assigned from a process-wide counter at accept time; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    /// Wrap a raw counter value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle to a connection's writer task.
struct ConnectionHandle {
    tx: mpsc::Sender<Message>,
}

/// Connection map plus delivery counters.
///
/// Counters are atomic so delivery only needs a read lock on the map;
/// only register/unregister take the write lock.
#[derive(Default)]
pub struct Router {
    connections: HashMap<ConnId, ConnectionHandle>,
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
}

/// Snapshot of delivery statistics.
#[derive(Debug, Default, Clone)]
pub struct RouterStats {
    /// Messages handed to a writer task.
    pub messages_sent: u64,
    /// Sends that failed (peer gone, writer task dead, or queue full).
    pub send_failures: u64,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound channel.
    pub fn register(&mut self, conn: ConnId, tx: mpsc::Sender<Message>) {
        self.connections.insert(conn, ConnectionHandle { tx });
    }

    /// Remove a connection.
    pub fn unregister(&mut self, conn: &ConnId) {
        self.connections.remove(conn);
    }

    /// Deliver one message to one connection without blocking.
    ///
    /// Returns false if the connection is unknown, its writer task is
    /// gone, or its queue is full; the caller treats all three the same
    /// as "not connected".
    pub fn send_to(&self, conn: ConnId, msg: Message) -> bool {
        match self.connections.get(&conn) {
            Some(handle) => match handle.tx.try_send(msg) {
                Ok(()) => {
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => {
                    self.send_failures.fetch_add(1, Ordering::Relaxed);
                    false
                }
            },
            None => {
                self.send_failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Deliver one message to each of the given connections.
    ///
    /// Returns the number of successful deliveries.
    pub fn fan_out(&self, targets: &[ConnId], msg: &Message) -> usize {
        let mut sent = 0;
        for conn in targets {
            if self.send_to(*conn, msg.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of delivery statistics.
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    fn is_connected(&self, conn: &ConnId) -> bool {
        self.connections.contains_key(conn)
    }
}
