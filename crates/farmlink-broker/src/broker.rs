// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 farmlink contributors

//! Broker core implementation.

use crate::config::{BrokerConfig, ConfigError};
use farmlink_store::{ReadingStore, SqliteStore};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, info, warn};

pub mod archive;
pub mod connection;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod subscriptions;

pub use connection::PeerConnection;
use protocol::Message;
pub use registry::{DeviceRegistry, RegisterResult};
pub use router::{ConnId, Router, RouterStats};
pub use subscriptions::SubscriptionTable;

/// Registry plus subscription table behind one lock.
///
/// Every mutation happens inside a single write-lock section and no
/// handler suspends mid-mutation, so state changes are serialized: a
/// message, disconnect, or poll tick sees either all or none of another
/// event's effects. Blocking work (archival writes) happens after the
/// lock is released.
#[derive(Debug, Default)]
pub struct BrokerState {
    pub registry: DeviceRegistry,
    pub subscriptions: SubscriptionTable,
}

impl BrokerState {
    fn new() -> Self {
        Self::default()
    }
}

/// Telemetry broker - relays chip/client traffic and archives readings.
#[derive(Clone)]
pub struct Broker {
    config: Arc<BrokerConfig>,
    state: Arc<RwLock<BrokerState>>,
    router: Arc<RwLock<Router>>,
    store: Arc<dyn ReadingStore>,
    shutdown: Arc<Notify>,
    running: Arc<AtomicBool>,
    next_conn_id: Arc<AtomicU64>,
}

impl Broker {
    /// Create a broker with the default SQLite archive backend.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let store = SqliteStore::new(&config.db_path)?;
        Self::with_store(config, Arc::new(store))
    }

    /// Create a broker with an explicit archive backend.
    pub fn with_store(
        config: BrokerConfig,
        store: Arc<dyn ReadingStore>,
    ) -> Result<Self, BrokerError> {
        config.validate()?;

        Ok(Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BrokerState::new())),
            router: Arc::new(RwLock::new(Router::new())),
            store,
            shutdown: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), BrokerError> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyRunning);
        }

        if let Ok(addr) = listener.local_addr() {
            info!("Broker listening on {}", addr);
        }

        self.spawn_poll_scheduler();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let broker = self.clone();
                            tokio::spawn(async move {
                                broker.handle_connection(stream, peer_addr).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the broker to shut down.
    pub async fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    /// Check if the broker is serving.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of registered chips.
    pub async fn device_count(&self) -> usize {
        self.state.read().await.registry.device_count()
    }

    /// Number of clients with an active subscription set.
    pub async fn client_count(&self) -> usize {
        self.state.read().await.subscriptions.client_count()
    }

    /// Number of live connections of either kind.
    pub async fn connection_count(&self) -> usize {
        self.router.read().await.connection_count()
    }

    /// One process-wide recurring poll task.
    ///
    /// Each tick asks every chip whose last accepted archival is older
    /// than the archival interval for a fresh reading. The timestamp
    /// only advances when the chip's response passes the archival gate,
    /// so an unresponsive chip is simply asked again next tick.
    fn spawn_poll_scheduler(&self) {
        let state = self.state.clone();
        let router = self.router.clone();
        let shutdown = self.shutdown.clone();
        let poll_interval = self.config.poll_interval();
        let archival_interval = self.config.archival_interval();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {
                        let due = state
                            .read()
                            .await
                            .registry
                            .due_for_poll(Instant::now(), archival_interval);
                        if due.is_empty() {
                            continue;
                        }

                        debug!("Polling {} stale chip(s)", due.len());
                        let router = router.read().await;
                        for (chip_id, conn) in due {
                            let sent = router
                                .send_to(conn, Message::SensorDataRequest { chip_id: chip_id.clone() });
                            if !sent {
                                debug!(%chip_id, "Poll skipped, chip not reachable");
                            }
                        }
                    }
                    _ = shutdown.notified() => {
                        debug!("Poll scheduler shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Drive one connection until it closes, then reconcile state.
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let conn_id = ConnId::new(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let mut conn = PeerConnection::new(stream, peer_addr, self.config.max_message_size);

        // Outbound channel: everything addressed to this peer goes
        // through the router into this queue. Deliveries drop rather
        // than wait when the queue is full, so a peer that stops
        // reading only loses its own messages.
        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<Message>(self.config.outbound_queue_len);
        self.router.write().await.register(conn_id, outbound_tx);

        info!(%conn_id, %peer_addr, "Connection accepted");

        loop {
            tokio::select! {
                result = conn.read_frame() => {
                    match result {
                        Ok(Some(frame)) => {
                            match serde_json::from_slice::<Message>(&frame) {
                                Ok(msg) => self.dispatch(conn_id, msg).await,
                                Err(e) => {
                                    // Payload fault: report and keep the
                                    // connection open.
                                    warn!(%conn_id, "Malformed payload: {}", e);
                                    self.router
                                        .read()
                                        .await
                                        .send_to(conn_id, Message::error(format!("malformed message: {}", e)));
                                }
                            }
                        }
                        Ok(None) => {
                            info!(%conn_id, %peer_addr, "Connection closed");
                            break;
                        }
                        Err(e) => {
                            warn!(%conn_id, %peer_addr, "Read error: {}", e);
                            break;
                        }
                    }
                }
                Some(outbound) = outbound_rx.recv() => {
                    if let Err(e) = conn.send_message(&outbound).await {
                        warn!(%conn_id, %peer_addr, "Send failed: {}", e);
                        break;
                    }
                }
                _ = self.shutdown.notified() => {
                    debug!(%conn_id, "Connection handler shutting down");
                    break;
                }
            }
        }

        self.reconcile_disconnect(conn_id).await;
    }

    /// Route one inbound message.
    async fn dispatch(&self, conn: ConnId, msg: Message) {
        debug!(%conn, kind = msg.type_name(), "Dispatching");

        match msg {
            Message::Register { chip_id } => self.handle_register(conn, chip_id).await,

            Message::ClientRegister { chip_ids } => {
                self.handle_client_register(conn, chip_ids).await
            }

            Message::MotorAction { ref chip_id, .. } => {
                let chip_id = chip_id.clone();
                self.forward_to_chip(conn, chip_id, msg).await
            }

            Message::SensorDataRequest { ref chip_id } => {
                let chip_id = chip_id.clone();
                self.forward_to_chip(conn, chip_id, msg).await
            }

            Message::SensorDataResponse { ref chip_id, .. } => {
                let chip_id = chip_id.clone();
                self.handle_device_report(conn, chip_id, msg, true).await
            }

            Message::MotorStatusResponse { ref chip_id, .. } => {
                let chip_id = chip_id.clone();
                self.handle_device_report(conn, chip_id, msg, false).await
            }

            Message::Heartbeat { ref chip_id, .. } => match chip_id.clone() {
                Some(chip_id) => self.handle_device_report(conn, chip_id, msg, false).await,
                // Original firmware revisions sent bare heartbeats;
                // nothing to route without a chip id.
                None => debug!(%conn, "Heartbeat without chipId"),
            },

            Message::Error { message } => {
                warn!(%conn, "Peer reported error: {}", message);
            }

            // Broker-originated types arriving inbound are noise.
            Message::RegisterConfirm { .. }
            | Message::Success { .. }
            | Message::ChipConnected { .. }
            | Message::ChipDisconnected { .. } => {
                debug!(%conn, kind = msg.type_name(), "Ignoring broker-originated type from peer");
            }
        }
    }

    /// `register`: record the chip, confirm to the sender, notify
    /// subscribers that the chip is online.
    async fn handle_register(&self, conn: ConnId, chip_id: String) {
        let (result, subscribers) = {
            let mut state = self.state.write().await;
            let result = state.registry.register(&chip_id, conn);
            let subscribers: Vec<ConnId> = state.subscriptions.subscribers_of(&chip_id).collect();
            (result, subscribers)
        };

        if result.already_connected {
            info!(%chip_id, %conn, "Chip re-registered, handle replaced");
        } else {
            info!(%chip_id, %conn, "Chip registered");
        }

        let router = self.router.read().await;
        router.send_to(
            conn,
            Message::RegisterConfirm {
                chip_id: chip_id.clone(),
            },
        );
        router.fan_out(&subscribers, &Message::chip_connected(chip_id));
    }

    /// `clientRegister`: replace the subscription set, answer per id.
    async fn handle_client_register(&self, conn: ConnId, chip_ids: Vec<String>) {
        let results: Vec<(String, bool)> = {
            let mut state = self.state.write().await;
            state
                .subscriptions
                .set_subscription(conn, chip_ids.iter().cloned().collect());
            chip_ids
                .iter()
                .map(|id| (id.clone(), state.registry.lookup(id).is_some()))
                .collect()
        };

        info!(%conn, chips = results.len(), "Client subscription replaced");

        let router = self.router.read().await;
        for (chip_id, registered) in results {
            let reply = if registered {
                Message::Success {
                    message: format!("subscribed to {}", chip_id),
                    chip_id,
                }
            } else {
                Message::error(format!("chip {} is not registered", chip_id))
            };
            router.send_to(conn, reply);
        }
    }

    /// Forward a message verbatim to a chip's connection, or report
    /// `error` back to the sender if the chip is not connected.
    async fn forward_to_chip(&self, sender: ConnId, chip_id: String, msg: Message) {
        let target = self.state.read().await.registry.lookup(&chip_id);

        let router = self.router.read().await;
        let delivered = match target {
            Some(target) => router.send_to(target, msg),
            None => false,
        };

        if !delivered {
            router.send_to(
                sender,
                Message::error(format!("chip {} is not connected", chip_id)),
            );
        }
    }

    /// Chip-originated report: lazily self-heal the registry, fan out
    /// to subscribers, then (for sensor readings) evaluate the archival
    /// gate.
    async fn handle_device_report(
        &self,
        conn: ConnId,
        chip_id: String,
        msg: Message,
        archival: bool,
    ) {
        let (subscribers, archive_due) = {
            let mut state = self.state.write().await;

            if state.registry.lookup(&chip_id).is_none() {
                state.registry.register(&chip_id, conn);
                info!(%chip_id, %conn, "Lazily registered chip from its own report");
            }

            let archive_due = archival
                && state.registry.touch_archived(
                    &chip_id,
                    Instant::now(),
                    self.config.archival_interval(),
                );

            let subscribers: Vec<ConnId> = state.subscriptions.subscribers_of(&chip_id).collect();
            (subscribers, archive_due)
        };

        if !subscribers.is_empty() {
            let sent = self.router.read().await.fan_out(&subscribers, &msg);
            debug!(%chip_id, kind = msg.type_name(), subscribers = sent, "Fanned out");
        }

        if archive_due {
            self.archive_reading(&chip_id, &msg);
        }
    }

    /// Hand an accepted reading to the store on a blocking worker. The
    /// interval is already consumed at this point: a parse or storage
    /// failure loses the reading, by policy.
    fn archive_reading(&self, chip_id: &str, msg: &Message) {
        let Message::SensorDataResponse {
            temperature,
            humidity,
            soil_moisture,
            light_intensity,
            motor_status,
            ..
        } = msg
        else {
            return;
        };

        match archive::build_reading(
            chip_id,
            temperature,
            humidity,
            soil_moisture,
            light_intensity,
            motor_status,
        ) {
            Ok(reading) => {
                let store = self.store.clone();
                tokio::task::spawn_blocking(move || match store.store_reading(&reading) {
                    Ok(doc) => {
                        debug!(chip_id = %reading.chip_id, %doc, "Archived reading");
                    }
                    Err(e) => {
                        warn!(chip_id = %reading.chip_id, "Failed to archive reading: {:#}", e);
                    }
                });
            }
            Err(e) => {
                warn!(%chip_id, "Unusable sensor payload: {}", e);
            }
        }
    }

    /// Transport disconnect: drop the connection from the router and
    /// both tables; if a chip entry went with it, tell its subscribers.
    async fn reconcile_disconnect(&self, conn: ConnId) {
        self.router.write().await.unregister(&conn);

        let (removed_chip, subscribers) = {
            let mut state = self.state.write().await;
            state.subscriptions.remove_by_handle(conn);
            let removed = state.registry.remove_by_handle(conn);
            let subscribers = removed
                .as_ref()
                .map(|chip| state.subscriptions.subscribers_of(chip).collect::<Vec<_>>())
                .unwrap_or_default();
            (removed, subscribers)
        };

        if let Some(chip_id) = removed_chip {
            info!(%chip_id, %conn, "Chip disconnected");
            self.router
                .read()
                .await
                .fan_out(&subscribers, &Message::chip_disconnected(chip_id));
        }
    }
}

/// Broker error types.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("broker already running")]
    AlreadyRunning,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use farmlink_store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn test_broker(store: Arc<MemoryStore>) -> Broker {
        Broker::with_store(BrokerConfig::default(), store).unwrap()
    }

    /// Attach a fake peer: a router entry backed by a plain channel.
    async fn attach(broker: &Broker, raw: u64) -> (ConnId, mpsc::Receiver<Message>) {
        attach_with_capacity(broker, raw, 32).await
    }

    async fn attach_with_capacity(
        broker: &Broker,
        raw: u64,
        capacity: usize,
    ) -> (ConnId, mpsc::Receiver<Message>) {
        let conn = ConnId::new(raw);
        let (tx, rx) = mpsc::channel(capacity);
        broker.router.write().await.register(conn, tx);
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) {
        while rx.try_recv().is_ok() {}
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn sensor_response(chip_id: &str) -> Message {
        serde_json::from_value(json!({
            "type": "sensorDataResponse",
            "chipId": chip_id,
            "temperature": 24,
            "humidity": 61,
            "soilMoisture": 512,
            "lightIntensity": 800,
            "motorStatus": "OFF"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn register_confirms_and_notifies_subscribers() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (client, mut client_rx) = attach(&broker, 1).await;
        let (device, mut device_rx) = attach(&broker, 2).await;

        broker
            .dispatch(
                client,
                Message::ClientRegister {
                    chip_ids: vec!["dev1".into()],
                },
            )
            .await;
        // dev1 not registered yet
        assert!(matches!(
            client_rx.recv().await.unwrap(),
            Message::Error { .. }
        ));

        broker
            .dispatch(
                device,
                Message::Register {
                    chip_id: "dev1".into(),
                },
            )
            .await;

        assert_eq!(
            device_rx.recv().await.unwrap(),
            Message::RegisterConfirm {
                chip_id: "dev1".into()
            }
        );
        assert_eq!(
            client_rx.recv().await.unwrap(),
            Message::chip_connected("dev1")
        );
        assert_eq!(broker.device_count().await, 1);
    }

    #[tokio::test]
    async fn resubscribe_after_register_succeeds() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (client, mut client_rx) = attach(&broker, 1).await;
        let (device, _device_rx) = attach(&broker, 2).await;

        let subscribe = Message::ClientRegister {
            chip_ids: vec!["dev1".into()],
        };

        broker.dispatch(client, subscribe.clone()).await;
        assert!(matches!(
            client_rx.recv().await.unwrap(),
            Message::Error { .. }
        ));

        broker
            .dispatch(
                device,
                Message::Register {
                    chip_id: "dev1".into(),
                },
            )
            .await;
        drain(&mut client_rx); // chipConnected

        broker.dispatch(client, subscribe).await;
        match client_rx.recv().await.unwrap() {
            Message::Success { chip_id, .. } => assert_eq!(chip_id, "dev1"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn motor_action_forwarded_verbatim() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (client, mut client_rx) = attach(&broker, 1).await;
        let (device, mut device_rx) = attach(&broker, 2).await;

        broker
            .dispatch(
                device,
                Message::Register {
                    chip_id: "dev1".into(),
                },
            )
            .await;
        drain(&mut device_rx);

        let action: Message = serde_json::from_value(json!({
            "type": "motor_action",
            "chipId": "dev1",
            "status": "ON",
            "duration": 30
        }))
        .unwrap();

        broker.dispatch(client, action.clone()).await;
        assert_eq!(device_rx.recv().await.unwrap(), action);
        assert!(client_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn motor_action_to_unknown_chip_reports_error() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (client, mut client_rx) = attach(&broker, 1).await;

        broker
            .dispatch(
                client,
                Message::MotorAction {
                    chip_id: "ghost".into(),
                    status: "ON".into(),
                    extra: Default::default(),
                },
            )
            .await;

        match client_rx.recv().await.unwrap() {
            Message::Error { message } => assert!(message.contains("ghost")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn fan_out_matches_subscriptions() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (c1, mut c1_rx) = attach(&broker, 1).await;
        let (c2, mut c2_rx) = attach(&broker, 2).await;
        let (dev_a, _) = attach(&broker, 3).await;
        let (dev_b, _) = attach(&broker, 4).await;

        broker
            .dispatch(
                c1,
                Message::ClientRegister {
                    chip_ids: vec!["A".into(), "B".into()],
                },
            )
            .await;
        broker
            .dispatch(
                c2,
                Message::ClientRegister {
                    chip_ids: vec!["B".into()],
                },
            )
            .await;
        drain(&mut c1_rx);
        drain(&mut c2_rx);

        broker.dispatch(dev_b, sensor_response("B")).await;
        assert_eq!(c1_rx.recv().await.unwrap(), sensor_response("B"));
        assert_eq!(c2_rx.recv().await.unwrap(), sensor_response("B"));

        broker.dispatch(dev_a, sensor_response("A")).await;
        assert_eq!(c1_rx.recv().await.unwrap(), sensor_response("A"));
        assert!(c2_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_other_peers() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        // a subscriber whose writer queue is tiny and never drained
        let (slow, _slow_rx) = attach_with_capacity(&broker, 1, 1).await;
        let (device, mut device_rx) = attach(&broker, 2).await;

        broker
            .dispatch(
                slow,
                Message::ClientRegister {
                    chip_ids: vec!["dev1".into()],
                },
            )
            .await;
        // the reply filled the slow peer's queue; every later delivery
        // to it must be dropped, not waited on

        broker.dispatch(device, sensor_response("dev1")).await;
        broker.dispatch(device, sensor_response("dev1")).await;

        let (other, mut other_rx) = attach(&broker, 3).await;
        tokio::time::timeout(
            Duration::from_millis(500),
            broker.dispatch(
                other,
                Message::Register {
                    chip_id: "dev2".into(),
                },
            ),
        )
        .await
        .expect("register stalled behind a slow peer's full queue");

        assert_eq!(
            other_rx.recv().await.unwrap(),
            Message::RegisterConfirm {
                chip_id: "dev2".into()
            }
        );
        assert!(broker.router.read().await.stats().send_failures >= 1);
        // the device's own channel never backed up
        drain(&mut device_rx);
    }

    #[tokio::test]
    async fn heartbeat_without_chip_id_is_dropped_silently() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (device, mut device_rx) = attach(&broker, 1).await;

        let bare: Message =
            serde_json::from_value(json!({"type": "heartbeat", "uptime": 42})).unwrap();
        broker.dispatch(device, bare).await;

        // nothing to route and nothing to reply: no registration, no
        // error back to the sender
        assert_eq!(broker.device_count().await, 0);
        assert!(device_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sensor_response_lazily_registers_sender() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (device, _rx) = attach(&broker, 1).await;

        broker.dispatch(device, sensor_response("X")).await;

        let state = broker.state.read().await;
        assert_eq!(state.registry.lookup("X"), Some(device));
    }

    #[tokio::test]
    async fn archival_gate_stores_once_per_interval() {
        let store = Arc::new(MemoryStore::new());
        let broker = test_broker(store.clone());
        let (device, _rx) = attach(&broker, 1).await;

        broker.dispatch(device, sensor_response("dev1")).await;
        {
            let store = store.clone();
            wait_for(move || store.len() == 1).await;
        }

        // second reading inside the interval is relayed but not stored
        broker.dispatch(device, sensor_response("dev1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.len(), 1);

        let readings = store.readings();
        assert_eq!(readings[0].chip_id, "dev1");
        assert_eq!(readings[0].temperature, 24);
        assert_eq!(readings[0].motor_status, "OFF");
    }

    #[tokio::test]
    async fn heartbeat_is_archival_inert() {
        let store = Arc::new(MemoryStore::new());
        let broker = test_broker(store.clone());
        let (device, _rx) = attach(&broker, 1).await;

        let heartbeat: Message = serde_json::from_value(json!({
            "type": "heartbeat",
            "chipId": "dev1",
            "uptime": 42
        }))
        .unwrap();
        broker.dispatch(device, heartbeat).await;

        // lazily registered, nothing stored
        assert_eq!(broker.device_count().await, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());

        // the gate is still open for the first real reading
        broker.dispatch(device, sensor_response("dev1")).await;
        wait_for(move || store.len() == 1).await;
    }

    #[tokio::test]
    async fn unparsable_reading_consumes_the_interval() {
        let store = Arc::new(MemoryStore::new());
        let broker = test_broker(store.clone());
        let (device, _rx) = attach(&broker, 1).await;

        let garbled: Message = serde_json::from_value(json!({
            "type": "sensorDataResponse",
            "chipId": "dev1",
            "temperature": "warm",
            "humidity": 61,
            "soilMoisture": 512,
            "lightIntensity": 800,
            "motorStatus": "OFF"
        }))
        .unwrap();
        broker.dispatch(device, garbled).await;

        // gate opened, parse failed, reading lost; next one is inside
        // the consumed interval
        broker.dispatch(device, sensor_response("dev1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn disconnect_cleans_up_and_notifies() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (client, mut client_rx) = attach(&broker, 1).await;
        let (device, _device_rx) = attach(&broker, 2).await;

        broker
            .dispatch(
                client,
                Message::ClientRegister {
                    chip_ids: vec!["dev1".into()],
                },
            )
            .await;
        broker
            .dispatch(
                device,
                Message::Register {
                    chip_id: "dev1".into(),
                },
            )
            .await;
        drain(&mut client_rx);

        broker.reconcile_disconnect(device).await;

        assert_eq!(
            client_rx.recv().await.unwrap(),
            Message::chip_disconnected("dev1")
        );
        assert_eq!(broker.device_count().await, 0);
        assert_eq!(broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn client_disconnect_drops_subscriptions_silently() {
        let broker = test_broker(Arc::new(MemoryStore::new()));
        let (client, mut client_rx) = attach(&broker, 1).await;

        broker
            .dispatch(
                client,
                Message::ClientRegister {
                    chip_ids: vec!["dev1".into()],
                },
            )
            .await;
        drain(&mut client_rx);

        broker.reconcile_disconnect(client).await;
        assert_eq!(broker.client_count().await, 0);
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn poll_scheduler_requests_stale_chips() {
        let config = BrokerConfig {
            poll_interval_secs: 1,
            ..Default::default()
        };
        let broker = Broker::with_store(config, Arc::new(MemoryStore::new())).unwrap();
        let (device, mut device_rx) = attach(&broker, 1).await;

        broker
            .dispatch(
                device,
                Message::Register {
                    chip_id: "dev1".into(),
                },
            )
            .await;
        drain(&mut device_rx);

        broker.spawn_poll_scheduler();

        let polled = tokio::time::timeout(Duration::from_secs(3), device_rx.recv())
            .await
            .expect("poll scheduler never fired")
            .unwrap();
        assert_eq!(
            polled,
            Message::SensorDataRequest {
                chip_id: "dev1".into()
            }
        );
    }
}
