//! Top-level session owner: wires discovery, connection management, the
//! outbound queue and the network monitor together on a single event loop,
//! and republishes a unified status snapshot.
//!
//! All state transitions happen on this loop; I/O waits (the TCP link, the
//! mDNS browse, the registry GET) run as spawned tasks whose completions
//! come back through channels, tagged with a generation so results from a
//! cancelled pass are discarded.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::connection::{ConnEvent, ConnectionManager, ConnectionState, Signal};
use crate::error::Error;
use crate::monitor::{NetworkChangeEvent, NetworkChangeMonitor};
use crate::orchestrator::{DiscoveryOrchestrator, Resolution};
use crate::peer::{DiscoverySource, PeerAddress};
use crate::protocol::{OutboundMessage, ScrollEvent};
use crate::storage::{keys, Store};

/// Read-only snapshot published to the UI on every relevant transition.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub connected: bool,
    pub status: String,
    pub address: Option<PeerAddress>,
    pub source: DiscoverySource,
    pub last_error: Option<String>,
    pub discovered: Vec<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            status: "initializing".to_string(),
            address: None,
            source: DiscoverySource::None,
            last_error: None,
            discovered: Vec::new(),
        }
    }
}

enum Command {
    Submit(ScrollEvent),
    SubmitRaw(Value),
    SetManual(PeerAddress),
    ClearManual,
    Reconnect,
    HealthCheck,
    Shutdown,
}

enum Internal {
    Resolved {
        generation: u64,
        result: Result<Resolution, Error>,
    },
    SettleElapsed,
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    /// Submits one scroll sample from the wearable producer. Rate is
    /// unconstrained at the call site; throttling happens downstream.
    pub async fn submit_event(&self, event: ScrollEvent) -> Result<(), Error> {
        self.send(Command::Submit(event)).await
    }

    pub async fn submit_pixels(&self, pixels: f64) -> Result<(), Error> {
        self.submit_event(ScrollEvent::new(pixels)).await
    }

    /// Forwards an already-shaped JSON control message to the peer.
    pub async fn submit_raw(&self, message: Value) -> Result<(), Error> {
        self.send(Command::SubmitRaw(message)).await
    }

    pub async fn set_manual_address(&self, address: PeerAddress) -> Result<(), Error> {
        self.send(Command::SetManual(address)).await
    }

    pub async fn clear_manual_address(&self) -> Result<(), Error> {
        self.send(Command::ClearManual).await
    }

    pub async fn reconnect(&self) -> Result<(), Error> {
        self.send(Command::Reconnect).await
    }

    /// Reconnects only if connected-but-stale (no receive within roughly
    /// twice the heartbeat interval). Intended for foreground-regain hooks.
    pub async fn force_health_check(&self) -> Result<(), Error> {
        self.send(Command::HealthCheck).await
    }

    pub async fn shutdown(&self) -> Result<(), Error> {
        self.send(Command::Shutdown).await
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    async fn send(&self, cmd: Command) -> Result<(), Error> {
        self.cmd_tx.send(cmd).await.map_err(|_| Error::SessionClosed)
    }
}

pub struct SessionCoordinator {
    config: Config,
    orchestrator: Arc<DiscoveryOrchestrator>,
    manager: ConnectionManager,
    /// Present only when the built-in polling monitor feeds `net_rx`.
    _monitor: Option<NetworkChangeMonitor>,
    cmd_rx: mpsc::Receiver<Command>,
    conn_rx: mpsc::Receiver<ConnEvent>,
    net_rx: mpsc::Receiver<NetworkChangeEvent>,
    int_rx: mpsc::Receiver<Internal>,
    int_tx: mpsc::Sender<Internal>,
    /// Best-effort forwarding of inbound peer frames to the wearable side.
    frames_tx: mpsc::Sender<Value>,
    status_tx: watch::Sender<SessionStatus>,
    discovering: bool,
    discovery_gen: u64,
    discovery_task: Option<JoinHandle<()>>,
    settle_task: Option<JoinHandle<()>>,
}

impl SessionCoordinator {
    /// Builds the component graph and starts the event loop. Inbound peer
    /// frames are forwarded into `frames_tx`; a full or closed receiver is
    /// logged, never retried.
    pub fn spawn(
        config: Config,
        store: Arc<dyn Store>,
        frames_tx: mpsc::Sender<Value>,
    ) -> SessionHandle {
        let (net_tx, net_rx) = mpsc::channel(16);
        let monitor = NetworkChangeMonitor::spawn(config.network_poll_interval, net_tx);
        Self::spawn_inner(config, store, frames_tx, net_rx, Some(monitor))
    }

    /// Like [`SessionCoordinator::spawn`], but network change events come
    /// from the caller instead of the polling monitor. Used where the host
    /// platform has its own path watcher.
    pub fn spawn_with_network_events(
        config: Config,
        store: Arc<dyn Store>,
        frames_tx: mpsc::Sender<Value>,
        net_rx: mpsc::Receiver<NetworkChangeEvent>,
    ) -> SessionHandle {
        Self::spawn_inner(config, store, frames_tx, net_rx, None)
    }

    fn spawn_inner(
        config: Config,
        store: Arc<dyn Store>,
        frames_tx: mpsc::Sender<Value>,
        net_rx: mpsc::Receiver<NetworkChangeEvent>,
        monitor: Option<NetworkChangeMonitor>,
    ) -> SessionHandle {
        let client_id = load_client_id(store.as_ref());
        let device = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        tracing::info!("starting session (client {}, device {})", client_id, device);

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (conn_tx, conn_rx) = mpsc::channel(64);
        let (int_tx, int_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());

        let orchestrator = Arc::new(DiscoveryOrchestrator::new(&config, store, client_id));
        let manager = ConnectionManager::new(&config, conn_tx);

        let coordinator = Self {
            config,
            orchestrator,
            manager,
            _monitor: monitor,
            cmd_rx,
            conn_rx,
            net_rx,
            int_rx,
            int_tx,
            frames_tx,
            status_tx,
            discovering: false,
            discovery_gen: 0,
            discovery_task: None,
            settle_task: None,
        };
        tokio::spawn(coordinator.run());

        SessionHandle { cmd_tx, status_rx }
    }

    async fn run(mut self) {
        // Startup mirrors the discovery priority: a manual override connects
        // directly, everything else goes through the orchestrator.
        if let Some(address) = self.orchestrator.manual_address() {
            self.publish(|s| {
                s.address = Some(address.clone());
                s.source = DiscoverySource::Manual;
                s.status = format!("connecting to {}", address);
            });
            self.manager.connect(address);
        } else {
            self.start_discovery();
        }

        loop {
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                Some(event) = self.conn_rx.recv() => self.handle_conn_event(event),
                Some(event) = self.net_rx.recv() => self.handle_network_event(event),
                Some(event) = self.int_rx.recv() => self.handle_internal(event),
            }
        }

        tracing::info!("session shutting down");
        self.cancel_discovery();
        if let Some(task) = self.settle_task.take() {
            task.abort();
        }
        self.manager.disconnect();
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(event) => {
                self.manager.enqueue(OutboundMessage::scroll(event.pixels));
                self.ensure_link();
            }
            Command::SubmitRaw(value) => {
                self.manager.enqueue(OutboundMessage::Raw(value));
                self.ensure_link();
            }
            Command::SetManual(address) => {
                tracing::info!("manual override set to {}", address);
                self.cancel_discovery();
                self.orchestrator.set_manual(&address);
                self.manager.disconnect();
                self.publish(|s| {
                    s.connected = false;
                    s.address = Some(address.clone());
                    s.source = DiscoverySource::Manual;
                    s.status = format!("connecting to {}", address);
                    s.last_error = None;
                });
                self.manager.connect(address);
            }
            Command::ClearManual => {
                tracing::info!("manual override cleared, returning to auto discovery");
                self.cancel_discovery();
                self.orchestrator.clear_manual();
                self.manager.disconnect();
                self.publish(|s| {
                    s.connected = false;
                    s.address = None;
                    s.source = DiscoverySource::None;
                    s.last_error = None;
                });
                self.start_discovery();
            }
            Command::Reconnect => {
                tracing::info!("manual reconnect requested");
                self.cancel_discovery();
                self.manager.disconnect();
                self.publish(|s| {
                    s.connected = false;
                    s.last_error = None;
                });
                if let Some(address) = self.orchestrator.manual_address() {
                    self.publish(|s| s.status = format!("connecting to {}", address));
                    self.manager.connect(address);
                } else {
                    self.start_discovery();
                }
            }
            Command::HealthCheck => {
                let threshold = self.config.heartbeat_interval * 2;
                if self.manager.is_stale(threshold) {
                    tracing::info!("connection stale, forcing reconnect");
                    self.publish(|s| s.status = "connection stale, reconnecting".to_string());
                    self.manager.reconnect_current();
                }
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn handle_conn_event(&mut self, event: ConnEvent) {
        let Some(signal) = self.manager.handle(event) else {
            return;
        };
        match signal {
            Signal::Connected(address) => {
                self.publish(|s| {
                    s.connected = true;
                    s.status = "connected".to_string();
                    s.address = Some(address.clone());
                    s.last_error = None;
                });
            }
            Signal::Frame(value) => {
                // Best effort towards the wearable link; its reachability is
                // owned by the external transport.
                if let Err(e) = self.frames_tx.try_send(value) {
                    tracing::warn!("dropping inbound frame for wearable: {}", e);
                }
            }
            Signal::Retrying {
                attempt,
                max_attempts,
                delay,
            } => {
                self.publish(|s| {
                    s.connected = false;
                    s.status = format!("retrying ({}/{}) in {:?}", attempt, max_attempts, delay);
                });
            }
            Signal::RetriesExhausted => {
                self.publish(|s| {
                    s.connected = false;
                    s.status = "connection failed, retry manually".to_string();
                    s.last_error = Some("retry budget exhausted".to_string());
                });
            }
            Signal::Unreachable { detail } => {
                if self.orchestrator.is_manual() {
                    // Manual sessions never rediscover; back off against the
                    // pinned address instead.
                    match self.manager.schedule_retry() {
                        Some((attempt, delay)) => self.publish(|s| {
                            s.connected = false;
                            s.last_error = Some(detail.clone());
                            s.status = format!("peer unreachable, retrying ({}) in {:?}", attempt, delay);
                        }),
                        None => self.publish(|s| {
                            s.connected = false;
                            s.last_error = Some(detail.clone());
                            s.status = "connection failed, retry manually".to_string();
                        }),
                    }
                } else {
                    self.publish(|s| {
                        s.connected = false;
                        s.last_error = Some(detail.clone());
                        s.status = "peer unreachable, rediscovering".to_string();
                    });
                    self.orchestrator.invalidate_cache();
                    self.manager.disconnect();
                    self.start_discovery();
                }
            }
            Signal::PeerClosed => {
                self.publish(|s| {
                    s.connected = false;
                    s.status = "peer closed connection, reconnecting".to_string();
                });
            }
            Signal::Reconnecting { attempt } => {
                self.publish(|s| s.status = format!("reconnecting (attempt {})", attempt));
            }
        }
    }

    fn handle_network_event(&mut self, event: NetworkChangeEvent) {
        tracing::info!("network change: {:?}", event.reason);
        self.cancel_discovery();
        self.orchestrator.invalidate_cache();
        self.orchestrator.clear_discovered();
        self.manager.disconnect();
        self.publish(|s| {
            s.connected = false;
            s.discovered.clear();
            s.status = format!("network changed ({:?}), waiting to settle", event.reason);
        });

        if let Some(task) = self.settle_task.take() {
            task.abort();
        }
        let delay = self.config.settle_delay;
        let int_tx = self.int_tx.clone();
        self.settle_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = int_tx.send(Internal::SettleElapsed).await;
        }));
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Resolved { generation, result } => {
                if generation != self.discovery_gen {
                    tracing::debug!("discarding stale discovery result");
                    return;
                }
                self.discovering = false;
                match result {
                    Ok(resolution) => {
                        let discovered = self.orchestrator.discovered();
                        self.publish(|s| {
                            s.address = Some(resolution.address.clone());
                            s.source = resolution.source;
                            s.discovered = discovered;
                            s.status = format!("connecting to {}", resolution.address);
                            s.last_error = None;
                        });
                        self.manager.reset_budget();
                        self.manager.connect(resolution.address);
                    }
                    Err(e) => {
                        tracing::warn!("discovery failed: {}", e);
                        self.publish(|s| {
                            s.connected = false;
                            s.source = DiscoverySource::None;
                            s.status = "peer not found".to_string();
                            s.last_error = Some(e.to_string());
                        });
                        // Terminal until a network change or user action.
                    }
                }
            }
            Internal::SettleElapsed => {
                if let Some(address) = self.orchestrator.manual_address() {
                    self.publish(|s| s.status = format!("connecting to {}", address));
                    self.manager.reset_budget();
                    self.manager.connect(address);
                } else {
                    self.start_discovery();
                }
            }
        }
    }

    /// Opportunistic reconnect when traffic arrives while the link is down.
    /// Connecting/Waiting states are already working on it.
    fn ensure_link(&mut self) {
        match self.manager.state() {
            ConnectionState::Connected
            | ConnectionState::Connecting
            | ConnectionState::Waiting => {}
            _ => {
                if let Some(address) = self.orchestrator.manual_address() {
                    self.manager.connect(address);
                } else if !self.discovering {
                    self.start_discovery();
                }
            }
        }
    }

    fn start_discovery(&mut self) {
        if self.discovering {
            return;
        }
        self.discovering = true;
        self.discovery_gen += 1;
        let generation = self.discovery_gen;
        self.publish(|s| {
            s.connected = false;
            s.source = DiscoverySource::None;
            s.status = "discovering peer".to_string();
        });

        let orchestrator = Arc::clone(&self.orchestrator);
        let int_tx = self.int_tx.clone();
        self.discovery_task = Some(tokio::spawn(async move {
            let result = orchestrator.resolve().await;
            let _ = int_tx.send(Internal::Resolved { generation, result }).await;
        }));
    }

    fn cancel_discovery(&mut self) {
        self.discovering = false;
        self.discovery_gen += 1;
        if let Some(task) = self.discovery_task.take() {
            task.abort();
        }
    }

    fn publish<F: FnOnce(&mut SessionStatus)>(&self, f: F) {
        self.status_tx.send_modify(f);
    }
}

/// The registry keys lookups by a stable client identifier; generate one on
/// first run and persist it.
fn load_client_id(store: &dyn Store) -> String {
    if let Some(id) = store.get(keys::CLIENT_ID) {
        return id;
    }
    let id = uuid::Uuid::new_v4().to_string();
    store.set(keys::CLIENT_ID, &id);
    tracing::info!("generated client id {}", id);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::storage::MemoryStore;

    /// Coordinator with real components but no running event loop, so the
    /// handlers can be driven directly.
    fn test_coordinator(store: Arc<dyn Store>) -> SessionCoordinator {
        let config = Config {
            discovery_timeout: std::time::Duration::from_millis(10),
            registry_timeout: std::time::Duration::from_millis(10),
            registry_url: "http://127.0.0.1:1/unreachable".to_string(),
            ..Config::default()
        };
        let (_cmd_tx, cmd_rx) = mpsc::channel(8);
        let (conn_tx, conn_rx) = mpsc::channel(8);
        let (_net_tx, net_rx) = mpsc::channel(8);
        let (int_tx, int_rx) = mpsc::channel(8);
        let (status_tx, _status_rx) = watch::channel(SessionStatus::default());
        let orchestrator = Arc::new(DiscoveryOrchestrator::new(
            &config,
            store,
            "test-client".to_string(),
        ));
        let manager = ConnectionManager::new(&config, conn_tx);
        SessionCoordinator {
            config,
            orchestrator,
            manager,
            _monitor: None,
            cmd_rx,
            conn_rx,
            net_rx,
            int_rx,
            int_tx,
            frames_tx: mpsc::channel(8).0,
            status_tx,
            discovering: false,
            discovery_gen: 0,
            discovery_task: None,
            settle_task: None,
        }
    }

    #[tokio::test]
    async fn unreachable_under_auto_discovery_clears_cache_and_rediscovers() {
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = test_coordinator(store.clone());
        coordinator.orchestrator.cache_resolution(&Resolution {
            address: PeerAddress::new("10.0.0.8", 8888),
            source: DiscoverySource::Local,
        });

        coordinator.handle_conn_event(ConnEvent::Failed {
            epoch: 0,
            kind: FailureKind::Unreachable,
            detail: "no route to host".to_string(),
        });

        assert!(coordinator.discovering);
        assert_eq!(store.get(keys::CACHED_ADDRESS), None);
        let status = coordinator.status_tx.borrow().clone();
        assert_eq!(status.last_error.as_deref(), Some("no route to host"));
    }

    #[tokio::test]
    async fn unreachable_under_manual_override_backs_off_in_place() {
        let store = Arc::new(MemoryStore::new());
        store.set(keys::MANUAL_ENABLED, "true");
        store.set(keys::MANUAL_ADDRESS, "192.168.1.50:8888");
        let mut coordinator = test_coordinator(store);

        coordinator.handle_conn_event(ConnEvent::Failed {
            epoch: 0,
            kind: FailureKind::Unreachable,
            detail: "no route to host".to_string(),
        });

        assert!(!coordinator.discovering);
        assert_eq!(coordinator.manager.state(), ConnectionState::Waiting);
        assert_eq!(coordinator.manager.retry_attempts(), 1);
        let status = coordinator.status_tx.borrow().clone();
        assert!(status.status.contains("retrying"));
    }

    #[test]
    fn client_id_is_stable_across_loads() {
        let store = MemoryStore::new();
        let first = load_client_id(&store);
        let second = load_client_id(&store);
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn default_status_is_disconnected() {
        let status = SessionStatus::default();
        assert!(!status.connected);
        assert_eq!(status.source, DiscoverySource::None);
        assert!(status.address.is_none());
    }
}
