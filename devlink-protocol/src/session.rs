//! Session engine
//!
//! Composes discovery, link management, pairing, and plugin dispatch behind
//! one handle. Everything is injected at construction; the engine owns no
//! global state and several engines can coexist in one process, which is how
//! the loopback tests drive both ends of a link.

use crate::config::Config;
use crate::connection::{ConnectionConfig, ConnectionManager, ReconnectPolicy};
use crate::discovery::{Discovery, RemoteAnnouncement};
use crate::error::{ProtocolError, Result};
use crate::events::DeviceEvent;
use crate::identity::{DeviceInfo, DeviceType};
use crate::pairing::{PairingManager, PairingState, PAIRING_TIMEOUT};
use crate::packet::Packet;
use crate::plugins::{PermissionGate, PluginFactory, PluginManager};
use crate::transport::link::LinkListener;
use crate::trust::{CertificateProvider, TrustStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the engine knows about one remote device
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub identity: DeviceInfo,
    pub pairing_state: PairingState,
    pub connected: bool,
    pub last_addr: Option<SocketAddr>,
    pub last_seen: DateTime<Utc>,
}

/// The device session engine
pub struct Engine {
    local: DeviceInfo,
    connection: Arc<ConnectionManager>,
    pairing: Arc<PairingManager>,
    plugins: Arc<PluginManager>,
    trust: Arc<TrustStore>,
    discovery: Discovery,
    sessions: Arc<RwLock<HashMap<String, DeviceSession>>>,
    events: broadcast::Sender<DeviceEvent>,
    shutdown: watch::Sender<bool>,
    listener: Mutex<Option<LinkListener>>,
    plugin_outbound: Mutex<Option<mpsc::UnboundedReceiver<(String, Packet)>>>,
    broadcast_interval: tokio::time::Duration,
}

impl Engine {
    /// Build an engine from configuration and injected collaborators
    ///
    /// Binds the link listener and the discovery socket, opens the trust
    /// store, and wires the managers together. Nothing runs until
    /// [`Engine::start`].
    pub async fn new(
        config: Config,
        certificate: Arc<dyn CertificateProvider>,
        factories: Vec<Arc<dyn PluginFactory>>,
        gate: Arc<dyn PermissionGate>,
    ) -> Result<Self> {
        let trust = Arc::new(TrustStore::open(&config.paths.trust_store).await?);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let listener = match LinkListener::bind(config.network.tcp_port).await {
            Ok(listener) => listener,
            Err(e) => {
                debug!(
                    port = config.network.tcp_port,
                    error = %e,
                    "Configured TCP port unavailable, using ephemeral port"
                );
                LinkListener::bind(0).await?
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut plugin_manager = PluginManager::new(
            gate,
            outbound_tx,
            events.clone(),
            config.network.dispatch_queue_depth,
        );
        for factory in factories {
            plugin_manager.register(factory);
        }
        let plugins = Arc::new(plugin_manager);

        let device_type = DeviceType::from_str(&config.device.device_type)?;
        let mut local = match &config.device.device_id {
            Some(id) => DeviceInfo::with_id(
                id.clone(),
                &config.device.name,
                device_type,
                listener.local_port(),
            ),
            None => DeviceInfo::new(&config.device.name, device_type, listener.local_port()),
        };
        local.incoming_capabilities = plugins.incoming_capabilities();
        local.outgoing_capabilities = plugins.outgoing_capabilities();

        let pairing = Arc::new(PairingManager::new(
            Arc::clone(&trust),
            events.clone(),
            PAIRING_TIMEOUT,
        ));

        let connection = Arc::new(ConnectionManager::new(
            local.clone(),
            Arc::clone(&certificate),
            Arc::clone(&trust),
            Arc::clone(&pairing),
            Arc::clone(&plugins),
            events.clone(),
            shutdown.clone(),
            ConnectionConfig {
                handshake_timeout: config.network.handshake_timeout(),
                drain_timeout: config.network.drain_timeout(),
                reconnect: ReconnectPolicy {
                    max_attempts: config.network.reconnect_max_attempts,
                    base_delay: tokio::time::Duration::from_millis(
                        config.network.reconnect_base_delay_ms,
                    ),
                    max_delay: tokio::time::Duration::from_millis(
                        config.network.reconnect_max_delay_ms,
                    ),
                },
            },
        ));

        let discovery = Discovery::bind(
            local.clone(),
            config.network.discovery_port,
            config.network.port_range_start..=config.network.port_range_end,
        )
        .await?;

        info!(
            device_id = %local.device_id,
            device_name = %local.device_name,
            tcp_port = local.tcp_port,
            "Engine initialized"
        );

        Ok(Self {
            local,
            connection,
            pairing,
            plugins,
            trust,
            discovery,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
            shutdown,
            listener: Mutex::new(Some(listener)),
            plugin_outbound: Mutex::new(Some(outbound_rx)),
            broadcast_interval: config.network.broadcast_interval(),
        })
    }

    /// Local device identity as announced to the network
    pub fn local_device(&self) -> &DeviceInfo {
        &self.local
    }

    /// Subscribe to the engine event stream
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Start the engine's background tasks
    ///
    /// Spawns the accept loop, the discovery listener and broadcaster, the
    /// plugin outbound forwarder, and the session bookkeeping task. Idempotent
    /// calls after the first are errors.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| ProtocolError::Cancelled("Engine already started".to_string()))?;
        let outbound_rx = self
            .plugin_outbound
            .lock()
            .await
            .take()
            .ok_or_else(|| ProtocolError::Cancelled("Engine already started".to_string()))?;

        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            connection.run_listener(listener).await;
        });

        let announcements = self.discovery.start_listener(self.shutdown.subscribe());
        self.spawn_announcement_handler(announcements);
        self.spawn_broadcaster();
        self.spawn_outbound_forwarder(outbound_rx);
        self.spawn_session_bookkeeper();

        // Announce immediately instead of waiting out the first interval
        if let Err(e) = self.discovery.broadcast().await {
            warn!(error = %e, "Initial discovery broadcast failed");
        }

        info!("Engine started");
        Ok(())
    }

    fn spawn_announcement_handler(
        self: &Arc<Self>,
        mut announcements: mpsc::Receiver<RemoteAnnouncement>,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(announcement) = announcements.recv().await {
                engine.handle_announcement(announcement).await;
            }
        });
    }

    async fn handle_announcement(self: &Arc<Self>, announcement: RemoteAnnouncement) {
        let identity = announcement.identity;
        let device_id = identity.device_id.clone();
        let addr = SocketAddr::new(announcement.source.ip(), identity.tcp_port);

        {
            let mut sessions = self.sessions.write().await;
            let pairing_state = self.pairing.state(&device_id).await;
            let connected = self.connection.is_connected(&device_id).await;
            sessions.insert(
                device_id.clone(),
                DeviceSession {
                    identity: identity.clone(),
                    pairing_state,
                    connected,
                    last_addr: Some(addr),
                    last_seen: Utc::now(),
                },
            );
        }

        let _ = self.events.send(DeviceEvent::DeviceDiscovered {
            identity,
            source: announcement.source,
        });

        // Re-establish links to trusted devices as soon as they reappear
        if self.trust.is_trusted(&device_id).await && !self.connection.is_connected(&device_id).await
        {
            debug!(device_id = %device_id, addr = %addr, "Connecting to trusted device");
            if let Err(e) = self.connection.connect(addr).await {
                debug!(device_id = %device_id, error = %e, "Connect to trusted device failed");
            }
        }
    }

    fn spawn_broadcaster(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.broadcast_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = engine.discovery.broadcast().await {
                            warn!(error = %e, "Discovery broadcast failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn spawn_outbound_forwarder(
        self: &Arc<Self>,
        mut outbound_rx: mpsc::UnboundedReceiver<(String, Packet)>,
    ) {
        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            while let Some((device_id, packet)) = outbound_rx.recv().await {
                if let Err(e) = connection.send(&device_id, packet).await {
                    debug!(device_id = %device_id, error = %e, "Dropping outbound plugin packet");
                }
            }
        });
    }

    fn spawn_session_bookkeeper(self: &Arc<Self>) {
        let sessions = Arc::clone(&self.sessions);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Session bookkeeper lagged behind events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                match event {
                    DeviceEvent::DeviceConnected {
                        identity,
                        remote_addr,
                        ..
                    } => {
                        let mut sessions = sessions.write().await;
                        let entry = sessions
                            .entry(identity.device_id.clone())
                            .or_insert_with(|| DeviceSession {
                                identity: identity.clone(),
                                pairing_state: PairingState::Unpaired,
                                connected: false,
                                last_addr: None,
                                last_seen: Utc::now(),
                            });
                        entry.identity = identity;
                        entry.connected = true;
                        entry.last_addr = Some(remote_addr);
                        entry.last_seen = Utc::now();
                    }
                    DeviceEvent::DeviceDisconnected { device_id } => {
                        if let Some(entry) = sessions.write().await.get_mut(&device_id) {
                            entry.connected = false;
                            entry.last_seen = Utc::now();
                        }
                    }
                    DeviceEvent::PairingStateChanged { device_id, state } => {
                        if let Some(entry) = sessions.write().await.get_mut(&device_id) {
                            entry.pairing_state = state;
                        }
                    }
                    _ => {}
                }
            }
        });
    }

    /// Open a link to a device at a known address
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        self.connection.connect(addr).await
    }

    /// Request pairing with a connected device
    pub async fn request_pairing(&self, device_id: &str) -> Result<()> {
        let (_, _, fingerprint) = self
            .connection
            .link_info(device_id)
            .await
            .ok_or_else(|| ProtocolError::NotConnected(device_id.to_string()))?;

        let packet = self.pairing.request(device_id, &fingerprint).await?;
        self.connection.send(device_id, packet).await
    }

    /// Accept a pairing request from a remote device
    pub async fn accept_pairing(&self, device_id: &str) -> Result<()> {
        let packet = self.pairing.accept(device_id).await?;
        self.connection.send(device_id, packet).await?;

        if let Some((identity, _, _)) = self.connection.link_info(device_id).await {
            self.plugins.activate(&identity).await;
        }
        Ok(())
    }

    /// Reject a pairing request from a remote device
    pub async fn reject_pairing(&self, device_id: &str) -> Result<()> {
        let packet = self.pairing.reject(device_id).await?;
        self.connection.send(device_id, packet).await
    }

    /// Dissolve the pairing with a device
    ///
    /// The unpair notification is best-effort; local trust is removed either
    /// way and the device's plugins are torn down.
    pub async fn unpair(&self, device_id: &str) -> Result<()> {
        let packet = self.pairing.unpair(device_id).await?;
        if let Err(e) = self.connection.send(device_id, packet).await {
            debug!(device_id = %device_id, error = %e, "Unpair notification not delivered");
        }
        self.plugins.teardown(device_id).await;
        Ok(())
    }

    /// Send a functional packet to a paired, connected device
    pub async fn send(&self, device_id: &str, packet: Packet) -> Result<()> {
        if self.pairing.state(device_id).await != PairingState::Paired {
            return Err(ProtocolError::NotPaired);
        }
        self.connection.send(device_id, packet).await
    }

    /// Pairing state for a device
    pub async fn pairing_state(&self, device_id: &str) -> PairingState {
        self.pairing.state(device_id).await
    }

    /// Snapshot of one device session
    pub async fn session(&self, device_id: &str) -> Option<DeviceSession> {
        self.sessions.read().await.get(device_id).cloned()
    }

    /// Snapshot of all known device sessions
    pub async fn sessions(&self) -> Vec<DeviceSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Names of plugins active for a device
    pub async fn active_plugins(&self, device_id: &str) -> Vec<String> {
        self.plugins.active_plugins(device_id).await
    }

    /// Enable or disable a plugin for a device without destroying it
    ///
    /// Backs permission revocation: a disabled plugin keeps its state and is
    /// re-enabled on grant without re-pairing. Fails with
    /// [`ProtocolError::PermissionDenied`] when the gate refuses the grant
    /// and with [`ProtocolError::Plugin`] when the plugin is not active for
    /// the device.
    pub async fn set_plugin_enabled(
        &self,
        device_id: &str,
        plugin_name: &str,
        enabled: bool,
    ) -> Result<()> {
        self.plugins.set_enabled(device_id, plugin_name, enabled).await
    }

    /// Stop all background tasks and close every link
    pub async fn shutdown(&self) {
        info!("Engine shutting down");
        self.connection.shutdown().await;
        self.plugins.shutdown().await;
    }
}
