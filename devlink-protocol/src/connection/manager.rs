//! Connection manager
//!
//! One [`ActiveLink`] per device. Each link gets a writer task draining a
//! bounded outbound queue and a reader task feeding inbound packets to the
//! pairing state machine or the plugin dispatcher. Links carry a generation
//! counter so a reader that dies after being replaced cannot tear down its
//! successor.

use crate::error::{ProtocolError, Result};
use crate::events::DeviceEvent;
use crate::identity::DeviceInfo;
use crate::packet::Packet;
use crate::pairing::{PairingManager, PairingState, PAIR_PACKET_TYPE};
use crate::plugins::PluginManager;
use crate::transport::link::{Link, LinkListener, LinkReader, LinkWriter, PendingLink};
use crate::trust::{CertificateProvider, TrustStore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Depth of the per-device outbound queue
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Reconnect backoff for devices with a standing pairing
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Delay before the given attempt, doubling from the base up to the cap
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
        }
    }
}

/// Timing knobs for link management
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(3),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct ActiveLink {
    outbound: mpsc::Sender<Packet>,
    remote_addr: SocketAddr,
    peer_fingerprint: String,
    identity: DeviceInfo,
    generation: u64,
}

/// Manages secured links and routes their traffic
pub struct ConnectionManager {
    local: DeviceInfo,
    certificate: Arc<dyn CertificateProvider>,
    trust: Arc<TrustStore>,
    pairing: Arc<PairingManager>,
    plugins: Arc<PluginManager>,
    links: RwLock<HashMap<String, ActiveLink>>,
    /// Last address each device connected from, kept for reconnects
    last_addrs: RwLock<HashMap<String, SocketAddr>>,
    generation: AtomicU64,
    events: broadcast::Sender<DeviceEvent>,
    shutdown: watch::Sender<bool>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: DeviceInfo,
        certificate: Arc<dyn CertificateProvider>,
        trust: Arc<TrustStore>,
        pairing: Arc<PairingManager>,
        plugins: Arc<PluginManager>,
        events: broadcast::Sender<DeviceEvent>,
        shutdown: watch::Sender<bool>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            local,
            certificate,
            trust,
            pairing,
            plugins,
            links: RwLock::new(HashMap::new()),
            last_addrs: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            events,
            shutdown,
            config,
        }
    }

    /// Run the accept loop on an already-bound listener
    ///
    /// Each accepted connection is handled in its own task so a stalled
    /// handshake never blocks further accepts. Returns when shutdown flips.
    pub async fn run_listener(self: &Arc<Self>, listener: LinkListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (tcp, remote_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let manager = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = manager.handle_incoming(tcp, remote_addr).await {
                            debug!(remote = %remote_addr, error = %e, "Incoming link failed");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Listener shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_incoming(
        self: Arc<Self>,
        tcp: tokio::net::TcpStream,
        remote_addr: SocketAddr,
    ) -> Result<()> {
        let pending = PendingLink::accept(
            tcp,
            remote_addr,
            &self.local,
            self.config.handshake_timeout,
        )
        .await?;
        self.establish(pending).await
    }

    /// Open an outgoing link to a discovered device
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        let pending = PendingLink::connect(addr, &self.local, self.config.handshake_timeout).await?;
        Arc::clone(self).establish(pending).await
    }

    async fn establish(self: Arc<Self>, pending: PendingLink) -> Result<()> {
        let device_id = pending.remote_identity().device_id.clone();
        if device_id == self.local.device_id {
            debug!("Dropping link to ourselves");
            return Ok(());
        }

        let link = pending
            .secure(
                self.certificate.as_ref(),
                &self.local.device_id,
                self.config.handshake_timeout,
            )
            .await?;

        // Pinned fingerprint check before the link carries any packet
        let fingerprint = link.peer_fingerprint();
        self.trust
            .verify_fingerprint(&device_id, &fingerprint)
            .await?;

        self.register_link(link).await
    }

    async fn register_link(self: Arc<Self>, link: Link) -> Result<()> {
        let identity = link.remote_identity().clone();
        let device_id = identity.device_id.clone();
        let remote_addr = link.remote_addr();
        let peer_fingerprint = link.peer_fingerprint();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (reader, writer) = link.into_parts();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        {
            let mut links = self.links.write().await;
            if links.insert(
                device_id.clone(),
                ActiveLink {
                    outbound: outbound_tx,
                    remote_addr,
                    peer_fingerprint: peer_fingerprint.clone(),
                    identity: identity.clone(),
                    generation,
                },
            )
            .is_some()
            {
                // Old writer loses its queue and winds down; its reader sees
                // the stale generation and skips cleanup
                debug!(device_id = %device_id, "Replaced existing link");
            }
        }

        // Reconnects target the announced TCP port at the peer's address,
        // not the ephemeral source port of an accepted connection
        self.last_addrs.write().await.insert(
            device_id.clone(),
            SocketAddr::new(remote_addr.ip(), identity.tcp_port),
        );

        self.spawn_writer(device_id.clone(), writer, outbound_rx);
        self.spawn_reader(reader, identity.clone(), peer_fingerprint.clone(), generation);

        if self.pairing.state(&device_id).await == PairingState::Paired {
            self.plugins.activate(&identity).await;
        }

        let _ = self.events.send(DeviceEvent::DeviceConnected {
            identity,
            remote_addr,
            certificate_fingerprint: peer_fingerprint,
        });
        Ok(())
    }

    fn spawn_writer(
        self: &Arc<Self>,
        device_id: String,
        mut writer: LinkWriter,
        mut outbound_rx: mpsc::Receiver<Packet>,
    ) {
        tokio::spawn(async move {
            while let Some(packet) = outbound_rx.recv().await {
                if let Err(e) = writer.write_packet(&packet).await {
                    warn!(device_id = %device_id, error = %e, "Write failed, closing writer");
                    return;
                }
            }
            // Queue closed: orderly shutdown, send close_notify
            let _ = writer.shutdown().await;
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut reader: LinkReader,
        identity: DeviceInfo,
        peer_fingerprint: String,
        generation: u64,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let device_id = identity.device_id.clone();
            loop {
                match reader.read_packet().await {
                    Ok(Some(packet)) => {
                        manager
                            .route_packet(&identity, &peer_fingerprint, packet)
                            .await;
                    }
                    Ok(None) => {
                        debug!(device_id = %device_id, "Link closed by remote");
                        break;
                    }
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Link read failed");
                        break;
                    }
                }
            }
            manager.handle_link_down(&device_id, generation).await;
        });
    }

    async fn route_packet(&self, identity: &DeviceInfo, peer_fingerprint: &str, packet: Packet) {
        let device_id = &identity.device_id;

        if packet.is_type(PAIR_PACKET_TYPE) {
            match self
                .pairing
                .handle_packet(device_id, peer_fingerprint, &packet)
                .await
            {
                Ok(Some(response)) => {
                    if let Err(e) = self.send(device_id, response).await {
                        warn!(device_id = %device_id, error = %e, "Failed to send pairing response");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Pairing packet rejected");
                }
            }

            // A remote acceptance completes the pairing mid-link; a remote
            // unpair dissolves it and takes the plugins with it
            match self.pairing.state(device_id).await {
                PairingState::Paired => self.plugins.activate(identity).await,
                PairingState::Unpaired => self.plugins.teardown(device_id).await,
                _ => {}
            }
            return;
        }

        // Pre-pairing nothing is active, so functional packets fall through
        // dispatch as unhandled
        self.plugins.dispatch(device_id, packet).await;
    }

    async fn handle_link_down(self: &Arc<Self>, device_id: &str, generation: u64) {
        {
            let mut links = self.links.write().await;
            match links.get(device_id) {
                Some(link) if link.generation == generation => {
                    links.remove(device_id);
                }
                // A newer link replaced this one, nothing to clean up
                _ => return,
            }
        }

        self.pairing.handle_link_closed(device_id).await;
        self.plugins.handle_link_lost(device_id).await;
        let _ = self.events.send(DeviceEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
        });

        if *self.shutdown.borrow() {
            return;
        }
        if self.trust.is_trusted(device_id).await {
            self.spawn_reconnect(device_id.to_string());
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, device_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let Some(addr) = manager.last_addr(&device_id).await else {
                return;
            };
            let policy = manager.config.reconnect.clone();

            for attempt in 1..=policy.max_attempts {
                tokio::time::sleep(policy.delay_for(attempt)).await;

                if *manager.shutdown.borrow() || manager.is_connected(&device_id).await {
                    return;
                }

                match manager.connect(addr).await {
                    Ok(()) => {
                        info!(device_id = %device_id, attempt, "Reconnected");
                        return;
                    }
                    Err(e) => {
                        debug!(device_id = %device_id, attempt, error = %e, "Reconnect failed");
                    }
                }
            }
            debug!(device_id = %device_id, "Giving up on reconnect");
        });
    }

    /// Last known connect address for a device
    pub async fn last_addr(&self, device_id: &str) -> Option<SocketAddr> {
        self.last_addrs.read().await.get(device_id).copied()
    }

    /// Queue a packet for a connected device
    pub async fn send(&self, device_id: &str, packet: Packet) -> Result<()> {
        let outbound = {
            let links = self.links.read().await;
            links
                .get(device_id)
                .map(|link| link.outbound.clone())
                .ok_or_else(|| ProtocolError::NotConnected(device_id.to_string()))?
        };

        outbound
            .send(packet)
            .await
            .map_err(|_| ProtocolError::NotConnected(device_id.to_string()))
    }

    /// Close the link to a device
    pub async fn disconnect(&self, device_id: &str) {
        if self.links.write().await.remove(device_id).is_some() {
            info!(device_id = %device_id, "Disconnecting");
        }
        // Dropping the outbound sender ends the writer, which sends
        // close_notify; the reader then observes the close and cleans up
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.links.read().await.contains_key(device_id)
    }

    /// IDs of currently connected devices
    pub async fn connected_devices(&self) -> Vec<String> {
        self.links.read().await.keys().cloned().collect()
    }

    /// Identity, address, and fingerprint of a connected device
    pub async fn link_info(&self, device_id: &str) -> Option<(DeviceInfo, SocketAddr, String)> {
        self.links.read().await.get(device_id).map(|link| {
            (
                link.identity.clone(),
                link.remote_addr,
                link.peer_fingerprint.clone(),
            )
        })
    }

    /// Close all links and give in-flight writes a bounded drain window
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let drained = self.links.write().await.drain().count();
        if drained > 0 {
            info!(links = drained, "Closing links for shutdown");
            tokio::time::sleep(self.config.drain_timeout.min(Duration::from_secs(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(2));
    }

    #[test]
    fn test_reconnect_backoff_first_attempt_uses_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), policy.base_delay);
    }
}
