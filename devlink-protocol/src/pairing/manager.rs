//! Pairing state machine
//!
//! One [`PairingManager`] tracks the pairing state of every known device and
//! drives transitions from local calls and remote `devlink.pair` packets.
//! Completed pairings are written through to the trust store; in-flight
//! requests are purely in-memory and dissolve on link loss or timeout.

use crate::error::{ProtocolError, Result};
use crate::events::DeviceEvent;
use crate::packet::Packet;
use crate::pairing::{PairingPacket, PairingState};
use crate::trust::{TrustRecord, TrustStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// How long a pairing request stays pending before reverting
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

struct PendingEntry {
    state: PairingState,
    /// Bumped on every transition so stale timeout tasks become no-ops
    epoch: u64,
    /// Fingerprint of the link peer, pinned if the pairing completes
    peer_fingerprint: Option<String>,
}

/// Tracks pairing state and processes `devlink.pair` packets
///
/// Methods that react to input return the response packet to put on the wire,
/// if any. Sending is the caller's concern so link errors surface there.
pub struct PairingManager {
    trust: Arc<TrustStore>,
    entries: Arc<RwLock<HashMap<String, PendingEntry>>>,
    events: broadcast::Sender<DeviceEvent>,
    request_timeout: Duration,
}

impl PairingManager {
    pub fn new(
        trust: Arc<TrustStore>,
        events: broadcast::Sender<DeviceEvent>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            trust,
            entries: Arc::new(RwLock::new(HashMap::new())),
            events,
            request_timeout,
        }
    }

    /// Current pairing state for a device
    ///
    /// Devices with no in-memory entry fall back to the trust store, so
    /// completed pairings survive restarts.
    pub async fn state(&self, device_id: &str) -> PairingState {
        if let Some(entry) = self.entries.read().await.get(device_id) {
            return entry.state;
        }
        if self.trust.is_trusted(device_id).await {
            PairingState::Paired
        } else {
            PairingState::Unpaired
        }
    }

    /// Start a locally initiated pairing request
    ///
    /// Returns the request packet to send. Valid only from `Unpaired`.
    pub async fn request(&self, device_id: &str, peer_fingerprint: &str) -> Result<Packet> {
        let current = self.state(device_id).await;
        match current {
            PairingState::Unpaired => {}
            PairingState::Paired => return Err(ProtocolError::Pairing(format!(
                "Device {} is already paired",
                device_id
            ))),
            _ => {
                return Err(ProtocolError::Pairing(format!(
                    "Pairing with {} is already in progress",
                    device_id
                )))
            }
        }

        let epoch = self
            .transition(
                device_id,
                PairingState::RequestedLocal,
                Some(peer_fingerprint.to_string()),
            )
            .await;
        self.spawn_timeout(device_id.to_string(), epoch);

        info!(device_id = %device_id, "Sent pairing request");
        Ok(PairingPacket::request())
    }

    /// Accept a pairing request received from the remote
    pub async fn accept(&self, device_id: &str) -> Result<Packet> {
        let fingerprint = {
            let entries = self.entries.read().await;
            match entries.get(device_id) {
                Some(entry) if entry.state == PairingState::RequestedByRemote => {
                    entry.peer_fingerprint.clone()
                }
                _ => {
                    return Err(ProtocolError::Pairing(format!(
                        "No pending pairing request from {}",
                        device_id
                    )))
                }
            }
        };

        self.complete_pairing(device_id, fingerprint).await?;
        Ok(PairingPacket::accept())
    }

    /// Reject a pairing request received from the remote
    pub async fn reject(&self, device_id: &str) -> Result<Packet> {
        let current = self.state(device_id).await;
        if current != PairingState::RequestedByRemote {
            return Err(ProtocolError::Pairing(format!(
                "No pending pairing request from {}",
                device_id
            )));
        }

        self.transition(device_id, PairingState::Unpaired, None)
            .await;
        info!(device_id = %device_id, "Rejected pairing request");
        Ok(PairingPacket::reject())
    }

    /// Dissolve an existing pairing
    pub async fn unpair(&self, device_id: &str) -> Result<Packet> {
        if self.state(device_id).await != PairingState::Paired {
            return Err(ProtocolError::NotPaired);
        }

        self.trust.remove(device_id).await?;
        self.transition(device_id, PairingState::Unpaired, None)
            .await;
        info!(device_id = %device_id, "Unpaired device");
        Ok(PairingPacket::unpair())
    }

    /// Process an inbound `devlink.pair` packet
    ///
    /// Returns a response packet when the protocol calls for one.
    pub async fn handle_packet(
        &self,
        device_id: &str,
        peer_fingerprint: &str,
        packet: &Packet,
    ) -> Result<Option<Packet>> {
        let pairing = PairingPacket::from_packet(packet)?;
        let current = self.state(device_id).await;

        if pairing.pair {
            match current {
                PairingState::Unpaired => {
                    let epoch = self
                        .transition(
                            device_id,
                            PairingState::RequestedByRemote,
                            Some(peer_fingerprint.to_string()),
                        )
                        .await;
                    self.spawn_timeout(device_id.to_string(), epoch);
                    let _ = self.events.send(DeviceEvent::PairingRequested {
                        device_id: device_id.to_string(),
                        certificate_fingerprint: peer_fingerprint.to_string(),
                    });
                    info!(device_id = %device_id, "Received pairing request");
                    Ok(None)
                }
                // Simultaneous requests: an incoming request while ours is
                // pending counts as the acceptance, both sides converge
                PairingState::RequestedLocal => {
                    self.complete_pairing(device_id, Some(peer_fingerprint.to_string()))
                        .await?;
                    Ok(None)
                }
                PairingState::RequestedByRemote => {
                    debug!(device_id = %device_id, "Duplicate pairing request ignored");
                    Ok(None)
                }
                // Remote lost its record of us; reaffirm the pairing
                PairingState::Paired => Ok(Some(PairingPacket::accept())),
            }
        } else {
            match current {
                PairingState::RequestedLocal => {
                    self.transition(device_id, PairingState::Unpaired, None)
                        .await;
                    info!(device_id = %device_id, "Pairing request rejected by remote");
                    Ok(None)
                }
                PairingState::RequestedByRemote => {
                    self.transition(device_id, PairingState::Unpaired, None)
                        .await;
                    info!(device_id = %device_id, "Pairing request withdrawn by remote");
                    Ok(None)
                }
                PairingState::Paired => {
                    self.trust.remove(device_id).await?;
                    self.transition(device_id, PairingState::Unpaired, None)
                        .await;
                    info!(device_id = %device_id, "Unpaired by remote");
                    Ok(None)
                }
                PairingState::Unpaired => {
                    debug!(device_id = %device_id, "Ignoring pair=false while unpaired");
                    Ok(None)
                }
            }
        }
    }

    /// Drop in-flight requests when the link to a device closes
    ///
    /// Completed pairings are unaffected; trust outlives the link.
    pub async fn handle_link_closed(&self, device_id: &str) {
        let current = self.state(device_id).await;
        if current.is_requested() {
            self.transition(device_id, PairingState::Unpaired, None)
                .await;
            debug!(device_id = %device_id, "Link closed, pending pairing dropped");
        }
    }

    async fn complete_pairing(
        &self,
        device_id: &str,
        peer_fingerprint: Option<String>,
    ) -> Result<()> {
        let fingerprint = peer_fingerprint.ok_or_else(|| {
            ProtocolError::Pairing(format!("No certificate fingerprint for {}", device_id))
        })?;

        self.trust
            .record(TrustRecord {
                device_id: device_id.to_string(),
                certificate_fingerprint: fingerprint,
                pairing_state: PairingState::Paired,
            })
            .await?;
        self.transition(device_id, PairingState::Paired, None).await;

        info!(device_id = %device_id, "Pairing complete");
        Ok(())
    }

    async fn transition(
        &self,
        device_id: &str,
        state: PairingState,
        peer_fingerprint: Option<String>,
    ) -> u64 {
        let epoch = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(device_id.to_string()).or_insert(PendingEntry {
                state: PairingState::Unpaired,
                epoch: 0,
                peer_fingerprint: None,
            });
            entry.state = state;
            entry.epoch += 1;
            if peer_fingerprint.is_some() {
                entry.peer_fingerprint = peer_fingerprint;
            }
            entry.epoch
        };

        let _ = self.events.send(DeviceEvent::PairingStateChanged {
            device_id: device_id.to_string(),
            state,
        });
        epoch
    }

    fn spawn_timeout(&self, device_id: String, epoch: u64) {
        let entries = Arc::clone(&self.entries);
        let events = self.events.clone();
        let timeout = self.request_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let expired = {
                let mut guard = entries.write().await;
                match guard.get_mut(&device_id) {
                    Some(entry) if entry.epoch == epoch && entry.state.is_requested() => {
                        entry.state = PairingState::Unpaired;
                        entry.epoch += 1;
                        true
                    }
                    _ => false,
                }
            };

            if expired {
                warn!(device_id = %device_id, "Pairing request timed out");
                let _ = events.send(DeviceEvent::PairingStateChanged {
                    device_id,
                    state: PairingState::Unpaired,
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(temp_dir: &TempDir) -> PairingManager {
        let trust = Arc::new(
            TrustStore::open(temp_dir.path().join("trust.json"))
                .await
                .unwrap(),
        );
        let (events, _) = broadcast::channel(32);
        PairingManager::new(trust, events, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_local_request_accepted() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        let packet = manager.request("remote", "AA:BB").await.unwrap();
        assert_eq!(PairingPacket::from_packet(&packet).unwrap().pair, true);
        assert_eq!(manager.state("remote").await, PairingState::RequestedLocal);

        // pair=true in RequestedLocal completes the pairing
        let response = manager
            .handle_packet("remote", "AA:BB", &PairingPacket::accept())
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(manager.state("remote").await, PairingState::Paired);
    }

    #[tokio::test]
    async fn test_local_request_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager.request("remote", "AA:BB").await.unwrap();
        manager
            .handle_packet("remote", "AA:BB", &PairingPacket::reject())
            .await
            .unwrap();
        assert_eq!(manager.state("remote").await, PairingState::Unpaired);
    }

    #[tokio::test]
    async fn test_duplicate_request_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager.request("remote", "AA:BB").await.unwrap();
        let err = manager.request("remote", "AA:BB").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Pairing(_)));
    }

    #[tokio::test]
    async fn test_remote_request_accept() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        let response = manager
            .handle_packet("remote", "AA:BB", &PairingPacket::request())
            .await
            .unwrap();
        assert!(response.is_none());
        assert_eq!(
            manager.state("remote").await,
            PairingState::RequestedByRemote
        );

        let packet = manager.accept("remote").await.unwrap();
        assert_eq!(PairingPacket::from_packet(&packet).unwrap().pair, true);
        assert_eq!(manager.state("remote").await, PairingState::Paired);
    }

    #[tokio::test]
    async fn test_remote_request_reject() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager
            .handle_packet("remote", "AA:BB", &PairingPacket::request())
            .await
            .unwrap();
        let packet = manager.reject("remote").await.unwrap();
        assert_eq!(PairingPacket::from_packet(&packet).unwrap().pair, false);
        assert_eq!(manager.state("remote").await, PairingState::Unpaired);
    }

    #[tokio::test]
    async fn test_accept_without_request_fails() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        assert!(manager.accept("remote").await.is_err());
    }

    #[tokio::test]
    async fn test_paired_reaffirms_on_request() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager
            .handle_packet("remote", "AA:BB", &PairingPacket::request())
            .await
            .unwrap();
        manager.accept("remote").await.unwrap();

        let response = manager
            .handle_packet("remote", "AA:BB", &PairingPacket::request())
            .await
            .unwrap();
        assert!(response.is_some());
        assert_eq!(manager.state("remote").await, PairingState::Paired);
    }

    #[tokio::test]
    async fn test_unpair_from_remote() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager
            .handle_packet("remote", "AA:BB", &PairingPacket::request())
            .await
            .unwrap();
        manager.accept("remote").await.unwrap();

        manager
            .handle_packet("remote", "AA:BB", &PairingPacket::unpair())
            .await
            .unwrap();
        assert_eq!(manager.state("remote").await, PairingState::Unpaired);
    }

    #[tokio::test]
    async fn test_request_timeout_reverts() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager.request("remote", "AA:BB").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.state("remote").await, PairingState::Unpaired);
    }

    #[tokio::test]
    async fn test_timeout_does_not_clobber_completed_pairing() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager.request("remote", "AA:BB").await.unwrap();
        manager
            .handle_packet("remote", "AA:BB", &PairingPacket::accept())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.state("remote").await, PairingState::Paired);
    }

    #[tokio::test]
    async fn test_link_close_drops_pending_only() {
        let temp_dir = TempDir::new().unwrap();
        let manager = manager(&temp_dir).await;

        manager.request("pending", "AA:BB").await.unwrap();
        manager
            .handle_packet("paired", "CC:DD", &PairingPacket::request())
            .await
            .unwrap();
        manager.accept("paired").await.unwrap();

        manager.handle_link_closed("pending").await;
        manager.handle_link_closed("paired").await;

        assert_eq!(manager.state("pending").await, PairingState::Unpaired);
        assert_eq!(manager.state("paired").await, PairingState::Paired);
    }
}
