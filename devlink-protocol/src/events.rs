//! Engine event stream
//!
//! A single broadcast channel carries every observable state change. Consumers
//! subscribe through the engine and filter on the variants they care about.

use crate::identity::DeviceInfo;
use crate::pairing::PairingState;
use std::net::SocketAddr;

/// Events emitted by the session engine
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A remote device announced itself over UDP discovery
    DeviceDiscovered {
        /// Announced identity
        identity: DeviceInfo,
        /// Source address of the announcement
        source: SocketAddr,
    },

    /// A secure link to a device was established
    DeviceConnected {
        /// Remote identity exchanged during link setup
        identity: DeviceInfo,
        /// Remote peer address
        remote_addr: SocketAddr,
        /// Peer certificate fingerprint
        certificate_fingerprint: String,
    },

    /// The link to a device was lost or closed
    DeviceDisconnected {
        /// ID of the device
        device_id: String,
    },

    /// The remote device requested pairing and awaits a local decision
    PairingRequested {
        /// ID of the requesting device
        device_id: String,
        /// Fingerprint of the requesting device's certificate
        certificate_fingerprint: String,
    },

    /// The pairing state for a device changed
    PairingStateChanged {
        /// ID of the device
        device_id: String,
        /// New pairing state
        state: PairingState,
    },

    /// An inbound packet finished dispatch
    PacketDispatched {
        /// ID of the source device
        device_id: String,
        /// Packet type that was routed
        packet_type: String,
        /// Number of plugins the packet was delivered to
        handler_count: usize,
    },
}

impl DeviceEvent {
    /// Get device ID if this event is tied to one device
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceEvent::DeviceDiscovered { identity, .. } => Some(&identity.device_id),
            DeviceEvent::DeviceConnected { identity, .. } => Some(&identity.device_id),
            DeviceEvent::DeviceDisconnected { device_id } => Some(device_id),
            DeviceEvent::PairingRequested { device_id, .. } => Some(device_id),
            DeviceEvent::PairingStateChanged { device_id, .. } => Some(device_id),
            DeviceEvent::PacketDispatched { device_id, .. } => Some(device_id),
        }
    }

    /// Check if this is a connection-level event
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            DeviceEvent::DeviceConnected { .. } | DeviceEvent::DeviceDisconnected { .. }
        )
    }
}
