//! Device pairing
//!
//! Pairing exchanges `devlink.pair` packets carrying a single `pair` boolean.
//! `true` is a request or an acceptance depending on the current state,
//! `false` is a rejection, withdrawal, or unpair. Completed pairings pin the
//! peer certificate fingerprint in the trust store.

mod manager;

pub use manager::{PairingManager, PAIRING_TIMEOUT};

use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Packet type for pairing negotiation
pub const PAIR_PACKET_TYPE: &str = "devlink.pair";

/// Pairing state for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// No trust relationship
    Unpaired,
    /// We sent a request and await the remote decision
    RequestedLocal,
    /// The remote sent a request and awaits our decision
    RequestedByRemote,
    /// Pairing completed, certificate fingerprint pinned
    Paired,
}

impl PairingState {
    /// Whether a pairing request is in flight in either direction
    pub fn is_requested(&self) -> bool {
        matches!(
            self,
            PairingState::RequestedLocal | PairingState::RequestedByRemote
        )
    }
}

/// Parsed `devlink.pair` packet body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingPacket {
    pub pair: bool,
}

impl PairingPacket {
    /// Request or accept pairing
    pub fn request() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": true }))
    }

    /// Accept a pairing request
    pub fn accept() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": true }))
    }

    /// Reject a pairing request
    pub fn reject() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": false }))
    }

    /// Dissolve an existing pairing
    pub fn unpair() -> Packet {
        Packet::new(PAIR_PACKET_TYPE, json!({ "pair": false }))
    }

    /// Parse a `devlink.pair` packet
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(PAIR_PACKET_TYPE) {
            return Err(ProtocolError::InvalidPacket(format!(
                "Expected {} packet, got {}",
                PAIR_PACKET_TYPE, packet.packet_type
            )));
        }

        let pair = packet
            .get_body_field::<bool>("pair")
            .ok_or_else(|| ProtocolError::InvalidPacket("Missing pair field".to_string()))?;

        Ok(Self { pair })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_packet_constructors() {
        assert_eq!(
            PairingPacket::from_packet(&PairingPacket::request()).unwrap(),
            PairingPacket { pair: true }
        );
        assert_eq!(
            PairingPacket::from_packet(&PairingPacket::reject()).unwrap(),
            PairingPacket { pair: false }
        );
    }

    #[test]
    fn test_pairing_packet_rejects_wrong_type() {
        let packet = Packet::new("devlink.ping", json!({ "pair": true }));
        assert!(PairingPacket::from_packet(&packet).is_err());
    }

    #[test]
    fn test_pairing_packet_requires_pair_field() {
        let packet = Packet::new(PAIR_PACKET_TYPE, json!({}));
        assert!(PairingPacket::from_packet(&packet).is_err());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&PairingState::RequestedByRemote).unwrap();
        assert_eq!(json, "\"requested_by_remote\"");
    }

    #[test]
    fn test_is_requested() {
        assert!(PairingState::RequestedLocal.is_requested());
        assert!(PairingState::RequestedByRemote.is_requested());
        assert!(!PairingState::Paired.is_requested());
        assert!(!PairingState::Unpaired.is_requested());
    }
}
