//! Device identity
//!
//! The identity packet (`devlink.identity`) is the first thing each peer
//! sends on any channel, unencrypted: it declares a stable device id, a
//! human-readable name, the TCP port accepting links, and the packet types
//! the device can send and receive. Identity is immutable once received;
//! updated capabilities arrive through a fresh announcement.

use crate::{Packet, ProtocolError, Result, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

/// Packet type of the identity announcement
pub const IDENTITY_PACKET_TYPE: &str = "devlink.identity";

/// Kinds of devices participating in a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "desktop" => Ok(DeviceType::Desktop),
            "laptop" => Ok(DeviceType::Laptop),
            "phone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            "tv" => Ok(DeviceType::Tv),
            other => Err(ProtocolError::InvalidPacket(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

/// Device identity information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Unique device identifier (UUIDv4 with underscores)
    pub device_id: String,

    /// Human-readable device name (1-32 characters)
    pub device_name: String,

    /// Type of device
    pub device_type: DeviceType,

    /// Protocol version
    pub protocol_version: u32,

    /// Packet types this device can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this device can send
    pub outgoing_capabilities: Vec<String>,

    /// TCP port accepting link connections
    pub tcp_port: u16,
}

impl DeviceInfo {
    /// Create a new identity with a freshly generated device id
    pub fn new(device_name: impl Into<String>, device_type: DeviceType, tcp_port: u16) -> Self {
        let device_name = device_name.into();
        if device_name.is_empty() || device_name.len() > 32 {
            warn!("device name should be 1-32 characters, got: {}", device_name);
        }

        Self {
            device_id: generate_device_id(),
            device_name,
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Create an identity with an explicit device id
    pub fn with_id(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        tcp_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
            device_type,
            protocol_version: PROTOCOL_VERSION,
            incoming_capabilities: Vec::new(),
            outgoing_capabilities: Vec::new(),
            tcp_port,
        }
    }

    /// Add an incoming capability
    pub fn with_incoming_capability(mut self, capability: impl Into<String>) -> Self {
        self.incoming_capabilities.push(capability.into());
        self
    }

    /// Add an outgoing capability
    pub fn with_outgoing_capability(mut self, capability: impl Into<String>) -> Self {
        self.outgoing_capabilities.push(capability.into());
        self
    }

    /// Replace all incoming capabilities
    pub fn with_incoming_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.incoming_capabilities = capabilities;
        self
    }

    /// Replace all outgoing capabilities
    pub fn with_outgoing_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.outgoing_capabilities = capabilities;
        self
    }

    /// Whether the device advertises a specific incoming capability
    pub fn has_incoming_capability(&self, capability: &str) -> bool {
        self.incoming_capabilities.iter().any(|c| c == capability)
    }

    /// Whether the device advertises a specific outgoing capability
    pub fn has_outgoing_capability(&self, capability: &str) -> bool {
        self.outgoing_capabilities.iter().any(|c| c == capability)
    }

    /// Build the identity announcement packet
    pub fn to_identity_packet(&self) -> Packet {
        Packet::new(
            IDENTITY_PACKET_TYPE,
            json!({
                "deviceId": self.device_id,
                "deviceName": self.device_name,
                "deviceType": self.device_type.as_str(),
                "protocolVersion": self.protocol_version,
                "incomingCapabilities": self.incoming_capabilities,
                "outgoingCapabilities": self.outgoing_capabilities,
                "tcpPort": self.tcp_port,
            }),
        )
    }

    /// Parse a received identity packet
    pub fn from_identity_packet(packet: &Packet) -> Result<Self> {
        if !packet.is_type(IDENTITY_PACKET_TYPE) {
            return Err(ProtocolError::InvalidPacket(
                "not an identity packet".to_string(),
            ));
        }

        let device_id = packet
            .get_body_field::<String>("deviceId")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceId".to_string()))?;

        let device_name = packet
            .get_body_field::<String>("deviceName")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceName".to_string()))?;

        let device_type_str = packet
            .get_body_field::<String>("deviceType")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing deviceType".to_string()))?;
        let device_type = DeviceType::from_str(&device_type_str)?;

        let protocol_version = packet
            .get_body_field::<u32>("protocolVersion")
            .unwrap_or(PROTOCOL_VERSION);

        let tcp_port = packet
            .get_body_field::<u16>("tcpPort")
            .ok_or_else(|| ProtocolError::InvalidPacket("missing tcpPort".to_string()))?;

        let incoming_capabilities = packet
            .get_body_field::<Vec<String>>("incomingCapabilities")
            .unwrap_or_default();

        let outgoing_capabilities = packet
            .get_body_field::<Vec<String>>("outgoingCapabilities")
            .unwrap_or_default();

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            tcp_port,
        })
    }
}

/// Generate a UUIDv4 device id with underscores instead of hyphens
fn generate_device_id() -> String {
    Uuid::new_v4().to_string().replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_type_strings() {
        assert_eq!(DeviceType::Desktop.as_str(), "desktop");
        assert_eq!(DeviceType::Phone.as_str(), "phone");
        assert_eq!(DeviceType::from_str("tablet").unwrap(), DeviceType::Tablet);
        assert!(DeviceType::from_str("toaster").is_err());
    }

    #[test]
    fn test_device_info_creation() {
        let info = DeviceInfo::new("Test Device", DeviceType::Desktop, 1716);

        assert!(!info.device_id.is_empty());
        assert_eq!(info.device_id.matches('_').count(), 4);
        assert_eq!(info.device_name, "Test Device");
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.tcp_port, 1716);
    }

    #[test]
    fn test_capabilities() {
        let info = DeviceInfo::new("Test Device", DeviceType::Desktop, 1716)
            .with_incoming_capability("devlink.battery")
            .with_incoming_capability("devlink.ping")
            .with_outgoing_capability("devlink.clipboard");

        assert!(info.has_incoming_capability("devlink.battery"));
        assert!(info.has_outgoing_capability("devlink.clipboard"));
        assert!(!info.has_incoming_capability("devlink.clipboard"));
    }

    #[test]
    fn test_identity_packet_roundtrip() {
        let original = DeviceInfo::with_id("phone_a", "Test Phone", DeviceType::Phone, 1740)
            .with_incoming_capability("devlink.ping")
            .with_outgoing_capability("devlink.battery");

        let packet = original.to_identity_packet();
        assert!(packet.is_type(IDENTITY_PACKET_TYPE));

        let parsed = DeviceInfo::from_identity_packet(&packet).unwrap();
        assert_eq!(parsed.device_id, "phone_a");
        assert_eq!(parsed.device_name, "Test Phone");
        assert_eq!(parsed.device_type, DeviceType::Phone);
        assert_eq!(parsed.tcp_port, 1740);
        assert_eq!(parsed.incoming_capabilities, vec!["devlink.ping"]);
        assert_eq!(parsed.outgoing_capabilities, vec!["devlink.battery"]);
    }

    #[test]
    fn test_rejects_non_identity_packet() {
        let packet = Packet::new("devlink.ping", json!({}));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }

    #[test]
    fn test_rejects_missing_fields() {
        let packet = Packet::new(IDENTITY_PACKET_TYPE, json!({ "deviceId": "phone_a" }));
        assert!(DeviceInfo::from_identity_packet(&packet).is_err());
    }
}
