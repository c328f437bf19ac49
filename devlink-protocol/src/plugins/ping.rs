//! Ping plugin
//!
//! Connectivity testing over `devlink.ping` packets. Fire-and-forget: a ping
//! carries an optional `message` and expects no response. Ephemeral, so the
//! received count resets with each link.

use crate::error::Result;
use crate::identity::DeviceInfo;
use crate::packet::Packet;
use crate::plugins::{Plugin, PluginDescriptor, PluginFactory};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

/// Packet type for ping
pub const PING_PACKET_TYPE: &str = "devlink.ping";

/// Build an outbound ping packet
pub fn create_ping(message: Option<&str>) -> Packet {
    match message {
        Some(message) => Packet::new(PING_PACKET_TYPE, json!({ "message": message })),
        None => Packet::new(PING_PACKET_TYPE, json!({})),
    }
}

/// Per-device ping instance
pub struct PingPlugin {
    device_name: String,
    received: u64,
}

impl PingPlugin {
    pub fn new() -> Self {
        Self {
            device_name: String::new(),
            received: 0,
        }
    }
}

impl Default for PingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for PingPlugin {
    fn name(&self) -> &str {
        "ping"
    }

    async fn start(&mut self, device: &DeviceInfo) -> Result<()> {
        self.device_name = device.device_name.clone();
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        debug!(
            device = %self.device_name,
            received = self.received,
            "Ping plugin stopped"
        );
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<Option<Packet>> {
        self.received += 1;
        let message = packet
            .get_body_field::<String>("message")
            .unwrap_or_else(|| "Ping!".to_string());
        info!(device = %self.device_name, message = %message, "Received ping");
        Ok(None)
    }
}

/// Factory for [`PingPlugin`]
pub struct PingPluginFactory;

impl PluginFactory for PingPluginFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "ping".to_string(),
            incoming_capabilities: vec![PING_PACKET_TYPE.to_string()],
            outgoing_capabilities: vec![PING_PACKET_TYPE.to_string()],
            persistent: false,
        }
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PingPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceType;

    #[test]
    fn test_create_ping() {
        let packet = create_ping(None);
        assert!(packet.is_type(PING_PACKET_TYPE));

        let packet = create_ping(Some("hello"));
        assert_eq!(
            packet.get_body_field::<String>("message"),
            Some("hello".to_string())
        );
    }

    #[tokio::test]
    async fn test_handle_ping_counts() {
        let mut plugin = PingPlugin::new();
        let device = DeviceInfo::new("Phone", DeviceType::Phone, 1716);
        plugin.start(&device).await.unwrap();

        let response = plugin.handle_packet(&create_ping(None)).await.unwrap();
        assert!(response.is_none());
        plugin.handle_packet(&create_ping(Some("hi"))).await.unwrap();
        assert_eq!(plugin.received, 2);
    }
}
