//! Battery plugin
//!
//! Tracks the remote device's battery level from `devlink.battery` broadcasts
//! and answers `devlink.battery.request` polls with the local status. The
//! plugin is persistent: the last known remote status survives link loss so a
//! reconnect starts from the cached value instead of unknown.
//!
//! ## Packet Format
//!
//! ```json
//! {
//!     "id": 1234567890,
//!     "type": "devlink.battery",
//!     "body": {
//!         "currentCharge": 75,
//!         "isCharging": true,
//!         "thresholdEvent": 0
//!     }
//! }
//! ```
//!
//! `currentCharge` is -1 when the device has no battery. `thresholdEvent` is
//! 1 when the level dropped below the low threshold, otherwise 0.

use crate::error::Result;
use crate::identity::DeviceInfo;
use crate::packet::Packet;
use crate::plugins::{Plugin, PluginDescriptor, PluginFactory};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Packet type for battery status broadcasts
pub const BATTERY_PACKET_TYPE: &str = "devlink.battery";

/// Packet type for battery status polls
pub const BATTERY_REQUEST_PACKET_TYPE: &str = "devlink.battery.request";

/// Battery status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge percentage, -1 when no battery is present
    #[serde(rename = "currentCharge")]
    pub current_charge: i32,

    #[serde(rename = "isCharging")]
    pub is_charging: bool,

    /// 1 when the level fell below the low threshold, otherwise 0
    #[serde(rename = "thresholdEvent", default)]
    pub threshold_event: i32,
}

impl BatteryStatus {
    pub fn new(current_charge: i32, is_charging: bool) -> Self {
        Self {
            current_charge,
            is_charging,
            threshold_event: 0,
        }
    }

    /// Status for a device without a battery
    pub fn absent() -> Self {
        Self {
            current_charge: -1,
            is_charging: false,
            threshold_event: 0,
        }
    }

    pub fn has_battery(&self) -> bool {
        self.current_charge >= 0
    }

    /// Build a `devlink.battery` broadcast packet
    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(
            BATTERY_PACKET_TYPE,
            serde_json::to_value(self)?,
        ))
    }
}

/// Shared cache of the last status seen per peer plugin instance
pub type BatteryCache = Arc<RwLock<Option<BatteryStatus>>>;

/// Per-device battery instance
pub struct BatteryPlugin {
    device_name: String,
    /// Last status the remote reported, shared with the factory owner
    remote_status: BatteryCache,
    /// Local status reported back on polls
    local_status: Arc<RwLock<BatteryStatus>>,
}

#[async_trait]
impl Plugin for BatteryPlugin {
    fn name(&self) -> &str {
        "battery"
    }

    async fn start(&mut self, device: &DeviceInfo) -> Result<()> {
        self.device_name = device.device_name.clone();
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn handle_packet(&mut self, packet: &Packet) -> Result<Option<Packet>> {
        if packet.is_type(BATTERY_REQUEST_PACKET_TYPE) {
            let status = *self.local_status.read().await;
            debug!(device = %self.device_name, "Answering battery poll");
            return Ok(Some(status.to_packet()?));
        }

        match serde_json::from_value::<BatteryStatus>(packet.body.clone()) {
            Ok(status) => {
                info!(
                    device = %self.device_name,
                    charge = status.current_charge,
                    charging = status.is_charging,
                    "Battery status updated"
                );
                *self.remote_status.write().await = Some(status);
            }
            Err(e) => {
                warn!(
                    device = %self.device_name,
                    error = %e,
                    "Malformed battery packet ignored"
                );
            }
        }
        Ok(None)
    }
}

/// Factory for [`BatteryPlugin`]
///
/// Holds the caches outside the instances so a persistent plugin's state can
/// be read by the application while the link is down.
pub struct BatteryPluginFactory {
    remote_status: BatteryCache,
    local_status: Arc<RwLock<BatteryStatus>>,
}

impl BatteryPluginFactory {
    pub fn new() -> Self {
        Self {
            remote_status: Arc::new(RwLock::new(None)),
            local_status: Arc::new(RwLock::new(BatteryStatus::absent())),
        }
    }

    /// Handle to the last remote status seen
    pub fn remote_status(&self) -> BatteryCache {
        Arc::clone(&self.remote_status)
    }

    /// Update the local status reported on polls
    pub async fn set_local_status(&self, status: BatteryStatus) {
        *self.local_status.write().await = status;
    }
}

impl Default for BatteryPluginFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginFactory for BatteryPluginFactory {
    fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            name: "battery".to_string(),
            incoming_capabilities: vec![
                BATTERY_PACKET_TYPE.to_string(),
                BATTERY_REQUEST_PACKET_TYPE.to_string(),
            ],
            outgoing_capabilities: vec![BATTERY_PACKET_TYPE.to_string()],
            persistent: true,
        }
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(BatteryPlugin {
            device_name: String::new(),
            remote_status: Arc::clone(&self.remote_status),
            local_status: Arc::clone(&self.local_status),
        })
    }
}
