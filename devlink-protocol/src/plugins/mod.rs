//! Capability-based plugin dispatch
//!
//! Plugins declare the packet types they consume and produce. When a device
//! connects, the manager activates every registered plugin whose capabilities
//! intersect the remote identity, one instance per device. Each instance gets
//! a bounded queue and a worker task, so a slow plugin stalls only itself and
//! never the link read loop.
//!
//! Packet types follow the pattern `devlink.<plugin>[.<action>]`, for example
//! `devlink.ping` or `devlink.battery.request`.

pub mod battery;
pub mod ping;

use crate::error::{ProtocolError, Result};
use crate::events::DeviceEvent;
use crate::identity::DeviceInfo;
use crate::packet::Packet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Static description of a plugin type
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Short lowercase identifier like "ping" or "battery"
    pub name: String,

    /// Packet types this plugin can receive
    pub incoming_capabilities: Vec<String>,

    /// Packet types this plugin can send
    pub outgoing_capabilities: Vec<String>,

    /// Persistent plugins survive link loss and keep their state for the
    /// next connection; ephemeral ones are destroyed on disconnect
    pub persistent: bool,
}

impl PluginDescriptor {
    /// Whether this plugin should run against the given remote identity
    ///
    /// True when the plugin can receive something the remote sends, or send
    /// something the remote receives.
    pub fn matches(&self, device: &DeviceInfo) -> bool {
        self.incoming_capabilities
            .iter()
            .any(|cap| device.has_outgoing_capability(cap))
            || self
                .outgoing_capabilities
                .iter()
                .any(|cap| device.has_incoming_capability(cap))
    }

    fn handles(&self, packet_type: &str) -> bool {
        self.incoming_capabilities.iter().any(|cap| cap == packet_type)
    }
}

/// A per-device plugin instance
///
/// Instances are owned by their worker task; all methods are called from that
/// single task, so implementations never see concurrent calls.
#[async_trait]
pub trait Plugin: Send {
    /// Short lowercase identifier, matching the factory descriptor
    fn name(&self) -> &str;

    /// Called once before any packets are delivered
    async fn start(&mut self, device: &DeviceInfo) -> Result<()>;

    /// Called when the instance is being destroyed
    async fn stop(&mut self) -> Result<()>;

    /// Process one inbound packet, optionally producing a response
    ///
    /// Malformed bodies should be logged and swallowed; an error here is
    /// logged by the worker and does not kill the instance.
    async fn handle_packet(&mut self, packet: &Packet) -> Result<Option<Packet>>;
}

/// Creates plugin instances, one per connected device
pub trait PluginFactory: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    fn create(&self) -> Box<dyn Plugin>;
}

/// Decides whether a plugin may run for a device
///
/// Consulted at activation time. Implementations back this with user
/// preferences or policy; the default allows everything.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn allow(&self, device_id: &str, plugin_name: &str) -> bool;
}

/// Permission gate that permits every plugin for every device
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn allow(&self, _device_id: &str, _plugin_name: &str) -> bool {
        true
    }
}

struct ActivePlugin {
    descriptor: PluginDescriptor,
    queue: mpsc::Sender<Packet>,
    worker: JoinHandle<()>,
    enabled: Arc<AtomicBool>,
}

/// Activates plugins per device and routes inbound packets to them
pub struct PluginManager {
    factories: Vec<Arc<dyn PluginFactory>>,
    gate: Arc<dyn PermissionGate>,
    active: RwLock<HashMap<String, HashMap<String, ActivePlugin>>>,
    outbound: mpsc::UnboundedSender<(String, Packet)>,
    events: broadcast::Sender<DeviceEvent>,
    queue_depth: usize,
}

impl PluginManager {
    pub fn new(
        gate: Arc<dyn PermissionGate>,
        outbound: mpsc::UnboundedSender<(String, Packet)>,
        events: broadcast::Sender<DeviceEvent>,
        queue_depth: usize,
    ) -> Self {
        Self {
            factories: Vec::new(),
            gate,
            active: RwLock::new(HashMap::new()),
            outbound,
            events,
            queue_depth,
        }
    }

    /// Register a plugin factory
    ///
    /// Must happen before the manager starts activating devices.
    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        debug!(plugin = %factory.descriptor().name, "Registered plugin factory");
        self.factories.push(factory);
    }

    /// Names of registered plugins
    pub fn registered_plugins(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|f| f.descriptor().name)
            .collect()
    }

    /// Incoming capabilities across all registered plugins
    ///
    /// Used to populate the local identity packet.
    pub fn incoming_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .factories
            .iter()
            .flat_map(|f| f.descriptor().incoming_capabilities)
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// Outgoing capabilities across all registered plugins
    pub fn outgoing_capabilities(&self) -> Vec<String> {
        let mut caps: Vec<String> = self
            .factories
            .iter()
            .flat_map(|f| f.descriptor().outgoing_capabilities)
            .collect();
        caps.sort();
        caps.dedup();
        caps
    }

    /// Activate matching plugins for a newly paired-and-connected device
    ///
    /// Idempotent: plugins already active for the device (persistent
    /// survivors from a previous link) are left untouched.
    pub async fn activate(&self, device: &DeviceInfo) {
        let device_id = device.device_id.clone();

        for factory in &self.factories {
            let descriptor = factory.descriptor();
            if !descriptor.matches(device) {
                continue;
            }

            {
                let active = self.active.read().await;
                if active
                    .get(&device_id)
                    .map(|plugins| plugins.contains_key(&descriptor.name))
                    .unwrap_or(false)
                {
                    continue;
                }
            }

            if !self.gate.allow(&device_id, &descriptor.name).await {
                debug!(
                    device_id = %device_id,
                    plugin = %descriptor.name,
                    "Plugin not permitted for device"
                );
                continue;
            }

            let mut plugin = factory.create();
            if let Err(e) = plugin.start(device).await {
                warn!(
                    device_id = %device_id,
                    plugin = %descriptor.name,
                    error = %e,
                    "Plugin failed to start"
                );
                continue;
            }

            let (tx, rx) = mpsc::channel(self.queue_depth);
            let enabled = Arc::new(AtomicBool::new(true));
            let worker = self.spawn_worker(plugin, rx, device_id.clone(), Arc::clone(&enabled));

            info!(device_id = %device_id, plugin = %descriptor.name, "Plugin activated");
            self.active
                .write()
                .await
                .entry(device_id.clone())
                .or_default()
                .insert(
                    descriptor.name.clone(),
                    ActivePlugin {
                        descriptor,
                        queue: tx,
                        worker,
                        enabled,
                    },
                );
        }
    }

    fn spawn_worker(
        &self,
        mut plugin: Box<dyn Plugin>,
        mut rx: mpsc::Receiver<Packet>,
        device_id: String,
        enabled: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                if !enabled.load(Ordering::Relaxed) {
                    continue;
                }

                match plugin.handle_packet(&packet).await {
                    Ok(Some(response)) => {
                        if outbound.send((device_id.clone(), response)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            device_id = %device_id,
                            plugin = %plugin.name(),
                            packet_type = %packet.packet_type,
                            error = %e,
                            "Plugin failed to handle packet"
                        );
                    }
                }
            }

            if let Err(e) = plugin.stop().await {
                warn!(
                    device_id = %device_id,
                    plugin = %plugin.name(),
                    error = %e,
                    "Plugin failed to stop cleanly"
                );
            }
        })
    }

    /// Route an inbound packet to every active plugin that handles its type
    ///
    /// Delivery uses the bounded per-plugin queue and never blocks; when a
    /// queue is full the packet is dropped for that plugin with a warning.
    pub async fn dispatch(&self, device_id: &str, packet: Packet) {
        let mut handler_count = 0;

        {
            let active = self.active.read().await;
            if let Some(plugins) = active.get(device_id) {
                for (name, plugin) in plugins {
                    if !plugin.descriptor.handles(&packet.packet_type) {
                        continue;
                    }
                    handler_count += 1;

                    match plugin.queue.try_send(packet.clone()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(
                                device_id = %device_id,
                                plugin = %name,
                                packet_type = %packet.packet_type,
                                "Plugin queue full, dropping packet"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            debug!(
                                device_id = %device_id,
                                plugin = %name,
                                "Plugin queue closed"
                            );
                        }
                    }
                }
            }
        }

        if handler_count == 0 {
            warn!(
                device_id = %device_id,
                packet_type = %packet.packet_type,
                "No plugin handles packet type"
            );
        }

        let _ = self.events.send(DeviceEvent::PacketDispatched {
            device_id: device_id.to_string(),
            packet_type: packet.packet_type,
            handler_count,
        });
    }

    /// Destroy ephemeral plugin instances when the link to a device drops
    ///
    /// Persistent plugins stay active with their cached state and are reused
    /// on the next connection.
    pub async fn handle_link_lost(&self, device_id: &str) {
        let removed = {
            let mut active = self.active.write().await;
            let Some(plugins) = active.get_mut(device_id) else {
                return;
            };

            let ephemeral: Vec<String> = plugins
                .iter()
                .filter(|(_, p)| !p.descriptor.persistent)
                .map(|(name, _)| name.clone())
                .collect();
            let removed: Vec<ActivePlugin> = ephemeral
                .iter()
                .filter_map(|name| plugins.remove(name))
                .collect();

            if plugins.is_empty() {
                active.remove(device_id);
            }
            removed
        };

        for plugin in removed {
            debug!(
                device_id = %device_id,
                plugin = %plugin.descriptor.name,
                "Destroying ephemeral plugin after link loss"
            );
            Self::retire(plugin).await;
        }
    }

    /// Destroy all plugin instances for a device
    ///
    /// Used on unpair and engine shutdown.
    pub async fn teardown(&self, device_id: &str) {
        let removed = self.active.write().await.remove(device_id);
        if let Some(plugins) = removed {
            for (_, plugin) in plugins {
                Self::retire(plugin).await;
            }
            debug!(device_id = %device_id, "All plugins torn down");
        }
    }

    /// Destroy every plugin instance across all devices
    pub async fn shutdown(&self) {
        let all: Vec<String> = self.active.read().await.keys().cloned().collect();
        for device_id in all {
            self.teardown(&device_id).await;
        }
    }

    /// Enable or disable a plugin for a device without destroying it
    ///
    /// A disabled plugin drains its queue but handles nothing. Enabling
    /// consults the permission gate again, so a revoked plugin stays off.
    pub async fn set_enabled(&self, device_id: &str, plugin_name: &str, enabled: bool) -> Result<()> {
        if enabled && !self.gate.allow(device_id, plugin_name).await {
            return Err(ProtocolError::PermissionDenied(plugin_name.to_string()));
        }

        let active = self.active.read().await;
        let plugins = active
            .get(device_id)
            .ok_or_else(|| ProtocolError::DeviceNotFound(device_id.to_string()))?;
        let plugin = plugins.get(plugin_name).ok_or_else(|| {
            ProtocolError::Plugin(format!("{} is not active for this device", plugin_name))
        })?;

        plugin.enabled.store(enabled, Ordering::Relaxed);
        info!(
            device_id = %device_id,
            plugin = %plugin_name,
            enabled,
            "Plugin toggled"
        );
        Ok(())
    }

    /// Names of plugins currently active for a device
    pub async fn active_plugins(&self, device_id: &str) -> Vec<String> {
        self.active
            .read()
            .await
            .get(device_id)
            .map(|plugins| plugins.keys().cloned().collect())
            .unwrap_or_default()
    }

    async fn retire(plugin: ActivePlugin) {
        // Closing the queue lets the worker run the plugin's stop hook
        drop(plugin.queue);
        let _ = tokio::time::timeout(Duration::from_secs(1), plugin.worker).await;
    }
}
