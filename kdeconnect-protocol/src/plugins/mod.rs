//! Plugin Contract: capability-declaring handlers a [`crate::device::Device`]
//! dispatches packets to once paired (§4.H).
//!
//! Plugin *instances* are per-Device — a `PluginRegistry` holds the
//! stateless factories registered once at daemon startup, and each Device
//! instantiates its own set the first time it is bound to a channel, so two
//! peers running the same plugin never share state.

pub mod battery;
pub mod clipboard;
pub mod ping;
pub mod presenter;

use crate::device::{Device, DeviceStateFlags};
use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A handler attached to a single Device, declaring the packet types it
/// sends and receives.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Short, lowercase identifier, e.g. `"ping"`, `"battery"`.
    fn name(&self) -> &str;

    /// Prepare persistent resources and register actions. Called once,
    /// right after instantiation. Takes `Arc<Device>` (not `&Device`) so a
    /// plugin may spawn a background task that outlives this call.
    async fn enable(&self, device: &Arc<Device>) -> Result<()> {
        let _ = device;
        Ok(())
    }

    /// Release all resources. Called exactly once after a successful
    /// `enable`, when the owning Device is torn down.
    async fn disable(&self, device: &Arc<Device>) -> Result<()> {
        let _ = device;
        Ok(())
    }

    /// Handle one incoming packet whose type is in this plugin's incoming
    /// capabilities. Invoked only while the Device is paired.
    async fn handle_packet(&self, packet_type: &str, packet: &Packet, device: &Arc<Device>) -> Result<()>;

    /// Called whenever the owning Device's connected/paired state changes.
    async fn update_state(&self, flags: DeviceStateFlags, device: &Arc<Device>) -> Result<()> {
        let _ = (flags, device);
        Ok(())
    }
}

/// Stateless descriptor + constructor for a [`Plugin`], registered once at
/// daemon startup (§4.H).
pub trait PluginFactory: Send + Sync {
    fn name(&self) -> &str;
    fn incoming_capabilities(&self) -> Vec<String>;
    fn outgoing_capabilities(&self) -> Vec<String>;

    /// If set, this plugin is only instantiated when the bound Channel
    /// Service advertises a matching protocol name (`"lan"` or
    /// `"bluetooth"`).
    fn channel_protocol(&self) -> Option<&'static str> {
        None
    }

    fn create(&self) -> Box<dyn Plugin>;
}

/// Registry of plugin factories shared by every Device (§4.G, §4.H).
pub struct PluginRegistry {
    factories: Vec<Arc<dyn PluginFactory>>,
    capability_map: HashMap<String, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            capability_map: HashMap::new(),
        }
    }

    /// Register a factory, wiring its incoming capabilities into the
    /// dispatch map. Later registrations win on capability collisions,
    /// matching a config that simply lists enabled plugins in order.
    pub fn register(&mut self, factory: Arc<dyn PluginFactory>) {
        let name = factory.name().to_string();
        for capability in factory.incoming_capabilities() {
            self.capability_map.insert(capability, name.clone());
        }
        info!("registered plugin factory: {}", name);
        self.factories.push(factory);
    }

    /// Build one fresh instance per registered factory whose
    /// `channel_protocol()` either has no preference or matches `protocol`
    /// (the name of the Channel Service the Device is currently bound to,
    /// e.g. `"lan"` or `"bluetooth"`).
    pub fn instantiate_for(&self, protocol: &str) -> Vec<Box<dyn Plugin>> {
        self.factories
            .iter()
            .filter(|f| match f.channel_protocol() {
                None => true,
                Some(p) => p == protocol,
            })
            .map(|f| f.create())
            .collect()
    }

    /// Name of the plugin that handles `packet_type`, if any.
    pub fn plugin_for(&self, packet_type: &str) -> Option<&str> {
        self.capability_map.get(packet_type).map(String::as_str)
    }

    /// Every incoming capability across all registered factories, merged
    /// into this host's identity (§4.E `build_identity`).
    pub fn all_incoming_capabilities(&self) -> Vec<String> {
        self.factories
            .iter()
            .flat_map(|f| f.incoming_capabilities())
            .collect()
    }

    /// Every outgoing capability across all registered factories.
    pub fn all_outgoing_capabilities(&self) -> Vec<String> {
        self.factories
            .iter()
            .flat_map(|f| f.outgoing_capabilities())
            .collect()
    }

    pub fn factory_count(&self) -> usize {
        self.factories.len()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
