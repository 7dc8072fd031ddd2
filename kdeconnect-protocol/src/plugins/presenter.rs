//! Presenter plugin: incoming-only remote-control events (pointer deltas,
//! start/stop) for driving a presentation from a phone (§2.1).
//!
//! Kept close to the teacher's `plugins/presenter.rs`, adapted to the new
//! `Plugin` trait: `&self`/`Arc<Device>` instead of `&mut self`/`&mut
//! Device`, so `presentation_active` moves into an `AtomicBool`.

use super::{Plugin, PluginFactory};
use crate::device::Device;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

pub const PACKET_TYPE_PRESENTER: &str = "kdeconnect.presenter";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenterEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dx: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<bool>,
}

pub struct PresenterPlugin {
    presentation_active: AtomicBool,
}

impl PresenterPlugin {
    pub fn new() -> Self {
        Self {
            presentation_active: AtomicBool::new(false),
        }
    }

    fn handle_presenter_event(&self, packet: &Packet) -> Result<()> {
        let event: PresenterEvent = serde_json::from_value(packet.body.clone())
            .map_err(|e| ProtocolError::Malformed(format!("presenter event: {e}")))?;

        if event.stop.unwrap_or(false) {
            info!("presentation mode stopped");
            self.presentation_active.store(false, Ordering::SeqCst);
            return Ok(());
        }

        if event.dx.is_some() || event.dy.is_some() {
            let dx = event.dx.unwrap_or(0.0);
            let dy = event.dy.unwrap_or(0.0);
            if !self.presentation_active.swap(true, Ordering::SeqCst) {
                info!("presentation mode started");
            }
            debug!("presenter pointer moved: dx={}, dy={}", dx, dy);
        }

        Ok(())
    }
}

impl Default for PresenterPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for PresenterPlugin {
    fn name(&self) -> &str {
        "presenter"
    }

    async fn handle_packet(&self, packet_type: &str, packet: &Packet, _device: &Arc<Device>) -> Result<()> {
        if packet_type != PACKET_TYPE_PRESENTER {
            return Ok(());
        }
        self.handle_presenter_event(packet)
    }
}

pub struct PresenterPluginFactory;

impl PluginFactory for PresenterPluginFactory {
    fn name(&self) -> &str {
        "presenter"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![PACKET_TYPE_PRESENTER.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        Vec::new()
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(PresenterPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceContext;
    use crate::device::Device;
    use crate::plugins::PluginRegistry;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_device(root: &std::path::Path, id: &str) -> Arc<Device> {
        let ctx = DeviceContext::for_device(root, id);
        let registry = Arc::new(PluginRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Device::new(id, ctx, registry, tx))
    }

    #[tokio::test]
    async fn pointer_movement_activates_presentation_mode() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-1");
        let plugin = PresenterPlugin::new();
        let packet = Packet::new(PACKET_TYPE_PRESENTER, json!({"dx": 10.5, "dy": -5.2}));

        plugin
            .handle_packet(PACKET_TYPE_PRESENTER, &packet, &device)
            .await
            .unwrap();
        assert!(plugin.presentation_active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_event_deactivates_presentation_mode() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-2");
        let plugin = PresenterPlugin::new();
        plugin.presentation_active.store(true, Ordering::SeqCst);

        let packet = Packet::new(PACKET_TYPE_PRESENTER, json!({"stop": true}));
        plugin
            .handle_packet(PACKET_TYPE_PRESENTER, &packet, &device)
            .await
            .unwrap();
        assert!(!plugin.presentation_active.load(Ordering::SeqCst));
    }

    #[test]
    fn factory_is_incoming_only() {
        let factory = PresenterPluginFactory;
        assert!(factory.outgoing_capabilities().is_empty());
        assert_eq!(factory.incoming_capabilities(), vec![PACKET_TYPE_PRESENTER]);
    }
}
