//! Clipboard plugin: bidirectional `kdeconnect.clipboard` /
//! `kdeconnect.clipboard.connect` text sync, guarded against echo loops by a
//! monotonic timestamp (§2.1).
//!
//! Grounded on the teacher's `plugins/clipboard.rs` for the packet shapes and
//! the timestamp-based loop prevention rule (ignore anything not newer than
//! what we already hold, ignore connect packets carrying timestamp `0`).
//! Local clipboard access is abstracted behind [`ClipboardSource`] so tests
//! don't depend on a real OS clipboard.

use super::{Plugin, PluginFactory};
use crate::device::Device;
use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const PACKET_TYPE_CLIPBOARD: &str = "kdeconnect.clipboard";
pub const PACKET_TYPE_CLIPBOARD_CONNECT: &str = "kdeconnect.clipboard.connect";

/// Local clipboard access, swappable for tests.
pub trait ClipboardSource: Send + Sync {
    fn read(&self) -> String;
    fn write(&self, content: &str);
}

/// No-op source for hosts without a clipboard backend wired up.
struct NullClipboardSource;

impl ClipboardSource for NullClipboardSource {
    fn read(&self) -> String {
        String::new()
    }
    fn write(&self, _content: &str) {}
}

#[derive(Debug, Clone, PartialEq, Default)]
struct ClipboardState {
    content: String,
    timestamp: i64,
}

pub struct ClipboardPlugin {
    source: Arc<dyn ClipboardSource>,
    state: RwLock<ClipboardState>,
}

impl ClipboardPlugin {
    pub fn new() -> Self {
        Self {
            source: Arc::new(NullClipboardSource),
            state: RwLock::new(ClipboardState::default()),
        }
    }

    pub fn with_source(source: Arc<dyn ClipboardSource>) -> Self {
        Self {
            source,
            state: RwLock::new(ClipboardState::default()),
        }
    }

    async fn handle_update(&self, packet: &Packet, device: &Device) {
        let Some(content) = packet.body.get("content").and_then(|v| v.as_str()) else {
            return;
        };
        if content.is_empty() {
            debug!("ignoring empty clipboard update from {}", device.id());
            return;
        }
        let timestamp = Utc::now().timestamp_millis();
        *self.state.write().await = ClipboardState {
            content: content.to_string(),
            timestamp,
        };
        self.source.write(content);
        info!("clipboard updated from {} ({} chars)", device.id(), content.len());
    }

    async fn handle_connect(&self, packet: &Packet, device: &Device) {
        let content = packet.body.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let timestamp = packet.body.get("timestamp").and_then(|v| v.as_i64()).unwrap_or(0);
        if timestamp == 0 {
            debug!("ignoring clipboard connect from {} with timestamp 0", device.id());
            return;
        }

        let current = self.state.read().await.clone();
        if timestamp <= current.timestamp {
            debug!(
                "ignoring clipboard connect from {}: timestamp {} <= local {}",
                device.id(),
                timestamp,
                current.timestamp
            );
            return;
        }

        *self.state.write().await = ClipboardState {
            content: content.to_string(),
            timestamp,
        };
        self.source.write(content);
        info!("clipboard synced from {} on connect", device.id());
    }
}

impl Default for ClipboardPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ClipboardPlugin {
    fn name(&self) -> &str {
        "clipboard"
    }

    async fn enable(&self, device: &Arc<Device>) -> Result<()> {
        let content = self.source.read();
        if content.is_empty() {
            return Ok(());
        }
        let timestamp = Utc::now().timestamp_millis();
        *self.state.write().await = ClipboardState {
            content: content.clone(),
            timestamp,
        };
        let packet = Packet::new(
            PACKET_TYPE_CLIPBOARD_CONNECT,
            json!({ "content": content, "timestamp": timestamp }),
        );
        device.queue_packet(packet).await;
        Ok(())
    }

    async fn handle_packet(&self, packet_type: &str, packet: &Packet, device: &Arc<Device>) -> Result<()> {
        match packet_type {
            PACKET_TYPE_CLIPBOARD => self.handle_update(packet, device).await,
            PACKET_TYPE_CLIPBOARD_CONNECT => self.handle_connect(packet, device).await,
            _ => {}
        }
        Ok(())
    }
}

pub struct ClipboardPluginFactory;

impl PluginFactory for ClipboardPluginFactory {
    fn name(&self) -> &str {
        "clipboard"
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![
            PACKET_TYPE_CLIPBOARD.to_string(),
            PACKET_TYPE_CLIPBOARD_CONNECT.to_string(),
        ]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![
            PACKET_TYPE_CLIPBOARD.to_string(),
            PACKET_TYPE_CLIPBOARD_CONNECT.to_string(),
        ]
    }

    fn create(&self) -> Box<dyn Plugin> {
        Box::new(ClipboardPlugin::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeviceContext;
    use crate::device::Device;
    use crate::plugins::PluginRegistry;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct RecordingSource {
        written: StdMutex<Vec<String>>,
    }

    impl ClipboardSource for RecordingSource {
        fn read(&self) -> String {
            String::new()
        }
        fn write(&self, content: &str) {
            self.written.lock().unwrap().push(content.to_string());
        }
    }

    fn test_device(root: &std::path::Path, id: &str) -> Arc<Device> {
        let ctx = DeviceContext::for_device(root, id);
        let registry = Arc::new(PluginRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(Device::new(id, ctx, registry, tx))
    }

    #[test]
    fn factory_declares_both_packet_types_both_ways() {
        let factory = ClipboardPluginFactory;
        assert_eq!(factory.incoming_capabilities().len(), 2);
        assert_eq!(factory.outgoing_capabilities().len(), 2);
    }

    #[tokio::test]
    async fn empty_update_is_ignored() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-1");
        let plugin = ClipboardPlugin::new();
        let packet = Packet::new(PACKET_TYPE_CLIPBOARD, json!({"content": ""}));
        plugin.handle_packet(PACKET_TYPE_CLIPBOARD, &packet, &device).await.unwrap();
        assert!(plugin.state.read().await.content.is_empty());
    }

    #[tokio::test]
    async fn update_writes_through_to_source() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-2");
        let source = Arc::new(RecordingSource {
            written: StdMutex::new(Vec::new()),
        });
        let plugin = ClipboardPlugin::with_source(source.clone());
        let packet = Packet::new(PACKET_TYPE_CLIPBOARD, json!({"content": "hello"}));
        plugin.handle_packet(PACKET_TYPE_CLIPBOARD, &packet, &device).await.unwrap();
        assert_eq!(source.written.lock().unwrap().as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn connect_with_zero_timestamp_is_ignored() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-3");
        let plugin = ClipboardPlugin::new();
        let packet = Packet::new(
            PACKET_TYPE_CLIPBOARD_CONNECT,
            json!({"content": "stale", "timestamp": 0}),
        );
        plugin
            .handle_packet(PACKET_TYPE_CLIPBOARD_CONNECT, &packet, &device)
            .await
            .unwrap();
        assert!(plugin.state.read().await.content.is_empty());
    }

    #[tokio::test]
    async fn connect_older_than_local_is_ignored() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-4");
        let plugin = ClipboardPlugin::new();
        *plugin.state.write().await = ClipboardState {
            content: "current".to_string(),
            timestamp: 2000,
        };
        let packet = Packet::new(
            PACKET_TYPE_CLIPBOARD_CONNECT,
            json!({"content": "older", "timestamp": 1000}),
        );
        plugin
            .handle_packet(PACKET_TYPE_CLIPBOARD_CONNECT, &packet, &device)
            .await
            .unwrap();
        assert_eq!(plugin.state.read().await.content, "current");
    }

    #[tokio::test]
    async fn connect_newer_than_local_is_applied() {
        let root = TempDir::new().unwrap();
        let device = test_device(root.path(), "dev-5");
        let plugin = ClipboardPlugin::new();
        *plugin.state.write().await = ClipboardState {
            content: "old".to_string(),
            timestamp: 1000,
        };
        let packet = Packet::new(
            PACKET_TYPE_CLIPBOARD_CONNECT,
            json!({"content": "new", "timestamp": 2000}),
        );
        plugin
            .handle_packet(PACKET_TYPE_CLIPBOARD_CONNECT, &packet, &device)
            .await
            .unwrap();
        assert_eq!(plugin.state.read().await.content, "new");
    }
}
