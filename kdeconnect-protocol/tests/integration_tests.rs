//! Integration tests exercising the public crate surface: a `Device` driven
//! entirely through its channel-binding and pairing API, the built-in
//! reference plugins dispatched against it, and `DeviceManager` restoring
//! previously-known devices from disk.

use async_trait::async_trait;
use kdeconnect_protocol::channel::{Channel, PayloadStream};
use kdeconnect_protocol::plugins::battery::BatteryPluginFactory;
use kdeconnect_protocol::plugins::clipboard::ClipboardPluginFactory;
use kdeconnect_protocol::plugins::ping::PingPluginFactory;
use kdeconnect_protocol::plugins::presenter::PresenterPluginFactory;
use kdeconnect_protocol::service::lan::LanPorts;
use kdeconnect_protocol::{
    current_timestamp, DeviceContext, DeviceManager, DeviceStateFlags, DeviceType, Packet,
    PluginRegistry,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// A fake `Channel` with a FIFO of packets to hand back from `read_packet`
/// and a record of everything written to it, so tests can drive a `Device`
/// end-to-end without real sockets.
struct StubChannel {
    peer_identity: Packet,
    written: AsyncMutex<Vec<Packet>>,
    to_read: AsyncMutex<Vec<Packet>>,
}

impl StubChannel {
    fn new(peer_identity: Packet) -> Self {
        Self {
            peer_identity,
            written: AsyncMutex::new(Vec::new()),
            to_read: AsyncMutex::new(Vec::new()),
        }
    }

    async fn push_incoming(&self, packet: Packet) {
        self.to_read.lock().await.push(packet);
    }

    async fn written_types(&self) -> Vec<String> {
        self.written
            .lock()
            .await
            .iter()
            .map(|p| p.packet_type.clone())
            .collect()
    }
}

#[async_trait]
impl Channel for StubChannel {
    async fn read_packet(&self, _cancel: &CancellationToken) -> kdeconnect_protocol::Result<Packet> {
        let mut queue = self.to_read.lock().await;
        if queue.is_empty() {
            return Err(kdeconnect_protocol::ProtocolError::ConnectionClosed);
        }
        Ok(queue.remove(0))
    }

    async fn write_packet(
        &self,
        packet: Packet,
        _cancel: &CancellationToken,
    ) -> kdeconnect_protocol::Result<()> {
        self.written.lock().await.push(packet);
        Ok(())
    }

    async fn close(&self, _cancel: &CancellationToken) -> kdeconnect_protocol::Result<()> {
        Ok(())
    }

    async fn download(
        &self,
        _packet: &Packet,
        _cancel: &CancellationToken,
    ) -> kdeconnect_protocol::Result<Box<dyn PayloadStream>> {
        Err(kdeconnect_protocol::ProtocolError::NotConnected)
    }

    async fn upload(
        &self,
        _packet: &mut Packet,
        _cancel: &CancellationToken,
    ) -> kdeconnect_protocol::Result<Box<dyn PayloadStream>> {
        Err(kdeconnect_protocol::ProtocolError::NotConnected)
    }

    fn verification_key(&self) -> Option<String> {
        Some("1234".to_string())
    }

    fn peer_identity(&self) -> &Packet {
        &self.peer_identity
    }

    fn protocol_name(&self) -> &'static str {
        "lan"
    }
}

fn identity_for(device_id: &str) -> Packet {
    Packet::new(
        "kdeconnect.identity",
        json!({
            "deviceId": device_id,
            "deviceName": "Peer",
            "deviceType": "phone",
            "protocolVersion": 7,
        }),
    )
}

fn full_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    registry.register(Arc::new(PingPluginFactory));
    registry.register(Arc::new(BatteryPluginFactory));
    registry.register(Arc::new(ClipboardPluginFactory));
    registry.register(Arc::new(PresenterPluginFactory));
    registry
}

/// Poll `check` until it's true or `timeout` elapses, yielding to the
/// executor between attempts so the spawned read loop gets a chance to run.
async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn device_completes_pairing_and_dispatches_to_ping_plugin() {
    let root = TempDir::new().unwrap();
    let ctx = DeviceContext::for_device(root.path(), "peer-1");
    let registry = Arc::new(full_registry());
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let device = Arc::new(kdeconnect_protocol::Device::new(
        "peer-1",
        ctx,
        registry,
        event_tx,
    ));

    let channel = Arc::new(StubChannel::new(identity_for("peer-1")));
    device.set_channel(Some(channel.clone() as Arc<dyn Channel>)).await.unwrap();

    device.request_pairing().await.unwrap();
    assert!(device.flags().await.contains(DeviceStateFlags::PAIR_OUTGOING));

    // Simulate the peer accepting our pairing request.
    channel
        .push_incoming(Packet::new("kdeconnect.pair", json!({"pair": true})))
        .await;
    wait_until(Duration::from_secs(2), || async { device.is_paired().await }).await;
    assert!(!device.flags().await.contains(DeviceStateFlags::PAIR_OUTGOING));

    // Now that the device is paired, an incoming ping should draw an
    // outgoing one out of the ping plugin.
    channel
        .push_incoming(Packet::new("kdeconnect.ping", json!({"message": "hi"})))
        .await;
    wait_until(Duration::from_secs(2), || async {
        channel.written_types().await.contains(&"kdeconnect.ping".to_string())
    })
    .await;
}

#[tokio::test]
async fn unpaired_device_ignores_plugin_traffic() {
    let root = TempDir::new().unwrap();
    let ctx = DeviceContext::for_device(root.path(), "peer-2");
    let registry = Arc::new(full_registry());
    let (event_tx, _event_rx) = mpsc::unbounded_channel();
    let device = Arc::new(kdeconnect_protocol::Device::new(
        "peer-2",
        ctx,
        registry,
        event_tx,
    ));

    let channel = Arc::new(StubChannel::new(identity_for("peer-2")));
    device.set_channel(Some(channel.clone() as Arc<dyn Channel>)).await.unwrap();

    channel
        .push_incoming(Packet::new("kdeconnect.ping", json!({})))
        .await;

    // Give the read loop a chance to run; since the device never paired,
    // the ping must be dropped rather than echoed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!device.is_paired().await);
    assert!(!channel.written_types().await.contains(&"kdeconnect.ping".to_string()));
}

#[tokio::test]
async fn device_manager_restores_previously_paired_devices_on_init() {
    let root = TempDir::new().unwrap();

    // Simulate a prior run: a device directory with a persisted identity.
    let ctx = DeviceContext::for_device(root.path(), "known-device");
    ctx.ensure_dirs().unwrap();
    let identity = identity_for("known-device");
    std::fs::write(
        ctx.identity_path(),
        serde_json::to_vec_pretty(&identity.to_value()).unwrap(),
    )
    .unwrap();

    let registry = Arc::new(full_registry());
    let manager = DeviceManager::init(root.path(), "This PC", DeviceType::Desktop, LanPorts::default(), registry)
        .await
        .unwrap();

    let devices = manager.devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].id(), "known-device");
    assert!(manager.device("known-device").await.is_some());
    assert!(manager.device("unknown").await.is_none());
}

#[tokio::test]
async fn device_manager_init_is_idempotent_about_unrelated_files() {
    let root = TempDir::new().unwrap();
    // A stray file (not a device directory) alongside the certificate.
    std::fs::write(root.path().join("notes.txt"), b"hello").unwrap();

    let registry = Arc::new(full_registry());
    let manager = DeviceManager::init(root.path(), "This PC", DeviceType::Desktop, LanPorts::default(), registry)
        .await
        .unwrap();

    assert!(manager.devices().await.is_empty());
    assert!(!manager.device_id().is_empty());
}

#[tokio::test]
async fn identify_with_unknown_scheme_errors_before_any_service_starts() {
    let root = TempDir::new().unwrap();
    let registry = Arc::new(full_registry());
    let manager = DeviceManager::init(root.path(), "This PC", DeviceType::Desktop, LanPorts::default(), registry)
        .await
        .unwrap();

    // No services have been started yet, so every scheme is unknown.
    let result = manager.identify(Some("lan://192.168.1.1:1716")).await;
    assert!(result.is_err());

    // Probing with no target never errors even with zero services loaded.
    assert!(manager.identify(None).await.is_ok());
}

#[test]
fn reference_plugin_registry_declares_every_builtin_capability() {
    let registry = full_registry();
    let incoming = registry.all_incoming_capabilities();
    let outgoing = registry.all_outgoing_capabilities();

    assert!(incoming.contains(&"kdeconnect.ping".to_string()));
    assert!(incoming.contains(&"kdeconnect.clipboard".to_string()));
    assert!(incoming.contains(&"kdeconnect.presenter".to_string()));
    assert!(outgoing.contains(&"kdeconnect.ping".to_string()));
    assert!(outgoing.contains(&"kdeconnect.battery".to_string()));
    assert_eq!(registry.factory_count(), 4);
}

#[test]
fn current_timestamp_is_monotonic_enough_for_packet_ids() {
    let a = current_timestamp();
    let b = current_timestamp();
    assert!(b >= a);
}
