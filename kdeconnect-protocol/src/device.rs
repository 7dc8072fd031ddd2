//! Device: a live per-peer actor, owning at most one bound [`Channel`] and
//! the pairing/capability state machine that gates which packets may cross
//! it (§4.F).
//!
//! Grounded on `connection/manager.rs`'s `spawn_connection_handler` (one
//! task per peer, a command channel for outgoing packets, a select loop for
//! incoming ones) and `pairing/handler.rs`'s pairing status machine,
//! generalized from a single TLS connection to the polymorphic [`Channel`]
//! and a symmetric request/accept/reject protocol driven entirely by packet
//! exchange rather than local API calls.

use crate::channel::Channel;
use crate::context::DeviceContext;
use crate::error::{ProtocolError, Result};
use crate::identity::{DeviceType, RemoteIdentity};
use crate::packet::Packet;
use crate::plugins::{Plugin, PluginRegistry};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a pairing request stays open before it's treated as rejected
/// (§4.F item 1).
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(30);

/// Composite connection/pairing state, recomputed on every transition and
/// handed to plugins via `update_state` (§4.F, §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceStateFlags(u8);

impl DeviceStateFlags {
    pub const NONE: Self = Self(0);
    pub const CONNECTED: Self = Self(1 << 0);
    pub const PAIRED: Self = Self(1 << 1);
    pub const PAIR_INCOMING: Self = Self(1 << 2);
    pub const PAIR_OUTGOING: Self = Self(1 << 3);

    fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Events a [`Device`] emits as its lifecycle progresses, consumed by the
/// Device Manager for reaping and UI notification (§4.G).
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    StateChanged {
        device_id: String,
        flags: DeviceStateFlags,
    },
    PairingRequested {
        device_id: String,
        verification_key: Option<String>,
    },
}

/// Mutable state behind a single lock; every field here is described in
/// §4.F's "State variables".
struct DeviceState {
    channel: Option<Arc<dyn Channel>>,
    paired: bool,
    incoming_deadline: Option<Instant>,
    outgoing_deadline: Option<Instant>,
    incoming_caps: HashSet<String>,
    outgoing_caps: HashSet<String>,
    name: String,
    device_type: DeviceType,
    read_task: Option<tokio::task::JoinHandle<()>>,
}

impl DeviceState {
    fn flags(&self) -> DeviceStateFlags {
        let mut flags = DeviceStateFlags::NONE;
        if self.channel.is_some() {
            flags = flags.union(DeviceStateFlags::CONNECTED);
        }
        if self.paired {
            flags = flags.union(DeviceStateFlags::PAIRED);
        }
        if self.incoming_deadline.is_some() {
            flags = flags.union(DeviceStateFlags::PAIR_INCOMING);
        }
        if self.outgoing_deadline.is_some() {
            flags = flags.union(DeviceStateFlags::PAIR_OUTGOING);
        }
        flags
    }
}

/// A known peer. Long-lived: created once a `deviceId` is first seen and
/// kept (unpaired entries are reaped once disconnected, see
/// `device_manager::DeviceManager`).
pub struct Device {
    id: String,
    ctx: DeviceContext,
    registry: Arc<PluginRegistry>,
    plugins_initialized: AtomicBool,
    plugins: Mutex<Vec<Box<dyn Plugin>>>,
    state: RwLock<DeviceState>,
    event_tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl Device {
    /// Construct a fresh, unbound, unpaired Device. Callers should store the
    /// result behind an `Arc` immediately: `set_channel` spawns a read loop
    /// that holds a `Weak<Device>` back to it.
    pub fn new(
        id: impl Into<String>,
        ctx: DeviceContext,
        registry: Arc<PluginRegistry>,
        event_tx: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            ctx,
            registry,
            plugins_initialized: AtomicBool::new(false),
            plugins: Mutex::new(Vec::new()),
            state: RwLock::new(DeviceState {
                channel: None,
                paired: false,
                incoming_deadline: None,
                outgoing_deadline: None,
                incoming_caps: HashSet::new(),
                outgoing_caps: HashSet::new(),
                name: id_placeholder(),
                device_type: DeviceType::Desktop,
                read_task: None,
            }),
            event_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    pub async fn name(&self) -> String {
        self.state.read().await.name.clone()
    }

    pub async fn device_type(&self) -> DeviceType {
        self.state.read().await.device_type
    }

    pub async fn is_connected(&self) -> bool {
        self.state.read().await.channel.is_some()
    }

    pub async fn is_paired(&self) -> bool {
        self.state.read().await.paired
    }

    pub async fn flags(&self) -> DeviceStateFlags {
        self.state.read().await.flags()
    }

    pub async fn has_incoming_capability(&self, capability: &str) -> bool {
        self.state.read().await.incoming_caps.contains(capability)
    }

    pub async fn has_outgoing_capability(&self, capability: &str) -> bool {
        self.state.read().await.outgoing_caps.contains(capability)
    }

    async fn emit_state_changed(self: &Arc<Self>) {
        let flags = self.flags().await;
        let _ = self.event_tx.send(DeviceEvent::StateChanged {
            device_id: self.id.clone(),
            flags,
        });
        let plugins = self.plugins.lock().await;
        for plugin in plugins.iter() {
            if let Err(e) = plugin.update_state(flags, self).await {
                warn!("plugin {} failed to handle state change: {}", plugin.name(), e);
            }
        }
    }

    /// Attach (or detach, with `None`) a channel and start its read loop.
    /// Refuses to bind if the channel's peer identity doesn't match this
    /// Device's id (§4.F "Channel binding").
    pub async fn set_channel(self: &Arc<Self>, channel: Option<Arc<dyn Channel>>) -> Result<()> {
        if let Some(ref ch) = channel {
            let remote = RemoteIdentity::from_packet(ch.peer_identity())?;
            if remote.device_id != self.id {
                return Err(ProtocolError::InvalidField(format!(
                    "channel peer id {} does not match device id {}",
                    remote.device_id, self.id
                )));
            }
        }

        let previous = {
            let mut state = self.state.write().await;
            let previous_channel = state.channel.take();
            let previous_task = state.read_task.take();
            if let Some(task) = previous_task {
                task.abort();
            }

            if let Some(ref ch) = channel {
                let remote = RemoteIdentity::from_packet(ch.peer_identity())?;
                state.name = remote.device_name;
                state.device_type = remote.device_type;
                state.incoming_caps = remote.incoming_capabilities.into_iter().collect();
                state.outgoing_caps = remote.outgoing_capabilities.into_iter().collect();
            }
            state.channel = channel.clone();
            previous_channel
        };

        if let Some(previous_channel) = previous {
            let cancel = CancellationToken::new();
            let _ = previous_channel.close(&cancel).await;
        }

        if let Some(ch) = channel {
            let protocol = ch.protocol_name();
            self.ensure_plugins(protocol).await;
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(read_loop(weak, ch));
            self.state.write().await.read_task = Some(task);
        }

        self.emit_state_changed().await;
        Ok(())
    }

    /// Instantiate one plugin per factory whose `channel_protocol()` matches
    /// `protocol` the first time this Device is bound to a channel (§4.H).
    async fn ensure_plugins(self: &Arc<Self>, protocol: &str) {
        if self.plugins_initialized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rebuild_plugins(protocol).await;
    }

    /// Disable the current plugin set and instantiate a fresh one for
    /// `protocol`. Used both by `ensure_plugins`'s first bind and by
    /// `handle_identity`'s capability-change reload (§4.G).
    async fn rebuild_plugins(self: &Arc<Self>, protocol: &str) {
        let mut plugins = self.plugins.lock().await;
        for plugin in plugins.iter() {
            if let Err(e) = plugin.disable(self).await {
                warn!("plugin {} failed to disable for device {}: {}", plugin.name(), self.id, e);
            }
        }
        *plugins = self.registry.instantiate_for(protocol);
        for plugin in plugins.iter() {
            if let Err(e) = plugin.enable(self).await {
                warn!("plugin {} failed to enable for device {}: {}", plugin.name(), self.id, e);
            }
        }
    }

    /// Send a packet through the bound channel, waiting for the write to
    /// complete.
    pub async fn send_packet(&self, packet: Packet, cancel: &CancellationToken) -> Result<()> {
        let (channel, paired) = {
            let state = self.state.read().await;
            (state.channel.clone(), state.paired)
        };
        let channel = channel.ok_or(ProtocolError::NotConnected)?;
        if !paired && !is_pairing_packet(&packet) {
            return Err(ProtocolError::PermissionDenied);
        }
        channel.write_packet(packet, cancel).await
    }

    /// Fire-and-forget variant: logs and drops under the same conditions
    /// `send_packet` would error on.
    pub async fn queue_packet(&self, packet: Packet) {
        let cancel = CancellationToken::new();
        if let Err(e) = self.send_packet(packet, &cancel).await {
            debug!("dropped outgoing packet for device {}: {}", self.id, e);
        }
    }

    /// User activates "pair": send a request and start the outgoing
    /// deadline (§4.F item 1).
    pub async fn request_pairing(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.read().await;
            if state.paired {
                return Ok(());
            }
        }
        self.send_pair(true).await?;
        self.state.write().await.outgoing_deadline = Some(Instant::now() + PAIR_TIMEOUT);
        self.emit_state_changed().await;
        self.spawn_deadline_watchdog();
        Ok(())
    }

    /// User accepts an incoming pairing request (§4.F item 4).
    pub async fn accept_pairing(self: &Arc<Self>) -> Result<()> {
        self.send_pair(true).await?;
        self.complete_pairing().await
    }

    /// User rejects, or unpairs an already-paired device (§4.F item 5).
    pub async fn reject_pairing(self: &Arc<Self>) -> Result<()> {
        self.send_pair(false).await?;
        self.clear_pairing().await
    }

    async fn send_pair(&self, pair: bool) -> Result<()> {
        let cancel = CancellationToken::new();
        let packet = Packet::new("kdeconnect.pair", json!({ "pair": pair }));
        let channel = {
            let state = self.state.read().await;
            state.channel.clone()
        };
        let channel = channel.ok_or(ProtocolError::NotConnected)?;
        channel.write_packet(packet, &cancel).await
    }

    async fn complete_pairing(self: &Arc<Self>) -> Result<()> {
        let channel = {
            let mut state = self.state.write().await;
            state.paired = true;
            state.incoming_deadline = None;
            state.outgoing_deadline = None;
            state.channel.clone()
        };
        if let Some(channel) = channel {
            channel.store_trust(&self.ctx).await?;
        }
        self.emit_state_changed().await;
        Ok(())
    }

    async fn clear_pairing(self: &Arc<Self>) -> Result<()> {
        let was_paired = {
            let mut state = self.state.write().await;
            let was_paired = state.paired;
            state.paired = false;
            state.incoming_deadline = None;
            state.outgoing_deadline = None;
            was_paired
        };
        if was_paired {
            self.ctx.clear()?;
        }
        self.emit_state_changed().await;
        Ok(())
    }

    /// Watch the earlier of the two deadlines and clear pairing state if it
    /// lapses without resolution (§4.F item 3).
    fn spawn_deadline_watchdog(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PAIR_TIMEOUT + Duration::from_millis(50)).await;
            let expired = {
                let state = this.state.read().await;
                let now = Instant::now();
                state.outgoing_deadline.is_some_and(|d| now >= d)
                    || state.incoming_deadline.is_some_and(|d| now >= d)
            };
            if expired {
                debug!("pairing deadline expired for device {}", this.id);
                let _ = this.clear_pairing().await;
            }
        });
    }

    /// Dispatch one received packet (§4.F "Packet dispatch").
    async fn handle_packet(self: &Arc<Self>, packet: Packet) -> Result<()> {
        if packet.is_type(crate::packet::TYPE_IDENTITY) {
            return self.handle_identity(packet).await;
        }
        if packet.is_type("kdeconnect.pair") {
            return self.handle_pair(packet).await;
        }

        let paired = self.is_paired().await;
        if !paired {
            self.send_pair(false).await.ok();
            return Ok(());
        }

        let plugin_name = self.registry.plugin_for(&packet.packet_type);
        match plugin_name {
            Some(name) => {
                let plugins = self.plugins.lock().await;
                if let Some(plugin) = plugins.iter().find(|p| p.name() == name) {
                    plugin.handle_packet(&packet.packet_type, &packet, self).await
                } else {
                    debug!("no instantiated plugin named {} on device {}", name, self.id);
                    Ok(())
                }
            }
            None => {
                debug!("no plugin handles packet type {}", packet.packet_type);
                Ok(())
            }
        }
    }

    async fn handle_identity(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let remote = RemoteIdentity::from_packet(&packet)?;
        if remote.device_id != self.id {
            warn!(
                "identity packet device id {} does not match bound device {}",
                remote.device_id, self.id
            );
            return Ok(());
        }
        let new_incoming: HashSet<String> = remote.incoming_capabilities.into_iter().collect();
        let new_outgoing: HashSet<String> = remote.outgoing_capabilities.into_iter().collect();

        let (reload_protocol, changed) = {
            let mut state = self.state.write().await;
            let changed = self.plugins_initialized.load(Ordering::SeqCst)
                && (state.incoming_caps != new_incoming || state.outgoing_caps != new_outgoing);
            state.name = remote.device_name;
            state.device_type = remote.device_type;
            state.incoming_caps = new_incoming;
            state.outgoing_caps = new_outgoing;
            let protocol = state.channel.as_ref().map(|c| c.protocol_name());
            (protocol, changed)
        };

        if changed {
            if let Some(protocol) = reload_protocol {
                debug!("capabilities changed for device {}, reloading plugins", self.id);
                self.rebuild_plugins(protocol).await;
            }
        }
        Ok(())
    }

    async fn handle_pair(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let pair = packet.get_bool("pair");

        if !pair {
            self.clear_pairing().await?;
            return Ok(());
        }

        let has_outgoing = self.state.read().await.outgoing_deadline.is_some();
        if has_outgoing {
            self.complete_pairing().await?;
            return Ok(());
        }

        if self.is_paired().await {
            self.send_pair(true).await?;
            return Ok(());
        }

        let verification_key = {
            let state = self.state.read().await;
            state.channel.as_ref().and_then(|c| c.verification_key())
        };
        self.state.write().await.incoming_deadline = Some(Instant::now() + PAIR_TIMEOUT);
        let _ = self.event_tx.send(DeviceEvent::PairingRequested {
            device_id: self.id.clone(),
            verification_key,
        });
        self.emit_state_changed().await;
        self.spawn_deadline_watchdog();
        Ok(())
    }

    /// Remove this device's persisted data, unless it is the Device
    /// Manager's own identity directory (checked by the caller).
    pub fn clear_data(&self) -> Result<()> {
        self.ctx.clear()?;
        Ok(())
    }
}

fn is_pairing_packet(packet: &Packet) -> bool {
    packet.is_type("kdeconnect.pair") || packet.is_type(crate::packet::TYPE_IDENTITY)
}

fn id_placeholder() -> String {
    "Unknown".to_string()
}

/// One outstanding `read_packet` at a time; dispatch, then reissue
/// (§4.F "Channel binding"). Exits silently once the channel errs or the
/// Device is dropped.
async fn read_loop(device: Weak<Device>, channel: Arc<dyn Channel>) {
    let cancel = CancellationToken::new();
    loop {
        let Some(device) = device.upgrade() else { return };
        match channel.read_packet(&cancel).await {
            Ok(packet) => {
                if let Err(e) = device.handle_packet(packet).await {
                    warn!("error handling packet from device {}: {}", device.id, e);
                }
            }
            Err(e) => {
                debug!("channel for device {} closed: {}", device.id, e);
                let mut state = device.state.write().await;
                state.channel = None;
                state.read_task = None;
                drop(state);
                device.emit_state_changed().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginRegistry;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn test_device(root: &std::path::Path, id: &str) -> (Arc<Device>, mpsc::UnboundedReceiver<DeviceEvent>) {
        let ctx = DeviceContext::for_device(root, id);
        let registry = Arc::new(PluginRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Device::new(id, ctx, registry, tx)), rx)
    }

    struct StubChannel {
        peer_identity: Packet,
        written: tokio::sync::Mutex<Vec<Packet>>,
        to_read: tokio::sync::Mutex<Vec<Packet>>,
    }

    #[async_trait]
    impl Channel for StubChannel {
        async fn read_packet(&self, _cancel: &CancellationToken) -> Result<Packet> {
            let mut queue = self.to_read.lock().await;
            if queue.is_empty() {
                return Err(ProtocolError::ConnectionClosed);
            }
            Ok(queue.remove(0))
        }

        async fn write_packet(&self, packet: Packet, _cancel: &CancellationToken) -> Result<()> {
            self.written.lock().await.push(packet);
            Ok(())
        }

        async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn download(
            &self,
            _packet: &Packet,
            _cancel: &CancellationToken,
        ) -> Result<Box<dyn crate::channel::PayloadStream>> {
            Err(ProtocolError::NotConnected)
        }

        async fn upload(
            &self,
            _packet: &mut Packet,
            _cancel: &CancellationToken,
        ) -> Result<Box<dyn crate::channel::PayloadStream>> {
            Err(ProtocolError::NotConnected)
        }

        fn verification_key(&self) -> Option<String> {
            None
        }

        fn peer_identity(&self) -> &Packet {
            &self.peer_identity
        }

        fn protocol_name(&self) -> &'static str {
            "lan"
        }
    }

    fn identity_for(id: &str) -> Packet {
        Packet::new(
            crate::packet::TYPE_IDENTITY,
            json!({"deviceId": id, "deviceName": "Peer", "deviceType": "phone"}),
        )
    }

    #[tokio::test]
    async fn set_channel_refuses_mismatched_peer_id() {
        let root = TempDir::new().unwrap();
        let (device, _rx) = test_device(root.path(), "expected-id");
        let channel = Arc::new(StubChannel {
            peer_identity: identity_for("other-id"),
            written: tokio::sync::Mutex::new(Vec::new()),
            to_read: tokio::sync::Mutex::new(Vec::new()),
        });
        let result = device.set_channel(Some(channel)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn send_packet_without_channel_is_not_connected() {
        let root = TempDir::new().unwrap();
        let (device, _rx) = test_device(root.path(), "dev-1");
        let cancel = CancellationToken::new();
        let result = device
            .send_packet(Packet::new("kdeconnect.ping", json!({})), &cancel)
            .await;
        assert!(matches!(result, Err(ProtocolError::NotConnected)));
    }

    #[tokio::test]
    async fn unpaired_device_rejects_non_pairing_packets() {
        let root = TempDir::new().unwrap();
        let (device, _rx) = test_device(root.path(), "dev-2");
        let channel = Arc::new(StubChannel {
            peer_identity: identity_for("dev-2"),
            written: tokio::sync::Mutex::new(Vec::new()),
            to_read: tokio::sync::Mutex::new(Vec::new()),
        });
        device.set_channel(Some(channel)).await.unwrap();
        let cancel = CancellationToken::new();
        let result = device
            .send_packet(Packet::new("kdeconnect.ping", json!({})), &cancel)
            .await;
        assert!(matches!(result, Err(ProtocolError::PermissionDenied)));
    }

    #[tokio::test]
    async fn full_pairing_handshake_sets_paired_flag() {
        let root = TempDir::new().unwrap();
        let (device, _rx) = test_device(root.path(), "dev-3");
        let channel = Arc::new(StubChannel {
            peer_identity: identity_for("dev-3"),
            written: tokio::sync::Mutex::new(Vec::new()),
            to_read: tokio::sync::Mutex::new(Vec::new()),
        });
        device.set_channel(Some(channel)).await.unwrap();

        device.request_pairing().await.unwrap();
        assert!(device.flags().await.contains(DeviceStateFlags::PAIR_OUTGOING));

        let accept = Packet::new("kdeconnect.pair", json!({"pair": true}));
        device.handle_packet(accept).await.unwrap();
        assert!(device.is_paired().await);
        assert!(!device.flags().await.contains(DeviceStateFlags::PAIR_OUTGOING));
    }

    #[tokio::test]
    async fn unpair_clears_paired_flag_and_persisted_trust() {
        let root = TempDir::new().unwrap();
        let (device, _rx) = test_device(root.path(), "dev-4");
        let channel = Arc::new(StubChannel {
            peer_identity: identity_for("dev-4"),
            written: tokio::sync::Mutex::new(Vec::new()),
            to_read: tokio::sync::Mutex::new(Vec::new()),
        });
        device.set_channel(Some(channel)).await.unwrap();
        device.complete_pairing().await.unwrap();
        assert!(device.is_paired().await);

        device.reject_pairing().await.unwrap();
        assert!(!device.is_paired().await);
    }

    #[tokio::test]
    async fn incoming_pair_request_sets_incoming_deadline_not_paired() {
        let root = TempDir::new().unwrap();
        let (device, mut rx) = test_device(root.path(), "dev-5");
        let channel = Arc::new(StubChannel {
            peer_identity: identity_for("dev-5"),
            written: tokio::sync::Mutex::new(Vec::new()),
            to_read: tokio::sync::Mutex::new(Vec::new()),
        });
        device.set_channel(Some(channel)).await.unwrap();

        let request = Packet::new("kdeconnect.pair", json!({"pair": true}));
        device.handle_packet(request).await.unwrap();
        assert!(!device.is_paired().await);
        assert!(device.flags().await.contains(DeviceStateFlags::PAIR_INCOMING));

        let mut saw_request = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DeviceEvent::PairingRequested { .. }) {
                saw_request = true;
            }
        }
        assert!(saw_request);
    }
}
