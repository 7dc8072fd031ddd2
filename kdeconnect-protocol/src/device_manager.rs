//! Device Manager: owns the local identity, runs the enabled Channel
//! Services, and materialises/reaps [`Device`]s as channels come and go
//! (§4.G).
//!
//! Grounded on `connection/manager.rs`'s top-level `ConnectionManager`
//! (one shared `CancellationToken`, a background task consuming service
//! events, `identify()` fan-out) generalized from a single TCP/TLS listener
//! to an arbitrary set of [`ChannelService`]s.

use crate::cert::CertificateInfo;
use crate::channel::Channel;
use crate::context::DeviceContext;
use crate::device::{Device, DeviceEvent, DeviceStateFlags};
use crate::error::{ProtocolError, Result};
use crate::identity::{DeviceType, RemoteIdentity};
use crate::plugins::PluginRegistry;
use crate::service::lan::{LanPorts, LanService};
#[cfg(feature = "bluetooth")]
use crate::service::bluetooth::BluetoothService;
use crate::service::{build_identity, ChannelService, ServiceEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct DeviceManager {
    config_dir: PathBuf,
    cert: CertificateInfo,
    device_name: String,
    device_type: DeviceType,
    lan_ports: LanPorts,
    registry: Arc<PluginRegistry>,
    devices: Arc<RwLock<HashMap<String, Arc<Device>>>>,
    services: RwLock<Vec<Arc<dyn ChannelService>>>,
    device_event_tx: mpsc::UnboundedSender<DeviceEvent>,
    device_event_rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
    cancel: CancellationToken,
}

impl DeviceManager {
    /// Load or create the local certificate in `config_dir`, then restore
    /// any previously-paired Devices found as subdirectories containing an
    /// `identity.json` (§4.G "init").
    pub async fn init(
        config_dir: impl Into<PathBuf>,
        device_name: impl Into<String>,
        device_type: DeviceType,
        lan_ports: LanPorts,
        registry: Arc<PluginRegistry>,
    ) -> Result<Self> {
        let config_dir = config_dir.into();
        tokio::fs::create_dir_all(&config_dir).await?;
        let cert = CertificateInfo::load_or_create(&config_dir)?;

        let (device_event_tx, device_event_rx) = mpsc::unbounded_channel();
        let devices = HashMap::new();
        let devices = RwLock::new(devices);

        let mut entries = tokio::fs::read_dir(&config_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(device_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !tokio::fs::try_exists(path.join("identity.json")).await.unwrap_or(false) {
                continue;
            }
            let ctx = DeviceContext::for_device(&config_dir, device_id);
            let device = Arc::new(Device::new(device_id, ctx, registry.clone(), device_event_tx.clone()));
            debug!("restored device {} from {}", device_id, config_dir.display());
            devices.write().await.insert(device_id.to_string(), device);
        }

        Ok(Self {
            config_dir,
            cert,
            device_name: device_name.into(),
            device_type,
            lan_ports,
            registry,
            devices: Arc::new(devices),
            services: RwLock::new(Vec::new()),
            device_event_tx,
            device_event_rx: Mutex::new(Some(device_event_rx)),
            cancel: CancellationToken::new(),
        })
    }

    /// Local DeviceId, the certificate's Common Name.
    pub fn device_id(&self) -> &str {
        &self.cert.device_id
    }

    pub async fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(id).cloned()
    }

    /// Build the global identity, start every Channel Service, and spawn the
    /// background tasks that dispatch channels to Devices and reap
    /// disconnected-and-unpaired ones (§4.G "start").
    pub async fn start(&self) -> Result<()> {
        let incoming = self.registry.all_incoming_capabilities();
        let outgoing = self.registry.all_outgoing_capabilities();
        let identity = build_identity(
            self.device_id(),
            &self.device_name,
            self.device_type,
            0,
            incoming,
            outgoing,
            None,
        );

        let (service_tx, mut service_rx) = mpsc::unbounded_channel();
        let mut services: Vec<Arc<dyn ChannelService>> = Vec::new();

        let lan = Arc::new(LanService::new(
            self.cert.clone(),
            identity.clone(),
            service_tx.clone(),
            self.lan_ports,
        ));
        lan.start(self.cancel.clone()).await?;
        services.push(lan);

        #[cfg(feature = "bluetooth")]
        {
            let mut bt_identity = identity.clone();
            bt_identity.certificate_pem = self.cert.certificate_pem().ok();
            let bt = Arc::new(BluetoothService::new(bt_identity, service_tx.clone()));
            bt.start(self.cancel.clone()).await?;
            services.push(bt);
        }

        *self.services.write().await = services;

        let devices = self.devices.clone();
        let registry = self.registry.clone();
        let config_dir = self.config_dir.clone();
        let device_event_tx = self.device_event_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = service_rx.recv() => event,
                };
                let Some(event) = event else { return };
                match event {
                    ServiceEvent::ChannelReady { service, channel } => {
                        if let Err(e) =
                            dispatch_channel(&devices, &registry, &config_dir, &device_event_tx, service, channel).await
                        {
                            warn!("failed to bind channel from {} service: {}", service, e);
                        }
                    }
                    ServiceEvent::Error { service, message } => {
                        warn!("{} service error: {}", service, message);
                    }
                }
            }
        });

        let reaper_devices = self.devices.clone();
        let mut device_event_rx = self
            .device_event_rx
            .lock()
            .await
            .take()
            .expect("DeviceManager::start called more than once");
        let reaper_cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = reaper_cancel.cancelled() => return,
                    event = device_event_rx.recv() => event,
                };
                let Some(event) = event else { return };
                if let DeviceEvent::StateChanged { device_id, flags } = event {
                    let reapable =
                        !flags.contains(DeviceStateFlags::CONNECTED) && !flags.contains(DeviceStateFlags::PAIRED);
                    if reapable {
                        // Drop on the next loop iteration, never inline with the
                        // event that triggered it, to avoid tearing down a
                        // Device while still inside its own event handler.
                        reaper_devices.write().await.remove(&device_id);
                    }
                }
            }
        });

        Ok(())
    }

    /// Cancel every background task and stop accepting new connections.
    /// Channels already handed off are unaffected.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let services = self.services.read().await;
        for service in services.iter() {
            service.stop().await;
        }
    }

    /// `uri = None` probes every loaded service; `Some("<scheme>://<addr>")`
    /// routes only to the service named `<scheme>` (§4.G "identify").
    pub async fn identify(&self, target: Option<&str>) -> Result<()> {
        let services = self.services.read().await;
        match target {
            None => {
                for service in services.iter() {
                    service.identify(None).await?;
                }
                Ok(())
            }
            Some(uri) => {
                let (scheme, addr) = uri
                    .split_once("://")
                    .ok_or_else(|| ProtocolError::InvalidField(format!("bad identify uri: {uri}")))?;
                let service = services
                    .iter()
                    .find(|s| s.name() == scheme)
                    .ok_or_else(|| ProtocolError::InvalidField(format!("no such channel service: {scheme}")))?;
                service.identify(Some(addr)).await
            }
        }
    }
}

/// Channel dispatch (§4.G "on_channel"): resolve the channel's peer to a
/// Device (creating one if this is a first contact), then bind it.
async fn dispatch_channel(
    devices: &Arc<RwLock<HashMap<String, Arc<Device>>>>,
    registry: &Arc<PluginRegistry>,
    config_dir: &Path,
    device_event_tx: &mpsc::UnboundedSender<DeviceEvent>,
    service: &'static str,
    channel: Arc<dyn Channel>,
) -> Result<()> {
    let remote = RemoteIdentity::from_packet(channel.peer_identity())?;
    if remote.device_id.is_empty() {
        return Err(ProtocolError::MissingField("deviceId".into()));
    }

    let device = {
        let mut map = devices.write().await;
        map.entry(remote.device_id.clone())
            .or_insert_with(|| {
                let ctx = DeviceContext::for_device(config_dir, &remote.device_id);
                Arc::new(Device::new(
                    remote.device_id.clone(),
                    ctx,
                    registry.clone(),
                    device_event_tx.clone(),
                ))
            })
            .clone()
    };
    debug!("binding channel from {} service to device {}", service, device.id());
    device.set_channel(Some(channel)).await
}
