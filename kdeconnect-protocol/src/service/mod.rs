//! Channel Service: discovers peers and produces authenticated [`Channel`]s
//! on a given transport (§4.E).

pub mod lan;
#[cfg(feature = "bluetooth")]
pub mod bluetooth;

use crate::channel::Channel;
use crate::error::Result;
use crate::identity::DeviceInfo;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Emitted by a running service as channels complete their identity exchange
/// (and, on LAN, their TLS upgrade), or as it logs a non-fatal local failure.
#[derive(Debug)]
pub enum ServiceEvent {
    ChannelReady {
        service: &'static str,
        channel: Arc<dyn Channel>,
    },
    Error {
        service: &'static str,
        message: String,
    },
}

/// Common contract implemented by the LAN and Bluetooth Channel Services.
#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Stable name used to tag `ServiceEvent`s and log lines (`"lan"`, `"bluetooth"`).
    fn name(&self) -> &'static str;

    /// Begin listening/broadcasting. Runs until `cancel` fires; background
    /// tasks it spawns must also respect `cancel`.
    async fn start(&self, cancel: CancellationToken) -> Result<()>;

    /// Stop accepting new connections. Channels already handed off via
    /// `ServiceEvent::ChannelReady` are unaffected.
    async fn stop(&self);

    /// Actively probe for one target (a `lan://host:port` URI, or `None` to
    /// broadcast/scan generically), rather than waiting for it to announce
    /// itself.
    async fn identify(&self, target: Option<&str>) -> Result<()>;
}

/// Merge this host's static metadata with every installed plugin's
/// capability lists into the identity this service will present (§4.E).
pub fn build_identity(
    device_id: &str,
    device_name: &str,
    device_type: crate::identity::DeviceType,
    tcp_port: u16,
    incoming_capabilities: Vec<String>,
    outgoing_capabilities: Vec<String>,
    certificate_pem: Option<String>,
) -> DeviceInfo {
    DeviceInfo {
        device_id: device_id.to_string(),
        device_name: device_name.to_string(),
        device_type,
        incoming_capabilities,
        outgoing_capabilities,
        tcp_port,
        certificate_pem,
    }
}
