//! Bluetooth Channel Service: registers an RFCOMM SDP profile with BlueZ and
//! multiplexes each accepted connection (§4.E, §6).
//!
//! Grounded on `transport/bluetooth.rs`'s `BluetoothProfileService`
//! (`bluer::rfcomm::Profile` registration, `ProfileHandle::next()` accept
//! loop), generalized to wrap every accepted `Stream` in a
//! [`crate::mux::Multiplexer`] and perform an identity exchange over its
//! primary substream before handing a [`crate::channel::bluetooth::BluetoothChannel`]
//! off to the caller. Unlike LAN there is no TLS handshake here: RFCOMM link
//! encryption is enforced by BlueZ's `RequireAuthentication`, and the peer's
//! certificate travels as a PEM string inside the identity packet body.

use super::{ChannelService, ServiceEvent};
use crate::channel::bluetooth::BluetoothChannel;
use crate::channel::Channel;
use crate::error::{ProtocolError, Result};
use crate::identity::{DeviceInfo, RemoteIdentity};
use crate::mux::{Multiplexer, DEFAULT_BUFFER_SIZE};
use crate::packet::Packet;
use async_trait::async_trait;
use bluer::rfcomm::{Profile, Stream};
use bluer::{Address, Session};
use futures::StreamExt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// SDP service UUID Android/desktop peers look up to find this host (§6).
pub const SERVICE_UUID: Uuid = uuid::uuid!("185f3df4-3268-4e3f-9fca-d4d5059915bd");
const RFCOMM_CHANNEL: u16 = 6;

pub struct BluetoothService {
    device_info: DeviceInfo,
    event_tx: tokio::sync::mpsc::UnboundedSender<ServiceEvent>,
}

impl BluetoothService {
    pub fn new(device_info: DeviceInfo, event_tx: tokio::sync::mpsc::UnboundedSender<ServiceEvent>) -> Self {
        Self { device_info, event_tx }
    }
}

#[async_trait]
impl ChannelService for BluetoothService {
    fn name(&self) -> &'static str {
        "bluetooth"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let session = Session::new()
            .await
            .map_err(|e| ProtocolError::Bluetooth(e.to_string()))?;

        let profile = Profile {
            uuid: SERVICE_UUID,
            name: Some("KDE Connect".to_string()),
            channel: Some(RFCOMM_CHANNEL),
            require_authentication: Some(true),
            require_authorization: Some(false),
            auto_connect: Some(false),
            ..Default::default()
        };

        let mut handle = session
            .register_profile(profile)
            .await
            .map_err(|e| ProtocolError::Bluetooth(e.to_string()))?;
        info!(uuid = %SERVICE_UUID, channel = RFCOMM_CHANNEL, "Bluetooth RFCOMM profile registered");

        let device_info = self.device_info.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                let req = tokio::select! {
                    _ = cancel.cancelled() => return,
                    req = handle.next() => req,
                };
                let Some(req) = req else {
                    debug!("Bluetooth profile handle closed");
                    return;
                };
                let device_addr = req.device();
                let stream = match req.accept() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to accept RFCOMM connection from {}: {}", device_addr, e);
                        continue;
                    }
                };
                let info = device_info.clone();
                let events = event_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, info, events.clone()).await {
                        let _ = events.send(ServiceEvent::Error {
                            service: "bluetooth",
                            message: format!("RFCOMM handshake with {device_addr} failed: {e}"),
                        });
                    }
                });
            }
        });

        Ok(())
    }

    async fn stop(&self) {
        // The accept loop holds the `ProfileHandle` and deregisters the
        // profile when `cancel` fires and it returns; nothing to do here.
    }

    async fn identify(&self, target: Option<&str>) -> Result<()> {
        let Some(addr_str) = target else {
            debug!("Bluetooth identify() with no target is a no-op (no passive scan implemented)");
            return Ok(());
        };
        let addr = Address::from_str(addr_str)
            .map_err(|e| ProtocolError::InvalidField(format!("bad Bluetooth address: {e}")))?;
        let socket_addr = bluer::rfcomm::SocketAddr::new(addr, RFCOMM_CHANNEL as u8);
        let stream = Stream::connect(socket_addr)
            .await
            .map_err(|e| ProtocolError::Bluetooth(e.to_string()))?;

        handle_connection(stream, self.device_info.clone(), self.event_tx.clone()).await
    }
}

/// Wrap a fresh RFCOMM stream in a multiplexer and exchange identities over
/// its primary substream, symmetrically regardless of which side dialled.
async fn handle_connection(
    stream: Stream,
    our_identity: DeviceInfo,
    event_tx: tokio::sync::mpsc::UnboundedSender<ServiceEvent>,
) -> Result<()> {
    let (mux, primary) = Multiplexer::connect(stream, DEFAULT_BUFFER_SIZE).await?;

    let mut outgoing = our_identity.to_identity_packet();
    let bytes = outgoing.serialise();
    primary.write(&bytes).await?;

    let peer_identity = read_identity_packet(&primary).await?;
    let remote = RemoteIdentity::from_packet(&peer_identity)?;
    let peer_certificate_der = remote
        .certificate_pem
        .as_deref()
        .and_then(|pem| openssl::x509::X509::from_pem(pem.as_bytes()).ok())
        .and_then(|cert| cert.to_der().ok());

    let channel = BluetoothChannel::new(mux, primary, peer_identity, peer_certificate_der);
    let _ = event_tx.send(ServiceEvent::ChannelReady {
        service: "bluetooth",
        channel: Arc::new(channel) as Arc<dyn Channel>,
    });
    Ok(())
}

async fn read_identity_packet(channel: &crate::mux::MuxChannel<Stream>) -> Result<Packet> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut byte = [0u8; 1];
    loop {
        let n = channel.read(&mut byte).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if byte[0] == b'\n' {
            return Packet::parse(&buf);
        }
        buf.push(byte[0]);
    }
}
