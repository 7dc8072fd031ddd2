//! Bluetooth Channel: a Channel whose base stream is the primary substream
//! of a [`crate::mux::Multiplexer`] (§4.D).
//!
//! Authentication here is by certificate pinning rather than TLS: the peer
//! identity packet carries a PEM certificate (RFCOMM link encryption is
//! enforced by BlueZ's profile `RequireAuthentication=true`, not by an
//! application-level TLS session).

use super::{Channel, PayloadStream};
use crate::context::DeviceContext;
use crate::error::{ProtocolError, Result};
use crate::mux::{MuxChannel, Multiplexer};
use crate::packet::Packet;
use async_trait::async_trait;
use bluer::rfcomm::Stream as RfcommStream;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct BluetoothChannel {
    mux: Arc<Multiplexer<RfcommStream>>,
    primary: MuxChannel<RfcommStream>,
    peer_identity: Packet,
    peer_certificate_der: Option<Vec<u8>>,
    read_lock: Mutex<()>,
}

impl BluetoothChannel {
    pub fn new(
        mux: Arc<Multiplexer<RfcommStream>>,
        primary: MuxChannel<RfcommStream>,
        peer_identity: Packet,
        peer_certificate_der: Option<Vec<u8>>,
    ) -> Self {
        Self {
            mux,
            primary,
            peer_identity,
            peer_certificate_der,
            read_lock: Mutex::new(()),
        }
    }
}

async fn read_one_packet(channel: &MuxChannel<RfcommStream>) -> Result<Packet> {
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
        if buf.len() == buf.capacity() {
            buf.reserve(buf.capacity());
        }
        buf.push(byte[0]);
    }
}

async fn with_cancel<F, T>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
        result = fut => result,
    }
}

#[async_trait]
impl Channel for BluetoothChannel {
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Packet> {
        with_cancel(cancel, async {
            let _guard = self.read_lock.lock().await;
            read_one_packet(&self.primary).await
        })
        .await
    }

    async fn write_packet(&self, mut packet: Packet, cancel: &CancellationToken) -> Result<()> {
        with_cancel(cancel, async {
            let bytes = packet.serialise();
            self.primary.write(&bytes).await
        })
        .await
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        self.primary.close().await?;
        self.mux.close().await;
        Ok(())
    }

    async fn download(
        &self,
        packet: &Packet,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PayloadStream>> {
        with_cancel(cancel, async {
            let info = packet
                .payload_transfer_info
                .as_ref()
                .ok_or_else(|| ProtocolError::MissingField("payloadTransferInfo".into()))?;
            let uuid_str = info
                .get("uuid")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ProtocolError::MissingField("payloadTransferInfo.uuid".into()))?;
            let uuid = Uuid::parse_str(uuid_str)
                .map_err(|e| ProtocolError::InvalidField(format!("payloadTransferInfo.uuid: {e}")))?;

            let channel = self.mux.accept_channel(uuid).await?;
            Ok(Box::new(channel) as Box<dyn PayloadStream>)
        })
        .await
    }

    async fn upload(
        &self,
        packet: &mut Packet,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PayloadStream>> {
        with_cancel(cancel, async {
            let uuid = Uuid::new_v4();
            let channel = self.mux.open_channel(uuid).await?;

            let mut info = serde_json::Map::new();
            info.insert("uuid".into(), serde_json::Value::from(uuid.to_string()));
            packet.payload_transfer_info = Some(info);

            self.write_packet(packet.clone(), cancel).await?;

            Ok(Box::new(channel) as Box<dyn PayloadStream>)
        })
        .await
    }

    fn verification_key(&self) -> Option<String> {
        None
    }

    fn peer_identity(&self) -> &Packet {
        &self.peer_identity
    }

    fn protocol_name(&self) -> &'static str {
        "bluetooth"
    }

    async fn store_trust(&self, ctx: &DeviceContext) -> Result<()> {
        super::write_identity_json(ctx, &self.peer_identity)?;
        if let Some(der) = &self.peer_certificate_der {
            ctx.ensure_dirs()?;
            super::atomic_write_0600(&ctx.config_dir.join("peer_certificate.der"), der)?;
        }
        Ok(())
    }
}

#[async_trait]
impl PayloadStream for MuxChannel<RfcommStream> {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        MuxChannel::read(self, buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        MuxChannel::write(self, buf).await
    }

    async fn shutdown(&mut self) -> Result<()> {
        MuxChannel::close(self).await
    }
}
