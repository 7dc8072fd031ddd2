//! LAN Channel: a TLS-wrapped TCP socket carrying JSON packets (§4.D).
//!
//! Grounded on `transport/tls.rs`'s `TlsConnection` (newline-framed
//! `send_packet`/`receive_packet` over `tokio_openssl::SslStream`), adapted
//! to the `Channel` trait's read/write-half split and async-cancellable
//! operations.

use super::{Channel, PayloadStream};
use crate::cert::CertificateInfo;
use crate::context::DeviceContext;
use crate::error::{ProtocolError, Result};
use crate::packet::Packet;
use crate::tls_util;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_openssl::SslStream;
use tokio_util::sync::CancellationToken;

pub struct LanChannel {
    read_half: Mutex<ReadHalf<SslStream<TcpStream>>>,
    write_half: Mutex<WriteHalf<SslStream<TcpStream>>>,
    remote_addr: SocketAddr,
    our_cert: CertificateInfo,
    peer_cert_der: Vec<u8>,
    peer_identity: Packet,
    closed: AtomicBool,
}

impl LanChannel {
    /// Wrap an already-authenticated TLS stream. Constructed by
    /// `service::lan` once the identity exchange and TLS upgrade have
    /// completed, in either connection direction.
    pub fn new(
        stream: SslStream<TcpStream>,
        remote_addr: SocketAddr,
        our_cert: CertificateInfo,
        peer_cert_der: Vec<u8>,
        peer_identity: Packet,
    ) -> Self {
        let (read_half, write_half) = split(stream);
        Self {
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            remote_addr,
            our_cert,
            peer_cert_der,
            peer_identity,
            closed: AtomicBool::new(false),
        }
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
impl Channel for LanChannel {
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Packet> {
        with_cancel(cancel, async {
            let mut guard = self.read_half.lock().await;
            Packet::read_from_stream(&mut *guard).await
        })
        .await
    }

    async fn write_packet(&self, mut packet: Packet, cancel: &CancellationToken) -> Result<()> {
        with_cancel(cancel, async {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::ConnectionClosed);
            }
            let mut guard = self.write_half.lock().await;
            packet.write_to_stream(&mut *guard).await
        })
        .await
    }

    async fn close(&self, _cancel: &CancellationToken) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut guard = self.write_half.lock().await;
        let _ = guard.shutdown().await;
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
            let port = info
                .get("port")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| ProtocolError::MissingField("payloadTransferInfo.port".into()))?
                as u16;

            let addr = SocketAddr::new(self.remote_addr.ip(), port);
            let tcp = TcpStream::connect(addr).await?;
            let connector = tls_util::build_connector(&self.our_cert)?;
            let tls = tls_util::connect_tls(&connector, tcp).await?;
            Ok(Box::new(tls) as Box<dyn PayloadStream>)
        })
        .await
    }

    async fn upload(
        &self,
        packet: &mut Packet,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PayloadStream>> {
        with_cancel(cancel, async {
            let bind_addr = SocketAddr::new(local_unspecified_ip(self.remote_addr), 0);
            let listener = TcpListener::bind(bind_addr).await?;
            let port = listener.local_addr()?.port();

            let mut info = serde_json::Map::new();
            info.insert("port".into(), serde_json::Value::from(port));
            packet.payload_transfer_info = Some(info);

            self.write_packet(packet.clone(), cancel).await?;

            let (tcp, _peer) = listener.accept().await?;
            let acceptor = tls_util::build_acceptor(&self.our_cert)?;
            let tls = tls_util::accept_tls(&acceptor, tcp).await?;
            Ok(Box::new(tls) as Box<dyn PayloadStream>)
        })
        .await
    }

    fn verification_key(&self) -> Option<String> {
        let mut hasher = Sha256::new();
        hasher.update(&self.our_cert.certificate_der);
        hasher.update(&self.peer_cert_der);
        let digest = hasher.finalize();
        Some(
            digest
                .iter()
                .take(3)
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(""),
        )
    }

    fn peer_identity(&self) -> &Packet {
        &self.peer_identity
    }

    fn protocol_name(&self) -> &'static str {
        "lan"
    }

    async fn store_trust(&self, ctx: &DeviceContext) -> Result<()> {
        super::write_identity_json(ctx, &self.peer_identity)
    }
}

/// Pick an unspecified bind address matching the remote peer's IP family,
/// so `upload`'s listener is reachable on the same network the peer is on.
fn local_unspecified_ip(remote: SocketAddr) -> std::net::IpAddr {
    if remote.is_ipv6() {
        std::net::IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    } else {
        std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    }
}
