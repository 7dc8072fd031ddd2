//! LAN Channel Service: UDP broadcast discovery on port 1716 plus a TCP
//! listener on the same port, producing [`LanChannel`]s (§4.E, §6).
//!
//! Identity exchange happens in cleartext before the TLS upgrade, and the
//! TLS roles are inverted from the usual client/server convention: whichever
//! side performed the TCP `connect()` sends its identity in cleartext and
//! then becomes the TLS *server*; whichever side `accept()`ed the TCP
//! connection reads that cleartext identity and becomes the TLS *client*.
//! Grounded on `transport/tls.rs`'s `TlsServer::accept()`, simplified to a
//! single identity exchange (protocol v7) rather than that file's v8 double
//! pre/post-TLS re-exchange.

use super::{ChannelService, ServiceEvent};
use crate::cert::CertificateInfo;
use crate::channel::lan::LanChannel;
use crate::channel::Channel;
use crate::error::{ProtocolError, Result};
use crate::identity::{DeviceInfo, RemoteIdentity};
use crate::packet::Packet;
use crate::tls_util;
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Primary discovery/listen port (§6), and the default fallback range for
/// the TCP listener when it's already in use. Overridable via [`LanPorts`],
/// normally sourced from the daemon's `NetworkConfig` (§3.1).
pub const DISCOVERY_PORT: u16 = 1716;
const PORT_RANGE_START: u16 = 1714;
const PORT_RANGE_END: u16 = 1764;
const BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 255);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

/// Port configuration for a [`LanService`]. `discovery_port` is used both
/// for the UDP broadcaster/listener (no fallback; must be free) and as the
/// TCP listener's first choice; `port_range` is the TCP fallback searched if
/// `discovery_port` is already bound.
#[derive(Debug, Clone, Copy)]
pub struct LanPorts {
    pub discovery_port: u16,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for LanPorts {
    fn default() -> Self {
        Self {
            discovery_port: DISCOVERY_PORT,
            port_range_start: PORT_RANGE_START,
            port_range_end: PORT_RANGE_END,
        }
    }
}

pub struct LanService {
    our_cert: CertificateInfo,
    device_info: DeviceInfo,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
    ports: LanPorts,
    bound_port: AtomicU16,
}

impl LanService {
    pub fn new(
        our_cert: CertificateInfo,
        device_info: DeviceInfo,
        event_tx: mpsc::UnboundedSender<ServiceEvent>,
        ports: LanPorts,
    ) -> Self {
        Self {
            our_cert,
            device_info,
            event_tx,
            ports,
            bound_port: AtomicU16::new(0),
        }
    }

    fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::SeqCst)
    }

    async fn bind_tcp(&self) -> Result<TcpListener> {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", self.ports.discovery_port)).await {
            return Ok(listener);
        }
        for port in self.ports.port_range_start..=self.ports.port_range_end {
            if port == self.ports.discovery_port {
                continue;
            }
            if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                return Ok(listener);
            }
        }
        Err(ProtocolError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "no free TCP port in {}-{}",
                self.ports.port_range_start, self.ports.port_range_end
            ),
        )))
    }

    async fn bind_udp(&self) -> Result<UdpSocket> {
        let socket = UdpSocket::bind(("0.0.0.0", self.ports.discovery_port)).await?;
        socket.set_broadcast(true)?;
        Ok(socket)
    }
}

#[async_trait]
impl ChannelService for LanService {
    fn name(&self) -> &'static str {
        "lan"
    }

    async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let tcp_listener = self.bind_tcp().await?;
        let udp_socket = Arc::new(self.bind_udp().await?);
        let local_port = tcp_listener.local_addr()?.port();
        self.bound_port.store(local_port, Ordering::SeqCst);
        info!(port = local_port, "LAN channel service listening");

        let mut device_info = self.device_info.clone();
        device_info.tcp_port = local_port;
        let device_info = Arc::new(device_info);
        let discovery_port = self.ports.discovery_port;

        let tcp_cancel = cancel.clone();
        let tcp_cert = self.our_cert.clone();
        let tcp_events = self.event_tx.clone();
        tokio::spawn(async move {
            accept_loop(tcp_listener, tcp_cert, tcp_events, tcp_cancel).await;
        });

        let udp_cancel = cancel.clone();
        let udp_cert = self.our_cert.clone();
        let udp_events = self.event_tx.clone();
        let udp_socket_send = udp_socket.clone();
        let announce_info = device_info.clone();
        tokio::spawn(async move {
            announce_loop(udp_socket_send, announce_info, discovery_port, udp_cancel).await;
        });

        let listen_cert = self.our_cert.clone();
        let listen_events = self.event_tx.clone();
        let listen_info = device_info.clone();
        tokio::spawn(async move {
            udp_listen_loop(
                udp_socket,
                listen_info,
                listen_cert,
                discovery_port,
                listen_events,
                cancel,
            )
            .await;
        });

        Ok(())
    }

    async fn stop(&self) {
        // Spawned tasks are cancelled via the `CancellationToken` passed to
        // `start`; nothing additional to tear down here.
    }

    async fn identify(&self, target: Option<&str>) -> Result<()> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.set_broadcast(true)?;
        let mut info = self.device_info.clone();
        info.tcp_port = self.bound_port();
        let packet = info.to_identity_packet();
        let bytes = packet.to_value().to_string();

        let dest = match target {
            Some(addr) => addr
                .parse::<SocketAddr>()
                .map_err(|e| ProtocolError::InvalidField(format!("bad identify target: {e}")))?,
            None => SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), self.ports.discovery_port),
        };
        socket.send_to(bytes.as_bytes(), dest).await?;
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    our_cert: CertificateInfo,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let cert = our_cert.clone();
                        let events = event_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_inbound(stream, remote_addr, cert, events.clone()).await {
                                let _ = events.send(ServiceEvent::Error {
                                    service: "lan",
                                    message: format!("inbound handshake with {remote_addr} failed: {e}"),
                                });
                            }
                        });
                    }
                    Err(e) => warn!("LAN accept failed: {}", e),
                }
            }
        }
    }
}

/// Peer TCP-connected to us: read their cleartext identity, then perform
/// the TLS handshake as the *client* (inverted role).
async fn handle_inbound(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    our_cert: CertificateInfo,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
) -> Result<()> {
    let peer_identity = Packet::read_from_stream(&mut stream).await?;
    let remote = RemoteIdentity::from_packet(&peer_identity)?;
    debug!(device = %remote.device_id, %remote_addr, "received cleartext identity, upgrading to TLS (client role)");

    let connector = tls_util::build_connector(&our_cert)?;
    let tls = tls_util::connect_tls(&connector, stream).await?;
    let peer_der = tls_util::peer_certificate_der(&tls)?;

    let channel = LanChannel::new(tls, remote_addr, our_cert, peer_der, peer_identity);
    let _ = event_tx.send(ServiceEvent::ChannelReady {
        service: "lan",
        channel: Arc::new(channel),
    });
    Ok(())
}

/// We TCP-connected out to a peer discovered via UDP broadcast: send our
/// cleartext identity, then perform the TLS handshake as the *server*
/// (inverted role).
async fn connect_outbound(
    remote_addr: SocketAddr,
    our_cert: CertificateInfo,
    our_identity: Arc<DeviceInfo>,
    peer_identity: Packet,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
) -> Result<()> {
    let mut stream = TcpStream::connect(remote_addr).await?;
    let mut outgoing = our_identity.to_identity_packet();
    outgoing.write_to_stream(&mut stream).await?;

    let acceptor = tls_util::build_acceptor(&our_cert)?;
    let tls = tls_util::accept_tls(&acceptor, stream).await?;
    let peer_der = tls_util::peer_certificate_der(&tls)?;

    let channel = LanChannel::new(tls, remote_addr, our_cert, peer_der, peer_identity);
    let _ = event_tx.send(ServiceEvent::ChannelReady {
        service: "lan",
        channel: Arc::new(channel),
    });
    Ok(())
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    device_info: Arc<DeviceInfo>,
    discovery_port: u16,
    cancel: CancellationToken,
) {
    let mut ticker = interval(ANNOUNCE_INTERVAL);
    let dest = SocketAddr::new(IpAddr::V4(BROADCAST_ADDR), discovery_port);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let packet = device_info.to_identity_packet();
                let bytes = packet.to_value().to_string();
                if let Err(e) = socket.send_to(bytes.as_bytes(), dest).await {
                    warn!("LAN announce failed: {}", e);
                }
            }
        }
    }
}

async fn udp_listen_loop(
    socket: Arc<UdpSocket>,
    our_identity: Arc<DeviceInfo>,
    our_cert: CertificateInfo,
    discovery_port: u16,
    event_tx: mpsc::UnboundedSender<ServiceEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        let (n, src) = tokio::select! {
            _ = cancel.cancelled() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok(v) => v,
                Err(e) => {
                    warn!("LAN discovery recv failed: {}", e);
                    continue;
                }
            },
        };

        let packet = match Packet::parse(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                debug!("ignoring malformed discovery broadcast from {}: {}", src, e);
                continue;
            }
        };
        let remote = match RemoteIdentity::from_packet(&packet) {
            Ok(r) => r,
            Err(_) => continue,
        };
        if remote.device_id == our_identity.device_id {
            continue;
        }

        let tcp_port = remote.tcp_port.unwrap_or(discovery_port);
        let remote_addr = SocketAddr::new(src.ip(), tcp_port);
        let cert = our_cert.clone();
        let identity = our_identity.clone();
        let events = event_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = connect_outbound(remote_addr, cert, identity, packet, events.clone()).await {
                let _ = events.send(ServiceEvent::Error {
                    service: "lan",
                    message: format!("outbound connect to {remote_addr} failed: {e}"),
                });
            }
        });
    }
}
