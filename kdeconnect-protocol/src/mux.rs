//! Bluetooth Multiplexer: carves one RFCOMM duplex byte stream into many
//! flow-controlled sub-streams addressed by UUID.
//!
//! Grounded directly on the frame format and credit-window arithmetic of the
//! reference KDE Connect Bluetooth plugin's muxer (19-byte header, five
//! message types, 4 KiB default buffer, `a0d0aaf4-…` as the always-open
//! primary channel). No teacher crate in this workspace implements a
//! multiplexer; the reader-task / write-mutex shape below instead follows
//! this crate's own `ConnectionManager`-style actor pattern.

use crate::error::{ProtocolError, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Size of the fixed wire header: `[type:u8][size:u16 BE][uuid:16 bytes]`.
const HEADER_SIZE: usize = 19;

/// Default per-channel ring buffer / credit window size.
pub const DEFAULT_BUFFER_SIZE: u32 = 4096;

/// The always-open primary channel UUID; carries identity exchange and, on
/// LAN-equivalent semantics, the upgrade to an application TLS session.
pub const PRIMARY_CHANNEL_UUID: Uuid = Uuid::from_bytes([
    0xa0, 0xd0, 0xaa, 0xf4, 0x10, 0x72, 0x4d, 0x81, 0xaa, 0x35, 0x90, 0x2a, 0x95, 0x4b, 0x12, 0x66,
]);

const PROTOCOL_MIN: u16 = 1;
const PROTOCOL_MAX: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageType {
    ProtocolVersion,
    OpenChannel,
    CloseChannel,
    Read,
    Write,
}

impl MessageType {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(Self::ProtocolVersion),
            1 => Ok(Self::OpenChannel),
            2 => Ok(Self::CloseChannel),
            3 => Ok(Self::Read),
            4 => Ok(Self::Write),
            other => Err(ProtocolError::Malformed(format!(
                "unknown multiplexer message type {other}"
            ))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::ProtocolVersion => 0,
            Self::OpenChannel => 1,
            Self::CloseChannel => 2,
            Self::Read => 3,
            Self::Write => 4,
        }
    }
}

fn encode_header(ty: MessageType, size: u16, uuid: Uuid) -> [u8; HEADER_SIZE] {
    let mut frame = [0u8; HEADER_SIZE];
    frame[0] = ty.as_u8();
    frame[1..3].copy_from_slice(&size.to_be_bytes());
    frame[3..19].copy_from_slice(uuid.as_bytes());
    frame
}

/// Per-substream state: ring buffer of unconsumed received bytes plus the
/// credit windows in both directions.
struct ChannelState {
    buffer: Mutex<VecDeque<u8>>,
    /// Bytes the peer is still permitted to WRITE to us before we must
    /// grant more (decremented as WRITE frames arrive).
    read_credit: AtomicU32,
    /// Bytes we are still permitted to WRITE to the peer (decremented as we
    /// send WRITE frames, incremented by incoming READ frames).
    write_credit: AtomicU32,
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
    notify: Notify,
    buffer_size: u32,
}

impl ChannelState {
    fn new(buffer_size: u32) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(buffer_size as usize)),
            read_credit: AtomicU32::new(0),
            write_credit: AtomicU32::new(0),
            local_closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            notify: Notify::new(),
            buffer_size,
        }
    }

    fn hup(&self) -> bool {
        self.local_closed.load(Ordering::SeqCst) || self.remote_closed.load(Ordering::SeqCst)
    }
}

/// Shared state behind a connected multiplexer. `S` is the underlying duplex
/// stream type (an RFCOMM socket in production, `tokio::io::DuplexStream` in
/// tests); only its write half is held here, since reads are owned by the
/// single reader task.
struct Inner<S> {
    writer: Mutex<WriteHalf<S>>,
    channels: Mutex<HashMap<Uuid, Arc<ChannelState>>>,
    buffer_size: u32,
    closed: AtomicBool,
}

impl<S> Inner<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn send_frame(&self, ty: MessageType, uuid: Uuid, payload: &[u8]) -> Result<()> {
        let header = encode_header(ty, payload.len() as u16, uuid);
        let mut writer = self.writer.lock().await;
        writer.write_all(&header).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn send_read_grant(&self, uuid: Uuid, credit: u16) -> Result<()> {
        self.send_frame(MessageType::Read, uuid, &credit.to_be_bytes())
            .await
    }
}

/// A handle to one virtual sub-stream inside a [`Multiplexer`].
#[derive(Clone)]
pub struct MuxChannel<S> {
    uuid: Uuid,
    state: Arc<ChannelState>,
    inner: Arc<Inner<S>>,
}

impl<S> MuxChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Read up to `buf.len()` bytes. Returns `Ok(0)` at end-of-stream (the
    /// peer sent CLOSE_CHANNEL and the buffer has drained).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let mut buffer = self.state.buffer.lock().await;
                if !buffer.is_empty() {
                    let n = buf.len().min(buffer.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = buffer.pop_front().unwrap();
                    }
                    drop(buffer);
                    self.maybe_top_up().await?;
                    return Ok(n);
                }
                if self.state.remote_closed.load(Ordering::SeqCst) {
                    return Ok(0);
                }
            }
            if self.state.local_closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.state.notify.notified().await;
        }
    }

    /// Write all of `data`, chunked to respect the outstanding write credit.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let credit = loop {
                let credit = self.state.write_credit.load(Ordering::SeqCst);
                if credit > 0 {
                    break credit;
                }
                if self.state.hup() {
                    return Err(ProtocolError::ConnectionClosed);
                }
                self.state.notify.notified().await;
            };

            let chunk_len = (data.len() - offset).min(credit as usize).min(u16::MAX as usize);
            let chunk = &data[offset..offset + chunk_len];
            self.inner
                .send_frame(MessageType::Write, self.uuid, chunk)
                .await?;
            self.state
                .write_credit
                .fetch_sub(chunk_len as u32, Ordering::SeqCst);
            offset += chunk_len;
        }
        Ok(())
    }

    /// Idempotent close: sends CLOSE_CHANNEL once and marks the local
    /// direction HUP.
    pub async fn close(&self) -> Result<()> {
        if self.state.local_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .send_frame(MessageType::CloseChannel, self.uuid, &[])
            .await?;
        self.state.notify.notify_waiters();
        self.reclaim_if_done().await;
        Ok(())
    }

    async fn reclaim_if_done(&self) {
        if self.state.local_closed.load(Ordering::SeqCst) && self.state.remote_closed.load(Ordering::SeqCst)
        {
            let mut channels = self.inner.channels.lock().await;
            channels.remove(&self.uuid);
        }
    }

    /// Top-up policy (§4.C): issue an additional READ grant once free
    /// buffer space minus outstanding read credit exceeds half the buffer.
    async fn maybe_top_up(&self) -> Result<()> {
        let buffered = self.state.buffer.lock().await.len() as u32;
        let free = self.state.buffer_size.saturating_sub(buffered);
        let outstanding = self.state.read_credit.load(Ordering::SeqCst);
        if free > outstanding && free - outstanding > self.state.buffer_size / 2 {
            let topup = free - outstanding;
            self.state.read_credit.fetch_add(topup, Ordering::SeqCst);
            self.inner.send_read_grant(self.uuid, topup as u16).await?;
        }
        Ok(())
    }
}

/// Negotiated protocol-version multiplexer over one real duplex stream
/// (an RFCOMM socket in production, any `AsyncRead + AsyncWrite` in tests).
pub struct Multiplexer<S> {
    inner: Arc<Inner<S>>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Uuid>>,
    reader_task: JoinHandle<()>,
}

impl<S> Drop for Multiplexer<S> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl<S> Multiplexer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Split `stream` into the multiplexer's read and write halves, perform
    /// the protocol-version handshake, implicitly open the primary channel,
    /// and spawn the single demuxing reader task.
    pub async fn connect(stream: S, buffer_size: u32) -> Result<(Arc<Self>, MuxChannel<S>)> {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        negotiate_version(&mut read_half, &mut write_half).await?;

        let inner = Arc::new(Inner {
            writer: Mutex::new(write_half),
            channels: Mutex::new(HashMap::new()),
            buffer_size,
            closed: AtomicBool::new(false),
        });

        let primary_state = Arc::new(ChannelState::new(buffer_size));
        inner
            .channels
            .lock()
            .await
            .insert(PRIMARY_CHANNEL_UUID, primary_state.clone());
        primary_state
            .read_credit
            .store(buffer_size, Ordering::SeqCst);
        inner
            .send_read_grant(PRIMARY_CHANNEL_UUID, buffer_size as u16)
            .await?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(reader_loop(read_half, inner.clone(), incoming_tx));

        let mux = Arc::new(Self {
            inner: inner.clone(),
            incoming_rx: Mutex::new(incoming_rx),
            reader_task,
        });

        let primary = MuxChannel {
            uuid: PRIMARY_CHANNEL_UUID,
            state: primary_state,
            inner,
        };

        Ok((mux, primary))
    }

    /// Open a new sub-stream and grant it our initial read credit. Used by
    /// `Channel::upload` to create a fresh payload channel.
    pub async fn open_channel(&self, uuid: Uuid) -> Result<MuxChannel<S>> {
        {
            let mut channels = self.inner.channels.lock().await;
            if channels.contains_key(&uuid) {
                return Err(ProtocolError::AddressInUse(uuid.to_string()));
            }
            let state = Arc::new(ChannelState::new(self.inner.buffer_size));
            channels.insert(uuid, state);
        }
        self.inner
            .send_frame(MessageType::OpenChannel, uuid, &[])
            .await?;

        let state = self.inner.channels.lock().await.get(&uuid).unwrap().clone();
        state
            .read_credit
            .store(self.inner.buffer_size, Ordering::SeqCst);
        self.inner
            .send_read_grant(uuid, self.inner.buffer_size as u16)
            .await?;

        Ok(MuxChannel {
            uuid,
            state,
            inner: self.inner.clone(),
        })
    }

    /// Wait for the peer to open a new sub-stream (used by `Channel::download`
    /// to accept an incoming payload channel by UUID).
    pub async fn accept_channel(&self, uuid: Uuid) -> Result<MuxChannel<S>> {
        loop {
            if let Some(state) = self.inner.channels.lock().await.get(&uuid).cloned() {
                return Ok(MuxChannel {
                    uuid,
                    state,
                    inner: self.inner.clone(),
                });
            }
            let opened = self.incoming_rx.lock().await.recv().await;
            match opened {
                Some(opened_uuid) if opened_uuid == uuid => {
                    let state = self.inner.channels.lock().await.get(&uuid).unwrap().clone();
                    return Ok(MuxChannel {
                        uuid,
                        state,
                        inner: self.inner.clone(),
                    });
                }
                Some(_) => continue,
                None => return Err(ProtocolError::ConnectionClosed),
            }
        }
    }

    /// Tear down the muxer: mark every substream HUP, wake all waiters, shut
    /// down the underlying socket, and stop the reader task. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        hang_up_all_channels(&self.inner).await;
        shutdown_writer(&self.inner).await;
        self.reader_task.abort();
    }
}

/// Mark every substream HUP in both directions and wake its waiters.
async fn hang_up_all_channels<S>(inner: &Inner<S>) {
    let channels = inner.channels.lock().await;
    for state in channels.values() {
        state.local_closed.store(true, Ordering::SeqCst);
        state.remote_closed.store(true, Ordering::SeqCst);
        state.notify.notify_waiters();
    }
}

async fn shutdown_writer<S>(inner: &Inner<S>)
where
    S: AsyncWrite + Unpin,
{
    let mut writer = inner.writer.lock().await;
    let _ = writer.shutdown().await;
}

async fn negotiate_version<S>(
    read_half: &mut ReadHalf<S>,
    write_half: &mut WriteHalf<S>,
) -> Result<u16>
where
    S: AsyncRead + AsyncWrite,
{
    let our_frame = {
        let mut payload = [0u8; 4];
        payload[0..2].copy_from_slice(&PROTOCOL_MIN.to_be_bytes());
        payload[2..4].copy_from_slice(&PROTOCOL_MAX.to_be_bytes());
        let header = encode_header(MessageType::ProtocolVersion, 4, PRIMARY_CHANNEL_UUID);
        (header, payload)
    };

    let write_fut = async {
        write_half.write_all(&our_frame.0).await?;
        write_half.write_all(&our_frame.1).await?;
        write_half.flush().await?;
        Ok::<(), ProtocolError>(())
    };

    let read_fut = async {
        let mut header = [0u8; HEADER_SIZE];
        read_half.read_exact(&mut header).await?;
        let ty = MessageType::from_u8(header[0])?;
        if ty != MessageType::ProtocolVersion {
            return Err(ProtocolError::Malformed(
                "expected PROTOCOL_VERSION as first multiplexer frame".into(),
            ));
        }
        let mut payload = [0u8; 4];
        read_half.read_exact(&mut payload).await?;
        let peer_min = u16::from_be_bytes([payload[0], payload[1]]);
        let peer_max = u16::from_be_bytes([payload[2], payload[3]]);
        Ok::<(u16, u16), ProtocolError>((peer_min, peer_max))
    };

    let (write_result, read_result) = tokio::join!(write_fut, read_fut);
    write_result?;
    let (peer_min, peer_max) = read_result?;

    if peer_min > PROTOCOL_MAX {
        return Err(ProtocolError::Malformed(format!(
            "peer requires protocol version >= {peer_min}, we only support up to {PROTOCOL_MAX}"
        )));
    }
    Ok(peer_max.min(PROTOCOL_MAX))
}

async fn reader_loop<S>(
    mut read_half: ReadHalf<S>,
    inner: Arc<Inner<S>>,
    incoming_tx: mpsc::UnboundedSender<Uuid>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = reader_loop_inner(&mut read_half, &inner, &incoming_tx).await {
        warn!("multiplexer reader task stopped: {}", e);
        // A protocol fault is fatal to the whole muxer, not just the frame
        // being parsed: tear down exactly as `Multiplexer::close` would so
        // no channel is left looking merely half-closed and no caller can
        // `open_channel` on a link that no longer speaks the protocol.
        if !inner.closed.swap(true, Ordering::SeqCst) {
            hang_up_all_channels(&inner).await;
            shutdown_writer(&inner).await;
        }
    }
}

async fn reader_loop_inner<S>(
    read_half: &mut ReadHalf<S>,
    inner: &Arc<Inner<S>>,
    incoming_tx: &mpsc::UnboundedSender<Uuid>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut header = [0u8; HEADER_SIZE];
        read_half.read_exact(&mut header).await?;
        let ty = MessageType::from_u8(header[0])?;
        let size = u16::from_be_bytes([header[1], header[2]]);
        let uuid = Uuid::from_slice(&header[3..19]).expect("16 bytes");

        match ty {
            MessageType::ProtocolVersion => {
                // Only valid as the first frame, consumed by negotiate_version.
                let mut discard = vec![0u8; size as usize];
                read_half.read_exact(&mut discard).await?;
            }
            MessageType::OpenChannel => {
                let mut channels = inner.channels.lock().await;
                if channels.contains_key(&uuid) {
                    return Err(ProtocolError::AddressInUse(uuid.to_string()));
                }
                let state = Arc::new(ChannelState::new(inner.buffer_size));
                state.read_credit.store(inner.buffer_size, Ordering::SeqCst);
                channels.insert(uuid, state);
                drop(channels);
                inner.send_read_grant(uuid, inner.buffer_size as u16).await?;
                let _ = incoming_tx.send(uuid);
                debug!("peer opened multiplexer channel {}", uuid);
            }
            MessageType::CloseChannel => {
                if let Some(state) = inner.channels.lock().await.get(&uuid).cloned() {
                    state.remote_closed.store(true, Ordering::SeqCst);
                    state.notify.notify_waiters();
                }
            }
            MessageType::Read => {
                let mut payload = [0u8; 2];
                read_half.read_exact(&mut payload).await?;
                let credit = u16::from_be_bytes(payload) as u32;
                if let Some(state) = inner.channels.lock().await.get(&uuid).cloned() {
                    state.write_credit.fetch_add(credit, Ordering::SeqCst);
                    state.notify.notify_waiters();
                }
            }
            MessageType::Write => {
                let mut payload = vec![0u8; size as usize];
                read_half.read_exact(&mut payload).await?;
                let state = inner
                    .channels
                    .lock()
                    .await
                    .get(&uuid)
                    .cloned()
                    .ok_or_else(|| ProtocolError::Malformed(format!("WRITE for unknown channel {uuid}")))?;

                let credit = state.read_credit.load(Ordering::SeqCst);
                if (size as u32) > credit {
                    return Err(ProtocolError::MessageTooLarge(format!(
                        "channel {uuid} received {size} bytes with only {credit} read credit"
                    )));
                }
                state.read_credit.fetch_sub(size as u32, Ordering::SeqCst);
                {
                    let mut buffer = state.buffer.lock().await;
                    buffer.extend(payload);
                }
                state.notify.notify_waiters();
                trace!("multiplexer delivered {} bytes on channel {}", size, uuid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handshake_opens_primary_channel_on_both_sides() {
        let (a, b) = duplex(1 << 16);
        let (mux_a, primary_a) = Multiplexer::connect(a, DEFAULT_BUFFER_SIZE).await.unwrap();
        assert_eq!(primary_a.uuid(), PRIMARY_CHANNEL_UUID);
        drop(mux_a);
        drop(b);
    }

    #[tokio::test]
    async fn primary_channel_round_trips_bytes() {
        let (a, b) = duplex(1 << 16);
        let connect_a = Multiplexer::connect(a, DEFAULT_BUFFER_SIZE);
        let connect_b = Multiplexer::connect(b, DEFAULT_BUFFER_SIZE);
        let (result_a, result_b) = tokio::join!(connect_a, connect_b);
        let (_mux_a, primary_a) = result_a.unwrap();
        let (_mux_b, primary_b) = result_b.unwrap();

        primary_a.write(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        let n = primary_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn large_transfer_respects_credit_window_and_arrives_in_order() {
        let (a, b) = duplex(1 << 20);
        let buffer_size = 4096u32;
        let connect_a = Multiplexer::connect(a, buffer_size);
        let connect_b = Multiplexer::connect(b, buffer_size);
        let (result_a, result_b) = tokio::join!(connect_a, connect_b);
        let (_mux_a, primary_a) = result_a.unwrap();
        let (_mux_b, primary_b) = result_b.unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let payload_clone = payload.clone();

        let writer = tokio::spawn(async move {
            primary_a.write(&payload_clone).await.unwrap();
        });

        let mut received = Vec::with_capacity(10_000);
        let mut buf = vec![0u8; 4096];
        while received.len() < 10_000 {
            let n = primary_b.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
        }
        writer.await.unwrap();

        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn open_channel_is_rejected_when_uuid_already_open() {
        let (a, b) = duplex(1 << 16);
        let connect_a = Multiplexer::connect(a, DEFAULT_BUFFER_SIZE);
        let connect_b = Multiplexer::connect(b, DEFAULT_BUFFER_SIZE);
        let (result_a, result_b) = tokio::join!(connect_a, connect_b);
        let (mux_a, _primary_a) = result_a.unwrap();
        let (_mux_b, _primary_b) = result_b.unwrap();

        let err = mux_a.open_channel(PRIMARY_CHANNEL_UUID).await.unwrap_err();
        assert!(matches!(err, ProtocolError::AddressInUse(_)));
    }

    #[tokio::test]
    async fn upload_opens_a_fresh_channel_peer_can_accept() {
        let (a, b) = duplex(1 << 16);
        let connect_a = Multiplexer::connect(a, DEFAULT_BUFFER_SIZE);
        let connect_b = Multiplexer::connect(b, DEFAULT_BUFFER_SIZE);
        let (result_a, result_b) = tokio::join!(connect_a, connect_b);
        let (mux_a, _primary_a) = result_a.unwrap();
        let (mux_b, _primary_b) = result_b.unwrap();

        let payload_uuid = Uuid::new_v4();
        let open_fut = mux_a.open_channel(payload_uuid);
        let accept_fut = mux_b.accept_channel(payload_uuid);
        let (opened, accepted) = tokio::join!(open_fut, accept_fut);
        let opened = opened.unwrap();
        let accepted = accepted.unwrap();

        opened.write(b"payload bytes").await.unwrap();
        let mut buf = [0u8; 13];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"payload bytes");
    }
}
