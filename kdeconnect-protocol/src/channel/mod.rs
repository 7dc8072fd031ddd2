//! Channel: a polymorphic duplex connection carrying JSON packets one per
//! line, plus auxiliary payload streams (§4.D).

pub mod lan;
#[cfg(feature = "bluetooth")]
pub mod bluetooth;

use crate::context::DeviceContext;
use crate::error::Result;
use crate::packet::Packet;
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// A payload byte stream returned by `download`/`upload`. Distinct from
/// `tokio::io::{AsyncRead, AsyncWrite}` because the Bluetooth variant (a
/// [`crate::mux::MuxChannel`]) exposes its own async `read`/`write` methods
/// rather than implementing the poll-based traits.
#[async_trait]
pub trait PayloadStream: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}

#[async_trait]
impl<T> PayloadStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(AsyncReadExt::read(self, buf).await?)
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        AsyncWriteExt::write_all(self, buf).await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        AsyncWriteExt::shutdown(self).await?;
        Ok(())
    }
}

/// Common contract implemented by the LAN and Bluetooth Channel variants.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Read and validate one `\n`-terminated packet. At most one read is
    /// outstanding at a time; callers must serialise their own calls.
    async fn read_packet(&self, cancel: &CancellationToken) -> Result<Packet>;

    /// Serialise and write `packet` through the channel's single-writer
    /// queue. Stamps `id` at emission time.
    async fn write_packet(&self, packet: Packet, cancel: &CancellationToken) -> Result<()>;

    /// Idempotent close; a second call is a no-op.
    async fn close(&self, cancel: &CancellationToken) -> Result<()>;

    /// Open the peer's offered payload transfer described by `packet`'s
    /// `payloadTransferInfo`.
    async fn download(
        &self,
        packet: &Packet,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PayloadStream>>;

    /// Offer a payload to the peer, mutating `packet` with a fresh
    /// `payloadTransferInfo` before writing it.
    async fn upload(
        &self,
        packet: &mut Packet,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PayloadStream>>;

    /// Short human-readable digest derived from both certificates, shown as
    /// a pairing PIN. `None` on transports without a usable certificate
    /// pair (Bluetooth).
    fn verification_key(&self) -> Option<String>;

    /// The peer's identity packet, captured at Channel construction time.
    fn peer_identity(&self) -> &Packet;

    /// Name of the Channel Service that produced this Channel (`"lan"` or
    /// `"bluetooth"`), used to gate protocol-specific plugins (§4.H).
    fn protocol_name(&self) -> &'static str;

    /// Persist per-device trust material (the peer identity) under `ctx`.
    /// The default implementation writes `identity.json`, atomic and
    /// mode 0600; Channel variants may override for transport-specific
    /// extras but should still call [`write_identity_json`].
    async fn store_trust(&self, ctx: &DeviceContext) -> Result<()> {
        write_identity_json(ctx, self.peer_identity())
    }
}

/// Shared `store_trust` body: write the peer identity as `identity.json`,
/// atomically and mode 0600.
pub fn write_identity_json(ctx: &DeviceContext, identity: &Packet) -> Result<()> {
    ctx.ensure_dirs()?;
    let json = serde_json::to_vec_pretty(&identity.to_value())?;
    atomic_write_0600(&ctx.identity_path(), &json)
}

/// Load a previously persisted `identity.json`, if present.
pub fn read_identity_json(ctx: &DeviceContext) -> Result<Option<Packet>> {
    let path = ctx.identity_path();
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes)?;
    Ok(Some(Packet::from_value(value)?))
}

#[cfg(unix)]
pub(crate) fn atomic_write_0600(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))?;
    tmp.persist(path)
        .map_err(|e| crate::error::ProtocolError::Io(e.error))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn atomic_write_0600(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(path)
        .map_err(|e| crate::error::ProtocolError::Io(e.error))?;
    Ok(())
}
