//! Shared TLS acceptor/connector construction for the LAN transport.
//!
//! Mirrors the reference implementation's choice to speak OpenSSL directly
//! (not rustls) so the minimum negotiable protocol version can be pinned
//! down to TLS 1.0 for compatibility with older peer implementations, and
//! to use Trust-On-First-Use instead of certificate-chain validation: the
//! application layer (Device pairing) is what decides whether a peer's
//! certificate is trusted, not the TLS stack.

use crate::cert::CertificateInfo;
use crate::error::{ProtocolError, Result};
use openssl::pkey::PKey;
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::X509;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_openssl::SslStream;

/// Cipher suites matching a typical KDE Connect desktop build: wide enough
/// to interoperate with older Android peers while still offering AEAD
/// ciphers to modern ones.
const CIPHER_LIST: &str =
    "ECDHE-ECDSA-AES256-GCM-SHA384:ECDHE-ECDSA-AES128-GCM-SHA256:ECDHE-RSA-AES128-SHA:@SECLEVEL=1";

fn load_identity(cert: &CertificateInfo) -> Result<(X509, PKey<openssl::pkey::Private>)> {
    let x509 = X509::from_der(&cert.certificate_der)
        .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
    let pkey = PKey::private_key_from_der(&cert.private_key_der)
        .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
    Ok((x509, pkey))
}

pub fn build_acceptor(our_cert: &CertificateInfo) -> Result<SslAcceptor> {
    let (x509, pkey) = load_identity(our_cert)?;

    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;
    // Solicit the client certificate (required to get one at all in the
    // server role) but accept whatever is presented. TOFU: the Device
    // pairing state machine decides trust, not the handshake.
    builder.set_verify_callback(SslVerifyMode::PEER, |_preverify_ok, _ctx| true);
    builder.set_certificate(&x509)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

pub fn build_connector(our_cert: &CertificateInfo) -> Result<SslConnector> {
    let (x509, pkey) = load_identity(our_cert)?;

    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_min_proto_version(Some(SslVersion::TLS1))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_cipher_list(CIPHER_LIST)?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_certificate(&x509)?;
    builder.set_private_key(&pkey)?;

    Ok(builder.build())
}

/// Perform the TLS server-side handshake over an already-accepted TCP (or
/// any duplex) stream.
pub async fn accept_tls<S>(acceptor: &SslAcceptor, stream: S) -> Result<SslStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ssl = openssl::ssl::Ssl::new(acceptor.context())?;
    let mut tls = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls)
        .accept()
        .await
        .map_err(|e| ProtocolError::CertificateError(format!("TLS accept failed: {e}")))?;
    Ok(tls)
}

/// Perform the TLS client-side handshake over a connected stream.
pub async fn connect_tls<S>(connector: &SslConnector, stream: S) -> Result<SslStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ssl = openssl::ssl::Ssl::new(connector.context())?;
    let mut tls = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls)
        .connect()
        .await
        .map_err(|e| ProtocolError::CertificateError(format!("TLS connect failed: {e}")))?;
    Ok(tls)
}

/// DER bytes of the peer certificate presented during the handshake, if any
/// (there always is one once the handshake completes, since both sides
/// present a certificate even under TOFU).
pub fn peer_certificate_der<S>(stream: &SslStream<S>) -> Result<Vec<u8>> {
    stream
        .ssl()
        .peer_certificate()
        .ok_or_else(|| ProtocolError::CertificateError("peer presented no certificate".into()))?
        .to_der()
        .map_err(ProtocolError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_and_connector_build_from_the_same_identity() {
        let cert = CertificateInfo::generate("tls-util-test").unwrap();
        assert!(build_acceptor(&cert).is_ok());
        assert!(build_connector(&cert).is_ok());
    }
}
