//! Certificate Store: generate, persist and read the long-lived TLS identity
//! that doubles as this device's DeviceId (the certificate's Common Name).

use crate::error::{ProtocolError, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Name, X509};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const RSA_KEY_BITS: u32 = 4096;
const CERT_VALIDITY_YEARS: i64 = 10;
const CERT_ORG: &str = "Valent";
const CERT_ORG_UNIT: &str = "Valent";
/// Literal, not randomly generated: the reference protocol fixes this value.
const CERT_SERIAL: u32 = 10;

/// A generated or loaded device identity: certificate, private key, and
/// derived metadata cached alongside them.
#[derive(Clone)]
pub struct CertificateInfo {
    pub device_id: String,
    pub certificate_der: Vec<u8>,
    pub private_key_der: Vec<u8>,
    pub fingerprint: String,
}

impl CertificateInfo {
    /// Generate a fresh self-signed identity. `device_id` becomes the
    /// certificate's Common Name, and is therefore the system's DeviceId.
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let rsa = Rsa::generate(RSA_KEY_BITS)?;
        let pkey = PKey::from_rsa(rsa)?;

        let mut name_builder = X509Name::builder()?;
        name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, CERT_ORG)?;
        name_builder.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, CERT_ORG_UNIT)?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &device_id)?;
        let name = name_builder.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?; // X.509 v3
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?; // self-signed

        let mut serial = BigNum::new()?;
        serial.set_word(CERT_SERIAL as u64)?;
        builder.set_serial_number(&serial.to_asn1_integer()?)?;

        builder.set_not_before(&Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&Asn1Time::days_from_now((CERT_VALIDITY_YEARS * 365) as u32)?)?;

        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .digital_signature()
                .key_encipherment()
                .key_agreement()
                .build()?,
        )?;

        builder.set_pubkey(&pkey)?;
        builder.sign(&pkey, MessageDigest::sha256())?;
        let certificate = builder.build();

        let certificate_der = certificate.to_der()?;
        let private_key_der = pkey.private_key_to_der()?;
        let fingerprint = Self::calculate_fingerprint(&certificate_der);

        Ok(Self {
            device_id,
            certificate_der,
            private_key_der,
            fingerprint,
        })
    }

    /// Generate a new identity with a fresh random device id (standard
    /// hyphenated UUIDv4), used as both the certificate CN and the
    /// discovery-layer `deviceId`.
    pub fn generate_with_random_id() -> Result<Self> {
        Self::generate(Uuid::new_v4().to_string())
    }

    /// SHA-256 of the DER encoding, formatted as uppercase colon-joined hex
    /// pairs (95 characters for a 32-byte digest: 32 pairs + 31 colons).
    pub fn calculate_fingerprint(der: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(der);
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Extract the Common Name from a DER-encoded certificate.
    pub fn common_name_from_der(der: &[u8]) -> Result<String> {
        let cert = X509::from_der(der)
            .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
        let entries = cert.subject_name().entries_by_nid(Nid::COMMONNAME);
        for entry in entries {
            if let Ok(s) = entry.data().as_utf8() {
                return Ok(s.to_string());
            }
        }
        Err(ProtocolError::CertificateError(
            "certificate has no Common Name".into(),
        ))
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        let cert = X509::from_der(&self.certificate_der)
            .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
        Ok(cert.public_key()?.public_key_to_der()?)
    }

    /// PEM encoding of the certificate, carried in Bluetooth identity
    /// packets since that transport has no TLS handshake to present it.
    pub fn certificate_pem(&self) -> Result<String> {
        let cert = X509::from_der(&self.certificate_der)
            .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
        Ok(String::from_utf8_lossy(&cert.to_pem()?).into_owned())
    }

    fn certificate_path(dir: &Path) -> PathBuf {
        dir.join("certificate.pem")
    }

    fn private_key_path(dir: &Path) -> PathBuf {
        dir.join("private.pem")
    }

    /// Load an existing identity from `dir`, or generate and persist a new
    /// one with a random device id if none exists yet.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let cert_path = Self::certificate_path(dir);
        let key_path = Self::private_key_path(dir);

        if cert_path.exists() && key_path.exists() {
            Self::load_from_files(&cert_path, &key_path)
        } else {
            fs::create_dir_all(dir)?;
            let info = Self::generate_with_random_id()?;
            info.save_to_files(&cert_path, &key_path)?;
            Ok(info)
        }
    }

    /// Write certificate and key as PEM, atomically (write-to-temp then
    /// rename) and mode 0600.
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        let cert = X509::from_der(&self.certificate_der)
            .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
        let pkey = PKey::private_key_from_der(&self.private_key_der)
            .map_err(|e| ProtocolError::CertificateError(e.to_string()))?;

        atomic_write_0600(cert_path, &cert.to_pem()?)?;
        atomic_write_0600(key_path, &pkey.private_key_to_pem_pkcs8()?)?;
        Ok(())
    }

    /// Load a certificate/key pair from PEM files written by `save_to_files`.
    pub fn load_from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read(cert_path)?;
        let key_pem = fs::read(key_path)?;

        let cert = X509::from_pem(&cert_pem).map_err(|e| ProtocolError::CertificateError(e.to_string()))?;
        let pkey =
            PKey::private_key_from_pem(&key_pem).map_err(|e| ProtocolError::CertificateError(e.to_string()))?;

        let certificate_der = cert.to_der()?;
        let private_key_der = pkey.private_key_to_der()?;
        let device_id = Self::common_name_from_der(&certificate_der)?;
        let fingerprint = Self::calculate_fingerprint(&certificate_der);

        Ok(Self {
            device_id,
            certificate_der,
            private_key_der,
            fingerprint,
        })
    }
}

#[cfg(unix)]
fn atomic_write_0600(path: &Path, contents: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.as_file().set_permissions(fs::Permissions::from_mode(0o600))?;
    tmp.persist(path)
        .map_err(|e| ProtocolError::Io(e.error))?;
    Ok(())
}

#[cfg(not(unix))]
fn atomic_write_0600(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, contents)?;
    tmp.persist(path).map_err(|e| ProtocolError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generate_uses_rsa_4096_and_fixed_dn() {
        let info = CertificateInfo::generate("test-device-id").unwrap();
        assert_eq!(info.device_id, "test-device-id");
        let cert = X509::from_der(&info.certificate_der).unwrap();
        let pubkey = cert.public_key().unwrap();
        assert_eq!(pubkey.rsa().unwrap().size() * 8, RSA_KEY_BITS);

        let cn = CertificateInfo::common_name_from_der(&info.certificate_der).unwrap();
        assert_eq!(cn, "test-device-id");
    }

    #[test]
    fn fingerprint_is_95_characters_of_colon_joined_hex() {
        let info = CertificateInfo::generate("fp-test").unwrap();
        assert_eq!(info.fingerprint.len(), 95);
        assert_eq!(info.fingerprint.split(':').count(), 32);
        for part in info.fingerprint.split(':') {
            assert_eq!(part.len(), 2);
            assert!(part.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn fingerprint_is_stable_across_der_parses() {
        let info = CertificateInfo::generate("stable-test").unwrap();
        let cn1 = CertificateInfo::common_name_from_der(&info.certificate_der).unwrap();
        let cn2 = CertificateInfo::common_name_from_der(&info.certificate_der).unwrap();
        assert_eq!(cn1, cn2);
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("certificate.pem");
        let key_path = dir.path().join("private.pem");

        let original = CertificateInfo::generate("roundtrip-device").unwrap();
        original.save_to_files(&cert_path, &key_path).unwrap();

        let loaded = CertificateInfo::load_from_files(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.device_id, "roundtrip-device");
        assert_eq!(loaded.fingerprint, original.fingerprint);
        assert_eq!(loaded.certificate_der, original.certificate_der);
    }

    #[cfg(unix)]
    #[test]
    fn save_to_files_sets_mode_0600() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let cert_path = dir.path().join("certificate.pem");
        let key_path = dir.path().join("private.pem");

        let info = CertificateInfo::generate("perm-test").unwrap();
        info.save_to_files(&cert_path, &key_path).unwrap();

        let mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn load_or_create_generates_once_then_reuses() {
        let dir = TempDir::new().unwrap();
        let first = CertificateInfo::load_or_create(dir.path()).unwrap();
        let second = CertificateInfo::load_or_create(dir.path()).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.fingerprint, second.fingerprint);
    }
}
