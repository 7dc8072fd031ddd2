//! Local and remote device identity: the `kdeconnect.identity` body schema
//! and the chassis-type enum it carries (§3, `build_identity` in §4.E).

use crate::packet::{Packet, TYPE_IDENTITY};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Protocol version this core speaks (§3): v7's single cleartext-then-TLS
/// identity exchange, not the double pre/post-TLS re-exchange some v8 peers
/// perform (see DESIGN.md's Open Question decisions).
pub const PROTOCOL_VERSION: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Laptop,
    Phone,
    Tablet,
    Tv,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Laptop => "laptop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
            DeviceType::Tv => "tv",
        }
    }
}

/// This host's locally-constructed identity, merged from static metadata
/// and every installed plugin's capability lists (§4.E `build_identity`).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
    pub tcp_port: u16,
    /// PEM certificate, carried on transports where TLS is not the
    /// underlying cipher (Bluetooth); `None` for LAN identity packets.
    pub certificate_pem: Option<String>,
}

impl DeviceInfo {
    pub fn to_identity_packet(&self) -> Packet {
        let mut body = json!({
            "deviceId": self.device_id,
            "deviceName": self.device_name,
            "deviceType": self.device_type.as_str(),
            "protocolVersion": PROTOCOL_VERSION,
            "incomingCapabilities": self.incoming_capabilities,
            "outgoingCapabilities": self.outgoing_capabilities,
            "tcpPort": self.tcp_port,
        });
        if let Some(pem) = &self.certificate_pem {
            body["certificate"] = json!(pem);
        }
        Packet::new(TYPE_IDENTITY, body)
    }
}

/// Fields pulled out of a received identity packet; used both by
/// `service::lan`/`service::bluetooth` to validate incoming identities and
/// by `Device::handle_packet` to refresh a peer's metadata.
#[derive(Debug, Clone)]
pub struct RemoteIdentity {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    pub incoming_capabilities: Vec<String>,
    pub outgoing_capabilities: Vec<String>,
    pub certificate_pem: Option<String>,
    pub tcp_port: Option<u16>,
}

impl RemoteIdentity {
    pub fn from_packet(packet: &Packet) -> crate::error::Result<Self> {
        use crate::error::ProtocolError;

        if !packet.is_type(TYPE_IDENTITY) {
            return Err(ProtocolError::Malformed(format!(
                "expected {TYPE_IDENTITY}, got {}",
                packet.packet_type
            )));
        }
        let device_id = packet
            .get_string("deviceId")
            .ok_or_else(|| ProtocolError::MissingField("deviceId".into()))?
            .to_string();
        let device_name = packet.get_string("deviceName").unwrap_or("Unknown").to_string();
        let device_type = match packet.get_string("deviceType") {
            Some("laptop") => DeviceType::Laptop,
            Some("phone") => DeviceType::Phone,
            Some("tablet") => DeviceType::Tablet,
            Some("tv") => DeviceType::Tv,
            _ => DeviceType::Desktop,
        };
        let protocol_version = packet.get_int("protocolVersion").unwrap_or(7) as u32;
        let incoming_capabilities = packet.dup_strv("incomingCapabilities");
        let outgoing_capabilities = packet.dup_strv("outgoingCapabilities");
        let certificate_pem = packet.get_string("certificate").map(str::to_string);
        let tcp_port = packet.get_int("tcpPort").map(|p| p as u16);

        Ok(Self {
            device_id,
            device_name,
            device_type,
            protocol_version,
            incoming_capabilities,
            outgoing_capabilities,
            certificate_pem,
            tcp_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_renders_an_identity_packet_with_every_required_field() {
        let info = DeviceInfo {
            device_id: "my-device".into(),
            device_name: "My Device".into(),
            device_type: DeviceType::Desktop,
            incoming_capabilities: vec!["kdeconnect.ping".into()],
            outgoing_capabilities: vec!["kdeconnect.ping".into()],
            tcp_port: 1716,
            certificate_pem: None,
        };
        let packet = info.to_identity_packet();
        assert_eq!(packet.packet_type, TYPE_IDENTITY);
        assert_eq!(packet.get_string("deviceId"), Some("my-device"));
        assert_eq!(packet.get_int("protocolVersion"), Some(7));
    }

    #[test]
    fn remote_identity_rejects_non_identity_packets() {
        let packet = Packet::new("kdeconnect.ping", json!({}));
        assert!(RemoteIdentity::from_packet(&packet).is_err());
    }

    #[test]
    fn remote_identity_defaults_unknown_device_type_to_desktop() {
        let packet = Packet::new(
            TYPE_IDENTITY,
            json!({"deviceId": "x", "deviceName": "X", "deviceType": "spaceship"}),
        );
        let identity = RemoteIdentity::from_packet(&packet).unwrap();
        assert_eq!(identity.device_type, DeviceType::Desktop);
    }
}
