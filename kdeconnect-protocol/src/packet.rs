//! Packet Codec: parsing, validation and newline-framed (de)serialisation
//! of KDE Connect JSON packets.

use crate::error::{ProtocolError, Result};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// `kdeconnect.identity` packet type.
pub const TYPE_IDENTITY: &str = "kdeconnect.identity";

/// `kdeconnect.pair` packet type.
pub const TYPE_PAIR: &str = "kdeconnect.pair";

/// Current epoch time in milliseconds.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A KDE Connect packet: envelope (`id`, `type`) plus a type-specific body.
///
/// `id` is normalised to `i64` on parse regardless of whether the peer sent
/// it as a JSON integer or a JSON string (older peers do the latter); it is
/// always re-stamped with the current time and emitted as a JSON integer by
/// [`Packet::serialise`].
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: i64,
    pub packet_type: String,
    pub body: Value,
    pub payload_size: Option<i64>,
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    /// Construct a new packet. `id` is a placeholder until `serialise` is called.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    pub fn with_payload(mut self, info: Map<String, Value>, size: i64) -> Self {
        self.payload_transfer_info = Some(info);
        self.payload_size = Some(size);
        self
    }

    pub fn is_type(&self, t: &str) -> bool {
        self.packet_type == t
    }

    pub fn has_payload(&self) -> bool {
        self.payload_transfer_info.is_some()
    }

    // -- typed, silent body accessors (never panic, never error) --

    pub fn get_bool(&self, key: &str) -> bool {
        self.body.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.body.get(key).and_then(Value::as_i64)
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        self.body.get(key).and_then(Value::as_f64)
    }

    /// Returns `None` both when the key is absent and when its value is an
    /// empty string, per the codec's "empty string means missing" rule.
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.body
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn get_array(&self, key: &str) -> Option<&Vec<Value>> {
        self.body.get(key).and_then(Value::as_array)
    }

    pub fn get_object(&self, key: &str) -> Option<&Map<String, Value>> {
        self.body.get(key).and_then(Value::as_object)
    }

    /// Duplicate a JSON array of strings into an owned `Vec<String>`,
    /// silently dropping any non-string elements.
    pub fn dup_strv(&self, key: &str) -> Vec<String> {
        self.get_array(key)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Validate the envelope and optional payload fields per §4.B.
    pub fn validate(raw: &Value) -> Result<()> {
        let obj = raw
            .as_object()
            .ok_or_else(|| ProtocolError::Malformed("packet root is not an object".into()))?;

        let id = obj
            .get("id")
            .ok_or_else(|| ProtocolError::MissingField("id".into()))?;
        if !(id.is_i64() || id.is_u64() || id.is_string()) {
            return Err(ProtocolError::InvalidField(
                "id must be an integer or string".into(),
            ));
        }

        let ty = obj
            .get("type")
            .ok_or_else(|| ProtocolError::MissingField("type".into()))?
            .as_str()
            .ok_or_else(|| ProtocolError::InvalidField("type must be a string".into()))?;
        if ty.is_empty() {
            return Err(ProtocolError::InvalidData("type must not be empty".into()));
        }

        if !obj.get("body").map(Value::is_object).unwrap_or(false) {
            return Err(ProtocolError::MissingField("body".into()));
        }

        if let Some(size) = obj.get("payloadSize") {
            if !(size.is_i64() || size.is_u64()) {
                return Err(ProtocolError::InvalidField(
                    "payloadSize must be an integer".into(),
                ));
            }
        }
        if let Some(info) = obj.get("payloadTransferInfo") {
            if !info.is_object() {
                return Err(ProtocolError::InvalidField(
                    "payloadTransferInfo must be an object".into(),
                ));
            }
        }

        Ok(())
    }

    /// Parse a single JSON line into a `Packet`, validating it first.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let trimmed = trim_frame(bytes);
        let raw: Value = serde_json::from_slice(trimmed)?;
        Self::validate(&raw)?;

        let obj = raw.as_object().expect("validated above");
        let id = match &obj["id"] {
            Value::String(s) => s
                .parse::<i64>()
                .map_err(|_| ProtocolError::InvalidField("id string is not numeric".into()))?,
            v => v.as_i64().unwrap_or_else(|| v.as_u64().unwrap_or(0) as i64),
        };
        let packet_type = obj["type"].as_str().unwrap().to_string();
        let body = obj["body"].clone();
        let payload_size = obj.get("payloadSize").and_then(Value::as_i64);
        let payload_transfer_info = obj
            .get("payloadTransferInfo")
            .and_then(Value::as_object)
            .cloned();

        Ok(Self {
            id,
            packet_type,
            body,
            payload_size,
            payload_transfer_info,
        })
    }

    /// Serialise to bytes, re-stamping `id` with the current epoch-ms and
    /// terminating with a single `\n`.
    pub fn serialise(&mut self) -> Vec<u8> {
        self.id = current_timestamp();
        let mut map = Map::new();
        map.insert("id".into(), Value::from(self.id));
        map.insert("type".into(), Value::from(self.packet_type.clone()));
        map.insert("body".into(), self.body.clone());
        if let Some(size) = self.payload_size {
            map.insert("payloadSize".into(), Value::from(size));
        }
        if let Some(info) = &self.payload_transfer_info {
            map.insert("payloadTransferInfo".into(), Value::Object(info.clone()));
        }
        let mut out = serde_json::to_vec(&Value::Object(map)).expect("packet is always valid JSON");
        out.push(b'\n');
        out
    }

    /// Render the full envelope (including current `id`, without re-stamping
    /// it) as a JSON value, for persistence rather than wire transmission.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::from(self.id));
        map.insert("type".into(), Value::from(self.packet_type.clone()));
        map.insert("body".into(), self.body.clone());
        if let Some(size) = self.payload_size {
            map.insert("payloadSize".into(), Value::from(size));
        }
        if let Some(info) = &self.payload_transfer_info {
            map.insert("payloadTransferInfo".into(), Value::Object(info.clone()));
        }
        Value::Object(map)
    }

    /// Reconstruct a packet from a value previously produced by
    /// [`Packet::to_value`] (used to reload a persisted `identity.json`).
    pub fn from_value(value: Value) -> Result<Self> {
        Self::validate(&value)?;
        let obj = value.as_object().expect("validated above");
        let id = match &obj["id"] {
            Value::String(s) => s
                .parse::<i64>()
                .map_err(|_| ProtocolError::InvalidField("id string is not numeric".into()))?,
            v => v.as_i64().unwrap_or_else(|| v.as_u64().unwrap_or(0) as i64),
        };
        Ok(Self {
            id,
            packet_type: obj["type"].as_str().unwrap().to_string(),
            body: obj["body"].clone(),
            payload_size: obj.get("payloadSize").and_then(Value::as_i64),
            payload_transfer_info: obj.get("payloadTransferInfo").and_then(Value::as_object).cloned(),
        })
    }

    /// Read one newline-terminated packet from an async byte stream.
    ///
    /// Maintains a growable buffer (initial 4 KiB, doubled on overflow) and
    /// reads byte-by-byte past the last successfully-scanned position, which
    /// keeps the implementation simple while still only ever inspecting each
    /// byte once.
    pub async fn read_from_stream<S>(stream: &mut S) -> Result<Self>
    where
        S: AsyncReadExt + Unpin,
    {
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(ProtocolError::ConnectionClosed);
            }
            if byte[0] == b'\n' {
                return Self::parse(&buf);
            }
            if buf.len() == buf.capacity() {
                buf.reserve(buf.capacity());
            }
            buf.push(byte[0]);
        }
    }

    /// Serialise and write a packet to an async byte stream.
    pub async fn write_to_stream<S>(&mut self, stream: &mut S) -> Result<()>
    where
        S: AsyncWriteExt + Unpin,
    {
        let bytes = self.serialise();
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(())
    }
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = bytes.len();
    while start < end && (bytes[start] as char).is_whitespace() {
        start += 1;
    }
    while end > start && (bytes[end - 1] == b'\0' || (bytes[end - 1] as char).is_whitespace()) {
        end -= 1;
    }
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    #[test]
    fn validate_accepts_minimal_packet() {
        let raw = json!({"id": 1, "type": "kdeconnect.ping", "body": {}});
        assert!(Packet::validate(&raw).is_ok());
    }

    #[test]
    fn validate_rejects_non_object_root() {
        let raw = json!([1, 2, 3]);
        assert!(matches!(
            Packet::validate(&raw),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn validate_rejects_missing_type() {
        let raw = json!({"id": 1, "body": {}});
        assert!(matches!(
            Packet::validate(&raw),
            Err(ProtocolError::MissingField(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_type() {
        let raw = json!({"id": 1, "type": "", "body": {}});
        assert!(matches!(
            Packet::validate(&raw),
            Err(ProtocolError::InvalidData(_))
        ));
    }

    #[test]
    fn validate_accepts_string_id() {
        let raw = json!({"id": "12345", "type": "kdeconnect.ping", "body": {}});
        assert!(Packet::validate(&raw).is_ok());
    }

    #[test]
    fn validate_accepts_streaming_payload_size() {
        let raw = json!({
            "id": 1, "type": "kdeconnect.share.request", "body": {},
            "payloadSize": -1,
            "payloadTransferInfo": {"port": 1739}
        });
        assert!(Packet::validate(&raw).is_ok());
    }

    #[test]
    fn parse_accepts_string_id_and_normalises() {
        let bytes = br#"{"id": "42", "type": "kdeconnect.ping", "body": {}}"#;
        let packet = Packet::parse(bytes).unwrap();
        assert_eq!(packet.id, 42);
    }

    #[test]
    fn serialise_restamps_id_and_frames_with_newline() {
        let mut packet = Packet::new("kdeconnect.ping", json!({}));
        packet.id = 1;
        let bytes = packet.serialise();
        assert_eq!(*bytes.last().unwrap(), b'\n');
        assert_ne!(packet.id, 1);
        let roundtrip = Packet::parse(&bytes).unwrap();
        assert_eq!(roundtrip.id, packet.id);
    }

    #[test]
    fn roundtrip_preserves_body_type_and_payload_fields() {
        let mut packet = Packet::new("kdeconnect.share.request", json!({"filename": "a.txt"}));
        let mut info = Map::new();
        info.insert("port".into(), json!(1739));
        packet = packet.with_payload(info, -1);
        let bytes = packet.serialise();
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.packet_type, "kdeconnect.share.request");
        assert_eq!(parsed.body["filename"], "a.txt");
        assert_eq!(parsed.payload_size, Some(-1));
        assert!(parsed.payload_transfer_info.is_some());
    }

    #[test]
    fn accessors_are_silent_on_absence_and_mismatch() {
        let packet = Packet::new("kdeconnect.ping", json!({"flag": "not-a-bool"}));
        assert!(!packet.get_bool("flag"));
        assert!(!packet.get_bool("missing"));
        assert!(packet.get_int("missing").is_none());
        assert!(packet.get_string("missing").is_none());
    }

    #[test]
    fn get_string_treats_empty_as_missing() {
        let packet = Packet::new("kdeconnect.ping", json!({"message": ""}));
        assert!(packet.get_string("message").is_none());
    }

    #[tokio::test]
    async fn read_from_stream_reads_one_newline_terminated_packet() {
        let (mut client, mut server) = duplex(256);
        let mut packet = Packet::new("kdeconnect.ping", json!({}));
        let bytes = packet.serialise();
        client.write_all(&bytes).await.unwrap();

        let received = Packet::read_from_stream(&mut server).await.unwrap();
        assert_eq!(received.packet_type, "kdeconnect.ping");
    }

    #[tokio::test]
    async fn read_from_stream_fails_on_eof_before_newline() {
        let (mut client, mut server) = duplex(256);
        client.write_all(b"{\"id\":1").await.unwrap();
        drop(client);

        let result = Packet::read_from_stream(&mut server).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn write_then_read_round_trips_over_a_pipe() {
        let (mut a, mut b) = duplex(256);
        let mut packet = Packet::new("kdeconnect.pair", json!({"pair": true}));
        packet.write_to_stream(&mut a).await.unwrap();

        let received = Packet::read_from_stream(&mut b).await.unwrap();
        assert_eq!(received.packet_type, "kdeconnect.pair");
        assert!(received.get_bool("pair"));
    }
}
