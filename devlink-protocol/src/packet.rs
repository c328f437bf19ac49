//! Network packet codec
//!
//! Packets are JSON objects terminated by a single newline (`0x0A`). The
//! newline is the frame delimiter on TCP streams, so a serialized packet must
//! never contain an unescaped newline (serde_json guarantees this for the
//! compact encoding).
//!
//! Each packet carries:
//! - `id`: UNIX epoch timestamp in milliseconds, sender-local
//! - `type`: packet type in the format `devlink.<plugin>[.<action>]`
//! - `body`: JSON dictionary of type-specific parameters
//! - `payloadSize` / `payloadTransferInfo`: optional out-of-band transfer
//!   descriptor for payloads too large to send in-band

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Largest frame accepted in-band. Larger payloads must be negotiated through
/// `payloadTransferInfo` instead of being serialized into the packet body.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// A single protocol packet
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds. Some peers send this as a string.
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    /// Packet type, e.g. `devlink.battery` or `devlink.pair`
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Type-specific parameters
    #[serde(default)]
    pub body: Value,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional out-of-band payload transfer descriptor
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<HashMap<String, Value>>,
}

impl Packet {
    /// Create a new packet with the current timestamp as id
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Create a packet with an explicit id (mostly for tests)
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Serialize to bytes with the newline terminator appended
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Deserialize a packet, tolerating a trailing `\n` or `\r\n`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed)
            .map_err(|e| ProtocolError::InvalidPacket(format!("failed to deserialize: {}", e)))
    }

    /// Set the payload size
    pub fn with_payload_size(mut self, size: i64) -> Self {
        self.payload_size = Some(size);
        self
    }

    /// Set the out-of-band transfer descriptor
    pub fn with_payload_transfer_info(mut self, info: HashMap<String, Value>) -> Self {
        self.payload_transfer_info = Some(info);
        self
    }

    /// Add a key-value pair to the body (no-op if body is not an object)
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Object(ref mut map) = self.body {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Check the packet type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Whether this packet references an out-of-band payload
    pub fn has_payload(&self) -> bool {
        self.payload_transfer_info.is_some()
    }

    /// Get a body field deserialized as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Handle peers that send `id` as either a number or a string
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Always serialize `id` as a number
fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_packet() {
        let packet = Packet::new("devlink.ping", json!({}));
        assert_eq!(packet.packet_type, "devlink.ping");
        assert!(packet.body.is_object());
        assert!(packet.id > 0);
    }

    #[test]
    fn test_serialization_ends_with_single_newline() {
        let packet = Packet::new(
            "devlink.identity",
            json!({ "deviceId": "phone_a", "deviceName": "Phone" }),
        );

        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));

        // Exactly one newline: the serialized JSON body contains none
        let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(newlines, 1);
    }

    #[test]
    fn test_embedded_newlines_are_escaped() {
        let packet = Packet::new("devlink.ping", json!({ "message": "line1\nline2" }));
        let bytes = packet.to_bytes().unwrap();

        // The literal newline in the body value must be escaped as \n
        let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(newlines, 1);

        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(
            parsed.get_body_field::<String>("message"),
            Some("line1\nline2".to_string())
        );
    }

    #[test]
    fn test_roundtrip() {
        let original = Packet::new(
            "devlink.battery",
            json!({ "isCharging": true, "currentCharge": 85, "thresholdEvent": 0 }),
        );

        let bytes = original.to_bytes().unwrap();
        let parsed = Packet::from_bytes(&bytes).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_deserialization_with_terminators() {
        let base = r#"{"id":1234567890,"type":"devlink.ping","body":{}}"#;

        for suffix in ["", "\n", "\r\n"] {
            let data = format!("{}{}", base, suffix);
            let packet = Packet::from_bytes(data.as_bytes()).unwrap();
            assert_eq!(packet.id, 1234567890);
            assert_eq!(packet.packet_type, "devlink.ping");
        }
    }

    #[test]
    fn test_id_as_string() {
        let json_data = r#"{"id":"1234567890","type":"devlink.ping","body":{}}"#;
        let packet = Packet::from_bytes(json_data.as_bytes()).unwrap();
        assert_eq!(packet.id, 1234567890);
    }

    #[test]
    fn test_payload_transfer_info() {
        let mut info = HashMap::new();
        info.insert("port".to_string(), json!(1739));

        let packet = Packet::new("devlink.share", json!({}))
            .with_payload_size(4096)
            .with_payload_transfer_info(info);

        assert!(packet.has_payload());
        assert_eq!(packet.payload_size, Some(4096));

        let parsed = Packet::from_bytes(&packet.to_bytes().unwrap()).unwrap();
        let port = parsed
            .payload_transfer_info
            .as_ref()
            .and_then(|i| i.get("port"))
            .and_then(|v| v.as_i64());
        assert_eq!(port, Some(1739));
    }

    #[test]
    fn test_body_field_accessors() {
        let packet = Packet::new("devlink.battery", json!({ "currentCharge": 85 }))
            .with_body_field("isCharging", true);

        assert_eq!(packet.get_body_field::<i64>("currentCharge"), Some(85));
        assert_eq!(packet.get_body_field::<bool>("isCharging"), Some(true));
        assert_eq!(packet.get_body_field::<String>("missing"), None);
    }

    #[test]
    fn test_invalid_packet() {
        assert!(Packet::from_bytes(b"not json data").is_err());
    }

    #[test]
    fn test_timestamp_is_milliseconds() {
        let timestamp = current_timestamp();
        assert!(timestamp.to_string().len() >= 13);
    }
}
