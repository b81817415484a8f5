//! Envelope encoding/decoding for the tunnel protocol
//!
//! Every frame on the wire is a JSON text message:
//! ```text
//! {"connectionState": <0..=3>, "payload": "<base64>"}
//! ```
//! `payload` may be absent or `null`, both read as empty. CONNECT carries
//! nothing, the first CONNECTED from the server carries the assigned
//! address in CIDR form, and every later CONNECTED carries one raw IP packet.

use super::ProtocolError;
use bytes::Bytes;
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Connection state marker carried by every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Unset; never sent explicitly
    #[default]
    Init = 0,
    /// Client asks to begin a session
    Connect = 1,
    /// Session confirmation, and the wrapper for every relayed packet
    Connected = 2,
    /// Graceful teardown notice
    Disconnect = 3,
}

impl TryFrom<u8> for ConnectionState {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectionState::Init),
            1 => Ok(ConnectionState::Connect),
            2 => Ok(ConnectionState::Connected),
            3 => Ok(ConnectionState::Disconnect),
            other => Err(ProtocolError::UnknownState(other)),
        }
    }
}

impl Serialize for ConnectionState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ConnectionState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        ConnectionState::try_from(value).map_err(serde::de::Error::custom)
    }
}

/// A protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "connectionState")]
    pub state: ConnectionState,
    #[serde(default, with = "base64_payload")]
    pub payload: Bytes,
}

impl Envelope {
    /// Create a session request
    pub fn connect() -> Self {
        Self {
            state: ConnectionState::Connect,
            payload: Bytes::new(),
        }
    }

    /// Create a CONNECTED envelope wrapping one IP packet
    pub fn connected(packet: Bytes) -> Self {
        Self {
            state: ConnectionState::Connected,
            payload: packet,
        }
    }

    /// Create the handshake reply carrying an assigned address
    pub fn assignment(address: Ipv4Net) -> Self {
        Self::connected(Bytes::from(address.to_string()))
    }

    /// Create a teardown notice with a human readable reason
    pub fn disconnect(reason: &str) -> Self {
        Self {
            state: ConnectionState::Disconnect,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Parse the payload of a handshake reply as a CIDR address
    pub fn assigned_address(&self) -> Result<Ipv4Net, ProtocolError> {
        let text = std::str::from_utf8(&self.payload)
            .map_err(|_| ProtocolError::InvalidAddress("payload is not UTF-8".to_string()))?;
        text.trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(text.to_string()))
    }

    /// Payload read as text (used for DISCONNECT reasons)
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD
                .decode(text.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom),
            None => Ok(Bytes::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_wire_format() {
        let encoded = Envelope::connect().encode().unwrap();
        assert_eq!(encoded, r#"{"connectionState":1,"payload":""}"#);
    }

    #[test]
    fn test_assignment_payload_is_cidr() {
        let address: Ipv4Net = "10.8.0.3/24".parse().unwrap();
        let envelope = Envelope::assignment(address);

        let encoded = envelope.encode().unwrap();
        assert_eq!(encoded, r#"{"connectionState":2,"payload":"MTAuOC4wLjMvMjQ="}"#);

        let decoded = Envelope::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded.state, ConnectionState::Connected);
        assert_eq!(decoded.assigned_address().unwrap(), address);
    }

    #[test]
    fn test_packet_payload_survives_binary_content() {
        let packet = Bytes::from_static(&[0x45, 0x00, 0x00, 0x14, 0xff, 0x00, 0x80]);
        let envelope = Envelope::connected(packet.clone());

        let decoded = Envelope::decode(envelope.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded.payload, packet);
    }

    #[test]
    fn test_missing_and_null_payload_are_empty() {
        let missing = Envelope::decode(br#"{"connectionState":1}"#).unwrap();
        assert_eq!(missing.state, ConnectionState::Connect);
        assert!(missing.payload.is_empty());

        let null = Envelope::decode(br#"{"connectionState":1,"payload":null}"#).unwrap();
        assert!(null.payload.is_empty());
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!(Envelope::decode(br#"{"connectionState":9,"payload":""}"#).is_err());
        assert!(matches!(
            ConnectionState::try_from(4),
            Err(ProtocolError::UnknownState(4))
        ));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"connectionState":2,"payload":"***"}"#).is_err());
    }

    #[test]
    fn test_assigned_address_rejects_packet_payload() {
        let envelope = Envelope::connected(Bytes::from_static(&[0x45, 0x00]));
        assert!(envelope.assigned_address().is_err());
    }
}
