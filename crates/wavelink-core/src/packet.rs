//! Wire packet model.
//!
//! A packet is a tagged record `{type, data}` where the type is one of the
//! seven well-known kinds and the data is either UTF-8 text or opaque bytes.
//! The handshake payload of the `open` packet is also defined here since it
//! is part of the wire contract.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Well-known packet types, encoded as a single wire digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl PacketType {
    /// Wire digit (`'0'..='6'`).
    pub fn digit(self) -> u8 {
        match self {
            PacketType::Open => b'0',
            PacketType::Close => b'1',
            PacketType::Ping => b'2',
            PacketType::Pong => b'3',
            PacketType::Message => b'4',
            PacketType::Upgrade => b'5',
            PacketType::Noop => b'6',
        }
    }

    /// Inverse of [`digit`](Self::digit); accepts both ASCII digits and raw
    /// type bytes (`0..=6`) as they appear in binary frames.
    pub fn from_wire(b: u8) -> Option<Self> {
        let n = if b.is_ascii_digit() { b - b'0' } else { b };
        match n {
            0 => Some(PacketType::Open),
            1 => Some(PacketType::Close),
            2 => Some(PacketType::Ping),
            3 => Some(PacketType::Pong),
            4 => Some(PacketType::Message),
            5 => Some(PacketType::Upgrade),
            6 => Some(PacketType::Noop),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketType::Open => "open",
            PacketType::Close => "close",
            PacketType::Ping => "ping",
            PacketType::Pong => "pong",
            PacketType::Message => "message",
            PacketType::Upgrade => "upgrade",
            PacketType::Noop => "noop",
        }
    }
}

/// Packet payload: UTF-8 text or opaque bytes. Empty text is the canonical
/// "no data" form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketData {
    Text(String),
    Binary(Bytes),
}

impl PacketData {
    pub fn none() -> Self {
        PacketData::Text(String::new())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PacketData::Text(s) => Some(s),
            PacketData::Binary(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PacketData::Text(s) => s.is_empty(),
            PacketData::Binary(b) => b.is_empty(),
        }
    }
}

impl From<&str> for PacketData {
    fn from(s: &str) -> Self {
        PacketData::Text(s.to_owned())
    }
}

impl From<String> for PacketData {
    fn from(s: String) -> Self {
        PacketData::Text(s)
    }
}

impl From<Bytes> for PacketData {
    fn from(b: Bytes) -> Self {
        PacketData::Binary(b)
    }
}

impl From<Vec<u8>> for PacketData {
    fn from(b: Vec<u8>) -> Self {
        PacketData::Binary(Bytes::from(b))
    }
}

/// A single wire packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub ptype: PacketType,
    pub data: PacketData,
}

impl Packet {
    pub fn new(ptype: PacketType, data: impl Into<PacketData>) -> Self {
        Self {
            ptype,
            data: data.into(),
        }
    }

    /// Packet with no payload.
    pub fn bare(ptype: PacketType) -> Self {
        Self {
            ptype,
            data: PacketData::none(),
        }
    }

    pub fn message(data: impl Into<PacketData>) -> Self {
        Self::new(PacketType::Message, data)
    }

    pub fn ping(data: impl Into<PacketData>) -> Self {
        Self::new(PacketType::Ping, data)
    }

    pub fn pong(data: impl Into<PacketData>) -> Self {
        Self::new(PacketType::Pong, data)
    }

    pub fn noop() -> Self {
        Self::bare(PacketType::Noop)
    }

    pub fn close() -> Self {
        Self::bare(PacketType::Close)
    }

    /// The `open` packet carrying the serialized handshake info.
    pub fn open(handshake: &Handshake) -> crate::Result<Self> {
        let json = serde_json::to_string(handshake)
            .map_err(|e| crate::WavelinkError::Internal(format!("handshake encode: {e}")))?;
        Ok(Self::new(PacketType::Open, json))
    }

    /// True for the `ping`/`pong` probe exchanged before an upgrade commits.
    pub fn is_probe(&self) -> bool {
        self.data.as_text() == Some("probe")
    }
}

/// Handshake info serialized as the data of the `open` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    pub sid: String,
    pub upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    pub ping_interval: u64,
    #[serde(rename = "pingTimeout")]
    pub ping_timeout: u64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn wire_digits_round_trip() {
        for t in [
            PacketType::Open,
            PacketType::Close,
            PacketType::Ping,
            PacketType::Pong,
            PacketType::Message,
            PacketType::Upgrade,
            PacketType::Noop,
        ] {
            assert_eq!(PacketType::from_wire(t.digit()), Some(t));
            assert_eq!(PacketType::from_wire(t.digit() - b'0'), Some(t));
        }
        assert_eq!(PacketType::from_wire(b'7'), None);
        assert_eq!(PacketType::from_wire(b'x'), None);
    }

    #[test]
    fn handshake_uses_wire_field_names() {
        let hs = Handshake {
            sid: "abc".into(),
            upgrades: vec!["websocket".into()],
            ping_interval: 25000,
            ping_timeout: 5000,
        };
        let p = Packet::open(&hs).expect("encode");
        let json = p.data.as_text().expect("text data");
        assert!(json.contains("\"pingInterval\":25000"));
        assert!(json.contains("\"pingTimeout\":5000"));
        assert!(json.contains("\"upgrades\":[\"websocket\"]"));
    }

    #[test]
    fn probe_detection() {
        assert!(Packet::ping("probe").is_probe());
        assert!(Packet::pong("probe").is_probe());
        assert!(!Packet::ping("").is_probe());
    }
}
