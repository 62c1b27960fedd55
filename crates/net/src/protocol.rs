//! Network protocol message types
//!
//! Every frame carries one [`Envelope`]: a protocol version, a message id and
//! one tagged [`Message`], JSON-serialized and length-prefixed on the wire.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Wire protocol version carried in every envelope
pub const PROTOCOL_VERSION: u8 = 1;

/// Dialable listen address of a peer node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in '{}'", s)))?;

        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in '{}'", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in '{}'", s)))?;

        Ok(Self::new(host, port))
    }
}

/// One stroke of a pointer drag, in canvas coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawSegment {
    pub from_x: f64,
    pub from_y: f64,
    pub to_x: f64,
    pub to_y: f64,
    pub author: String,
}

/// Network protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A line segment drawn by some participant
    DrawSegment(DrawSegment),

    /// Wipe the shared canvas
    ClearCanvas,

    /// A participant switched pen colour
    ColorChange { color: String },

    /// Addresses the sender knows about, sent once per new connection
    PeerListAdvertisement { peers: BTreeSet<PeerAddress> },

    /// First frame on every connection: the sender's listen address
    Hello { listen: PeerAddress },
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::DrawSegment(_) => "DrawSegment",
            Message::ClearCanvas => "ClearCanvas",
            Message::ColorChange { .. } => "ColorChange",
            Message::PeerListAdvertisement { .. } => "PeerListAdvertisement",
            Message::Hello { .. } => "Hello",
        }
    }

    /// Whether this message is flooded to the rest of the mesh.
    ///
    /// Handshake traffic is scoped to the connection it was sent on.
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            Message::DrawSegment(_) | Message::ClearCanvas | Message::ColorChange { .. }
        )
    }
}

/// Versioned wrapper around a message as it travels the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u8,
    pub id: Uuid,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with a fresh id
    pub fn new(message: Message) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            id: Uuid::new_v4(),
            message,
        }
    }

    /// Serialize envelope to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_segment_wire_shape() {
        let env = Envelope::new(Message::DrawSegment(DrawSegment {
            from_x: 10.0,
            from_y: 10.0,
            to_x: 20.0,
            to_y: 20.0,
            author: "alice".to_string(),
        }));

        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "DrawSegment");
        assert_eq!(value["fromX"], 10.0);
        assert_eq!(value["toY"], 20.0);
        assert_eq!(value["author"], "alice");
        assert_eq!(value["id"], env.id.to_string());
    }

    #[test]
    fn test_peer_list_roundtrip() {
        let peers: BTreeSet<_> = [
            PeerAddress::new("127.0.0.1", 9001),
            PeerAddress::new("127.0.0.1", 9000),
        ]
        .into_iter()
        .collect();
        let env = Envelope::new(Message::PeerListAdvertisement {
            peers: peers.clone(),
        });

        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.id, env.id);
        match decoded.message {
            Message::PeerListAdvertisement { peers: got } => assert_eq!(got, peers),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_clear_canvas_decodes_from_bare_tag() {
        let raw = br#"{"v":1,"id":"6f1c2a4e-3b7d-4d3e-9c55-0c8f2b1a9e77","type":"ClearCanvas"}"#;
        let env = Envelope::from_bytes(raw).unwrap();
        assert_eq!(env.message, Message::ClearCanvas);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let raw = br#"{"v":1,"id":"6f1c2a4e-3b7d-4d3e-9c55-0c8f2b1a9e77","type":"Teleport"}"#;
        assert!(Envelope::from_bytes(raw).is_err());
    }

    #[test]
    fn test_peer_address_parse() {
        let addr: PeerAddress = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(addr, PeerAddress::new("127.0.0.1", 9000));
        assert_eq!(addr.to_string(), "127.0.0.1:9000");

        assert!("127.0.0.1".parse::<PeerAddress>().is_err());
        assert!(":9000".parse::<PeerAddress>().is_err());
        assert!("host:http".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_peer_address_ordering() {
        let a = PeerAddress::new("10.0.0.1", 9000);
        let b = PeerAddress::new("10.0.0.2", 8000);
        let c = PeerAddress::new("10.0.0.2", 9000);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_relay_classification() {
        assert!(Message::ClearCanvas.is_relayed());
        assert!(Message::ColorChange {
            color: "red".into()
        }
        .is_relayed());
        assert!(!Message::Hello {
            listen: PeerAddress::new("h", 1)
        }
        .is_relayed());
        assert!(!Message::PeerListAdvertisement {
            peers: BTreeSet::new()
        }
        .is_relayed());
    }
}
