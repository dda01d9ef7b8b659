//! # Control-Channel Wire Format
//!
//! This module defines every message exchanged over the local control
//! channel, plus the discovery-tag naming scheme and the `/addrs/` peer
//! specifier. Messages are self-describing JSON records with a `type` tag so
//! browser clients can speak the protocol without a schema compiler.
//!
//! | Direction | Type |
//! |-----------|------|
//! | client → relay | [`ClientMessage`] |
//! | relay → client | [`RelayMessage`] |
//!
//! ## Field Conventions
//!
//! - Connection ids are decimal strings of the 64-bit id ([`ConnectionId`]).
//! - Byte payloads are hex strings ([`Payload`]).
//! - Peer identities travel as hex strings; the `connect` command also
//!   accepts a `/addrs/<ascii85 JSON>` specifier carrying out-of-band
//!   addresses (see [`parse_peer_spec`]).
//!
//! ## Limits
//!
//! Inbound control messages are decoded with [`decode_client`], which bounds
//! the raw size before parsing. An undecodable message is fatal to the
//! session: the channel is corrupt.

use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::overlay::{OverlayError, PeerId};

/// Maximum size of one inbound control message.
/// SECURITY: Bounds decode work and payload buffering per message; data
/// payloads are hex, so this admits ~2 MiB of raw bytes.
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Lifetime of one discovery advertisement.
pub const DISCOVERY_TTL: Duration = Duration::from_secs(3 * 60);

/// Re-advertisement interval, slightly inside the TTL so entries never lapse.
pub const DISCOVERY_REFRESH: Duration = Duration::from_secs(3 * 60 - 10);

/// Dial attempts for a discovery-assisted connect before giving up.
pub const DISCOVERY_ATTEMPTS: u32 = 3;


#[derive(Debug, Error)]
pub enum CodecError {
    #[error("control message of {0} bytes exceeds limit")]
    Oversized(usize),

    #[error("malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid peer specifier: {0}")]
    PeerSpec(String),

    #[error("invalid ascii85 payload: {0}")]
    Ascii85(String),
}


// ============================================================================
// Primitive wire types
// ============================================================================

/// Connection identifier: a 64-bit value carried as a decimal string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for ConnectionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ConnectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u64>()
            .map(ConnectionId)
            .map_err(|_| de::Error::custom(format!("invalid connection id {raw:?}")))
    }
}

/// Raw bytes carried as a hex string.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

impl Payload {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(&raw)
            .map(Payload)
            .map_err(|e| de::Error::custom(format!("invalid hex payload: {e}")))
    }
}


// ============================================================================
// Control messages
// ============================================================================

/// Commands a local client sends to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Listen {
        protocol: String,
        frames: bool,
    },
    #[serde(rename_all = "camelCase")]
    Stop {
        protocol: String,
        #[serde(default)]
        retain_connections: bool,
    },
    Connect {
        protocol: String,
        peer: String,
        frames: bool,
        #[serde(default)]
        relay: bool,
    },
    Close {
        id: ConnectionId,
    },
    Data {
        id: ConnectionId,
        data: Payload,
    },
    DiscoveryListen {
        protocol: String,
        frames: bool,
    },
    DiscoveryConnect {
        protocol: String,
        frames: bool,
    },
    Friends {
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
    },
}

/// Notifications the relay sends to a local client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    Listening {
        protocol: String,
    },
    ListenRefused {
        protocol: String,
        reason: String,
    },
    ListenerClosed {
        protocol: String,
    },
    ListenerConnection {
        id: ConnectionId,
        peer: String,
        protocol: String,
    },
    PeerConnection {
        id: ConnectionId,
        peer: String,
        protocol: String,
    },
    ConnectionRefused {
        peer: String,
        protocol: String,
        reason: String,
    },
    ConnectionData {
        id: ConnectionId,
        data: Payload,
    },
    ConnectionClosed {
        id: ConnectionId,
        reason: String,
    },
    NatStatus {
        status: crate::overlay::NatStatus,
    },
}

/// Decode one inbound control message with the size bound enforced.
pub fn decode_client(bytes: &[u8]) -> Result<ClientMessage, CodecError> {
    if bytes.len() > MAX_CONTROL_MESSAGE_SIZE {
        return Err(CodecError::Oversized(bytes.len()));
    }
    Ok(serde_json::from_slice(bytes)?)
}

/// Encode one outbound relay message.
pub fn encode_relay(message: &RelayMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}


// ============================================================================
// Discovery namespacing
// ============================================================================

/// Wire-observable advertisement tag for a protocol.
///
/// `direct-<p>` / `raw-direct-<p>` mark publicly reachable listeners,
/// `indirect-<p>` / `raw-indirect-<p>` mark NAT-bound ones; the `raw-`
/// prefix marks unframed streams.
pub fn discovery_tag(direct: bool, frames: bool, protocol: &str) -> String {
    let reach = if direct { "direct" } else { "indirect" };
    if frames {
        format!("{reach}-{protocol}")
    } else {
        format!("raw-{reach}-{protocol}")
    }
}


// ============================================================================
// Peer specifiers
// ============================================================================

/// Prefix selecting the out-of-band address form of a peer specifier.
pub const ADDRS_PREFIX: &str = "/addrs/";

/// A decoded peer specifier: the target identity plus any addresses supplied
/// out of band to seed the overlay's address book before dialing.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerSpec {
    pub peer: PeerId,
    pub addrs: Vec<String>,
}

#[derive(Deserialize)]
struct EncodedAddrs {
    #[serde(rename = "PeerID")]
    peer_id: String,
    #[serde(rename = "Addrs", default)]
    addrs: Vec<String>,
}

/// Parse a peer specifier: either a bare hex peer id or
/// `/addrs/<ascii85 of {"PeerID": "...", "Addrs": [...]}>`.
pub fn parse_peer_spec(spec: &str) -> Result<PeerSpec, CodecError> {
    if let Some(encoded) = spec.strip_prefix(ADDRS_PREFIX) {
        let raw = ascii85_decode(encoded)?;
        let decoded: EncodedAddrs = serde_json::from_slice(&raw)
            .map_err(|e| CodecError::PeerSpec(format!("bad addrs record: {e}")))?;
        let peer = PeerId::from_hex(&decoded.peer_id)
            .map_err(|e| CodecError::PeerSpec(e.to_string()))?;
        Ok(PeerSpec { peer, addrs: decoded.addrs })
    } else {
        let peer = match PeerId::from_hex(spec) {
            Ok(p) => p,
            Err(OverlayError::InvalidPeerId(s)) => {
                return Err(CodecError::PeerSpec(format!("invalid peer id {s:?}")));
            }
            Err(e) => return Err(CodecError::PeerSpec(e.to_string())),
        };
        Ok(PeerSpec { peer, addrs: Vec::new() })
    }
}

/// Decode Adobe Ascii85 (the `encoding/ascii85` alphabet: `!`..`u`, with `z`
/// for an all-zero group; whitespace is skipped). No pack crate covers this
/// encoding, so it lives here next to its only consumer.
fn ascii85_decode(input: &str) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(input.len() * 4 / 5);
    let mut group = [0u32; 5];
    let mut filled = 0usize;

    for c in input.chars() {
        match c {
            'z' if filled == 0 => out.extend_from_slice(&[0, 0, 0, 0]),
            'z' => return Err(CodecError::Ascii85("'z' inside group".into())),
            '!'..='u' => {
                group[filled] = (c as u32) - 33;
                filled += 1;
                if filled == 5 {
                    out.extend_from_slice(&decode_group(&group, 5)?);
                    filled = 0;
                }
            }
            c if c.is_ascii_whitespace() => {}
            c => return Err(CodecError::Ascii85(format!("invalid character {c:?}"))),
        }
    }

    match filled {
        0 => Ok(out),
        1 => Err(CodecError::Ascii85("truncated final group".into())),
        n => {
            // Pad with 'u' (84) and keep n-1 bytes.
            for slot in group.iter_mut().skip(n) {
                *slot = 84;
            }
            out.extend_from_slice(&decode_group(&group, n)?[..n - 1]);
            Ok(out)
        }
    }
}

fn decode_group(group: &[u32; 5], filled: usize) -> Result<[u8; 4], CodecError> {
    let mut value: u64 = 0;
    for digit in group {
        value = value * 85 + u64::from(*digit);
    }
    if value > u64::from(u32::MAX) {
        return Err(CodecError::Ascii85(format!(
            "group of {filled} characters overflows 32 bits"
        )));
    }
    Ok((value as u32).to_be_bytes())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::NatStatus;

    fn round_trip_client(msg: &ClientMessage) -> ClientMessage {
        let json = serde_json::to_string(msg).expect("serialize");
        decode_client(json.as_bytes()).expect("decode")
    }

    #[test]
    fn client_message_tags() {
        let json = serde_json::to_string(&ClientMessage::DiscoveryListen {
            protocol: "chat".into(),
            frames: true,
        })
        .unwrap();
        assert!(json.contains(r#""type":"discovery-listen""#));

        let json = serde_json::to_string(&ClientMessage::Stop {
            protocol: "chat".into(),
            retain_connections: true,
        })
        .unwrap();
        assert!(json.contains(r#""retainConnections":true"#));
    }

    #[test]
    fn client_message_round_trips() {
        let messages = vec![
            ClientMessage::Listen { protocol: "echo".into(), frames: true },
            ClientMessage::Stop { protocol: "echo".into(), retain_connections: false },
            ClientMessage::Connect {
                protocol: "echo".into(),
                peer: "ab".repeat(32),
                frames: false,
                relay: false,
            },
            ClientMessage::Close { id: ConnectionId(7) },
            ClientMessage::Data { id: ConnectionId(7), data: b"hello".as_slice().into() },
            ClientMessage::DiscoveryConnect { protocol: "echo".into(), frames: true },
            ClientMessage::Friends { add: vec!["ab".repeat(32)], remove: vec![] },
        ];
        for msg in messages {
            assert_eq!(round_trip_client(&msg), msg);
        }
    }

    #[test]
    fn ids_travel_as_decimal_strings() {
        let json = serde_json::to_string(&RelayMessage::ConnectionClosed {
            id: ConnectionId(u64::MAX),
            reason: "gone".into(),
        })
        .unwrap();
        assert!(json.contains(&format!(r#""id":"{}""#, u64::MAX)));

        let parsed: RelayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(
            parsed,
            RelayMessage::ConnectionClosed { id: ConnectionId(u64::MAX), reason: "gone".into() }
        );
    }

    #[test]
    fn payloads_travel_as_hex() {
        let json = serde_json::to_string(&RelayMessage::ConnectionData {
            id: ConnectionId(1),
            data: vec![0xDE, 0xAD].into(),
        })
        .unwrap();
        assert!(json.contains(r#""data":"dead""#));
    }

    #[test]
    fn nat_status_message() {
        let json =
            serde_json::to_string(&RelayMessage::NatStatus { status: NatStatus::Public }).unwrap();
        assert_eq!(json, r#"{"type":"nat-status","status":"public"}"#);
    }

    #[test]
    fn oversized_message_rejected() {
        let huge = vec![b'x'; MAX_CONTROL_MESSAGE_SIZE + 1];
        assert!(matches!(decode_client(&huge), Err(CodecError::Oversized(_))));
    }

    #[test]
    fn malformed_message_rejected() {
        assert!(decode_client(b"{\"type\":\"warp\"}").is_err());
        assert!(decode_client(b"not json").is_err());
    }

    #[test]
    fn missing_defaults_fill_in() {
        let msg = decode_client(br#"{"type":"stop","protocol":"p"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Stop { protocol: "p".into(), retain_connections: false }
        );

        let msg = decode_client(
            br#"{"type":"connect","protocol":"p","peer":"ff","frames":true}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Connect { relay: false, .. }));
    }

    #[test]
    fn discovery_tag_naming() {
        assert_eq!(discovery_tag(true, true, "chat"), "direct-chat");
        assert_eq!(discovery_tag(true, false, "chat"), "raw-direct-chat");
        assert_eq!(discovery_tag(false, true, "chat"), "indirect-chat");
        assert_eq!(discovery_tag(false, false, "chat"), "raw-indirect-chat");
    }

    #[test]
    fn discovery_refresh_inside_ttl() {
        assert!(DISCOVERY_REFRESH < DISCOVERY_TTL);
    }

    #[test]
    fn ascii85_known_vectors() {
        // "Man " encodes to "9jqo^" in Adobe Ascii85.
        assert_eq!(ascii85_decode("9jqo^").unwrap(), b"Man ");
        // 'z' is the all-zero group.
        assert_eq!(ascii85_decode("z").unwrap(), vec![0, 0, 0, 0]);
        // Whitespace is skipped.
        assert_eq!(ascii85_decode("9jq o^\n").unwrap(), b"Man ");
    }

    #[test]
    fn ascii85_rejects_garbage() {
        assert!(ascii85_decode("v").is_err()); // outside alphabet
        assert!(ascii85_decode("9").is_err()); // lone digit
        assert!(ascii85_decode("9z").is_err()); // z inside a group
        assert!(ascii85_decode("uuuuu").is_err()); // overflows 32 bits
    }

    #[test]
    fn bare_peer_spec() {
        let id = PeerId::from_bytes([7u8; 32]);
        let spec = parse_peer_spec(&id.to_string()).unwrap();
        assert_eq!(spec.peer, id);
        assert!(spec.addrs.is_empty());

        assert!(parse_peer_spec("nonsense").is_err());
    }

    #[test]
    fn addrs_peer_spec() {
        let id = PeerId::from_bytes([9u8; 32]);
        let json = format!(
            r#"{{"PeerID":"{id}","Addrs":["/ip4/10.0.0.1/tcp/4005","/ip4/10.0.0.1/udp/4005/quic"]}}"#
        );
        let encoded = ascii85_encode_for_tests(json.as_bytes());
        let spec = parse_peer_spec(&format!("/addrs/{encoded}")).unwrap();
        assert_eq!(spec.peer, id);
        assert_eq!(spec.addrs.len(), 2);

        assert!(parse_peer_spec("/addrs/!!garbage~").is_err());
    }

    /// Minimal Ascii85 encoder, test-side only, to exercise the decoder
    /// against arbitrary JSON without external fixtures.
    fn ascii85_encode_for_tests(data: &[u8]) -> String {
        let mut out = String::new();
        for chunk in data.chunks(4) {
            let mut padded = [0u8; 4];
            padded[..chunk.len()].copy_from_slice(chunk);
            let mut value = u32::from_be_bytes(padded);
            let mut digits = [0u8; 5];
            for slot in digits.iter_mut().rev() {
                *slot = (value % 85) as u8 + 33;
                value /= 85;
            }
            let keep = if chunk.len() == 4 { 5 } else { chunk.len() + 1 };
            for d in &digits[..keep] {
                out.push(*d as char);
            }
        }
        out
    }

    #[test]
    fn ascii85_encoder_decoder_agree() {
        let data = b"arbitrary bytes \x00\x01\x02 with zeros";
        let encoded = ascii85_encode_for_tests(data);
        assert_eq!(ascii85_decode(&encoded).unwrap(), data);
    }
}
