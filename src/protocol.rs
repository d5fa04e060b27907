//! The wire schema shared by both tracker<->peer and peer<->peer links.
//!
//! Every message, regardless of direction, is framed the same way (see
//! [`crate::framing`]): a 4-byte big-endian length prefix followed by that
//! many bytes of UTF-8 JSON. This module only defines the JSON payload
//! shapes.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::{BlockId, FileName, PeerId};

/// A peer's reachable address, written on the wire as the `[host, port]`
/// pair the design calls for rather than a single `"host:port"` string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Address(pub SocketAddr);

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeTuple;
        let mut tup = serializer.serialize_tuple(2)?;
        tup.serialize_element(&self.0.ip().to_string())?;
        tup.serialize_element(&self.0.port())?;
        tup.end()
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (host, port): (String, u16) = Deserialize::deserialize(deserializer)?;
        let ip: std::net::IpAddr = host
            .parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid host {}: {}", host, e)))?;
        Ok(Address(SocketAddr::new(ip, port)))
    }
}

/// A request a peer sends to the tracker.
///
/// `Unknown` covers any structurally valid frame whose `command` field names
/// something other than the three commands the tracker implements (§4.1: "
/// Unknown command: respond `{status:"error", reason:"unknown_command"}`").
/// This is distinct from a genuinely malformed frame (not JSON, or missing
/// the `command` field itself), which the codec still rejects outright.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "command")]
pub enum TrackerRequest {
    #[serde(rename = "REGISTER")]
    Register {
        peer_id: PeerId,
        file_name: FileName,
        address: Address,
        blocks: Vec<BlockId>,
    },
    #[serde(rename = "GET_PEERS")]
    GetPeers {
        peer_id: PeerId,
        file_name: FileName,
    },
    #[serde(rename = "UPDATE_BLOCKS")]
    UpdateBlocks {
        peer_id: PeerId,
        file_name: FileName,
        blocks: Vec<BlockId>,
    },
    #[serde(skip_serializing)]
    Unknown { command: String },
}

/// Mirrors [`TrackerRequest`]'s three known commands for deserialization;
/// serde's tagged-enum derive rejects unrecognized tags outright, which
/// would make an unknown command indistinguishable from a malformed frame.
/// [`TrackerRequest`]'s manual `Deserialize` below falls back to
/// `TrackerRequest::Unknown` instead of erroring when this fails to match.
#[derive(Deserialize)]
#[serde(tag = "command")]
enum KnownTrackerRequest {
    #[serde(rename = "REGISTER")]
    Register {
        peer_id: PeerId,
        file_name: FileName,
        address: Address,
        blocks: Vec<BlockId>,
    },
    #[serde(rename = "GET_PEERS")]
    GetPeers {
        peer_id: PeerId,
        file_name: FileName,
    },
    #[serde(rename = "UPDATE_BLOCKS")]
    UpdateBlocks {
        peer_id: PeerId,
        file_name: FileName,
        blocks: Vec<BlockId>,
    },
}

impl From<KnownTrackerRequest> for TrackerRequest {
    fn from(known: KnownTrackerRequest) -> Self {
        match known {
            KnownTrackerRequest::Register {
                peer_id,
                file_name,
                address,
                blocks,
            } => TrackerRequest::Register {
                peer_id,
                file_name,
                address,
                blocks,
            },
            KnownTrackerRequest::GetPeers { peer_id, file_name } => {
                TrackerRequest::GetPeers { peer_id, file_name }
            }
            KnownTrackerRequest::UpdateBlocks {
                peer_id,
                file_name,
                blocks,
            } => TrackerRequest::UpdateBlocks {
                peer_id,
                file_name,
                blocks,
            },
        }
    }
}

impl<'de> Deserialize<'de> for TrackerRequest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let command = value
            .get("command")
            .and_then(|c| c.as_str())
            .ok_or_else(|| serde::de::Error::missing_field("command"))?
            .to_string();

        match serde_json::from_value::<KnownTrackerRequest>(value) {
            Ok(known) => Ok(known.into()),
            Err(_) => Ok(TrackerRequest::Unknown { command }),
        }
    }
}

/// Info about one swarm member, as handed back by `GET_PEERS`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub address: Address,
    pub blocks: Vec<BlockId>,
}

/// The tracker's reply to a [`TrackerRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrackerResponse {
    Ok {
        status: OkStatus,
    },
    Peers {
        peers: Vec<PeerInfo>,
    },
    Error {
        status: ErrorStatus,
        reason: String,
    },
}

/// A unit struct-like marker so `{"status":"ok"}` round-trips without a
/// stray enum discriminant; serde only ever sees the literal string "ok".
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OkStatus {
    #[serde(rename = "ok")]
    Ok,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorStatus {
    #[serde(rename = "error")]
    Error,
}

impl TrackerResponse {
    pub fn ok() -> Self {
        Self::Ok { status: OkStatus::Ok }
    }

    pub fn peers(peers: Vec<PeerInfo>) -> Self {
        Self::Peers { peers }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error {
            status: ErrorStatus::Error,
            reason: reason.into(),
        }
    }
}

/// The first message exchanged on any newly established peer connection, in
/// either direction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    #[serde(rename = "type")]
    pub ty: HandshakeTag,
    pub peer_id: PeerId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum HandshakeTag {
    #[serde(rename = "handshake")]
    Handshake,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            ty: HandshakeTag::Handshake,
            peer_id,
        }
    }
}

/// Messages exchanged between two peers after a successful handshake.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Sender advertises its current inventory. Sent right after handshake
    /// and after each newly acquired block.
    #[serde(rename = "have")]
    Have { blocks: Vec<BlockId> },

    /// Please send me this block.
    #[serde(rename = "request_block")]
    RequestBlock { block_id: BlockId },

    /// A block payload. Bytes are base64-encoded inside the JSON frame,
    /// which is the simplest of the two conformant framings described in
    /// the design (the alternative, a raw trailing byte tail declared by a
    /// `payload_len` header field, trades simplicity for ~33% less
    /// bandwidth; both are wire-compatible choices, but a swarm must agree
    /// on one).
    #[serde(rename = "block_data")]
    BlockData {
        block_id: BlockId,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },

    /// I will not serve your requests.
    #[serde(rename = "choke")]
    Choke,

    /// You may now request from me.
    #[serde(rename = "unchoke")]
    Unchoke,
}

/// (De)serializes a byte vector as a base64 string, as required by the
/// block payload framing chosen above.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_request_round_trips_through_json() {
        let req = TrackerRequest::Register {
            peer_id: "peer-a".to_string(),
            file_name: "movie.mkv".to_string(),
            address: Address("127.0.0.1:6000".parse().unwrap()),
            blocks: vec![0, 1, 2],
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: TrackerRequest = serde_json::from_str(&json).unwrap();
        match back {
            TrackerRequest::Register { peer_id, blocks, .. } => {
                assert_eq!(peer_id, "peer-a");
                assert_eq!(blocks, vec![0, 1, 2]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tracker_response_ok_serializes_to_expected_shape() {
        let resp = TrackerResponse::ok();
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok"}));
    }

    #[test]
    fn tracker_response_error_serializes_to_expected_shape() {
        let resp = TrackerResponse::error("unknown_command");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "error", "reason": "unknown_command"})
        );
    }

    #[test]
    fn peer_message_block_data_round_trips() {
        let msg = PeerMessage::BlockData {
            block_id: 7,
            bytes: vec![1, 2, 3, 4, 5],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: PeerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn handshake_round_trips() {
        let hs = Handshake::new("peer-xyz".to_string());
        let json = serde_json::to_string(&hs).unwrap();
        let back: Handshake = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hs);
    }
}
