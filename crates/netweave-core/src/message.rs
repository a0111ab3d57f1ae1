//! Envelope codec — typed message bodies and their byte representation.
//!
//! An envelope is an [`EnvelopeHeader`] followed by a body whose shape is
//! chosen by the header's code. USER_DATA, FORWARD_MESSAGE and BROADCAST
//! bodies are binary (zerocopy prefix + bytes); every other body is JSON,
//! empty for codes that carry nothing.
//!
//! Decoding maps the code onto a closed [`Message`] enum. An unknown code
//! never reaches the dispatcher: it surfaces as [`WireError::UnknownCode`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::wire::{
    BroadcastPrefix, ChannelId, ChunkPrefix, EnvelopeHeader, ForwardPrefix, MessageCode,
    PayloadKind, PeerId, WireError, CHUNK_BROADCAST, CHUNK_FINAL, CHUNK_PREFIX_LEN,
    ENVELOPE_VERSION, HEADER_LEN, WRAPPER_PREFIX_LEN,
};

/// Which topology manager a channel runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyKind {
    #[default]
    FullMesh,
    Spray,
}

impl std::fmt::Display for TopologyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyKind::FullMesh => f.write_str("full_mesh"),
            TopologyKind::Spray => f.write_str("spray"),
        }
    }
}

impl std::str::FromStr for TopologyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_mesh" | "fully_connected" => Ok(TopologyKind::FullMesh),
            "spray" => Ok(TopologyKind::Spray),
            other => Err(format!("unknown topology '{other}'")),
        }
    }
}

/// One entry of a Spray partial view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub peer_id: PeerId,
    pub peer_age: u32,
}

impl KnownPeer {
    pub fn fresh(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            peer_age: 0,
        }
    }
}

// ── Bodies ───────────────────────────────────────────────────────────────────

/// One chunk of a user message.
#[derive(Debug, Clone, PartialEq)]
pub struct UserChunk {
    pub message_id: u16,
    pub index: u16,
    pub is_final: bool,
    pub is_broadcast: bool,
    pub kind: PayloadKind,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceData {
    pub service: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    pub id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInit {
    pub topology: TopologyKind,
    pub channel_id: ChannelId,
    /// Current members as seen by the accepting peer, the accepting peer included.
    #[serde(default)]
    pub members: Vec<PeerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinNewMember {
    pub new_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveNewMember {
    pub id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSuccess {
    pub id: PeerId,
}

/// PING/PONG body. The round lets the initiator ignore pongs from an expired round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRound {
    pub round: u64,
}

/// SHUFFLE body. The answer echoes `token` so the initiator can tell
/// concurrent or late exchanges apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleOffer {
    pub origin: PeerId,
    pub token: u64,
    pub sample: Vec<KnownPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleAnswer {
    pub token: u64,
    pub sample: Vec<KnownPeer>,
}

/// Correlation token shared by IS_PEER_REACHABLE/PEER_REACHABLE and
/// CAN_CLOSE/DO_CLOSE/DONT_CLOSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub token: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub dest_id: PeerId,
    pub ttl: u8,
    /// A complete encoded envelope.
    pub inner: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub origin_id: PeerId,
    pub broadcast_id: u32,
    /// A complete encoded envelope.
    pub inner: Bytes,
}

/// Every message the overlay exchanges, one variant per [`MessageCode`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    UserData(UserChunk),
    ServiceData(ServiceData),
    Leave(Leave),
    JoinInit(JoinInit),
    JoinNewMember(JoinNewMember),
    RemoveNewMember(RemoveNewMember),
    JoinFinalize,
    JoinSuccess(JoinSuccess),
    InitOk,
    Ping(PingRound),
    Pong(PingRound),
    Shuffle(ShuffleOffer),
    ShuffleAnswer(ShuffleAnswer),
    Forward(Forward),
    Broadcast(Broadcast),
    IsPeerReachable(Probe),
    PeerReachable(Probe),
    CanClose(Probe),
    DoClose(Probe),
    DontClose(Probe),
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Message::UserData(_) => MessageCode::UserData,
            Message::ServiceData(_) => MessageCode::ServiceData,
            Message::Leave(_) => MessageCode::Leave,
            Message::JoinInit(_) => MessageCode::JoinInit,
            Message::JoinNewMember(_) => MessageCode::JoinNewMember,
            Message::RemoveNewMember(_) => MessageCode::RemoveNewMember,
            Message::JoinFinalize => MessageCode::JoinFinalize,
            Message::JoinSuccess(_) => MessageCode::JoinSuccess,
            Message::InitOk => MessageCode::InitOk,
            Message::Ping(_) => MessageCode::Ping,
            Message::Pong(_) => MessageCode::Pong,
            Message::Shuffle(_) => MessageCode::Shuffle,
            Message::ShuffleAnswer(_) => MessageCode::ShuffleAnswer,
            Message::Forward(_) => MessageCode::ForwardMessage,
            Message::Broadcast(_) => MessageCode::Broadcast,
            Message::IsPeerReachable(_) => MessageCode::IsPeerReachable,
            Message::PeerReachable(_) => MessageCode::PeerReachable,
            Message::CanClose(_) => MessageCode::CanClose,
            Message::DoClose(_) => MessageCode::DoClose,
            Message::DontClose(_) => MessageCode::DontClose,
        }
    }

    /// Encode this message into a complete envelope.
    pub fn encode(&self, sender_id: PeerId, recipient_id: PeerId) -> Result<Bytes, WireError> {
        let header = EnvelopeHeader::new(self.code(), sender_id, recipient_id);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        buf.put_slice(header.as_bytes());

        match self {
            Message::UserData(chunk) => {
                let mut flags = 0;
                if chunk.is_final {
                    flags |= CHUNK_FINAL;
                }
                if chunk.is_broadcast {
                    flags |= CHUNK_BROADCAST;
                }
                let prefix = ChunkPrefix {
                    message_id: U16::new(chunk.message_id),
                    chunk_index: U16::new(chunk.index),
                    flags,
                    kind: chunk.kind as u8,
                };
                buf.reserve(CHUNK_PREFIX_LEN + chunk.data.len());
                buf.put_slice(prefix.as_bytes());
                buf.put_slice(&chunk.data);
            }
            Message::Forward(fwd) => {
                let prefix = ForwardPrefix {
                    dest_id: U32::new(fwd.dest_id),
                    ttl: fwd.ttl,
                    reserved: [0; 3],
                };
                buf.reserve(WRAPPER_PREFIX_LEN + fwd.inner.len());
                buf.put_slice(prefix.as_bytes());
                buf.put_slice(&fwd.inner);
            }
            Message::Broadcast(bc) => {
                let prefix = BroadcastPrefix {
                    origin_id: U32::new(bc.origin_id),
                    broadcast_id: U32::new(bc.broadcast_id),
                };
                buf.reserve(WRAPPER_PREFIX_LEN + bc.inner.len());
                buf.put_slice(prefix.as_bytes());
                buf.put_slice(&bc.inner);
            }
            Message::JoinFinalize | Message::InitOk => {}
            Message::ServiceData(b) => put_json(&mut buf, b)?,
            Message::Leave(b) => put_json(&mut buf, b)?,
            Message::JoinInit(b) => put_json(&mut buf, b)?,
            Message::JoinNewMember(b) => put_json(&mut buf, b)?,
            Message::RemoveNewMember(b) => put_json(&mut buf, b)?,
            Message::JoinSuccess(b) => put_json(&mut buf, b)?,
            Message::Ping(b) | Message::Pong(b) => put_json(&mut buf, b)?,
            Message::Shuffle(b) => put_json(&mut buf, b)?,
            Message::ShuffleAnswer(b) => put_json(&mut buf, b)?,
            Message::IsPeerReachable(b)
            | Message::PeerReachable(b)
            | Message::CanClose(b)
            | Message::DoClose(b)
            | Message::DontClose(b) => put_json(&mut buf, b)?,
        }

        Ok(buf.freeze())
    }
}

fn put_json<T: Serialize>(buf: &mut BytesMut, body: &T) -> Result<(), WireError> {
    let json = serde_json::to_vec(body).map_err(|e| WireError::Body(e.to_string()))?;
    buf.put_slice(&json);
    Ok(())
}

fn json<T: DeserializeOwned>(body: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(body).map_err(|e| WireError::Body(e.to_string()))
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decoded header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub code: MessageCode,
    pub sender_id: PeerId,
    pub recipient_id: PeerId,
}

/// Read and validate the header without touching the body.
pub fn decode_header(bytes: &[u8]) -> Result<Header, WireError> {
    let raw = EnvelopeHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        needed: HEADER_LEN,
        got: bytes.len(),
    })?;
    if raw.version != ENVELOPE_VERSION {
        return Err(WireError::UnknownVersion(raw.version));
    }
    Ok(Header {
        code: MessageCode::try_from(raw.code)?,
        sender_id: raw.sender(),
        recipient_id: raw.recipient(),
    })
}

/// A fully decoded envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub message: Message,
}

impl Envelope {
    pub fn decode(bytes: &Bytes) -> Result<Self, WireError> {
        let header = decode_header(bytes)?;
        let message = decode_body(header.code, bytes.slice(HEADER_LEN..))?;
        Ok(Self { header, message })
    }

    pub fn sender(&self) -> PeerId {
        self.header.sender_id
    }

    pub fn recipient(&self) -> PeerId {
        self.header.recipient_id
    }
}

/// Decode a body once the code is known.
pub fn decode_body(code: MessageCode, body: Bytes) -> Result<Message, WireError> {
    let message = match code {
        MessageCode::UserData => {
            let prefix = ChunkPrefix::read_from_prefix(&body).ok_or(WireError::Truncated {
                needed: CHUNK_PREFIX_LEN,
                got: body.len(),
            })?;
            Message::UserData(UserChunk {
                message_id: prefix.message_id.get(),
                index: prefix.chunk_index.get(),
                is_final: prefix.flags & CHUNK_FINAL != 0,
                is_broadcast: prefix.flags & CHUNK_BROADCAST != 0,
                kind: PayloadKind::try_from(prefix.kind)?,
                data: body.slice(CHUNK_PREFIX_LEN..),
            })
        }
        MessageCode::ForwardMessage => {
            let prefix = ForwardPrefix::read_from_prefix(&body).ok_or(WireError::Truncated {
                needed: WRAPPER_PREFIX_LEN,
                got: body.len(),
            })?;
            Message::Forward(Forward {
                dest_id: prefix.dest_id.get(),
                ttl: prefix.ttl,
                inner: body.slice(WRAPPER_PREFIX_LEN..),
            })
        }
        MessageCode::Broadcast => {
            let prefix = BroadcastPrefix::read_from_prefix(&body).ok_or(WireError::Truncated {
                needed: WRAPPER_PREFIX_LEN,
                got: body.len(),
            })?;
            Message::Broadcast(Broadcast {
                origin_id: prefix.origin_id.get(),
                broadcast_id: prefix.broadcast_id.get(),
                inner: body.slice(WRAPPER_PREFIX_LEN..),
            })
        }
        MessageCode::JoinFinalize => Message::JoinFinalize,
        MessageCode::InitOk => Message::InitOk,
        MessageCode::ServiceData => Message::ServiceData(json(&body)?),
        MessageCode::Leave => Message::Leave(json(&body)?),
        MessageCode::JoinInit => Message::JoinInit(json(&body)?),
        MessageCode::JoinNewMember => Message::JoinNewMember(json(&body)?),
        MessageCode::RemoveNewMember => Message::RemoveNewMember(json(&body)?),
        MessageCode::JoinSuccess => Message::JoinSuccess(json(&body)?),
        MessageCode::Ping => Message::Ping(json(&body)?),
        MessageCode::Pong => Message::Pong(json(&body)?),
        MessageCode::Shuffle => Message::Shuffle(json(&body)?),
        MessageCode::ShuffleAnswer => Message::ShuffleAnswer(json(&body)?),
        MessageCode::IsPeerReachable => Message::IsPeerReachable(json(&body)?),
        MessageCode::PeerReachable => Message::PeerReachable(json(&body)?),
        MessageCode::CanClose => Message::CanClose(json(&body)?),
        MessageCode::DoClose => Message::DoClose(json(&body)?),
        MessageCode::DontClose => Message::DontClose(json(&body)?),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Envelope {
        let bytes = msg.encode(7, 9).unwrap();
        let env = Envelope::decode(&bytes).unwrap();
        assert_eq!(env.sender(), 7);
        assert_eq!(env.recipient(), 9);
        assert_eq!(env.message, msg);
        env
    }

    #[test]
    fn join_init_carries_topology_and_members() {
        roundtrip(Message::JoinInit(JoinInit {
            topology: TopologyKind::Spray,
            channel_id: 42,
            members: vec![1, 2, 3],
        }));
    }

    #[test]
    fn body_less_codes_encode_to_header_only() {
        let bytes = Message::JoinFinalize.encode(1, 2).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        roundtrip(Message::InitOk);
    }

    #[test]
    fn forward_wraps_an_inner_envelope() {
        let inner = Message::ShuffleAnswer(ShuffleAnswer {
            token: 17,
            sample: vec![KnownPeer::fresh(5)],
        })
        .encode(3, 4)
        .unwrap();
        let env = roundtrip(Message::Forward(Forward {
            dest_id: 4,
            ttl: 8,
            inner: inner.clone(),
        }));
        let Message::Forward(fwd) = env.message else {
            panic!("expected forward");
        };
        let inner_env = Envelope::decode(&fwd.inner).unwrap();
        assert_eq!(inner_env.header.code, MessageCode::ShuffleAnswer);
        assert_eq!(inner_env.sender(), 3);
    }

    #[test]
    fn user_chunk_flags_survive() {
        roundtrip(Message::UserData(UserChunk {
            message_id: 513,
            index: 2,
            is_final: true,
            is_broadcast: true,
            kind: PayloadKind::Binary,
            data: Bytes::from_static(&[0, 1, 2, 255]),
        }));
    }

    #[test]
    fn unknown_code_is_rejected_before_body() {
        let mut bytes = Message::InitOk.encode(1, 2).unwrap().to_vec();
        bytes[1] = 9;
        assert_eq!(
            Envelope::decode(&Bytes::from(bytes)),
            Err(WireError::UnknownCode(9))
        );
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = Message::InitOk.encode(1, 2).unwrap().to_vec();
        bytes[0] = 2;
        assert_eq!(decode_header(&bytes), Err(WireError::UnknownVersion(2)));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            decode_header(&[1, 2, 3]),
            Err(WireError::Truncated { needed: 12, got: 3 })
        ));
    }

    #[test]
    fn malformed_json_body_is_a_body_error() {
        let mut bytes = Message::Leave(Leave { id: 1 }).encode(1, 0).unwrap().to_vec();
        bytes.truncate(HEADER_LEN + 2);
        assert!(matches!(
            Envelope::decode(&Bytes::from(bytes)),
            Err(WireError::Body(_))
        ));
    }

    #[test]
    fn topology_kind_parses_both_spellings() {
        assert_eq!("spray".parse::<TopologyKind>(), Ok(TopologyKind::Spray));
        assert_eq!(
            "fully_connected".parse::<TopologyKind>(),
            Ok(TopologyKind::FullMesh)
        );
        assert!("star".parse::<TopologyKind>().is_err());
    }
}
