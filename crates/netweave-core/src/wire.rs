//! Netweave wire format — the fixed-size structures every envelope starts with.
//!
//! These types ARE the protocol. Every field, every size and every reserved
//! byte is part of the wire format; peers running different layouts cannot
//! talk to each other.
//!
//! All multi-byte integers are big-endian. The structs derive zerocopy
//! traits and are `Unaligned`, so they can be read straight out of a
//! received buffer. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::{U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

/// Peer identifier, unique within one channel at any moment.
pub type PeerId = u32;

/// Identifier of the logical group. Identical on every member.
pub type ChannelId = u32;

/// `recipient_id` value for envelopes that are not addressed to one peer.
pub const NO_RECIPIENT: PeerId = 0;

/// Largest id handed out to peers and channels.
pub const MAX_ID: u32 = u32::MAX;

/// Current envelope format version.
pub const ENVELOPE_VERSION: u8 = 0x01;

// ── Message codes ────────────────────────────────────────────────────────────

/// Every message kind the overlay understands. Values are wire-stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    UserData = 1,
    ServiceData = 2,
    Leave = 3,
    JoinInit = 4,
    JoinNewMember = 5,
    RemoveNewMember = 6,
    JoinFinalize = 7,
    JoinSuccess = 8,
    InitOk = 10,
    Ping = 11,
    Pong = 12,
    Shuffle = 13,
    ShuffleAnswer = 14,
    ForwardMessage = 15,
    Broadcast = 16,
    IsPeerReachable = 17,
    PeerReachable = 18,
    CanClose = 19,
    DoClose = 20,
    DontClose = 21,
}

impl MessageCode {
    /// Whether a message with this code may travel inside FORWARD_MESSAGE.
    ///
    /// CAN_CLOSE is answered only by a direct neighbour. Join handshake
    /// messages and the wrappers themselves are channel-local.
    pub fn is_forwardable(self) -> bool {
        matches!(
            self,
            MessageCode::UserData
                | MessageCode::ServiceData
                | MessageCode::ShuffleAnswer
                | MessageCode::Shuffle
                | MessageCode::DoClose
                | MessageCode::DontClose
                | MessageCode::Pong
                | MessageCode::IsPeerReachable
                | MessageCode::PeerReachable
        )
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let code = match value {
            1 => MessageCode::UserData,
            2 => MessageCode::ServiceData,
            3 => MessageCode::Leave,
            4 => MessageCode::JoinInit,
            5 => MessageCode::JoinNewMember,
            6 => MessageCode::RemoveNewMember,
            7 => MessageCode::JoinFinalize,
            8 => MessageCode::JoinSuccess,
            10 => MessageCode::InitOk,
            11 => MessageCode::Ping,
            12 => MessageCode::Pong,
            13 => MessageCode::Shuffle,
            14 => MessageCode::ShuffleAnswer,
            15 => MessageCode::ForwardMessage,
            16 => MessageCode::Broadcast,
            17 => MessageCode::IsPeerReachable,
            18 => MessageCode::PeerReachable,
            19 => MessageCode::CanClose,
            20 => MessageCode::DoClose,
            21 => MessageCode::DontClose,
            other => return Err(WireError::UnknownCode(other)),
        };
        Ok(code)
    }
}

impl From<MessageCode> for u8 {
    fn from(code: MessageCode) -> u8 {
        code as u8
    }
}

// ── Envelope header ──────────────────────────────────────────────────────────

/// Header carried by every envelope on every transport channel.
///
/// The header is the only place the code, the sender and the recipient
/// live. Bodies never repeat them.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct EnvelopeHeader {
    /// Envelope format version. A receiver seeing another version drops the envelope.
    pub version: u8,
    /// One of [`MessageCode`].
    pub code: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 2],
    /// Peer that produced the envelope.
    pub sender_id: U32,
    /// Addressed peer, or [`NO_RECIPIENT`].
    pub recipient_id: U32,
}

assert_eq_size!(EnvelopeHeader, [u8; 12]);

pub const HEADER_LEN: usize = std::mem::size_of::<EnvelopeHeader>();

impl EnvelopeHeader {
    pub fn new(code: MessageCode, sender_id: PeerId, recipient_id: PeerId) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            code: code.into(),
            reserved: [0; 2],
            sender_id: U32::new(sender_id),
            recipient_id: U32::new(recipient_id),
        }
    }

    pub fn sender(&self) -> PeerId {
        self.sender_id.get()
    }

    pub fn recipient(&self) -> PeerId {
        self.recipient_id.get()
    }
}

// ── User chunk prefix ────────────────────────────────────────────────────────

/// Set on the last chunk of a user message.
pub const CHUNK_FINAL: u8 = 0x01;
/// Set when the user message was sent with `send` rather than `send_to`.
pub const CHUNK_BROADCAST: u8 = 0x02;

/// Prefix of every USER_DATA body. Chunk bytes follow directly.
///
/// Wire size: 6 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChunkPrefix {
    /// Shared by all chunks of one user message from one sender.
    pub message_id: U16,
    /// Zero-based position of this chunk.
    pub chunk_index: U16,
    /// [`CHUNK_FINAL`] | [`CHUNK_BROADCAST`].
    pub flags: u8,
    /// Payload kind, see [`PayloadKind`].
    pub kind: u8,
}

assert_eq_size!(ChunkPrefix, [u8; 6]);

pub const CHUNK_PREFIX_LEN: usize = std::mem::size_of::<ChunkPrefix>();

/// Concrete representation the sender used for a user payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Text = 0x01,
    Binary = 0x02,
    Number = 0x03,
}

impl TryFrom<u8> for PayloadKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PayloadKind::Text),
            0x02 => Ok(PayloadKind::Binary),
            0x03 => Ok(PayloadKind::Number),
            other => Err(WireError::UnknownPayloadKind(other)),
        }
    }
}

// ── Wrapper prefixes ─────────────────────────────────────────────────────────

/// Prefix of a FORWARD_MESSAGE body. A complete inner envelope follows.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ForwardPrefix {
    /// Final destination of the inner envelope.
    pub dest_id: U32,
    /// Remaining relay hops. An intermediary never forwards at zero.
    pub ttl: u8,
    /// Reserved, must be zero.
    pub reserved: [u8; 3],
}

assert_eq_size!(ForwardPrefix, [u8; 8]);

/// Prefix of a BROADCAST body (Spray only). A complete inner envelope follows.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct BroadcastPrefix {
    /// Peer that originated the broadcast.
    pub origin_id: U32,
    /// Random per-broadcast id chosen by the origin.
    pub broadcast_id: U32,
}

assert_eq_size!(BroadcastPrefix, [u8; 8]);

pub const WRAPPER_PREFIX_LEN: usize = 8;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message code: {0}")]
    UnknownCode(u8),

    #[error("unknown envelope version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("truncated envelope: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("user payload of {0} bytes needs more than 65535 chunks")]
    PayloadTooLarge(usize),

    #[error("unknown payload kind: 0x{0:02x}")]
    UnknownPayloadKind(u8),

    #[error("text payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("number payload must be exactly 8 bytes")]
    InvalidNumber,

    #[error("malformed message body: {0}")]
    Body(String),
}

// ── Tests ────────────────────────────────────────────────────────────────────
