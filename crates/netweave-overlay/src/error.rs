use netweave_core::{MessageCode, PeerId, WireError};

use crate::transport::TransportError;

/// A message that broke the protocol. Logged and dropped; the channel it
/// arrived on stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("unknown message code {0}")]
    UnknownCode(u8),

    #[error("CAN_CLOSE arrived inside FORWARD_MESSAGE")]
    ForwardedCanClose,

    #[error("{0:?} cannot travel inside FORWARD_MESSAGE")]
    NotForwardable(MessageCode),

    #[error("forward to peer {dest} ran out of hops")]
    TtlExhausted { dest: PeerId },

    #[error("unexpected {0:?} in this state")]
    UnexpectedMessage(MessageCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Reachability,
    CanClose,
    Join,
    ConnectWith,
    Shuffle,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TimeoutKind::Reachability => "reachability probe",
            TimeoutKind::CanClose => "close consensus",
            TimeoutKind::Join => "join",
            TimeoutKind::ConnectWith => "connect-with",
            TimeoutKind::Shuffle => "shuffle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("join failed: {0}")]
    JoinFailed(String),

    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    #[error("no route to peer {0}")]
    Undeliverable(PeerId),

    #[error("peer {0} is already joining")]
    DuplicateJoiningPeer(PeerId),

    #[error("joining peer {0} not found")]
    JoiningPeerNotFound(PeerId),

    #[error("not connected to a channel")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(WireError),
}

impl From<WireError> for OverlayError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::UnknownCode(code) => OverlayError::Protocol(ProtocolViolation::UnknownCode(code)),
            other => OverlayError::Wire(other),
        }
    }
}

pub type Result<T, E = OverlayError> = std::result::Result<T, E>;
