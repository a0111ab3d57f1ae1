//! Transport boundary — byte pipes and the collaborators that produce them.
//!
//! The overlay never establishes connections itself. A [`Connector`] hands
//! it [`RawChannel`]s (to a member behind an access key, or directly to a
//! peer of the same group) and a [`JoinDoor`] hands it the channels of peers
//! joining through this one. The engine wraps each raw channel in a
//! [`TransportChannel`] it owns exclusively.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use netweave_core::{ChannelId, PeerId};

use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("no open door for key {0}")]
    UnknownKey(String),

    #[error("peer {peer_id} is not listening on channel {channel_id}")]
    Refused { channel_id: ChannelId, peer_id: PeerId },

    #[error("transport channel closed")]
    Closed,

    #[error("join door failure: {0}")]
    Door(String),
}

/// What a joiner needs to reach this peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessData {
    pub key: String,
    pub url: String,
}

/// Reported through `ChannelEvent::Closed` when the join door shuts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseEvent {
    pub fn normal(reason: impl Into<String>) -> Self {
        Self {
            code: 1000,
            reason: reason.into(),
            was_clean: true,
        }
    }
}

/// One end of a bidirectional byte pipe. Dropping `tx` closes the pipe for the remote.
#[derive(Debug)]
pub struct RawChannel {
    pub tx: mpsc::UnboundedSender<Bytes>,
    pub rx: mpsc::UnboundedReceiver<Bytes>,
}

impl RawChannel {
    /// Two connected ends.
    pub fn pair() -> (RawChannel, RawChannel) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (RawChannel { tx: a_tx, rx: a_rx }, RawChannel { tx: b_tx, rx: b_rx })
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Reach the member whose door published `key`.
    async fn join(&self, key: &str) -> Result<RawChannel, TransportError>;

    /// Open a direct channel from `from` to `to`, both members of `channel_id`.
    async fn connect(&self, channel_id: ChannelId, from: PeerId, to: PeerId) -> Result<RawChannel, TransportError>;

    /// Start accepting direct channels addressed to `peer_id`.
    fn listen(&self, channel_id: ChannelId, peer_id: PeerId) -> Result<mpsc::UnboundedReceiver<RawChannel>, TransportError>;

    fn unlisten(&self, channel_id: ChannelId, peer_id: PeerId);
}

#[async_trait]
pub trait JoinDoor: Send + Sync + 'static {
    /// Publish an access key. Joiners' channels arrive on the returned receiver.
    async fn open(&self, url: &str) -> Result<(AccessData, mpsc::UnboundedReceiver<RawChannel>), TransportError>;

    async fn close(&self);
}

// ── Engine-owned channel ─────────────────────────────────────────────────────

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// A raw channel annotated with the remote peer id once it is known.
#[derive(Debug)]
pub struct TransportChannel {
    local_id: u64,
    peer_id: AtomicU32,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: watch::Sender<bool>,
    retired: AtomicBool,
}

impl TransportChannel {
    /// Wrap `raw`; the inbound half goes to the receive loop.
    pub fn new(raw: RawChannel) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (closed, _) = watch::channel(false);
        let chan = Arc::new(Self {
            local_id: NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed),
            peer_id: AtomicU32::new(0),
            outbound: Mutex::new(Some(raw.tx)),
            closed,
            retired: AtomicBool::new(false),
        });
        (chan, raw.rx)
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        match self.peer_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_peer_id(&self, id: PeerId) {
        self.peer_id.store(id, Ordering::Release);
    }

    /// Queue `bytes` for the remote. Per-channel order is preserved.
    pub fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// Stop sending and stop the receive loop. Bytes already queued still reach the remote.
    pub fn close(&self) {
        lock(&self.outbound).take();
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Mark as intentionally shut by the engine; its close is not a departure.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub fn same(&self, other: &TransportChannel) -> bool {
        self.local_id == other.local_id
    }
}
