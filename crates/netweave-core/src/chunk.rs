//! User payload chunking and reassembly.
//!
//! A user payload larger than the configured chunk size travels as several
//! USER_DATA envelopes sharing one message id. The receiver buffers them per
//! `(sender, message_id)` and hands back the payload once the final chunk and
//! every chunk before it are present. Arrival order does not matter.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::UserChunk;
use crate::wire::{PayloadKind, PeerId, WireError};

/// Application data carried by USER_DATA.
#[derive(Debug, Clone, PartialEq)]
pub enum UserPayload {
    Text(String),
    Binary(Bytes),
    Number(f64),
}

impl UserPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            UserPayload::Text(_) => PayloadKind::Text,
            UserPayload::Binary(_) => PayloadKind::Binary,
            UserPayload::Number(_) => PayloadKind::Number,
        }
    }

    fn to_bytes(&self) -> Bytes {
        match self {
            UserPayload::Text(s) => Bytes::copy_from_slice(s.as_bytes()),
            UserPayload::Binary(b) => b.clone(),
            UserPayload::Number(n) => Bytes::copy_from_slice(&n.to_be_bytes()),
        }
    }

    fn from_bytes(kind: PayloadKind, bytes: Bytes) -> Result<Self, WireError> {
        match kind {
            PayloadKind::Text => String::from_utf8(bytes.to_vec())
                .map(UserPayload::Text)
                .map_err(|_| WireError::InvalidUtf8),
            PayloadKind::Binary => Ok(UserPayload::Binary(bytes)),
            PayloadKind::Number => {
                let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| WireError::InvalidNumber)?;
                Ok(UserPayload::Number(f64::from_be_bytes(raw)))
            }
        }
    }
}

impl From<&str> for UserPayload {
    fn from(s: &str) -> Self {
        UserPayload::Text(s.to_string())
    }
}

impl From<String> for UserPayload {
    fn from(s: String) -> Self {
        UserPayload::Text(s)
    }
}

impl From<Vec<u8>> for UserPayload {
    fn from(v: Vec<u8>) -> Self {
        UserPayload::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for UserPayload {
    fn from(b: Bytes) -> Self {
        UserPayload::Binary(b)
    }
}

impl From<f64> for UserPayload {
    fn from(n: f64) -> Self {
        UserPayload::Number(n)
    }
}

// ── Sending side ─────────────────────────────────────────────────────────────

/// Splits user payloads into chunks. One per engine; message ids wrap.
#[derive(Debug)]
pub struct Chunker {
    chunk_size: usize,
    next_message_id: u16,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            next_message_id: rand::random(),
        }
    }

    /// Split `payload` into ordered chunks. An empty payload yields one empty final chunk.
    pub fn split(&mut self, payload: &UserPayload, is_broadcast: bool) -> Result<Vec<UserChunk>, WireError> {
        let bytes = payload.to_bytes();
        let count = bytes.len().div_ceil(self.chunk_size).max(1);
        if count > u16::MAX as usize + 1 {
            return Err(WireError::PayloadTooLarge(bytes.len()));
        }

        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        let kind = payload.kind();

        let chunks = (0..count)
            .map(|i| {
                let start = i * self.chunk_size;
                let end = (start + self.chunk_size).min(bytes.len());
                UserChunk {
                    message_id,
                    index: i as u16,
                    is_final: i + 1 == count,
                    is_broadcast,
                    kind,
                    data: bytes.slice(start..end),
                }
            })
            .collect();
        Ok(chunks)
    }
}

// ── Receiving side ───────────────────────────────────────────────────────────

/// A fully reassembled user message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reassembled {
    pub from: PeerId,
    pub payload: UserPayload,
    pub is_broadcast: bool,
}

#[derive(Debug)]
struct Partial {
    kind: PayloadKind,
    is_broadcast: bool,
    chunks: BTreeMap<u16, Bytes>,
    final_index: Option<u16>,
    started: Instant,
}

impl Partial {
    fn is_complete(&self) -> bool {
        self.final_index
            .is_some_and(|last| self.chunks.len() == last as usize + 1)
    }
}

#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<(PeerId, u16), Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one chunk. Returns the message once it is complete.
    pub fn push(&mut self, from: PeerId, chunk: UserChunk) -> Result<Option<Reassembled>, WireError> {
        if chunk.index == 0 && chunk.is_final {
            let payload = UserPayload::from_bytes(chunk.kind, chunk.data)?;
            return Ok(Some(Reassembled {
                from,
                payload,
                is_broadcast: chunk.is_broadcast,
            }));
        }

        let key = (from, chunk.message_id);
        let entry = self.partial.entry(key).or_insert_with(|| Partial {
            kind: chunk.kind,
            is_broadcast: chunk.is_broadcast,
            chunks: BTreeMap::new(),
            final_index: None,
            started: Instant::now(),
        });
        if chunk.is_final {
            entry.final_index = Some(chunk.index);
        }
        entry.chunks.insert(chunk.index, chunk.data);

        if !entry.is_complete() {
            return Ok(None);
        }

        let Some(done) = self.partial.remove(&key) else {
            return Ok(None);
        };
        let total = done.chunks.values().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for data in done.chunks.values() {
            buf.put_slice(data);
        }
        let payload = UserPayload::from_bytes(done.kind, buf.freeze())?;
        tracing::trace!(peer = from, message_id = chunk.message_id, bytes = total, "user message reassembled");
        Ok(Some(Reassembled {
            from,
            payload,
            is_broadcast: done.is_broadcast,
        }))
    }

    /// Drop partial messages started before `now - max_age`. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.partial.len();
        self.partial
            .retain(|_, p| now.saturating_duration_since(p.started) < max_age);
        before - self.partial.len()
    }

    /// Forget everything buffered from `peer`.
    pub fn forget(&mut self, peer: PeerId) {
        self.partial.retain(|(from, _), _| *from != peer);
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}
