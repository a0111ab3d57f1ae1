//! In-process transport: every peer of a test or simulation shares one
//! [`MemoryNetwork`], and channels are pairs of unbounded mpsc queues.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use netweave_core::{ChannelId, PeerId};

use crate::lock;
use crate::transport::{AccessData, Connector, JoinDoor, RawChannel, TransportError};

#[derive(Default)]
struct Registry {
    doors: DashMap<String, mpsc::UnboundedSender<RawChannel>>,
    listeners: DashMap<(ChannelId, PeerId), mpsc::UnboundedSender<RawChannel>>,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Registry>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<MemoryConnector> {
        Arc::new(MemoryConnector {
            registry: self.registry.clone(),
        })
    }

    /// A door for one peer. Each peer needs its own.
    pub fn door(&self) -> Arc<MemoryDoor> {
        Arc::new(MemoryDoor {
            registry: self.registry.clone(),
            key: Mutex::new(None),
        })
    }

    pub fn open_doors(&self) -> usize {
        self.registry.doors.len()
    }

    pub fn listeners(&self) -> usize {
        self.registry.listeners.len()
    }
}

pub struct MemoryConnector {
    registry: Arc<Registry>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn join(&self, key: &str) -> Result<RawChannel, TransportError> {
        let door = self
            .registry
            .doors
            .get(key)
            .map(|d| d.clone())
            .ok_or_else(|| TransportError::UnknownKey(key.to_string()))?;
        let (local, remote) = RawChannel::pair();
        door.send(remote)
            .map_err(|_| TransportError::UnknownKey(key.to_string()))?;
        Ok(local)
    }

    async fn connect(&self, channel_id: ChannelId, from: PeerId, to: PeerId) -> Result<RawChannel, TransportError> {
        let refused = TransportError::Refused {
            channel_id,
            peer_id: to,
        };
        let listener = self
            .registry
            .listeners
            .get(&(channel_id, to))
            .map(|l| l.clone())
            .ok_or_else(|| refused.clone())?;
        let (local, remote) = RawChannel::pair();
        listener.send(remote).map_err(|_| refused)?;
        tracing::trace!(channel_id, from, to, "memory channel connected");
        Ok(local)
    }

    fn listen(&self, channel_id: ChannelId, peer_id: PeerId) -> Result<mpsc::UnboundedReceiver<RawChannel>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.listeners.insert((channel_id, peer_id), tx);
        Ok(rx)
    }

    fn unlisten(&self, channel_id: ChannelId, peer_id: PeerId) {
        self.registry.listeners.remove(&(channel_id, peer_id));
    }
}

pub struct MemoryDoor {
    registry: Arc<Registry>,
    key: Mutex<Option<String>>,
}

#[async_trait]
impl JoinDoor for MemoryDoor {
    async fn open(&self, url: &str) -> Result<(AccessData, mpsc::UnboundedReceiver<RawChannel>), TransportError> {
        let key = hex::encode(rand::random::<[u8; 8]>());
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry.doors.insert(key.clone(), tx);
        if let Some(old) = lock(&self.key).replace(key.clone()) {
            self.registry.doors.remove(&old);
        }
        Ok((
            AccessData {
                key,
                url: url.to_string(),
            },
            rx,
        ))
    }

    async fn close(&self) {
        if let Some(key) = lock(&self.key).take() {
            self.registry.doors.remove(&key);
        }
    }
}
