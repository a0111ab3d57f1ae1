//! Joining-peer registry.
//!
//! A peer is "joining" from the moment a member learns about it until its
//! JOIN_SUCCESS (or REMOVE_NEW_MEMBER) is processed. Direct channels opened
//! with it in the meantime are parked in `channels_to_add` and adopted into
//! the member set in one step by [`JoiningPeers::finalize`].

use std::collections::HashMap;
use std::sync::Arc;

use netweave_core::PeerId;

use crate::error::{OverlayError, Result};
use crate::transport::TransportChannel;

#[derive(Debug)]
pub struct JoiningPeer {
    pub id: PeerId,
    pub intermediary_id: PeerId,
    /// Channel between the joiner and its intermediary, when this peer is one of the two.
    pub intermediary_channel: Option<Arc<TransportChannel>>,
    pub channels_to_add: Vec<Arc<TransportChannel>>,
}

impl JoiningPeer {
    pub fn add_channel(&mut self, chan: Arc<TransportChannel>) {
        if !self.channels_to_add.iter().any(|c| c.same(&chan)) {
            self.channels_to_add.push(chan);
        }
    }
}

#[derive(Debug, Default)]
pub struct JoiningPeers {
    peers: HashMap<PeerId, JoiningPeer>,
}

impl JoiningPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        id: PeerId,
        intermediary_id: PeerId,
        channel: Option<Arc<TransportChannel>>,
    ) -> Result<&mut JoiningPeer> {
        if self.peers.contains_key(&id) {
            return Err(OverlayError::DuplicateJoiningPeer(id));
        }
        let mut peer = JoiningPeer {
            id,
            intermediary_id,
            intermediary_channel: channel.clone(),
            channels_to_add: Vec::new(),
        };
        if let Some(chan) = channel {
            peer.add_channel(chan);
        }
        Ok(self.peers.entry(id).or_insert(peer))
    }

    pub fn remove(&mut self, id: PeerId) -> Option<JoiningPeer> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Result<&JoiningPeer> {
        self.peers.get(&id).ok_or(OverlayError::JoiningPeerNotFound(id))
    }

    pub fn get_mut(&mut self, id: PeerId) -> Result<&mut JoiningPeer> {
        self.peers
            .get_mut(&id)
            .ok_or(OverlayError::JoiningPeerNotFound(id))
    }

    pub fn has(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    /// True while `my_id` itself is registered, i.e. this peer is mid-join.
    pub fn is_self_joining(&self, my_id: PeerId) -> bool {
        self.has(my_id)
    }

    /// Delete the entry and hand back the channels to adopt.
    pub fn finalize(&mut self, id: PeerId) -> Result<Vec<Arc<TransportChannel>>> {
        self.peers
            .remove(&id)
            .map(|p| p.channels_to_add)
            .ok_or(OverlayError::JoiningPeerNotFound(id))
    }

    /// The joiner that `chan` belongs to, if any.
    pub fn owner_of(&self, chan: &TransportChannel) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.channels_to_add.iter().any(|c| c.same(chan)))
            .map(|p| p.id)
    }

    /// Forget `chan` wherever it is parked.
    pub fn drop_channel(&mut self, chan: &TransportChannel) {
        for peer in self.peers.values_mut() {
            peer.channels_to_add.retain(|c| !c.same(chan));
            if peer
                .intermediary_channel
                .as_ref()
                .is_some_and(|c| c.same(chan))
            {
                peer.intermediary_channel = None;
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.peers.keys().copied()
    }

    /// Remove every entry, returning them.
    pub fn clear(&mut self) -> Vec<JoiningPeer> {
        self.peers.drain().map(|(_, p)| p).collect()
    }
}
