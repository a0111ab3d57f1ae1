//! Shared engine state and the routing helpers that only need it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use netweave_core::message::{Broadcast, Forward};
use netweave_core::wire::NO_RECIPIENT;
use netweave_core::{ChannelId, Chunker, Message, PeerId, Reassembler};

use crate::error::{OverlayError, Result};
use crate::joining::JoiningPeers;
use crate::topology::{Route, Topology};
use crate::transport::{AccessData, TransportChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Joining,
    Member,
}

pub(crate) struct PingState {
    pub round: u64,
    pub started: Instant,
    pub replied: BTreeSet<PeerId>,
    pub max_rtt: Duration,
    pub waiters: Vec<oneshot::Sender<Duration>>,
}

#[derive(Default)]
pub(crate) struct Tasks {
    pub door: Option<JoinHandle<()>>,
    pub listen: Option<JoinHandle<()>>,
    pub shuffle: Option<JoinHandle<()>>,
}

pub(crate) struct State {
    pub phase: Phase,
    pub my_id: PeerId,
    pub channel_id: ChannelId,
    pub topology: Topology,
    /// Every other member, linked or not.
    pub members: BTreeSet<PeerId>,
    /// Channels used for sending, one per neighbour.
    pub links: HashMap<PeerId, Arc<TransportChannel>>,
    /// Detached channels still receiving, awaiting close consensus.
    pub dormant: HashMap<PeerId, Arc<TransportChannel>>,
    /// Identified channels whose peer is neither member nor known joiner yet.
    pub pending: Vec<Arc<TransportChannel>>,
    /// Spray members seen joining before their direct channel was identified.
    pub awaiting_link: BTreeSet<PeerId>,
    /// Spray neighbours with a connect in flight.
    pub connecting: BTreeSet<PeerId>,
    pub joining: JoiningPeers,
    pub chunker: Chunker,
    pub reassembler: Reassembler,
    pub last_sweep: Instant,
    pub access: Option<AccessData>,
    pub join_waiter: Option<oneshot::Sender<Result<()>>>,
    pub reach: HashMap<u64, oneshot::Sender<()>>,
    pub close_votes: HashMap<u64, oneshot::Sender<bool>>,
    pub connect_replies: HashMap<PeerId, oneshot::Sender<bool>>,
    pub shuffle_replies: HashMap<u64, oneshot::Sender<()>>,
    pub ping: Option<PingState>,
    pub tasks: Tasks,
}

impl State {
    pub fn new(topology: Topology, chunk_size: usize) -> Self {
        Self {
            phase: Phase::Idle,
            my_id: random_id(),
            channel_id: 0,
            topology,
            members: BTreeSet::new(),
            links: HashMap::new(),
            dormant: HashMap::new(),
            pending: Vec::new(),
            awaiting_link: BTreeSet::new(),
            connecting: BTreeSet::new(),
            joining: JoiningPeers::new(),
            chunker: Chunker::new(chunk_size),
            reassembler: Reassembler::new(),
            last_sweep: Instant::now(),
            access: None,
            join_waiter: None,
            reach: HashMap::new(),
            close_votes: HashMap::new(),
            connect_replies: HashMap::new(),
            shuffle_replies: HashMap::new(),
            ping: None,
            tasks: Tasks::default(),
        }
    }

    /// A random id not used by self, a member, a joiner or any channel.
    pub fn fresh_id(&self) -> PeerId {
        loop {
            let id = random_id();
            let taken = id == self.my_id
                || self.members.contains(&id)
                || self.joining.has(id)
                || self.links.contains_key(&id)
                || self.dormant.contains_key(&id)
                || self.pending.iter().any(|c| c.peer_id() == Some(id));
            if !taken {
                return id;
            }
        }
    }

    /// Any channel that reaches `id` without a relay.
    pub fn direct_channel(&self, id: PeerId) -> Option<&Arc<TransportChannel>> {
        self.links
            .get(&id)
            .or_else(|| self.dormant.get(&id))
            .or_else(|| self.pending.iter().find(|c| c.peer_id() == Some(id)))
    }

    pub fn next_hop(&self, dest: PeerId) -> Option<PeerId> {
        match self
            .topology
            .route(dest, |id| self.links.contains_key(&id), &mut rand::thread_rng())
        {
            Route::Direct => Some(dest),
            Route::Relay(via) => Some(via),
            Route::Unreachable => None,
        }
    }

    /// Send an encoded envelope towards `dest`, wrapping it in FORWARD_MESSAGE
    /// when no direct channel exists.
    pub fn deliver(&self, dest: PeerId, envelope: Bytes, ttl: u8) -> Result<()> {
        if let Some(chan) = self.direct_channel(dest) {
            return Ok(chan.send(envelope)?);
        }

        let via = if let Ok(joiner) = self.joining.get(dest) {
            if let Some(chan) = &joiner.intermediary_channel {
                return Ok(chan.send(envelope)?);
            }
            self.next_hop(joiner.intermediary_id)
                .map(|hop| (hop, self.links.get(&hop).cloned()))
        } else if let Ok(me) = self.joining.get(self.my_id) {
            let chan = me.intermediary_channel.clone();
            if dest == me.intermediary_id {
                let chan = chan.ok_or(OverlayError::Undeliverable(dest))?;
                return Ok(chan.send(envelope)?);
            }
            Some((me.intermediary_id, chan))
        } else {
            self.next_hop(dest)
                .map(|hop| (hop, self.links.get(&hop).cloned()))
        };

        let Some((hop, Some(chan))) = via else {
            return Err(OverlayError::Undeliverable(dest));
        };
        let wrapped = Message::Forward(Forward {
            dest_id: dest,
            ttl,
            inner: envelope,
        })
        .encode(self.my_id, dest)?;
        tracing::debug!(dest, via = hop, ttl, "forwarding");
        Ok(chan.send(wrapped)?)
    }

    /// Send to every member: directly in full mesh, through the dedup
    /// wrapper in Spray.
    pub fn broadcast(&mut self, msg: &Message) -> Result<()> {
        let envelope = msg.encode(self.my_id, NO_RECIPIENT)?;
        let my_id = self.my_id;
        let outgoing = match self.topology.spray_mut() {
            None => envelope,
            Some(spray) => {
                let broadcast_id: u32 = rand::random();
                spray.record_broadcast(my_id, broadcast_id, &envelope);
                Message::Broadcast(Broadcast {
                    origin_id: my_id,
                    broadcast_id,
                    inner: envelope,
                })
                .encode(my_id, NO_RECIPIENT)?
            }
        };
        self.send_links(&outgoing, &[]);
        Ok(())
    }

    /// Send `bytes` on every link except those in `skip`. Spray floods
    /// dormant channels too, since the far side may still count on them.
    pub fn send_links(&self, bytes: &Bytes, skip: &[PeerId]) {
        let dormant = self.topology.spray().map(|_| &self.dormant);
        for (peer, chan) in self.links.iter().chain(dormant.into_iter().flatten()) {
            if skip.contains(peer) {
                continue;
            }
            if let Err(e) = chan.send(bytes.clone()) {
                tracing::debug!(peer, error = %e, "link send failed");
            }
        }
    }

    /// Make `chan` the link for `peer`. An existing link wins; the newcomer goes dormant.
    pub fn attach_link(&mut self, peer: PeerId, chan: Arc<TransportChannel>) {
        chan.set_peer_id(peer);
        match self.links.get(&peer) {
            Some(existing) if existing.same(&chan) => {}
            Some(_) => {
                if self.dormant.contains_key(&peer) {
                    chan.retire();
                    chan.close();
                } else {
                    self.dormant.insert(peer, chan);
                }
            }
            None => {
                self.links.insert(peer, chan);
            }
        }
    }

    /// Remove and return the pending channels identified as `peer`.
    pub fn take_pending(&mut self, peer: PeerId) -> Vec<Arc<TransportChannel>> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|c| c.peer_id() == Some(peer));
        self.pending = kept;
        taken
    }

    /// Every channel the engine currently owns.
    pub fn all_channels(&self) -> Vec<Arc<TransportChannel>> {
        let mut all: Vec<Arc<TransportChannel>> = self
            .links
            .values()
            .chain(self.dormant.values())
            .chain(self.pending.iter())
            .cloned()
            .collect();
        for id in self.joining.ids().collect::<Vec<_>>() {
            if let Ok(joiner) = self.joining.get(id) {
                for chan in joiner.channels_to_add.iter().chain(joiner.intermediary_channel.iter()) {
                    if !all.iter().any(|c| c.same(chan)) {
                        all.push(chan.clone());
                    }
                }
            }
        }
        all
    }
}

fn random_id() -> PeerId {
    loop {
        let id: u32 = rand::random();
        if id != NO_RECIPIENT {
            return id;
        }
    }
}
