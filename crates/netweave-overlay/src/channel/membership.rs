//! Join, leave and departure handling.
//!
//! Accepting side: a channel arriving through the door gets a fresh id,
//! JOIN_INIT, and a `connect_with` request naming the peers the topology
//! wants it linked to. Every other member pre-registers the joiner on
//! JOIN_NEW_MEMBER. Once the joiner reports its channels are up, it gets
//! JOIN_FINALIZE and announces itself with JOIN_SUCCESS.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;

use netweave_core::message::{JoinInit, JoinNewMember, JoinSuccess, Leave, RemoveNewMember, ServiceData};
use netweave_core::{ChannelId, Message, MessageCode, PeerId};

use super::state::Phase;
use super::{ChannelEvent, Inner, WebChannel};
use crate::error::{OverlayError, ProtocolViolation, Result, TimeoutKind};
use crate::service::ServiceHandler;
use crate::topology::Topology;
use crate::transport::{AccessData, CloseEvent, RawChannel, TransportChannel};

/// Service negotiating the joiner's direct channels.
pub const CONNECT_WITH: &str = "connect_with";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ConnectWith {
    Request { peers: Vec<PeerId> },
    Done,
    Failed { reason: String },
}

pub(super) struct ConnectWithService;

impl ServiceHandler for ConnectWithService {
    fn on_message(&self, channel: &WebChannel, from: PeerId, data: serde_json::Value) -> anyhow::Result<()> {
        match serde_json::from_value(data)? {
            ConnectWith::Request { peers } => channel.inner.connect_with(from, peers),
            ConnectWith::Done => channel.inner.on_connect_reply(from, true),
            ConnectWith::Failed { reason } => {
                tracing::warn!(peer = from, %reason, "joiner could not connect");
                channel.inner.on_connect_reply(from, false);
            }
        }
        Ok(())
    }
}

impl Inner {
    // ── Door ─────────────────────────────────────────────────────────────────

    pub(super) async fn open(self: &Arc<Self>) -> Result<AccessData> {
        {
            let mut st = self.state();
            match st.phase {
                Phase::Joining => return Err(OverlayError::JoinFailed("join in progress".into())),
                Phase::Idle => {
                    st.channel_id = loop {
                        let id: ChannelId = rand::random();
                        if id != 0 {
                            break id;
                        }
                    };
                    st.phase = Phase::Member;
                    self.start_listening(&mut st)?;
                    self.start_shuffle_ticker(&mut st);
                    tracing::info!(peer = st.my_id, channel = st.channel_id, topology = %st.topology.kind(), "channel created");
                }
                Phase::Member => {}
            }
            if let Some(access) = &st.access {
                return Ok(access.clone());
            }
        }

        let (access, mut incoming) = self.door.open(&self.config.signaling.url).await?;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(raw) = incoming.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.accept_joiner(raw);
            }
        });

        let mut st = self.state();
        if let Some(old) = st.tasks.door.replace(task) {
            old.abort();
        }
        st.access = Some(access.clone());
        tracing::info!(peer = st.my_id, key = %access.key, "join door open");
        Ok(access)
    }

    pub(super) async fn close_door(&self) {
        let was_open = {
            let mut st = self.state();
            if let Some(task) = st.tasks.door.take() {
                task.abort();
            }
            st.access.take().is_some()
        };
        if was_open {
            self.door.close().await;
            tracing::info!("join door closed");
            self.emit(ChannelEvent::Closed(CloseEvent::normal("join door closed")));
        }
    }

    fn start_listening(self: &Arc<Self>, st: &mut super::State) -> Result<()> {
        let mut incoming = self.connector.listen(st.channel_id, st.my_id)?;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(raw) = incoming.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                let (chan, rx) = TransportChannel::new(raw);
                inner.spawn_receive(chan, rx);
            }
        });
        if let Some(old) = st.tasks.listen.replace(task) {
            old.abort();
        }
        Ok(())
    }

    // ── Accepting side ───────────────────────────────────────────────────────

    fn accept_joiner(self: &Arc<Self>, raw: RawChannel) {
        let (chan, rx) = TransportChannel::new(raw);
        let mut st = self.state();
        if st.phase != Phase::Member {
            tracing::debug!("refusing joiner, not a member");
            chan.close();
            return;
        }

        let id = st.fresh_id();
        let my_id = st.my_id;
        chan.set_peer_id(id);
        if let Err(e) = st.joining.add(id, my_id, Some(chan.clone())) {
            tracing::warn!(peer = id, error = %e, "joiner registration failed");
            chan.close();
            return;
        }

        let mut members: Vec<PeerId> = st.members.iter().copied().collect();
        members.push(my_id);
        let init = Message::JoinInit(JoinInit {
            topology: st.topology.kind(),
            channel_id: st.channel_id,
            members,
        });
        let peers = st.topology.connect_set(my_id, &st.members);
        let request = serde_json::to_value(ConnectWith::Request { peers });

        let sent = init
            .encode(my_id, id)
            .map_err(OverlayError::from)
            .and_then(|b| Ok(chan.send(b)?))
            .and_then(|_| st.broadcast(&Message::JoinNewMember(JoinNewMember { new_id: id })))
            .and_then(|_| {
                let data = request.map_err(|e| OverlayError::JoinFailed(e.to_string()))?;
                let bytes = Message::ServiceData(ServiceData {
                    service: CONNECT_WITH.to_string(),
                    data,
                })
                .encode(my_id, id)?;
                Ok(chan.send(bytes)?)
            });

        let (tx, reply) = oneshot::channel();
        st.connect_replies.insert(id, tx);
        tracing::info!(peer = id, "joiner accepted");
        self.spawn_receive(chan.clone(), rx);
        drop(st);

        if let Err(e) = sent {
            self.reject_joiner(id, &chan, e);
            return;
        }

        let inner = self.clone();
        let wait = self.config.overlay.join_timeout();
        tokio::spawn(async move {
            let refused = match timeout(wait, reply).await {
                Ok(Ok(true)) => None,
                Ok(_) => Some(OverlayError::JoinFailed("joiner could not connect".into())),
                Err(_) => Some(OverlayError::Timeout(TimeoutKind::ConnectWith)),
            };
            if let Some(reason) = refused {
                inner.reject_joiner(id, &chan, reason);
                return;
            }
            let st = inner.state();
            if !st.joining.has(id) {
                return;
            }
            match Message::JoinFinalize.encode(st.my_id, id) {
                Ok(bytes) => {
                    if let Err(e) = chan.send(bytes) {
                        tracing::debug!(peer = id, error = %e, "finalize not sent");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to encode finalize"),
            }
        });
    }

    fn reject_joiner(&self, id: PeerId, chan: &TransportChannel, reason: OverlayError) {
        let mut st = self.state();
        st.connect_replies.remove(&id);
        if let Some(joiner) = st.joining.remove(id) {
            for c in &joiner.channels_to_add {
                c.retire();
                c.close();
            }
        }
        if let Err(e) = st.broadcast(&Message::RemoveNewMember(RemoveNewMember { id })) {
            tracing::debug!(peer = id, error = %e, "removal not announced");
        }
        chan.retire();
        chan.close();
        tracing::warn!(peer = id, error = %reason, "join rolled back");
    }

    fn on_connect_reply(&self, from: PeerId, done: bool) {
        if let Some(waiter) = self.state().connect_replies.remove(&from) {
            let _ = waiter.send(done);
        }
    }

    // ── Joining side ─────────────────────────────────────────────────────────

    pub(super) async fn join(self: &Arc<Self>, key: &str) -> Result<()> {
        if self.state().phase != Phase::Idle {
            return Err(OverlayError::JoinFailed("already in a channel".into()));
        }
        let raw = self.connector.join(key).await?;
        let (chan, rx) = TransportChannel::new(raw);
        let (tx, done) = oneshot::channel();
        {
            let mut st = self.state();
            if st.phase != Phase::Idle {
                chan.close();
                return Err(OverlayError::JoinFailed("already in a channel".into()));
            }
            st.phase = Phase::Joining;
            st.join_waiter = Some(tx);
        }
        self.spawn_receive(chan.clone(), rx);

        match timeout(self.config.overlay.join_timeout(), done).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OverlayError::JoinFailed("join abandoned".into())),
            Err(_) => {
                chan.retire();
                chan.close();
                self.abandon_join(OverlayError::Timeout(TimeoutKind::Join));
                Err(OverlayError::Timeout(TimeoutKind::Join))
            }
        }
    }

    /// Undo a join in progress and resolve `join` with `err`.
    fn abandon_join(&self, err: OverlayError) {
        let mut st = self.state();
        if st.phase != Phase::Joining {
            return;
        }
        for chan in st.all_channels() {
            chan.retire();
            chan.close();
        }
        if st.channel_id != 0 {
            self.connector.unlisten(st.channel_id, st.my_id);
        }
        self.reset(&mut st);
        tracing::warn!(error = %err, "join failed");
        if let Some(waiter) = st.join_waiter.take() {
            let _ = waiter.send(Err(err));
        }
    }

    pub(super) fn on_join_init(self: &Arc<Self>, chan: &Arc<TransportChannel>, from: PeerId, to: PeerId, init: JoinInit) {
        let mut st = self.state();
        if st.phase != Phase::Joining || st.channel_id != 0 {
            tracing::warn!(
                peer = from,
                violation = %ProtocolViolation::UnexpectedMessage(MessageCode::JoinInit),
                "dropping"
            );
            return;
        }
        st.my_id = to;
        st.channel_id = init.channel_id;
        st.topology = Topology::new(init.topology, self.config.overlay.broadcast_log_capacity);
        st.members = init.members.iter().copied().filter(|id| *id != to).collect();
        chan.set_peer_id(from);
        if let Err(e) = st.joining.add(to, from, Some(chan.clone())) {
            tracing::warn!(error = %e, "self registration failed");
            return;
        }
        if let Err(e) = self.start_listening(&mut st) {
            tracing::warn!(error = %e, "cannot accept direct channels");
        }
        tracing::info!(
            id = to,
            intermediary = from,
            channel = init.channel_id,
            topology = %init.topology,
            members = st.members.len(),
            "join initiated"
        );
    }

    /// Open the channels the intermediary asked for, then report back.
    fn connect_with(self: &Arc<Self>, from: PeerId, peers: Vec<PeerId>) {
        let (channel_id, my_id) = {
            let st = self.state();
            let expected = st.joining.get(st.my_id).map(|me| me.intermediary_id);
            if st.phase != Phase::Joining || expected.ok() != Some(from) {
                tracing::warn!(peer = from, "ignoring connect request outside own join");
                return;
            }
            (st.channel_id, st.my_id)
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let mut opened: Vec<Arc<TransportChannel>> = Vec::new();
            let mut failure = None;
            for peer in peers.into_iter().filter(|p| *p != from && *p != my_id) {
                match inner.connector.connect(channel_id, my_id, peer).await {
                    Ok(raw) => {
                        let (chan, rx) = TransportChannel::new(raw);
                        chan.set_peer_id(peer);
                        let hello = Message::InitOk.encode(my_id, peer).map_err(OverlayError::from);
                        if let Err(e) = hello.and_then(|b| Ok(chan.send(b)?)) {
                            failure = Some(e.to_string());
                            break;
                        }
                        {
                            let mut st = inner.state();
                            match st.joining.get_mut(my_id) {
                                Ok(me) => me.add_channel(chan.clone()),
                                Err(e) => {
                                    failure = Some(e.to_string());
                                    break;
                                }
                            }
                        }
                        inner.spawn_receive(chan.clone(), rx);
                        opened.push(chan);
                    }
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            let reply = match &failure {
                None => ConnectWith::Done,
                Some(reason) => {
                    for chan in &opened {
                        chan.retire();
                        chan.close();
                    }
                    ConnectWith::Failed { reason: reason.clone() }
                }
            };
            tracing::debug!(intermediary = from, opened = opened.len(), ok = failure.is_none(), "connect-with finished");
            let sent = serde_json::to_value(reply)
                .map_err(|e| OverlayError::JoinFailed(e.to_string()))
                .and_then(|data| inner.handle().send_service(from, CONNECT_WITH, data));
            if let Err(e) = sent {
                tracing::warn!(error = %e, "connect-with reply not sent");
            }
        });
    }

    pub(super) fn on_join_finalize(self: &Arc<Self>, from: PeerId) {
        let mut st = self.state();
        let my_id = st.my_id;
        if st.phase != Phase::Joining || !st.joining.is_self_joining(my_id) {
            tracing::warn!(
                peer = from,
                violation = %ProtocolViolation::UnexpectedMessage(MessageCode::JoinFinalize),
                "dropping"
            );
            return;
        }
        let channels = match st.joining.finalize(my_id) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "own joining entry vanished");
                return;
            }
        };
        for chan in channels {
            if let Some(peer) = chan.peer_id() {
                st.attach_link(peer, chan);
            }
        }
        let neighbours: Vec<PeerId> = st.links.keys().copied().collect();
        if let Some(spray) = st.topology.spray_mut() {
            for peer in &neighbours {
                spray.insert_fresh(*peer);
            }
        }
        st.phase = Phase::Member;
        if let Err(e) = st.broadcast(&Message::JoinSuccess(JoinSuccess { id: my_id })) {
            tracing::warn!(error = %e, "join success not announced");
        }
        self.start_shuffle_ticker(&mut st);
        tracing::info!(id = my_id, members = st.members.len(), neighbours = neighbours.len(), "joined channel");
        if let Some(waiter) = st.join_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    // ── Existing members ─────────────────────────────────────────────────────

    pub(super) fn on_join_new_member(&self, intermediary: PeerId, new_id: PeerId) {
        let mut st = self.state();
        if new_id == st.my_id || st.members.contains(&new_id) {
            return;
        }
        let parked = st.take_pending(new_id);
        match st.joining.add(new_id, intermediary, None) {
            Ok(joiner) => {
                for chan in parked {
                    joiner.add_channel(chan);
                }
            }
            Err(e) => {
                tracing::debug!(peer = new_id, error = %e, "joiner already registered");
                if let Ok(joiner) = st.joining.get_mut(new_id) {
                    for chan in parked {
                        joiner.add_channel(chan);
                    }
                }
            }
        }
        tracing::debug!(peer = new_id, intermediary, "joiner announced");
    }

    pub(super) fn on_remove_new_member(&self, id: PeerId) {
        let mut st = self.state();
        let mut dropped = st.take_pending(id);
        if let Some(joiner) = st.joining.remove(id) {
            dropped.extend(joiner.channels_to_add);
        }
        for chan in dropped {
            chan.retire();
            chan.close();
        }
        tracing::info!(peer = id, "join cancelled");
    }

    pub(super) fn on_join_success(self: &Arc<Self>, id: PeerId) {
        let mut st = self.state();
        if id == st.my_id || st.members.contains(&id) {
            return;
        }
        let mut channels = st.joining.finalize(id).unwrap_or_default();
        channels.extend(st.take_pending(id));
        for chan in channels {
            st.attach_link(id, chan);
        }
        st.members.insert(id);
        let linked = st.links.contains_key(&id);
        if let Some(spray) = st.topology.spray_mut() {
            if linked {
                spray.insert_fresh(id);
            }
        }
        if !linked && st.topology.spray().is_some() {
            st.awaiting_link.insert(id);
        }
        tracing::info!(peer = id, members = st.members.len(), linked, "peer joined");
        self.emit(ChannelEvent::PeerJoined(id));
    }

    /// A freshly connected channel identifies its sender.
    pub(super) fn on_init_ok(&self, chan: &Arc<TransportChannel>, from: PeerId) {
        chan.set_peer_id(from);
        let mut st = self.state();
        if let Ok(joiner) = st.joining.get_mut(from) {
            joiner.add_channel(chan.clone());
        } else if st.members.contains(&from) {
            st.attach_link(from, chan.clone());
            if st.awaiting_link.remove(&from) {
                if let Some(spray) = st.topology.spray_mut() {
                    spray.insert_fresh(from);
                }
            }
        } else if !st.pending.iter().any(|c| c.same(chan)) {
            st.pending.push(chan.clone());
        }
        tracing::debug!(peer = from, "direct channel identified");
    }

    // ── Departures ───────────────────────────────────────────────────────────

    /// Remove `id` from the group. Fires `PeerLeft` only if it was a member.
    pub(super) fn depart(self: &Arc<Self>, st: &mut super::State, id: PeerId, announce: bool) {
        for chan in [st.links.remove(&id), st.dormant.remove(&id)].into_iter().flatten() {
            chan.retire();
            chan.close();
        }
        st.awaiting_link.remove(&id);
        if !st.members.remove(&id) {
            return;
        }
        st.reassembler.forget(id);
        tracing::info!(peer = id, members = st.members.len(), "peer left");
        self.emit(ChannelEvent::PeerLeft(id));
        self.check_ping(st);

        let Some(spray) = st.topology.spray_mut() else {
            return;
        };
        let removed = spray.on_peer_down(id, &mut rand::thread_rng());
        tracing::debug!(peer = id, removed, view = spray.known_peers().len(), "partial view repaired");
        if announce {
            if let Err(e) = st.broadcast(&Message::Leave(Leave { id })) {
                tracing::debug!(peer = id, error = %e, "departure not announced");
            }
        }
        self.update_channels(st);
    }

    pub(super) fn on_channel_closed(self: &Arc<Self>, chan: &Arc<TransportChannel>) {
        let mut st = self.state();

        let via_intermediary = st
            .joining
            .get(st.my_id)
            .ok()
            .and_then(|me| me.intermediary_channel.as_ref())
            .is_some_and(|c| c.same(chan));
        if st.phase == Phase::Joining && (via_intermediary || st.channel_id == 0) && !chan.is_retired() {
            drop(st);
            self.abandon_join(OverlayError::JoinFailed("intermediary closed the channel".into()));
            return;
        }

        st.pending.retain(|c| !c.same(chan));
        let owner = st.joining.owner_of(chan);
        if let Some(joiner) = owner {
            let intermediary_of = st
                .joining
                .get(joiner)
                .ok()
                .and_then(|j| j.intermediary_channel.as_ref())
                .is_some_and(|c| c.same(chan));
            st.joining.drop_channel(chan);
            if intermediary_of {
                if let Some(waiter) = st.connect_replies.remove(&joiner) {
                    let _ = waiter.send(false);
                }
            }
        }

        if chan.is_retired() {
            return;
        }
        let Some(peer) = chan.peer_id() else {
            return;
        };
        let spray = st.topology.spray().is_some();
        if st.links.get(&peer).is_some_and(|c| c.same(chan)) {
            st.links.remove(&peer);
            tracing::info!(peer, "neighbour channel closed");
            self.depart(&mut st, peer, spray);
        } else if st.dormant.get(&peer).is_some_and(|c| c.same(chan)) {
            st.dormant.remove(&peer);
            if st.members.contains(&peer) && !st.links.contains_key(&peer) {
                tracing::info!(peer, "dormant channel closed");
                self.depart(&mut st, peer, spray);
            }
        }
    }

    // ── Leaving ──────────────────────────────────────────────────────────────

    pub(super) async fn leave(self: &Arc<Self>) {
        {
            let mut st = self.state();
            if st.phase == Phase::Idle {
                return;
            }
            if st.topology.spray().is_none() {
                let my_id = st.my_id;
                match Message::Leave(Leave { id: my_id }).encode(my_id, netweave_core::wire::NO_RECIPIENT) {
                    Ok(bytes) => st.send_links(&bytes, &[]),
                    Err(e) => tracing::warn!(error = %e, "failed to encode leave"),
                }
            }
            for chan in st.all_channels() {
                chan.retire();
                chan.close();
            }
            if st.channel_id != 0 {
                self.connector.unlisten(st.channel_id, st.my_id);
            }
            tracing::info!(peer = st.my_id, channel = st.channel_id, "left channel");
            self.reset(&mut st);
            if let Some(waiter) = st.join_waiter.take() {
                let _ = waiter.send(Err(OverlayError::JoinFailed("left before joining".into())));
            }
        }
        self.close_door().await;
    }

    /// Back to a fresh, unconnected peer. The door task is left to `close_door`.
    fn reset(&self, st: &mut super::State) {
        st.links.clear();
        st.dormant.clear();
        st.pending.clear();
        st.awaiting_link.clear();
        st.connecting.clear();
        st.joining.clear();
        st.members.clear();
        st.reach.clear();
        st.close_votes.clear();
        st.connect_replies.clear();
        st.shuffle_replies.clear();
        st.ping = None;
        st.reassembler = netweave_core::Reassembler::new();
        st.topology = Topology::new(self.config.overlay.topology, self.config.overlay.broadcast_log_capacity);
        st.phase = Phase::Idle;
        st.channel_id = 0;
        if let Some(task) = st.tasks.listen.take() {
            task.abort();
        }
        if let Some(task) = st.tasks.shuffle.take() {
            task.abort();
        }
    }
}
