//! Inbound dispatch: one exhaustive match over [`Message`].

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use netweave_core::message::{decode_header, Probe, ShuffleAnswer};
use netweave_core::wire::NO_RECIPIENT;
use netweave_core::{Envelope, Message, MessageCode, PeerId};

use super::state::Phase;
use super::{ChannelEvent, Inner};
use crate::error::{OverlayError, ProtocolViolation};
use crate::transport::TransportChannel;

/// How an envelope reached this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Arrival {
    /// Straight off a channel from its sender.
    Direct,
    /// Unwrapped from FORWARD_MESSAGE or BROADCAST.
    Unwrapped,
}

impl Inner {
    pub(super) fn on_bytes(self: &Arc<Self>, chan: &Arc<TransportChannel>, bytes: Bytes) {
        match Envelope::decode(&bytes) {
            Ok(env) => {
                tracing::trace!(
                    code = ?env.header.code,
                    from = env.sender(),
                    to = env.recipient(),
                    len = bytes.len(),
                    "envelope received"
                );
                self.dispatch(chan, env, bytes, Arrival::Direct);
            }
            Err(e) => {
                let err = OverlayError::from(e);
                tracing::warn!(peer = ?chan.peer_id(), error = %err, "dropping undecodable envelope");
            }
        }
    }

    fn dispatch(self: &Arc<Self>, chan: &Arc<TransportChannel>, env: Envelope, raw: Bytes, arrival: Arrival) {
        let from = env.sender();
        let to = env.recipient();

        match env.message {
            Message::UserData(chunk) => {
                if self.reroute(to, &raw) {
                    return;
                }
                let mut st = self.state();
                let now = Instant::now();
                let max_age = self.config.overlay.reassembly_timeout();
                if now.duration_since(st.last_sweep) >= max_age {
                    let dropped = st.reassembler.sweep(now, max_age);
                    if dropped > 0 {
                        tracing::debug!(dropped, "stale partial messages dropped");
                    }
                    st.last_sweep = now;
                }
                match st.reassembler.push(from, chunk) {
                    Ok(Some(done)) => self.emit(ChannelEvent::Message {
                        from: done.from,
                        payload: done.payload,
                        is_broadcast: done.is_broadcast,
                    }),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(peer = from, error = %e, "dropping malformed user chunk"),
                }
            }

            Message::ServiceData(sd) => {
                if self.reroute(to, &raw) {
                    return;
                }
                if !self.services.dispatch(&self.handle(), &sd.service, from, sd.data) {
                    tracing::warn!(service = %sd.service, peer = from, "no handler for service");
                }
            }

            Message::Leave(leave) => {
                let mut st = self.state();
                if leave.id == st.my_id {
                    return;
                }
                tracing::info!(peer = leave.id, "peer announced departure");
                self.depart(&mut st, leave.id, false);
            }

            Message::JoinInit(init) => self.on_join_init(chan, from, to, init),
            Message::JoinNewMember(m) => self.on_join_new_member(from, m.new_id),
            Message::RemoveNewMember(m) => self.on_remove_new_member(m.id),
            Message::JoinFinalize => self.on_join_finalize(from),
            Message::JoinSuccess(s) => self.on_join_success(s.id),
            Message::InitOk => self.on_init_ok(chan, from),

            Message::Ping(round) => {
                let st = self.state();
                if st.phase != Phase::Member || from == st.my_id {
                    return;
                }
                drop(st);
                self.reply(chan, arrival, from, Message::Pong(round));
            }
            Message::Pong(round) => self.on_pong(from, round.round),

            Message::Shuffle(offer) => {
                let mut st = self.state();
                let my_id = st.my_id;
                let Some(spray) = st.topology.spray_mut() else {
                    tracing::warn!(
                        violation = %ProtocolViolation::UnexpectedMessage(MessageCode::Shuffle),
                        "shuffle offer outside Spray"
                    );
                    return;
                };
                let sample = spray.on_exchange(my_id, offer.origin, &offer.sample, &mut rand::thread_rng());
                tracing::debug!(partner = offer.origin, sent = sample.len(), received = offer.sample.len(), "shuffle answered");
                let answer = Message::ShuffleAnswer(ShuffleAnswer {
                    token: offer.token,
                    sample,
                });
                match answer.encode(my_id, from) {
                    Ok(bytes) => {
                        if let Err(e) = st.deliver(from, bytes, self.ttl()) {
                            tracing::debug!(peer = from, error = %e, "shuffle answer undeliverable");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode shuffle answer"),
                }
                self.update_channels(&mut st);
            }
            Message::ShuffleAnswer(answer) => {
                let mut st = self.state();
                let Some(waiter) = st.shuffle_replies.remove(&answer.token) else {
                    tracing::debug!(peer = from, token = answer.token, "stale shuffle answer dropped");
                    return;
                };
                let my_id = st.my_id;
                let Some(spray) = st.topology.spray_mut() else {
                    return;
                };
                spray.on_shuffle_end(my_id, &answer.sample);
                let _ = waiter.send(());
                self.update_channels(&mut st);
            }

            Message::Forward(fwd) => self.on_forward(chan, fwd.dest_id, fwd.ttl, fwd.inner),
            Message::Broadcast(bc) => self.on_broadcast(chan, bc.origin_id, bc.broadcast_id, raw, bc.inner),

            Message::IsPeerReachable(probe) => {
                self.reply(chan, arrival, from, Message::PeerReachable(probe));
            }
            Message::PeerReachable(probe) => {
                if let Some(waiter) = self.state().reach.remove(&probe.token) {
                    let _ = waiter.send(());
                }
            }

            Message::CanClose(probe) => {
                if arrival != Arrival::Direct || chan.peer_id() != Some(from) {
                    tracing::warn!(peer = from, violation = %ProtocolViolation::ForwardedCanClose, "dropping");
                    return;
                }
                self.on_can_close(chan, from, probe);
            }
            Message::DoClose(probe) => self.on_close_vote(probe, true),
            Message::DontClose(probe) => self.on_close_vote(probe, false),
        }
    }

    /// Pass along a user or service envelope addressed to someone else.
    fn reroute(&self, to: PeerId, raw: &Bytes) -> bool {
        let st = self.state();
        if to == NO_RECIPIENT || to == st.my_id {
            return false;
        }
        if let Err(e) = st.deliver(to, raw.clone(), self.ttl()) {
            tracing::debug!(dest = to, error = %e, "reroute failed");
        }
        true
    }

    /// Answer on the arrival channel when it leads straight to `to`, else route.
    pub(super) fn reply(&self, chan: &TransportChannel, arrival: Arrival, to: PeerId, msg: Message) {
        let st = self.state();
        let bytes = match msg.encode(st.my_id, to) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode reply");
                return;
            }
        };
        let result = if arrival == Arrival::Direct && chan.peer_id() == Some(to) {
            chan.send(bytes).map_err(OverlayError::from)
        } else {
            st.deliver(to, bytes, self.ttl())
        };
        if let Err(e) = result {
            tracing::debug!(peer = to, code = ?msg.code(), error = %e, "reply undeliverable");
        }
    }

    fn on_forward(self: &Arc<Self>, chan: &Arc<TransportChannel>, dest: PeerId, ttl: u8, inner: Bytes) {
        let header = match decode_header(&inner) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %OverlayError::from(e), "dropping forward with bad inner envelope");
                return;
            }
        };
        let violation = match header.code {
            MessageCode::CanClose => Some(ProtocolViolation::ForwardedCanClose),
            code if !code.is_forwardable() => Some(ProtocolViolation::NotForwardable(code)),
            _ => None,
        };
        if let Some(v) = violation {
            tracing::warn!(from = header.sender_id, dest, violation = %v, "dropping forward");
            return;
        }

        let my_id = self.state().my_id;
        if dest == my_id {
            match Envelope::decode(&inner) {
                Ok(env) => self.dispatch(chan, env, inner, Arrival::Unwrapped),
                Err(e) => tracing::warn!(error = %OverlayError::from(e), "dropping forwarded envelope"),
            }
            return;
        }
        if ttl == 0 {
            tracing::warn!(violation = %ProtocolViolation::TtlExhausted { dest }, "dropping forward");
            return;
        }
        if let Err(e) = self.state().deliver(dest, inner, ttl - 1) {
            tracing::debug!(dest, error = %e, "relay failed");
        }
    }

    fn on_broadcast(
        self: &Arc<Self>,
        chan: &Arc<TransportChannel>,
        origin: PeerId,
        broadcast_id: u32,
        raw: Bytes,
        inner: Bytes,
    ) {
        {
            let mut st = self.state();
            if origin == st.my_id {
                return;
            }
            let Some(spray) = st.topology.spray_mut() else {
                tracing::warn!(
                    violation = %ProtocolViolation::UnexpectedMessage(MessageCode::Broadcast),
                    "broadcast wrapper outside Spray"
                );
                return;
            };
            if !spray.record_broadcast(origin, broadcast_id, &inner) {
                return;
            }
            let prev = chan.peer_id().unwrap_or(NO_RECIPIENT);
            st.send_links(&raw, &[origin, prev]);
        }

        let env = match Envelope::decode(&inner) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(origin, error = %OverlayError::from(e), "dropping broadcast payload");
                return;
            }
        };
        match env.header.code {
            MessageCode::UserData
            | MessageCode::Leave
            | MessageCode::JoinNewMember
            | MessageCode::RemoveNewMember
            | MessageCode::JoinSuccess
            | MessageCode::Ping => self.dispatch(chan, env, inner, Arrival::Unwrapped),
            code => tracing::warn!(
                origin,
                violation = %ProtocolViolation::UnexpectedMessage(code),
                "dropping broadcast payload"
            ),
        }
    }

    fn on_can_close(&self, chan: &Arc<TransportChannel>, from: PeerId, probe: Probe) {
        let mut st = self.state();
        let still_wanted = match st.topology.spray() {
            Some(spray) => spray.contains(from),
            None => st.links.contains_key(&from),
        };
        let answer = if still_wanted {
            Message::DontClose(probe)
        } else {
            if st.links.get(&from).is_some_and(|c| c.same(chan)) {
                st.links.remove(&from);
            }
            if st.dormant.get(&from).is_some_and(|c| c.same(chan)) {
                st.dormant.remove(&from);
            }
            chan.retire();
            Message::DoClose(probe)
        };
        tracing::debug!(peer = from, close = !still_wanted, "close consensus answered");
        match answer.encode(st.my_id, from) {
            Ok(bytes) => {
                if let Err(e) = chan.send(bytes) {
                    tracing::debug!(peer = from, error = %e, "close vote not sent");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode close vote"),
        }
    }

    fn on_close_vote(&self, probe: Probe, close: bool) {
        if let Some(waiter) = self.state().close_votes.remove(&probe.token) {
            let _ = waiter.send(close);
        }
    }
}
