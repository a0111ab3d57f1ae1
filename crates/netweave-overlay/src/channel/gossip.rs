//! Spray upkeep: periodic shuffles and keeping links in line with the view.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use netweave_core::message::ShuffleOffer;
use netweave_core::{ChannelId, KnownPeer, Message, PeerId};

use super::state::{Phase, State};
use super::Inner;
use crate::error::{OverlayError, Result, TimeoutKind};
use crate::transport::TransportChannel;

impl Inner {
    /// One shuffle round with the oldest reachable entry of the view. An
    /// unreachable partner is dropped and the round starts over, aging included.
    pub(super) async fn shuffle(self: &Arc<Self>) -> Result<()> {
        let attempts = {
            let st = self.state();
            if st.phase != Phase::Member {
                return Ok(());
            }
            let Some(spray) = st.topology.spray() else {
                return Ok(());
            };
            spray.known_peers().len() + 1
        };

        for _ in 0..attempts {
            let partner = {
                let mut st = self.state();
                let Some(spray) = st.topology.spray_mut() else {
                    return Ok(());
                };
                spray.age_all();
                match spray.oldest() {
                    Some(partner) => partner,
                    None => return Ok(()),
                }
            };

            if let Err(e) = self.is_peer_reachable(partner).await {
                tracing::info!(peer = partner, error = %e, "shuffle partner unreachable");
                let mut st = self.state();
                if let Some(spray) = st.topology.spray_mut() {
                    spray.on_peer_down(partner, &mut rand::thread_rng());
                }
                self.update_channels(&mut st);
                continue;
            }

            let token = self.next_token();
            let (tx, reply) = oneshot::channel();
            let (my_id, sample) = {
                let mut st = self.state();
                let my_id = st.my_id;
                let Some(spray) = st.topology.spray_mut() else {
                    return Ok(());
                };
                let sample = spray.prepare_offer(my_id, partner, &mut rand::thread_rng());
                let offer = Message::Shuffle(ShuffleOffer {
                    origin: my_id,
                    token,
                    sample: sample.clone(),
                });
                st.shuffle_replies.insert(token, tx);
                let sent = offer
                    .encode(my_id, partner)
                    .map_err(OverlayError::from)
                    .and_then(|bytes| st.deliver(partner, bytes, self.ttl()));
                if let Err(e) = sent {
                    st.shuffle_replies.remove(&token);
                    restore(&mut st, my_id, partner, &sample);
                    return Err(e);
                }
                tracing::debug!(partner, token, sent = sample.len(), "shuffle offered");
                (my_id, sample)
            };

            if let Ok(Ok(())) = timeout(self.config.overlay.can_close_timeout(), reply).await {
                return Ok(());
            }
            let mut st = self.state();
            // The answer may have been merged while we were waking up.
            if st.shuffle_replies.remove(&token).is_none() {
                return Ok(());
            }
            restore(&mut st, my_id, partner, &sample);
            self.update_channels(&mut st);
            return Err(OverlayError::Timeout(TimeoutKind::Shuffle));
        }
        Ok(())
    }

    /// Open channels the view wants and detach the ones it dropped.
    pub(super) fn update_channels(self: &Arc<Self>, st: &mut State) {
        if st.phase != Phase::Member {
            return;
        }
        let Some(spray) = st.topology.spray() else {
            return;
        };
        let linked: BTreeSet<PeerId> = st.links.keys().copied().collect();
        let plan = spray.plan_channels(st.my_id, &linked);

        for id in plan.open {
            if let Some(chan) = st.dormant.remove(&id) {
                tracing::debug!(peer = id, "dormant channel revived");
                st.links.insert(id, chan);
                continue;
            }
            if st.connecting.insert(id) {
                self.spawn_connect(st.channel_id, st.my_id, id);
            }
        }

        for id in plan.detach {
            let Some(chan) = st.links.remove(&id) else {
                continue;
            };
            if st.dormant.contains_key(&id) {
                chan.retire();
                chan.close();
                continue;
            }
            st.dormant.insert(id, chan.clone());
            tracing::debug!(peer = id, "link detached");

            let inner = self.clone();
            tokio::spawn(async move {
                match inner.can_close_over(chan.clone()).await {
                    Ok(true) => {
                        let mut st = inner.state();
                        if st.dormant.get(&id).is_some_and(|c| c.same(&chan)) {
                            st.dormant.remove(&id);
                        }
                        chan.retire();
                        chan.close();
                        tracing::debug!(peer = id, "channel closed by consensus");
                    }
                    Ok(false) => tracing::debug!(peer = id, "peer keeps the channel"),
                    Err(e) => tracing::debug!(peer = id, error = %e, "close consensus failed"),
                }
            });
        }
    }

    fn spawn_connect(self: &Arc<Self>, channel_id: ChannelId, my_id: PeerId, id: PeerId) {
        let inner = self.clone();
        tokio::spawn(async move {
            let raw = inner.connector.connect(channel_id, my_id, id).await;
            let mut st = inner.state();
            st.connecting.remove(&id);
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::debug!(peer = id, error = %e, "neighbour connect failed");
                    return;
                }
            };
            let (chan, rx) = TransportChannel::new(raw);
            chan.set_peer_id(id);
            let wanted = st.phase == Phase::Member
                && st.my_id == my_id
                && st.topology.spray().is_some_and(|s| s.contains(id));
            let hello = Message::InitOk.encode(my_id, id).map_err(OverlayError::from);
            match hello.and_then(|b| Ok(chan.send(b)?)) {
                Ok(()) if wanted => {
                    st.attach_link(id, chan.clone());
                    tracing::debug!(peer = id, "neighbour linked");
                }
                Ok(()) => {
                    chan.retire();
                    chan.close();
                }
                Err(e) => {
                    tracing::debug!(peer = id, error = %e, "neighbour greeting failed");
                    chan.retire();
                    chan.close();
                }
            }
            drop(st);
            inner.spawn_receive(chan, rx);
        });
    }

    pub(super) fn start_shuffle_ticker(self: &Arc<Self>, st: &mut State) {
        if st.topology.spray().is_none() {
            return;
        }
        let Some(period) = self.config.overlay.shuffle_interval() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = inner.shuffle().await {
                    tracing::debug!(error = %e, "periodic shuffle failed");
                }
            }
        });
        if let Some(old) = st.tasks.shuffle.replace(task) {
            old.abort();
        }
    }
}

/// Put an undelivered offer back, mapping our own entries to the partner.
fn restore(st: &mut State, my_id: PeerId, partner: PeerId, offer: &[KnownPeer]) {
    let Some(spray) = st.topology.spray_mut() else {
        return;
    };
    let back: Vec<KnownPeer> = offer
        .iter()
        .map(|k| KnownPeer {
            peer_id: if k.peer_id == my_id { partner } else { k.peer_id },
            peer_age: k.peer_age,
        })
        .collect();
    spray.on_shuffle_end(my_id, &back);
}
