//! Request/reply probes: ping rounds, reachability and close consensus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::timeout;

use netweave_core::message::{PingRound, Probe};
use netweave_core::{Message, PeerId};

use super::state::{Phase, PingState, State};
use super::Inner;
use crate::error::{OverlayError, Result, TimeoutKind};
use crate::transport::TransportChannel;

impl Inner {
    pub(super) async fn ping(self: &Arc<Self>) -> Result<Duration> {
        let limit = self.config.overlay.ping_timeout();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state();
            if st.phase != Phase::Member {
                return Err(OverlayError::NotConnected);
            }
            if st.members.is_empty() {
                return Ok(Duration::ZERO);
            }
            match &mut st.ping {
                Some(ping) => ping.waiters.push(tx),
                None => {
                    let round = self.next_token();
                    let started = Instant::now();
                    // Only a round that went out is registered.
                    st.broadcast(&Message::Ping(PingRound { round }))?;
                    st.ping = Some(PingState {
                        round,
                        started,
                        replied: Default::default(),
                        max_rtt: Duration::ZERO,
                        waiters: vec![tx],
                    });
                    tracing::debug!(round, members = st.members.len(), "ping round started");

                    let weak = Arc::downgrade(self);
                    tokio::spawn(async move {
                        tokio::time::sleep(limit).await;
                        let Some(inner) = weak.upgrade() else { return };
                        let mut st = inner.state();
                        if st.ping.as_ref().is_some_and(|p| p.round == round) {
                            tracing::debug!(round, "ping round timed out");
                            finish(&mut st, limit);
                        }
                    });
                }
            }
        }
        rx.await.map_err(|_| OverlayError::NotConnected)
    }

    pub(super) fn on_pong(&self, from: PeerId, round: u64) {
        let mut st = self.state();
        let Some(ping) = st.ping.as_mut() else {
            return;
        };
        if ping.round != round {
            return;
        }
        if ping.replied.insert(from) {
            ping.max_rtt = ping.max_rtt.max(ping.started.elapsed());
        }
        self.check_ping(&mut st);
    }

    /// Resolve the current round once every remaining member has answered.
    pub(super) fn check_ping(&self, st: &mut State) {
        let Some(ping) = &st.ping else {
            return;
        };
        if st.members.iter().all(|id| ping.replied.contains(id)) {
            let rtt = ping.max_rtt;
            tracing::debug!(round = ping.round, rtt_ms = rtt.as_millis() as u64, "ping round complete");
            finish(st, rtt);
        }
    }

    pub(super) async fn is_peer_reachable(&self, id: PeerId) -> Result<()> {
        let token = self.next_token();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state();
            if st.phase == Phase::Idle {
                return Err(OverlayError::NotConnected);
            }
            let envelope = Message::IsPeerReachable(Probe { token }).encode(st.my_id, id)?;
            st.reach.insert(token, tx);
            if let Err(e) = st.deliver(id, envelope, self.ttl()) {
                st.reach.remove(&token);
                return Err(e);
            }
        }
        match timeout(self.config.overlay.reachability_timeout(), rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(OverlayError::Timeout(TimeoutKind::Reachability)),
            Err(_) => {
                self.state().reach.remove(&token);
                tracing::debug!(peer = id, "reachability probe timed out");
                Err(OverlayError::Timeout(TimeoutKind::Reachability))
            }
        }
    }

    /// Ask the peer at the other end of `chan` whether it may close.
    pub(super) async fn can_close_over(&self, chan: Arc<TransportChannel>) -> Result<bool> {
        let peer = chan.peer_id().ok_or(OverlayError::NotConnected)?;
        let token = self.next_token();
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state();
            let envelope = Message::CanClose(Probe { token }).encode(st.my_id, peer)?;
            st.close_votes.insert(token, tx);
            if let Err(e) = chan.send(envelope) {
                st.close_votes.remove(&token);
                return Err(e.into());
            }
        }
        match timeout(self.config.overlay.can_close_timeout(), rx).await {
            Ok(Ok(close)) => Ok(close),
            Ok(Err(_)) => Err(OverlayError::Timeout(TimeoutKind::CanClose)),
            Err(_) => {
                self.state().close_votes.remove(&token);
                Err(OverlayError::Timeout(TimeoutKind::CanClose))
            }
        }
    }
}

fn finish(st: &mut State, rtt: Duration) {
    if let Some(ping) = st.ping.take() {
        for waiter in ping.waiters {
            let _ = waiter.send(rtt);
        }
    }
}
