//! Spray — gossip-maintained partial view.
//!
//! Pure state: the partial view, the shuffle bookkeeping and the broadcast
//! log. The engine owns the sends, the probes and the channels; randomness
//! is passed in so the exchange rules can be driven deterministically.

use std::collections::{BTreeSet, VecDeque};

use rand::seq::index::sample;
use rand::Rng;

use netweave_core::{KnownPeer, PeerId};

use super::Route;

#[derive(Debug)]
pub struct Spray {
    known: Vec<KnownPeer>,
    log: BroadcastLog,
}

/// Channels to open and channels to detach so links follow the view.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChannelPlan {
    pub open: Vec<PeerId>,
    pub detach: Vec<PeerId>,
}

impl Spray {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            known: Vec::new(),
            log: BroadcastLog::new(log_capacity),
        }
    }

    pub fn known_peers(&self) -> &[KnownPeer] {
        &self.known
    }

    pub fn known_ids(&self) -> BTreeSet<PeerId> {
        self.known.iter().map(|k| k.peer_id).collect()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.known.iter().any(|k| k.peer_id == id)
    }

    /// Introduce `id` with age 0, or refresh it if already present.
    pub fn insert_fresh(&mut self, id: PeerId) {
        match self.known.iter_mut().find(|k| k.peer_id == id) {
            Some(entry) => entry.peer_age = 0,
            None => self.known.push(KnownPeer::fresh(id)),
        }
    }

    pub fn age_all(&mut self) {
        for entry in &mut self.known {
            entry.peer_age = entry.peer_age.saturating_add(1);
        }
    }

    /// Shuffle partner: the entry with the highest age, first one on ties.
    pub fn oldest(&self) -> Option<PeerId> {
        self.known
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.peer_age.cmp(&b.peer_age).then(ib.cmp(ia)))
            .map(|(_, k)| k.peer_id)
    }

    /// Initiator side: build the offer for `partner` and drop what was sent.
    pub fn prepare_offer<R: Rng>(&mut self, self_id: PeerId, partner: PeerId, rng: &mut R) -> Vec<KnownPeer> {
        let size = self.known.len().div_ceil(2).saturating_sub(1);
        let skip = self.known.iter().position(|k| k.peer_id == partner);
        let pool: Vec<KnownPeer> = self
            .known
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != skip)
            .map(|(_, k)| *k)
            .collect();
        let mut offer = draw(&pool, size, rng);
        for entry in &mut offer {
            if entry.peer_id == partner {
                entry.peer_id = self_id;
            }
        }
        offer.push(KnownPeer::fresh(self_id));

        for sent in &offer {
            let local_id = if sent.peer_id == self_id { partner } else { sent.peer_id };
            if let Some(pos) = self.known.iter().position(|k| k.peer_id == local_id) {
                self.known.remove(pos);
            }
        }
        offer
    }

    /// Responder side: answer `origin`'s offer and merge it.
    pub fn on_exchange<R: Rng>(
        &mut self,
        self_id: PeerId,
        origin: PeerId,
        incoming: &[KnownPeer],
        rng: &mut R,
    ) -> Vec<KnownPeer> {
        let size = self.known.len().div_ceil(2);
        let mut answer = draw(&self.known, size, rng);
        for entry in &mut answer {
            if entry.peer_id == origin {
                entry.peer_id = self_id;
            }
        }

        for sent in &answer {
            let local_id = if sent.peer_id == self_id { origin } else { sent.peer_id };
            if let Some(pos) = self
                .known
                .iter()
                .position(|k| k.peer_id == local_id && k.peer_age == sent.peer_age)
            {
                self.known.remove(pos);
            }
        }

        self.merge(self_id, incoming);
        answer
    }

    /// Initiator side: merge the partner's answer.
    pub fn on_shuffle_end(&mut self, self_id: PeerId, incoming: &[KnownPeer]) {
        self.merge(self_id, incoming);
    }

    /// Remove `dead` and, per removed entry, duplicate a survivor with
    /// probability 1 − 1/len so the view keeps its size.
    pub fn on_peer_down<R: Rng>(&mut self, dead: PeerId, rng: &mut R) -> usize {
        let before = self.known.len();
        self.known.retain(|k| k.peer_id != dead);
        let removed = before - self.known.len();

        if self.known.is_empty() {
            return removed;
        }
        for _ in 0..removed {
            let len = self.known.len();
            if rng.gen_bool(1.0 - 1.0 / len as f64) {
                let pick = self.known[rng.gen_range(0..len)].peer_id;
                self.known.push(KnownPeer::fresh(pick));
            }
        }
        removed
    }

    /// Reconcile `linked` against the view. Never detaches the last useful link.
    pub fn plan_channels(&self, self_id: PeerId, linked: &BTreeSet<PeerId>) -> ChannelPlan {
        let mut wanted = self.known_ids();
        wanted.remove(&self_id);

        let open: Vec<PeerId> = wanted.difference(linked).copied().collect();
        let mut detach: Vec<PeerId> = linked.difference(&wanted).copied().collect();
        if linked.intersection(&wanted).next().is_none() && !detach.is_empty() {
            detach.remove(0);
        }
        ChannelPlan { open, detach }
    }

    /// Direct when linked, else through a random linked known peer.
    pub fn route<R: Rng>(&self, dest: PeerId, linked: impl Fn(PeerId) -> bool, rng: &mut R) -> Route {
        if linked(dest) {
            return Route::Direct;
        }
        let relays: Vec<PeerId> = self
            .known_ids()
            .into_iter()
            .filter(|id| *id != dest && linked(*id))
            .collect();
        if relays.is_empty() {
            return Route::Unreachable;
        }
        Route::Relay(relays[rng.gen_range(0..relays.len())])
    }

    /// True the first time a broadcast is seen.
    pub fn record_broadcast(&mut self, origin: PeerId, broadcast_id: u32, inner: &[u8]) -> bool {
        self.log.record(origin, broadcast_id, inner)
    }

    /// Append everything received except our own id. Duplicates are kept so
    /// the entries one side gives up are exactly the entries the other gains.
    fn merge(&mut self, self_id: PeerId, incoming: &[KnownPeer]) {
        self.known
            .extend(incoming.iter().filter(|entry| entry.peer_id != self_id));
    }
}

fn draw<R: Rng>(pool: &[KnownPeer], size: usize, rng: &mut R) -> Vec<KnownPeer> {
    let size = size.min(pool.len());
    sample(rng, pool.len(), size)
        .into_iter()
        .map(|i| pool[i])
        .collect()
}

// ── Broadcast log ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
struct BroadcastRecord {
    origin: PeerId,
    broadcast_id: u32,
    digest: [u8; 32],
}

/// Bounded memory of relayed broadcasts, oldest evicted first.
#[derive(Debug)]
pub struct BroadcastLog {
    records: VecDeque<BroadcastRecord>,
    capacity: usize,
}

impl BroadcastLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, origin: PeerId, broadcast_id: u32, inner: &[u8]) -> bool {
        let record = BroadcastRecord {
            origin,
            broadcast_id,
            digest: *blake3::hash(inner).as_bytes(),
        };
        if self.records.contains(&record) {
            tracing::trace!(
                origin,
                broadcast_id,
                digest = hex::encode(&record.digest[..8]),
                "duplicate broadcast suppressed"
            );
            return false;
        }
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
