//! WebChannel — the protocol engine behind one peer's membership in a group.
//!
//! Every transport channel gets its own receive task. All of them funnel
//! into [`Inner::on_bytes`], which decodes the envelope and applies it to
//! the shared [`State`] under one mutex. The lock is never held across an
//! await: requests that wait for a reply (join, ping, probes, shuffle)
//! register a oneshot in the state, release the lock and await it with a
//! timeout. Whichever of reply and timeout comes first removes the entry.

mod dispatch;
mod gossip;
mod membership;
mod probes;
mod state;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use netweave_core::message::ServiceData;
use netweave_core::{ChannelId, KnownPeer, Message, NetweaveConfig, PeerId, TopologyKind, UserPayload};

use crate::error::{OverlayError, Result};
use crate::lock;
use crate::service::{ServiceHandler, ServiceRegistry};
use crate::topology::Topology;
use crate::transport::{AccessData, CloseEvent, Connector, JoinDoor, TransportChannel};

pub use membership::CONNECT_WITH;
use state::{Phase, State};

/// What the application hears from its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    PeerJoined(PeerId),
    Message {
        from: PeerId,
        payload: UserPayload,
        is_broadcast: bool,
    },
    PeerLeft(PeerId),
    Closed(CloseEvent),
}

pub type EventStream = mpsc::UnboundedReceiver<ChannelEvent>;

pub(crate) struct Inner {
    config: NetweaveConfig,
    connector: Arc<dyn Connector>,
    door: Arc<dyn JoinDoor>,
    services: ServiceRegistry,
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Mutex<State>,
    tokens: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn next_token(&self) -> u64 {
        self.tokens.fetch_add(1, Ordering::Relaxed)
    }

    fn ttl(&self) -> u8 {
        self.config.overlay.forward_ttl
    }

    fn handle(self: &Arc<Self>) -> WebChannel {
        WebChannel { inner: self.clone() }
    }

    /// Drive `chan` until either side closes it.
    fn spawn_receive(self: &Arc<Self>, chan: Arc<TransportChannel>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut closed = chan.closed_signal();
            loop {
                tokio::select! {
                    msg = rx.recv() => match msg {
                        Some(bytes) => inner.on_bytes(&chan, bytes),
                        None => break,
                    },
                    _ = closed.wait_for(|c| *c) => break,
                }
            }
            inner.on_channel_closed(&chan);
        });
    }
}

// ── Builder ──────────────────────────────────────────────────────────────────

pub struct WebChannelBuilder {
    connector: Arc<dyn Connector>,
    door: Arc<dyn JoinDoor>,
    config: NetweaveConfig,
    services: ServiceRegistry,
}

impl WebChannelBuilder {
    pub fn config(mut self, config: NetweaveConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service(mut self, name: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        self.services.register(name, handler);
        self
    }

    pub fn build(mut self) -> (WebChannel, EventStream) {
        self.services
            .register(CONNECT_WITH, Arc::new(membership::ConnectWithService));
        let overlay = &self.config.overlay;
        let state = State::new(
            Topology::new(overlay.topology, overlay.broadcast_log_capacity),
            overlay.chunk_size,
        );
        let (events, stream) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config: self.config,
            connector: self.connector,
            door: self.door,
            services: self.services,
            events,
            state: Mutex::new(state),
            tokens: AtomicU64::new(1),
        });
        (WebChannel { inner }, stream)
    }
}

// ── Public handle ────────────────────────────────────────────────────────────

/// Cheaply clonable handle on one peer's channel membership.
#[derive(Clone)]
pub struct WebChannel {
    inner: Arc<Inner>,
}

impl WebChannel {
    pub fn builder(connector: Arc<dyn Connector>, door: Arc<dyn JoinDoor>) -> WebChannelBuilder {
        WebChannelBuilder {
            connector,
            door,
            config: NetweaveConfig::default(),
            services: ServiceRegistry::new(),
        }
    }

    /// Open the join door, creating a one-peer channel first if not yet a member.
    pub async fn open(&self) -> Result<AccessData> {
        self.inner.open().await
    }

    /// Close the join door. Membership is unaffected.
    pub async fn close(&self) {
        self.inner.close_door().await
    }

    pub fn is_open(&self) -> bool {
        self.inner.state().access.is_some()
    }

    /// Current access data, or `None` while the door is closed.
    pub fn access(&self) -> Option<AccessData> {
        self.inner.state().access.clone()
    }

    /// Join the channel behind `key`. Resolves once this peer is a member.
    pub async fn join(&self, key: &str) -> Result<()> {
        self.inner.join(key).await
    }

    pub async fn leave(&self) {
        self.inner.leave().await
    }

    /// Broadcast `data` to every member.
    pub fn send(&self, data: impl Into<UserPayload>) -> Result<()> {
        let payload = data.into();
        let mut st = self.inner.state();
        if st.phase != Phase::Member {
            return Err(OverlayError::NotConnected);
        }
        for chunk in st.chunker.split(&payload, true)? {
            st.broadcast(&Message::UserData(chunk))?;
        }
        Ok(())
    }

    /// Send `data` to one member.
    pub fn send_to(&self, id: PeerId, data: impl Into<UserPayload>) -> Result<()> {
        let payload = data.into();
        let mut st = self.inner.state();
        if st.phase != Phase::Member {
            return Err(OverlayError::NotConnected);
        }
        let my_id = st.my_id;
        for chunk in st.chunker.split(&payload, false)? {
            let envelope = Message::UserData(chunk).encode(my_id, id)?;
            st.deliver(id, envelope, self.inner.ttl())?;
        }
        Ok(())
    }

    /// Send JSON `data` to the service named `service` on peer `id`.
    pub fn send_service(&self, id: PeerId, service: &str, data: serde_json::Value) -> Result<()> {
        let st = self.inner.state();
        if st.phase == Phase::Idle {
            return Err(OverlayError::NotConnected);
        }
        let envelope = Message::ServiceData(ServiceData {
            service: service.to_string(),
            data,
        })
        .encode(st.my_id, id)?;
        st.deliver(id, envelope, self.inner.ttl())
    }

    /// Largest round-trip among current members, or the ping timeout if
    /// some did not answer in time. Concurrent calls share one round.
    pub async fn ping(&self) -> Result<std::time::Duration> {
        self.inner.ping().await
    }

    pub async fn is_peer_reachable(&self, id: PeerId) -> Result<()> {
        self.inner.is_peer_reachable(id).await
    }

    /// Ask neighbour `id` whether the channel to it may close. `true` means DO_CLOSE.
    pub async fn can_close(&self, id: PeerId) -> Result<bool> {
        let chan = self
            .inner
            .state()
            .direct_channel(id)
            .cloned()
            .ok_or(OverlayError::Undeliverable(id))?;
        self.inner.can_close_over(chan).await
    }

    /// Run one Spray shuffle round now. No-op in full mesh.
    pub async fn shuffle(&self) -> Result<()> {
        self.inner.shuffle().await
    }

    pub fn my_id(&self) -> PeerId {
        self.inner.state().my_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.inner.state().channel_id
    }

    pub fn is_member(&self) -> bool {
        self.inner.state().phase == Phase::Member
    }

    /// Other members, in id order.
    pub fn members(&self) -> Vec<PeerId> {
        self.inner.state().members.iter().copied().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.state().members.len()
    }

    /// Peers this one holds a usable direct channel to.
    pub fn neighbours(&self) -> BTreeSet<PeerId> {
        self.inner.state().links.keys().copied().collect()
    }

    pub fn topology(&self) -> TopologyKind {
        self.inner.state().topology.kind()
    }

    /// Spray partial view. Empty in full mesh.
    pub fn known_peers(&self) -> Vec<KnownPeer> {
        self.inner
            .state()
            .topology
            .spray()
            .map(|s| s.known_peers().to_vec())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &NetweaveConfig {
        &self.inner.config
    }
}
