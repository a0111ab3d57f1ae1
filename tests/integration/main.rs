//! netweave integration test harness.
//!
//! Every test builds its own group of peers on a private
//! [`MemoryNetwork`], so tests run in parallel without interfering.
//! Timeouts are shortened so failure paths finish quickly.
//!
//!   cargo test --test integration

use std::time::Duration;

use anyhow::{bail, Context, Result};

use netweave_core::{NetweaveConfig, PeerId, TopologyKind, UserPayload};
use netweave_overlay::{ChannelEvent, EventStream, MemoryNetwork, WebChannel};

mod membership;
mod messaging;
mod probes;
mod spray;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a condition may take before a test gives up.
pub const SETTLE: Duration = Duration::from_secs(3);

pub struct Peer {
    pub channel: WebChannel,
    pub events: EventStream,
}

/// Defaults with short timeouts and no periodic shuffle.
pub fn test_config(topology: TopologyKind) -> NetweaveConfig {
    let mut config = NetweaveConfig::default();
    config.overlay.topology = topology;
    config.overlay.ping_timeout_ms = 500;
    config.overlay.reachability_timeout_ms = 300;
    config.overlay.can_close_multiplier = 2;
    config.overlay.join_timeout_ms = 2_000;
    config.overlay.shuffle_interval_ms = 0;
    config.signaling.url = "mem://netweave".to_string();
    config
}

pub fn spawn_peer(net: &MemoryNetwork, config: &NetweaveConfig) -> Peer {
    let (channel, events) = WebChannel::builder(net.connector(), net.door())
        .config(config.clone())
        .build();
    Peer { channel, events }
}

/// `n` peers in one channel: the first opens it, the rest join in order.
/// Returns once every peer sees all the others.
pub async fn group(net: &MemoryNetwork, config: &NetweaveConfig, n: usize) -> Result<Vec<Peer>> {
    let peers: Vec<Peer> = (0..n).map(|_| spawn_peer(net, config)).collect();
    let access = peers[0].channel.open().await.context("open failed")?;
    for (i, peer) in peers.iter().enumerate().skip(1) {
        peer.channel
            .join(&access.key)
            .await
            .with_context(|| format!("peer {i} failed to join"))?;
    }
    wait_until("group converged", || {
        peers.iter().all(|p| p.channel.peer_count() == n - 1)
    })
    .await?;
    Ok(peers)
}

/// Poll `cond` every 10ms until it holds or [`SETTLE`] elapses.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for: {what}")
}

/// Next user message on `peer`, skipping membership events.
pub async fn next_message(peer: &mut Peer) -> Result<(PeerId, UserPayload, bool)> {
    let wait = async {
        while let Some(event) = peer.events.recv().await {
            if let ChannelEvent::Message {
                from,
                payload,
                is_broadcast,
            } = event
            {
                return Some((from, payload, is_broadcast));
            }
        }
        None
    };
    tokio::time::timeout(SETTLE, wait)
        .await
        .context("no message in time")?
        .context("event stream ended")
}

/// Every event queued on `peer` right now.
pub fn drain(peer: &mut Peer) -> Vec<ChannelEvent> {
    let mut out = Vec::new();
    while let Ok(event) = peer.events.try_recv() {
        out.push(event);
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// A lone peer is a member of its own channel and pings in zero time.
#[tokio::test]
async fn test_single_peer_channel() {
    let net = MemoryNetwork::new();
    let peer = spawn_peer(&net, &test_config(TopologyKind::FullMesh));

    let access = peer.channel.open().await.unwrap();
    assert!(peer.channel.is_member());
    assert!(peer.channel.is_open());
    assert_eq!(access.url, "mem://netweave");
    assert_ne!(peer.channel.channel_id(), 0);
    assert_eq!(peer.channel.ping().await.unwrap(), Duration::ZERO);
    assert_eq!(net.open_doors(), 1);

    peer.channel.close().await;
    assert!(!peer.channel.is_open());
    assert!(peer.channel.is_member(), "closing the door keeps membership");
    assert_eq!(net.open_doors(), 0);
}
