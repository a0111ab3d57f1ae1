//! netweave-sim — run a group of in-process peers and exercise the overlay.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::join_all;

use netweave_core::{NetweaveConfig, TopologyKind};
use netweave_overlay::{ChannelEvent, EventStream, MemoryNetwork, WebChannel};

struct Peer {
    channel: WebChannel,
    events: EventStream,
}

fn spawn_peer(network: &MemoryNetwork, config: &NetweaveConfig) -> Peer {
    let (channel, events) = WebChannel::builder(network.connector(), network.door())
        .config(config.clone())
        .build();
    Peer { channel, events }
}

/// Drain whatever events are already queued.
fn drain(peer: &mut Peer) -> Vec<ChannelEvent> {
    let mut out = Vec::new();
    while let Ok(event) = peer.events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = NetweaveConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NetweaveConfig::default()
    });

    let count: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("peer count must be a number")?,
        None => 5,
    };
    if count < 2 {
        bail!("need at least two peers");
    }
    tracing::info!(peers = count, topology = %config.overlay.topology, "netweave-sim starting");

    let network = MemoryNetwork::new();
    let mut peers: Vec<Peer> = (0..count).map(|_| spawn_peer(&network, &config)).collect();

    let access = peers[0].channel.open().await.context("first peer failed to open")?;
    tracing::info!(key = %access.key, creator = peers[0].channel.my_id(), "channel open");

    for (i, peer) in peers.iter().enumerate().skip(1) {
        peer.channel
            .join(&access.key)
            .await
            .with_context(|| format!("peer {i} failed to join"))?;
        tracing::info!(peer = peer.channel.my_id(), members = peer.channel.peer_count(), "joined");
    }
    peers[0].channel.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for peer in &peers {
        tracing::info!(
            peer = peer.channel.my_id(),
            members = ?peer.channel.members(),
            neighbours = ?peer.channel.neighbours(),
            "membership"
        );
    }

    let last = peers.len() - 1;
    peers[last]
        .channel
        .send(format!("hello from {}", peers[last].channel.my_id()))
        .context("broadcast failed")?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer in peers.iter_mut() {
        let received = drain(peer)
            .into_iter()
            .filter(|e| matches!(e, ChannelEvent::Message { .. }))
            .count();
        tracing::info!(peer = peer.channel.my_id(), received, "broadcast delivered");
    }

    let rtts = join_all(peers.iter().map(|p| p.channel.ping())).await;
    for (peer, rtt) in peers.iter().zip(rtts) {
        match rtt {
            Ok(rtt) => tracing::info!(peer = peer.channel.my_id(), rtt_us = rtt.as_micros() as u64, "ping"),
            Err(e) => tracing::warn!(peer = peer.channel.my_id(), error = %e, "ping failed"),
        }
    }

    if config.overlay.topology == TopologyKind::Spray {
        for peer in &peers {
            if let Err(e) = peer.channel.shuffle().await {
                tracing::warn!(peer = peer.channel.my_id(), error = %e, "shuffle failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        for peer in &peers {
            let view: Vec<_> = peer.channel.known_peers().iter().map(|k| k.peer_id).collect();
            tracing::info!(peer = peer.channel.my_id(), ?view, "partial view");
        }
    }

    for peer in &peers {
        peer.channel.leave().await;
    }
    tracing::info!("netweave-sim done");
    Ok(())
}
