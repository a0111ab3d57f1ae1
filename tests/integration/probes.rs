use crate::*;

use std::time::Instant;

use bytes::Bytes;
use netweave_core::message::{Forward, JoinSuccess, Probe};
use netweave_core::{Chunker, Envelope, Message};
use netweave_overlay::{Connector, OverlayError, RawChannel, TimeoutKind};

/// Id used by the hand-driven outsider in these tests.
const OUTSIDER: PeerId = 0x0bad_f00d;

/// A raw channel into `peer` that identifies itself as [`OUTSIDER`].
async fn outsider(net: &MemoryNetwork, peer: &Peer) -> RawChannel {
    let raw = net
        .connector()
        .connect(peer.channel.channel_id(), OUTSIDER, peer.channel.my_id())
        .await
        .unwrap();
    let hello = Message::InitOk.encode(OUTSIDER, peer.channel.my_id()).unwrap();
    raw.tx.send(hello).unwrap();
    raw
}

async fn next_envelope(raw: &mut RawChannel) -> Envelope {
    let bytes = tokio::time::timeout(SETTLE, raw.rx.recv())
        .await
        .expect("no envelope in time")
        .expect("channel closed");
    Envelope::decode(&bytes).unwrap()
}

fn user_text(from: PeerId, to: PeerId, text: &str) -> Bytes {
    let mut chunks = Chunker::new(1024).split(&UserPayload::from(text), false).unwrap();
    Message::UserData(chunks.remove(0)).encode(from, to).unwrap()
}

#[tokio::test]
async fn test_ping_reports_round_trip() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 3).await.unwrap();

    let (a, b) = tokio::join!(peers[0].channel.ping(), peers[0].channel.ping());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b, "concurrent pings share one round");
    assert!(a < config.overlay.ping_timeout());
}

#[tokio::test]
async fn test_reachability_of_member() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 2).await.unwrap();

    peers[0]
        .channel
        .is_peer_reachable(peers[1].channel.my_id())
        .await
        .unwrap();
    let err = peers[0].channel.is_peer_reachable(0x7777).await.unwrap_err();
    assert!(matches!(err, OverlayError::Undeliverable(0x7777)));
}

/// A silent peer fails the probe after the configured timeout, not before.
#[tokio::test]
async fn test_reachability_times_out_on_silent_peer() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 2).await.unwrap();
    let mut raw = outsider(&net, &peers[0]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let err = peers[0].channel.is_peer_reachable(OUTSIDER).await.unwrap_err();
    let waited = started.elapsed();

    assert!(matches!(err, OverlayError::Timeout(TimeoutKind::Reachability)));
    let limit = config.overlay.reachability_timeout();
    assert!(waited >= limit, "gave up early after {waited:?}");
    assert!(waited < limit + Duration::from_millis(500), "took {waited:?}");

    let probe = next_envelope(&mut raw).await;
    assert!(matches!(probe.message, Message::IsPeerReachable(_)));
}

/// CAN_CLOSE is only honoured straight from the asking neighbour.
#[tokio::test]
async fn test_forwarded_can_close_is_dropped() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 2).await.unwrap();
    let target = peers[0].channel.my_id();
    let mut raw = outsider(&net, &peers[0]).await;

    let inner = Message::CanClose(Probe { token: 1 }).encode(OUTSIDER, target).unwrap();
    let forwarded = Message::Forward(Forward {
        dest_id: target,
        ttl: 4,
        inner,
    })
    .encode(OUTSIDER, target)
    .unwrap();
    raw.tx.send(forwarded).unwrap();

    let direct = Message::IsPeerReachable(Probe { token: 2 }).encode(OUTSIDER, target).unwrap();
    raw.tx.send(direct).unwrap();

    let reply = next_envelope(&mut raw).await;
    assert_eq!(reply.message, Message::PeerReachable(Probe { token: 2 }));
    assert_eq!(reply.recipient(), OUTSIDER);
}

#[tokio::test]
async fn test_forward_is_relayed_to_destination() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let mut peers = group(&net, &config, 2).await.unwrap();
    let relay = peers[0].channel.my_id();
    let dest = peers[1].channel.my_id();
    let raw = outsider(&net, &peers[0]).await;

    for (ttl, text) in [(0u8, "expired"), (3, "via relay")] {
        let forwarded = Message::Forward(Forward {
            dest_id: dest,
            ttl,
            inner: user_text(OUTSIDER, dest, text),
        })
        .encode(OUTSIDER, relay)
        .unwrap();
        raw.tx.send(forwarded).unwrap();
    }

    let (from, payload, is_broadcast) = next_message(&mut peers[1]).await.unwrap();
    assert_eq!(from, OUTSIDER);
    assert_eq!(payload, UserPayload::Text("via relay".into()));
    assert!(!is_broadcast);
}

/// A neighbour that still wants the link votes to keep it.
#[tokio::test]
async fn test_can_close_kept_link() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 2).await.unwrap();

    let close = peers[0].channel.can_close(peers[1].channel.my_id()).await.unwrap();
    assert!(!close);
    assert!(peers[0].channel.neighbours().contains(&peers[1].channel.my_id()));
}

/// A member that never answers makes the round settle on the timeout, and
/// the next round starts fresh.
#[tokio::test]
async fn test_ping_falls_back_to_timeout_on_silent_member() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 2).await.unwrap();
    let host = peers[0].channel.my_id();
    let mut raw = outsider(&net, &peers[0]).await;
    let joined = Message::JoinSuccess(JoinSuccess { id: OUTSIDER })
        .encode(OUTSIDER, netweave_core::wire::NO_RECIPIENT)
        .unwrap();
    raw.tx.send(joined).unwrap();
    wait_until("outsider counted as member", || {
        peers[0].channel.members().contains(&OUTSIDER)
    })
    .await
    .unwrap();

    let limit = config.overlay.ping_timeout();
    let started = Instant::now();
    let rtt = peers[0].channel.ping().await.unwrap();
    assert_eq!(rtt, limit);
    assert!(started.elapsed() >= limit, "resolved early after {:?}", started.elapsed());

    let silent = loop {
        if let Message::Ping(round) = next_envelope(&mut raw).await.message {
            break round.round;
        }
    };

    let (rtt, round) = tokio::join!(peers[0].channel.ping(), async {
        loop {
            if let Message::Ping(round) = next_envelope(&mut raw).await.message {
                let pong = Message::Pong(round).encode(OUTSIDER, host).unwrap();
                raw.tx.send(pong).unwrap();
                break round.round;
            }
        }
    });
    assert_ne!(round, silent);
    assert!(rtt.unwrap() < limit);
}

/// DO_CLOSE from a peer that no longer needs the channel resolves to true.
#[tokio::test]
async fn test_can_close_agreed_by_peer() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let peers = group(&net, &config, 2).await.unwrap();
    let asker = peers[0].channel.my_id();
    let mut raw = outsider(&net, &peers[0]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (vote, _) = tokio::join!(peers[0].channel.can_close(OUTSIDER), async {
        let ask = next_envelope(&mut raw).await;
        let Message::CanClose(probe) = ask.message else {
            panic!("expected CAN_CLOSE");
        };
        assert_eq!(ask.sender(), asker);
        let reply = Message::DoClose(probe).encode(OUTSIDER, asker).unwrap();
        raw.tx.send(reply).unwrap();
    });
    assert!(vote.unwrap());
    assert!(peers[0].channel.neighbours().contains(&peers[1].channel.my_id()));
}
