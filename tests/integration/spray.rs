use crate::*;

use std::collections::BTreeSet;

use netweave_core::message::ShuffleAnswer;
use netweave_core::{KnownPeer, Message};
use netweave_overlay::Connector;

fn view_ids(peer: &Peer) -> BTreeSet<PeerId> {
    peer.channel.known_peers().iter().map(|k| k.peer_id).collect()
}

/// Relayed broadcasts are delivered once even when several paths exist.
#[tokio::test]
async fn test_spray_broadcast_is_deduplicated() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::Spray);
    let mut peers = group(&net, &config, 3).await.unwrap();
    let sender = peers[2].channel.my_id();

    peers[2].channel.send("over the spray").unwrap();

    for peer in peers[..2].iter_mut() {
        let (from, payload, is_broadcast) = next_message(peer).await.unwrap();
        assert_eq!(from, sender);
        assert_eq!(payload, UserPayload::Text("over the spray".into()));
        assert!(is_broadcast);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer in peers.iter_mut() {
        assert!(!drain(peer)
            .iter()
            .any(|e| matches!(e, ChannelEvent::Message { .. })));
    }
}

/// Links follow the partial view once joins settle.
#[tokio::test]
async fn test_spray_links_match_view() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::Spray);
    let peers = group(&net, &config, 4).await.unwrap();

    wait_until("links match views", || {
        peers.iter().all(|p| p.channel.neighbours() == view_ids(p))
    })
    .await
    .unwrap();
    for peer in &peers {
        assert!(!view_ids(peer).contains(&peer.channel.my_id()));
        assert!(!peer.channel.neighbours().is_empty());
    }
}

/// Killing one peer of five removes it everywhere and leaves the other links alone.
#[tokio::test]
async fn test_spray_survives_peer_loss() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::Spray);
    let mut peers = group(&net, &config, 5).await.unwrap();
    wait_until("links match views", || {
        peers.iter().all(|p| p.channel.neighbours() == view_ids(p))
    })
    .await
    .unwrap();

    let victim = peers.remove(2);
    let dead = victim.channel.my_id();
    let before: Vec<BTreeSet<PeerId>> = peers.iter().map(|p| p.channel.neighbours()).collect();

    victim.channel.leave().await;

    wait_until("survivors forgot the dead peer", || {
        peers.iter().all(|p| !p.channel.members().contains(&dead))
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (peer, old) in peers.iter().zip(before) {
        let mut expected = old;
        expected.remove(&dead);
        assert_eq!(peer.channel.neighbours(), expected);
        assert!(!view_ids(peer).contains(&dead));
        assert_eq!(peer.channel.peer_count(), 3);
    }

    let sender = peers[0].channel.my_id();
    peers[0].channel.send("still here").unwrap();
    for peer in peers[1..].iter_mut() {
        let (from, _, _) = next_message(peer).await.unwrap();
        assert_eq!(from, sender);
    }
}

/// A manual shuffle exchanges views without losing anyone.
#[tokio::test]
async fn test_spray_shuffle_keeps_group_connected() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::Spray);
    let mut peers = group(&net, &config, 4).await.unwrap();

    for peer in &peers {
        peer.channel.shuffle().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    for peer in &peers {
        assert!(!view_ids(peer).is_empty());
        assert!(!view_ids(peer).contains(&peer.channel.my_id()));
        assert_eq!(peer.channel.peer_count(), 3);
    }

    let sender = peers[3].channel.my_id();
    peers[3].channel.send(7.0).unwrap();
    for peer in peers[..3].iter_mut() {
        let (from, payload, _) = next_message(peer).await.unwrap();
        assert_eq!(from, sender);
        assert_eq!(payload, UserPayload::Number(7.0));
    }
}

/// Two shuffles in flight on one peer each complete with their own answer.
#[tokio::test]
async fn test_spray_concurrent_shuffles_complete() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::Spray);
    let mut peers = group(&net, &config, 4).await.unwrap();

    let (first, second) = tokio::join!(peers[0].channel.shuffle(), peers[0].channel.shuffle());
    first.unwrap();
    second.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    for peer in &peers {
        assert!(!view_ids(peer).contains(&peer.channel.my_id()));
        assert_eq!(peer.channel.peer_count(), 3);
    }
    let sender = peers[0].channel.my_id();
    peers[0].channel.send("after two shuffles").unwrap();
    for peer in peers[1..].iter_mut() {
        let (from, _, _) = next_message(peer).await.unwrap();
        assert_eq!(from, sender);
    }
}

/// An answer nobody is waiting for leaves the view untouched.
#[tokio::test]
async fn test_spray_unsolicited_shuffle_answer_is_ignored() {
    const STRANGER: PeerId = 0x5151;
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::Spray);
    let peers = group(&net, &config, 2).await.unwrap();
    let target = peers[0].channel.my_id();
    let before = peers[0].channel.known_peers();

    let raw = net
        .connector()
        .connect(peers[0].channel.channel_id(), STRANGER, target)
        .await
        .unwrap();
    raw.tx.send(Message::InitOk.encode(STRANGER, target).unwrap()).unwrap();
    let answer = Message::ShuffleAnswer(ShuffleAnswer {
        token: 99,
        sample: vec![KnownPeer::fresh(STRANGER)],
    })
    .encode(STRANGER, target)
    .unwrap();
    raw.tx.send(answer).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!view_ids(&peers[0]).contains(&STRANGER));
    assert_eq!(peers[0].channel.known_peers(), before);
}
