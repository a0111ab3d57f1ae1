use crate::*;

use netweave_overlay::{Connector, JoinDoor, OverlayError, TimeoutKind, TransportError};

/// Three peers join through the first one and all end up fully meshed.
#[tokio::test]
async fn test_three_peers_converge() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let mut peers = group(&net, &config, 3).await.unwrap();

    let ids: Vec<PeerId> = peers.iter().map(|p| p.channel.my_id()).collect();
    let channel_id = peers[0].channel.channel_id();
    for (i, peer) in peers.iter().enumerate() {
        let mut expected: Vec<PeerId> = ids.iter().copied().filter(|id| *id != ids[i]).collect();
        expected.sort_unstable();
        assert_eq!(peer.channel.members(), expected);
        assert_eq!(peer.channel.neighbours().into_iter().collect::<Vec<_>>(), expected);
        assert_eq!(peer.channel.channel_id(), channel_id);
        assert!(peer.channel.is_member());
    }

    let joined: Vec<PeerId> = drain(&mut peers[0])
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::PeerJoined(id) => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(joined, vec![ids[1], ids[2]]);
}

/// The joiner runs whatever topology the channel was created with.
#[tokio::test]
async fn test_joiner_adopts_topology() {
    let net = MemoryNetwork::new();
    let creator = spawn_peer(&net, &test_config(TopologyKind::Spray));
    let joiner = spawn_peer(&net, &test_config(TopologyKind::FullMesh));

    let access = creator.channel.open().await.unwrap();
    joiner.channel.join(&access.key).await.unwrap();

    assert_eq!(joiner.channel.topology(), TopologyKind::Spray);
    assert!(joiner.channel.members().contains(&creator.channel.my_id()));
    let view: Vec<PeerId> = joiner.channel.known_peers().iter().map(|k| k.peer_id).collect();
    assert_eq!(view, vec![creator.channel.my_id()]);
}

/// Leaving is announced once per survivor, however many paths report it.
#[tokio::test]
async fn test_leave_fires_peer_left_once() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let mut peers = group(&net, &config, 3).await.unwrap();
    let leaver = peers[2].channel.my_id();

    peers[2].channel.leave().await;
    assert!(!peers[2].channel.is_member());
    assert_eq!(peers[2].channel.peer_count(), 0);

    wait_until("survivors dropped the leaver", || {
        peers[..2].iter().all(|p| !p.channel.members().contains(&leaver))
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    for peer in peers[..2].iter_mut() {
        let left = drain(peer)
            .into_iter()
            .filter(|e| *e == ChannelEvent::PeerLeft(leaver))
            .count();
        assert_eq!(left, 1);
        assert!(!peer.channel.neighbours().contains(&leaver));
    }
}

#[tokio::test]
async fn test_join_with_unknown_key_fails() {
    let net = MemoryNetwork::new();
    let peer = spawn_peer(&net, &test_config(TopologyKind::FullMesh));

    let err = peer.channel.join("no-such-door").await.unwrap_err();
    assert!(matches!(
        err,
        OverlayError::Transport(TransportError::UnknownKey(ref key)) if key == "no-such-door"
    ));
    assert!(!peer.channel.is_member());
}

/// A door nobody answers makes the join time out and leaves the peer idle.
#[tokio::test]
async fn test_join_times_out_on_silent_door() {
    let net = MemoryNetwork::new();
    let mut config = test_config(TopologyKind::FullMesh);
    config.overlay.join_timeout_ms = 200;
    let peer = spawn_peer(&net, &config);

    let door = net.door();
    let (access, _incoming) = door.open("mem://silent").await.unwrap();

    let err = peer.channel.join(&access.key).await.unwrap_err();
    assert!(matches!(err, OverlayError::Timeout(TimeoutKind::Join)));
    assert!(!peer.channel.is_member());

    let host = spawn_peer(&net, &config);
    let real = host.channel.open().await.unwrap();
    peer.channel.join(&real.key).await.unwrap();
    assert_eq!(peer.channel.members(), vec![host.channel.my_id()]);
}

/// A joiner that cannot reach every member is rolled back on all sides.
#[tokio::test]
async fn test_join_rolled_back_when_member_unreachable() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let mut peers = group(&net, &config, 2).await.unwrap();
    let host = peers[0].channel.my_id();
    let unreachable = peers[1].channel.my_id();
    net.connector().unlisten(peers[1].channel.channel_id(), unreachable);
    for peer in peers.iter_mut() {
        drain(peer);
    }

    let access = peers[0].channel.access().unwrap();
    let joiner = spawn_peer(&net, &config);
    let err = joiner.channel.join(&access.key).await.unwrap_err();
    assert!(matches!(err, OverlayError::JoinFailed(_)), "got {err:?}");
    assert!(!joiner.channel.is_member());
    assert!(joiner.channel.members().is_empty());

    wait_until("joiner stopped listening", || net.listeners() == 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peers[0].channel.members(), vec![unreachable]);
    assert_eq!(peers[1].channel.members(), vec![host]);
    for peer in peers.iter_mut() {
        assert!(!drain(peer)
            .iter()
            .any(|e| matches!(e, ChannelEvent::PeerJoined(_))));
    }
}

#[tokio::test]
async fn test_door_close_emits_closed() {
    let net = MemoryNetwork::new();
    let mut peer = spawn_peer(&net, &test_config(TopologyKind::FullMesh));
    let access = peer.channel.open().await.unwrap();
    peer.channel.close().await;

    let closed = drain(&mut peer)
        .into_iter()
        .any(|e| matches!(e, ChannelEvent::Closed(_)));
    assert!(closed);

    let late = spawn_peer(&net, &test_config(TopologyKind::FullMesh));
    assert!(late.channel.join(&access.key).await.is_err());
}
