use crate::*;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use netweave_overlay::{OverlayError, ServiceHandler};

/// Broadcast from the newest peer reaches each other member exactly once.
#[tokio::test]
async fn test_broadcast_reaches_everyone_once() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let mut peers = group(&net, &config, 3).await.unwrap();
    let sender = peers[2].channel.my_id();

    peers[2].channel.send("hello group").unwrap();

    for peer in peers[..2].iter_mut() {
        let (from, payload, is_broadcast) = next_message(peer).await.unwrap();
        assert_eq!(from, sender);
        assert_eq!(payload, UserPayload::Text("hello group".into()));
        assert!(is_broadcast);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer in peers.iter_mut() {
        let extra = drain(peer)
            .into_iter()
            .filter(|e| matches!(e, ChannelEvent::Message { .. }))
            .count();
        assert_eq!(extra, 0, "no duplicates and no echo to the sender");
    }
}

#[tokio::test]
async fn test_unicast_stays_private() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let mut peers = group(&net, &config, 3).await.unwrap();
    let target = peers[0].channel.my_id();
    let sender = peers[1].channel.my_id();

    peers[1].channel.send_to(target, 42.5).unwrap();

    let (from, payload, is_broadcast) = next_message(&mut peers[0]).await.unwrap();
    assert_eq!(from, sender);
    assert_eq!(payload, UserPayload::Number(42.5));
    assert!(!is_broadcast);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!drain(&mut peers[2])
        .iter()
        .any(|e| matches!(e, ChannelEvent::Message { .. })));
}

/// Payloads larger than one chunk arrive whole.
#[tokio::test]
async fn test_large_payload_is_chunked_and_reassembled() {
    let net = MemoryNetwork::new();
    let mut config = test_config(TopologyKind::FullMesh);
    config.overlay.chunk_size = 1024;
    let mut peers = group(&net, &config, 2).await.unwrap();

    let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    peers[0].channel.send(data.clone()).unwrap();

    let (_, payload, _) = next_message(&mut peers[1]).await.unwrap();
    assert_eq!(payload, UserPayload::Binary(Bytes::from(data)));
}

#[tokio::test]
async fn test_send_requires_membership() {
    let net = MemoryNetwork::new();
    let peer = spawn_peer(&net, &test_config(TopologyKind::FullMesh));
    assert!(matches!(peer.channel.send("early"), Err(OverlayError::NotConnected)));
    assert!(matches!(peer.channel.send_to(7, "early"), Err(OverlayError::NotConnected)));
}

struct Recorder(Arc<Mutex<Vec<(PeerId, serde_json::Value)>>>);

impl ServiceHandler for Recorder {
    fn on_message(&self, _channel: &WebChannel, from: PeerId, data: serde_json::Value) -> anyhow::Result<()> {
        self.0.lock().unwrap().push((from, data));
        Ok(())
    }
}

/// Service data goes to the handler registered under its name.
#[tokio::test]
async fn test_service_handler_receives_data() {
    let net = MemoryNetwork::new();
    let config = test_config(TopologyKind::FullMesh);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let (host, _host_events) = WebChannel::builder(net.connector(), net.door())
        .config(config.clone())
        .service("recorder", Arc::new(Recorder(seen.clone())))
        .build();
    let guest = spawn_peer(&net, &config);

    let access = host.open().await.unwrap();
    guest.channel.join(&access.key).await.unwrap();

    let body = serde_json::json!({"op": "note", "value": 3});
    guest
        .channel
        .send_service(host.my_id(), "recorder", body.clone())
        .unwrap();
    guest
        .channel
        .send_service(host.my_id(), "unregistered", body.clone())
        .unwrap();

    wait_until("service data recorded", || !seen.lock().unwrap().is_empty())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.as_slice(), &[(guest.channel.my_id(), body)]);
}
