// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

//! End-to-end scenarios on an in-memory network with a paused clock.
//!
//! Time is virtual: the tokio test runtime auto-advances through the
//! engine's sleeps, so "15 gossip rounds" finishes in milliseconds of
//! real time.

mod common;

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;

use common::{eventually, node, Hub, TestNode};
use libweft::{
    channel::Retention,
    coordinator,
    peer::Status,
    protocol::Event,
    ChannelId, NodeId, StreamId,
};

fn ids() -> (ChannelId, StreamId) {
    (ChannelId::new("c").unwrap(), StreamId::new("s").unwrap())
}

/// Introduce every node to every other, share a channel + stream, and
/// start the engines.
async fn wire(nodes: &[&TestNode], channel: &ChannelId, stream: &StreamId) {
    for n in nodes {
        n.coordinator.create_channel(channel.clone()).await.unwrap();
        n.coordinator
            .create_stream(channel, stream.clone(), Retention::KeepAll)
            .await
            .unwrap();
        for m in nodes {
            if m.id != n.id {
                n.coordinator.add_peer(m.id.clone(), None).await.unwrap();
                n.coordinator
                    .add_member(channel, m.id.clone())
                    .await
                    .unwrap();
            }
        }
        n.coordinator.start().await.unwrap();
    }
}

/// Wait for a specific peer status change on an event stream.
async fn await_status(
    events: &mut broadcast::Receiver<Event>,
    peer: &NodeId,
    status: Status,
) {
    let waited = tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            match events.recv().await {
                Ok(Event::PeerStatusChanged { peer: p, new, .. }) if p == *peer && new == status => {
                    return
                },
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await;
    assert!(
        waited.is_ok(),
        "timed out waiting for {peer} to become {status}"
    );
}

#[tokio::test(start_paused = true)]
async fn basic_sync() {
    common::logging();
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;
    let (ch, st) = ids();
    wire(&[&n1, &n2], &ch, &st).await;

    let entry = n1
        .coordinator
        .append(&ch, &st, Bytes::from_static(b"hello"))
        .await
        .unwrap()
        .expect("channel and stream exist");
    assert_eq!(entry.sequence, 1);

    eventually("n2 to receive the entry", || {
        n2.coordinator.entries(&ch, &st).unwrap().len() == 1
    })
    .await;

    let received = n2.coordinator.entries(&ch, &st).unwrap();
    assert_eq!(received[0].author, n1.id);
    assert_eq!(received[0].sequence, 1);
    assert_eq!(received[0].payload, Bytes::from_static(b"hello"));
}

#[tokio::test(start_paused = true)]
async fn bidirectional_concurrent_appends() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;
    let (ch, st) = ids();
    wire(&[&n1, &n2], &ch, &st).await;

    n1.coordinator
        .append(&ch, &st, Bytes::from_static(&[0x01]))
        .await
        .unwrap();
    n2.coordinator
        .append(&ch, &st, Bytes::from_static(&[0x02]))
        .await
        .unwrap();

    eventually("both nodes to hold both entries", || {
        n1.coordinator.entries(&ch, &st).unwrap().len() == 2
            && n2.coordinator.entries(&ch, &st).unwrap().len() == 2
    })
    .await;

    // identical order on both sides: (hlc, author, sequence)
    assert_eq!(
        n1.coordinator.entries(&ch, &st).unwrap(),
        n2.coordinator.entries(&ch, &st).unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn partition_heals_to_identical_logs() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;
    let n3 = node(&hub, "n3").await;
    let (ch, st) = ids();
    wire(&[&n1, &n2, &n3], &ch, &st).await;

    hub.partition(&n1.id, &n2.id);
    hub.partition(&n1.id, &n3.id);

    n1.coordinator
        .append(&ch, &st, Bytes::from_static(b"from-n1-a"))
        .await
        .unwrap();
    n1.coordinator
        .append(&ch, &st, Bytes::from_static(b"from-n1-b"))
        .await
        .unwrap();
    n2.coordinator
        .append(&ch, &st, Bytes::from_static(b"from-n2"))
        .await
        .unwrap();
    n3.coordinator
        .append(&ch, &st, Bytes::from_static(b"from-n3"))
        .await
        .unwrap();

    // the majority side converges while n1 is cut off
    eventually("n2 and n3 to swap their entries", || {
        n2.coordinator.entries(&ch, &st).unwrap().len() == 2
            && n3.coordinator.entries(&ch, &st).unwrap().len() == 2
    })
    .await;
    assert_eq!(n1.coordinator.entries(&ch, &st).unwrap().len(), 2);

    hub.heal(&n1.id, &n2.id);
    hub.heal(&n1.id, &n3.id);

    eventually("all three to hold all four entries", || {
        [&n1, &n2, &n3]
            .iter()
            .all(|n| n.coordinator.entries(&ch, &st).unwrap().len() == 4)
    })
    .await;

    let reference = n1.coordinator.entries(&ch, &st).unwrap();
    assert_eq!(reference, n2.coordinator.entries(&ch, &st).unwrap());
    assert_eq!(reference, n3.coordinator.entries(&ch, &st).unwrap());
}

#[tokio::test(start_paused = true)]
async fn failure_detection_walks_the_status_lifecycle() {
    common::logging();
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;

    for (a, b) in [(&n1, &n2), (&n2, &n1)] {
        a.coordinator.add_peer(b.id.clone(), None).await.unwrap();
        a.coordinator.start().await.unwrap();
    }

    let mut events = n1.coordinator.events();
    hub.partition(&n1.id, &n2.id);

    await_status(&mut events, &n2.id, Status::Suspected).await;
    await_status(&mut events, &n2.id, Status::Unreachable).await;

    // the peer is still in the registry, only marked
    let health = n1.coordinator.health();
    assert_eq!(health.peers_unreachable, 1);

    hub.heal(&n1.id, &n2.id);
    // idempotent re-add, as an application would do on re-discovery
    n1.coordinator.add_peer(n2.id.clone(), None).await.unwrap();

    await_status(&mut events, &n2.id, Status::Reachable).await;
    assert_eq!(n1.coordinator.health().peers_reachable, 1);
}

#[tokio::test(start_paused = true)]
async fn suspicion_is_refuted_with_a_bumped_incarnation() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;

    for (a, b) in [(&n1, &n2), (&n2, &n1)] {
        a.coordinator.add_peer(b.id.clone(), None).await.unwrap();
        a.coordinator.start().await.unwrap();
    }

    let mut events = n1.coordinator.events();

    // n1 can reach n2, but nothing comes back: a one-way failure, the
    // case where suspicion plus refutation actually matters
    hub.partition_one_way(&n2.id, &n1.id);

    await_status(&mut events, &n2.id, Status::Suspected).await;

    // the suspicion reached n2, which bumped and persisted its
    // incarnation even though its refutation cannot get through yet
    eventually("n2 to refute with a bumped incarnation", || {
        n2.identity.incarnation() >= 1
    })
    .await;

    hub.heal(&n1.id, &n2.id);
    await_status(&mut events, &n2.id, Status::Reachable).await;
}

#[tokio::test(start_paused = true)]
async fn burst_of_writes_arrives_contiguously() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;
    let (ch, st) = ids();
    wire(&[&n1, &n2], &ch, &st).await;

    for i in 0..20u8 {
        n1.coordinator
            .append(&ch, &st, Bytes::copy_from_slice(&[i]))
            .await
            .unwrap();
    }

    eventually("n2 to receive the whole burst", || {
        n2.coordinator.entries(&ch, &st).unwrap().len() == 20
    })
    .await;

    let seqs: Vec<u32> = n2
        .coordinator
        .entries(&ch, &st)
        .unwrap()
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(seqs, (1..=20).collect::<Vec<u32>>());
}

#[tokio::test(start_paused = true)]
async fn paused_node_buffers_inbound_and_catches_up_on_resume() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;
    let (ch, st) = ids();
    wire(&[&n1, &n2], &ch, &st).await;

    n2.coordinator.pause().await.unwrap();
    assert_eq!(n2.coordinator.lifecycle(), coordinator::Lifecycle::Paused);

    n1.coordinator
        .append(&ch, &st, Bytes::from_static(b"while-you-were-out"))
        .await
        .unwrap();

    // give n1 plenty of rounds; n2 buffers but must not process
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(n2.coordinator.entries(&ch, &st).unwrap().is_empty());

    n2.coordinator.resume().await.unwrap();
    eventually("n2 to catch up after resume", || {
        n2.coordinator.entries(&ch, &st).unwrap().len() == 1
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn stop_preserves_state_and_start_resumes_sync() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let n2 = node(&hub, "n2").await;
    let (ch, st) = ids();
    wire(&[&n1, &n2], &ch, &st).await;

    n1.coordinator
        .append(&ch, &st, Bytes::from_static(b"one"))
        .await
        .unwrap();
    eventually("initial sync", || {
        n2.coordinator.entries(&ch, &st).unwrap().len() == 1
    })
    .await;

    n2.coordinator.stop().await.unwrap();
    assert_eq!(
        n2.coordinator.entries(&ch, &st).unwrap().len(),
        1,
        "state survives stop"
    );

    n1.coordinator
        .append(&ch, &st, Bytes::from_static(b"two"))
        .await
        .unwrap();
    n2.coordinator.start().await.unwrap();

    eventually("sync to resume after start", || {
        n2.coordinator.entries(&ch, &st).unwrap().len() == 2
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn disposed_coordinator_rejects_further_use() {
    let hub = Hub::new();
    let n1 = node(&hub, "n1").await;
    let (ch, st) = ids();

    n1.coordinator.dispose().await;

    assert!(matches!(
        n1.coordinator.start().await,
        Err(coordinator::Error::Disposed)
    ));
    assert!(matches!(
        n1.coordinator
            .append(&ch, &st, Bytes::from_static(b"x"))
            .await,
        Err(coordinator::Error::Disposed)
    ));
    assert!(matches!(
        n1.coordinator.entries(&ch, &st),
        Err(coordinator::Error::Disposed)
    ));
}
