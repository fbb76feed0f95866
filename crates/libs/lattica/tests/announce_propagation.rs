mod common;

use std::time::Duration;

use rand_core::OsRng;

use lattica::destination::DestinationName;
use lattica::identity::PrivateIdentity;

use common::{build_transport, reserve_ports, setup, wait_for_path};

/// Three nodes in a line: A announces, the relay B forwards after its
/// hop-scaled delay, and C ends up with a two-hop path through B.
#[tokio::test]
async fn announce_crosses_a_relay() {
    setup();

    let ports = reserve_ports(3);
    let addr_a = format!("127.0.0.1:{}", ports[0]);
    let addr_b = format!("127.0.0.1:{}", ports[1]);
    let addr_c = format!("127.0.0.1:{}", ports[2]);

    let transport_a = build_transport("a", &addr_a, &[], false).await;
    let transport_b = build_transport("b", &addr_b, &[&addr_a], true).await;
    let transport_c = build_transport("c", &addr_c, &[&addr_b], false).await;

    let destination = transport_a
        .add_destination(
            PrivateIdentity::from_name("announce-a"),
            DestinationName::new("app", "node.a"),
        )
        .await;
    let destination_hash = destination.lock().await.desc.address_hash;

    // Let the TCP chain come up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    transport_a.send_announce(&destination, None).await;

    assert!(
        wait_for_path(&transport_b, &destination_hash, Duration::from_secs(2)).await,
        "direct neighbour must learn the path"
    );
    assert_eq!(transport_b.hops_to(&destination_hash).await, Some(1));

    // The relay holds the announce for its 2^0 = 1 s delay before C can
    // hear it.
    assert!(
        wait_for_path(&transport_c, &destination_hash, Duration::from_secs(6)).await,
        "second hop must learn the path through the relay"
    );
    assert_eq!(transport_c.hops_to(&destination_hash).await, Some(2));

    // C can recall the announced identity from its ledger.
    let recalled = transport_c.recall_identity(&destination_hash).await;
    assert!(recalled.is_some());
}

/// Replaying one announce packet verbatim must neither update the path
/// table again nor re-notify subscribers.
#[tokio::test]
async fn replayed_announce_is_dropped() {
    setup();

    let ports = reserve_ports(2);
    let addr_a = format!("127.0.0.1:{}", ports[0]);
    let addr_b = format!("127.0.0.1:{}", ports[1]);

    let transport_a = build_transport("a", &addr_a, &[], false).await;
    let transport_b = build_transport("b", &addr_b, &[&addr_a], false).await;

    let mut destination = lattica::destination::SingleInputDestination::new(
        PrivateIdentity::from_name("replayed"),
        DestinationName::new("app", "replay"),
    );
    let destination_hash = destination.desc.address_hash;
    let announce = destination.announce(OsRng, None).expect("announce");

    let mut announce_events = transport_b.recv_announces().await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    for _ in 0..10 {
        transport_a.send_broadcast(announce, None).await;
    }

    assert!(
        wait_for_path(&transport_b, &destination_hash, Duration::from_secs(2)).await,
        "announce must land once"
    );

    // Exactly one subscriber notification for ten replays.
    let first = tokio::time::timeout(Duration::from_secs(1), announce_events.recv()).await;
    assert!(first.is_ok(), "first announce must be delivered");
    let second = tokio::time::timeout(Duration::from_millis(500), announce_events.recv()).await;
    assert!(second.is_err(), "replays must not re-notify");

    let stats = transport_b.stats().await;
    assert!(stats.duplicates_dropped >= 9, "replays counted as duplicates");
}
