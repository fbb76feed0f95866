mod common;

use std::time::Duration;

use rand_core::{OsRng, RngCore};

use lattica::destination::link::LinkStatus;
use lattica::destination::DestinationName;
use lattica::identity::PrivateIdentity;
use lattica::resource::ResourceEventKind;

use common::{build_transport, reserve_ports, setup, wait_for_path};

/// Bulk payload over an established link: windowed segments, selective
/// requests, final hash verification and the completion proof back to the
/// sender.
#[tokio::test]
async fn resource_transfer_completes_over_a_link() {
    setup();

    let ports = reserve_ports(2);
    let addr_a = format!("127.0.0.1:{}", ports[0]);
    let addr_b = format!("127.0.0.1:{}", ports[1]);

    let transport_a = build_transport("a", &addr_a, &[], false).await;
    let transport_b = build_transport("b", &addr_b, &[&addr_a], false).await;

    let destination = transport_b
        .add_destination(
            PrivateIdentity::from_name("resource-sink"),
            DestinationName::new("app", "files"),
        )
        .await;
    let destination_hash = destination.lock().await.desc.address_hash;

    let mut announces_on_a = transport_a.recv_announces().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    transport_b.send_announce(&destination, None).await;

    assert!(wait_for_path(&transport_a, &destination_hash, Duration::from_secs(3)).await);
    let announce = tokio::time::timeout(Duration::from_secs(2), announces_on_a.recv())
        .await
        .expect("announce event")
        .expect("channel open");
    let target_desc = announce.destination.lock().await.desc;

    let link = transport_a.link(target_desc).await;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while link.lock().await.status() != LinkStatus::Active {
        assert!(std::time::Instant::now() < deadline, "link must activate");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let link_id = *link.lock().await.id();

    let mut events_on_b = transport_b.resource_events();
    let mut events_on_a = transport_a.resource_events();

    // 100 kB of incompressible payload, segmented into sub-MDU parts.
    let mut payload = vec![0u8; 100 * 1024];
    OsRng.fill_bytes(&mut payload);

    let resource_hash = transport_a
        .send_resource(&link_id, payload.clone(), Some(b"name=blob".to_vec()))
        .await
        .expect("transfer starts");

    let complete = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events_on_b.recv().await.expect("event channel open");
            if event.hash != resource_hash {
                continue;
            }
            match event.kind {
                ResourceEventKind::Complete(complete) => break complete,
                ResourceEventKind::Failed => panic!("transfer failed"),
                _ => continue,
            }
        }
    })
    .await
    .expect("receiver completes");

    assert_eq!(complete.data, payload);
    assert_eq!(complete.metadata.as_deref(), Some(&b"name=blob"[..]));

    // The proof makes it back to the sender.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events_on_a.recv().await.expect("event channel open");
            if event.hash == resource_hash
                && matches!(event.kind, ResourceEventKind::OutboundComplete)
            {
                break;
            }
        }
    })
    .await
    .expect("sender sees the proof");
}
