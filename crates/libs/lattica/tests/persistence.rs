mod common;

use std::time::Duration;

use rand_core::OsRng;
use tempfile::TempDir;

use lattica::destination::DestinationName;
use lattica::identity::PrivateIdentity;
use lattica::iface::tcp_client::TcpClient;
use lattica::iface::tcp_server::TcpServer;
use lattica::transport::{Transport, TransportConfig};

use common::{reserve_ports, setup, wait_for_path};

/// Learned paths and recalled identities survive an instance restart
/// through the storage root.
#[tokio::test]
async fn state_survives_restart() {
    setup();

    let storage = TempDir::new().expect("temp dir");
    let ports = reserve_ports(2);
    let addr_a = format!("127.0.0.1:{}", ports[0]);
    let addr_b = format!("127.0.0.1:{}", ports[1]);

    let destination_hash = {
        let mut config_a =
            TransportConfig::new("a", &PrivateIdentity::generate(OsRng), false);
        config_a.set_storage_root(storage.path());
        let transport_a = Transport::new(config_a);
        {
            let manager = transport_a.iface_manager();
            let mut guard = manager.lock().await;
            guard.spawn(
                TcpServer::new(addr_a.clone(), transport_a.iface_manager()),
                TcpServer::spawn,
            );
        }

        let transport_b = Transport::new(TransportConfig::new(
            "b",
            &PrivateIdentity::generate(OsRng),
            false,
        ));
        {
            let manager = transport_b.iface_manager();
            let mut guard = manager.lock().await;
            guard.spawn(
                TcpServer::new(addr_b.clone(), transport_b.iface_manager()),
                TcpServer::spawn,
            );
            guard.spawn(TcpClient::new(addr_a.clone()), TcpClient::spawn);
        }

        let destination = transport_b
            .add_destination(
                PrivateIdentity::from_name("persisted-peer"),
                DestinationName::new("app", "persist"),
            )
            .await;
        let destination_hash = destination.lock().await.desc.address_hash;

        tokio::time::sleep(Duration::from_millis(300)).await;
        transport_b.send_announce(&destination, None).await;

        assert!(
            wait_for_path(&transport_a, &destination_hash, Duration::from_secs(3)).await,
            "announce must land before the restart"
        );
        assert!(transport_a.recall_identity(&destination_hash).await.is_some());

        transport_a.persist_now().await;
        destination_hash
        // Both instances drop here.
    };

    // A fresh instance over the same storage root, no interfaces at all.
    let mut config = TransportConfig::new("a2", &PrivateIdentity::generate(OsRng), false);
    config.set_storage_root(storage.path());
    let restarted = Transport::new(config);

    assert_eq!(restarted.hops_to(&destination_hash).await, Some(1));
    assert!(
        restarted.recall_identity(&destination_hash).await.is_some(),
        "identity ledger must be rebuilt from the announce cache"
    );
}
