mod common;

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;
use serde_bytes::ByteBuf;

use lattica::identity::PrivateIdentity;
use lattica::rpc::{RpcClient, RpcCommand, RpcResult, RpcServer};
use lattica::transport::{Transport, TransportConfig};

use common::{reserve_ports, setup};

async fn start_server(key: &str) -> (Arc<Transport>, String) {
    let config = TransportConfig::new("rpc-host", &PrivateIdentity::generate(OsRng), false);
    let transport = Arc::new(Transport::new(config));

    let ports = reserve_ports(1);
    let addr = format!("127.0.0.1:{}", ports[0]);

    let server = Arc::new(RpcServer::new(transport.clone(), key.into()));
    let listen_addr = addr.clone();
    tokio::spawn(async move {
        let _ = server.serve(listen_addr).await;
    });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(100)).await;

    (transport, addr)
}

#[tokio::test]
async fn wrong_key_is_rejected() {
    setup();
    let (_transport, addr) = start_server("correct horse").await;

    assert!(RpcClient::connect(addr, "battery staple").await.is_err());
}

#[tokio::test]
async fn register_status_and_path_query() {
    setup();
    let (transport, addr) = start_server("shared-key").await;

    let mut client = RpcClient::connect(addr, "shared-key").await.expect("authenticates");

    let identity = PrivateIdentity::generate(OsRng);
    let response = client
        .call(RpcCommand::Register {
            private_key: ByteBuf::from(identity.to_bytes().to_vec()),
            app_name: "app".into(),
            aspects: "ipc.test".into(),
        })
        .await
        .expect("register call");

    let destination = match response.result.expect("register succeeds") {
        RpcResult::Registered { destination } => destination,
        other => panic!("unexpected result {:?}", other),
    };

    // The destination is now live in the owning instance.
    let hash = lattica::hash::ShortHash::from_slice(destination.as_ref()).expect("hash");
    assert!(transport.has_destination(&hash).await);

    let response = client.call(RpcCommand::Status).await.expect("status call");
    assert!(matches!(response.result, Ok(RpcResult::Status { .. })));

    // No path known for a random destination; the query itself must still
    // answer.
    let response = client
        .call(RpcCommand::PathQuery {
            destination: ByteBuf::from(vec![0x5Au8; 16]),
        })
        .await
        .expect("path query call");
    assert!(matches!(response.result, Ok(RpcResult::Path { hops: None })));
}
