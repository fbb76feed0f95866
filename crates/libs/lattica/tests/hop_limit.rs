mod common;

use std::time::Duration;

use rand_core::OsRng;

use lattica::buffer::FixedBuf;
use lattica::hash::ShortHash;
use lattica::identity::PrivateIdentity;
use lattica::iface::tcp_client::TcpClient;
use lattica::iface::tcp_server::TcpServer;
use lattica::packet::Packet;
use lattica::transport::{Transport, TransportConfig};

use common::{reserve_ports, setup};

async fn build_flooding_transport(name: &str, server_addr: &str, client_addrs: &[&str]) -> Transport {
    let mut config = TransportConfig::new(name, &PrivateIdentity::generate(OsRng), true);
    config.set_retransmit(true);
    let transport = Transport::new(config);

    {
        let manager = transport.iface_manager();
        let mut guard = manager.lock().await;
        guard.spawn(TcpServer::new(server_addr, transport.iface_manager()), TcpServer::spawn);
        for &addr in client_addrs {
            guard.spawn(TcpClient::new(addr), TcpClient::spawn);
        }
    }

    transport
}

fn probe_packet(hops: u8) -> Packet {
    let mut packet = Packet {
        destination: ShortHash::of(b"nobody-in-particular"),
        data: FixedBuf::from_slice(b"hop probe"),
        ..Default::default()
    };
    packet.header.hops = hops;
    packet
}

/// A packet at 127 hops crosses one more node (becoming 128) and dies at
/// the next; a packet already at 128 is dropped on arrival without being
/// forwarded.
#[tokio::test]
async fn hop_ceiling_is_enforced() {
    setup();

    let ports = reserve_ports(3);
    let addr_a = format!("127.0.0.1:{}", ports[0]);
    let addr_b = format!("127.0.0.1:{}", ports[1]);
    let addr_c = format!("127.0.0.1:{}", ports[2]);

    let transport_a = build_flooding_transport("a", &addr_a, &[]).await;
    let transport_b = build_flooding_transport("b", &addr_b, &[&addr_a]).await;
    let transport_c = build_flooding_transport("c", &addr_c, &[&addr_b]).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    // hops = 128 on arrival: B must drop without forwarding.
    transport_a.send_broadcast(probe_packet(128), None).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats_b = transport_b.stats().await;
    assert!(stats_b.hop_limit_dropped >= 1, "B must drop the over-limit packet");
    let stats_c = transport_c.stats().await;
    assert_eq!(stats_c.packets_in, 0, "C must never see the over-limit packet");

    // hops = 127 on arrival: B forwards once (to 128), C then drops.
    transport_a.send_broadcast(probe_packet(127), None).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats_c = transport_c.stats().await;
    assert!(stats_c.packets_in >= 1, "C must receive the forwarded packet");
    assert!(stats_c.hop_limit_dropped >= 1, "C must drop it at the ceiling");
}
