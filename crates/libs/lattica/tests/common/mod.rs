#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use rand_core::OsRng;

use lattica::hash::ShortHash;
use lattica::iface::tcp_client::TcpClient;
use lattica::iface::tcp_server::TcpServer;
use lattica::identity::PrivateIdentity;
use lattica::transport::{Transport, TransportConfig};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
            .is_test(true)
            .try_init();
    });
}

/// Grabs ephemeral ports by binding and immediately releasing them.
pub fn reserve_ports(count: usize) -> Vec<u16> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        ports.push(listener.local_addr().expect("ephemeral addr").port());
        listeners.push(listener);
    }
    drop(listeners);
    ports
}

pub async fn build_transport(
    name: &str,
    server_addr: &str,
    client_addrs: &[&str],
    retransmit: bool,
) -> Transport {
    let mut config = TransportConfig::new(name, &PrivateIdentity::generate(OsRng), false);
    if retransmit {
        config.set_retransmit(true);
    }

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

pub async fn wait_for_path(
    transport: &Transport,
    destination: &ShortHash,
    timeout: Duration,
) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if transport.hops_to(destination).await.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
