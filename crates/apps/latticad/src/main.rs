mod config;

use std::sync::Arc;
use std::time::Duration;

use rand_core::OsRng;

use lattica::iface::tcp_client::TcpClient;
use lattica::iface::tcp_server::TcpServer;
use lattica::iface::udp::UdpInterface;
use lattica::rpc::RpcServer;
use lattica::{PrivateIdentity, Transport, TransportConfig};

use config::{DaemonConfig, InterfaceSpec};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "lattica.conf".to_string());

    let config = match std::fs::read_to_string(&config_path) {
        Ok(ini) => match DaemonConfig::from_ini(&ini) {
            Ok(config) => config,
            Err(err) => {
                log::error!("bad config {}: {}", config_path, err);
                std::process::exit(1);
            }
        },
        Err(_) => {
            log::warn!("no config at {}, using defaults", config_path);
            DaemonConfig::default()
        }
    };

    let identity_path = config.storage_root.join("identities").join("default");
    let identity = match PrivateIdentity::load_or_generate(&identity_path, OsRng) {
        Ok(identity) => identity,
        Err(err) => {
            log::error!("identity unavailable: {}", err);
            std::process::exit(1);
        }
    };
    log::info!("instance identity {}", identity.address_hash());

    let mut transport_config = TransportConfig::new(config.name.clone(), &identity, false);
    transport_config.set_retransmit(config.retransmit);
    transport_config.set_panic_on_interface_error(config.panic_on_interface_error);
    transport_config.set_storage_root(config.storage_root.clone());

    let transport = Arc::new(Transport::new(transport_config));

    for spec in &config.interfaces {
        match spec {
            InterfaceSpec::TcpClient { addr } => {
                transport
                    .iface_manager()
                    .lock()
                    .await
                    .spawn(TcpClient::new(addr.clone()), TcpClient::spawn);
            }
            InterfaceSpec::TcpServer { addr } => {
                let manager = transport.iface_manager();
                transport
                    .iface_manager()
                    .lock()
                    .await
                    .spawn(TcpServer::new(addr.clone(), manager), TcpServer::spawn);
            }
            InterfaceSpec::Udp { bind, forward } => {
                transport
                    .iface_manager()
                    .lock()
                    .await
                    .spawn(UdpInterface::new(bind.clone(), forward.clone()), UdpInterface::spawn);
            }
        }
    }

    if let Some(listen) = config.rpc_listen.clone() {
        if config.rpc_key.is_empty() {
            log::error!("rpc_listen set without rpc_key; refusing to serve unauthenticated IPC");
        } else {
            let server = Arc::new(RpcServer::new(transport.clone(), config.rpc_key.clone()));
            tokio::spawn(async move {
                if let Err(err) = server.serve(listen).await {
                    log::error!("rpc server failed: {}", err);
                }
            });
        }
    }

    // Flush tables on a clean exit too.
    let flush_transport = transport.clone();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("shutting down");
        }
        _ = stats_heartbeat(transport.clone(), config.announce_interval_secs) => {}
    }

    flush_transport.persist_now().await;
}

/// Destinations registered over IPC announce on request; the daemon itself
/// owns none. This loop just surfaces traffic counters at the announce
/// cadence.
async fn stats_heartbeat(transport: Arc<Transport>, interval_secs: u64) {
    loop {
        tokio::time::sleep(Duration::from_secs(interval_secs.max(60))).await;
        let stats = transport.stats().await;
        log::info!(
            "stats: {} in / {} out / {} duplicates / {} crypto drops",
            stats.packets_in,
            stats.packets_out,
            stats.duplicates_dropped,
            stats.crypto_failures
        );
    }
}
