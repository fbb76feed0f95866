use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::LatticaError;
use crate::iface::tcp_client::TcpClient;
use crate::iface::{Interface, InterfaceContext, InterfaceManager, InterfaceProperties};

/// Listens for inbound TCP peers and attaches each accepted stream as its
/// own [`TcpClient`] interface.
pub struct TcpServer {
    addr: String,
    iface_manager: Arc<tokio::sync::Mutex<InterfaceManager>>,
    properties: InterfaceProperties,
}

impl TcpServer {
    pub fn new<T: Into<String>>(
        addr: T,
        iface_manager: Arc<tokio::sync::Mutex<InterfaceManager>>,
    ) -> Self {
        Self { addr: addr.into(), iface_manager, properties: InterfaceProperties::default() }
    }

    pub fn with_properties(mut self, properties: InterfaceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub async fn spawn(context: InterfaceContext<Self>) {
        let (addr, iface_manager, client_properties) = {
            let Ok(inner) = context.inner.lock() else {
                return;
            };
            (inner.addr.clone(), inner.iface_manager.clone(), inner.properties.clone())
        };

        let (_, tx_channel) = context.channel.split();
        let tx_channel = Arc::new(tokio::sync::Mutex::new(tx_channel));

        loop {
            if context.cancel.is_cancelled() {
                break;
            }

            let listener =
                TcpListener::bind(addr.clone()).await.map_err(|_| LatticaError::ConnectionError);

            let Ok(listener) = listener else {
                log::warn!("tcp_server: couldn't bind <{}>", addr);
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            };

            log::info!("tcp_server: listening on <{}>", addr);

            // The listener itself never transmits; drain its queue so
            // broadcasts don't back up behind it.
            let drain_task = {
                let cancel = context.cancel.clone();
                let tx_channel = tx_channel.clone();

                tokio::spawn(async move {
                    loop {
                        let mut tx_channel = tx_channel.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tx_channel.recv() => {}
                        }
                    }
                })
            };

            loop {
                tokio::select! {
                    _ = context.cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        if let Ok((stream, peer)) = accepted {
                            log::info!("tcp_server: peer <{}> connected on <{}>", peer, addr);

                            let mut iface_manager = iface_manager.lock().await;
                            iface_manager.spawn(
                                TcpClient::from_stream(peer.to_string(), stream)
                                    .with_properties(client_properties.clone()),
                                TcpClient::spawn,
                            );
                        }
                    }
                }
            }

            let _ = tokio::join!(drain_task);
        }
    }
}

impl Interface for TcpServer {
    fn properties(&self) -> InterfaceProperties {
        self.properties.clone()
    }
}
