use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::LatticaError;
use crate::iface::{Interface, InterfaceContext, InterfaceMode, InterfaceProperties, RxMessage};

const BUFFER_SIZE: usize = 4096;

/// Datagram interface: one packet per datagram, no extra framing.
pub struct UdpInterface {
    bind_addr: String,
    forward_addr: Option<String>,
    properties: InterfaceProperties,
}

impl UdpInterface {
    pub fn new<T: Into<String>>(bind_addr: T, forward_addr: Option<T>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            forward_addr: forward_addr.map(Into::into),
            properties: InterfaceProperties::new(InterfaceMode::Full, 10_000_000, 1064),
        }
    }

    pub fn with_properties(mut self, properties: InterfaceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub async fn spawn(context: InterfaceContext<Self>) {
        let (bind_addr, forward_addr) = {
            let Ok(inner) = context.inner.lock() else {
                return;
            };
            (inner.bind_addr.clone(), inner.forward_addr.clone())
        };
        let properties = context.properties.clone();
        let iface_address = context.channel.address;

        let (rx_channel, tx_channel) = context.channel.split();
        let tx_channel = Arc::new(tokio::sync::Mutex::new(tx_channel));

        loop {
            if context.cancel.is_cancelled() {
                break;
            }

            let socket =
                UdpSocket::bind(bind_addr.clone()).await.map_err(|_| LatticaError::ConnectionError);

            let Ok(socket) = socket else {
                log::info!("udp: couldn't bind <{}>", bind_addr);
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            };

            log::info!("udp: bound <{}>", bind_addr);

            let cancel = context.cancel.clone();
            let stop = CancellationToken::new();
            let read_socket = Arc::new(socket);
            let write_socket = read_socket.clone();

            let rx_task = {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let rx_channel = rx_channel.clone();
                let properties = properties.clone();

                tokio::spawn(async move {
                    let mut rx_buffer = [0u8; BUFFER_SIZE];
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            result = read_socket.recv_from(&mut rx_buffer) => {
                                match result {
                                    Ok((n, _peer)) => {
                                        match properties.decode_frame(&rx_buffer[..n]) {
                                            Ok(packet) => {
                                                let _ = rx_channel
                                                    .send(RxMessage { address: iface_address, packet })
                                                    .await;
                                            }
                                            Err(_) => {
                                                log::debug!("udp: dropping undecodable datagram");
                                            }
                                        }
                                    }
                                    Err(err) => {
                                        log::warn!("udp: socket error {}", err);
                                        stop.cancel();
                                        break;
                                    }
                                }
                            }
                        }
                    }
                })
            };

            let tx_task = forward_addr.clone().map(|forward_addr| {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let tx_channel = tx_channel.clone();
                let properties = properties.clone();

                tokio::spawn(async move {
                    loop {
                        let mut tx_channel = tx_channel.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            Some(message) = tx_channel.recv() => {
                                match properties.encode_frame(&message.packet) {
                                    Ok(frame) => {
                                        let _ = write_socket.send_to(&frame, &forward_addr).await;
                                    }
                                    Err(_) => {
                                        log::warn!("udp: failed to encode packet");
                                    }
                                }
                            }
                        }
                    }
                })
            });

            if let Some(tx_task) = tx_task {
                let _ = tokio::join!(rx_task, tx_task);
            } else {
                let _ = tokio::join!(rx_task);
            }

            log::info!("udp: <{}> closed", bind_addr);
        }
    }
}

impl Interface for UdpInterface {
    fn properties(&self) -> InterfaceProperties {
        self.properties.clone()
    }
}
