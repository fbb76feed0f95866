use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::buffer::ByteWriter;
use crate::error::LatticaError;
use crate::iface::hdlc::Hdlc;
use crate::iface::{Interface, InterfaceContext, InterfaceMode, InterfaceProperties, RxMessage};

const BUFFER_SIZE: usize = 2048;
const RECONNECT_WAIT_SECS: u64 = 5;

/// HDLC-framed TCP interface. Reconnects forever when used as an outbound
/// client; runs a single stream to completion when adopted from a server
/// accept.
pub struct TcpClient {
    addr: String,
    stream: Option<TcpStream>,
    properties: InterfaceProperties,
}

impl TcpClient {
    pub fn new<T: Into<String>>(addr: T) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
            properties: InterfaceProperties::new(InterfaceMode::Full, 10_000_000, BUFFER_SIZE),
        }
    }

    pub fn with_properties(mut self, properties: InterfaceProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn from_stream<T: Into<String>>(addr: T, stream: TcpStream) -> Self {
        Self {
            addr: addr.into(),
            stream: Some(stream),
            properties: InterfaceProperties::new(InterfaceMode::Full, 10_000_000, BUFFER_SIZE),
        }
    }

    pub async fn spawn(context: InterfaceContext<TcpClient>) {
        let iface_stop = context.channel.stop.clone();
        let iface_address = context.channel.address;
        let properties = context.properties.clone();
        let (addr, mut adopted) = {
            let Ok(mut inner) = context.inner.lock() else {
                return;
            };
            (inner.addr.clone(), inner.stream.take())
        };

        let (rx_channel, tx_channel) = context.channel.split();
        let tx_channel = Arc::new(tokio::sync::Mutex::new(tx_channel));

        let mut single_shot = false;
        loop {
            if single_shot || context.cancel.is_cancelled() {
                break;
            }

            let stream = match adopted.take() {
                Some(stream) => {
                    single_shot = true;
                    Ok(stream)
                }
                None => TcpStream::connect(addr.clone())
                    .await
                    .map_err(|_| LatticaError::ConnectionError),
            };

            let Ok(stream) = stream else {
                log::info!("tcp_client: no connection to <{}>", addr);
                tokio::time::sleep(std::time::Duration::from_secs(RECONNECT_WAIT_SECS)).await;
                continue;
            };

            log::info!("tcp_client: connected to <{}>", addr);

            let cancel = context.cancel.clone();
            let stop = CancellationToken::new();
            let (read_stream, write_stream) = stream.into_split();

            let rx_task = {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let mut stream = read_stream;
                let rx_channel = rx_channel.clone();
                let properties = properties.clone();

                tokio::spawn(async move {
                    let mut frame_scratch = [0u8; BUFFER_SIZE];
                    let mut stream_buffer: Vec<u8> = Vec::with_capacity(BUFFER_SIZE * 4);
                    let mut read_buffer = [0u8; BUFFER_SIZE * 16];

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            result = stream.read(&mut read_buffer[..]) => {
                                match result {
                                    Ok(0) => {
                                        log::info!("tcp_client: connection closed");
                                        stop.cancel();
                                        break;
                                    }
                                    Ok(n) => {
                                        // The stream can deliver partial or
                                        // coalesced frames.
                                        stream_buffer.extend_from_slice(&read_buffer[..n]);

                                        while let Some((start, end)) = Hdlc::find(&stream_buffer) {
                                            let frame = &stream_buffer[start..=end];
                                            let mut writer = ByteWriter::new(&mut frame_scratch[..]);
                                            if let Ok(len) = Hdlc::decode(frame, &mut writer) {
                                                match properties.decode_frame(&frame_scratch[..len]) {
                                                    Ok(packet) => {
                                                        let _ = rx_channel
                                                            .send(RxMessage { address: iface_address, packet })
                                                            .await;
                                                    }
                                                    Err(_) => {
                                                        log::debug!("tcp_client: dropping undecodable frame");
                                                    }
                                                }
                                            } else {
                                                log::debug!("tcp_client: dropping broken hdlc frame");
                                            }
                                            stream_buffer.drain(..=end);
                                        }

                                        if stream_buffer.len() > BUFFER_SIZE * 64 {
                                            // No frame ever closed; reset to
                                            // bound memory on garbage streams.
                                            stream_buffer.clear();
                                        }
                                    }
                                    Err(err) => {
                                        log::warn!("tcp_client: read error {}", err);
                                        stop.cancel();
                                        break;
                                    }
                                }
                            }
                        }
                    }
                })
            };

            let tx_task = {
                let cancel = cancel.clone();
                let stop = stop.clone();
                let tx_channel = tx_channel.clone();
                let mut stream = write_stream;
                let properties = properties.clone();

                tokio::spawn(async move {
                    let mut hdlc_scratch = [0u8; BUFFER_SIZE * 2];

                    loop {
                        let mut tx_channel = tx_channel.lock().await;

                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = stop.cancelled() => break,
                            Some(message) = tx_channel.recv() => {
                                let Ok(frame) = properties.encode_frame(&message.packet) else {
                                    log::warn!("tcp_client: failed to encode packet");
                                    continue;
                                };

                                let mut writer = ByteWriter::new(&mut hdlc_scratch[..]);
                                let Ok(len) = Hdlc::encode(&frame, &mut writer) else {
                                    log::warn!("tcp_client: frame too large for hdlc scratch");
                                    continue;
                                };

                                if let Err(err) = stream.write_all(&hdlc_scratch[..len]).await {
                                    log::warn!("tcp_client: write failed: {}", err);
                                    stop.cancel();
                                    break;
                                }
                                if let Err(err) = stream.flush().await {
                                    log::warn!("tcp_client: flush failed: {}", err);
                                    stop.cancel();
                                    break;
                                }
                            }
                        }
                    }
                })
            };

            let _ = tokio::join!(rx_task, tx_task);

            log::info!("tcp_client: disconnected from <{}>", addr);
        }

        iface_stop.cancel();
    }
}

impl Interface for TcpClient {
    fn properties(&self) -> InterfaceProperties {
        self.properties.clone()
    }
}
