//! Local IPC for shared-instance operation. One process owns the physical
//! interfaces and serves this framed command channel on localhost; other
//! local programs attach as clients. The first frame on every connection
//! must authenticate with the instance's RPC key.

pub mod codec;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::destination::DestinationName;
use crate::error::LatticaError;
use crate::hash::ShortHash;
use crate::identity::PrivateIdentity;
use crate::packet::{Packet, PacketPayload};
use crate::resource::ResourceEventKind;
use crate::transport::Transport;

use codec::{read_frame, write_frame};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    pub id: u64,
    pub command: RpcCommand,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum RpcCommand {
    /// Must be the first command on a connection.
    Auth { key: String },
    /// Registers a destination owned by the calling process.
    Register { private_key: ByteBuf, app_name: String, aspects: String },
    /// Announces a previously registered destination.
    Announce { destination: ByteBuf, app_data: Option<ByteBuf> },
    /// Sends a data packet to a single destination.
    SendPacket { destination: ByteBuf, data: ByteBuf },
    /// Opens a link to a destination whose identity has been recalled.
    OpenLink { destination: ByteBuf },
    CloseLink { link_id: ByteBuf },
    PathQuery { destination: ByteBuf },
    Status,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: u64,
    pub result: Result<RpcResult, String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum RpcResult {
    Ok,
    Registered { destination: ByteBuf },
    Sent { outcome: String },
    LinkOpening { link_id: ByteBuf },
    Path { hops: Option<u8> },
    Status { packets_in: u64, packets_out: u64, duplicates: u64, crypto_failures: u64 },
}

/// Unsolicited messages pushed to authenticated clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RpcEvent {
    PacketIn { destination: ByteBuf, data: ByteBuf },
    LinkUp { link_id: ByteBuf },
    LinkDown { link_id: ByteBuf },
    ResourceProgress { hash: ByteBuf, received_parts: u64, total_parts: u64 },
}

/// A frame from server to client: either an answer or an event.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub enum RpcFrame {
    Response(RpcResponse),
    Event(RpcEvent),
}

pub struct RpcServer {
    transport: Arc<Transport>,
    key: String,
    cancel: CancellationToken,
}

impl RpcServer {
    pub fn new(transport: Arc<Transport>, key: String) -> Self {
        Self { transport, key, cancel: CancellationToken::new() }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn serve<T: Into<String>>(self: Arc<Self>, addr: T) -> std::io::Result<()> {
        let addr = addr.into();
        let listener = TcpListener::bind(&addr).await?;
        log::info!("rpc: serving on <{}>", addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, peer)) = accepted else {
                        continue;
                    };
                    log::debug!("rpc: client <{}> connected", peer);

                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_client(stream).await {
                            log::debug!("rpc: client session ended: {}", err);
                        }
                    });
                }
            }
        }

        Ok(())
    }

    async fn handle_client(&self, stream: TcpStream) -> std::io::Result<()> {
        let (mut reader, writer) = stream.into_split();
        let writer = Arc::new(Mutex::new(writer));

        // First frame must be a valid Auth; anything else closes the
        // connection without explanation.
        let first: RpcRequest = read_frame(&mut reader).await?;
        match &first.command {
            RpcCommand::Auth { key } if *key == self.key => {
                let response =
                    RpcFrame::Response(RpcResponse { id: first.id, result: Ok(RpcResult::Ok) });
                write_frame(&mut *writer.lock().await, &response).await?;
            }
            _ => {
                log::debug!("rpc: rejecting unauthenticated client");
                return Ok(());
            }
        }

        self.spawn_event_pumps(writer.clone());

        loop {
            let request: RpcRequest = match read_frame(&mut reader).await {
                Ok(request) => request,
                Err(_) => break,
            };

            let result = self.dispatch(request.command).await;
            let response = RpcFrame::Response(RpcResponse {
                id: request.id,
                result: result.map_err(|err| err.to_string()),
            });
            write_frame(&mut *writer.lock().await, &response).await?;
        }

        Ok(())
    }

    fn spawn_event_pumps(&self, writer: Arc<Mutex<OwnedWriteHalf>>) {
        {
            let mut events = self.transport.received_data_events();
            let writer = writer.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => {
                            let Ok(event) = event else { break };
                            let frame = RpcFrame::Event(RpcEvent::PacketIn {
                                destination: ByteBuf::from(event.destination.as_slice().to_vec()),
                                data: ByteBuf::from(event.data.as_slice().to_vec()),
                            });
                            if write_frame(&mut *writer.lock().await, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        for mut events in
            [self.transport.in_link_events(), self.transport.out_link_events()]
        {
            let writer = writer.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => {
                            let Ok(event) = event else { break };
                            let frame = match event.event {
                                crate::destination::link::LinkEvent::Activated => {
                                    RpcFrame::Event(RpcEvent::LinkUp {
                                        link_id: ByteBuf::from(event.id.as_slice().to_vec()),
                                    })
                                }
                                crate::destination::link::LinkEvent::Closed => {
                                    RpcFrame::Event(RpcEvent::LinkDown {
                                        link_id: ByteBuf::from(event.id.as_slice().to_vec()),
                                    })
                                }
                                _ => continue,
                            };
                            if write_frame(&mut *writer.lock().await, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        {
            let mut events = self.transport.resource_events();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => {
                            let Ok(event) = event else { break };
                            let ResourceEventKind::Progress(progress) = event.kind else {
                                continue;
                            };
                            let frame = RpcFrame::Event(RpcEvent::ResourceProgress {
                                hash: ByteBuf::from(event.hash.as_slice().to_vec()),
                                received_parts: progress.received_parts as u64,
                                total_parts: progress.total_parts as u64,
                            });
                            if write_frame(&mut *writer.lock().await, &frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    }

    async fn dispatch(&self, command: RpcCommand) -> Result<RpcResult, LatticaError> {
        match command {
            RpcCommand::Auth { .. } => Ok(RpcResult::Ok),
            RpcCommand::Register { private_key, app_name, aspects } => {
                let identity = PrivateIdentity::from_bytes(private_key.as_ref())?;
                let destination = self
                    .transport
                    .add_destination(identity, DestinationName::new(&app_name, &aspects))
                    .await;
                let hash = destination.lock().await.desc.address_hash;
                Ok(RpcResult::Registered {
                    destination: ByteBuf::from(hash.as_slice().to_vec()),
                })
            }
            RpcCommand::Announce { destination, app_data } => {
                let address = ShortHash::from_slice(destination.as_ref())?;
                let handle = {
                    let transport = &self.transport;
                    let found = transport.has_destination(&address).await;
                    if !found {
                        return Err(LatticaError::InvalidArgument);
                    }
                    transport.destination_handle(&address).await
                };
                if let Some(handle) = handle {
                    self.transport
                        .send_announce(&handle, app_data.as_ref().map(|data| data.as_ref()))
                        .await;
                }
                Ok(RpcResult::Ok)
            }
            RpcCommand::SendPacket { destination, data } => {
                let address = ShortHash::from_slice(destination.as_ref())?;
                let packet = Packet {
                    destination: address,
                    data: PacketPayload::from_slice(data.as_ref()),
                    ..Default::default()
                };
                let outcome = self.transport.send_packet_with_outcome(packet).await;
                Ok(RpcResult::Sent { outcome: format!("{:?}", outcome) })
            }
            RpcCommand::OpenLink { destination } => {
                let address = ShortHash::from_slice(destination.as_ref())?;
                let identity = self
                    .transport
                    .recall_identity(&address)
                    .await
                    .ok_or(LatticaError::InvalidArgument)?;
                let name = self
                    .transport
                    .recall_name(&address)
                    .await
                    .ok_or(LatticaError::InvalidArgument)?;
                let desc = crate::destination::DestinationDesc {
                    identity,
                    address_hash: address,
                    name,
                };
                let link = self.transport.link(desc).await;
                let link_id = *link.lock().await.id();
                Ok(RpcResult::LinkOpening {
                    link_id: ByteBuf::from(link_id.as_slice().to_vec()),
                })
            }
            RpcCommand::CloseLink { link_id } => {
                let link_id = ShortHash::from_slice(link_id.as_ref())?;
                self.transport.close_link(&link_id).await;
                Ok(RpcResult::Ok)
            }
            RpcCommand::PathQuery { destination } => {
                let address = ShortHash::from_slice(destination.as_ref())?;
                let hops = self.transport.hops_to(&address).await;
                if hops.is_none() {
                    self.transport.request_path(&address, None, None).await;
                }
                Ok(RpcResult::Path { hops })
            }
            RpcCommand::Status => {
                let stats = self.transport.stats().await;
                Ok(RpcResult::Status {
                    packets_in: stats.packets_in,
                    packets_out: stats.packets_out,
                    duplicates: stats.duplicates_dropped,
                    crypto_failures: stats.crypto_failures,
                })
            }
        }
    }
}

/// Minimal client for the command channel.
pub struct RpcClient {
    reader: tokio::net::tcp::OwnedReadHalf,
    writer: OwnedWriteHalf,
    next_id: u64,
}

impl RpcClient {
    pub async fn connect<T: Into<String>>(addr: T, key: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr.into()).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self { reader, writer, next_id: 0 };

        let response = client.call(RpcCommand::Auth { key: key.into() }).await?;
        match response.result {
            Ok(RpcResult::Ok) => Ok(client),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "rpc authentication failed",
            )),
        }
    }

    /// Sends a command and waits for its response, surfacing any events
    /// received in between through `on_event`.
    pub async fn call(&mut self, command: RpcCommand) -> std::io::Result<RpcResponse> {
        self.next_id += 1;
        let id = self.next_id;
        write_frame(&mut self.writer, &RpcRequest { id, command }).await?;

        loop {
            let frame: RpcFrame = read_frame(&mut self.reader).await?;
            match frame {
                RpcFrame::Response(response) if response.id == id => return Ok(response),
                RpcFrame::Response(_) => continue,
                RpcFrame::Event(_) => continue,
            }
        }
    }

    /// Blocks until the next pushed event.
    pub async fn next_event(&mut self) -> std::io::Result<RpcEvent> {
        loop {
            let frame: RpcFrame = read_frame(&mut self.reader).await?;
            if let RpcFrame::Event(event) = frame {
                return Ok(event);
            }
        }
    }
}
