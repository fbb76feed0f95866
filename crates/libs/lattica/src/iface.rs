pub mod hdlc;
pub mod tcp_client;
pub mod tcp_server;
pub mod udp;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash};
use crate::ifac::IfacContext;
use crate::packet::Packet;

pub type InterfaceTxSender = mpsc::Sender<TxMessage>;
pub type InterfaceTxReceiver = mpsc::Receiver<TxMessage>;

pub type InterfaceRxSender = mpsc::Sender<RxMessage>;
pub type InterfaceRxReceiver = mpsc::Receiver<RxMessage>;

/// Operating mode declared by each interface. The transport floods
/// forwarded broadcasts only over `Full`, `Gateway` and `Roaming`
/// interfaces, and path-table entries learned through a mode expire on that
/// mode's TTL.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub enum InterfaceMode {
    Full,
    AccessPoint,
    PointToPoint,
    Roaming,
    Boundary,
    Gateway,
}

impl InterfaceMode {
    pub fn floods_forwarded_broadcasts(&self) -> bool {
        matches!(self, InterfaceMode::Full | InterfaceMode::Gateway | InterfaceMode::Roaming)
    }
}

/// Capability set every physical interface declares when it attaches.
#[derive(Clone)]
pub struct InterfaceProperties {
    pub mode: InterfaceMode,
    /// Nominal carrier speed in bits per second; drives announce bandwidth
    /// caps and transfer timeout scaling.
    pub bitrate: u64,
    /// Carrier MTU in bytes, at least [`crate::packet::PACKET_MTU`].
    pub mtu: usize,
    pub ifac: Option<IfacContext>,
}

impl InterfaceProperties {
    pub fn new(mode: InterfaceMode, bitrate: u64, mtu: usize) -> Self {
        Self { mode, bitrate, mtu, ifac: None }
    }

    pub fn with_ifac(mut self, ifac: IfacContext) -> Self {
        self.ifac = Some(ifac);
        self
    }

    /// Serializes a packet and applies the access code when configured.
    pub fn encode_frame(&self, packet: &Packet) -> Result<Vec<u8>, LatticaError> {
        let raw = packet.to_wire()?;
        match &self.ifac {
            Some(ifac) => ifac.seal_frame(&raw),
            None => Ok(raw),
        }
    }

    /// Parses a received frame, verifying and stripping the access code
    /// first when configured. Frames failing the code check surface as
    /// errors and must be dropped without logging above debug.
    pub fn decode_frame(&self, bytes: &[u8]) -> Result<Packet, LatticaError> {
        match &self.ifac {
            Some(ifac) => {
                let inner = ifac.open_frame(bytes)?;
                Packet::from_wire(&inner)
            }
            None => {
                // An authenticated frame on an open interface is noise.
                if bytes.first().is_some_and(|flags| flags & 0b1000_0000 != 0) {
                    return Err(LatticaError::IncorrectSignature);
                }
                Packet::from_wire(bytes)
            }
        }
    }
}

impl Default for InterfaceProperties {
    fn default() -> Self {
        Self::new(InterfaceMode::Full, 10_000_000, 2048)
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TxMessageType {
    /// Flood, optionally excluding the interface the packet arrived on. The
    /// exclusion also marks the flood as forwarded rather than locally
    /// originated, which restricts it to flooding interface modes.
    Broadcast(Option<ShortHash>),
    Direct(ShortHash),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct TxMessage {
    pub tx_type: TxMessageType,
    pub packet: Packet,
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct TxDispatchTrace {
    pub matched_ifaces: usize,
    pub sent_ifaces: usize,
    pub failed_ifaces: usize,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct RxMessage {
    /// Handle of the interface the packet arrived on.
    pub address: ShortHash,
    pub packet: Packet,
}

/// Channel ends handed to a spawned interface worker.
pub struct InterfaceChannel {
    pub address: ShortHash,
    pub rx_channel: InterfaceRxSender,
    pub tx_channel: InterfaceTxReceiver,
    pub stop: CancellationToken,
}

impl InterfaceChannel {
    pub fn address(&self) -> &ShortHash {
        &self.address
    }

    pub fn split(self) -> (InterfaceRxSender, InterfaceTxReceiver) {
        (self.rx_channel, self.tx_channel)
    }
}

pub trait Interface {
    fn properties(&self) -> InterfaceProperties;
}

struct AttachedInterface {
    address: ShortHash,
    tx_send: InterfaceTxSender,
    stop: CancellationToken,
    properties: InterfaceProperties,
}

pub struct InterfaceContext<T: Interface> {
    pub inner: Arc<Mutex<T>>,
    pub channel: InterfaceChannel,
    pub properties: InterfaceProperties,
    pub cancel: CancellationToken,
}

pub struct InterfaceManager {
    counter: usize,
    rx_recv: Arc<tokio::sync::Mutex<InterfaceRxReceiver>>,
    rx_send: InterfaceRxSender,
    cancel: CancellationToken,
    ifaces: Vec<AttachedInterface>,
}

const DEFAULT_TX_QUEUE_CAPACITY: usize = 128;

/// Bounded wait before a full TX queue drops the packet. Keeps bursts from
/// stalling the transport loop while still riding out short stalls.
const TX_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

impl InterfaceManager {
    pub fn new(rx_cap: usize) -> Self {
        let (rx_send, rx_recv) = mpsc::channel(rx_cap);
        Self {
            counter: 0,
            rx_recv: Arc::new(tokio::sync::Mutex::new(rx_recv)),
            rx_send,
            cancel: CancellationToken::new(),
            ifaces: Vec::new(),
        }
    }

    fn attach(&mut self, tx_cap: usize, properties: InterfaceProperties) -> InterfaceChannel {
        self.counter += 1;
        let address = ShortHash::truncating(&Hash::of(&self.counter.to_le_bytes()));

        let (tx_send, tx_recv) = mpsc::channel(tx_cap);
        let stop = CancellationToken::new();

        log::debug!("iface: attach {} ({:?})", address, properties.mode);

        self.ifaces.push(AttachedInterface {
            address,
            tx_send,
            stop: stop.clone(),
            properties,
        });

        InterfaceChannel { rx_channel: self.rx_send.clone(), tx_channel: tx_recv, address, stop }
    }

    pub fn spawn<T: Interface, F, R>(&mut self, inner: T, worker: F) -> ShortHash
    where
        F: FnOnce(InterfaceContext<T>) -> R,
        R: std::future::Future<Output = ()> + Send + 'static,
    {
        let properties = inner.properties();
        let channel = self.attach(DEFAULT_TX_QUEUE_CAPACITY, properties.clone());
        let address = *channel.address();

        let context = InterfaceContext {
            inner: Arc::new(Mutex::new(inner)),
            channel,
            properties,
            cancel: self.cancel.clone(),
        };

        task::spawn(worker(context));

        address
    }

    pub fn receiver(&self) -> Arc<tokio::sync::Mutex<InterfaceRxReceiver>> {
        self.rx_recv.clone()
    }

    pub fn properties_of(&self, address: &ShortHash) -> Option<InterfaceProperties> {
        self.ifaces
            .iter()
            .find(|iface| iface.address == *address)
            .map(|iface| iface.properties.clone())
    }

    pub fn addresses(&self) -> Vec<ShortHash> {
        self.ifaces.iter().map(|iface| iface.address).collect()
    }

    /// Drops interfaces whose workers have gone offline; returns how many
    /// were detached.
    pub fn cleanup(&mut self) -> usize {
        let before = self.ifaces.len();
        self.ifaces.retain(|iface| {
            if iface.stop.is_cancelled() {
                log::info!("iface: detach {}", iface.address);
                false
            } else {
                true
            }
        });
        before - self.ifaces.len()
    }

    pub async fn send(&self, message: TxMessage) -> TxDispatchTrace {
        let mut trace = TxDispatchTrace::default();

        for iface in &self.ifaces {
            let should_send = match message.tx_type {
                TxMessageType::Broadcast(exclude) => match exclude {
                    Some(source) => {
                        source != iface.address
                            && iface.properties.mode.floods_forwarded_broadcasts()
                    }
                    None => true,
                },
                TxMessageType::Direct(address) => address == iface.address,
            };

            if !should_send || iface.stop.is_cancelled() {
                continue;
            }

            trace.matched_ifaces += 1;
            match iface.tx_send.try_send(message) {
                Ok(()) => trace.sent_ifaces += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // One bounded retry so proofs and receipts survive
                    // bursts; anything slower than that is congestion and
                    // the packet is shed.
                    match tokio::time::timeout(TX_ENQUEUE_TIMEOUT, iface.tx_send.send(message))
                        .await
                    {
                        Ok(Ok(())) => {
                            trace.sent_ifaces += 1;
                            log::debug!("iface({}): tx queue drained after stall", iface.address);
                        }
                        Ok(Err(_)) => {
                            trace.failed_ifaces += 1;
                            log::warn!("iface({}): tx queue closed", iface.address);
                        }
                        Err(_) => {
                            trace.failed_ifaces += 1;
                            log::warn!("iface({}): tx queue full, packet shed", iface.address);
                        }
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace.failed_ifaces += 1;
                    log::warn!("iface({}): tx queue closed", iface.address);
                }
            }
        }

        trace
    }
}

impl Drop for InterfaceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Serializes a packet for a driver, honouring the interface MTU.
pub fn frame_for_wire(
    properties: &InterfaceProperties,
    packet: &Packet,
) -> Result<Vec<u8>, LatticaError> {
    let frame = properties.encode_frame(packet)?;
    if frame.len() > properties.mtu {
        return Err(LatticaError::OutOfMemory);
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{InterfaceMode, InterfaceProperties};
    use crate::buffer::FixedBuf;
    use crate::hash::ShortHash;
    use crate::ifac::{IfacContext, IFAC_DEFAULT_SIZE};
    use crate::packet::Packet;

    fn sample_packet() -> Packet {
        Packet {
            destination: ShortHash::random(OsRng),
            data: FixedBuf::from_slice(b"frame body"),
            ..Default::default()
        }
    }

    #[test]
    fn open_interface_passes_plain_frames() {
        let properties = InterfaceProperties::new(InterfaceMode::Full, 1_000_000, 2048);
        let packet = sample_packet();

        let frame = properties.encode_frame(&packet).expect("encoded");
        let decoded = properties.decode_frame(&frame).expect("decoded");
        assert_eq!(decoded.destination, packet.destination);
    }

    #[test]
    fn ifac_interface_roundtrips_and_filters() {
        let authed = InterfaceProperties::new(InterfaceMode::Full, 1_000_000, 2048)
            .with_ifac(IfacContext::new("segment-7", IFAC_DEFAULT_SIZE));
        let open = InterfaceProperties::new(InterfaceMode::Full, 1_000_000, 2048);
        let packet = sample_packet();

        let sealed = authed.encode_frame(&packet).expect("sealed");
        let decoded = authed.decode_frame(&sealed).expect("decoded");
        assert_eq!(decoded.destination, packet.destination);

        // Authenticated traffic is invisible to open interfaces and
        // vice versa.
        assert!(open.decode_frame(&sealed).is_err());
        let plain = open.encode_frame(&packet).expect("plain");
        assert!(authed.decode_frame(&plain).is_err());
    }

    #[test]
    fn only_flooding_modes_carry_forwarded_broadcasts() {
        assert!(InterfaceMode::Full.floods_forwarded_broadcasts());
        assert!(InterfaceMode::Gateway.floods_forwarded_broadcasts());
        assert!(InterfaceMode::Roaming.floods_forwarded_broadcasts());
        assert!(!InterfaceMode::AccessPoint.floods_forwarded_broadcasts());
        assert!(!InterfaceMode::PointToPoint.floods_forwarded_broadcasts());
        assert!(!InterfaceMode::Boundary.floods_forwarded_broadcasts());
    }
}
