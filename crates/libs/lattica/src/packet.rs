use core::fmt;

use sha2::Digest;

use crate::buffer::FixedBuf;
use crate::hash::{Hash, ShortHash, SHORT_HASH_SIZE};

/// Largest payload a packet can carry: the 500-byte carrier MTU minus the
/// two-address header (2 + 1 + 16·2) and one reserved IFAC byte.
pub const PACKET_MDU: usize = 464;

pub const PACKET_MTU: usize = 500;

pub const IFAC_MAX_LENGTH: usize = 64;

/// Header flag byte, MSB first:
/// `ifac(1) | header_type(1) | propagation_type(2) | destination_type(2) | packet_type(2)`.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum IfacFlag {
    Open = 0b0,
    Authenticated = 0b1,
}

impl From<u8> for IfacFlag {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => IfacFlag::Authenticated,
            _ => IfacFlag::Open,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeaderType {
    /// One address: destination only.
    Type1 = 0b0,
    /// Two addresses: transport hop followed by destination.
    Type2 = 0b1,
}

impl From<u8> for HeaderType {
    fn from(value: u8) -> Self {
        match value & 0b1 {
            0b1 => HeaderType::Type2,
            _ => HeaderType::Type1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PropagationType {
    Broadcast = 0b00,
    Transport = 0b01,
}

impl From<u8> for PropagationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PropagationType::Transport,
            _ => PropagationType::Broadcast,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DestinationType {
    Single = 0b00,
    Group = 0b01,
    Plain = 0b10,
    Link = 0b11,
}

impl From<u8> for DestinationType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => DestinationType::Group,
            0b10 => DestinationType::Plain,
            0b11 => DestinationType::Link,
            _ => DestinationType::Single,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketType {
    Data = 0b00,
    Announce = 0b01,
    LinkRequest = 0b10,
    Proof = 0b11,
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value & 0b11 {
            0b01 => PacketType::Announce,
            0b10 => PacketType::LinkRequest,
            0b11 => PacketType::Proof,
            _ => PacketType::Data,
        }
    }
}

/// The context byte qualifies the payload within a packet type.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PacketContext {
    None = 0x00,
    Resource = 0x01,
    ResourceAdvertisement = 0x02,
    ResourceRequest = 0x03,
    ResourceHashUpdate = 0x04,
    ResourceProof = 0x05,
    ResourceInitiatorCancel = 0x06,
    ResourceReceiverCancel = 0x07,
    CacheRequest = 0x08,
    Request = 0x09,
    Response = 0x0A,
    PathResponse = 0x0B,
    Command = 0x0C,
    CommandStatus = 0x0D,
    Channel = 0x0E,
    KeepAlive = 0xFA,
    LinkIdentify = 0xFB,
    LinkClose = 0xFC,
    LinkProof = 0xFD,
    LinkRtt = 0xFE,
    LinkRequestProof = 0xFF,
}

impl From<u8> for PacketContext {
    fn from(value: u8) -> Self {
        match value {
            0x01 => PacketContext::Resource,
            0x02 => PacketContext::ResourceAdvertisement,
            0x03 => PacketContext::ResourceRequest,
            0x04 => PacketContext::ResourceHashUpdate,
            0x05 => PacketContext::ResourceProof,
            0x06 => PacketContext::ResourceInitiatorCancel,
            0x07 => PacketContext::ResourceReceiverCancel,
            0x08 => PacketContext::CacheRequest,
            0x09 => PacketContext::Request,
            0x0A => PacketContext::Response,
            0x0B => PacketContext::PathResponse,
            0x0C => PacketContext::Command,
            0x0D => PacketContext::CommandStatus,
            0x0E => PacketContext::Channel,
            0xFA => PacketContext::KeepAlive,
            0xFB => PacketContext::LinkIdentify,
            0xFC => PacketContext::LinkClose,
            0xFD => PacketContext::LinkProof,
            0xFE => PacketContext::LinkRtt,
            0xFF => PacketContext::LinkRequestProof,
            _ => PacketContext::None,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Header {
    pub ifac_flag: IfacFlag,
    pub header_type: HeaderType,
    pub propagation_type: PropagationType,
    pub destination_type: DestinationType,
    pub packet_type: PacketType,
    pub hops: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type1,
            propagation_type: PropagationType::Broadcast,
            destination_type: DestinationType::Single,
            packet_type: PacketType::Data,
            hops: 0,
        }
    }
}

impl Header {
    pub fn to_flags(&self) -> u8 {
        (self.ifac_flag as u8) << 7
            | (self.header_type as u8) << 6
            | (self.propagation_type as u8) << 4
            | (self.destination_type as u8) << 2
            | (self.packet_type as u8)
    }

    pub fn from_flags(flags: u8) -> Self {
        Self {
            ifac_flag: IfacFlag::from(flags >> 7),
            header_type: HeaderType::from(flags >> 6),
            propagation_type: PropagationType::from(flags >> 4),
            destination_type: DestinationType::from(flags >> 2),
            packet_type: PacketType::from(flags),
            hops: 0,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08b}.{}", self.to_flags(), self.hops)
    }
}

pub type PacketPayload = FixedBuf<PACKET_MDU>;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct IfacCode {
    code: [u8; IFAC_MAX_LENGTH],
    len: usize,
}

impl IfacCode {
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut code = [0u8; IFAC_MAX_LENGTH];
        let len = core::cmp::min(slice.len(), IFAC_MAX_LENGTH);
        code[..len].copy_from_slice(&slice[..len]);
        Self { code, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.code[..self.len]
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Packet {
    pub header: Header,
    pub ifac: Option<IfacCode>,
    pub destination: ShortHash,
    pub transport: Option<ShortHash>,
    pub context: PacketContext,
    pub data: PacketPayload,
}

impl Packet {
    /// Content hash used for dedup, proofs and link ids. Masks the header
    /// down to the destination- and packet-type bits so that hop counting
    /// and Type1→Type2 promotion in flight do not change a packet's
    /// identity.
    pub fn hash(&self) -> Hash {
        Hash::new(
            Hash::hasher()
                .chain_update([self.header.to_flags() & 0b0000_1111])
                .chain_update(self.destination.as_slice())
                .chain_update([self.context as u8])
                .chain_update(self.data.as_slice())
                .finalize()
                .into(),
        )
    }

    pub fn short_hash(&self) -> ShortHash {
        ShortHash::truncating(&self.hash())
    }

    /// Serialized size on the wire, excluding interface framing.
    pub fn wire_len(&self) -> usize {
        let addresses = match self.header.header_type {
            HeaderType::Type1 => SHORT_HASH_SIZE,
            HeaderType::Type2 => SHORT_HASH_SIZE * 2,
        };
        2 + addresses + 1 + self.data.len()
    }
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            header: Header::default(),
            ifac: None,
            destination: ShortHash::zero(),
            transport: None,
            context: PacketContext::None,
            data: PacketPayload::new(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.header)?;
        if let Some(transport) = self.transport {
            write!(f, " via {}", transport)?;
        }
        write!(f, " {} {}B]", self.destination, self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DestinationType, Header, HeaderType, IfacFlag, Packet, PacketType, PropagationType,
    };
    use crate::buffer::FixedBuf;
    use crate::hash::ShortHash;
    use crate::packet::PacketContext;

    #[test]
    fn flag_byte_roundtrip() {
        let header = Header {
            ifac_flag: IfacFlag::Authenticated,
            header_type: HeaderType::Type2,
            propagation_type: PropagationType::Transport,
            destination_type: DestinationType::Link,
            packet_type: PacketType::Proof,
            hops: 0,
        };

        let flags = header.to_flags();
        assert_eq!(flags, 0b1101_1111);

        let decoded = Header::from_flags(flags);
        assert_eq!(decoded.ifac_flag, IfacFlag::Authenticated);
        assert_eq!(decoded.header_type, HeaderType::Type2);
        assert_eq!(decoded.propagation_type, PropagationType::Transport);
        assert_eq!(decoded.destination_type, DestinationType::Link);
        assert_eq!(decoded.packet_type, PacketType::Proof);
    }

    #[test]
    fn hash_ignores_hops_and_transport_promotion() {
        let mut packet = Packet {
            destination: ShortHash::of(b"destination"),
            data: FixedBuf::from_slice(b"payload"),
            context: PacketContext::None,
            ..Default::default()
        };
        let original = packet.hash();

        packet.header.hops = 3;
        packet.header.header_type = HeaderType::Type2;
        packet.header.propagation_type = PropagationType::Transport;
        packet.transport = Some(ShortHash::of(b"relay"));

        assert_eq!(packet.hash(), original);
    }

    #[test]
    fn hash_changes_with_payload() {
        let mut packet = Packet {
            destination: ShortHash::of(b"destination"),
            data: FixedBuf::from_slice(b"payload"),
            ..Default::default()
        };
        let original = packet.hash();

        packet.data = FixedBuf::from_slice(b"payloae");
        assert_ne!(packet.hash(), original);
    }
}
