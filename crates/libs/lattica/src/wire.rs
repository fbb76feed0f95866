//! Bit-exact wire codec. All integers big-endian; packet boundaries come
//! from the interface framing (HDLC on streams, datagrams elsewhere).

use crate::buffer::{ByteReader, ByteWriter};
use crate::error::LatticaError;
use crate::hash::ShortHash;
use crate::packet::{Header, HeaderType, Packet, PacketContext, PacketPayload, PACKET_MDU};

pub trait WireEncode {
    fn encode(&self, writer: &mut ByteWriter) -> Result<usize, LatticaError>;
}

impl WireEncode for Header {
    fn encode(&self, writer: &mut ByteWriter) -> Result<usize, LatticaError> {
        writer.write(&[self.to_flags(), self.hops])
    }
}

impl WireEncode for ShortHash {
    fn encode(&self, writer: &mut ByteWriter) -> Result<usize, LatticaError> {
        writer.write(self.as_slice())
    }
}

impl WireEncode for PacketContext {
    fn encode(&self, writer: &mut ByteWriter) -> Result<usize, LatticaError> {
        writer.write_u8(*self as u8)
    }
}

impl WireEncode for Packet {
    fn encode(&self, writer: &mut ByteWriter) -> Result<usize, LatticaError> {
        self.header.encode(writer)?;

        if self.header.header_type == HeaderType::Type2 {
            let transport = self.transport.ok_or(LatticaError::InvalidArgument)?;
            transport.encode(writer)?;
        }

        self.destination.encode(writer)?;
        self.context.encode(writer)?;
        writer.write(self.data.as_slice())?;

        Ok(writer.written())
    }
}

impl Header {
    pub fn decode(reader: &mut ByteReader) -> Result<Header, LatticaError> {
        let mut header = Header::from_flags(reader.read_u8()?);
        header.hops = reader.read_u8()?;
        Ok(header)
    }
}

impl ShortHash {
    pub fn decode(reader: &mut ByteReader) -> Result<ShortHash, LatticaError> {
        let mut hash = ShortHash::zero();
        reader.read_into(hash.as_mut_slice())?;
        Ok(hash)
    }
}

impl Packet {
    pub fn decode(reader: &mut ByteReader) -> Result<Packet, LatticaError> {
        let header = Header::decode(reader)?;

        let transport = if header.header_type == HeaderType::Type2 {
            Some(ShortHash::decode(reader)?)
        } else {
            None
        };

        let destination = ShortHash::decode(reader)?;
        let context = PacketContext::from(reader.read_u8()?);

        let remaining = reader.remaining();
        if remaining > PACKET_MDU {
            return Err(LatticaError::PacketError);
        }

        let mut data = PacketPayload::new();
        reader.read_into(data.grow_to(remaining))?;

        Ok(Packet { header, ifac: None, destination, transport, context, data })
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Packet, LatticaError> {
        Packet::decode(&mut ByteReader::new(bytes))
    }

    pub fn to_wire(&self) -> Result<Vec<u8>, LatticaError> {
        let mut backing = vec![0u8; self.wire_len()];
        let mut writer = ByteWriter::new(&mut backing);
        let len = self.encode(&mut writer)?;
        backing.truncate(len);
        Ok(backing)
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::WireEncode;
    use crate::buffer::{ByteReader, ByteWriter, FixedBuf};
    use crate::hash::ShortHash;
    use crate::packet::{
        DestinationType, Header, HeaderType, Packet, PacketContext, PacketType, PropagationType,
    };

    fn sample_packet() -> Packet {
        let mut packet = Packet {
            header: Header {
                packet_type: PacketType::Announce,
                ..Default::default()
            },
            destination: ShortHash::random(OsRng),
            context: PacketContext::None,
            data: FixedBuf::from_slice(b"lattica wire sample"),
            ..Default::default()
        };
        packet.header.destination_type = DestinationType::Single;
        packet
    }

    #[test]
    fn wire_roundtrip_type1() {
        let packet = sample_packet();
        let wire = packet.to_wire().expect("encoded packet");
        let decoded = Packet::from_wire(&wire).expect("decoded packet");

        assert_eq!(decoded.header, packet.header);
        assert_eq!(decoded.destination, packet.destination);
        assert_eq!(decoded.transport, None);
        assert_eq!(decoded.context, packet.context);
        assert_eq!(decoded.data.as_slice(), packet.data.as_slice());
    }

    #[test]
    fn wire_roundtrip_type2() {
        let mut packet = sample_packet();
        packet.header.header_type = HeaderType::Type2;
        packet.header.propagation_type = PropagationType::Transport;
        packet.header.hops = 5;
        packet.transport = Some(ShortHash::random(OsRng));

        let wire = packet.to_wire().expect("encoded packet");
        assert_eq!(wire.len(), packet.wire_len());

        let decoded = Packet::from_wire(&wire).expect("decoded packet");
        assert_eq!(decoded.transport, packet.transport);
        assert_eq!(decoded.header.hops, 5);
        assert_eq!(decoded.data.as_slice(), packet.data.as_slice());
    }

    #[test]
    fn type2_without_transport_address_fails_encode() {
        let mut packet = sample_packet();
        packet.header.header_type = HeaderType::Type2;
        packet.transport = None;

        let mut backing = [0u8; 128];
        let mut writer = ByteWriter::new(&mut backing);
        assert!(packet.encode(&mut writer).is_err());
    }

    #[test]
    fn truncated_wire_fails_decode() {
        let packet = sample_packet();
        let wire = packet.to_wire().expect("encoded packet");

        let mut reader = ByteReader::new(&wire[..10]);
        assert!(Packet::decode(&mut reader).is_err());
    }
}
