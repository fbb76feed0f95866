use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::destination::link::{link_id_from_request, LinkId};
use crate::error::LatticaError;
use crate::hash::ShortHash;
use crate::packet::{Header, HeaderType, IfacFlag, Packet};

/// Forwarder state for a link crossing this node, recorded at link-request
/// time. Unproven entries are placeholders with a short fuse; a verified
/// proof upgrades them to the long idle timeout.
pub struct LinkEntry {
    pub timestamp: Instant,
    pub proof_deadline: Instant,
    pub next_hop: ShortHash,
    pub next_hop_iface: ShortHash,
    /// Neighbour the request came from; proofs travel back through it.
    pub received_from: ShortHash,
    pub received_iface: ShortHash,
    pub original_destination: ShortHash,
    pub taken_hops: u8,
    pub remaining_hops: u8,
    pub proven: bool,
}

#[derive(Serialize, Deserialize)]
struct TunnelRecord {
    link_id: ByteBuf,
    next_hop: ByteBuf,
    next_hop_iface: ByteBuf,
    received_from: ByteBuf,
    received_iface: ByteBuf,
    destination: ByteBuf,
    taken_hops: u8,
    remaining_hops: u8,
}

fn reverse_packet(packet: &Packet, entry: &LinkEntry) -> (Packet, ShortHash) {
    let reversed = Packet {
        header: Header {
            ifac_flag: IfacFlag::Open,
            header_type: HeaderType::Type2,
            propagation_type: packet.header.propagation_type,
            destination_type: packet.header.destination_type,
            packet_type: packet.header.packet_type,
            hops: packet.header.hops.saturating_add(1),
        },
        ifac: None,
        destination: packet.destination,
        transport: Some(entry.received_from),
        context: packet.context,
        data: packet.data,
    };

    (reversed, entry.received_iface)
}

pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    proof_timeout: Duration,
    idle_timeout: Duration,
}

impl LinkTable {
    pub fn new(proof_timeout: Duration, idle_timeout: Duration) -> Self {
        Self { entries: HashMap::new(), proof_timeout, idle_timeout }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records an in-flight link request passing through this node.
    pub fn add(
        &mut self,
        link_request: &Packet,
        destination: ShortHash,
        received_from: ShortHash,
        received_iface: ShortHash,
        next_hop: ShortHash,
        next_hop_iface: ShortHash,
    ) {
        let link_id = link_id_from_request(link_request);

        if self.entries.contains_key(&link_id) {
            return;
        }

        let now = Instant::now();
        self.entries.insert(
            link_id,
            LinkEntry {
                timestamp: now,
                proof_deadline: now + self.proof_timeout,
                next_hop,
                next_hop_iface,
                received_from,
                received_iface,
                original_destination: destination,
                taken_hops: link_request.header.hops.saturating_add(1),
                remaining_hops: 0,
                proven: false,
            },
        );
    }

    pub fn contains(&self, link_id: &LinkId) -> bool {
        self.entries.contains_key(link_id)
    }

    /// Destination behind a proven link, used when the proof's signer has
    /// to be recalled.
    pub fn original_destination(&self, link_id: &LinkId) -> Option<ShortHash> {
        self.entries.get(link_id).filter(|entry| entry.proven).map(|entry| entry.original_destination)
    }

    /// Destination of an entry regardless of proof state; relays need it to
    /// look up the signing key while validating the proof itself.
    pub fn pending_destination(&self, link_id: &LinkId) -> Option<ShortHash> {
        self.entries.get(link_id).map(|entry| entry.original_destination)
    }

    /// True when a packet arriving on `iface` came from the initiator side
    /// of the recorded link.
    pub fn arrival_side(&self, link_id: &LinkId, iface: &ShortHash) -> Option<bool> {
        self.entries.get(link_id).map(|entry| entry.received_iface == *iface)
    }

    /// Forwards a link-bound packet along the recorded forward direction.
    pub fn route_forward(&mut self, packet: &Packet) -> Option<(Packet, ShortHash)> {
        let entry = self.entries.get_mut(&packet.destination)?;
        entry.timestamp = Instant::now();

        let forwarded = Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type2,
                propagation_type: packet.header.propagation_type,
                destination_type: packet.header.destination_type,
                packet_type: packet.header.packet_type,
                hops: packet.header.hops.saturating_add(1),
            },
            ifac: None,
            destination: packet.destination,
            transport: Some(entry.next_hop),
            context: packet.context,
            data: packet.data,
        };

        Some((forwarded, entry.next_hop_iface))
    }

    /// Forwards a packet back toward the link initiator, refreshing the
    /// entry. Keepalives and proofs ride this path.
    pub fn route_reverse(&mut self, packet: &Packet) -> Option<(Packet, ShortHash)> {
        let entry = self.entries.get_mut(&packet.destination)?;
        entry.timestamp = Instant::now();
        Some(reverse_packet(packet, entry))
    }

    /// Upgrades an entry on receipt of a (forwarder-validated) link proof
    /// and hands back the reverse-path routing for it.
    pub fn handle_proof(&mut self, proof: &Packet) -> Option<(Packet, ShortHash)> {
        let entry = self.entries.get_mut(&proof.destination)?;
        entry.remaining_hops = proof.header.hops;
        entry.proven = true;
        entry.timestamp = Instant::now();
        Some(reverse_packet(proof, entry))
    }

    /// Drops unproven entries past their proof deadline and proven entries
    /// idle beyond the idle timeout.
    pub fn sweep_stale(&mut self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.idle_timeout;
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            if entry.proven {
                entry.timestamp + idle_timeout > now
            } else {
                entry.proof_deadline > now
            }
        });
        before - self.entries.len()
    }

    /// Serializes proven entries for the tunnels file.
    pub fn snapshot(&self) -> Result<Vec<u8>, LatticaError> {
        let records: Vec<TunnelRecord> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.proven)
            .map(|(link_id, entry)| TunnelRecord {
                link_id: ByteBuf::from(link_id.as_slice().to_vec()),
                next_hop: ByteBuf::from(entry.next_hop.as_slice().to_vec()),
                next_hop_iface: ByteBuf::from(entry.next_hop_iface.as_slice().to_vec()),
                received_from: ByteBuf::from(entry.received_from.as_slice().to_vec()),
                received_iface: ByteBuf::from(entry.received_iface.as_slice().to_vec()),
                destination: ByteBuf::from(entry.original_destination.as_slice().to_vec()),
                taken_hops: entry.taken_hops,
                remaining_hops: entry.remaining_hops,
            })
            .collect();

        rmp_serde::to_vec_named(&records).map_err(|_| LatticaError::PacketError)
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<usize, LatticaError> {
        let records: Vec<TunnelRecord> =
            rmp_serde::from_slice(data).map_err(|_| LatticaError::PacketError)?;
        let now = Instant::now();
        let mut restored = 0;

        for record in records {
            let link_id = ShortHash::from_slice(record.link_id.as_ref())?;
            self.entries.insert(
                link_id,
                LinkEntry {
                    timestamp: now,
                    proof_deadline: now + self.proof_timeout,
                    next_hop: ShortHash::from_slice(record.next_hop.as_ref())?,
                    next_hop_iface: ShortHash::from_slice(record.next_hop_iface.as_ref())?,
                    received_from: ShortHash::from_slice(record.received_from.as_ref())?,
                    received_iface: ShortHash::from_slice(record.received_iface.as_ref())?,
                    original_destination: ShortHash::from_slice(record.destination.as_ref())?,
                    taken_hops: record.taken_hops,
                    remaining_hops: record.remaining_hops,
                    proven: true,
                },
            );
            restored += 1;
        }

        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LinkTable;
    use crate::buffer::FixedBuf;
    use crate::destination::link::link_id_from_request;
    use crate::hash::ShortHash;
    use crate::packet::{Header, HeaderType, Packet, PacketContext, PacketType};

    fn link_request() -> Packet {
        Packet {
            header: Header { packet_type: PacketType::LinkRequest, hops: 1, ..Default::default() },
            destination: ShortHash::of(b"dest"),
            data: FixedBuf::from_slice(&[0x11; 64]),
            ..Default::default()
        }
    }

    fn table() -> LinkTable {
        LinkTable::new(Duration::from_secs(10), Duration::from_secs(900))
    }

    fn populate(table: &mut LinkTable) -> ShortHash {
        let request = link_request();
        table.add(
            &request,
            request.destination,
            ShortHash::of(b"prev-hop"),
            ShortHash::of(b"prev-iface"),
            ShortHash::of(b"next-hop"),
            ShortHash::of(b"next-iface"),
        );
        link_id_from_request(&request)
    }

    #[test]
    fn proof_upgrades_entry_and_routes_backwards() {
        let mut table = table();
        let link_id = populate(&mut table);

        let proof = Packet {
            header: Header {
                packet_type: PacketType::Proof,
                hops: 2,
                ..Default::default()
            },
            destination: link_id,
            context: PacketContext::LinkRequestProof,
            data: FixedBuf::from_slice(&[0x22; 96]),
            ..Default::default()
        };

        let (reversed, iface) = table.handle_proof(&proof).expect("reverse route");
        assert_eq!(iface, ShortHash::of(b"prev-iface"));
        assert_eq!(reversed.transport, Some(ShortHash::of(b"prev-hop")));
        assert_eq!(reversed.header.header_type, HeaderType::Type2);
        assert_eq!(reversed.header.hops, 3);

        assert_eq!(table.original_destination(&link_id), Some(ShortHash::of(b"dest")));
    }

    #[test]
    fn unproven_entries_expire_on_proof_deadline() {
        let mut table = LinkTable::new(Duration::ZERO, Duration::from_secs(900));
        let link_id = populate(&mut table);

        assert_eq!(table.sweep_stale(), 1);
        assert!(!table.contains(&link_id));
    }

    #[test]
    fn unproven_destination_is_not_disclosed() {
        let mut table = table();
        let link_id = populate(&mut table);
        assert_eq!(table.original_destination(&link_id), None);
    }

    #[test]
    fn snapshot_keeps_only_proven_tunnels() {
        let mut table = table();
        let link_id = populate(&mut table);

        // Nothing proven yet: empty snapshot.
        let snapshot = table.snapshot().expect("snapshot");
        let mut empty = LinkTable::new(Duration::from_secs(10), Duration::from_secs(900));
        assert_eq!(empty.restore(&snapshot).expect("restore"), 0);

        let proof = Packet {
            header: Header { packet_type: PacketType::Proof, ..Default::default() },
            destination: link_id,
            context: PacketContext::LinkRequestProof,
            data: FixedBuf::from_slice(&[0x22; 96]),
            ..Default::default()
        };
        table.handle_proof(&proof);

        let snapshot = table.snapshot().expect("snapshot");
        let mut restored = LinkTable::new(Duration::from_secs(10), Duration::from_secs(900));
        assert_eq!(restored.restore(&snapshot).expect("restore"), 1);
        assert_eq!(restored.original_destination(&link_id), Some(ShortHash::of(b"dest")));
    }
}
