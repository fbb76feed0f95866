use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::LatticaError;
use crate::hash::ShortHash;
use crate::iface::InterfaceMode;
use crate::packet::{
    DestinationType, Header, HeaderType, Packet, PacketType, PropagationType,
};

/// Per-mode lifetime of learned paths. Exact values are deployment tuning;
/// the shape is fixed: seconds for access points, minutes for roaming
/// carriers, hours for stationary infrastructure.
#[derive(Debug, Clone, Copy)]
pub struct PathTtlConfig {
    pub full: Duration,
    pub access_point: Duration,
    pub point_to_point: Duration,
    pub roaming: Duration,
    pub boundary: Duration,
    pub gateway: Duration,
}

impl Default for PathTtlConfig {
    fn default() -> Self {
        Self {
            full: Duration::from_secs(6 * 60 * 60),
            access_point: Duration::from_secs(120),
            point_to_point: Duration::from_secs(60 * 60),
            roaming: Duration::from_secs(15 * 60),
            boundary: Duration::from_secs(6 * 60 * 60),
            gateway: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl PathTtlConfig {
    pub fn ttl_for(&self, mode: InterfaceMode) -> Duration {
        match mode {
            InterfaceMode::Full => self.full,
            InterfaceMode::AccessPoint => self.access_point,
            InterfaceMode::PointToPoint => self.point_to_point,
            InterfaceMode::Roaming => self.roaming,
            InterfaceMode::Boundary => self.boundary,
            InterfaceMode::Gateway => self.gateway,
        }
    }
}

pub struct PathEntry {
    pub timestamp: Instant,
    pub expires_at: Instant,
    /// Neighbour that relayed the announce; the next hop toward the
    /// destination.
    pub received_from: ShortHash,
    pub hops: u8,
    pub iface: ShortHash,
    /// Hash of the announce that established this entry.
    pub announce_hash: ShortHash,
}

impl PathEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Serialized table row. Interface handles are persisted verbatim; a handle
/// that no longer exists after restart simply never matches an attached
/// interface and the entry ages out.
#[derive(Serialize, Deserialize)]
struct PathRecord {
    destination: ByteBuf,
    received_from: ByteBuf,
    hops: u8,
    iface: ByteBuf,
    announce_hash: ByteBuf,
    ttl_remaining_secs: u64,
}

/// One route per destination: the next hop, its interface and the hop
/// count, with a TTL taken from the learning interface's mode.
pub struct PathTable {
    map: HashMap<ShortHash, PathEntry>,
    ttls: PathTtlConfig,
}

impl PathTable {
    pub fn new(ttls: PathTtlConfig) -> Self {
        Self { map: HashMap::new(), ttls }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, destination: &ShortHash) -> Option<&PathEntry> {
        self.map.get(destination).filter(|entry| !entry.is_expired(Instant::now()))
    }

    pub fn hops_to(&self, destination: &ShortHash) -> Option<u8> {
        self.get(destination).map(|entry| entry.hops)
    }

    pub fn next_hop(&self, destination: &ShortHash) -> Option<ShortHash> {
        self.get(destination).map(|entry| entry.received_from)
    }

    pub fn next_hop_iface(&self, destination: &ShortHash) -> Option<ShortHash> {
        self.get(destination).map(|entry| entry.iface)
    }

    pub fn next_hop_full(&self, destination: &ShortHash) -> Option<(ShortHash, ShortHash)> {
        self.get(destination).map(|entry| (entry.received_from, entry.iface))
    }

    /// Applies an accepted announce. A live entry with strictly fewer hops
    /// wins over the new one; anything else is replaced.
    pub fn handle_announce(
        &mut self,
        announce: &Packet,
        transport_id: Option<ShortHash>,
        iface: ShortHash,
        iface_mode: InterfaceMode,
    ) -> bool {
        let hops = announce.header.hops.saturating_add(1);
        let now = Instant::now();

        if let Some(existing) = self.map.get(&announce.destination) {
            if !existing.is_expired(now) && hops > existing.hops {
                return false;
            }
        }

        let received_from = transport_id.unwrap_or(announce.destination);
        let ttl = self.ttls.ttl_for(iface_mode);
        let entry = PathEntry {
            timestamp: now,
            expires_at: now + ttl,
            received_from,
            hops,
            iface,
            announce_hash: announce.short_hash(),
        };

        self.map.insert(announce.destination, entry);

        log::info!(
            "path: {} reachable in {} hops via {} on {}",
            announce.destination,
            hops,
            received_from,
            iface
        );

        true
    }

    pub fn refresh(&mut self, destination: &ShortHash) {
        let ttls = self.ttls;
        if let Some(entry) = self.map.get_mut(destination) {
            entry.timestamp = Instant::now();
            // Refreshes keep the original mode's order of magnitude by
            // re-extending from now with the shortest configured TTL.
            entry.expires_at = entry.expires_at.max(Instant::now() + ttls.access_point);
        }
    }

    pub fn remove(&mut self, destination: &ShortHash) {
        self.map.remove(destination);
    }

    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.map.len();
        self.map.retain(|_, entry| !entry.is_expired(now));
        before - self.map.len()
    }

    /// Routes a packet that arrived from the network and needs to travel
    /// on. Rewrites the header for the recorded next hop.
    pub fn route_inbound(
        &self,
        packet: &Packet,
        lookup: Option<ShortHash>,
    ) -> (Packet, Option<ShortHash>) {
        let lookup = lookup.unwrap_or(packet.destination);

        let Some(entry) = self.get(&lookup) else {
            return (*packet, None);
        };

        (
            Packet {
                header: Header {
                    ifac_flag: packet.header.ifac_flag,
                    header_type: HeaderType::Type2,
                    propagation_type: PropagationType::Transport,
                    destination_type: packet.header.destination_type,
                    packet_type: packet.header.packet_type,
                    hops: packet.header.hops.saturating_add(1),
                },
                ifac: None,
                destination: packet.destination,
                transport: Some(entry.received_from),
                context: packet.context,
                data: packet.data,
            },
            Some(entry.iface),
        )
    }

    /// Routes a locally originated packet. Single-hop paths keep the short
    /// header; anything farther is promoted to a Type2 transport header
    /// addressed at the next hop.
    pub fn route_outbound(&self, packet: &Packet) -> (Packet, Option<ShortHash>) {
        if packet.header.header_type == HeaderType::Type2
            || packet.header.packet_type == PacketType::Announce
            || matches!(
                packet.header.destination_type,
                DestinationType::Plain | DestinationType::Group
            )
        {
            return (*packet, None);
        }

        let Some(entry) = self.get(&packet.destination) else {
            return (*packet, None);
        };

        if entry.hops <= 1 {
            return (*packet, Some(entry.iface));
        }

        (
            Packet {
                header: Header {
                    ifac_flag: packet.header.ifac_flag,
                    header_type: HeaderType::Type2,
                    propagation_type: PropagationType::Transport,
                    destination_type: packet.header.destination_type,
                    packet_type: packet.header.packet_type,
                    hops: packet.header.hops,
                },
                ifac: packet.ifac,
                destination: packet.destination,
                transport: Some(entry.received_from),
                context: packet.context,
                data: packet.data,
            },
            Some(entry.iface),
        )
    }

    /// Serializes all live entries for the destination table file.
    pub fn snapshot(&self) -> Result<Vec<u8>, LatticaError> {
        let now = Instant::now();
        let records: Vec<PathRecord> = self
            .map
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(destination, entry)| PathRecord {
                destination: ByteBuf::from(destination.as_slice().to_vec()),
                received_from: ByteBuf::from(entry.received_from.as_slice().to_vec()),
                hops: entry.hops,
                iface: ByteBuf::from(entry.iface.as_slice().to_vec()),
                announce_hash: ByteBuf::from(entry.announce_hash.as_slice().to_vec()),
                ttl_remaining_secs: entry.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect();

        rmp_serde::to_vec_named(&records).map_err(|_| LatticaError::PacketError)
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<usize, LatticaError> {
        let records: Vec<PathRecord> =
            rmp_serde::from_slice(data).map_err(|_| LatticaError::PacketError)?;
        let now = Instant::now();
        let mut restored = 0;

        for record in records {
            if record.ttl_remaining_secs == 0 {
                continue;
            }
            let destination = ShortHash::from_slice(record.destination.as_ref())?;
            let entry = PathEntry {
                timestamp: now,
                expires_at: now + Duration::from_secs(record.ttl_remaining_secs),
                received_from: ShortHash::from_slice(record.received_from.as_ref())?,
                hops: record.hops,
                iface: ShortHash::from_slice(record.iface.as_ref())?,
                announce_hash: ShortHash::from_slice(record.announce_hash.as_ref())?,
            };
            self.map.insert(destination, entry);
            restored += 1;
        }

        Ok(restored)
    }
}

impl Default for PathTable {
    fn default() -> Self {
        Self::new(PathTtlConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{PathEntry, PathTable, PathTtlConfig};
    use crate::buffer::FixedBuf;
    use crate::hash::ShortHash;
    use crate::iface::InterfaceMode;
    use crate::packet::{
        Header, HeaderType, Packet, PacketType, PropagationType,
    };

    fn announce_packet(destination: ShortHash, hops: u8) -> Packet {
        Packet {
            header: Header { packet_type: PacketType::Announce, hops, ..Default::default() },
            destination,
            data: FixedBuf::from_slice(b"announce"),
            ..Default::default()
        }
    }

    fn data_packet(destination: ShortHash) -> Packet {
        Packet { destination, data: FixedBuf::from_slice(b"data"), ..Default::default() }
    }

    #[test]
    fn closer_existing_path_survives_farther_announce() {
        let destination = ShortHash::of(b"dest");
        let iface = ShortHash::of(b"iface");
        let mut table = PathTable::default();

        assert!(table.handle_announce(
            &announce_packet(destination, 1),
            Some(ShortHash::of(b"near")),
            iface,
            InterfaceMode::Full,
        ));
        assert!(!table.handle_announce(
            &announce_packet(destination, 4),
            Some(ShortHash::of(b"far")),
            iface,
            InterfaceMode::Full,
        ));

        assert_eq!(table.hops_to(&destination), Some(2));
        assert_eq!(table.next_hop(&destination), Some(ShortHash::of(b"near")));
    }

    #[test]
    fn equal_hop_announce_replaces_entry() {
        let destination = ShortHash::of(b"dest");
        let iface = ShortHash::of(b"iface");
        let mut table = PathTable::default();

        table.handle_announce(
            &announce_packet(destination, 2),
            Some(ShortHash::of(b"first")),
            iface,
            InterfaceMode::Full,
        );
        assert!(table.handle_announce(
            &announce_packet(destination, 2),
            Some(ShortHash::of(b"second")),
            iface,
            InterfaceMode::Full,
        ));

        assert_eq!(table.next_hop(&destination), Some(ShortHash::of(b"second")));
    }

    #[test]
    fn expired_entries_are_invisible_and_swept() {
        let destination = ShortHash::of(b"dest");
        let mut table = PathTable::default();
        let now = Instant::now();

        table.map.insert(
            destination,
            PathEntry {
                timestamp: now - Duration::from_secs(10),
                expires_at: now - Duration::from_secs(1),
                received_from: ShortHash::of(b"hop"),
                hops: 1,
                iface: ShortHash::of(b"iface"),
                announce_hash: ShortHash::of(b"announce"),
            },
        );

        assert!(table.get(&destination).is_none());
        assert_eq!(table.sweep_expired(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn single_hop_outbound_keeps_short_header() {
        let destination = ShortHash::of(b"dest");
        let iface = ShortHash::of(b"iface");
        let mut table = PathTable::default();
        table.handle_announce(
            &announce_packet(destination, 0),
            None,
            iface,
            InterfaceMode::Full,
        );

        let (routed, next_iface) = table.route_outbound(&data_packet(destination));
        assert_eq!(next_iface, Some(iface));
        assert_eq!(routed.header.header_type, HeaderType::Type1);
        assert_eq!(routed.transport, None);
    }

    #[test]
    fn multihop_outbound_promotes_to_transport_header() {
        let destination = ShortHash::of(b"dest");
        let relay = ShortHash::of(b"relay");
        let iface = ShortHash::of(b"iface");
        let mut table = PathTable::default();
        table.handle_announce(
            &announce_packet(destination, 1),
            Some(relay),
            iface,
            InterfaceMode::Full,
        );

        let (routed, next_iface) = table.route_outbound(&data_packet(destination));
        assert_eq!(next_iface, Some(iface));
        assert_eq!(routed.header.header_type, HeaderType::Type2);
        assert_eq!(routed.header.propagation_type, PropagationType::Transport);
        assert_eq!(routed.transport, Some(relay));
    }

    #[test]
    fn snapshot_restore_preserves_live_entries() {
        let mut table = PathTable::default();
        let destination = ShortHash::of(b"dest");
        table.handle_announce(
            &announce_packet(destination, 1),
            Some(ShortHash::of(b"relay")),
            ShortHash::of(b"iface"),
            InterfaceMode::Full,
        );

        let snapshot = table.snapshot().expect("snapshot");

        let mut restored = PathTable::new(PathTtlConfig::default());
        assert_eq!(restored.restore(&snapshot).expect("restore"), 1);
        assert_eq!(restored.hops_to(&destination), Some(2));
        assert_eq!(restored.next_hop(&destination), Some(ShortHash::of(b"relay")));
    }
}
