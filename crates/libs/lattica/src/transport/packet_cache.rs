use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::error::LatticaError;
use crate::hash::ShortHash;
use crate::packet::Packet;

/// Default dedup window size. Bounds the duplicate-detection memory to
/// O(capacity) packets.
pub const DEFAULT_CACHE_CAPACITY: usize = 64_000;

struct SeenRecord {
    last_seen: Instant,
    min_hops: u8,
}

#[derive(Serialize, Deserialize)]
struct HashlistRecord {
    hashes: Vec<ByteBuf>,
}

/// Content-addressed record of recently observed packets, keyed by the
/// truncated packet hash. Guarantees at-most-once dispatch to higher layers
/// within the window; eviction is LRU with a hit refreshing the entry.
pub struct PacketCache {
    map: HashMap<ShortHash, SeenRecord>,
    order: VecDeque<ShortHash>,
    capacity: usize,
}

impl PacketCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { map: HashMap::new(), order: VecDeque::new(), capacity: capacity.max(1) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Records a packet. Returns true when it was not in the window, i.e.
    /// when it should be dispatched further.
    pub fn observe(&mut self, packet: &Packet) -> bool {
        self.observe_hash(packet.short_hash(), packet.header.hops)
    }

    pub fn observe_hash(&mut self, hash: ShortHash, hops: u8) -> bool {
        if let Some(record) = self.map.get_mut(&hash) {
            record.last_seen = Instant::now();
            record.min_hops = record.min_hops.min(hops);
            self.touch(&hash);
            return false;
        }

        if self.map.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }

        self.map.insert(hash, SeenRecord { last_seen: Instant::now(), min_hops: hops });
        self.order.push_back(hash);
        true
    }

    pub fn contains(&self, hash: &ShortHash) -> bool {
        self.map.contains_key(hash)
    }

    pub fn min_hops(&self, hash: &ShortHash) -> Option<u8> {
        self.map.get(hash).map(|record| record.min_hops)
    }

    /// Drops entries older than `max_age`.
    pub fn release(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.map.retain(|_, record| now.duration_since(record.last_seen) <= max_age);
        let map = &self.map;
        self.order.retain(|hash| map.contains_key(hash));
    }

    fn touch(&mut self, hash: &ShortHash) {
        if let Some(position) = self.order.iter().position(|entry| entry == hash) {
            self.order.remove(position);
            self.order.push_back(*hash);
        }
    }

    /// Serializes the hash window for `storage/packet_hashlist`.
    pub fn snapshot(&self) -> Result<Vec<u8>, LatticaError> {
        let record = HashlistRecord {
            hashes: self
                .order
                .iter()
                .map(|hash| ByteBuf::from(hash.as_slice().to_vec()))
                .collect(),
        };
        rmp_serde::to_vec_named(&record).map_err(|_| LatticaError::PacketError)
    }

    pub fn restore(&mut self, data: &[u8]) -> Result<usize, LatticaError> {
        let record: HashlistRecord =
            rmp_serde::from_slice(data).map_err(|_| LatticaError::PacketError)?;
        let mut restored = 0;
        for hash in record.hashes {
            if let Ok(hash) = ShortHash::from_slice(hash.as_ref()) {
                if self.observe_hash(hash, 0) {
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }
}

impl Default for PacketCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::PacketCache;
    use crate::buffer::FixedBuf;
    use crate::hash::ShortHash;
    use crate::packet::Packet;

    fn packet(tag: &[u8]) -> Packet {
        Packet {
            destination: ShortHash::of(b"dest"),
            data: FixedBuf::from_slice(tag),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_is_reported_once() {
        let mut cache = PacketCache::new();
        let sample = packet(b"one");

        assert!(cache.observe(&sample));
        for _ in 0..10 {
            assert!(!cache.observe(&sample));
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_is_least_recently_observed() {
        let mut cache = PacketCache::with_capacity(2);
        let first = packet(b"first");
        let second = packet(b"second");
        let third = packet(b"third");

        cache.observe(&first);
        cache.observe(&second);
        // A hit refreshes `first`, so `second` is the eviction victim.
        cache.observe(&first);
        cache.observe(&third);

        assert!(cache.contains(&first.short_hash()));
        assert!(!cache.contains(&second.short_hash()));
        assert!(cache.contains(&third.short_hash()));
    }

    #[test]
    fn min_hops_tracks_closest_observation() {
        let mut cache = PacketCache::new();
        let mut sample = packet(b"hops");

        sample.header.hops = 5;
        cache.observe(&sample);
        sample.header.hops = 2;
        cache.observe(&sample);

        assert_eq!(cache.min_hops(&sample.short_hash()), Some(2));
    }

    #[test]
    fn release_drops_aged_entries() {
        let mut cache = PacketCache::new();
        cache.observe(&packet(b"aging"));
        cache.release(Duration::ZERO);
        assert!(cache.is_empty());
    }

    #[test]
    fn hashlist_roundtrip_preserves_window() {
        let mut cache = PacketCache::new();
        let sample = packet(b"persisted");
        cache.observe(&sample);

        let snapshot = cache.snapshot().expect("snapshot");

        let mut restored = PacketCache::new();
        assert_eq!(restored.restore(&snapshot).expect("restore"), 1);
        // A replay after restart is still filtered.
        assert!(!restored.observe(&sample));
    }
}
