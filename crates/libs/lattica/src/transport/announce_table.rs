use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};

use crate::hash::ShortHash;
use crate::iface::{TxMessage, TxMessageType};
use crate::packet::{
    DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketType,
    PropagationType,
};

/// Base of the hop-scaled forwarding delay: an announce received at hop `h`
/// waits `BASE^h` seconds before this node retransmits it, so announces
/// ripple outward without synchronised bursts.
pub const PROPAGATION_BASE: u32 = 2;

/// Default retransmission budget after the initial forward.
pub const DEFAULT_RETRIES: u8 = 1;

/// Fixed grace added to every retry wait.
pub const RETRY_GRACE_SECS: u64 = 10;

/// Upper bound of the random jitter added to every retry wait.
pub const RETRY_JITTER_SECS: u64 = 10;

/// Fraction of an interface's bitrate that announce traffic may consume.
pub const DEFAULT_ANNOUNCE_CAP: f64 = 0.02;

fn hop_delay(hops: u8) -> Duration {
    // Saturate the exponent so hostile hop counts cannot overflow; by the
    // time the exponent matters the delay is already days long.
    let exponent = u32::from(hops.min(20));
    Duration::from_secs(u64::from(PROPAGATION_BASE.saturating_pow(exponent)))
}

fn retry_jitter() -> Duration {
    Duration::from_secs(u64::from(OsRng.next_u32()) % (RETRY_JITTER_SECS + 1))
}

/// Outbound announce-bandwidth accounting, one ledger per interface. A
/// reservation pushes the interface's next permitted announce out by the
/// frame's airtime divided by the configured cap.
pub struct AnnounceBudget {
    cap_fraction: f64,
    ifaces: HashMap<ShortHash, IfaceBudget>,
}

struct IfaceBudget {
    bitrate: u64,
    next_allowed: Instant,
}

impl AnnounceBudget {
    pub fn new(cap_fraction: f64) -> Self {
        Self { cap_fraction: cap_fraction.clamp(0.001, 1.0), ifaces: HashMap::new() }
    }

    pub fn register(&mut self, iface: ShortHash, bitrate: u64) {
        self.ifaces
            .entry(iface)
            .or_insert(IfaceBudget { bitrate: bitrate.max(1), next_allowed: Instant::now() });
    }

    pub fn forget(&mut self, iface: &ShortHash) {
        self.ifaces.remove(iface);
    }

    /// True when every registered interface has announce headroom. A flood
    /// is charged against each interface it will occupy.
    pub fn try_reserve_flood(&mut self, frame_len: usize, now: Instant) -> bool {
        if self.ifaces.values().any(|budget| budget.next_allowed > now) {
            return false;
        }

        for budget in self.ifaces.values_mut() {
            let airtime =
                (frame_len as f64 * 8.0) / (budget.bitrate as f64 * self.cap_fraction);
            budget.next_allowed = now + Duration::from_secs_f64(airtime);
        }
        true
    }

    pub fn try_reserve_direct(&mut self, iface: &ShortHash, frame_len: usize, now: Instant) -> bool {
        let cap = self.cap_fraction;
        let Some(budget) = self.ifaces.get_mut(iface) else {
            // Unknown interfaces are not throttled; they are about to be
            // cleaned up anyway.
            return true;
        };
        if budget.next_allowed > now {
            return false;
        }
        let airtime = (frame_len as f64 * 8.0) / (budget.bitrate as f64 * cap);
        budget.next_allowed = now + Duration::from_secs_f64(airtime);
        true
    }
}

#[derive(Clone)]
pub struct AnnounceEntry {
    pub packet: Packet,
    pub received_from: ShortHash,
    /// Hop count this node retransmits with (received hops + 1).
    pub hops: u8,
    pub earliest: Instant,
    pub priority: f64,
    pub retries_remaining: u8,
    pub response_to_iface: Option<ShortHash>,
}

impl AnnounceEntry {
    fn forward_message(&self, transport_id: &ShortHash) -> TxMessage {
        let context = if self.response_to_iface.is_some() {
            PacketContext::PathResponse
        } else {
            PacketContext::None
        };

        let packet = Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type2,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: self.hops,
            },
            ifac: None,
            destination: self.packet.destination,
            transport: Some(*transport_id),
            context,
            data: self.packet.data,
        };

        let tx_type = match self.response_to_iface {
            Some(iface) => TxMessageType::Direct(iface),
            None => TxMessageType::Broadcast(Some(self.received_from)),
        };

        TxMessage { tx_type, packet }
    }
}

/// Two-generation store of announces already propagated, kept so path
/// requests can be answered from memory long after the queue entry is gone.
pub struct PropagatedCache {
    newer: BTreeMap<ShortHash, AnnounceEntry>,
    older: BTreeMap<ShortHash, AnnounceEntry>,
    generation_capacity: usize,
}

impl PropagatedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            newer: BTreeMap::new(),
            older: BTreeMap::new(),
            generation_capacity: (capacity / 2).max(1),
        }
    }

    pub fn insert(&mut self, destination: ShortHash, entry: AnnounceEntry) {
        if self.newer.len() >= self.generation_capacity {
            self.older = std::mem::take(&mut self.newer);
        }
        self.newer.insert(destination, entry);
    }

    pub fn get(&self, destination: &ShortHash) -> Option<&AnnounceEntry> {
        self.newer.get(destination).or_else(|| self.older.get(destination))
    }

    pub fn len(&self) -> usize {
        self.newer.len() + self.older.len()
    }

    pub fn is_empty(&self) -> bool {
        self.newer.is_empty() && self.older.is_empty()
    }

    pub fn clear(&mut self) {
        self.newer.clear();
        self.older.clear();
    }
}

/// The announce propagation queue. Entries wait out their hop-scaled delay,
/// go out highest-priority first within the interface bandwidth cap, retry
/// on a widening schedule and disappear once the budget is spent or a
/// better-positioned node is overheard doing the job.
pub struct AnnounceTable {
    queue: BTreeMap<ShortHash, AnnounceEntry>,
    responses: BTreeMap<ShortHash, AnnounceEntry>,
    cache: PropagatedCache,
    retry_limit: u8,
}

impl AnnounceTable {
    pub fn new(cache_capacity: usize, retry_limit: u8) -> Self {
        Self {
            queue: BTreeMap::new(),
            responses: BTreeMap::new(),
            cache: PropagatedCache::new(cache_capacity),
            retry_limit,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.responses.is_empty() && self.cache.is_empty()
    }

    pub fn queued(&self, destination: &ShortHash) -> Option<&AnnounceEntry> {
        self.queue.get(destination)
    }

    /// Enqueues a received announce for forwarding. The initial delay is
    /// `BASE^h` seconds with priority `1/delay`, so close announces travel
    /// first. A newer announce for an already queued destination replaces
    /// the old one; when only the payload (app data) changed, the original
    /// delay and priority are kept so the queue position is not gamed.
    pub fn enqueue(
        &mut self,
        announce: &Packet,
        destination: ShortHash,
        received_from: ShortHash,
    ) {
        let received_hops = announce.header.hops;
        let delay = hop_delay(received_hops);
        let now = Instant::now();

        if let Some(existing) = self.queue.get_mut(&destination) {
            if existing.hops == received_hops.saturating_add(1) {
                existing.packet = *announce;
                existing.received_from = received_from;
                return;
            }

            *existing = AnnounceEntry {
                packet: *announce,
                received_from,
                hops: received_hops.saturating_add(1),
                earliest: now + delay,
                priority: 1.0 / delay.as_secs_f64().max(f64::MIN_POSITIVE),
                retries_remaining: self.retry_limit,
                response_to_iface: None,
            };
            return;
        }

        self.queue.insert(
            destination,
            AnnounceEntry {
                packet: *announce,
                received_from,
                hops: received_hops.saturating_add(1),
                earliest: now + delay,
                priority: 1.0 / delay.as_secs_f64().max(f64::MIN_POSITIVE),
                retries_remaining: self.retry_limit,
                response_to_iface: None,
            },
        );
    }

    /// Cancels pending retries when another node is overheard forwarding
    /// the same announce from farther out; the job is done.
    pub fn heard_retransmission(&mut self, destination: &ShortHash, hops: u8) {
        let Some(entry) = self.queue.get(destination) else {
            return;
        };
        if hops > entry.hops {
            if let Some(entry) = self.queue.remove(destination) {
                log::trace!(
                    "announce: {} retransmitted downstream ({} hops), retries cancelled",
                    destination,
                    hops
                );
                self.cache.insert(*destination, entry);
            }
        }
    }

    /// Schedules a single direct path response from the queue or the
    /// propagated cache.
    pub fn add_response(&mut self, destination: ShortHash, to_iface: ShortHash, hops: u8) -> bool {
        let source = self
            .queue
            .get(&destination)
            .cloned()
            .or_else(|| self.cache.get(&destination).cloned());

        let Some(mut response) = source else {
            return false;
        };

        response.retries_remaining = 1;
        response.hops = hops;
        response.earliest = Instant::now();
        response.response_to_iface = Some(to_iface);
        self.responses.insert(destination, response);
        true
    }

    /// Drains everything whose delay has elapsed, best priority first,
    /// within the per-interface announce bandwidth budget. Entries with
    /// retries left are rescheduled at `BASE^(h+1) + grace + jitter`;
    /// exhausted entries move to the propagated cache.
    pub fn due_messages(
        &mut self,
        transport_id: &ShortHash,
        budget: &mut AnnounceBudget,
    ) -> Vec<TxMessage> {
        let now = Instant::now();
        let mut messages = Vec::new();

        let mut ready: Vec<(ShortHash, f64)> = self
            .queue
            .iter()
            .filter(|(destination, entry)| {
                entry.earliest <= now && !self.responses.contains_key(destination)
            })
            .map(|(destination, entry)| (*destination, entry.priority))
            .collect();
        ready.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut exhausted = Vec::new();
        for (destination, _) in ready {
            let Some(entry) = self.queue.get_mut(&destination) else {
                continue;
            };

            let message = entry.forward_message(transport_id);
            if !budget.try_reserve_flood(message.packet.wire_len(), now) {
                // Over the cap: everything still queued waits in place.
                break;
            }
            messages.push(message);

            if entry.retries_remaining > 0 {
                entry.retries_remaining -= 1;
                entry.earliest = now
                    + hop_delay(entry.hops)
                    + Duration::from_secs(RETRY_GRACE_SECS)
                    + retry_jitter();
            } else {
                exhausted.push(destination);
            }
        }

        for destination in exhausted {
            if let Some(entry) = self.queue.remove(&destination) {
                self.cache.insert(destination, entry);
            }
        }

        // Path responses bypass the flood budget but still burn direct
        // airtime; each goes out exactly once.
        let mut sent_responses = Vec::new();
        for (destination, entry) in self.responses.iter() {
            let message = entry.forward_message(transport_id);
            if let TxMessageType::Direct(iface) = message.tx_type {
                if !budget.try_reserve_direct(&iface, message.packet.wire_len(), now) {
                    continue;
                }
            }
            messages.push(message);
            sent_responses.push(*destination);
        }
        for destination in sent_responses {
            self.responses.remove(&destination);
        }

        messages
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.responses.clear();
        self.cache.clear();
    }
}

impl Default for AnnounceTable {
    fn default() -> Self {
        Self::new(100_000, DEFAULT_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{hop_delay, AnnounceBudget, AnnounceTable, DEFAULT_ANNOUNCE_CAP};
    use crate::buffer::FixedBuf;
    use crate::hash::ShortHash;
    use crate::iface::TxMessageType;
    use crate::packet::{Header, HeaderType, Packet, PacketType};

    fn announce(destination: ShortHash, hops: u8, body: &[u8]) -> Packet {
        Packet {
            header: Header { packet_type: PacketType::Announce, hops, ..Default::default() },
            destination,
            data: FixedBuf::from_slice(body),
            ..Default::default()
        }
    }

    fn open_budget() -> AnnounceBudget {
        let mut budget = AnnounceBudget::new(DEFAULT_ANNOUNCE_CAP);
        budget.register(ShortHash::of(b"iface"), 100_000_000_000);
        budget
    }

    #[test]
    fn delay_scales_exponentially_with_hops() {
        assert_eq!(hop_delay(0), Duration::from_secs(1));
        assert_eq!(hop_delay(1), Duration::from_secs(2));
        assert_eq!(hop_delay(4), Duration::from_secs(16));
    }

    #[test]
    fn zero_hop_announce_waits_its_delay() {
        let destination = ShortHash::of(b"dest");
        let transport_id = ShortHash::of(b"self");
        let mut table = AnnounceTable::new(16, 1);
        let mut budget = open_budget();

        table.enqueue(&announce(destination, 0, b"a"), destination, ShortHash::of(b"prev"));

        // Delay for hop 0 is one second; nothing is due yet.
        assert!(table.due_messages(&transport_id, &mut budget).is_empty());
        assert!(table.queued(&destination).is_some());
    }

    #[test]
    fn due_entry_is_forwarded_with_incremented_hops() {
        let destination = ShortHash::of(b"dest");
        let transport_id = ShortHash::of(b"self");
        let mut table = AnnounceTable::new(16, 1);
        let mut budget = open_budget();

        table.enqueue(&announce(destination, 2, b"a"), destination, ShortHash::of(b"prev"));
        if let Some(entry) = table.queue.get_mut(&destination) {
            entry.earliest = Instant::now() - Duration::from_secs(1);
        }

        let messages = table.due_messages(&transport_id, &mut budget);
        assert_eq!(messages.len(), 1);
        let packet = messages[0].packet;
        assert_eq!(packet.header.hops, 3);
        assert_eq!(packet.header.header_type, HeaderType::Type2);
        assert_eq!(packet.transport, Some(transport_id));
        assert_eq!(
            messages[0].tx_type,
            TxMessageType::Broadcast(Some(ShortHash::of(b"prev")))
        );

        // One retry remains queued with a widened deadline.
        let entry = table.queued(&destination).expect("retry pending");
        assert_eq!(entry.retries_remaining, 0);
        assert!(entry.earliest > Instant::now());
    }

    #[test]
    fn overheard_downstream_retransmission_cancels_retries() {
        let destination = ShortHash::of(b"dest");
        let mut table = AnnounceTable::new(16, 1);

        table.enqueue(&announce(destination, 1, b"a"), destination, ShortHash::of(b"prev"));
        table.heard_retransmission(&destination, 5);

        assert!(table.queued(&destination).is_none());
        // The announce stays answerable for path requests.
        assert!(table.cache.get(&destination).is_some());
    }

    #[test]
    fn overheard_upstream_copy_does_not_cancel() {
        let destination = ShortHash::of(b"dest");
        let mut table = AnnounceTable::new(16, 1);

        table.enqueue(&announce(destination, 3, b"a"), destination, ShortHash::of(b"prev"));
        table.heard_retransmission(&destination, 2);

        assert!(table.queued(&destination).is_some());
    }

    #[test]
    fn same_hop_update_keeps_schedule() {
        let destination = ShortHash::of(b"dest");
        let mut table = AnnounceTable::new(16, 1);

        table.enqueue(&announce(destination, 1, b"old"), destination, ShortHash::of(b"prev"));
        let earliest = table.queued(&destination).expect("queued").earliest;

        table.enqueue(&announce(destination, 1, b"new"), destination, ShortHash::of(b"prev"));
        let entry = table.queued(&destination).expect("queued");

        assert_eq!(entry.earliest, earliest);
        assert_eq!(entry.packet.data.as_slice(), b"new");
    }

    #[test]
    fn bandwidth_cap_holds_announces_back() {
        let destination_a = ShortHash::of(b"dest-a");
        let destination_b = ShortHash::of(b"dest-b");
        let transport_id = ShortHash::of(b"self");
        let mut table = AnnounceTable::new(16, 0);

        // 500 bps interface: one announce exhausts the 2% cap for hours.
        let mut budget = AnnounceBudget::new(DEFAULT_ANNOUNCE_CAP);
        budget.register(ShortHash::of(b"lora"), 500);

        table.enqueue(&announce(destination_a, 0, b"a"), destination_a, ShortHash::of(b"p"));
        table.enqueue(&announce(destination_b, 0, b"b"), destination_b, ShortHash::of(b"p"));
        for entry in table.queue.values_mut() {
            entry.earliest = Instant::now() - Duration::from_secs(1);
        }

        let messages = table.due_messages(&transport_id, &mut budget);
        assert_eq!(messages.len(), 1);
        // The second announce is held, not dropped.
        assert_eq!(table.queue.len(), 1);
    }

    #[test]
    fn path_response_is_sent_once_directly() {
        let destination = ShortHash::of(b"dest");
        let transport_id = ShortHash::of(b"self");
        let iface = ShortHash::of(b"iface");
        let mut table = AnnounceTable::new(16, 0);
        let mut budget = open_budget();
        budget.register(iface, 100_000_000_000);

        table.enqueue(&announce(destination, 1, b"a"), destination, ShortHash::of(b"prev"));
        assert!(table.add_response(destination, iface, 2));

        let messages = table.due_messages(&transport_id, &mut budget);
        let response = messages
            .iter()
            .find(|message| message.tx_type == TxMessageType::Direct(iface))
            .expect("direct response");
        assert_eq!(response.packet.context, crate::packet::PacketContext::PathResponse);

        // Gone after one transmission.
        let messages = table.due_messages(&transport_id, &mut budget);
        assert!(messages
            .iter()
            .all(|message| message.tx_type != TxMessageType::Direct(iface)));
    }
}
