use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

use rand_core::OsRng;

use crate::destination::{DestinationName, PlainInputDestination};
use crate::hash::{ShortHash, SHORT_HASH_SIZE};
use crate::identity::NoIdentity;
use crate::packet::{
    DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketPayload,
    PacketType, PropagationType,
};

/// Well-known plain destination every instance listens on for on-demand
/// path discovery.
pub fn path_request_destination() -> PlainInputDestination {
    PlainInputDestination::new(NoIdentity, DestinationName::new("lattica", "path.request"))
}

pub type TagBytes = Vec<u8>;

pub fn random_tag() -> TagBytes {
    ShortHash::random(OsRng).as_slice().into()
}

/// Decoded request payload: target destination, the transport that relayed
/// the request (absent for directly connected requestors) and a dedup tag.
pub struct PathRequest {
    pub destination: ShortHash,
    pub requesting_transport: Option<ShortHash>,
    pub tag: TagBytes,
}

impl PathRequest {
    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() <= SHORT_HASH_SIZE {
            log::debug!("path request too short ({}B), ignoring", data.len());
            return None;
        }

        let destination = ShortHash::from_slice(&data[..SHORT_HASH_SIZE]).ok()?;

        let mut requesting_transport = None;
        let mut tag_start = SHORT_HASH_SIZE;

        if data.len() > SHORT_HASH_SIZE * 2 {
            requesting_transport =
                ShortHash::from_slice(&data[SHORT_HASH_SIZE..SHORT_HASH_SIZE * 2]).ok();
            tag_start = SHORT_HASH_SIZE * 2;
        }

        let tag_end = data.len().min(tag_start + SHORT_HASH_SIZE);
        Some(Self {
            destination,
            requesting_transport,
            tag: data[tag_start..tag_end].into(),
        })
    }
}

/// Path discovery bookkeeping: tag-based dedup of incoming requests and a
/// capped queue of our own recursive requests.
pub struct PathRequests {
    seen: BTreeSet<(ShortHash, TagBytes)>,
    transport_id: Option<ShortHash>,
    listener: PlainInputDestination,
    pending: BTreeMap<ShortHash, Instant>,
    pending_queue: VecDeque<(ShortHash, Instant)>,
    queue_cap: usize,
    pending_cap: usize,
    request_timeout: Duration,
}

impl PathRequests {
    pub fn new(
        transport_id: Option<ShortHash>,
        queue_cap: usize,
        pending_cap: usize,
        request_timeout_secs: u64,
    ) -> Self {
        Self {
            seen: BTreeSet::new(),
            transport_id,
            listener: path_request_destination(),
            pending: BTreeMap::new(),
            pending_queue: VecDeque::new(),
            queue_cap,
            pending_cap,
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
        }
    }

    pub fn listener_hash(&self) -> ShortHash {
        self.listener.desc.address_hash
    }

    /// Decodes an incoming request, filtering repeats of the same
    /// (destination, tag) pair.
    pub fn decode(&mut self, data: &[u8]) -> Option<PathRequest> {
        let request = PathRequest::decode(data)?;

        if !self.seen.insert((request.destination, request.tag.clone())) {
            log::debug!("duplicate path request for {}, ignoring", request.destination);
            return None;
        }

        Some(request)
    }

    /// Builds an outgoing path request for `destination`.
    pub fn generate(&mut self, destination: &ShortHash, tag: Option<TagBytes>) -> Packet {
        let mut data = PacketPayload::from_slice(destination.as_slice());
        if let Some(transport_id) = self.transport_id {
            data.push_truncated(transport_id.as_slice());
        }
        data.push_truncated(tag.unwrap_or_else(random_tag).as_slice());

        Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Plain,
                packet_type: PacketType::Data,
                hops: 0,
            },
            ifac: None,
            destination: self.listener.desc.address_hash,
            transport: self.transport_id,
            context: PacketContext::None,
            data,
        }
    }

    fn admit_recursive(&mut self, destination: &ShortHash) -> bool {
        let now = Instant::now();

        self.pending.retain(|_, deadline| *deadline > now);
        while let Some((queued, deadline)) = self.pending_queue.front().copied() {
            if deadline > now {
                break;
            }
            self.pending_queue.pop_front();
            self.pending.remove(&queued);
        }

        if let Some(deadline) = self.pending.get(destination) {
            if *deadline >= now {
                log::debug!("path discovery for {} already pending", destination);
                return false;
            }
            self.pending.remove(destination);
        }

        if self.pending_cap > 0 && self.pending.len() >= self.pending_cap {
            log::debug!("path discovery cap reached, dropping request for {}", destination);
            return false;
        }

        if self.queue_cap > 0 && self.pending_queue.len() >= self.queue_cap {
            log::debug!("path discovery queue full, dropping request for {}", destination);
            return false;
        }

        let deadline = now + self.request_timeout;
        self.pending.insert(*destination, deadline);
        self.pending_queue.push_back((*destination, deadline));
        true
    }

    /// A request this transport originates on behalf of a peer whose
    /// request could not be answered locally. Capped and deduplicated.
    pub fn generate_recursive(
        &mut self,
        destination: &ShortHash,
        tag: Option<TagBytes>,
    ) -> Option<Packet> {
        if self.admit_recursive(destination) {
            log::trace!("recursive path discovery for {}", destination);
            Some(self.generate(destination, tag))
        } else {
            None
        }
    }
}
