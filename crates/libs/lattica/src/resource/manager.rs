use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::destination::link::Link;
use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash};
use crate::packet::{Packet, PacketContext, PacketType};

use super::receiver::{PartOutcome, ResourceReceiver};
use super::sender::ResourceSender;
use super::{
    build_link_packet, ResourceAdvertisement, ResourceComplete, ResourceEvent, ResourceEventKind,
    ResourceProof, ResourceRequest, FLAG_SPLIT,
};

/// How long a failed or completed outbound transfer stays addressable. A
/// proof that limps in after failure but before this sweep still counts.
const FAILED_RETENTION: Duration = Duration::from_secs(120);

pub struct ResourceManager {
    outgoing: HashMap<Hash, ResourceSender>,
    incoming: HashMap<Hash, ResourceReceiver>,
    failed_outgoing: HashMap<Hash, (ResourceSender, Instant)>,
    events: Vec<ResourceEvent>,
    retry_interval: Duration,
    retry_limit: u8,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::with_config(Duration::from_secs(2), 5)
    }

    pub fn with_config(retry_interval: Duration, retry_limit: u8) -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            failed_outgoing: HashMap::new(),
            events: Vec::new(),
            retry_interval,
            retry_limit,
        }
    }

    /// Starts an outbound transfer; returns the resource hash and the
    /// advertisement packet to send.
    pub fn start_send(
        &mut self,
        link: &Link,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<(Hash, Packet), LatticaError> {
        let sender = ResourceSender::new(link, data, metadata)?;
        let resource_hash = sender.resource_hash;
        let advertisement = sender.advertisement(0).pack()?;
        let packet = build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceAdvertisement,
            &advertisement,
        )?;
        self.outgoing.insert(resource_hash, sender);
        Ok((resource_hash, packet))
    }

    pub fn drain_events(&mut self) -> Vec<ResourceEvent> {
        std::mem::take(&mut self.events)
    }

    /// Fires due retransmission requests for inbound transfers; transfers
    /// past the retry budget fail with an event.
    pub fn retry_requests(&mut self, now: Instant) -> Vec<(ShortHash, ResourceRequest)> {
        let mut requests = Vec::new();
        let mut failed = Vec::new();

        for (hash, receiver) in self.incoming.iter_mut() {
            if receiver.retry_due(now, self.retry_interval, self.retry_limit) {
                let request = receiver.build_request();
                receiver.mark_request();
                requests.push((receiver.link_id, request));
            }
            if receiver.retries_exhausted(self.retry_limit) {
                failed.push(*hash);
            }
        }

        for hash in failed {
            if let Some(receiver) = self.incoming.remove(&hash) {
                log::warn!("resource: inbound {} failed after retries", hash);
                self.events.push(ResourceEvent {
                    hash,
                    link_id: receiver.link_id,
                    kind: ResourceEventKind::Failed,
                });
            }
        }

        self.sweep_failed(now);
        requests
    }

    fn sweep_failed(&mut self, now: Instant) {
        self.failed_outgoing.retain(|_, (_, since)| now.duration_since(*since) < FAILED_RETENTION);
    }

    /// Fails an outbound transfer but keeps it addressable for late proofs.
    pub fn fail_outgoing(&mut self, hash: &Hash) {
        if let Some(sender) = self.outgoing.remove(hash) {
            self.failed_outgoing.insert(*hash, (sender, Instant::now()));
        }
    }

    /// Drops local state for a cancelled transfer. Outbound senders move to
    /// retention rather than vanishing, so a proof racing the cancel still
    /// lands.
    pub fn cancel_local(&mut self, hash: &Hash) {
        self.incoming.remove(hash);
        self.fail_outgoing(hash);
    }

    /// Dispatches a link packet belonging to the resource protocol and
    /// returns any packets to send in reply.
    pub fn handle_packet(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        match packet.context {
            PacketContext::ResourceAdvertisement => self.handle_advertisement(packet, link),
            PacketContext::ResourceRequest => self.handle_request(packet, link),
            PacketContext::ResourceHashUpdate => self.handle_hash_update(packet, link),
            PacketContext::Resource => self.handle_part(packet, link),
            PacketContext::ResourceProof => self.handle_proof(packet),
            PacketContext::ResourceInitiatorCancel | PacketContext::ResourceReceiverCancel => {
                self.handle_cancel(packet, link)
            }
            _ => Vec::new(),
        }
    }

    fn handle_advertisement(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut scratch = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.open(packet.data.as_slice(), &mut scratch) else {
            return Vec::new();
        };
        let Ok(advertisement) = ResourceAdvertisement::unpack(plain) else {
            return Vec::new();
        };

        if advertisement.flags & FLAG_SPLIT != 0 {
            log::warn!("resource: rejecting split advertisement, unsupported");
            return Vec::new();
        }

        let resource_hash = advertisement.hash;
        let mut receiver = ResourceReceiver::new(&advertisement, *link.id());
        let request = receiver.build_request();
        receiver.mark_request();
        self.incoming.insert(resource_hash, receiver);

        match build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceRequest,
            &request.encode(),
        ) {
            Ok(packet) => vec![packet],
            Err(_) => {
                log::warn!("resource: request packet build failed");
                Vec::new()
            }
        }
    }

    fn handle_request(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut scratch = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.open(packet.data.as_slice(), &mut scratch) else {
            return Vec::new();
        };
        let Ok(request) = ResourceRequest::decode(plain) else {
            return Vec::new();
        };

        if let Some(sender) = self.outgoing.get_mut(&request.resource_hash) {
            return sender.handle_request(&request, link);
        }
        // Requests may still arrive for a transfer this side already gave
        // up on; serve them from retention.
        if let Some((sender, _)) = self.failed_outgoing.get_mut(&request.resource_hash) {
            return sender.handle_request(&request, link);
        }
        Vec::new()
    }

    fn handle_hash_update(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut scratch = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.open(packet.data.as_slice(), &mut scratch) else {
            return Vec::new();
        };
        let Ok(update) = super::ResourceHashUpdate::decode(plain) else {
            return Vec::new();
        };

        let Some(receiver) = self.incoming.get_mut(&update.resource_hash) else {
            return Vec::new();
        };

        receiver.handle_hash_update(&update);
        let request = receiver.build_request();
        receiver.mark_request();

        match build_link_packet(
            link,
            PacketType::Data,
            PacketContext::ResourceRequest,
            &request.encode(),
        ) {
            Ok(packet) => vec![packet],
            Err(_) => Vec::new(),
        }
    }

    fn handle_part(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut completed: Option<Hash> = None;
        let mut proof_packet: Option<Packet> = None;
        let mut follow_up: Option<Packet> = None;
        let mut payload: Option<super::receiver::ResourcePayload> = None;

        for (hash, receiver) in self.incoming.iter_mut() {
            let before = receiver.progress().received_parts;
            match receiver.handle_part(packet.data.as_slice(), link) {
                PartOutcome::NoMatch => continue,
                PartOutcome::Complete(proof, resource_payload) => {
                    completed = Some(*hash);
                    proof_packet = Some(proof);
                    payload = Some(resource_payload);
                    break;
                }
                PartOutcome::Incomplete => {
                    if receiver.progress().received_parts > before {
                        receiver.note_served_round();
                        self.events.push(ResourceEvent {
                            hash: *hash,
                            link_id: receiver.link_id,
                            kind: ResourceEventKind::Progress(receiver.progress()),
                        });

                        // Ask for the next window once the current one is
                        // fully in.
                        let outstanding = receiver.build_request();
                        if !outstanding.wanted.is_empty()
                            && receiver.progress().received_parts
                                % receiver.window().max(1)
                                == 0
                        {
                            receiver.mark_request();
                            follow_up = build_link_packet(
                                link,
                                PacketType::Data,
                                PacketContext::ResourceRequest,
                                &outstanding.encode(),
                            )
                            .ok();
                        }
                    }
                    break;
                }
            }
        }

        if let Some(hash) = completed {
            self.incoming.remove(&hash);
            if let Some(payload) = payload {
                self.events.push(ResourceEvent {
                    hash,
                    link_id: *link.id(),
                    kind: ResourceEventKind::Complete(ResourceComplete {
                        data: payload.data,
                        metadata: payload.metadata,
                    }),
                });
            }
        }

        if let Some(packet) = proof_packet {
            return vec![packet];
        }
        if let Some(packet) = follow_up {
            return vec![packet];
        }
        Vec::new()
    }

    fn handle_proof(&mut self, packet: &Packet) -> Vec<Packet> {
        let Ok(proof) = ResourceProof::decode(packet.data.as_slice()) else {
            return Vec::new();
        };

        let confirmed = if let Some(sender) = self.outgoing.get_mut(&proof.resource_hash) {
            sender.handle_proof(&proof).then(|| {
                self.outgoing.remove(&proof.resource_hash);
            })
        } else if let Some((sender, _)) = self.failed_outgoing.get_mut(&proof.resource_hash) {
            // Late proof for a transfer already written off locally: the
            // peer did finish, so report success.
            sender.handle_proof(&proof).then(|| {
                self.failed_outgoing.remove(&proof.resource_hash);
            })
        } else {
            None
        };

        if confirmed.is_some() {
            self.events.push(ResourceEvent {
                hash: proof.resource_hash,
                link_id: packet.destination,
                kind: ResourceEventKind::OutboundComplete,
            });
        }

        Vec::new()
    }

    fn handle_cancel(&mut self, packet: &Packet, link: &mut Link) -> Vec<Packet> {
        let mut scratch = [0u8; crate::packet::PACKET_MDU];
        let Ok(plain) = link.open(packet.data.as_slice(), &mut scratch) else {
            return Vec::new();
        };
        if let Ok(hash) = Hash::from_slice(plain) {
            self.incoming.remove(&hash);
            self.outgoing.remove(&hash);
            log::debug!("resource: {} cancelled by peer", hash);
        }
        Vec::new()
    }

    pub fn inbound_count(&self) -> usize {
        self.incoming.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.outgoing.len()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rand_core::{OsRng, RngCore};

    use super::ResourceManager;
    use crate::destination::link::{Link, LinkHandleResult};
    use crate::destination::{DestinationName, SingleInputDestination, SingleOutputDestination};
    use crate::identity::PrivateIdentity;
    use crate::packet::{Packet, PacketContext};
    use crate::resource::{ResourceEventKind, MAP_HASH_LEN};

    fn establish() -> (Link, Link) {
        let identity = PrivateIdentity::generate(OsRng);
        let name = DestinationName::new("resource", "test");
        let input = SingleInputDestination::new(identity.clone(), name);
        let output = SingleOutputDestination::new(*identity.as_identity(), name);
        let (tx, _rx) = tokio::sync::broadcast::channel(64);

        let mut initiator = Link::new(output.desc, tx.clone());
        let request = initiator.request();
        let mut responder =
            Link::from_request(&request, input.signing_key().clone(), input.desc, tx)
                .expect("responder");
        let proof = responder.prove();
        assert!(matches!(initiator.handle_packet(&proof), LinkHandleResult::Activated));
        (initiator, responder)
    }

    /// Runs the request/part exchange until both sides go quiet, dropping
    /// every `drop_nth` segment packet once to exercise retransmission.
    fn pump(
        sender_mgr: &mut ResourceManager,
        sender_link: &mut Link,
        receiver_mgr: &mut ResourceManager,
        receiver_link: &mut Link,
        mut queue: Vec<Packet>,
        drop_nth: usize,
    ) -> usize {
        let mut seen_parts = 0usize;
        let mut dropped = false;
        let mut rounds = 0usize;

        while !queue.is_empty() && rounds < 200 {
            rounds += 1;
            let mut next = Vec::new();
            for packet in queue.drain(..) {
                if packet.context == PacketContext::Resource {
                    seen_parts += 1;
                    if drop_nth > 0 && seen_parts % drop_nth == 0 && !dropped {
                        // Lose this segment once; a retry must recover it.
                        dropped = true;
                        continue;
                    }
                }

                // Packets addressed at the receiver side.
                let replies = receiver_mgr.handle_packet(&packet, receiver_link);
                for reply in replies {
                    next.extend(sender_mgr.handle_packet(&reply, sender_link));
                }
            }

            if next.is_empty() && receiver_mgr.inbound_count() > 0 {
                // Drive the retry clock with a generous back-dated deadline.
                let due = receiver_mgr
                    .retry_requests(Instant::now() + Duration::from_secs(3600));
                for (_, request) in due {
                    let packet = crate::resource::build_link_packet(
                        receiver_link,
                        crate::packet::PacketType::Data,
                        PacketContext::ResourceRequest,
                        &request.encode(),
                    )
                    .expect("request packet");
                    next.extend(sender_mgr.handle_packet(&packet, sender_link));
                }
            }

            queue = next;
        }

        rounds
    }

    fn run_transfer(payload: Vec<u8>, metadata: Option<Vec<u8>>, drop_nth: usize) {
        let (mut initiator, mut responder) = establish();
        let mut sender_mgr = ResourceManager::with_config(Duration::from_millis(1), 25);
        let mut receiver_mgr = ResourceManager::with_config(Duration::from_millis(1), 25);

        let (resource_hash, advertisement) = sender_mgr
            .start_send(&initiator, payload.clone(), metadata.clone())
            .expect("transfer starts");

        pump(
            &mut sender_mgr,
            &mut initiator,
            &mut receiver_mgr,
            &mut responder,
            vec![advertisement],
            drop_nth,
        );

        let events = receiver_mgr.drain_events();
        let complete = events
            .iter()
            .find_map(|event| match &event.kind {
                ResourceEventKind::Complete(complete) => Some(complete),
                _ => None,
            })
            .expect("transfer completed");

        assert_eq!(complete.data, payload);
        assert_eq!(complete.metadata, metadata);

        // The sender saw the proof and reported completion.
        let sender_events = sender_mgr.drain_events();
        assert!(sender_events.iter().any(|event| {
            event.hash == resource_hash
                && matches!(event.kind, ResourceEventKind::OutboundComplete)
        }));
        assert_eq!(sender_mgr.outbound_count(), 0);
        assert_eq!(receiver_mgr.inbound_count(), 0);
    }

    #[test]
    fn small_transfer_completes() {
        run_transfer(b"just a few bytes".to_vec(), None, 0);
    }

    #[test]
    fn multi_part_transfer_completes() {
        let mut payload = vec![0u8; 8 * 1024];
        OsRng.fill_bytes(&mut payload);
        run_transfer(payload, None, 0);
    }

    #[test]
    fn transfer_with_metadata_completes() {
        let mut payload = vec![0u8; 2048];
        OsRng.fill_bytes(&mut payload);
        run_transfer(payload, Some(b"name=sample.bin".to_vec()), 0);
    }

    #[test]
    fn lost_segment_is_retransmitted() {
        let mut payload = vec![0u8; 4 * 1024];
        OsRng.fill_bytes(&mut payload);
        run_transfer(payload, None, 3);
    }

    #[test]
    fn compressible_payload_is_shipped_compressed() {
        // Highly repetitive payload: bzip2 must win and the transfer must
        // still verify end to end.
        let payload = vec![0x42u8; 16 * 1024];
        run_transfer(payload, None, 0);
    }

    #[test]
    fn duplicate_segments_are_idempotent() {
        let (mut initiator, mut responder) = establish();
        let mut sender_mgr = ResourceManager::new();
        let mut receiver_mgr = ResourceManager::new();

        let mut payload = vec![0u8; 2 * 1024];
        OsRng.fill_bytes(&mut payload);
        let (_, advertisement) =
            sender_mgr.start_send(&initiator, payload, None).expect("transfer starts");

        let request = receiver_mgr
            .handle_packet(&advertisement, &mut responder)
            .pop()
            .expect("initial request");
        let parts = sender_mgr.handle_packet(&request, &mut initiator);
        assert!(!parts.is_empty());

        // Deliver the first segment twice; progress must count it once.
        let _ = receiver_mgr.handle_packet(&parts[0], &mut responder);
        let _ = receiver_mgr.handle_packet(&parts[0], &mut responder);

        let events = receiver_mgr.drain_events();
        let progress: Vec<_> = events
            .iter()
            .filter_map(|event| match &event.kind {
                ResourceEventKind::Progress(progress) => Some(progress.received_parts),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1]);
    }

    #[test]
    fn late_proof_after_local_failure_still_counts() {
        let (mut initiator, mut responder) = establish();
        let mut sender_mgr = ResourceManager::new();
        let mut receiver_mgr = ResourceManager::new();

        let payload = b"short lived".to_vec();
        let (resource_hash, advertisement) =
            sender_mgr.start_send(&initiator, payload, None).expect("transfer starts");

        let request = receiver_mgr
            .handle_packet(&advertisement, &mut responder)
            .pop()
            .expect("initial request");

        // The sender gives up locally before the proof comes back.
        sender_mgr.fail_outgoing(&resource_hash);
        assert_eq!(sender_mgr.outbound_count(), 0);

        let parts = sender_mgr.handle_packet(&request, &mut initiator);
        let mut proof = None;
        for part in parts {
            for reply in receiver_mgr.handle_packet(&part, &mut responder) {
                if reply.context == PacketContext::ResourceProof {
                    proof = Some(reply);
                }
            }
        }

        let proof = proof.expect("receiver proves completion");
        sender_mgr.handle_packet(&proof, &mut initiator);

        let events = sender_mgr.drain_events();
        assert!(events
            .iter()
            .any(|event| matches!(event.kind, ResourceEventKind::OutboundComplete)));
    }

    #[test]
    fn unsupported_split_advertisement_is_rejected() {
        let (initiator, mut responder) = establish();
        let mut receiver_mgr = ResourceManager::new();

        let advertisement = crate::resource::ResourceAdvertisement {
            transfer_size: 1,
            data_size: 1,
            parts: 1,
            hash: crate::hash::Hash::of(b"split"),
            random_hash: [0u8; 4],
            original_hash: crate::hash::Hash::of(b"split"),
            segment_index: 1,
            total_segments: 2,
            request_id: None,
            flags: crate::resource::FLAG_SPLIT,
            hashmap: vec![0u8; MAP_HASH_LEN],
        };
        let packet = crate::resource::build_link_packet(
            &initiator,
            crate::packet::PacketType::Data,
            PacketContext::ResourceAdvertisement,
            &advertisement.pack().expect("packs"),
        )
        .expect("advertisement packet");

        assert!(receiver_mgr.handle_packet(&packet, &mut responder).is_empty());
        assert_eq!(receiver_mgr.inbound_count(), 0);
    }
}
