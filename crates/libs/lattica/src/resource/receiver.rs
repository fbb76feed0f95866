use std::io::Read;
use std::time::{Duration, Instant};

use bzip2::read::BzDecoder;
use sha2::Digest;

use crate::destination::link::Link;
use crate::hash::Hash;
use crate::packet::{Packet, PacketContext, PacketType};

use super::{
    build_link_packet, map_hash, ResourceAdvertisement, ResourceHashUpdate, ResourceProgress,
    ResourceProof, ResourceRequest, ResourceStatus, FAST_RATE_THRESHOLD_BPS, FLAG_METADATA,
    FLAG_SPLIT, HASHMAP_MAX_LEN, MAP_HASH_LEN, METADATA_MAX_SIZE, RESOURCE_RANDOM_LEN,
    WINDOW_MAX_FAST, WINDOW_MAX_SLOW, WINDOW_MIN, WINDOW_START,
};

#[derive(Debug, Clone)]
pub(crate) struct ResourcePayload {
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

#[allow(clippy::large_enum_variant)]
pub(crate) enum PartOutcome {
    NoMatch,
    Incomplete,
    Complete(Packet, ResourcePayload),
}

/// Inbound side of one resource transfer: segment reassembly map, adaptive
/// request window, retransmission clock and final verification.
#[derive(Debug, Clone)]
pub(crate) struct ResourceReceiver {
    pub resource_hash: Hash,
    pub link_id: crate::hash::ShortHash,
    random_hash: [u8; RESOURCE_RANDOM_LEN],
    parts: Vec<Option<Vec<u8>>>,
    hashmap: Vec<Option<[u8; MAP_HASH_LEN]>>,
    received: usize,
    received_bytes: u64,
    total_bytes: u64,
    encrypted: bool,
    compressed: bool,
    split: bool,
    has_metadata: bool,
    window: usize,
    started: Instant,
    last_progress: Instant,
    last_request: Instant,
    retry_count: u8,
    pub status: ResourceStatus,
}

impl ResourceReceiver {
    pub(crate) fn new(adv: &ResourceAdvertisement, link_id: crate::hash::ShortHash) -> Self {
        let now = Instant::now();
        let total_parts = adv.parts as usize;

        let mut receiver = Self {
            resource_hash: adv.hash,
            link_id,
            random_hash: adv.random_hash,
            parts: vec![None; total_parts],
            hashmap: vec![None; total_parts],
            received: 0,
            received_bytes: 0,
            total_bytes: adv.transfer_size,
            encrypted: adv.encrypted(),
            compressed: adv.compressed(),
            split: adv.flags & FLAG_SPLIT != 0,
            has_metadata: adv.flags & FLAG_METADATA != 0,
            window: WINDOW_START,
            started: now,
            last_progress: now,
            last_request: now,
            retry_count: 0,
            status: ResourceStatus::Advertised,
        };
        receiver.apply_hashmap_segment(adv.segment_index.saturating_sub(1) as usize, &adv.hashmap);
        receiver
    }

    fn apply_hashmap_segment(&mut self, segment: usize, bytes: &[u8]) {
        for (i, chunk) in bytes.chunks_exact(MAP_HASH_LEN).enumerate() {
            let index = segment * HASHMAP_MAX_LEN + i;
            if index < self.hashmap.len() {
                let mut entry = [0u8; MAP_HASH_LEN];
                entry.copy_from_slice(chunk);
                self.hashmap[index] = Some(entry);
            }
        }
    }

    /// Observed continuous throughput since the advertisement.
    fn observed_bps(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        (self.received_bytes as f64 * 8.0) / elapsed
    }

    fn window_max(&self) -> usize {
        if self.observed_bps() < FAST_RATE_THRESHOLD_BPS {
            WINDOW_MAX_SLOW
        } else {
            WINDOW_MAX_FAST
        }
    }

    /// Widens the window after a clean round; called when a request was
    /// fully served.
    fn widen_window(&mut self) {
        self.window = (self.window + 1).min(self.window_max());
    }

    /// Halves the window after a timeout.
    fn narrow_window(&mut self) {
        self.window = (self.window / 2).max(WINDOW_MIN);
    }

    /// The next retransmission request: up to `window` missing segments in
    /// map order, flagging hashmap exhaustion for continuation.
    pub(crate) fn build_request(&self) -> ResourceRequest {
        let mut wanted = Vec::new();
        let mut last_known: Option<[u8; MAP_HASH_LEN]> = None;
        let mut hashmap_exhausted = false;

        for (index, entry) in self.hashmap.iter().enumerate() {
            match entry {
                Some(hash) => {
                    last_known = Some(*hash);
                    if self.parts[index].is_none() {
                        wanted.push(*hash);
                        if wanted.len() >= self.window {
                            break;
                        }
                    }
                }
                None => {
                    hashmap_exhausted = true;
                    break;
                }
            }
        }

        ResourceRequest {
            hashmap_exhausted,
            last_map_hash: if hashmap_exhausted { last_known } else { None },
            resource_hash: self.resource_hash,
            wanted,
        }
    }

    pub(crate) fn handle_hash_update(&mut self, update: &ResourceHashUpdate) {
        if update.resource_hash != self.resource_hash {
            return;
        }
        self.apply_hashmap_segment(update.segment as usize, &update.hashmap);
    }

    /// Stores one received segment. Duplicates are no-ops; the final
    /// segment triggers reassembly, verification and the proof.
    pub(crate) fn handle_part(&mut self, part: &[u8], link: &Link) -> PartOutcome {
        if self.split {
            // Multi-segment resources don't exist on this implementation's
            // wire; the advertisement gate should have caught this.
            self.status = ResourceStatus::Failed;
            return PartOutcome::Incomplete;
        }

        let hash = map_hash(part, &self.random_hash);
        let Some(index) = self.hashmap.iter().position(|entry| entry.as_ref() == Some(&hash))
        else {
            return PartOutcome::NoMatch;
        };

        if self.parts[index].is_none() {
            self.parts[index] = Some(part.to_vec());
            self.received += 1;
            self.received_bytes = self.received_bytes.saturating_add(part.len() as u64);
            self.last_progress = Instant::now();
            self.status = ResourceStatus::Transferring;

            if self.build_request().wanted.is_empty() && self.received < self.parts.len() {
                // Everything currently known was served; open up.
                self.widen_window();
            }
        }

        if self.received < self.parts.len() || self.parts.is_empty() {
            return PartOutcome::Incomplete;
        }

        self.finalize(link)
    }

    fn finalize(&mut self, link: &Link) -> PartOutcome {
        let mut sealed = Vec::with_capacity(self.total_bytes as usize);
        for part in &self.parts {
            match part {
                Some(bytes) => sealed.extend_from_slice(bytes),
                None => return PartOutcome::Incomplete,
            }
        }

        let stream = if self.encrypted {
            let mut out = vec![0u8; sealed.len() + 64];
            match link.open(&sealed, &mut out) {
                Ok(plain) => plain.to_vec(),
                Err(_) => {
                    self.status = ResourceStatus::Failed;
                    return PartOutcome::Incomplete;
                }
            }
        } else {
            sealed
        };

        // Strip the anti-replay prefix; what remains is the wire payload,
        // compressed or not.
        let wire_payload = if stream.len() > RESOURCE_RANDOM_LEN {
            stream[RESOURCE_RANDOM_LEN..].to_vec()
        } else {
            Vec::new()
        };

        let assembled = if self.compressed {
            let mut decoder = BzDecoder::new(wire_payload.as_slice());
            let mut decompressed = Vec::new();
            if decoder.read_to_end(&mut decompressed).is_err() {
                self.status = ResourceStatus::Failed;
                return PartOutcome::Incomplete;
            }
            decompressed
        } else {
            wire_payload
        };

        let computed = Hash::new(
            sha2::Sha256::new()
                .chain_update(&assembled)
                .chain_update(self.random_hash)
                .finalize()
                .into(),
        );
        if computed != self.resource_hash {
            self.status = ResourceStatus::Failed;
            return PartOutcome::Incomplete;
        }

        let proof = Hash::new(
            sha2::Sha256::new()
                .chain_update(&assembled)
                .chain_update(self.resource_hash.as_slice())
                .finalize()
                .into(),
        );

        let (metadata, data) = if self.has_metadata && assembled.len() >= 3 {
            let size = ((assembled[0] as usize) << 16)
                | ((assembled[1] as usize) << 8)
                | assembled[2] as usize;
            if size > METADATA_MAX_SIZE {
                self.status = ResourceStatus::Failed;
                return PartOutcome::Incomplete;
            }
            if assembled.len() >= 3 + size {
                (Some(assembled[3..3 + size].to_vec()), assembled[3 + size..].to_vec())
            } else {
                (None, assembled)
            }
        } else {
            (None, assembled)
        };

        let proof_packet = match build_link_packet(
            link,
            PacketType::Proof,
            PacketContext::ResourceProof,
            &ResourceProof { resource_hash: self.resource_hash, proof }.encode(),
        ) {
            Ok(packet) => packet,
            Err(_) => {
                log::warn!("resource: proof packet build failed");
                self.status = ResourceStatus::Failed;
                return PartOutcome::Incomplete;
            }
        };

        self.status = ResourceStatus::Complete;
        PartOutcome::Complete(proof_packet, ResourcePayload { data, metadata })
    }

    pub(crate) fn mark_request(&mut self) {
        self.last_request = Instant::now();
        self.retry_count = self.retry_count.saturating_add(1);
    }

    pub(crate) fn note_served_round(&mut self) {
        self.retry_count = 0;
    }

    /// Retry clock. The interval scales with the observed link rate so a
    /// 500 bps carrier is not declared dead while a window is still in the
    /// air; a firing retry narrows the window.
    pub(crate) fn retry_due(
        &mut self,
        now: Instant,
        base_interval: Duration,
        max_retries: u8,
    ) -> bool {
        if matches!(self.status, ResourceStatus::Complete | ResourceStatus::Failed) {
            return false;
        }
        if self.retry_count >= max_retries {
            return false;
        }

        let window_bytes = (self.window * crate::packet::PACKET_MDU) as f64;
        let window_airtime =
            Duration::from_secs_f64((window_bytes * 8.0 / self.observed_bps().max(100.0)) * 3.0);
        let interval = base_interval.max(window_airtime);

        let due = now.duration_since(self.last_progress) >= interval
            && now.duration_since(self.last_request) >= interval;
        if due {
            self.narrow_window();
        }
        due
    }

    pub(crate) fn retries_exhausted(&self, max_retries: u8) -> bool {
        self.retry_count >= max_retries
            && !matches!(self.status, ResourceStatus::Complete | ResourceStatus::Failed)
    }

    pub(crate) fn progress(&self) -> ResourceProgress {
        ResourceProgress {
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            received_parts: self.received,
            total_parts: self.parts.len(),
        }
    }

    pub(crate) fn window(&self) -> usize {
        self.window
    }
}
