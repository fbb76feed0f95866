use std::io::Read;

use bzip2::read::BzEncoder;
use bzip2::Compression;
use rand_core::{OsRng, RngCore};
use sha2::Digest;

use crate::destination::link::Link;
use crate::error::LatticaError;
use crate::hash::Hash;
use crate::packet::{Packet, PacketContext, PacketType, PACKET_MDU};

use super::{
    build_link_packet, map_hash, slice_hashmap_segment, ResourceAdvertisement, ResourceProof,
    ResourceRequest, ResourceStatus, COMPRESSION_THRESHOLD, FLAG_COMPRESSED, FLAG_ENCRYPTED,
    FLAG_METADATA, HASHMAP_MAX_LEN, MAP_HASH_LEN, METADATA_MAX_SIZE, RESOURCE_RANDOM_LEN,
};

/// Outbound side of one resource transfer. Owns the sealed segment store
/// and answers receiver requests with exactly the segments asked for.
#[derive(Debug, Clone)]
pub(crate) struct ResourceSender {
    pub resource_hash: Hash,
    random_hash: [u8; RESOURCE_RANDOM_LEN],
    parts: Vec<Vec<u8>>,
    map_hashes: Vec<[u8; MAP_HASH_LEN]>,
    expected_proof: Hash,
    data_size: u64,
    compressed: bool,
    has_metadata: bool,
    pub status: ResourceStatus,
}

impl ResourceSender {
    pub(crate) fn new(
        link: &Link,
        data: Vec<u8>,
        metadata: Option<Vec<u8>>,
    ) -> Result<Self, LatticaError> {
        let has_metadata = metadata.is_some();

        let mut assembled = match metadata {
            Some(payload) => {
                if payload.len() > METADATA_MAX_SIZE {
                    return Err(LatticaError::InvalidArgument);
                }
                // 24-bit big-endian length prefix ahead of the metadata.
                let size = (payload.len() as u32).to_be_bytes();
                let mut out = Vec::with_capacity(3 + payload.len() + data.len());
                out.extend_from_slice(&size[1..]);
                out.extend_from_slice(&payload);
                out
            }
            None => Vec::with_capacity(data.len()),
        };
        assembled.extend_from_slice(&data);

        let mut random_hash = [0u8; RESOURCE_RANDOM_LEN];
        OsRng.fill_bytes(&mut random_hash);

        // Hashes cover the assembled (uncompressed) payload, so the proof
        // stays valid regardless of what the wire carried.
        let data_size = assembled.len() as u64;
        let resource_hash = Hash::new(
            sha2::Sha256::new()
                .chain_update(&assembled)
                .chain_update(random_hash)
                .finalize()
                .into(),
        );
        let expected_proof = Hash::new(
            sha2::Sha256::new()
                .chain_update(&assembled)
                .chain_update(resource_hash.as_slice())
                .finalize()
                .into(),
        );

        // Compression is decided per transfer: applied only when the
        // payload clears the threshold and bzip2 actually wins.
        let (wire_payload, compressed) = if assembled.len() > COMPRESSION_THRESHOLD {
            match compress(&assembled) {
                Some(smaller) if smaller.len() < assembled.len() => (smaller, true),
                _ => (assembled, false),
            }
        } else {
            (assembled, false)
        };

        // A random prefix keeps identical payloads from producing an
        // identical sealed stream.
        let mut stream = vec![0u8; RESOURCE_RANDOM_LEN];
        OsRng.fill_bytes(&mut stream);
        stream.extend_from_slice(&wire_payload);

        let mut sealed = vec![0u8; stream.len() + 128];
        let sealed_len = link.seal(&stream, &mut sealed)?.len();
        sealed.truncate(sealed_len);

        let parts: Vec<Vec<u8>> =
            sealed.chunks(PACKET_MDU).map(|chunk| chunk.to_vec()).collect();
        let map_hashes = parts.iter().map(|part| map_hash(part, &random_hash)).collect();

        Ok(Self {
            resource_hash,
            random_hash,
            parts,
            map_hashes,
            expected_proof,
            data_size,
            compressed,
            has_metadata,
            status: ResourceStatus::Advertised,
        })
    }

    pub(crate) fn advertisement(&self, segment: usize) -> ResourceAdvertisement {
        let mut flags = FLAG_ENCRYPTED;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.has_metadata {
            flags |= FLAG_METADATA;
        }

        ResourceAdvertisement {
            transfer_size: self.parts.iter().map(|part| part.len() as u64).sum(),
            data_size: self.data_size,
            parts: self.parts.len() as u32,
            hash: self.resource_hash,
            random_hash: self.random_hash,
            original_hash: self.resource_hash,
            segment_index: segment as u32 + 1,
            total_segments: 1,
            request_id: None,
            flags,
            hashmap: slice_hashmap_segment(&self.map_hashes, segment),
        }
    }

    /// Serves a retransmission request: the wanted segments, plus the next
    /// hashmap segment when the receiver reports its map exhausted.
    pub(crate) fn handle_request(&mut self, request: &ResourceRequest, link: &Link) -> Vec<Packet> {
        if request.resource_hash != self.resource_hash {
            return Vec::new();
        }

        let mut packets = Vec::new();
        for wanted in &request.wanted {
            let Some(index) = self.map_hashes.iter().position(|hash| hash == wanted) else {
                continue;
            };
            let Some(part) = self.parts.get(index) else {
                continue;
            };
            match build_link_packet(link, PacketType::Data, PacketContext::Resource, part) {
                Ok(packet) => packets.push(packet),
                Err(_) => log::warn!("resource: segment packet build failed"),
            }
        }

        if request.hashmap_exhausted {
            if let Some(update) = self.continuation_for(request) {
                match build_link_packet(
                    link,
                    PacketType::Data,
                    PacketContext::ResourceHashUpdate,
                    &update,
                ) {
                    Ok(packet) => packets.push(packet),
                    Err(_) => log::warn!("resource: hashmap update build failed"),
                }
            }
        }

        if matches!(self.status, ResourceStatus::Advertised | ResourceStatus::Transferring) {
            self.status = ResourceStatus::Transferring;
        }

        packets
    }

    fn continuation_for(&self, request: &ResourceRequest) -> Option<Vec<u8>> {
        let last_hash = request.last_map_hash?;
        let last_index = self.map_hashes.iter().position(|hash| *hash == last_hash)?;
        let next_segment = last_index / HASHMAP_MAX_LEN + 1;
        if next_segment * HASHMAP_MAX_LEN >= self.map_hashes.len() {
            return None;
        }

        super::ResourceHashUpdate {
            resource_hash: self.resource_hash,
            segment: next_segment as u32,
            hashmap: slice_hashmap_segment(&self.map_hashes, next_segment),
        }
        .encode()
        .ok()
    }

    /// Accepts the receiver's completion proof when it matches the expected
    /// value.
    pub(crate) fn handle_proof(&mut self, proof: &ResourceProof) -> bool {
        if proof.resource_hash != self.resource_hash {
            return false;
        }
        if proof.proof == self.expected_proof {
            self.status = ResourceStatus::Complete;
            return true;
        }
        false
    }
}

fn compress(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = BzEncoder::new(data, Compression::default());
    let mut out = Vec::new();
    encoder.read_to_end(&mut out).ok()?;
    Some(out)
}
