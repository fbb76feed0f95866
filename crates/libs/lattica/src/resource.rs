mod manager;
mod receiver;
mod sender;

pub use manager::ResourceManager;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::destination::link::Link;
use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash, HASH_SIZE};
use crate::packet::{
    DestinationType, Header, Packet, PacketContext, PacketPayload, PacketType, PACKET_MDU,
};

/// Initial request window: segments asked for per round before the link
/// rate is known.
pub const WINDOW_START: usize = 4;
pub const WINDOW_MIN: usize = 1;

/// Window ceiling while the observed link rate stays below
/// [`FAST_RATE_THRESHOLD_BPS`]. Keeps round-trip state small on LoRa-class
/// carriers.
pub const WINDOW_MAX_SLOW: usize = 10;
pub const WINDOW_MAX_FAST: usize = 64;
pub const FAST_RATE_THRESHOLD_BPS: f64 = 50_000.0;

/// Truncated per-segment hash in the advertisement hashmap.
pub const MAP_HASH_LEN: usize = 4;

pub const RESOURCE_RANDOM_LEN: usize = 4;

/// Payloads below this size ship uncompressed; the bzip2 header alone would
/// dominate.
pub const COMPRESSION_THRESHOLD: usize = 64;

/// Worst-case advertisement framing, bounding how many map hashes fit per
/// advertisement packet.
pub const ADVERTISEMENT_OVERHEAD: usize = 134;
pub const HASHMAP_MAX_LEN: usize =
    (PACKET_MDU - ADVERTISEMENT_OVERHEAD) / MAP_HASH_LEN;

pub(crate) const FLAG_ENCRYPTED: u8 = 0x01;
pub(crate) const FLAG_COMPRESSED: u8 = 0x02;
pub(crate) const FLAG_SPLIT: u8 = 0x04;
pub(crate) const FLAG_METADATA: u8 = 0x20;

pub(crate) const METADATA_MAX_SIZE: usize = 16 * 1024 * 1024 - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Advertised,
    Transferring,
    AwaitingProof,
    Complete,
    Failed,
}

/// Wire advertisement announcing a transfer, msgpack-encoded with one-letter
/// field names to stay inside a single packet next to the first hashmap
/// segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAdvertisement {
    pub transfer_size: u64,
    pub data_size: u64,
    pub parts: u32,
    pub hash: Hash,
    pub random_hash: [u8; RESOURCE_RANDOM_LEN],
    pub original_hash: Hash,
    pub segment_index: u32,
    pub total_segments: u32,
    pub request_id: Option<ByteBuf>,
    pub flags: u8,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AdvertisementFrame {
    #[serde(rename = "t")]
    transfer_size: u64,
    #[serde(rename = "d")]
    data_size: u64,
    #[serde(rename = "n")]
    parts: u32,
    #[serde(rename = "h", with = "serde_bytes")]
    hash: Vec<u8>,
    #[serde(rename = "r", with = "serde_bytes")]
    random_hash: Vec<u8>,
    #[serde(rename = "o", with = "serde_bytes")]
    original_hash: Vec<u8>,
    #[serde(rename = "i")]
    segment_index: u32,
    #[serde(rename = "l")]
    total_segments: u32,
    #[serde(rename = "q")]
    request_id: Option<ByteBuf>,
    #[serde(rename = "f")]
    flags: u8,
    #[serde(rename = "m", with = "serde_bytes")]
    hashmap: Vec<u8>,
}

impl ResourceAdvertisement {
    pub fn pack(&self) -> Result<Vec<u8>, LatticaError> {
        let frame = AdvertisementFrame {
            transfer_size: self.transfer_size,
            data_size: self.data_size,
            parts: self.parts,
            hash: self.hash.as_slice().to_vec(),
            random_hash: self.random_hash.to_vec(),
            original_hash: self.original_hash.as_slice().to_vec(),
            segment_index: self.segment_index,
            total_segments: self.total_segments,
            request_id: self.request_id.clone(),
            flags: self.flags,
            hashmap: self.hashmap.clone(),
        };
        rmp_serde::to_vec_named(&frame).map_err(|_| LatticaError::PacketError)
    }

    pub fn unpack(data: &[u8]) -> Result<Self, LatticaError> {
        let frame: AdvertisementFrame =
            rmp_serde::from_slice(data).map_err(|_| LatticaError::PacketError)?;
        Ok(Self {
            transfer_size: frame.transfer_size,
            data_size: frame.data_size,
            parts: frame.parts,
            hash: Hash::from_slice(&frame.hash)?,
            random_hash: copy_fixed::<RESOURCE_RANDOM_LEN>(&frame.random_hash)?,
            original_hash: Hash::from_slice(&frame.original_hash)?,
            segment_index: frame.segment_index,
            total_segments: frame.total_segments,
            request_id: frame.request_id,
            flags: frame.flags,
            hashmap: frame.hashmap,
        })
    }

    pub fn encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }

    pub fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }
}

/// Receiver → sender: the segments still missing, expressed as map hashes,
/// plus continuation state when the receiver has run out of known hashmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub hashmap_exhausted: bool,
    pub last_map_hash: Option<[u8; MAP_HASH_LEN]>,
    pub resource_hash: Hash,
    pub wanted: Vec<[u8; MAP_HASH_LEN]>,
}

impl ResourceRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + MAP_HASH_LEN + HASH_SIZE + self.wanted.len() * MAP_HASH_LEN,
        );
        if self.hashmap_exhausted {
            out.push(0xFF);
            out.extend_from_slice(&self.last_map_hash.unwrap_or([0u8; MAP_HASH_LEN]));
        } else {
            out.push(0x00);
        }
        out.extend_from_slice(self.resource_hash.as_slice());
        for hash in &self.wanted {
            out.extend_from_slice(hash);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, LatticaError> {
        if data.len() < 1 + HASH_SIZE {
            return Err(LatticaError::PacketError);
        }

        let hashmap_exhausted = data[0] == 0xFF;
        let mut offset = 1;

        let last_map_hash = if hashmap_exhausted {
            if data.len() < 1 + MAP_HASH_LEN + HASH_SIZE {
                return Err(LatticaError::PacketError);
            }
            let hash = copy_fixed::<MAP_HASH_LEN>(&data[offset..offset + MAP_HASH_LEN])?;
            offset += MAP_HASH_LEN;
            Some(hash)
        } else {
            None
        };

        let resource_hash = Hash::from_slice(&data[offset..offset + HASH_SIZE])?;
        offset += HASH_SIZE;

        let mut wanted = Vec::new();
        while offset + MAP_HASH_LEN <= data.len() {
            wanted.push(copy_fixed::<MAP_HASH_LEN>(&data[offset..offset + MAP_HASH_LEN])?);
            offset += MAP_HASH_LEN;
        }

        Ok(Self { hashmap_exhausted, last_map_hash, resource_hash, wanted })
    }
}

/// Sender → receiver: a further hashmap segment once the advertised one is
/// exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHashUpdate {
    pub resource_hash: Hash,
    pub segment: u32,
    pub hashmap: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HashUpdateFrame(u32, #[serde(with = "serde_bytes")] Vec<u8>);

impl ResourceHashUpdate {
    pub fn encode(&self) -> Result<Vec<u8>, LatticaError> {
        let mut out = Vec::with_capacity(HASH_SIZE + self.hashmap.len() + 8);
        out.extend_from_slice(self.resource_hash.as_slice());
        let frame = rmp_serde::to_vec(&HashUpdateFrame(self.segment, self.hashmap.clone()))
            .map_err(|_| LatticaError::PacketError)?;
        out.extend_from_slice(&frame);
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, LatticaError> {
        if data.len() < HASH_SIZE + 1 {
            return Err(LatticaError::PacketError);
        }
        let resource_hash = Hash::from_slice(&data[..HASH_SIZE])?;
        let frame: HashUpdateFrame =
            rmp_serde::from_slice(&data[HASH_SIZE..]).map_err(|_| LatticaError::PacketError)?;
        Ok(Self { resource_hash, segment: frame.0, hashmap: frame.1 })
    }
}

/// Receiver → sender: hash-of-data proof that the reassembled payload
/// matches the advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceProof {
    pub resource_hash: Hash,
    pub proof: Hash,
}

impl ResourceProof {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_SIZE * 2);
        out.extend_from_slice(self.resource_hash.as_slice());
        out.extend_from_slice(self.proof.as_slice());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, LatticaError> {
        if data.len() < HASH_SIZE * 2 {
            return Err(LatticaError::PacketError);
        }
        Ok(Self {
            resource_hash: Hash::from_slice(&data[..HASH_SIZE])?,
            proof: Hash::from_slice(&data[HASH_SIZE..HASH_SIZE * 2])?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub hash: Hash,
    pub link_id: ShortHash,
    pub kind: ResourceEventKind,
}

#[derive(Debug, Clone)]
pub enum ResourceEventKind {
    Progress(ResourceProgress),
    Complete(ResourceComplete),
    OutboundComplete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ResourceProgress {
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub received_parts: usize,
    pub total_parts: usize,
}

#[derive(Debug, Clone)]
pub struct ResourceComplete {
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

/// Builds a packet on a link for the resource machinery. Segment payloads
/// and proofs are not re-encrypted: segments are slices of an already
/// sealed stream, and proofs carry only hashes.
pub(crate) fn build_link_packet(
    link: &Link,
    packet_type: PacketType,
    context: PacketContext,
    payload: &[u8],
) -> Result<Packet, LatticaError> {
    let mut data = PacketPayload::new();
    let plaintext_contexts = context == PacketContext::Resource
        || (packet_type == PacketType::Proof && context == PacketContext::ResourceProof);

    if plaintext_contexts {
        data.push(payload)?;
    } else {
        let sealed_len = {
            let sealed = link.seal(payload, data.grow_max())?;
            sealed.len()
        };
        data.truncate(sealed_len);
    }

    Ok(Packet {
        header: Header {
            destination_type: DestinationType::Link,
            packet_type,
            ..Default::default()
        },
        ifac: None,
        destination: *link.id(),
        transport: None,
        context,
        data,
    })
}

pub(crate) fn map_hash(part: &[u8], random_hash: &[u8; RESOURCE_RANDOM_LEN]) -> [u8; MAP_HASH_LEN] {
    use sha2::Digest;
    let digest = sha2::Sha256::new().chain_update(part).chain_update(random_hash).finalize();
    let mut out = [0u8; MAP_HASH_LEN];
    out.copy_from_slice(&digest[..MAP_HASH_LEN]);
    out
}

pub(crate) fn slice_hashmap_segment(hashes: &[[u8; MAP_HASH_LEN]], segment: usize) -> Vec<u8> {
    let start = segment * HASHMAP_MAX_LEN;
    let end = usize::min((segment + 1) * HASHMAP_MAX_LEN, hashes.len());
    let mut out = Vec::with_capacity((end.saturating_sub(start)) * MAP_HASH_LEN);
    for hash in &hashes[start..end] {
        out.extend_from_slice(hash);
    }
    out
}

pub(crate) fn copy_fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], LatticaError> {
    if bytes.len() < N {
        return Err(LatticaError::PacketError);
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_bytes::ByteBuf;

    use super::{
        ResourceAdvertisement, ResourceHashUpdate, ResourceProof, ResourceRequest,
        FLAG_ENCRYPTED, MAP_HASH_LEN,
    };
    use crate::hash::Hash;

    #[test]
    fn advertisement_roundtrip() {
        let advertisement = ResourceAdvertisement {
            transfer_size: 4096,
            data_size: 4000,
            parts: 9,
            hash: Hash::of(b"resource"),
            random_hash: [1, 2, 3, 4],
            original_hash: Hash::of(b"resource"),
            segment_index: 1,
            total_segments: 1,
            request_id: Some(ByteBuf::from(vec![9u8; 16])),
            flags: FLAG_ENCRYPTED,
            hashmap: vec![0u8; 9 * MAP_HASH_LEN],
        };

        let packed = advertisement.pack().expect("packs");
        let unpacked = ResourceAdvertisement::unpack(&packed).expect("unpacks");
        assert_eq!(unpacked, advertisement);
        assert!(unpacked.encrypted());
        assert!(!unpacked.compressed());
    }

    #[test]
    fn request_roundtrip_with_exhausted_hashmap() {
        let request = ResourceRequest {
            hashmap_exhausted: true,
            last_map_hash: Some([7, 7, 7, 7]),
            resource_hash: Hash::of(b"resource"),
            wanted: vec![[1, 1, 1, 1], [2, 2, 2, 2]],
        };

        let decoded = ResourceRequest::decode(&request.encode()).expect("decodes");
        assert_eq!(decoded, request);
    }

    #[test]
    fn hash_update_roundtrip() {
        let update = ResourceHashUpdate {
            resource_hash: Hash::of(b"resource"),
            segment: 3,
            hashmap: vec![5u8; 32],
        };
        let decoded =
            ResourceHashUpdate::decode(&update.encode().expect("encodes")).expect("decodes");
        assert_eq!(decoded, update);
    }

    #[test]
    fn proof_roundtrip() {
        let proof = ResourceProof { resource_hash: Hash::of(b"res"), proof: Hash::of(b"proof") };
        let decoded = ResourceProof::decode(&proof.encode()).expect("decodes");
        assert_eq!(decoded, proof);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(ResourceRequest::decode(&[0x00; 8]).is_err());
        assert!(ResourceProof::decode(&[0x00; 16]).is_err());
        assert!(ResourceAdvertisement::unpack(&[0xC0]).is_err());
    }
}
