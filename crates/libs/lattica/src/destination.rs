pub mod link;

use core::{fmt, marker::PhantomData};
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, SigningKey, SIGNATURE_LENGTH};
use rand_core::{CryptoRngCore, OsRng};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha2::Digest;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypt::token::{PlainText, Token, TokenCipher};
use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash};
use crate::identity::{
    HashMaterial, Identity, NoIdentity, PrivateIdentity, PUBLIC_KEY_LENGTH,
};
use crate::packet::{
    DestinationType, Header, HeaderType, IfacFlag, Packet, PacketContext, PacketPayload,
    PacketType, PropagationType,
};
use crate::ratchets::{now_secs, open_with_identity, open_with_secret};
use crate::storage::write_atomic;

//***************************************************************************//

pub trait Direction {}

pub struct Input;
pub struct Output;

impl Direction for Input {}
impl Direction for Output {}

//***************************************************************************//

pub trait Kind {
    fn destination_type() -> DestinationType;
}

pub struct Single;
pub struct Group;
pub struct Plain;

impl Kind for Single {
    fn destination_type() -> DestinationType {
        DestinationType::Single
    }
}

impl Kind for Group {
    fn destination_type() -> DestinationType {
        DestinationType::Group
    }
}

impl Kind for Plain {
    fn destination_type() -> DestinationType {
        DestinationType::Plain
    }
}

pub const NAME_HASH_LENGTH: usize = 10;
pub const RANDOM_BLOB_LENGTH: usize = 10;
pub const RATCHET_LENGTH: usize = PUBLIC_KEY_LENGTH;
pub const MIN_ANNOUNCE_DATA_LENGTH: usize =
    PUBLIC_KEY_LENGTH * 2 + NAME_HASH_LENGTH + RANDOM_BLOB_LENGTH + SIGNATURE_LENGTH;

const DEFAULT_RATCHET_INTERVAL_SECS: u64 = 30 * 60;
const DEFAULT_RETAINED_RATCHETS: usize = 512;

/// Pre-shared key for group destinations, stretched into the token cipher
/// halves so the full 32 bytes contribute to both signing and encryption.
#[derive(Clone)]
pub struct GroupKey {
    key: [u8; 32],
    key_hash: ShortHash,
}

impl GroupKey {
    pub fn new(key: [u8; 32]) -> Self {
        let key_hash = ShortHash::of(&key);
        Self { key, key_hash }
    }

    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut key = [0u8; 32];
        rng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>, LatticaError> {
        let (sign_half, cipher_half) = self.key.split_at(16);
        let cipher = TokenCipher::from_halves(sign_half, cipher_half, OsRng);
        let mut out = vec![0u8; data.len() + 80];
        let token = cipher.seal(PlainText::from(data), &mut out)?;
        let len = token.len();
        out.truncate(len);
        Ok(out)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, LatticaError> {
        let (sign_half, cipher_half) = self.key.split_at(16);
        let cipher = TokenCipher::from_halves(sign_half, cipher_half, OsRng);
        let verified = cipher.verify(Token::from(data))?;
        let mut out = vec![0u8; data.len()];
        let plain = cipher.open(verified, &mut out)?;
        Ok(plain.as_slice().to_vec())
    }
}

impl HashMaterial for GroupKey {
    fn hash_material(&self) -> &[u8] {
        self.key_hash.as_slice()
    }
}

//***************************************************************************//

/// Dotted application name, e.g. `app.aspect.subaspect`. Only the first
/// [`NAME_HASH_LENGTH`] bytes of its digest travel in announces.
#[derive(Copy, Clone)]
pub struct DestinationName {
    pub hash: Hash,
}

impl DestinationName {
    pub fn new(app_name: &str, aspects: &str) -> Self {
        let hash = Hash::new(
            Hash::hasher()
                .chain_update(app_name.as_bytes())
                .chain_update(".".as_bytes())
                .chain_update(aspects.as_bytes())
                .finalize()
                .into(),
        );
        Self { hash }
    }

    pub fn from_name_hash_slice(slice: &[u8]) -> Self {
        let mut digest = [0u8; 32];
        let take = core::cmp::min(slice.len(), 32);
        digest[..take].copy_from_slice(&slice[..take]);
        Self { hash: Hash::new(digest) }
    }

    pub fn name_hash_slice(&self) -> &[u8] {
        &self.hash.as_slice()[..NAME_HASH_LENGTH]
    }
}

/// Public description of a destination: enough to address and encrypt to it.
#[derive(Copy, Clone)]
pub struct DestinationDesc {
    pub identity: Identity,
    pub address_hash: ShortHash,
    pub name: DestinationName,
}

impl fmt::Display for DestinationDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address_hash)
    }
}

pub fn destination_hash<I: HashMaterial>(identity: &I, name: &DestinationName) -> ShortHash {
    ShortHash::truncating(&Hash::new(
        Hash::hasher()
            .chain_update(name.name_hash_slice())
            .chain_update(identity.hash_material())
            .finalize()
            .into(),
    ))
}

//***************************************************************************//

/// Announcer-side ratchet chain: rotated X25519 secrets whose public halves
/// ride in announces. Persisted signed so a tampered file is rejected at
/// load.
#[derive(Clone)]
struct RatchetChain {
    enabled: bool,
    secrets: Vec<[u8; RATCHET_LENGTH]>,
    path: Option<PathBuf>,
    interval_secs: u64,
    retained: usize,
    last_rotation: Option<f64>,
    enforced: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRatchets {
    signature: ByteBuf,
    ratchets: ByteBuf,
}

impl Default for RatchetChain {
    fn default() -> Self {
        Self {
            enabled: false,
            secrets: Vec::new(),
            path: None,
            interval_secs: DEFAULT_RATCHET_INTERVAL_SECS,
            retained: DEFAULT_RETAINED_RATCHETS,
            last_rotation: None,
            enforced: false,
        }
    }
}

impl RatchetChain {
    fn enable(&mut self, identity: &PrivateIdentity, path: PathBuf) -> Result<(), LatticaError> {
        self.last_rotation = Some(0.0);
        self.reload(identity, &path)?;
        self.enabled = true;
        self.path = Some(path);
        Ok(())
    }

    fn reload(&mut self, identity: &PrivateIdentity, path: &Path) -> Result<(), LatticaError> {
        if !path.exists() {
            self.secrets = Vec::new();
            return self.persist(identity, path);
        }

        let data = std::fs::read(path).map_err(|_| LatticaError::ConnectionError)?;
        let persisted: PersistedRatchets =
            rmp_serde::from_slice(&data).map_err(|_| LatticaError::PacketError)?;
        let signature = Signature::from_slice(persisted.signature.as_ref())
            .map_err(|_| LatticaError::CryptoError)?;
        identity.verify(persisted.ratchets.as_ref(), &signature)?;

        let decoded: Vec<ByteBuf> = rmp_serde::from_slice(persisted.ratchets.as_ref())
            .map_err(|_| LatticaError::PacketError)?;
        self.secrets = decoded
            .iter()
            .filter(|entry| entry.len() == RATCHET_LENGTH)
            .map(|entry| {
                let mut bytes = [0u8; RATCHET_LENGTH];
                bytes.copy_from_slice(entry.as_ref());
                bytes
            })
            .collect();
        Ok(())
    }

    fn persist(&self, identity: &PrivateIdentity, path: &Path) -> Result<(), LatticaError> {
        let packed = pack_ratchets(&self.secrets)?;
        let signature = identity.sign(&packed).to_bytes();
        let persisted = PersistedRatchets {
            signature: ByteBuf::from(signature.to_vec()),
            ratchets: ByteBuf::from(packed),
        };
        let encoded = rmp_serde::to_vec(&persisted).map_err(|_| LatticaError::PacketError)?;
        write_atomic(path, &encoded)
    }

    fn rotate_if_due(&mut self, identity: &PrivateIdentity, now: f64) -> Result<(), LatticaError> {
        if !self.enabled {
            return Ok(());
        }
        let last = self.last_rotation.unwrap_or(0.0);
        if self.secrets.is_empty() || now > last + self.interval_secs as f64 {
            let secret = StaticSecret::random_from_rng(OsRng);
            self.secrets.insert(0, secret.to_bytes());
            self.last_rotation = Some(now);
            self.secrets.truncate(self.retained);
            if let Some(path) = self.path.clone() {
                self.persist(identity, &path)?;
            }
        }
        Ok(())
    }

    fn current_public(&self) -> Option<[u8; RATCHET_LENGTH]> {
        let secret = StaticSecret::from(*self.secrets.first()?);
        let mut bytes = [0u8; RATCHET_LENGTH];
        bytes.copy_from_slice(PublicKey::from(&secret).as_bytes());
        Some(bytes)
    }
}

fn pack_ratchets(secrets: &[[u8; RATCHET_LENGTH]]) -> Result<Vec<u8>, LatticaError> {
    let list: Vec<ByteBuf> = secrets.iter().map(|bytes| ByteBuf::from(bytes.to_vec())).collect();
    rmp_serde::to_vec(&list).map_err(|_| LatticaError::PacketError)
}

//***************************************************************************//

pub type DestinationAnnounce = Packet;

pub struct AnnounceInfo<'a> {
    pub destination: SingleOutputDestination,
    pub app_data: &'a [u8],
    pub ratchet: Option<[u8; RATCHET_LENGTH]>,
}

impl DestinationAnnounce {
    /// Parses and verifies an announce. The destination hash must re-derive
    /// from the embedded keys and name hash, and the Ed25519 signature must
    /// cover everything including the destination hash and app data;
    /// announces failing either check are rejected.
    ///
    /// Ratchet presence is not signalled in the header. Parsing first
    /// assumes no ratchet and falls back to the ratcheted layout when the
    /// signature only verifies that way.
    pub fn validate(packet: &Packet) -> Result<AnnounceInfo<'_>, LatticaError> {
        if packet.header.packet_type != PacketType::Announce {
            return Err(LatticaError::PacketError);
        }

        let announce_data = packet.data.as_slice();
        if announce_data.len() < MIN_ANNOUNCE_DATA_LENGTH {
            return Err(LatticaError::PacketError);
        }

        let mut offset = 0usize;

        let public_key = {
            let mut bytes = [0u8; PUBLIC_KEY_LENGTH];
            bytes.copy_from_slice(&announce_data[offset..offset + PUBLIC_KEY_LENGTH]);
            offset += PUBLIC_KEY_LENGTH;
            bytes
        };

        let verifying_key = {
            let mut bytes = [0u8; PUBLIC_KEY_LENGTH];
            bytes.copy_from_slice(&announce_data[offset..offset + PUBLIC_KEY_LENGTH]);
            offset += PUBLIC_KEY_LENGTH;
            bytes
        };

        let identity = Identity::from_slices(&public_key, &verifying_key)?;

        let name_hash = &announce_data[offset..offset + NAME_HASH_LENGTH];
        offset += NAME_HASH_LENGTH;
        let random_blob = &announce_data[offset..offset + RANDOM_BLOB_LENGTH];
        offset += RANDOM_BLOB_LENGTH;

        let destination = &packet.destination;
        let expected =
            destination_hash(&identity, &DestinationName::from_name_hash_slice(name_hash));
        if expected != *destination {
            log::debug!(
                "announce rejected: destination {} does not match keys (expected {})",
                destination,
                expected
            );
            return Err(LatticaError::IncorrectHash);
        }

        let verify_signed =
            |ratchet: Option<&[u8]>, signature: &[u8], app_data: &[u8]| -> Result<(), LatticaError> {
                // The verification API takes the full message, so the signed
                // fields are reassembled on the stack.
                let mut signed = PacketPayload::new();
                signed
                    .append(destination.as_slice())?
                    .append(&public_key)?
                    .append(&verifying_key)?
                    .append(name_hash)?
                    .append(random_blob)?;
                if let Some(ratchet) = ratchet {
                    signed.append(ratchet)?;
                }
                if !app_data.is_empty() {
                    signed.append(app_data)?;
                }
                let signature =
                    Signature::from_slice(signature).map_err(|_| LatticaError::CryptoError)?;
                identity.verify(signed.as_slice(), &signature)
            };

        let remaining = announce_data.len().saturating_sub(offset);
        if remaining < SIGNATURE_LENGTH {
            return Err(LatticaError::PacketError);
        }

        let without_ratchet = || -> Result<AnnounceInfo<'_>, LatticaError> {
            let signature = &announce_data[offset..offset + SIGNATURE_LENGTH];
            let app_data = &announce_data[offset + SIGNATURE_LENGTH..];
            verify_signed(None, signature, app_data)?;
            Ok(AnnounceInfo {
                destination: SingleOutputDestination::new(
                    identity,
                    DestinationName::from_name_hash_slice(name_hash),
                ),
                app_data,
                ratchet: None,
            })
        };

        let with_ratchet = || -> Result<AnnounceInfo<'_>, LatticaError> {
            if remaining < SIGNATURE_LENGTH + RATCHET_LENGTH {
                return Err(LatticaError::PacketError);
            }
            let ratchet = &announce_data[offset..offset + RATCHET_LENGTH];
            let sig_start = offset + RATCHET_LENGTH;
            let signature = &announce_data[sig_start..sig_start + SIGNATURE_LENGTH];
            let app_data = &announce_data[sig_start + SIGNATURE_LENGTH..];
            verify_signed(Some(ratchet), signature, app_data)?;

            let mut ratchet_bytes = [0u8; RATCHET_LENGTH];
            ratchet_bytes.copy_from_slice(ratchet);
            Ok(AnnounceInfo {
                destination: SingleOutputDestination::new(
                    identity,
                    DestinationName::from_name_hash_slice(name_hash),
                ),
                app_data,
                ratchet: Some(ratchet_bytes),
            })
        };

        match without_ratchet() {
            Ok(info) => Ok(info),
            Err(plain_err) => {
                if remaining >= SIGNATURE_LENGTH + RATCHET_LENGTH {
                    with_ratchet().or(Err(plain_err))
                } else {
                    Err(plain_err)
                }
            }
        }
    }
}

//***************************************************************************//

pub struct Destination<I: HashMaterial, D: Direction, K: Kind> {
    pub direction: PhantomData<D>,
    pub kind: PhantomData<K>,
    pub identity: I,
    pub desc: DestinationDesc,
    ratchet_chain: RatchetChain,
}

impl<I: HashMaterial, D: Direction, K: Kind> Destination<I, D, K> {
    pub fn destination_type(&self) -> DestinationType {
        <K as Kind>::destination_type()
    }
}

pub enum DestinationHandleStatus {
    None,
    LinkProof,
}

impl Destination<PrivateIdentity, Input, Single> {
    pub fn new(identity: PrivateIdentity, name: DestinationName) -> Self {
        let address_hash = destination_hash(&identity, &name);
        let public = *identity.as_identity();

        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity: public, name, address_hash },
            ratchet_chain: RatchetChain::default(),
        }
    }

    pub fn enable_ratchets<P: AsRef<Path>>(&mut self, path: P) -> Result<(), LatticaError> {
        self.ratchet_chain.enable(&self.identity, path.as_ref().to_path_buf())
    }

    pub fn set_retained_ratchets(&mut self, retained: usize) -> Result<(), LatticaError> {
        if retained == 0 {
            return Err(LatticaError::InvalidArgument);
        }
        self.ratchet_chain.retained = retained;
        self.ratchet_chain.secrets.truncate(retained);
        Ok(())
    }

    pub fn set_ratchet_interval_secs(&mut self, secs: u64) -> Result<(), LatticaError> {
        if secs == 0 {
            return Err(LatticaError::InvalidArgument);
        }
        self.ratchet_chain.interval_secs = secs;
        Ok(())
    }

    pub fn enforce_ratchets(&mut self, enforce: bool) {
        self.ratchet_chain.enforced = enforce;
    }

    /// Opens an inbound single-destination envelope, preferring the rotated
    /// ratchet secrets and falling back to the long-term identity key unless
    /// ratchets are enforced. Returns the plaintext and whether a ratchet
    /// key opened it.
    pub fn open_envelope(&mut self, ciphertext: &[u8]) -> Result<(Vec<u8>, bool), LatticaError> {
        let salt = self.identity.as_identity().address_hash;
        if self.ratchet_chain.enabled && !self.ratchet_chain.secrets.is_empty() {
            if let Some(plain) = open_with_chain(&self.ratchet_chain, salt.as_slice(), ciphertext) {
                return Ok((plain, true));
            }
            // The chain on disk may be newer than this process' view.
            if let Some(path) = self.ratchet_chain.path.clone() {
                if self.ratchet_chain.reload(&self.identity, &path).is_ok() {
                    if let Some(plain) =
                        open_with_chain(&self.ratchet_chain, salt.as_slice(), ciphertext)
                    {
                        return Ok((plain, true));
                    }
                }
            }
            if self.ratchet_chain.enforced {
                return Err(LatticaError::CryptoError);
            }
        }

        let plain = open_with_identity(&self.identity, salt.as_slice(), ciphertext)?;
        Ok((plain, false))
    }

    /// Builds a signed announce binding this destination's hash to its
    /// public keys, an optional current ratchet key and caller app data.
    pub fn announce<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, LatticaError> {
        let mut payload = PacketPayload::new();

        // Announce freshness rides in a 10-byte blob: five random bytes
        // followed by the low five bytes of the unix time, big-endian.
        let mut random_blob = [0u8; RANDOM_BLOB_LENGTH];
        let mut rng_mut = rng;
        rng_mut.fill_bytes(&mut random_blob[..RANDOM_BLOB_LENGTH / 2]);
        let stamp = (now_secs().floor() as u64).to_be_bytes();
        random_blob[RANDOM_BLOB_LENGTH / 2..].copy_from_slice(&stamp[3..8]);

        let public_key = self.identity.as_identity().public_key_bytes();
        let verifying_key = self.identity.as_identity().verifying_key_bytes();

        let ratchet = if self.ratchet_chain.enabled {
            self.ratchet_chain.rotate_if_due(&self.identity, now_secs())?;
            self.ratchet_chain.current_public()
        } else {
            None
        };

        payload
            .append_truncated(self.desc.address_hash.as_slice())
            .append_truncated(public_key)
            .append_truncated(verifying_key)
            .append_truncated(self.desc.name.name_hash_slice())
            .append_truncated(&random_blob);
        if let Some(ratchet) = ratchet {
            payload.append_truncated(&ratchet);
        }
        if let Some(data) = app_data {
            payload.append_truncated(data);
        }

        let signature = self.identity.sign(payload.as_slice());

        payload.clear();
        payload
            .append_truncated(public_key)
            .append_truncated(verifying_key)
            .append_truncated(self.desc.name.name_hash_slice())
            .append_truncated(&random_blob);
        if let Some(ratchet) = ratchet {
            payload.append_truncated(&ratchet);
        }
        payload.append_truncated(&signature.to_bytes());
        if let Some(data) = app_data {
            payload.push(data)?;
        }

        Ok(Packet {
            header: Header {
                ifac_flag: IfacFlag::Open,
                header_type: HeaderType::Type1,
                propagation_type: PropagationType::Broadcast,
                destination_type: DestinationType::Single,
                packet_type: PacketType::Announce,
                hops: 0,
            },
            ifac: None,
            destination: self.desc.address_hash,
            transport: None,
            context: PacketContext::None,
            data: payload,
        })
    }

    /// An announce emitted in reply to a path request. Identical apart from
    /// the context, which lets transports route it directly.
    pub fn path_response<R: CryptoRngCore + Copy>(
        &mut self,
        rng: R,
        app_data: Option<&[u8]>,
    ) -> Result<Packet, LatticaError> {
        let mut announce = self.announce(rng, app_data)?;
        announce.context = PacketContext::PathResponse;
        Ok(announce)
    }

    pub fn handle_packet(&mut self, packet: &Packet) -> DestinationHandleStatus {
        if self.desc.address_hash != packet.destination {
            return DestinationHandleStatus::None;
        }

        if packet.header.packet_type == PacketType::LinkRequest {
            return DestinationHandleStatus::LinkProof;
        }

        DestinationHandleStatus::None
    }

    pub fn signing_key(&self) -> &SigningKey {
        self.identity.signing_key()
    }
}

impl Destination<Identity, Output, Single> {
    pub fn new(identity: Identity, name: DestinationName) -> Self {
        let address_hash = destination_hash(&identity, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity, name, address_hash },
            ratchet_chain: RatchetChain::default(),
        }
    }
}

impl<D: Direction> Destination<NoIdentity, D, Plain> {
    pub fn new(identity: NoIdentity, name: DestinationName) -> Self {
        let address_hash = destination_hash(&identity, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity,
            desc: DestinationDesc { identity: Identity::default(), name, address_hash },
            ratchet_chain: RatchetChain::default(),
        }
    }
}

impl<D: Direction> Destination<GroupKey, D, Group> {
    pub fn new(key: GroupKey, name: DestinationName) -> Self {
        let address_hash = destination_hash(&key, &name);
        Self {
            direction: PhantomData,
            kind: PhantomData,
            identity: key,
            desc: DestinationDesc { identity: Identity::default(), name, address_hash },
            ratchet_chain: RatchetChain::default(),
        }
    }

    pub fn seal(&self, data: &[u8]) -> Result<Vec<u8>, LatticaError> {
        self.identity.seal(data)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, LatticaError> {
        self.identity.open(data)
    }
}

fn open_with_chain(chain: &RatchetChain, salt: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    for secret in &chain.secrets {
        let secret = StaticSecret::from(*secret);
        if let Ok(plain) = open_with_secret(&secret, salt, ciphertext) {
            return Some(plain);
        }
    }
    None
}

pub type SingleInputDestination = Destination<PrivateIdentity, Input, Single>;
pub type SingleOutputDestination = Destination<Identity, Output, Single>;
pub type PlainInputDestination = Destination<NoIdentity, Input, Plain>;
pub type PlainOutputDestination = Destination<NoIdentity, Output, Plain>;
pub type GroupInputDestination = Destination<GroupKey, Input, Group>;

pub fn single_in(identity: PrivateIdentity, app_name: &str, aspects: &str) -> SingleInputDestination {
    SingleInputDestination::new(identity, DestinationName::new(app_name, aspects))
}

pub fn single_out(identity: Identity, app_name: &str, aspects: &str) -> SingleOutputDestination {
    SingleOutputDestination::new(identity, DestinationName::new(app_name, aspects))
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use tempfile::TempDir;

    use super::{
        DestinationAnnounce, DestinationName, GroupInputDestination, GroupKey,
        SingleInputDestination, RATCHET_LENGTH,
    };
    use crate::error::LatticaError;
    use crate::identity::PrivateIdentity;

    fn sample_destination() -> SingleInputDestination {
        SingleInputDestination::new(
            PrivateIdentity::generate(OsRng),
            DestinationName::new("sample", "orchard.plums"),
        )
    }

    #[test]
    fn announce_validates() {
        let mut destination = sample_destination();
        let announce = destination.announce(OsRng, None).expect("valid announce");
        DestinationAnnounce::validate(&announce).expect("announce verifies");
    }

    #[test]
    fn announce_signature_covers_app_data() {
        let mut destination = sample_destination();
        let announce =
            destination.announce(OsRng, Some(b"app payload")).expect("valid announce");

        let mut tampered = announce;
        let payload = tampered.data.as_mut_slice();
        let app_data_offset = 32 + 32 + 10 + 10 + 64;
        assert!(payload.len() > app_data_offset);
        payload[app_data_offset] ^= 0x01;

        match DestinationAnnounce::validate(&tampered) {
            Ok(_) => panic!("tampered app data must fail verification"),
            Err(err) => assert_eq!(err, LatticaError::IncorrectSignature),
        }
    }

    #[test]
    fn announce_with_wrong_destination_hash_is_rejected() {
        let mut destination = sample_destination();
        let mut announce = destination.announce(OsRng, None).expect("valid announce");
        announce.destination.as_mut_slice()[0] ^= 0xFF;

        assert!(DestinationAnnounce::validate(&announce).is_err());
    }

    #[test]
    fn announce_carries_ratchet_when_enabled() {
        let temp = TempDir::new().expect("temp dir");
        let mut destination = sample_destination();
        destination
            .enable_ratchets(temp.path().join("chain.ratchets"))
            .expect("ratchets enabled");

        let announce = destination.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("announce verifies");
        assert!(info.ratchet.is_some());
    }

    #[test]
    fn ratchet_sized_app_data_is_not_mistaken_for_a_ratchet() {
        let mut destination = sample_destination();
        let app_data = vec![0u8; RATCHET_LENGTH];
        let announce =
            destination.announce(OsRng, Some(&app_data)).expect("valid announce");

        let info = DestinationAnnounce::validate(&announce).expect("announce verifies");
        assert!(info.ratchet.is_none());
        assert_eq!(info.app_data, app_data.as_slice());
    }

    #[test]
    fn ratcheted_envelope_opens_after_announce() {
        let temp = TempDir::new().expect("temp dir");
        let mut destination = sample_destination();
        destination
            .enable_ratchets(temp.path().join("chain.ratchets"))
            .expect("ratchets enabled");

        let announce = destination.announce(OsRng, None).expect("valid announce");
        let info = DestinationAnnounce::validate(&announce).expect("announce verifies");
        let ratchet = info.ratchet.expect("ratchet present");

        let sealed = crate::ratchets::seal_for_public_key(
            &x25519_dalek::PublicKey::from(ratchet),
            destination.desc.address_hash.as_slice(),
            b"forward secret",
            OsRng,
        )
        .expect("sealed");

        let (plain, used_ratchet) = destination.open_envelope(&sealed).expect("opens");
        assert!(used_ratchet);
        assert_eq!(plain, b"forward secret");
    }

    #[test]
    fn group_destination_seals_symmetrically() {
        let key = GroupKey::generate(OsRng);
        let sender =
            GroupInputDestination::new(key.clone(), DestinationName::new("sample", "group"));
        let receiver = GroupInputDestination::new(key, DestinationName::new("sample", "group"));
        assert_eq!(sender.desc.address_hash, receiver.desc.address_hash);

        let sealed = sender.seal(b"to the group").expect("sealed");
        assert_eq!(receiver.open(&sealed).expect("opened"), b"to the group");
    }

    #[test]
    fn different_group_keys_give_different_destinations() {
        let name = DestinationName::new("sample", "group");
        let first = GroupInputDestination::new(GroupKey::generate(OsRng), name);
        let second = GroupInputDestination::new(GroupKey::generate(OsRng), name);
        assert_ne!(first.desc.address_hash, second.desc.address_hash);
    }
}
