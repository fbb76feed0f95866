use core::cmp;
use core::fmt;
use std::fmt::Write;

use crypto_common::typenum::Unsigned;
use crypto_common::OutputSizeUser;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};

use crate::error::LatticaError;

pub const HASH_SIZE: usize = <<Sha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;

/// Addresses on the wire are the first half of a SHA-256 digest. Destination
/// hashes, packet-cache keys, link ids and interface handles all share this
/// representation.
pub const SHORT_HASH_SIZE: usize = 16;

/// Full SHA-256 digest.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Hash([u8; HASH_SIZE]);

/// 16-byte truncation of a [`Hash`], used wherever an address-sized
/// identifier travels on the wire.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct ShortHash([u8; SHORT_HASH_SIZE]);

pub fn digest_into(data: &[u8], out: &mut [u8]) {
    let digest = Sha256::new().chain_update(data).finalize();
    let take = cmp::min(out.len(), HASH_SIZE);
    out[..take].copy_from_slice(&digest.as_slice()[..take]);
}

impl Hash {
    pub fn hasher() -> Sha256 {
        Sha256::new()
    }

    pub const fn new(digest: [u8; HASH_SIZE]) -> Self {
        Self(digest)
    }

    pub const fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn of(data: &[u8]) -> Self {
        let mut digest = [0u8; HASH_SIZE];
        digest_into(data, &mut digest);
        Self(digest)
    }

    pub fn random<R: CryptoRngCore>(mut rng: R) -> Self {
        let mut seed = [0u8; HASH_SIZE];
        rng.fill_bytes(&mut seed);
        Self::of(&seed)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, LatticaError> {
        if bytes.len() < HASH_SIZE {
            return Err(LatticaError::IncorrectHash);
        }
        let mut digest = [0u8; HASH_SIZE];
        digest.copy_from_slice(&bytes[..HASH_SIZE]);
        Ok(Self(digest))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(&self) -> [u8; HASH_SIZE] {
        self.0
    }
}

impl ShortHash {
    pub const fn new(bytes: [u8; SHORT_HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; SHORT_HASH_SIZE])
    }

    pub fn of(data: &[u8]) -> Self {
        let mut bytes = [0u8; SHORT_HASH_SIZE];
        digest_into(data, &mut bytes);
        Self(bytes)
    }

    pub fn truncating(hash: &Hash) -> Self {
        let mut bytes = [0u8; SHORT_HASH_SIZE];
        bytes.copy_from_slice(&hash.0[..SHORT_HASH_SIZE]);
        Self(bytes)
    }

    pub fn random<R: CryptoRngCore>(rng: R) -> Self {
        Self::truncating(&Hash::random(rng))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, LatticaError> {
        if bytes.len() < SHORT_HASH_SIZE {
            return Err(LatticaError::IncorrectHash);
        }
        let mut out = [0u8; SHORT_HASH_SIZE];
        out.copy_from_slice(&bytes[..SHORT_HASH_SIZE]);
        Ok(Self(out))
    }

    pub fn from_hex(text: &str) -> Result<Self, LatticaError> {
        let bytes = hex::decode(text.trim()).map_err(|_| LatticaError::IncorrectHash)?;
        // Accept a full 32-byte digest as well and truncate it.
        match bytes.len() {
            SHORT_HASH_SIZE | HASH_SIZE => Self::from_slice(&bytes),
            _ => Err(LatticaError::IncorrectHash),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }

    pub fn to_hex(&self) -> String {
        let mut text = String::with_capacity(SHORT_HASH_SIZE * 2);
        for byte in self.0 {
            let _ = write!(&mut text, "{:02x}", byte);
        }
        text
    }
}

impl From<Hash> for ShortHash {
    fn from(hash: Hash) -> Self {
        Self::truncating(&hash)
    }
}

impl Default for ShortHash {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for ShortHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ">")
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;

    use super::{Hash, ShortHash};

    #[test]
    fn short_hash_hex_roundtrip() {
        let original = ShortHash::random(OsRng);
        let parsed = ShortHash::from_hex(&original.to_hex()).expect("valid hex");
        assert_eq!(parsed, original);
    }

    #[test]
    fn short_hash_accepts_full_digest_hex() {
        let full = Hash::of(b"material");
        let parsed = ShortHash::from_hex(&full.to_string()).expect("valid hex");
        assert_eq!(parsed, ShortHash::truncating(&full));
    }

    #[test]
    fn truncation_takes_leading_bytes() {
        let full = Hash::of(b"abc");
        let short = ShortHash::truncating(&full);
        assert_eq!(short.as_slice(), &full.as_slice()[..16]);
    }
}
