//! Ratchet bookkeeping and the single-destination crypto envelope.
//!
//! Outbound packets to a `single` destination always use a fresh ephemeral
//! X25519 keypair. When the destination has announced a ratchet key, that key
//! takes the place of the long-term agreement key, giving forward secrecy at
//! the announce interval.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::crypt::token::{PlainText, Token, TokenCipher, TOKEN_MAX_PADDING, TOKEN_OVERHEAD};
use crate::error::LatticaError;
use crate::hash::ShortHash;
use crate::identity::{DerivedKey, PrivateIdentity, PUBLIC_KEY_LENGTH};
use crate::storage::{ensure_dir, write_atomic};

const RATCHET_EXPIRY_SECS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RatchetRecord {
    ratchet: ByteBuf,
    received: f64,
}

/// Remembered ratchet public keys, one msgpack file per destination.
#[derive(Debug)]
pub struct RatchetLedger {
    dir: PathBuf,
    cache: HashMap<ShortHash, RatchetRecord>,
}

impl RatchetLedger {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, cache: HashMap::new() }
    }

    pub fn remember(
        &mut self,
        destination: &ShortHash,
        ratchet: [u8; PUBLIC_KEY_LENGTH],
    ) -> Result<(), LatticaError> {
        if let Some(existing) = self.cache.get(destination) {
            if existing.ratchet.as_ref() == ratchet.as_slice() {
                return Ok(());
            }
        }

        let record = RatchetRecord { ratchet: ByteBuf::from(ratchet.to_vec()), received: now_secs() };
        self.persist(destination, &record)?;
        self.cache.insert(*destination, record);
        Ok(())
    }

    pub fn current(&mut self, destination: &ShortHash) -> Option<[u8; PUBLIC_KEY_LENGTH]> {
        let now = now_secs();

        if let Some(record) = self.cache.get(destination) {
            if now <= record.received + RATCHET_EXPIRY_SECS {
                return record.ratchet.as_ref().try_into().ok();
            }
            self.cache.remove(destination);
            let _ = fs::remove_file(self.path_for(destination));
        }

        let record = self.load(destination)?;
        if now > record.received + RATCHET_EXPIRY_SECS {
            let _ = fs::remove_file(self.path_for(destination));
            return None;
        }
        let ratchet = record.ratchet.as_ref().try_into().ok();
        self.cache.insert(*destination, record);
        ratchet
    }

    pub fn sweep_expired(&mut self, now: f64) {
        self.cache.retain(|_, record| now <= record.received + RATCHET_EXPIRY_SECS);

        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(data) = fs::read(&path) else {
                continue;
            };
            if let Ok(record) = rmp_serde::from_slice::<RatchetRecord>(&data) {
                if now > record.received + RATCHET_EXPIRY_SECS {
                    let _ = fs::remove_file(path);
                }
            }
        }
    }

    fn persist(&self, destination: &ShortHash, record: &RatchetRecord) -> Result<(), LatticaError> {
        ensure_dir(&self.dir)?;
        let encoded = rmp_serde::to_vec_named(record).map_err(|_| LatticaError::PacketError)?;
        write_atomic(&self.path_for(destination), &encoded)
    }

    fn load(&self, destination: &ShortHash) -> Option<RatchetRecord> {
        let data = fs::read(self.path_for(destination)).ok()?;
        rmp_serde::from_slice(&data).ok()
    }

    fn path_for(&self, destination: &ShortHash) -> PathBuf {
        self.dir.join(destination.to_hex())
    }
}

/// Seals `plaintext` for `public_key` under a fresh ephemeral keypair. Wire
/// layout: ephemeral public key followed by the token envelope.
pub fn seal_for_public_key<R: CryptoRngCore + Copy>(
    public_key: &PublicKey,
    salt: &[u8],
    plaintext: &[u8],
    rng: R,
) -> Result<Vec<u8>, LatticaError> {
    let ephemeral = EphemeralSecret::random_from_rng(rng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let derived = DerivedKey::new(&ephemeral.diffie_hellman(public_key), Some(salt));
    let (sign_half, cipher_half) = derived.halves();

    let cipher = TokenCipher::from_halves(sign_half, cipher_half, rng);
    let mut out =
        vec![0u8; PUBLIC_KEY_LENGTH + plaintext.len() + TOKEN_OVERHEAD + TOKEN_MAX_PADDING];
    out[..PUBLIC_KEY_LENGTH].copy_from_slice(ephemeral_public.as_bytes());
    let token_len = cipher
        .seal(PlainText::from(plaintext), &mut out[PUBLIC_KEY_LENGTH..])
        .map_err(|_| LatticaError::CryptoError)?
        .len();
    out.truncate(PUBLIC_KEY_LENGTH + token_len);
    Ok(out)
}

pub fn open_with_secret(
    secret: &StaticSecret,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, LatticaError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(LatticaError::InvalidArgument);
    }

    let mut ephemeral = [0u8; PUBLIC_KEY_LENGTH];
    ephemeral.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let derived =
        DerivedKey::new(&secret.diffie_hellman(&PublicKey::from(ephemeral)), Some(salt));
    open_token(&derived, &ciphertext[PUBLIC_KEY_LENGTH..])
}

pub fn open_with_identity(
    identity: &PrivateIdentity,
    salt: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, LatticaError> {
    if ciphertext.len() <= PUBLIC_KEY_LENGTH {
        return Err(LatticaError::InvalidArgument);
    }

    let mut ephemeral = [0u8; PUBLIC_KEY_LENGTH];
    ephemeral.copy_from_slice(&ciphertext[..PUBLIC_KEY_LENGTH]);
    let derived = identity.derive_key(&PublicKey::from(ephemeral), Some(salt));
    open_token(&derived, &ciphertext[PUBLIC_KEY_LENGTH..])
}

fn open_token(derived: &DerivedKey, token_bytes: &[u8]) -> Result<Vec<u8>, LatticaError> {
    let (sign_half, cipher_half) = derived.halves();
    let cipher = TokenCipher::from_halves(sign_half, cipher_half, rand_core::OsRng);
    let verified = cipher.verify(Token::from(token_bytes))?;
    let mut out = vec![0u8; token_bytes.len()];
    let plain = cipher.open(verified, &mut out)?;
    Ok(plain.as_slice().to_vec())
}

pub fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use tempfile::TempDir;
    use x25519_dalek::{PublicKey, StaticSecret};

    use super::{open_with_identity, open_with_secret, seal_for_public_key, RatchetLedger};
    use crate::hash::ShortHash;
    use crate::identity::PrivateIdentity;

    #[test]
    fn envelope_roundtrip_with_identity_key() {
        let receiver = PrivateIdentity::generate(OsRng);
        let salt = receiver.address_hash().as_slice().to_vec();

        let sealed =
            seal_for_public_key(&receiver.as_identity().public_key, &salt, b"payload", OsRng)
                .expect("sealed");
        let opened = open_with_identity(&receiver, &salt, &sealed).expect("opened");

        assert_eq!(opened, b"payload");
    }

    #[test]
    fn envelope_roundtrip_with_ratchet_key() {
        let ratchet = StaticSecret::random_from_rng(OsRng);
        let ratchet_public = PublicKey::from(&ratchet);

        let sealed =
            seal_for_public_key(&ratchet_public, b"salt", b"ratcheted", OsRng).expect("sealed");
        let opened = open_with_secret(&ratchet, b"salt", &sealed).expect("opened");

        assert_eq!(opened, b"ratcheted");
    }

    #[test]
    fn fresh_ephemeral_key_per_packet() {
        let receiver = PrivateIdentity::generate(OsRng);
        let salt = receiver.address_hash().as_slice().to_vec();

        let first =
            seal_for_public_key(&receiver.as_identity().public_key, &salt, b"same", OsRng)
                .expect("sealed");
        let second =
            seal_for_public_key(&receiver.as_identity().public_key, &salt, b"same", OsRng)
                .expect("sealed");

        assert_ne!(&first[..32], &second[..32], "ephemeral public keys must differ");
    }

    #[test]
    fn ledger_expires_stale_ratchets() {
        let temp = TempDir::new().expect("temp dir");
        let mut ledger = RatchetLedger::new(temp.path().to_path_buf());
        let destination = ShortHash::random(OsRng);

        let stale = super::RatchetRecord {
            ratchet: serde_bytes::ByteBuf::from(vec![7u8; 32]),
            received: 0.0,
        };
        let encoded = rmp_serde::to_vec_named(&stale).expect("encode");
        std::fs::write(temp.path().join(destination.to_hex()), encoded).expect("write");

        assert!(ledger.current(&destination).is_none());
    }

    #[test]
    fn ledger_returns_last_remembered_key() {
        let temp = TempDir::new().expect("temp dir");
        let mut ledger = RatchetLedger::new(temp.path().to_path_buf());
        let destination = ShortHash::random(OsRng);

        ledger.remember(&destination, [1u8; 32]).expect("remember");
        ledger.remember(&destination, [2u8; 32]).expect("remember");

        assert_eq!(ledger.current(&destination), Some([2u8; 32]));
    }
}
