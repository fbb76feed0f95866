use std::path::Path;

use ed25519_dalek::{ed25519::signature::Signer, Signature, SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::crypt::token::{PlainText, Token, TokenCipher};
use crate::error::LatticaError;
use crate::hash::{Hash, ShortHash};
use crate::storage::write_atomic;

pub const PUBLIC_KEY_LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

/// Serialized private identity: X25519 secret followed by the Ed25519 seed.
pub const PRIVATE_KEY_LENGTH: usize = PUBLIC_KEY_LENGTH * 2;

#[cfg(feature = "token-aes128")]
pub const DERIVED_KEY_LENGTH: usize = 256 / 8;
#[cfg(not(feature = "token-aes128"))]
pub const DERIVED_KEY_LENGTH: usize = 512 / 8;

/// Bytes an identity contributes to the destination-hash derivation.
pub trait HashMaterial {
    fn hash_material(&self) -> &[u8];
}

/// Public half of an identity: an X25519 agreement key, an Ed25519 verifying
/// key, and the address hash derived from both.
#[derive(Copy, Clone)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: ShortHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let digest = Hash::new(
            Hash::hasher()
                .chain_update(public_key.as_bytes())
                .chain_update(verifying_key.as_bytes())
                .finalize()
                .into(),
        );

        Self { public_key, verifying_key, address_hash: ShortHash::truncating(&digest) }
    }

    pub fn from_slices(public_key: &[u8], verifying_key: &[u8]) -> Result<Self, LatticaError> {
        if public_key.len() != PUBLIC_KEY_LENGTH || verifying_key.len() != PUBLIC_KEY_LENGTH {
            return Err(LatticaError::InvalidArgument);
        }

        let mut agreement = [0u8; PUBLIC_KEY_LENGTH];
        agreement.copy_from_slice(public_key);

        let mut verifying = [0u8; PUBLIC_KEY_LENGTH];
        verifying.copy_from_slice(verifying_key);
        let verifying =
            VerifyingKey::from_bytes(&verifying).map_err(|_| LatticaError::CryptoError)?;

        Ok(Self::new(PublicKey::from(agreement), verifying))
    }

    pub fn public_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        format!(
            "{}{}",
            hex::encode(self.public_key.as_bytes()),
            hex::encode(self.verifying_key.as_bytes())
        )
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), LatticaError> {
        self.verifying_key
            .verify_strict(data, signature)
            .map_err(|_| LatticaError::IncorrectSignature)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(PublicKey::from([0u8; PUBLIC_KEY_LENGTH]), VerifyingKey::default())
    }
}

impl HashMaterial for Identity {
    fn hash_material(&self) -> &[u8] {
        self.address_hash.as_slice()
    }
}

/// Placeholder identity for plain (unencrypted) destinations.
pub struct NoIdentity;

impl HashMaterial for NoIdentity {
    fn hash_material(&self) -> &[u8] {
        &[]
    }
}

#[derive(Clone)]
pub struct PrivateIdentity {
    identity: Identity,
    agreement_key: StaticSecret,
    signing_key: SigningKey,
}

impl PrivateIdentity {
    pub fn new(agreement_key: StaticSecret, signing_key: SigningKey) -> Self {
        Self {
            identity: Identity::new((&agreement_key).into(), signing_key.verifying_key()),
            agreement_key,
            signing_key,
        }
    }

    pub fn generate<R: CryptoRngCore>(mut rng: R) -> Self {
        let signing_key = SigningKey::generate(&mut rng);
        let agreement_key = StaticSecret::random_from_rng(rng);
        Self::new(agreement_key, signing_key)
    }

    /// Deterministic identity from a name. Test and example plumbing only;
    /// real identities come from [`PrivateIdentity::generate`].
    pub fn from_name(name: &str) -> Self {
        let agreement_seed = Hash::of(name.as_bytes());
        let signing_seed = Hash::of(agreement_seed.as_slice());

        Self::new(
            StaticSecret::from(agreement_seed.to_bytes()),
            SigningKey::from_bytes(signing_seed.as_bytes()),
        )
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LatticaError> {
        if bytes.len() != PRIVATE_KEY_LENGTH {
            return Err(LatticaError::InvalidArgument);
        }

        let mut agreement = [0u8; PUBLIC_KEY_LENGTH];
        agreement.copy_from_slice(&bytes[..PUBLIC_KEY_LENGTH]);

        let mut signing = [0u8; PUBLIC_KEY_LENGTH];
        signing.copy_from_slice(&bytes[PUBLIC_KEY_LENGTH..]);

        Ok(Self::new(StaticSecret::from(agreement), SigningKey::from_bytes(&signing)))
    }

    pub fn from_hex(text: &str) -> Result<Self, LatticaError> {
        let bytes = hex::decode(text.trim()).map_err(|_| LatticaError::InvalidArgument)?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        let mut bytes = [0u8; PRIVATE_KEY_LENGTH];
        bytes[..PUBLIC_KEY_LENGTH].copy_from_slice(self.agreement_key.as_bytes());
        bytes[PUBLIC_KEY_LENGTH..].copy_from_slice(self.signing_key.as_bytes());
        bytes
    }

    pub fn to_hex(&self) -> String {
        format!(
            "{}{}",
            hex::encode(self.agreement_key.as_bytes()),
            hex::encode(self.signing_key.as_bytes())
        )
    }

    /// Loads an identity blob, or generates and persists a fresh one when the
    /// file does not exist yet.
    pub fn load_or_generate<R: CryptoRngCore>(
        path: &Path,
        rng: R,
    ) -> Result<Self, LatticaError> {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_bytes(&bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let identity = Self::generate(rng);
                identity.save(path)?;
                Ok(identity)
            }
            Err(_) => Err(LatticaError::ConnectionError),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), LatticaError> {
        write_atomic(path, &self.to_bytes())
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &ShortHash {
        &self.identity.address_hash
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), LatticaError> {
        self.identity.verify(data, signature)
    }

    pub fn exchange(&self, public_key: &PublicKey) -> SharedSecret {
        self.agreement_key.diffie_hellman(public_key)
    }

    pub fn derive_key(&self, public_key: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        DerivedKey::from_exchange(&self.agreement_key, public_key, salt)
    }

    /// Seals `text` with a previously derived session key. The caller owns
    /// the output buffer; the returned slice borrows from it.
    pub fn seal<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        text: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], LatticaError> {
        let (sign_half, cipher_half) = derived_key.halves();
        let token = TokenCipher::from_halves(sign_half, cipher_half, rng)
            .seal(PlainText::from(text), out_buf)?;
        let len = token.len();
        Ok(&out_buf[..len])
    }

    pub fn open<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        data: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], LatticaError> {
        let (sign_half, cipher_half) = derived_key.halves();
        let cipher = TokenCipher::from_halves(sign_half, cipher_half, rng);
        let verified = cipher.verify(Token::from(data))?;
        let plain = cipher.open(verified, out_buf)?;
        Ok(plain.as_slice())
    }
}

impl HashMaterial for PrivateIdentity {
    fn hash_material(&self) -> &[u8] {
        self.identity.address_hash.as_slice()
    }
}

/// HKDF-SHA256 expansion of an X25519 shared secret. The first half signs,
/// the second half encrypts.
pub struct DerivedKey {
    key: [u8; DERIVED_KEY_LENGTH],
}

impl DerivedKey {
    pub fn new(shared: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        // Expand cannot fail for output lengths this small.
        let _ = Hkdf::<Sha256>::new(salt, shared.as_bytes()).expand(&[], &mut key[..]);
        Self { key }
    }

    pub fn empty() -> Self {
        Self { key: [0u8; DERIVED_KEY_LENGTH] }
    }

    /// A further key in the same chain: HKDF over this key with a caller
    /// context (ratchet counters and the like).
    pub fn advanced(&self, info: &[u8]) -> Self {
        let mut key = [0u8; DERIVED_KEY_LENGTH];
        let _ = Hkdf::<Sha256>::new(None, &self.key).expand(info, &mut key[..]);
        Self { key }
    }

    pub fn from_exchange(
        secret: &StaticSecret,
        public_key: &PublicKey,
        salt: Option<&[u8]>,
    ) -> Self {
        Self::new(&secret.diffie_hellman(public_key), salt)
    }

    pub fn halves(&self) -> (&[u8], &[u8]) {
        self.key.split_at(DERIVED_KEY_LENGTH / 2)
    }

    pub fn as_bytes(&self) -> &[u8; DERIVED_KEY_LENGTH] {
        &self.key
    }
}

pub fn verify_with_key(public_key: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    verifying.verify_strict(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use rand_core::OsRng;
    use tempfile::TempDir;

    use super::{DerivedKey, PrivateIdentity};

    #[test]
    fn identity_hex_roundtrip() {
        let original = PrivateIdentity::generate(OsRng);
        let restored = PrivateIdentity::from_hex(&original.to_hex()).expect("valid identity");

        assert_eq!(restored.to_bytes(), original.to_bytes());
        assert_eq!(restored.address_hash(), original.address_hash());
    }

    #[test]
    fn identity_blob_roundtrip_on_disk() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("identities").join("default");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");

        let first = PrivateIdentity::load_or_generate(&path, OsRng).expect("generated");
        let second = PrivateIdentity::load_or_generate(&path, OsRng).expect("loaded");

        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn seal_and_open_with_shared_key() {
        let alice = PrivateIdentity::generate(OsRng);
        let bob = PrivateIdentity::generate(OsRng);

        let salt = b"session-salt";
        let key_a = alice.derive_key(&bob.as_identity().public_key, Some(salt));
        let key_b = bob.derive_key(&alice.as_identity().public_key, Some(salt));

        let mut sealed = [0u8; 256];
        let sealed = alice.seal(OsRng, b"meet at the relay", &key_a, &mut sealed).expect("sealed");

        let mut opened = [0u8; 256];
        let opened = bob.open(OsRng, sealed, &key_b, &mut opened).expect("opened");
        assert_eq!(opened, b"meet at the relay");
    }

    #[test]
    fn signature_verifies_and_rejects_tampering() {
        let identity = PrivateIdentity::generate(OsRng);
        let signature = identity.sign(b"announce body");

        assert!(identity.verify(b"announce body", &signature).is_ok());
        assert!(identity.verify(b"announce bodY", &signature).is_err());
    }

    #[test]
    fn derived_key_halves_cover_whole_key() {
        let alice = PrivateIdentity::generate(OsRng);
        let bob = PrivateIdentity::generate(OsRng);
        let key = DerivedKey::new(&alice.exchange(&bob.as_identity().public_key), None);

        let (sign, cipher) = key.halves();
        assert_eq!(sign.len(), cipher.len());
        assert_eq!(sign.len() + cipher.len(), key.as_bytes().len());
    }
}
