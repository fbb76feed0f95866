use core::cmp;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockSizeUser, Key, Unsigned};
use cbc::cipher::{BlockEncryptMut, KeyIvInit};
use crypto_common::{IvSizeUser, KeySizeUser, OutputSizeUser};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::LatticaError;

#[cfg(feature = "token-aes128")]
type TokenAes = aes::Aes128;
#[cfg(not(feature = "token-aes128"))]
type TokenAes = aes::Aes256;

type CbcEnc = cbc::Encryptor<TokenAes>;
type CbcDec = cbc::Decryptor<TokenAes>;
type CipherKey = Key<TokenAes>;
type HmacSha256 = Hmac<Sha256>;

const TAG_SIZE: usize = <<HmacSha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
const KEY_SIZE: usize = <<TokenAes as KeySizeUser>::KeySize as Unsigned>::USIZE;
const IV_SIZE: usize = <<CbcEnc as IvSizeUser>::IvSize as Unsigned>::USIZE;
const BLOCK_SIZE: usize = <<TokenAes as BlockSizeUser>::BlockSize as Unsigned>::USIZE;

pub const TOKEN_OVERHEAD: usize = IV_SIZE + TAG_SIZE;
pub const TOKEN_MAX_PADDING: usize = BLOCK_SIZE;

pub struct PlainText<'a>(&'a [u8]);
pub struct Token<'a>(&'a [u8]);
pub struct VerifiedToken<'a>(&'a [u8]);

// The envelope is the Fernet construction with the version and timestamp
// fields removed: IV || AES-CBC/PKCS7 ciphertext || HMAC-SHA256 tag. The two
// stripped fields carry no information this protocol needs and would leak
// sender-side clock data onto the wire.
pub struct TokenCipher<R: CryptoRngCore> {
    rng: R,
    sign_key: [u8; KEY_SIZE],
    cipher_key: CipherKey,
}

impl<'a> PlainText<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a [u8]> for PlainText<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self(data)
    }
}

impl<'a> From<&'a str> for PlainText<'a> {
    fn from(text: &'a str) -> Self {
        Self(text.as_bytes())
    }
}

impl<'a> Token<'a> {
    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> From<&'a [u8]> for Token<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self(data)
    }
}

impl<R: CryptoRngCore + Copy> TokenCipher<R> {
    pub fn new(sign_key: [u8; KEY_SIZE], cipher_key: CipherKey, rng: R) -> Self {
        Self { rng, sign_key, cipher_key }
    }

    /// Builds a cipher from raw key halves, zero-padding or truncating each
    /// to the algorithm's key size.
    pub fn from_halves(sign_half: &[u8], cipher_half: &[u8], rng: R) -> Self {
        let mut sign_key = [0u8; KEY_SIZE];
        let sign_len = cmp::min(KEY_SIZE, sign_half.len());
        sign_key[..sign_len].copy_from_slice(&sign_half[..sign_len]);

        let mut cipher_key = [0u8; KEY_SIZE];
        let cipher_len = cmp::min(KEY_SIZE, cipher_half.len());
        cipher_key[..cipher_len].copy_from_slice(&cipher_half[..cipher_len]);

        Self { rng, sign_key, cipher_key: cipher_key.into() }
    }

    pub fn random(mut rng: R) -> Self {
        let mut sign_key = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut sign_key);
        let cipher_key = CbcEnc::generate_key(&mut rng);
        Self { rng, sign_key, cipher_key }
    }

    pub fn seal<'a>(
        &self,
        text: PlainText,
        out_buf: &'a mut [u8],
    ) -> Result<Token<'a>, LatticaError> {
        let blocks = text
            .0
            .len()
            .checked_div(BLOCK_SIZE)
            .and_then(|blocks| blocks.checked_add(1))
            .ok_or(LatticaError::InvalidArgument)?;
        let padded_len = blocks.checked_mul(BLOCK_SIZE).ok_or(LatticaError::InvalidArgument)?;
        let needed = TOKEN_OVERHEAD.checked_add(padded_len).ok_or(LatticaError::InvalidArgument)?;

        if out_buf.len() < needed {
            return Err(LatticaError::OutOfMemory);
        }

        let iv = CbcEnc::generate_iv(self.rng);
        out_buf[..IV_SIZE].copy_from_slice(iv.as_slice());
        let mut len = IV_SIZE;

        let cipher_len = CbcEnc::new(&self.cipher_key, &iv)
            .encrypt_padded_b2b_mut::<Pkcs7>(text.0, &mut out_buf[len..])
            .map_err(|_| LatticaError::CryptoError)?
            .len();
        len += cipher_len;

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| LatticaError::CryptoError)?;
        mac.update(&out_buf[..len]);
        let tag = mac.finalize().into_bytes();

        out_buf[len..len + TAG_SIZE].copy_from_slice(tag.as_slice());
        len += TAG_SIZE;

        Ok(Token(&out_buf[..len]))
    }

    pub fn verify<'a>(&self, token: Token<'a>) -> Result<VerifiedToken<'a>, LatticaError> {
        let data = token.0;
        if data.len() <= TOKEN_OVERHEAD {
            return Err(LatticaError::InvalidArgument);
        }

        let claimed = &data[data.len() - TAG_SIZE..];

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| LatticaError::CryptoError)?;
        mac.update(&data[..data.len() - TAG_SIZE]);
        let actual = mac.finalize().into_bytes();

        // Whole-slice comparison without early exit.
        let matches = claimed
            .iter()
            .zip(actual.as_slice())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
            && claimed.len() == actual.len();

        if matches {
            Ok(VerifiedToken(data))
        } else {
            Err(LatticaError::IncorrectSignature)
        }
    }

    pub fn open<'b>(
        &self,
        token: VerifiedToken<'_>,
        out_buf: &'b mut [u8],
    ) -> Result<PlainText<'b>, LatticaError> {
        let data = token.0;
        if data.len() <= TOKEN_OVERHEAD {
            return Err(LatticaError::InvalidArgument);
        }

        let iv: [u8; IV_SIZE] =
            data[..IV_SIZE].try_into().map_err(|_| LatticaError::InvalidArgument)?;
        let ciphertext = &data[IV_SIZE..data.len() - TAG_SIZE];

        let plain = CbcDec::new(&self.cipher_key, &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, out_buf)
            .map_err(|_| LatticaError::CryptoError)?;

        Ok(PlainText(plain))
    }
}

#[cfg(test)]
mod tests {
    use core::str;
    use rand_core::OsRng;

    use super::{TokenCipher, BLOCK_SIZE, TOKEN_OVERHEAD};

    #[test]
    fn seal_verify_open_roundtrip() {
        let cipher = TokenCipher::random(OsRng);
        let message = "attack at dawn, over the east ridge";

        let mut sealed = [0u8; 256];
        let token = cipher.seal(message.into(), &mut sealed).expect("sealed token");
        let verified = cipher.verify(token).expect("token verifies");

        let mut opened = [0u8; 256];
        let plain = cipher.open(verified, &mut opened).expect("token opens");
        assert_eq!(str::from_utf8(plain.as_slice()).expect("utf8"), message);
    }

    #[test]
    fn tampered_tag_is_rejected() {
        let cipher = TokenCipher::random(OsRng);

        let mut sealed = [0u8; 256];
        let len = cipher.seal(b"payload"[..].into(), &mut sealed).expect("sealed").len();
        let last = len - 1;
        sealed[last] ^= 0x01;

        assert!(cipher.verify((&sealed[..len]).into()).is_err());
    }

    #[test]
    fn undersized_output_buffer_is_an_error() {
        let cipher = TokenCipher::random(OsRng);
        let mut sealed = [0u8; TOKEN_OVERHEAD + BLOCK_SIZE - 1];
        assert!(cipher.seal(b"hello"[..].into(), &mut sealed).is_err());
    }
}
