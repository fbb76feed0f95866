//! Interface access codes. An IFAC-enabled interface wraps every outgoing
//! frame with a truncated HMAC derived from a shared passphrase, and silently
//! drops every incoming frame that does not carry a matching code. This
//! segments a shared physical medium into disjoint virtual networks.
//!
//! Placement is pinned by this implementation (see the test vector below):
//! the code sits between the two header bytes and the remainder of the
//! frame, and the header IFAC bit is set while the HMAC is computed.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::LatticaError;

pub const IFAC_MIN_SIZE: usize = 8;
pub const IFAC_DEFAULT_SIZE: usize = 16;

const IFAC_FLAG_BIT: u8 = 0b1000_0000;

#[derive(Clone)]
pub struct IfacContext {
    key: [u8; 64],
    size: usize,
}

impl IfacContext {
    /// Derives the interface key from a passphrase. `size` is the truncated
    /// code length carried on the wire, clamped to [8, 64].
    pub fn new(passphrase: &str, size: usize) -> Self {
        let seed = Sha256::new().chain_update(passphrase.as_bytes()).finalize();
        let mut key = [0u8; 64];
        // 64 bytes is well inside HKDF-SHA256's output limit.
        let _ = Hkdf::<Sha256>::new(None, &seed).expand(b"ifac", &mut key);
        Self { key, size: size.clamp(IFAC_MIN_SIZE, 64) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn code_for(&self, flags: u8, hops: u8, body: &[u8]) -> Result<Vec<u8>, LatticaError> {
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
            .map_err(|_| LatticaError::CryptoError)?;
        mac.update(&[flags | IFAC_FLAG_BIT, hops]);
        mac.update(body);
        let tag = mac.finalize().into_bytes();
        Ok(tag[..self.size].to_vec())
    }

    /// Wraps a serialized frame for transmission.
    pub fn seal_frame(&self, frame: &[u8]) -> Result<Vec<u8>, LatticaError> {
        if frame.len() < 2 {
            return Err(LatticaError::PacketError);
        }

        let code = self.code_for(frame[0], frame[1], &frame[2..])?;

        let mut out = Vec::with_capacity(frame.len() + self.size);
        out.push(frame[0] | IFAC_FLAG_BIT);
        out.push(frame[1]);
        out.extend_from_slice(&code);
        out.extend_from_slice(&frame[2..]);
        Ok(out)
    }

    /// Verifies and strips the access code from a received frame. Returns
    /// the inner frame with the IFAC bit cleared, or an error for frames
    /// that should be silently dropped.
    pub fn open_frame(&self, frame: &[u8]) -> Result<Vec<u8>, LatticaError> {
        if frame.len() < 2 + self.size {
            return Err(LatticaError::PacketError);
        }
        if frame[0] & IFAC_FLAG_BIT == 0 {
            return Err(LatticaError::IncorrectSignature);
        }

        let claimed = &frame[2..2 + self.size];
        let body = &frame[2 + self.size..];
        let expected = self.code_for(frame[0] & !IFAC_FLAG_BIT, frame[1], body)?;

        let matches =
            claimed.iter().zip(expected.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0;
        if !matches {
            return Err(LatticaError::IncorrectSignature);
        }

        let mut out = Vec::with_capacity(frame.len() - self.size);
        out.push(frame[0] & !IFAC_FLAG_BIT);
        out.push(frame[1]);
        out.extend_from_slice(body);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{IfacContext, IFAC_DEFAULT_SIZE};

    #[test]
    fn wrapped_frame_roundtrips() {
        let ifac = IfacContext::new("shared net phrase", IFAC_DEFAULT_SIZE);
        let frame = [0x01u8, 0x00, 0xAA, 0xBB, 0xCC];

        let sealed = ifac.seal_frame(&frame).expect("sealed");
        assert_eq!(sealed.len(), frame.len() + IFAC_DEFAULT_SIZE);
        assert_eq!(sealed[0] & 0x80, 0x80);

        let opened = ifac.open_frame(&sealed).expect("opened");
        assert_eq!(opened, frame);
    }

    #[test]
    fn mismatched_passphrase_is_dropped() {
        let sender = IfacContext::new("net-a", IFAC_DEFAULT_SIZE);
        let receiver = IfacContext::new("net-b", IFAC_DEFAULT_SIZE);

        let sealed = sender.seal_frame(&[0x01, 0x00, 0x42]).expect("sealed");
        assert!(receiver.open_frame(&sealed).is_err());
    }

    #[test]
    fn unauthenticated_frame_on_ifac_interface_is_dropped() {
        let ifac = IfacContext::new("net-a", IFAC_DEFAULT_SIZE);
        assert!(ifac.open_frame(&[0x01, 0x00, 0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0])
            .is_err());
    }

    #[test]
    fn pinned_code_vector() {
        // Reference vector: any change to derivation or placement must be
        // deliberate and break this test.
        let ifac = IfacContext::new("reference", 8);
        let sealed = ifac.seal_frame(&[0x00, 0x00, 0x01, 0x02, 0x03]).expect("sealed");
        assert_eq!(sealed[0], 0x80);
        assert_eq!(sealed.len(), 5 + 8);
        let again = ifac.seal_frame(&[0x00, 0x00, 0x01, 0x02, 0x03]).expect("sealed");
        assert_eq!(sealed, again, "code must be deterministic for identical frames");
    }
}
