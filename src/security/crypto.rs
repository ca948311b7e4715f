use super::{Envelope, SecurityError, Transform};
use crate::constants::{ENCRYPTED_HEADER, ENCRYPTION_SCHEME};
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use std::fmt;
use std::fs;

// OAEP overhead for SHA-512: two digests plus two bytes
const OAEP_OVERHEAD: usize = 2 * 64 + 2;

/// RSA-OAEP/SHA-512 encryption of arbitrarily long bodies.
///
/// Bodies are split into chunks of `modulus - 130` bytes, each encrypted on
/// its own, and the ciphertexts concatenated. Every ciphertext chunk is
/// exactly one modulus long, which is how the receiver splits them again.
#[derive(Clone)]
pub enum Crypto {
    /// Sender side. Can only `apply`.
    Public(RsaPublicKey),
    /// Receiver side. Can `undo`, and `apply` with the derived public key.
    Private(RsaPrivateKey),
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Crypto::Public(ref k) => write!(f, "Crypto::Public({} bits)", k.size() * 8),
            Crypto::Private(ref k) => write!(f, "Crypto::Private({} bits)", k.size() * 8),
        }
    }
}

impl Crypto {
    /// Plaintext bytes per chunk for a key of this size.
    pub fn chunk_size(&self) -> Result<usize, SecurityError> {
        let block = self.block_size();
        match block.checked_sub(OAEP_OVERHEAD) {
            Some(chunk) if chunk > 0 => Ok(chunk),
            _ => Err(SecurityError::KeyTooSmall(block)),
        }
    }

    /// Modulus size in bytes; also the ciphertext chunk size.
    pub fn block_size(&self) -> usize {
        match *self {
            Crypto::Public(ref k) => k.size(),
            Crypto::Private(ref k) => k.size(),
        }
    }

    /// Encrypt `body` chunk by chunk.
    pub fn encrypt(&self, body: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let chunk = self.chunk_size()?;
        let public = match *self {
            Crypto::Public(ref k) => k.clone(),
            Crypto::Private(ref k) => k.to_public_key(),
        };
        let mut rng = OsRng;
        let mut out = Vec::with_capacity((body.len() / chunk + 1) * self.block_size());
        for piece in body.chunks(chunk) {
            out.extend(public.encrypt(&mut rng, Oaep::new::<Sha512>(), piece)?);
        }
        Ok(out)
    }

    /// Decrypt a body produced by `encrypt`.
    pub fn decrypt(&self, body: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let private = match *self {
            Crypto::Private(ref k) => k,
            Crypto::Public(_) => return Err(SecurityError::MissingKey("private")),
        };
        let block = private.size();
        if body.len() % block != 0 {
            return Err(SecurityError::Truncated {
                len: body.len(),
                block,
            });
        }
        let mut out = Vec::with_capacity(body.len());
        for piece in body.chunks(block) {
            out.extend(private.decrypt(Oaep::new::<Sha512>(), piece)?);
        }
        Ok(out)
    }
}

impl Transform for Crypto {
    fn name(&self) -> &'static str {
        "rsa-oaep"
    }

    fn apply(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        env.body = self.encrypt(&env.body)?;
        env.set_header(ENCRYPTED_HEADER, ENCRYPTION_SCHEME);
        Ok(())
    }

    /// A receiver holding a private key decrypts every body.
    fn undo(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        env.body = self.decrypt(&env.body)?;
        env.remove_header(ENCRYPTED_HEADER);
        Ok(())
    }
}

fn bad_key<E: fmt::Display>(path: &str, e: E) -> SecurityError {
    SecurityError::BadKey {
        path: path.to_string(),
        reason: e.to_string(),
    }
}

/// Read a PEM public key, PKCS#1 first then SPKI.
pub fn load_public_key(path: &str) -> Result<RsaPublicKey, SecurityError> {
    let pem = fs::read_to_string(path).map_err(|e| bad_key(path, e))?;
    RsaPublicKey::from_pkcs1_pem(&pem)
        .or_else(|e| RsaPublicKey::from_public_key_pem(&pem).map_err(|_| e))
        .map_err(|e| bad_key(path, e))
}

/// Read a PEM private key, PKCS#1 first then PKCS#8.
pub fn load_private_key(path: &str) -> Result<RsaPrivateKey, SecurityError> {
    let pem = fs::read_to_string(path).map_err(|e| bad_key(path, e))?;
    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|e| RsaPrivateKey::from_pkcs8_pem(&pem).map_err(|_| e))
        .map_err(|e| bad_key(path, e))
}

#[cfg(test)]
mod test {
    use super::*;

    const PRIVATE_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/resources/tests/keys/private.pem");
    const PUBLIC_PEM: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/resources/tests/keys/public.pem");

    lazy_static! {
        static ref PRIVATE: Crypto = Crypto::Private(load_private_key(PRIVATE_PEM).unwrap());
        static ref PUBLIC: Crypto = Crypto::Public(load_public_key(PUBLIC_PEM).unwrap());
    }

    #[test]
    fn test_chunk_size_for_2048_bits() {
        assert_eq!(PUBLIC.block_size(), 256);
        assert_eq!(PUBLIC.chunk_size().unwrap(), 126);
    }

    #[test]
    fn test_round_trip_around_chunk_boundaries() {
        let chunk = PUBLIC.chunk_size().unwrap();
        for len in &[0, 1, chunk - 1, chunk, chunk + 1, 2 * chunk, 2 * chunk + 1, 1000] {
            let body: Vec<u8> = (0..*len).map(|i| (i % 251) as u8).collect();
            let sealed = PUBLIC.encrypt(&body).unwrap();
            let blocks = (len + chunk - 1) / chunk;
            assert_eq!(sealed.len(), blocks * 256, "len {}", len);
            assert_eq!(PRIVATE.decrypt(&sealed).unwrap(), body, "len {}", len);
        }
    }

    #[test]
    fn test_truncated_ciphertext() {
        let sealed = PUBLIC.encrypt(b"hello").unwrap();
        match PRIVATE.decrypt(&sealed[..sealed.len() - 1]) {
            Err(SecurityError::Truncated { len: 255, block: 256 }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_public_key_cannot_decrypt() {
        let sealed = PUBLIC.encrypt(b"hello").unwrap();
        assert!(PUBLIC.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_corrupt_block_fails() {
        let mut sealed = PUBLIC.encrypt(b"hello").unwrap();
        sealed[10] ^= 0xff;
        assert!(PRIVATE.decrypt(&sealed).is_err());
    }

    #[test]
    fn test_missing_key_file() {
        match load_public_key("/nonexistent/metrika.pem") {
            Err(SecurityError::BadKey { path, .. }) => assert_eq!(path, "/nonexistent/metrika.pem"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_private_pem_is_not_a_public_key() {
        assert!(load_public_key(PRIVATE_PEM).is_err());
    }
}
