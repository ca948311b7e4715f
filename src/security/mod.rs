//! Payload transforms applied between the agent and the server.
//!
//! A `Chain` is an ordered list of `Transform`s. The sender calls
//! `Chain::apply`, which runs each stage in order; the receiver builds the
//! same list and calls `Chain::undo`, which runs the inverse of each stage in
//! reverse order. The stock chain is compress, sign, encrypt, so the
//! receiver decrypts, verifies and then decompresses.
use crate::constants::REAL_IP_HEADER;
use std::io;

mod compress;
mod crypto;
mod sign;
mod subnet;

pub use self::compress::{gunzip, gzip, Gzip};
pub use self::crypto::{load_private_key, load_public_key, Crypto};
pub use self::sign::Signer;
pub use self::subnet::{Subnet, SubnetError};

/// Errors raised while applying or undoing a transform.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    /// The `HashSHA256` header does not match the body.
    #[error("signature mismatch")]
    SignatureMismatch,
    /// The `HashSHA256` header is not valid base64.
    #[error("malformed signature header")]
    MalformedSignature,
    /// The body could not be compressed or decompressed.
    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),
    /// The decompressed body is larger than the limit, in bytes.
    #[error("decompressed body exceeds {0} bytes")]
    TooLarge(u64),
    /// RSA encryption or decryption failed.
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    /// The ciphertext is not a whole number of RSA blocks.
    #[error("ciphertext length {len} is not a multiple of {block}")]
    Truncated {
        /// Received length.
        len: usize,
        /// Modulus size in bytes.
        block: usize,
    },
    /// The key is too small for OAEP with SHA-512.
    #[error("rsa key of {0} bytes is too small for OAEP/SHA-512")]
    KeyTooSmall(usize),
    /// The stage needs a key half that was not configured.
    #[error("{0} key not configured")]
    MissingKey(&'static str),
    /// A PEM key could not be read or parsed.
    #[error("bad key {path}: {reason}")]
    BadKey {
        /// Where the key was read from.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// A body with its headers, as it moves through a chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Payload bytes.
    pub body: Vec<u8>,
    headers: Vec<(String, String)>,
}

impl Envelope {
    /// Wrap a body with no headers.
    pub fn new(body: Vec<u8>) -> Envelope {
        Envelope {
            body,
            headers: Vec::new(),
        }
    }

    /// Wrap a body with the headers it arrived with.
    pub fn with_headers(body: Vec<u8>, headers: Vec<(String, String)>) -> Envelope {
        Envelope { body, headers }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Set a header, replacing any existing value.
    pub fn set_header<V: Into<String>>(&mut self, name: &str, value: V) {
        self.remove_header(name);
        self.headers.push((name.to_string(), value.into()));
    }

    /// Remove a header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// All headers, in insertion order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// The client address declared in `X-Real-IP`.
    pub fn real_ip(&self) -> Option<&str> {
        self.header(REAL_IP_HEADER)
    }
}

/// One reversible stage of a chain.
pub trait Transform: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;
    /// The sending direction.
    fn apply(&self, env: &mut Envelope) -> Result<(), SecurityError>;
    /// The receiving direction.
    fn undo(&self, env: &mut Envelope) -> Result<(), SecurityError>;
}

/// An ordered list of transforms.
#[derive(Default)]
pub struct Chain {
    stages: Vec<Box<dyn Transform>>,
}

impl Chain {
    /// A chain with no stages; both directions pass bodies through.
    pub fn new() -> Chain {
        Chain::default()
    }

    /// Append a stage.
    pub fn push<T: Transform + 'static>(mut self, stage: T) -> Chain {
        self.stages.push(Box::new(stage));
        self
    }

    /// The stock chain: gzip, then HMAC if `key` is set, then RSA if `crypto`
    /// is set. Agents pass the public key, servers the private key.
    pub fn standard(key: Option<&[u8]>, crypto: Option<Crypto>) -> Result<Chain, SecurityError> {
        let mut chain = Chain::new().push(Gzip);
        if let Some(key) = key {
            chain = chain.push(Signer::new(key)?);
        }
        if let Some(crypto) = crypto {
            chain = chain.push(crypto);
        }
        Ok(chain)
    }

    /// Names of the stages, in sending order.
    pub fn stages(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage forward, in order.
    pub fn apply(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        for stage in &self.stages {
            stage.apply(env)?;
        }
        Ok(())
    }

    /// Run every stage backward, in reverse order.
    pub fn undo(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        for stage in self.stages.iter().rev() {
            trace!("undoing {}", stage.name());
            stage.undo(env)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::constants::{ENCRYPTED_HEADER, HASH_HEADER};

    lazy_static! {
        static ref PRIVATE: rsa::RsaPrivateKey =
            load_private_key(concat!(env!("CARGO_MANIFEST_DIR"), "/resources/tests/keys/private.pem")).unwrap();
    }

    fn body() -> Vec<u8> {
        br#"[{"id":"Alloc","type":"gauge","value":134024}]"#.to_vec()
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut env = Envelope::new(vec![]);
        env.set_header("Content-Encoding", "gzip");
        assert_eq!(env.header("content-encoding"), Some("gzip"));
        env.set_header("CONTENT-ENCODING", "identity");
        assert_eq!(env.headers().len(), 1);
        env.remove_header("content-Encoding");
        assert!(env.header("Content-Encoding").is_none());
    }

    #[test]
    fn test_standard_stage_order() {
        let crypto = Crypto::Private(PRIVATE.clone());
        let chain = Chain::standard(Some(&b"secret"[..]), Some(crypto)).unwrap();
        assert_eq!(chain.stages(), vec!["gzip", "hmac-sha256", "rsa-oaep"]);
        assert_eq!(Chain::standard(None, None).unwrap().stages(), vec!["gzip"]);
    }

    #[test]
    fn test_full_chain_round_trip() {
        let sender = Chain::standard(Some(&b"secret"[..]), Some(Crypto::Public(PRIVATE.to_public_key()))).unwrap();
        let receiver = Chain::standard(Some(&b"secret"[..]), Some(Crypto::Private(PRIVATE.clone()))).unwrap();
        let mut env = Envelope::new(body());
        sender.apply(&mut env).unwrap();
        assert!(env.header(HASH_HEADER).is_some());
        assert!(env.header(ENCRYPTED_HEADER).is_some());
        assert_ne!(env.body, body());
        receiver.undo(&mut env).unwrap();
        assert_eq!(env.body, body());
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sender = Chain::standard(Some(&b"secret"[..]), None).unwrap();
        let receiver = Chain::standard(Some(&b"other"[..]), None).unwrap();
        let mut env = Envelope::new(body());
        sender.apply(&mut env).unwrap();
        match receiver.undo(&mut env) {
            Err(SecurityError::SignatureMismatch) => {}
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_tampering_after_signing_is_rejected() {
        let chain = Chain::standard(Some(&b"secret"[..]), None).unwrap();
        let mut env = Envelope::new(body());
        chain.apply(&mut env).unwrap();
        let mut tampered = gunzip(&env.body).unwrap();
        tampered[0] = b'{';
        env.body = gzip(&tampered).unwrap();
        assert!(chain.undo(&mut env).is_err());
    }
}
