use super::{Envelope, SecurityError, Transform};
use crate::constants::HASH_HEADER;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signing with a shared key.
///
/// The signature covers the body as it is at this stage of the chain, so in
/// the stock chain it covers the compressed bytes.
#[derive(Clone)]
pub struct Signer {
    keyed: HmacSha256,
}

impl Signer {
    /// A signer for `key`.
    pub fn new(key: &[u8]) -> Result<Signer, SecurityError> {
        let keyed = HmacSha256::new_from_slice(key).map_err(|e| SecurityError::BadKey {
            path: "hmac".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Signer { keyed })
    }

    fn mac(&self, body: &[u8]) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(body);
        mac
    }

    /// The base64 signature of `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        base64::encode(self.mac(body).finalize().into_bytes())
    }

    /// Check a base64 signature in constant time.
    pub fn verify(&self, body: &[u8], signature: &str) -> Result<(), SecurityError> {
        let raw = base64::decode(signature.trim()).map_err(|_| SecurityError::MalformedSignature)?;
        self.mac(body)
            .verify_slice(&raw)
            .map_err(|_| SecurityError::SignatureMismatch)
    }
}

impl Transform for Signer {
    fn name(&self) -> &'static str {
        "hmac-sha256"
    }

    fn apply(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        let signature = self.sign(&env.body);
        env.set_header(HASH_HEADER, signature);
        Ok(())
    }

    /// Unsigned bodies are let through; a present but wrong signature is not.
    fn undo(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        match env.header(HASH_HEADER) {
            Some(signature) => self.verify(&env.body, signature),
            None => {
                debug!("request carries no {} header, skipping verification", HASH_HEADER);
                Ok(())
            }
        }
    }
}
