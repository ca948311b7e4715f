use super::{Envelope, SecurityError, Transform};
use crate::constants::MAX_BODY_BYTES;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, Read, Write};

const CONTENT_ENCODING: &str = "Content-Encoding";

/// Gzip a buffer.
pub fn gzip(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    enc.write_all(body)?;
    enc.finish()
}

/// Gunzip a buffer of at most `MAX_BODY_BYTES` decoded bytes.
pub fn gunzip(body: &[u8]) -> Result<Vec<u8>, SecurityError> {
    gunzip_limited(body, MAX_BODY_BYTES)
}

fn gunzip_limited(body: &[u8], limit: u64) -> Result<Vec<u8>, SecurityError> {
    let mut out = Vec::with_capacity(body.len() * 4);
    GzDecoder::new(body).take(limit + 1).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(SecurityError::TooLarge(limit));
    }
    Ok(out)
}

/// Gzip compression. Receivers only decompress bodies whose
/// `Content-Encoding` mentions gzip, so plain senders keep working.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gzip;

impl Transform for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn apply(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        env.body = gzip(&env.body)?;
        env.set_header(CONTENT_ENCODING, "gzip");
        Ok(())
    }

    fn undo(&self, env: &mut Envelope) -> Result<(), SecurityError> {
        let compressed = env
            .header(CONTENT_ENCODING)
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);
        if compressed {
            env.body = gunzip(&env.body)?;
            env.remove_header(CONTENT_ENCODING);
        }
        Ok(())
    }
}
