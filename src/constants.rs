//! Library level constants
use std::time::Duration;

/// Header carrying the base64 HMAC-SHA256 of the body.
pub const HASH_HEADER: &str = "HashSHA256";
/// Header naming the client address for the trusted subnet check.
pub const REAL_IP_HEADER: &str = "X-Real-IP";
/// Header marking an RSA encrypted body.
pub const ENCRYPTED_HEADER: &str = "X-Encrypted";
/// Value of `ENCRYPTED_HEADER`.
pub const ENCRYPTION_SCHEME: &str = "rsa-oaep-sha512";

/// Path for single JSON updates.
pub const UPDATE_PATH: &str = "/update/";
/// Path for batch JSON updates.
pub const UPDATES_PATH: &str = "/updates/";

/// Largest RPC frame accepted in either direction.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;
/// Largest HTTP request body the server reads.
pub const MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

/// Network timeout for a single transport call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the poll counter emitted by the sampler.
pub const POLL_COUNT: &str = "PollCount";
/// Name of the random gauge emitted by the sampler.
pub const RANDOM_VALUE: &str = "RandomValue";
