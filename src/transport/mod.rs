//! Delivery of samples from the agent to the server.
//!
//! Two clients implement `Client`: `HttpClient` posts JSON through the
//! security chain, `RpcClient` speaks length-prefixed bincode frames over a
//! long-lived TCP connection.
use crate::metric::{Collection, Sample};
use crate::security::SecurityError;
use std::io;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};

pub mod frame;
mod http;
pub mod rpc;

pub use self::http::HttpClient;
pub use self::rpc::RpcClient;

/// Errors raised while delivering samples.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket level failure.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Failure inside the HTTP client.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server answered {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log.
        body: String,
    },
    /// The server refused the request at the application level.
    #[error("rejected by server: {0}")]
    Rejected(String),
    /// The payload could not be signed, compressed or encrypted.
    #[error("security: {0}")]
    Security(#[from] SecurityError),
    /// The payload could not be encoded.
    #[error("encode: {0}")]
    Encode(String),
}

impl TransportError {
    /// Whether trying again might succeed: network failures and 5xx are,
    /// 4xx and application rejections are not.
    pub fn is_retryable(&self) -> bool {
        match *self {
            TransportError::Io(ref e) => !matches!(e.kind(), io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput),
            TransportError::Http(ref e) => e.is_connect() || e.is_timeout() || e.is_request() || e.is_body(),
            TransportError::Status { status, .. } => status >= 500,
            TransportError::Rejected(_) | TransportError::Security(_) | TransportError::Encode(_) => false,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> TransportError {
        TransportError::Encode(e.to_string())
    }
}

/// A way of getting samples to the server.
pub trait Client: Send + Sync {
    /// Deliver one sample.
    fn send_one(&self, sample: &Sample) -> Result<(), TransportError>;
    /// Deliver every sample of every collection in one request. Empty
    /// batches succeed without touching the network.
    fn send_batch(&self, batch: &[Collection]) -> Result<(), TransportError>;
}

/// The local address used to reach `server`, for `X-Real-IP`. Falls back to
/// loopback when the route cannot be determined.
pub fn local_ip(server: &str) -> IpAddr {
    let fallback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let target = match server
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
    {
        Some(addr) => addr,
        None => return fallback,
    };
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    UdpSocket::bind(bind)
        .and_then(|sock| sock.connect(target).map(|_| sock))
        .and_then(|sock| sock.local_addr())
        .map(|addr| addr.ip())
        .unwrap_or(fallback)
}
