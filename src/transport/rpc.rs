//! Typed RPC messages and the client that sends them.
//!
//! Each request frame is answered by exactly one response frame on the same
//! connection. A response with `error` set is an application level
//! rejection and is never retried.
use super::frame::{read_frame, write_frame};
use super::{Client, TransportError};
use crate::constants::REQUEST_TIMEOUT;
use crate::metric::{Collection, Kind, Metrics, ProtocolError, Sample, Update};
use parking_lot::Mutex;
use std::io::{self, BufReader, BufWriter};
use std::net::{TcpStream, ToSocketAddrs};

/// A metric as carried over RPC. Unlike `Metrics` the kind is closed, so a
/// well-formed frame always names a known kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMetric {
    /// Metric name.
    pub id: String,
    /// Aggregation kind.
    pub kind: Kind,
    /// Counter delta, or running total in responses.
    pub delta: i64,
    /// Gauge value.
    pub value: f64,
}

impl RpcMetric {
    /// Convert a wire record, validating it.
    pub fn from_wire(record: &Metrics) -> Result<RpcMetric, ProtocolError> {
        Ok(match record.update()? {
            Update::Gauge { id, value } => RpcMetric {
                id: id.to_string(),
                kind: Kind::Gauge,
                delta: 0,
                value,
            },
            Update::Counter { id, delta } => RpcMetric {
                id: id.to_string(),
                kind: Kind::Counter,
                delta,
                value: 0.0,
            },
        })
    }

    /// The equivalent wire record.
    pub fn to_wire(&self) -> Metrics {
        match self.kind {
            Kind::Gauge => Metrics::gauge(self.id.as_str(), self.value),
            Kind::Counter => Metrics::counter(self.id.as_str(), self.delta),
        }
    }
}

impl<'a> From<&'a Sample> for RpcMetric {
    fn from(sample: &'a Sample) -> RpcMetric {
        RpcMetric {
            id: sample.name().to_string(),
            kind: sample.kind(),
            delta: if sample.kind() == Kind::Counter { sample.delta() } else { 0 },
            value: if sample.kind() == Kind::Gauge { sample.value() } else { 0.0 },
        }
    }
}

/// Requests understood by the RPC server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Apply one metric.
    Update(RpcMetric),
    /// Apply every metric, all or nothing.
    BatchUpdate(Vec<RpcMetric>),
    /// Read the current value of a metric.
    Value {
        /// Metric name.
        id: String,
        /// Aggregation kind.
        kind: Kind,
    },
}

/// The answer to one `Request`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    /// Set when the request was refused.
    pub error: Option<String>,
    /// The metric after an `Update`, or the one asked for by `Value`.
    pub metric: Option<RpcMetric>,
}

impl Response {
    /// A successful response.
    pub fn ok(metric: Option<RpcMetric>) -> Response {
        Response { error: None, metric }
    }

    /// A refusal.
    pub fn refused<S: ToString>(reason: S) -> Response {
        Response {
            error: Some(reason.to_string()),
            metric: None,
        }
    }
}

/// Sends `Request`s over one lazily opened connection.
///
/// Calls are serialized on the connection. After any I/O failure the
/// connection is dropped and the next call reconnects.
pub struct RpcClient {
    address: String,
    stream: Mutex<Option<TcpStream>>,
}

fn connect(address: &str) -> io::Result<TcpStream> {
    let mut last = io::Error::new(io::ErrorKind::NotFound, format!("{} resolved to no addresses", address));
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, REQUEST_TIMEOUT) {
            Ok(stream) => {
                stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
                stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => {
                info!("unable to connect to {} using addr {} with error {}", address, addr, e);
                last = e;
            }
        }
    }
    Err(last)
}

impl RpcClient {
    /// A client for `address` (`host:port`). Nothing is dialed until the
    /// first call.
    pub fn new(address: &str) -> RpcClient {
        RpcClient {
            address: address.to_string(),
            stream: Mutex::new(None),
        }
    }

    /// Send one request and wait for its response.
    pub fn call(&self, request: &Request) -> Result<Response, TransportError> {
        let mut guard = self.stream.lock();
        if guard.is_none() {
            *guard = Some(connect(&self.address)?);
        }
        let result = match guard.as_mut() {
            Some(stream) => exchange(stream, request),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no connection")),
        };
        if result.is_err() {
            *guard = None;
        }
        Ok(result?)
    }

    fn expect_ok(&self, request: &Request) -> Result<Response, TransportError> {
        let response = self.call(request)?;
        match response.error {
            Some(reason) => Err(TransportError::Rejected(reason)),
            None => Ok(response),
        }
    }

    /// Read the current value of `id`.
    pub fn value(&self, id: &str, kind: Kind) -> Result<RpcMetric, TransportError> {
        let request = Request::Value {
            id: id.to_string(),
            kind,
        };
        self.expect_ok(&request)?
            .metric
            .ok_or_else(|| TransportError::Rejected(format!("no metric in answer for {}", id)))
    }
}

fn exchange(stream: &mut TcpStream, request: &Request) -> io::Result<Response> {
    {
        let mut writer = BufWriter::new(&*stream);
        write_frame(&mut writer, request)?;
    }
    let mut reader = BufReader::new(&*stream);
    read_frame(&mut reader)
}

impl Client for RpcClient {
    fn send_one(&self, sample: &Sample) -> Result<(), TransportError> {
        self.expect_ok(&Request::Update(RpcMetric::from(sample))).map(|_| ())
    }

    fn send_batch(&self, batch: &[Collection]) -> Result<(), TransportError> {
        let metrics: Vec<RpcMetric> = batch.iter().flat_map(|c| c.iter()).map(RpcMetric::from).collect();
        if metrics.is_empty() {
            return Ok(());
        }
        debug!("sending {} metrics to {}", metrics.len(), self.address);
        self.expect_ok(&Request::BatchUpdate(metrics)).map(|_| ())
    }
}
