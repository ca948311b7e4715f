//! The RPC listener.
//!
//! One thread accepts, one thread per connection reads request frames and
//! writes one response frame for each. A connection is closed on the first
//! frame that does not decode.
use crate::constants::REQUEST_TIMEOUT;
use crate::metric::{Kind, Metrics};
use crate::storage::{self, Storage};
use crate::transport::frame::{read_frame, write_frame};
use crate::transport::rpc::{Request, Response, RpcMetric};
use std::io::{self, BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_SLEEP: Duration = Duration::from_millis(50);
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Answer one request against `storage`.
pub fn dispatch(storage: &dyn Storage, request: Request) -> Response {
    match request {
        Request::Update(metric) => match storage::apply(storage, &metric.to_wire()) {
            Ok(stored) => match RpcMetric::from_wire(&stored) {
                Ok(m) => Response::ok(Some(m)),
                Err(e) => Response::refused(e),
            },
            Err(e) => {
                if !e.is_client_error() {
                    error!("rpc update failed: {}", e);
                }
                Response::refused(e)
            }
        },
        Request::BatchUpdate(metrics) => {
            let batch: Vec<Metrics> = metrics.iter().map(RpcMetric::to_wire).collect();
            match storage.batch_upsert(&batch) {
                Ok(()) => Response::ok(None),
                Err(e) => {
                    if !e.is_client_error() {
                        error!("rpc batch update failed: {}", e);
                    }
                    Response::refused(e)
                }
            }
        }
        Request::Value { id, kind } => {
            let found = match kind {
                Kind::Gauge => storage.gauge(&id).map(|v| v.map(|v| Metrics::gauge(id.as_str(), v))),
                Kind::Counter => storage.counter(&id).map(|d| d.map(|d| Metrics::counter(id.as_str(), d))),
            };
            match found {
                Ok(Some(record)) => match RpcMetric::from_wire(&record) {
                    Ok(m) => Response::ok(Some(m)),
                    Err(e) => Response::refused(e),
                },
                Ok(None) => Response::refused("metric not found"),
                Err(e) => {
                    error!("rpc lookup failed: {}", e);
                    Response::refused(e)
                }
            }
        }
    }
}

/// Whether a frame is waiting, checking `stop` while the peer is idle.
fn wait_for_frame(reader: &BufReader<TcpStream>, stop: &AtomicBool) -> io::Result<bool> {
    if !reader.buffer().is_empty() {
        return Ok(true);
    }
    let stream = reader.get_ref();
    let mut probe = [0u8; 1];
    stream.set_read_timeout(Some(IDLE_POLL))?;
    loop {
        if stop.load(Ordering::Relaxed) {
            return Ok(false);
        }
        match stream.peek(&mut probe) {
            Ok(0) => return Ok(false),
            Ok(_) => {
                stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
                return Ok(true);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => return Err(e),
        }
    }
}

fn handle_stream(stream: TcpStream, storage: &dyn Storage, stop: &AtomicBool) -> io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);
    while wait_for_frame(&reader, stop)? {
        let request: Request = read_frame(&mut reader)?;
        trace!("rpc request {:?}", request);
        let response = dispatch(storage, request);
        write_frame(&mut writer, &response)?;
    }
    Ok(())
}

/// Serves `Request` frames against a storage.
pub struct RpcServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    acceptor: thread::JoinHandle<()>,
}

impl RpcServer {
    /// Bind `address` and start accepting.
    pub fn start(address: &str, storage: Arc<dyn Storage>) -> io::Result<RpcServer> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));
        let accept_stop = Arc::clone(&stop);
        let acceptor = thread::Builder::new()
            .name("metrika-rpc".to_string())
            .spawn(move || accept(&listener, &storage, &accept_stop))?;
        info!("serving RPC on {}", addr);
        Ok(RpcServer { addr, stop, acceptor })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for open connections to finish their current
    /// request.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.acceptor.join().is_err() {
            error!("rpc acceptor panicked");
        }
        info!("RPC server on {} stopped", self.addr);
    }
}

fn accept(listener: &TcpListener, storage: &Arc<dyn Storage>, stop: &Arc<AtomicBool>) {
    let mut connections = Vec::new();
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!("dropping rpc connection from {}: {}", peer, e);
                    continue;
                }
                debug!("rpc connection from {}", peer);
                let storage = Arc::clone(storage);
                let stop = Arc::clone(stop);
                let spawned = thread::Builder::new()
                    .name(format!("metrika-rpc-{}", peer))
                    .spawn(move || {
                        if let Err(e) = handle_stream(stream, &*storage, &stop) {
                            debug!("rpc connection from {} closed: {}", peer, e);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(e) => error!("could not spawn rpc connection thread: {}", e),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_SLEEP),
            Err(e) => {
                error!("rpc accept failed: {}", e);
                thread::sleep(ACCEPT_SLEEP);
            }
        }
        connections.retain(|h: &thread::JoinHandle<()>| !h.is_finished());
    }
    for handle in connections {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemStorage;

    fn gauge(id: &str, value: f64) -> RpcMetric {
        RpcMetric {
            id: id.to_string(),
            kind: Kind::Gauge,
            delta: 0,
            value,
        }
    }

    fn counter(id: &str, delta: i64) -> RpcMetric {
        RpcMetric {
            id: id.to_string(),
            kind: Kind::Counter,
            delta,
            value: 0.0,
        }
    }

    #[test]
    fn test_dispatch_update_returns_total() {
        let s = MemStorage::new();
        dispatch(&s, Request::Update(counter("PollCount", 2)));
        let resp = dispatch(&s, Request::Update(counter("PollCount", 3)));
        assert_eq!(resp, Response::ok(Some(counter("PollCount", 5))));
    }

    #[test]
    fn test_dispatch_batch_and_value() {
        let s = MemStorage::new();
        let resp = dispatch(&s, Request::BatchUpdate(vec![gauge("Alloc", 134024.0), counter("PollCount", 1)]));
        assert_eq!(resp, Response::ok(None));
        let resp = dispatch(
            &s,
            Request::Value {
                id: "Alloc".to_string(),
                kind: Kind::Gauge,
            },
        );
        assert_eq!(resp.metric, Some(gauge("Alloc", 134024.0)));
        let resp = dispatch(
            &s,
            Request::Value {
                id: "Alloc".to_string(),
                kind: Kind::Counter,
            },
        );
        assert_eq!(resp.error.as_deref(), Some("metric not found"));
    }

    #[test]
    fn test_dispatch_refuses_bad_records() {
        let s = MemStorage::new();
        let resp = dispatch(&s, Request::Update(gauge("", 1.0)));
        assert!(resp.error.is_some());
        let resp = dispatch(&s, Request::BatchUpdate(vec![gauge("ok", 1.0), gauge("bad", f64::NAN)]));
        assert!(resp.error.is_some());
        assert_eq!(s.gauge("ok").unwrap(), None);

        dispatch(&s, Request::Update(counter("c", i64::MAX)));
        assert!(dispatch(&s, Request::Update(counter("c", 1))).error.is_some());
        assert_eq!(s.counter("c").unwrap(), Some(i64::MAX));
    }
}
