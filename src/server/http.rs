//! Tiny, unassuming HTTP server.
use super::{Request, Response, Service};
use crate::constants::MAX_BODY_BYTES;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Something that answers HTTP requests.
pub trait Handler: Sync + Send {
    /// Answer one request.
    fn handle(&self, request: Request) -> Response;
}

impl Handler for Service {
    fn handle(&self, request: Request) -> Response {
        Service::handle(self, request)
    }
}

/// A tiny_http listener feeding a fixed set of handler threads.
pub struct HttpServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
}

enum Inbound {
    Request(Request),
    TooLarge,
}

fn read_request(rq: &mut tiny_http::Request) -> io::Result<Inbound> {
    if rq.body_length().map(|l| l as u64 > MAX_BODY_BYTES).unwrap_or(false) {
        return Ok(Inbound::TooLarge);
    }
    let mut body = Vec::new();
    rq.as_reader().take(MAX_BODY_BYTES + 1).read_to_end(&mut body)?;
    if body.len() as u64 > MAX_BODY_BYTES {
        return Ok(Inbound::TooLarge);
    }
    let headers = rq
        .headers()
        .iter()
        .map(|h| (h.field.as_str().as_str().to_string(), h.value.as_str().to_string()))
        .collect();
    Ok(Inbound::Request(Request {
        method: rq.method().clone(),
        url: rq.url().to_string(),
        headers,
        body,
    }))
}

fn respond(rq: tiny_http::Request, response: Response) -> io::Result<()> {
    let mut out = tiny_http::Response::from_data(response.body).with_status_code(response.status);
    for (name, value) in &response.headers {
        match tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => out = out.with_header(header),
            Err(()) => warn!("dropping unencodable header {}", name),
        }
    }
    rq.respond(out)
}

fn serve<H: Handler>(server: &tiny_http::Server, handler: &H, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let mut rq = match server.recv_timeout(RECV_TIMEOUT) {
            Ok(Some(rq)) => rq,
            Ok(None) => continue,
            Err(e) => {
                error!("failed to receive request: {}", e);
                continue;
            }
        };
        let response = match read_request(&mut rq) {
            Ok(Inbound::Request(request)) => handler.handle(request),
            Ok(Inbound::TooLarge) => Response::text(413, "payload too large"),
            Err(e) => {
                warn!("failed to read request body: {}", e);
                Response::text(400, "unreadable body")
            }
        };
        if let Err(e) = respond(rq, response) {
            debug!("failed to write response: {}", e);
        }
    }
}

impl HttpServer {
    /// Bind `address` and answer requests on `workers` threads.
    pub fn start<H>(address: &str, handler: H, workers: usize) -> io::Result<HttpServer>
    where
        H: Handler + 'static,
    {
        let server = tiny_http::Server::http(address).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "listener has no IP address"))?;
        let server = Arc::new(server);
        let handler = Arc::new(handler);
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();
        for idx in 0..workers.max(1) {
            let server = Arc::clone(&server);
            let handler = Arc::clone(&handler);
            let stop = Arc::clone(&stop);
            threads.push(
                thread::Builder::new()
                    .name(format!("metrika-http-{}", idx))
                    .spawn(move || serve(&server, &*handler, &stop))?,
            );
        }
        info!("serving HTTP on {}", addr);
        Ok(HttpServer { addr, stop, threads })
    }

    /// The bound address, useful when started on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting requests and wait for requests in flight.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads {
            if handle.join().is_err() {
                error!("HTTP handler thread panicked");
            }
        }
        info!("HTTP server on {} stopped", self.addr);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream;

    struct Echo;

    impl Handler for Echo {
        fn handle(&self, request: Request) -> Response {
            Response::text(201, format!("{} {} {}", request.method, request.url, request.body.len()))
        }
    }

    fn roundtrip(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(raw).unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).unwrap();
        out
    }

    #[test]
    fn test_serves_and_stops() {
        let server = HttpServer::start("127.0.0.1:0", Echo, 2).unwrap();
        let addr = server.local_addr();
        let out = roundtrip(
            addr,
            b"POST /update/ HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
        );
        assert!(out.starts_with("HTTP/1.1 201"), "{}", out);
        assert!(out.ends_with("POST /update/ 3"), "{}", out);
        server.shutdown();
    }
}
