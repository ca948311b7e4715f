use super::{Method, Request, Response};
use crate::constants::{HASH_HEADER, REAL_IP_HEADER};
use crate::metric::{Kind, Metrics};
use crate::security::{gzip, Chain, Envelope, SecurityError, Signer, Subnet, SubnetError};
use crate::storage::{self, Storage, StorageError};
use crate::time;
use std::borrow::Cow;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, PartialEq)]
enum Route<'a> {
    List,
    Ping,
    UpdateJson,
    UpdatePath { kind: &'a str, name: &'a str, value: &'a str },
    Updates,
    ValueJson,
    ValuePath { kind: &'a str, name: &'a str },
    MissingName,
    NotFound,
}

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Route<'a> {
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match *segments.as_slice() {
            [""] => Route::List,
            ["ping"] => Route::Ping,
            ["update"] | ["update", ""] => Route::UpdateJson,
            ["update", _] | ["update", _, ""] | ["update", _, "", _] => Route::MissingName,
            ["update", kind, name, value] => Route::UpdatePath { kind, name, value },
            ["updates"] | ["updates", ""] => Route::Updates,
            ["value"] | ["value", ""] => Route::ValueJson,
            ["value", _] | ["value", _, ""] => Route::MissingName,
            ["value", kind, name] => Route::ValuePath { kind, name },
            _ => Route::NotFound,
        }
    }

    fn method(&self) -> Option<Method> {
        match *self {
            Route::List | Route::Ping | Route::ValuePath { .. } => Some(Method::Get),
            Route::UpdateJson | Route::UpdatePath { .. } | Route::Updates | Route::ValueJson => Some(Method::Post),
            Route::MissingName | Route::NotFound => None,
        }
    }
}

fn is_json(env: &Envelope) -> bool {
    env.header("Content-Type")
        .map(|ct| ct.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

fn storage_failure(e: StorageError) -> Response {
    if e.is_client_error() {
        Response::text(400, e)
    } else {
        error!("storage failure: {}", e);
        Response::text(500, "internal error")
    }
}

/// Percent-decode a metric name taken from the path.
fn decode(segment: &str) -> Result<Cow<str>, Response> {
    urlencoding::decode(segment).map_err(|e| Response::text(400, format!("bad name {:?}: {}", segment, e)))
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// The HTTP routes of the collector, independent of any socket.
///
/// Every request is checked against the trusted subnet, then run backward
/// through the security chain, then routed. Successful responses are signed
/// when a key is configured and gzipped when the client accepts it.
pub struct Service {
    storage: Arc<dyn Storage>,
    chain: Chain,
    signer: Option<Signer>,
    subnet: Option<Subnet>,
}

impl Service {
    /// A service over `storage` with no security configured.
    pub fn new(storage: Arc<dyn Storage>) -> Service {
        Service {
            storage,
            chain: Chain::new(),
            signer: None,
            subnet: None,
        }
    }

    /// Undo `chain` on every request body.
    pub fn with_chain(mut self, chain: Chain) -> Service {
        self.chain = chain;
        self
    }

    /// Sign successful responses.
    pub fn with_signer(mut self, signer: Signer) -> Service {
        self.signer = Some(signer);
        self
    }

    /// Only accept requests whose `X-Real-IP` is inside `subnet`.
    pub fn with_subnet(mut self, subnet: Subnet) -> Service {
        self.subnet = Some(subnet);
        self
    }

    /// Answer one request.
    pub fn handle(&self, request: Request) -> Response {
        let start = Instant::now();
        let method = request.method.clone();
        let url = request.url.clone();
        let accepts_gzip = request
            .get_header("Accept-Encoding")
            .map(|v| v.to_ascii_lowercase().contains("gzip"))
            .unwrap_or(false);

        let mut response = self.route(request);
        self.finish(&mut response, accepts_gzip);
        info!(
            "{} {} {} {}B {}us",
            method,
            url,
            response.status,
            response.body.len(),
            time::elapsed_ns(start) / 1_000
        );
        response
    }

    fn route(&self, request: Request) -> Response {
        if let Some(ref subnet) = self.subnet {
            match subnet.check(request.get_header(REAL_IP_HEADER)) {
                Ok(_) => {}
                Err(e @ SubnetError::Untrusted(_)) => return Response::text(403, e),
                Err(e) => return Response::text(400, e),
            }
        }

        let path = request.url.split('?').next().unwrap_or("").to_string();
        let route = Route::parse(&path);
        match route.method() {
            None => return Response::text(404, "not found"),
            Some(ref m) if *m != request.method => return Response::text(405, "method not allowed"),
            Some(_) => {}
        }

        let mut env = Envelope::with_headers(request.body, request.headers);
        match self.chain.undo(&mut env) {
            Ok(()) => {}
            Err(e @ SecurityError::TooLarge(_)) => {
                warn!("rejecting {}: {}", path, e);
                return Response::text(413, e);
            }
            Err(e) => {
                warn!("rejecting {}: {}", path, e);
                return Response::text(400, e);
            }
        }

        match route {
            Route::List => self.list(),
            Route::Ping => self.ping(),
            Route::UpdateJson => self.update_json(&env),
            Route::UpdatePath { kind, name, value } => match decode(name) {
                Ok(name) => self.update_path(kind, &name, value),
                Err(resp) => resp,
            },
            Route::Updates => self.updates(&env),
            Route::ValueJson => self.value_json(&env),
            Route::ValuePath { kind, name } => match decode(name) {
                Ok(name) => self.value_path(kind, &name),
                Err(resp) => resp,
            },
            Route::MissingName | Route::NotFound => Response::text(404, "not found"),
        }
    }

    fn finish(&self, response: &mut Response, accepts_gzip: bool) {
        let compressible = response
            .get_header("Content-Type")
            .map(|ct| ct.starts_with("application/json") || ct.starts_with("text/html"))
            .unwrap_or(false);
        if accepts_gzip && compressible && !response.body.is_empty() {
            match gzip(&response.body) {
                Ok(body) => {
                    response.body = body;
                    response.headers.push(("Content-Encoding".to_string(), "gzip".to_string()));
                }
                Err(e) => warn!("could not compress response: {}", e),
            }
        }
        if response.status == 200 {
            if let Some(ref signer) = self.signer {
                let signature = signer.sign(&response.body);
                response.headers.push((HASH_HEADER.to_string(), signature));
            }
        }
    }

    fn update_path(&self, kind: &str, name: &str, value: &str) -> Response {
        let kind: Kind = match kind.parse() {
            Ok(k) => k,
            Err(e) => return Response::text(400, e),
        };
        let record = match Metrics::from_text(kind, name, value) {
            Ok(r) => r,
            Err(e) => return Response::text(400, e),
        };
        match storage::apply(&*self.storage, &record) {
            Ok(_) => Response::text(200, "OK"),
            Err(e) => storage_failure(e),
        }
    }

    fn update_json(&self, env: &Envelope) -> Response {
        if !is_json(env) {
            return Response::text(400, "expected application/json");
        }
        let record: Metrics = match serde_json::from_slice(&env.body) {
            Ok(r) => r,
            Err(e) => return Response::text(400, format!("malformed payload: {}", e)),
        };
        if record.id.is_empty() {
            return Response::text(404, "metric id is empty");
        }
        let stored = match storage::apply(&*self.storage, &record) {
            Ok(stored) => stored,
            Err(e) => return storage_failure(e),
        };
        match serde_json::to_vec(&stored) {
            Ok(body) => Response::json(200, body),
            Err(e) => storage_failure(e.into()),
        }
    }

    fn updates(&self, env: &Envelope) -> Response {
        if !is_json(env) {
            return Response::text(400, "expected application/json");
        }
        let batch: Vec<Metrics> = match serde_json::from_slice(&env.body) {
            Ok(b) => b,
            Err(e) => return Response::text(400, format!("malformed payload: {}", e)),
        };
        match self.storage.batch_upsert(&batch) {
            Ok(()) => {
                debug!("applied batch of {} records", batch.len());
                Response::empty(200)
            }
            Err(e) => storage_failure(e),
        }
    }

    fn lookup(&self, kind: Kind, name: &str) -> Result<Option<Metrics>, StorageError> {
        Ok(match kind {
            Kind::Gauge => self.storage.gauge(name)?.map(|v| Metrics::gauge(name, v)),
            Kind::Counter => self.storage.counter(name)?.map(|d| Metrics::counter(name, d)),
        })
    }

    fn value_path(&self, kind: &str, name: &str) -> Response {
        let kind: Kind = match kind.parse() {
            Ok(k) => k,
            Err(e) => return Response::text(400, e),
        };
        match self.lookup(kind, name) {
            Ok(Some(Metrics { value: Some(v), .. })) => Response::text(200, v),
            Ok(Some(Metrics { delta: Some(d), .. })) => Response::text(200, d),
            Ok(_) => Response::text(404, "metric not found"),
            Err(e) => storage_failure(e),
        }
    }

    fn value_json(&self, env: &Envelope) -> Response {
        let query: Metrics = match serde_json::from_slice(&env.body) {
            Ok(q) => q,
            Err(e) => return Response::text(400, format!("malformed payload: {}", e)),
        };
        let kind = match query.kind() {
            Ok(k) => k,
            Err(e) => return Response::text(400, e),
        };
        match self.lookup(kind, &query.id) {
            Ok(Some(record)) => match serde_json::to_vec(&record) {
                Ok(body) => Response::json(200, body),
                Err(e) => storage_failure(e.into()),
            },
            Ok(None) => Response::text(404, "metric not found"),
            Err(e) => storage_failure(e),
        }
    }

    fn list(&self) -> Response {
        let (gauges, counters) = match (self.storage.gauges(), self.storage.counters()) {
            (Ok(g), Ok(c)) => (g, c),
            (Err(e), _) | (_, Err(e)) => return storage_failure(e),
        };
        let mut page = String::from(
            "<!DOCTYPE html>\n<html><head><title>metrika</title></head><body>\n\
             <table>\n<tr><th>name</th><th>type</th><th>value</th></tr>\n",
        );
        for (name, value) in &gauges {
            let _ = writeln!(page, "<tr><td>{}</td><td>gauge</td><td>{}</td></tr>", escape(name), value);
        }
        for (name, total) in &counters {
            let _ = writeln!(page, "<tr><td>{}</td><td>counter</td><td>{}</td></tr>", escape(name), total);
        }
        page.push_str("</table>\n</body></html>\n");
        Response::html(200, page)
    }

    fn ping(&self) -> Response {
        match self.storage.ping() {
            Ok(()) => Response::text(200, "pong"),
            Err(StorageError::Unsupported(_)) => Response::text(418, "no database configured"),
            Err(e) => {
                error!("database ping failed: {}", e);
                Response::text(500, "database unavailable")
            }
        }
    }
}
