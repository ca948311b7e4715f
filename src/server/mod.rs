//! The collector's network surfaces.
//!
//! `Service` maps plain `Request`s to `Response`s without touching sockets;
//! `HttpServer` feeds it from tiny_http. `RpcServer` answers framed RPC
//! requests against the same storage.
use std::fmt;

mod handlers;
mod http;
mod rpc;

pub use self::handlers::Service;
pub use self::http::{Handler, HttpServer};
pub use self::rpc::{dispatch, RpcServer};
pub use tiny_http::Method;

/// An HTTP request, detached from its connection.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Path and query.
    pub url: String,
    /// Headers in arrival order.
    pub headers: Vec<(String, String)>,
    /// Raw body, still compressed or encrypted if it arrived that way.
    pub body: Vec<u8>,
}

impl Request {
    /// A request with no headers or body.
    pub fn new<S: Into<String>>(method: Method, url: S) -> Request {
        Request {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Add a header.
    pub fn header<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Request {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the body.
    pub fn body<B: Into<Vec<u8>>>(mut self, body: B) -> Request {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// An HTTP response, before it is written out.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Headers.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Vec<u8>,
}

impl Response {
    /// A `text/plain` response.
    pub fn text<S: fmt::Display>(status: u16, body: S) -> Response {
        Response {
            status,
            headers: vec![("Content-Type".to_string(), "text/plain; charset=utf-8".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    /// An `application/json` response.
    pub fn json(status: u16, body: Vec<u8>) -> Response {
        Response {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body,
        }
    }

    /// A `text/html` response.
    pub fn html(status: u16, body: String) -> Response {
        Response {
            status,
            headers: vec![("Content-Type".to_string(), "text/html; charset=utf-8".to_string())],
            body: body.into_bytes(),
        }
    }

    /// An empty response.
    pub fn empty(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Case-insensitive header lookup.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The body as text, lossily.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}
