use super::{Client, TransportError};
use crate::constants::{REAL_IP_HEADER, REQUEST_TIMEOUT, UPDATES_PATH, UPDATE_PATH};
use crate::metric::{self, Collection, Metrics, Sample};
use crate::security::{Chain, Envelope};
use reqwest::blocking;

/// Posts wire records as JSON, run through a security chain.
pub struct HttpClient {
    client: blocking::Client,
    base: String,
    local_ip: String,
    chain: Chain,
}

/// `localhost:8080` and `http://localhost:8080/` both become
/// `http://localhost:8080`.
fn base_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

impl HttpClient {
    /// A client for the server at `address`, declaring `local_ip` in
    /// `X-Real-IP`.
    pub fn new(address: &str, local_ip: &str, chain: Chain) -> Result<HttpClient, TransportError> {
        let client = blocking::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(HttpClient {
            client,
            base: base_url(address),
            local_ip: local_ip.to_string(),
            chain,
        })
    }

    /// The URL prefix requests are sent to.
    pub fn base(&self) -> &str {
        &self.base
    }

    fn post(&self, path: &str, body: Vec<u8>) -> Result<(), TransportError> {
        let mut env = Envelope::new(body);
        env.set_header("Content-Type", "application/json");
        env.set_header(REAL_IP_HEADER, self.local_ip.as_str());
        self.chain.apply(&mut env)?;

        let url = format!("{}{}", self.base, path);
        let mut req = self.client.post(&url);
        for (name, value) in env.headers() {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.body(env.body).send()?;
        let status = resp.status();
        if status.is_success() {
            trace!("POST {} -> {}", url, status);
            Ok(())
        } else {
            let body = resp.text().unwrap_or_default();
            Err(TransportError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            })
        }
    }
}

impl Client for HttpClient {
    fn send_one(&self, sample: &Sample) -> Result<(), TransportError> {
        let body = serde_json::to_vec(&Metrics::from(sample))?;
        self.post(UPDATE_PATH, body)
    }

    fn send_batch(&self, batch: &[Collection]) -> Result<(), TransportError> {
        let records = metric::to_wire(batch);
        if records.is_empty() {
            return Ok(());
        }
        debug!("sending {} records to {}{}", records.len(), self.base, UPDATES_PATH);
        let body = serde_json::to_vec(&records)?;
        self.post(UPDATES_PATH, body)
    }
}
