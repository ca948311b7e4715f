use metrika::accumulator::Accumulator;
use metrika::metric::{Collection, Sample};
use metrika::pool::{Pool, PoolConfig};
use metrika::retry::Policy;
use metrika::sampler::Sampler;
use metrika::security::{load_private_key, Chain, Crypto, Signer};
use metrika::server::{HttpServer, Service};
use metrika::storage::{MemStorage, SqlStorage, Storage};
use metrika::transport::{Client, HttpClient, TransportError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const KEY: &[u8] = b"secret";

fn private_key_path() -> String {
    format!("{}/resources/tests/keys/private.pem", env!("CARGO_MANIFEST_DIR"))
}

fn secured_server(storage: Arc<dyn Storage>) -> HttpServer {
    let private = load_private_key(&private_key_path()).unwrap();
    let chain = Chain::standard(Some(KEY), Some(Crypto::Private(private))).unwrap();
    let service = Service::new(storage)
        .with_chain(chain)
        .with_signer(Signer::new(KEY).unwrap())
        .with_subnet("127.0.0.0/8".parse().unwrap());
    HttpServer::start("127.0.0.1:0", service, 2).unwrap()
}

fn secured_client(server: &HttpServer) -> HttpClient {
    let private = load_private_key(&private_key_path()).unwrap();
    let chain = Chain::standard(Some(KEY), Some(Crypto::Public(private.to_public_key()))).unwrap();
    HttpClient::new(&server.local_addr().to_string(), "127.0.0.1", chain).unwrap()
}

#[test]
fn batch_round_trip_through_signing_and_encryption() {
    let storage = Arc::new(MemStorage::new());
    let server = secured_server(storage.clone());
    let client = secured_client(&server);

    let batch = vec![Collection::new(vec![
        Sample::gauge("Alloc", 134024.0),
        Sample::counter("PollCount", 1),
    ])];
    client.send_batch(&batch).unwrap();
    client.send_one(&Sample::gauge("RandomValue", 0.25)).unwrap();

    assert_eq!(storage.gauge("Alloc").unwrap(), Some(134024.0));
    assert_eq!(storage.gauge("RandomValue").unwrap(), Some(0.25));
    assert_eq!(storage.counter("PollCount").unwrap(), Some(1));
    server.shutdown();
}

#[test]
fn concurrent_counters_are_summed() {
    let storage = Arc::new(MemStorage::new());
    let server = secured_server(storage.clone());
    let client = Arc::new(secured_client(&server));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let client = Arc::clone(&client);
            thread::spawn(move || client.send_one(&Sample::counter("PollCount", 1)).unwrap())
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(storage.counter("PollCount").unwrap(), Some(2));
    server.shutdown();
}

#[test]
fn wrong_key_is_rejected_without_retry() {
    let storage = Arc::new(MemStorage::new());
    let server = secured_server(storage.clone());
    let private = load_private_key(&private_key_path()).unwrap();
    let chain = Chain::standard(Some(&b"not-the-key"[..]), Some(Crypto::Public(private.to_public_key()))).unwrap();
    let client = HttpClient::new(&server.local_addr().to_string(), "127.0.0.1", chain).unwrap();

    match client.send_one(&Sample::gauge("Alloc", 1.0)) {
        Err(e @ TransportError::Status { status: 400, .. }) => assert!(!e.is_retryable()),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(storage.gauge("Alloc").unwrap(), None);
    server.shutdown();
}

#[test]
fn untrusted_agent_is_forbidden() {
    let storage = Arc::new(MemStorage::new());
    let server = secured_server(storage.clone());
    let private = load_private_key(&private_key_path()).unwrap();
    let chain = Chain::standard(Some(KEY), Some(Crypto::Public(private.to_public_key()))).unwrap();
    let client = HttpClient::new(&server.local_addr().to_string(), "192.168.0.7", chain).unwrap();

    match client.send_one(&Sample::gauge("Alloc", 1.0)) {
        Err(TransportError::Status { status: 403, .. }) => {}
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown();
}

#[test]
fn ping_reflects_backend() {
    let memory = HttpServer::start("127.0.0.1:0", Service::new(Arc::new(MemStorage::new())), 1).unwrap();
    let sql = Arc::new(SqlStorage::open(":memory:", Policy::once()).unwrap());
    let database = HttpServer::start("127.0.0.1:0", Service::new(sql), 1).unwrap();

    let get = |server: &HttpServer| {
        reqwest::blocking::get(format!("http://{}/ping", server.local_addr()))
            .unwrap()
            .status()
            .as_u16()
    };
    assert_eq!(get(&memory), 418);
    assert_eq!(get(&database), 200);
    memory.shutdown();
    database.shutdown();
}

#[test]
fn agent_pipeline_delivers_samples() {
    let storage = Arc::new(MemStorage::new());
    let server = secured_server(storage.clone());
    let client: Arc<dyn Client> = Arc::new(secured_client(&server));
    let config = PoolConfig {
        poll_interval: Duration::from_millis(50),
        report_interval: Duration::from_millis(120),
        workers: 2,
        retry: Policy::once(),
        ..PoolConfig::default()
    };
    let pool = Pool::start(client, Arc::new(Accumulator::new()), Sampler::new(), config).unwrap();
    thread::sleep(Duration::from_millis(400));
    let report = pool.shutdown(Duration::from_secs(5));
    assert!(report.abandoned.is_empty(), "{:?}", report);

    let polls = storage.counter("PollCount").unwrap().unwrap_or(0);
    assert!(polls > 0);
    assert!(storage.gauge("RandomValue").unwrap().is_some());
    assert!(storage.gauge("TotalMemory").unwrap().is_some());
    server.shutdown();
}
