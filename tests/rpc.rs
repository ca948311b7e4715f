use metrika::accumulator::Accumulator;
use metrika::metric::{Collection, Kind, Sample};
use metrika::pool::{Pool, PoolConfig};
use metrika::retry::Policy;
use metrika::sampler::Sampler;
use metrika::server::RpcServer;
use metrika::storage::{MemStorage, Storage};
use metrika::transport::frame::write_frame;
use metrika::transport::rpc::{Request, RpcMetric};
use metrika::transport::{Client, RpcClient, TransportError};
use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn server() -> (Arc<MemStorage>, RpcServer) {
    let storage = Arc::new(MemStorage::new());
    let server = RpcServer::start("127.0.0.1:0", storage.clone()).unwrap();
    (storage, server)
}

#[test]
fn updates_and_lookups_share_one_connection() {
    let (storage, server) = server();
    let client = RpcClient::new(&server.local_addr().to_string());

    client.send_one(&Sample::counter("PollCount", 3)).unwrap();
    client
        .send_batch(&[Collection::new(vec![
            Sample::gauge("Alloc", 134024.0),
            Sample::counter("PollCount", 2),
        ])])
        .unwrap();

    assert_eq!(storage.counter("PollCount").unwrap(), Some(5));
    let metric = client.value("Alloc", Kind::Gauge).unwrap();
    assert_eq!(metric.value, 134024.0);
    assert_eq!(client.value("PollCount", Kind::Counter).unwrap().delta, 5);
    match client.value("Missing", Kind::Gauge) {
        Err(TransportError::Rejected(reason)) => assert_eq!(reason, "metric not found"),
        other => panic!("unexpected {:?}", other),
    }
    server.shutdown();
}

#[test]
fn invalid_batch_is_rejected_whole() {
    let (storage, server) = server();
    let client = RpcClient::new(&server.local_addr().to_string());
    let request = Request::BatchUpdate(vec![
        RpcMetric {
            id: "Alloc".to_string(),
            kind: Kind::Gauge,
            delta: 0,
            value: 1.0,
        },
        RpcMetric {
            id: String::new(),
            kind: Kind::Counter,
            delta: 1,
            value: 0.0,
        },
    ]);
    let response = client.call(&request).unwrap();
    assert!(response.error.is_some());
    assert_eq!(storage.gauge("Alloc").unwrap(), None);
    server.shutdown();
}

#[test]
fn garbage_frame_closes_connection() {
    let (storage, server) = server();
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    // a well-formed length prefix around a payload bincode cannot decode as
    // a Request
    write_frame(&mut stream, &u32::MAX).unwrap();
    let mut buf = Vec::new();
    assert_eq!(stream.read_to_end(&mut buf).unwrap(), 0);

    // the server keeps accepting
    let client = RpcClient::new(&server.local_addr().to_string());
    client.send_one(&Sample::gauge("Alloc", 2.0)).unwrap();
    assert_eq!(storage.gauge("Alloc").unwrap(), Some(2.0));
    server.shutdown();
}

#[test]
fn client_reconnects_after_server_restart() {
    let storage = Arc::new(MemStorage::new());
    let first = RpcServer::start("127.0.0.1:0", storage.clone() as Arc<dyn Storage>).unwrap();
    let addr = first.local_addr();
    let client = RpcClient::new(&addr.to_string());
    client.send_one(&Sample::counter("PollCount", 1)).unwrap();
    first.shutdown();

    let second = RpcServer::start(&addr.to_string(), storage.clone() as Arc<dyn Storage>).unwrap();
    // the old connection is gone; the first call may fail, the next dials again
    let _ = client.send_one(&Sample::counter("PollCount", 1));
    client.send_one(&Sample::counter("PollCount", 1)).unwrap();
    assert!(storage.counter("PollCount").unwrap() >= Some(2));
    second.shutdown();
}

#[test]
fn agent_pipeline_over_rpc() {
    let (storage, server) = server();
    let client: Arc<dyn Client> = Arc::new(RpcClient::new(&server.local_addr().to_string()));
    let config = PoolConfig {
        poll_interval: Duration::from_millis(50),
        report_interval: Duration::from_millis(120),
        retry: Policy::once(),
        ..PoolConfig::default()
    };
    let pool = Pool::start(client, Arc::new(Accumulator::new()), Sampler::new(), config).unwrap();
    thread::sleep(Duration::from_millis(400));
    assert!(pool.shutdown(Duration::from_secs(5)).abandoned.is_empty());
    assert!(storage.counter("PollCount").unwrap().unwrap_or(0) > 0);
    server.shutdown();
}
