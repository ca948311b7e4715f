#![allow(unknown_lints)]

#[macro_use]
extern crate log;

use metrika::accumulator::Accumulator;
use metrika::config::{self, AgentConfig, Transport};
use metrika::logging;
use metrika::pool::{Pool, PoolConfig};
use metrika::sampler::{CountingAlloc, Sampler};
use metrika::security::{load_public_key, Chain, Crypto};
use metrika::transport::{self, Client, HttpClient, RpcClient};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::Arc;

#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

fn client(args: &AgentConfig) -> Result<Arc<dyn Client>, String> {
    match args.transport {
        Transport::Rpc => Ok(Arc::new(RpcClient::new(&args.address))),
        Transport::Http => {
            let crypto = match args.crypto_key {
                Some(ref path) => Some(Crypto::Public(load_public_key(path).map_err(|e| e.to_string())?)),
                None => None,
            };
            let chain = Chain::standard(args.key.as_ref().map(|k| k.as_bytes()), crypto).map_err(|e| e.to_string())?;
            let local_ip = match args.local_ip {
                Some(ref ip) => ip.clone(),
                None => transport::local_ip(&args.address).to_string(),
            };
            debug!("security chain: {:?}, X-Real-IP {}", chain.stages(), local_ip);
            let client = HttpClient::new(&args.address, &local_ip, chain).map_err(|e| e.to_string())?;
            Ok(Arc::new(client))
        }
    }
}

fn main() {
    let args = match config::parse_agent_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("metrika-agent: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = logging::init(args.verbose) {
        eprintln!("metrika-agent: could not install logger: {}", e);
        process::exit(1);
    }
    info!(
        "metrika-agent {} reporting to {} over {:?}",
        env!("CARGO_PKG_VERSION"),
        args.address,
        args.transport
    );

    let client = match client(&args) {
        Ok(c) => c,
        Err(e) => {
            error!("could not build {:?} client for {}: {}", args.transport, args.address, e);
            process::exit(1);
        }
    };
    let mut signals = match Signals::new(&[SIGINT, SIGTERM]) {
        Ok(s) => s,
        Err(e) => {
            error!("could not register signal handlers: {}", e);
            process::exit(1);
        }
    };
    let pool_config = PoolConfig {
        poll_interval: args.poll_interval,
        report_interval: args.report_interval,
        workers: args.rate_limit,
        retry: args.retry,
        ..PoolConfig::default()
    };
    let pool = match Pool::start(client, Arc::new(Accumulator::new()), Sampler::new(), pool_config) {
        Ok(p) => p,
        Err(e) => {
            error!("could not start delivery pool: {}", e);
            process::exit(1);
        }
    };

    if let Some(sig) = signals.forever().next() {
        info!("received signal {}, shutting down", sig);
    }
    let stats = pool.stats();
    let report = pool.shutdown(args.shutdown_grace);
    info!(
        "delivered {} batches, {} failed, {} attempts",
        stats.delivered(),
        stats.failed(),
        stats.attempts()
    );
    if !report.abandoned.is_empty() {
        warn!("abandoned after {:?}: {:?}", args.shutdown_grace, report.abandoned);
        process::exit(1);
    }
}
