#![allow(unknown_lints)]

#[macro_use]
extern crate log;

use metrika::config::{self, ServerConfig};
use metrika::logging;
use metrika::retry::Policy;
use metrika::security::{load_private_key, Chain, Crypto, Signer};
use metrika::server::{HttpServer, RpcServer, Service};
use metrika::storage::{FileBackuper, MemStorage, Snapshotter, SqlStorage, Storage};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::Arc;
use std::time::Duration;

const HTTP_WORKERS: usize = 4;

fn storage(args: &ServerConfig) -> Result<Arc<dyn Storage>, String> {
    let storage: Arc<dyn Storage> = match args.database_dsn {
        Some(ref dsn) => Arc::new(SqlStorage::open(dsn, Policy::default()).map_err(|e| e.to_string())?),
        None => {
            let backuper = FileBackuper::new(&args.file_storage_path);
            let sync_backup = args.store_interval == Duration::from_secs(0);
            Arc::new(MemStorage::with_backuper(backuper, sync_backup))
        }
    };
    if args.restore {
        storage.restore().map_err(|e| format!("restore failed: {}", e))?;
    }
    Ok(storage)
}

fn service(args: &ServerConfig, storage: Arc<dyn Storage>) -> Result<Service, String> {
    let crypto = match args.crypto_key {
        Some(ref path) => Some(Crypto::Private(load_private_key(path).map_err(|e| e.to_string())?)),
        None => None,
    };
    let key = args.key.as_ref().map(|k| k.as_bytes());
    let chain = Chain::standard(key, crypto).map_err(|e| e.to_string())?;
    debug!("security chain: {:?}", chain.stages());
    let mut service = Service::new(storage).with_chain(chain);
    if let Some(key) = key {
        service = service.with_signer(Signer::new(key).map_err(|e| e.to_string())?);
    }
    if let Some(subnet) = args.trusted_subnet {
        info!("accepting requests from {} only", subnet);
        service = service.with_subnet(subnet);
    }
    Ok(service)
}

fn bail<E: std::fmt::Display>(what: &str, e: E) -> ! {
    error!("{}: {}", what, e);
    process::exit(1);
}

fn main() {
    let args = match config::parse_server_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("metrika-server: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = logging::init(args.verbose) {
        eprintln!("metrika-server: could not install logger: {}", e);
        process::exit(1);
    }
    info!(
        "metrika-server {} on {}, {} storage",
        env!("CARGO_PKG_VERSION"),
        args.address,
        if args.database_dsn.is_some() { "sql" } else { "memory" }
    );

    let storage = storage(&args).unwrap_or_else(|e| bail("could not open storage", e));
    let mut signals = Signals::new(&[SIGINT, SIGTERM]).unwrap_or_else(|e| bail("could not register signal handlers", e));

    let snapshotter = if args.database_dsn.is_none() && args.store_interval > Duration::from_secs(0) {
        Some(
            Snapshotter::start(Arc::clone(&storage), args.store_interval)
                .unwrap_or_else(|e| bail("could not start snapshotter", e)),
        )
    } else {
        None
    };
    let service = service(&args, Arc::clone(&storage)).unwrap_or_else(|e| bail("could not configure security", e));
    let http = HttpServer::start(&args.address, service, HTTP_WORKERS)
        .unwrap_or_else(|e| bail(&format!("could not listen on {}", args.address), e));
    let rpc = args.rpc_address.as_ref().map(|address| {
        RpcServer::start(address, Arc::clone(&storage))
            .unwrap_or_else(|e| bail(&format!("could not listen on {}", address), e))
    });

    if let Some(sig) = signals.forever().next() {
        info!("received signal {}, shutting down", sig);
    }
    http.shutdown();
    if let Some(rpc) = rpc {
        rpc.shutdown();
    }
    if let Some(snapshotter) = snapshotter {
        snapshotter.shutdown();
    }
    if let Err(e) = storage.backup() {
        error!("final snapshot failed: {}", e);
    }
    if let Err(e) = storage.close() {
        error!("closing storage failed: {}", e);
    }
    info!("metrika-server stopped");
}
