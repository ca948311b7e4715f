//! Metrika is a runtime metrics agent paired with a small collector server.
//! The agent samples allocator, process and host statistics on a fixed
//! schedule, buffers them and delivers them over HTTP or a length-prefixed RPC
//! transport. The server keeps the latest value of every gauge and the running
//! total of every counter, either in memory with periodic snapshots to disk or
//! in a SQLite database.
//!
//! Why you might choose to use metrika:
//!
//!  * You want process telemetry pushed from many hosts to one place.
//!  * You need payloads signed, encrypted or both on an untrusted network.
//!  * You want a collector that survives restarts without a database.
//!
//! The crate is split so that every piece can be driven without the
//! binaries: the `Sampler`, `Accumulator` and `Pool` make up the agent, the
//! `storage` and `server` modules make up the collector.
#![allow(unknown_lints)]
#![deny(unstable_features, unused_import_braces)]
#![warn(missing_docs, trivial_numeric_casts)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
#[macro_use]
extern crate lazy_static;

pub mod accumulator;
pub mod config;
pub mod constants;
pub mod logging;
pub mod metric;
pub mod pool;
pub mod retry;
pub mod sampler;
pub mod security;
pub mod server;
pub mod storage;
pub mod time;
pub mod transport;
