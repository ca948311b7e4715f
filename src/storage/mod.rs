//! Server side metric storage.
//!
//! Gauges keep their last written value, counters the sum of every delta
//! written to them. Gauge and counter names are separate namespaces. Two
//! backends implement `Storage`:
//!
//!  * `MemStorage`, two maps behind one mutex, made durable by snapshots to a
//!    JSON file through `FileBackuper`;
//!  * `SqlStorage`, a SQLite table written in transactions.
//!
//! Batch upserts are all or nothing on both.
use crate::metric::{Metrics, ProtocolError, Update};
use std::collections::BTreeMap;
use std::io;

mod backup;
mod memory;
mod snapshot;
mod sql;

pub use self::backup::{FileBackuper, Snapshot};
pub use self::memory::MemStorage;
pub use self::snapshot::Snapshotter;
pub use self::sql::SqlStorage;

/// Errors raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend was closed, or never opened.
    #[error("storage is not initialized")]
    Uninitialized,
    /// A record failed validation.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Adding the delta would overflow the counter.
    #[error("counter {id:?} would overflow adding {delta}")]
    Overflow {
        /// Counter name.
        id: String,
        /// Rejected delta.
        delta: i64,
    },
    /// The database refused the operation.
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
    /// Snapshot file I/O failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// A snapshot file could not be encoded or decoded.
    #[error("snapshot encoding: {0}")]
    Serde(#[from] serde_json::Error),
    /// The backend does not support this operation.
    #[error("{0} is not supported by this backend")]
    Unsupported(&'static str),
}

impl StorageError {
    /// Whether the caller sent something invalid, as opposed to the backend
    /// failing.
    pub fn is_client_error(&self) -> bool {
        matches!(*self, StorageError::Protocol(_) | StorageError::Overflow { .. })
    }
}

/// Operations every backend provides.
pub trait Storage: Send + Sync {
    /// Replace the gauge `name`.
    fn set_gauge(&self, name: &str, value: f64) -> Result<(), StorageError>;
    /// Add `delta` to the counter `name`, returning the new total.
    fn set_counter(&self, name: &str, delta: i64) -> Result<i64, StorageError>;
    /// The current value of gauge `name`.
    fn gauge(&self, name: &str) -> Result<Option<f64>, StorageError>;
    /// The running total of counter `name`.
    fn counter(&self, name: &str) -> Result<Option<i64>, StorageError>;
    /// Every gauge.
    fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError>;
    /// Every counter.
    fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError>;
    /// Apply every record, or none of them.
    fn batch_upsert(&self, batch: &[Metrics]) -> Result<(), StorageError>;

    /// Persist a snapshot, where the backend keeps one.
    fn backup(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Load the last snapshot, where the backend keeps one.
    fn restore(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Check the backend is reachable. Backends without a remote end answer
    /// `Unsupported`.
    fn ping(&self) -> Result<(), StorageError> {
        Err(StorageError::Unsupported("ping"))
    }

    /// Release the backend. Later calls fail with `Uninitialized`.
    fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Apply one wire record, returning the record as stored: counters carry
/// their running total in `delta`.
pub fn apply(storage: &dyn Storage, record: &Metrics) -> Result<Metrics, StorageError> {
    match record.update()? {
        Update::Gauge { id, value } => {
            storage.set_gauge(id, value)?;
            Ok(Metrics::gauge(id, value))
        }
        Update::Counter { id, delta } => {
            let total = storage.set_counter(id, delta)?;
            Ok(Metrics::counter(id, total))
        }
    }
}

/// Validate a whole batch before touching anything.
pub(crate) fn validate(batch: &[Metrics]) -> Result<Vec<Update>, StorageError> {
    batch.iter().map(|m| m.update().map_err(StorageError::from)).collect()
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour both backends must share.
    use super::*;
    use std::sync::Arc;
    use std::thread;

    pub fn gauge_is_last_write(s: &dyn Storage) {
        s.set_gauge("Alloc", 1.0).unwrap();
        s.set_gauge("Alloc", 134024.0).unwrap();
        assert_eq!(s.gauge("Alloc").unwrap(), Some(134024.0));
        assert_eq!(s.gauge("Frees").unwrap(), None);
    }

    pub fn counter_accumulates(s: &dyn Storage) {
        assert_eq!(s.set_counter("PollCount", 3).unwrap(), 3);
        assert_eq!(s.set_counter("PollCount", -1).unwrap(), 2);
        assert_eq!(s.counter("PollCount").unwrap(), Some(2));
        assert_eq!(s.counter("Missing").unwrap(), None);
    }

    pub fn kinds_are_separate(s: &dyn Storage) {
        s.set_gauge("x", 1.5).unwrap();
        s.set_counter("x", 2).unwrap();
        assert_eq!(s.gauge("x").unwrap(), Some(1.5));
        assert_eq!(s.counter("x").unwrap(), Some(2));
        assert_eq!(s.gauges().unwrap().len(), 1);
        assert_eq!(s.counters().unwrap().len(), 1);
    }

    pub fn overflow_is_rejected(s: &dyn Storage) {
        s.set_counter("big", i64::MAX).unwrap();
        match s.set_counter("big", 1) {
            Err(StorageError::Overflow { .. }) => {}
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(s.counter("big").unwrap(), Some(i64::MAX));
    }

    pub fn batch_applies(s: &dyn Storage) {
        let batch = vec![
            Metrics::gauge("Alloc", 134024.0),
            Metrics::counter("PollCount", 1),
            Metrics::counter("PollCount", 1),
        ];
        s.batch_upsert(&batch).unwrap();
        assert_eq!(s.gauge("Alloc").unwrap(), Some(134024.0));
        assert_eq!(s.counter("PollCount").unwrap(), Some(2));
    }

    pub fn bad_batch_persists_nothing(s: &dyn Storage) {
        let bad_type = vec![
            Metrics::gauge("Alloc", 1.0),
            Metrics {
                id: "x".into(),
                mtype: "summary".into(),
                delta: None,
                value: Some(1.0),
            },
        ];
        assert!(s.batch_upsert(&bad_type).unwrap_err().is_client_error());
        let missing = vec![
            Metrics::counter("PollCount", 1),
            Metrics {
                id: "y".into(),
                mtype: "gauge".into(),
                delta: Some(1),
                value: None,
            },
        ];
        assert!(s.batch_upsert(&missing).is_err());
        s.set_counter("edge", i64::MAX - 1).unwrap();
        let overflow = vec![
            Metrics::gauge("Sys", 2.0),
            Metrics::counter("edge", 1),
            Metrics::counter("edge", 1),
        ];
        match s.batch_upsert(&overflow) {
            Err(StorageError::Overflow { .. }) => {}
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(s.gauge("Alloc").unwrap(), None);
        assert_eq!(s.gauge("Sys").unwrap(), None);
        assert_eq!(s.counter("PollCount").unwrap(), None);
        assert_eq!(s.counter("edge").unwrap(), Some(i64::MAX - 1));
    }

    pub fn closed_is_uninitialized(s: &dyn Storage) {
        s.close().unwrap();
        match s.set_gauge("Alloc", 1.0) {
            Err(StorageError::Uninitialized) => {}
            other => panic!("expected uninitialized, got {:?}", other),
        }
        assert!(s.counters().is_err());
    }

    pub fn concurrent_counters_sum(s: Arc<dyn Storage>) {
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&s);
                thread::spawn(move || {
                    for _ in 0..50 {
                        s.set_counter("PollCount", 1).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(s.counter("PollCount").unwrap(), Some(400));
    }

    /// Apply `deltas` in order, returning the final total.
    pub fn sum_in_order(s: &dyn Storage, deltas: &[i32]) -> Option<i64> {
        for d in deltas {
            s.set_counter("c", i64::from(*d)).unwrap();
        }
        s.counter("c").unwrap()
    }
}
