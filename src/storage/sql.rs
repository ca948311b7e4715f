use super::{validate, Storage, StorageError};
use crate::metric::{Metrics, Update};
use crate::retry::{self, Policy};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::time::Duration;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS metrics (
    id TEXT NOT NULL,
    mtype TEXT NOT NULL,
    value DOUBLE PRECISION,
    delta BIGINT,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (id, mtype)
)";

const UPSERT_GAUGE: &str = "INSERT INTO metrics (id, mtype, value) VALUES (?1, 'gauge', ?2)
    ON CONFLICT (id, mtype) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP";

const UPSERT_COUNTER: &str = "INSERT INTO metrics (id, mtype, delta) VALUES (?1, 'counter', ?2)
    ON CONFLICT (id, mtype) DO UPDATE SET delta = excluded.delta, updated_at = CURRENT_TIMESTAMP";

const SELECT_GAUGE: &str = "SELECT value FROM metrics WHERE id = ?1 AND mtype = 'gauge'";
const SELECT_COUNTER: &str = "SELECT delta FROM metrics WHERE id = ?1 AND mtype = 'counter'";
const SELECT_GAUGES: &str = "SELECT id, value FROM metrics WHERE mtype = 'gauge' ORDER BY id";
const SELECT_COUNTERS: &str = "SELECT id, delta FROM metrics WHERE mtype = 'counter' ORDER BY id";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a failure is about reaching the database rather than the
/// statement, and so worth retrying.
fn is_transient(e: &StorageError) -> bool {
    match *e {
        StorageError::Database(rusqlite::Error::SqliteFailure(ref err, _)) => matches!(
            err.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen | ErrorCode::SystemIoFailure
        ),
        _ => false,
    }
}

fn gauge_upsert(conn: &Connection, id: &str, value: f64) -> Result<(), StorageError> {
    conn.execute(UPSERT_GAUGE, params![id, value])?;
    Ok(())
}

/// Read, check and write the counter total. Callers hold a transaction.
fn counter_add(conn: &Connection, id: &str, delta: i64) -> Result<i64, StorageError> {
    let current: Option<i64> = conn
        .query_row(SELECT_COUNTER, params![id], |row| row.get(0))
        .optional()?;
    let total = current.unwrap_or(0).checked_add(delta).ok_or_else(|| StorageError::Overflow {
        id: id.to_string(),
        delta,
    })?;
    conn.execute(UPSERT_COUNTER, params![id, total])?;
    Ok(total)
}

/// Storage in a SQLite database.
///
/// One connection, serialized by a mutex. Writes that read before they
/// write run in an immediate transaction. Failures to reach the database are
/// retried under `policy`; everything else is returned as is.
pub struct SqlStorage {
    dsn: String,
    conn: Mutex<Option<Connection>>,
    policy: Policy,
}

impl SqlStorage {
    /// Open the database at `dsn` (a file path, or `:memory:`), creating the
    /// `metrics` table if it does not exist.
    pub fn open(dsn: &str, policy: Policy) -> Result<SqlStorage, StorageError> {
        let conn = retry::with_backoff(
            &policy,
            |attempt| {
                trace!("opening {} (attempt {})", dsn, attempt);
                let conn = if dsn == ":memory:" {
                    Connection::open_in_memory()?
                } else {
                    Connection::open(dsn)?
                };
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch(SCHEMA)?;
                Ok(conn)
            },
            is_transient,
        )?;
        info!("opened database {}", dsn);
        Ok(SqlStorage {
            dsn: dsn.to_string(),
            conn: Mutex::new(Some(conn)),
            policy,
        })
    }

    fn with_conn<T, F>(&self, mut f: F) -> Result<T, StorageError>
    where
        F: FnMut(&mut Connection) -> Result<T, StorageError>,
    {
        retry::with_backoff(
            &self.policy,
            |_| {
                let mut guard = self.conn.lock();
                let conn = guard.as_mut().ok_or(StorageError::Uninitialized)?;
                f(conn)
            },
            is_transient,
        )
    }

    fn select_all<T>(&self, sql: &str) -> Result<BTreeMap<String, T>, StorageError>
    where
        T: rusqlite::types::FromSql,
    {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, T>(1)?)))?;
            let mut out = BTreeMap::new();
            for row in rows {
                let (id, v) = row?;
                out.insert(id, v);
            }
            Ok(out)
        })
    }
}

impl Storage for SqlStorage {
    fn set_gauge(&self, name: &str, value: f64) -> Result<(), StorageError> {
        self.with_conn(|conn| gauge_upsert(conn, name, value))
    }

    fn set_counter(&self, name: &str, delta: i64) -> Result<i64, StorageError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let total = counter_add(&tx, name, delta)?;
            tx.commit()?;
            Ok(total)
        })
    }

    fn gauge(&self, name: &str) -> Result<Option<f64>, StorageError> {
        self.with_conn(|conn| Ok(conn.query_row(SELECT_GAUGE, params![name], |row| row.get(0)).optional()?))
    }

    fn counter(&self, name: &str) -> Result<Option<i64>, StorageError> {
        self.with_conn(|conn| Ok(conn.query_row(SELECT_COUNTER, params![name], |row| row.get(0)).optional()?))
    }

    fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError> {
        self.select_all(SELECT_GAUGES)
    }

    fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        self.select_all(SELECT_COUNTERS)
    }

    /// One transaction for the whole batch; any failure rolls it back.
    fn batch_upsert(&self, batch: &[Metrics]) -> Result<(), StorageError> {
        let updates = validate(batch)?;
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for update in &updates {
                match *update {
                    Update::Gauge { id, value } => gauge_upsert(&tx, id, value)?,
                    Update::Counter { id, delta } => {
                        counter_add(&tx, id, delta)?;
                    }
                }
            }
            // dropping an uncommitted transaction rolls it back
            tx.commit()?;
            Ok(())
        })
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn close(&self) -> Result<(), StorageError> {
        match self.conn.lock().take() {
            Some(conn) => {
                debug!("closing database {}", self.dsn);
                conn.close().map_err(|(_, e)| StorageError::from(e))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::conformance;
    use super::*;
    use std::sync::Arc;
    use tempdir::TempDir;

    fn memory() -> SqlStorage {
        SqlStorage::open(":memory:", Policy::once()).unwrap()
    }

    #[test]
    fn test_conformance() {
        conformance::gauge_is_last_write(&memory());
        conformance::counter_accumulates(&memory());
        conformance::kinds_are_separate(&memory());
        conformance::overflow_is_rejected(&memory());
        conformance::batch_applies(&memory());
        conformance::bad_batch_persists_nothing(&memory());
        conformance::closed_is_uninitialized(&memory());
        conformance::concurrent_counters_sum(Arc::new(memory()));
    }

    #[test]
    fn test_counter_sum_is_order_independent() {
        let forward = memory();
        let backward = memory();
        let deltas = vec![5, -3, i32::MAX, i32::MIN, 17, 0, -1];
        let mut reversed = deltas.clone();
        reversed.reverse();
        let expected: i64 = deltas.iter().map(|d| i64::from(*d)).sum();
        assert_eq!(conformance::sum_in_order(&forward, &deltas), Some(expected));
        assert_eq!(conformance::sum_in_order(&backward, &reversed), Some(expected));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new("metrika-sql").unwrap();
        let path = dir.path().join("metrics.sqlite");
        let dsn = path.to_str().unwrap();
        {
            let s = SqlStorage::open(dsn, Policy::once()).unwrap();
            s.set_gauge("Alloc", 134024.0).unwrap();
            s.set_counter("PollCount", 2).unwrap();
            s.close().unwrap();
        }
        let s = SqlStorage::open(dsn, Policy::once()).unwrap();
        assert_eq!(s.gauge("Alloc").unwrap(), Some(134024.0));
        assert_eq!(s.set_counter("PollCount", 3).unwrap(), 5);
        // backup and restore leave the database alone
        s.backup().unwrap();
        s.restore().unwrap();
        assert_eq!(s.counters().unwrap().get("PollCount"), Some(&5));
    }

    #[test]
    fn test_ping() {
        let s = memory();
        s.ping().unwrap();
        s.close().unwrap();
        match s.ping() {
            Err(StorageError::Uninitialized) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transient_classification() {
        let busy = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(is_transient(&busy));
        let constraint = StorageError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        ));
        assert!(!is_transient(&constraint));
        assert!(!is_transient(&StorageError::Uninitialized));
    }

    #[test]
    fn test_unopenable_path_fails() {
        let policy = Policy {
            max_attempts: 2,
            unit: Duration::from_millis(1),
        };
        assert!(SqlStorage::open("/nonexistent/dir/metrics.sqlite", policy).is_err());
    }
}
