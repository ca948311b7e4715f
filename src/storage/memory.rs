use super::{validate, FileBackuper, Snapshot, Storage, StorageError};
use crate::metric::{Metrics, Update};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
struct Tables {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl Tables {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            gauges: self.gauges.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            counters: self.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }
}

fn checked_add(id: &str, total: i64, delta: i64) -> Result<i64, StorageError> {
    total.checked_add(delta).ok_or_else(|| StorageError::Overflow {
        id: id.to_string(),
        delta,
    })
}

/// In-memory storage, optionally backed by a snapshot file.
///
/// Every operation takes the one mutex guarding both maps. With a zero store
/// interval each write also rewrites the snapshot before the lock is
/// released, so the file never lags the maps. A write whose snapshot fails
/// is not applied.
#[derive(Debug)]
pub struct MemStorage {
    tables: Mutex<Option<Tables>>,
    backuper: Option<FileBackuper>,
    sync_backup: bool,
}

impl Default for MemStorage {
    fn default() -> MemStorage {
        MemStorage::new()
    }
}

impl MemStorage {
    /// Volatile storage with no snapshot file.
    pub fn new() -> MemStorage {
        MemStorage {
            tables: Mutex::new(Some(Tables::default())),
            backuper: None,
            sync_backup: false,
        }
    }

    /// Storage snapshotting to `backuper`. When `sync_backup` is set every
    /// write is persisted before it returns.
    pub fn with_backuper(backuper: FileBackuper, sync_backup: bool) -> MemStorage {
        MemStorage {
            tables: Mutex::new(Some(Tables::default())),
            backuper: Some(backuper),
            sync_backup,
        }
    }

    fn read<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Tables) -> T,
    {
        let guard = self.tables.lock();
        guard.as_ref().map(f).ok_or(StorageError::Uninitialized)
    }

    fn write<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Tables) -> Result<T, StorageError>,
    {
        let mut guard = self.tables.lock();
        let tables = guard.as_mut().ok_or(StorageError::Uninitialized)?;
        match self.backuper {
            Some(ref backuper) if self.sync_backup => {
                // the maps only change once the snapshot holding the write
                // is on disk
                let mut staged = tables.clone();
                let out = f(&mut staged)?;
                backuper.backup(&staged.snapshot())?;
                *tables = staged;
                Ok(out)
            }
            _ => f(tables),
        }
    }
}

impl Storage for MemStorage {
    fn set_gauge(&self, name: &str, value: f64) -> Result<(), StorageError> {
        self.write(|t| {
            t.gauges.insert(name.to_string(), value);
            Ok(())
        })
    }

    fn set_counter(&self, name: &str, delta: i64) -> Result<i64, StorageError> {
        self.write(|t| {
            let current = t.counters.get(name).cloned().unwrap_or(0);
            let total = checked_add(name, current, delta)?;
            t.counters.insert(name.to_string(), total);
            Ok(total)
        })
    }

    fn gauge(&self, name: &str) -> Result<Option<f64>, StorageError> {
        self.read(|t| t.gauges.get(name).cloned())
    }

    fn counter(&self, name: &str) -> Result<Option<i64>, StorageError> {
        self.read(|t| t.counters.get(name).cloned())
    }

    fn gauges(&self) -> Result<BTreeMap<String, f64>, StorageError> {
        self.read(|t| t.snapshot().gauges)
    }

    fn counters(&self) -> Result<BTreeMap<String, i64>, StorageError> {
        self.read(|t| t.snapshot().counters)
    }

    fn batch_upsert(&self, batch: &[Metrics]) -> Result<(), StorageError> {
        let updates = validate(batch)?;
        self.write(|t| {
            // stage counter totals first so an overflow leaves the maps as
            // they were
            let mut staged: HashMap<&str, i64> = HashMap::new();
            for update in &updates {
                if let Update::Counter { id, delta } = *update {
                    let current = match staged.get(id) {
                        Some(total) => *total,
                        None => t.counters.get(id).cloned().unwrap_or(0),
                    };
                    staged.insert(id, checked_add(id, current, delta)?);
                }
            }
            for update in &updates {
                if let Update::Gauge { id, value } = *update {
                    t.gauges.insert(id.to_string(), value);
                }
            }
            for (id, total) in staged {
                t.counters.insert(id.to_string(), total);
            }
            Ok(())
        })
    }

    fn backup(&self) -> Result<(), StorageError> {
        let backuper = match self.backuper {
            Some(ref b) => b,
            None => return Ok(()),
        };
        // copy under the lock, write outside it
        let snapshot = self.read(Tables::snapshot)?;
        backuper.backup(&snapshot)
    }

    fn restore(&self) -> Result<(), StorageError> {
        let backuper = match self.backuper {
            Some(ref b) => b,
            None => return Ok(()),
        };
        let snapshot = backuper.restore()?;
        let mut guard = self.tables.lock();
        let tables = guard.as_mut().ok_or(StorageError::Uninitialized)?;
        info!(
            "restored {} gauges and {} counters from {}",
            snapshot.gauges.len(),
            snapshot.counters.len(),
            backuper.path().display()
        );
        tables.gauges.extend(snapshot.gauges);
        tables.counters.extend(snapshot.counters);
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.tables.lock().take();
        Ok(())
    }
}
