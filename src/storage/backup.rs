use super::StorageError;
use crate::metric::{Metrics, Update};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Every gauge and counter at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Gauge values.
    pub gauges: BTreeMap<String, f64>,
    /// Counter totals.
    pub counters: BTreeMap<String, i64>,
}

impl Snapshot {
    /// Whether the snapshot holds nothing.
    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }

    /// The snapshot as wire records, gauges first, each kind sorted by name.
    pub fn to_records(&self) -> Vec<Metrics> {
        let gauges = self.gauges.iter().map(|(id, v)| Metrics::gauge(id.as_str(), *v));
        let counters = self.counters.iter().map(|(id, d)| Metrics::counter(id.as_str(), *d));
        gauges.chain(counters).collect()
    }

    /// Rebuild a snapshot from wire records. A record repeated in the file
    /// replaces the earlier one; counters hold totals here, not deltas.
    pub fn from_records(records: &[Metrics]) -> Result<Snapshot, StorageError> {
        let mut snapshot = Snapshot::default();
        for record in records {
            match record.update()? {
                Update::Gauge { id, value } => {
                    snapshot.gauges.insert(id.to_string(), value);
                }
                Update::Counter { id, delta } => {
                    snapshot.counters.insert(id.to_string(), delta);
                }
            }
        }
        Ok(snapshot)
    }
}

/// Writes and reads snapshot files: a JSON array of wire records.
#[derive(Debug, Clone)]
pub struct FileBackuper {
    path: PathBuf,
}

impl FileBackuper {
    /// A backuper for the file at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> FileBackuper {
        FileBackuper {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// The snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write `snapshot`, replacing the file atomically: the data goes to a
    /// sibling `.tmp` file which is synced and then renamed over the target.
    pub fn backup(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(&snapshot.to_records())?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.tmp_path();
        {
            let mut fp = fs::File::create(&tmp)?;
            fp.write_all(&body)?;
            fp.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(
            "wrote snapshot of {} gauges and {} counters to {}",
            snapshot.gauges.len(),
            snapshot.counters.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Read the last snapshot. A missing or empty file is a cold start and
    /// yields an empty snapshot.
    pub fn restore(&self) -> Result<Snapshot, StorageError> {
        let body = match fs::read(&self.path) {
            Ok(body) => body,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no snapshot at {}, starting cold", self.path.display());
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(e.into()),
        };
        if body.iter().all(u8::is_ascii_whitespace) {
            info!("snapshot {} is empty, starting cold", self.path.display());
            return Ok(Snapshot::default());
        }
        let records: Vec<Metrics> = serde_json::from_slice(&body)?;
        Snapshot::from_records(&records)
    }
}
