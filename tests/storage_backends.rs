use metrika::metric::Metrics;
use metrika::retry::Policy;
use metrika::storage::{self, FileBackuper, MemStorage, Snapshotter, SqlStorage, Storage, StorageError};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempdir::TempDir;

fn backends(dir: &TempDir) -> Vec<(&'static str, Arc<dyn Storage>)> {
    let backuper = FileBackuper::new(dir.path().join("metrics-db.json"));
    let dsn = dir.path().join("metrics.sqlite");
    vec![
        ("memory", Arc::new(MemStorage::with_backuper(backuper, false))),
        ("sql", Arc::new(SqlStorage::open(dsn.to_str().unwrap(), Policy::once()).unwrap())),
    ]
}

#[test]
fn backends_agree() {
    let dir = TempDir::new("metrika-backends").unwrap();
    for (name, s) in backends(&dir) {
        let stored = storage::apply(&*s, &Metrics::counter("PollCount", 4)).unwrap();
        assert_eq!(stored, Metrics::counter("PollCount", 4), "{}", name);
        let stored = storage::apply(&*s, &Metrics::counter("PollCount", 6)).unwrap();
        assert_eq!(stored, Metrics::counter("PollCount", 10), "{}", name);

        s.batch_upsert(&[Metrics::gauge("Alloc", 1.0), Metrics::gauge("Alloc", 2.0)]).unwrap();
        assert_eq!(s.gauge("Alloc").unwrap(), Some(2.0), "{}", name);

        let mut unknown = Metrics::gauge("Sys", 1.0);
        unknown.mtype = "histogram".to_string();
        match s.batch_upsert(&[Metrics::gauge("Frees", 3.0), unknown]) {
            Err(ref e) if e.is_client_error() => {}
            other => panic!("{}: unexpected {:?}", name, other),
        }
        assert_eq!(s.gauge("Frees").unwrap(), None, "{}", name);

        s.close().unwrap();
        match s.gauges() {
            Err(StorageError::Uninitialized) => {}
            other => panic!("{}: unexpected {:?}", name, other),
        }
    }
}

#[test]
fn memory_storage_survives_restart() {
    let dir = TempDir::new("metrika-restart").unwrap();
    let path = dir.path().join("nested").join("metrics-db.json");
    {
        let s: Arc<dyn Storage> = Arc::new(MemStorage::with_backuper(FileBackuper::new(&path), false));
        s.restore().unwrap();
        s.set_gauge("Alloc", 134024.0).unwrap();
        s.set_counter("PollCount", 9).unwrap();
        let snapshotter = Snapshotter::start(Arc::clone(&s), Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(100));
        snapshotter.shutdown();
        s.backup().unwrap();
        s.close().unwrap();
    }
    assert!(fs::metadata(&path).unwrap().len() > 0);

    let s = MemStorage::with_backuper(FileBackuper::new(&path), false);
    s.restore().unwrap();
    assert_eq!(s.gauge("Alloc").unwrap(), Some(134024.0));
    assert_eq!(s.set_counter("PollCount", 1).unwrap(), 10);
}

#[test]
fn corrupt_snapshot_fails_restore() {
    let dir = TempDir::new("metrika-corrupt").unwrap();
    let path = dir.path().join("metrics-db.json");
    fs::write(&path, b"{ not json").unwrap();
    let s = MemStorage::with_backuper(FileBackuper::new(&path), false);
    assert!(s.restore().is_err());
}
