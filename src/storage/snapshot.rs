use super::Storage;
use crossbeam_channel::{bounded, select, tick, Sender};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Calls `Storage::backup` every `interval` on its own thread.
///
/// Failures are logged and the next tick tries again.
pub struct Snapshotter {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Snapshotter {
    /// Start snapshotting `storage`.
    pub fn start(storage: Arc<dyn Storage>, interval: Duration) -> io::Result<Snapshotter> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new().name("metrika-snapshot".to_string()).spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if let Err(e) = storage.backup() {
                            error!("periodic snapshot failed: {}", e);
                        }
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            trace!("snapshotter stopped");
        })?;
        info!("snapshotting every {:?}", interval);
        Ok(Snapshotter {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for a snapshot in progress to finish.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("snapshot thread panicked");
            }
        }
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
