//! A buffer of collections waiting for the report schedule.
use crate::metric::Collection;
use parking_lot::Mutex;
use std::mem;

/// Pending collections, appended by the poller and drained by the reporter.
///
/// There is no eviction: an accumulator that is never drained grows without
/// bound.
#[derive(Debug, Default)]
pub struct Accumulator {
    pending: Mutex<Vec<Collection>>,
}

impl Accumulator {
    /// An empty accumulator.
    pub fn new() -> Accumulator {
        Accumulator::default()
    }

    /// Append a collection.
    pub fn add(&self, collection: Collection) {
        self.pending.lock().push(collection);
    }

    /// Take everything pending, leaving the accumulator empty.
    pub fn drain(&self) -> Vec<Collection> {
        mem::replace(&mut *self.pending.lock(), Vec::new())
    }

    /// Number of pending collections.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metric::Sample;
    use std::sync::Arc;
    use std::thread;

    fn one(i: usize) -> Collection {
        Collection::new(vec![Sample::gauge("Alloc", i as f64)])
    }

    #[test]
    fn test_drain_empties() {
        let acc = Accumulator::new();
        acc.add(one(1));
        acc.add(one(2));
        assert_eq!(acc.len(), 2);
        let drained = acc.drain();
        assert_eq!(drained, vec![one(1), one(2)]);
        assert!(acc.is_empty());
        assert!(acc.drain().is_empty());
    }

    #[test]
    fn test_concurrent_add_and_drain_loses_nothing() {
        let acc = Arc::new(Accumulator::new());
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let acc = Arc::clone(&acc);
                thread::spawn(move || {
                    for i in 0..250 {
                        acc.add(one(i));
                    }
                })
            })
            .collect();
        let mut seen = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            seen += acc.drain().len();
        }
        for w in writers {
            w.join().unwrap();
        }
        seen += acc.drain().len();
        assert_eq!(seen, 1000);
    }
}
