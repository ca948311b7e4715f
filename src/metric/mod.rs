//! The metric data model shared by the agent and the server.
//!
//! A `Sample` is one named reading taken by the agent. Samples are grouped
//! into a `Collection` per sampling tick. On the wire, and in snapshot files,
//! samples travel as `Metrics` records.
use std::fmt;
use std::slice;
use std::str::FromStr;
use std::sync::Arc;

mod wire;

pub use self::wire::{Metrics, ProtocolError, Update};

/// The aggregation kind of a metric.
///
/// A gauge keeps only the last written value. A counter accumulates every
/// delta written to it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// Replacement semantics, stored as `f64`.
    Gauge,
    /// Accumulation semantics, stored as `i64`.
    Counter,
}

impl Kind {
    /// The textual form used in URLs and wire records.
    pub fn as_str(&self) -> &'static str {
        match *self {
            Kind::Gauge => "gauge",
            Kind::Counter => "counter",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Kind, ProtocolError> {
        match s {
            "gauge" => Ok(Kind::Gauge),
            "counter" => Ok(Kind::Counter),
            other => Err(ProtocolError::BadMetricType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Value {
    Gauge(f64),
    Counter(i64),
}

/// A single named reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    name: String,
    value: Value,
}

impl Sample {
    /// Create a gauge sample.
    pub fn gauge<S>(name: S, value: f64) -> Sample
    where
        S: Into<String>,
    {
        Sample {
            name: name.into(),
            value: Value::Gauge(value),
        }
    }

    /// Create a counter sample carrying `delta`.
    pub fn counter<S>(name: S, delta: i64) -> Sample
    where
        S: Into<String>,
    {
        Sample {
            name: name.into(),
            value: Value::Counter(delta),
        }
    }

    /// The name of the sample.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The kind of the sample.
    pub fn kind(&self) -> Kind {
        match self.value {
            Value::Gauge(_) => Kind::Gauge,
            Value::Counter(_) => Kind::Counter,
        }
    }

    /// The raw reading. Counter deltas are widened to `f64`.
    pub fn value(&self) -> f64 {
        match self.value {
            Value::Gauge(v) => v,
            Value::Counter(d) => d as f64,
        }
    }

    /// The counter delta. Gauge readings are truncated toward zero.
    pub fn delta(&self) -> i64 {
        match self.value {
            Value::Gauge(v) => v.trunc() as i64,
            Value::Counter(d) => d,
        }
    }
}

/// An ordered, immutable group of samples taken in one tick.
///
/// Cloning is cheap: the samples are shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Collection {
    samples: Arc<Vec<Sample>>,
}

impl Collection {
    /// Freeze `samples` into a collection.
    pub fn new(samples: Vec<Sample>) -> Collection {
        Collection {
            samples: Arc::new(samples),
        }
    }

    /// Iterate the samples in the order they were taken.
    pub fn iter(&self) -> slice::Iter<Sample> {
        self.samples.iter()
    }

    /// The number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the collection holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Look up a sample by name.
    pub fn get(&self, name: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.name == name)
    }
}

impl<'a> IntoIterator for &'a Collection {
    type Item = &'a Sample;
    type IntoIter = slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Flatten a batch of collections into wire records, preserving order.
pub fn to_wire(batch: &[Collection]) -> Vec<Metrics> {
    batch
        .iter()
        .flat_map(|c| c.iter())
        .map(Metrics::from)
        .collect()
}
