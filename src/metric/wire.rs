use super::{Kind, Sample};

/// Errors raised by malformed wire records.
///
/// These are never retried. Over HTTP they map onto 4xx responses.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    /// The record has an empty `id`.
    #[error("metric id is empty")]
    EmptyId,
    /// The `type` is neither `gauge` nor `counter`.
    #[error("bad metric type: {0:?}")]
    BadMetricType(String),
    /// A gauge without `value` or a counter without `delta`.
    #[error("missing value for {kind} {id:?}")]
    MissingValue {
        /// Record id.
        id: String,
        /// Declared kind.
        kind: Kind,
    },
    /// A textual value that does not parse for its kind.
    #[error("invalid value: {0:?}")]
    InvalidValue(String),
    /// The payload is not a well formed record.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> ProtocolError {
        ProtocolError::Malformed(e.to_string())
    }
}

/// The wire form of one metric.
///
/// `type` is kept as text so that an unknown type survives decoding and is
/// reported as `BadMetricType` rather than as a decoding failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Metric name.
    pub id: String,
    /// `"gauge"` or `"counter"`.
    #[serde(rename = "type")]
    pub mtype: String,
    /// Counter delta, or running total in responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    /// Gauge value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

/// A validated write, borrowed from its wire record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Update<'a> {
    /// Replace the gauge `id` with `value`.
    Gauge {
        /// Gauge name.
        id: &'a str,
        /// New value.
        value: f64,
    },
    /// Add `delta` to the counter `id`.
    Counter {
        /// Counter name.
        id: &'a str,
        /// Signed increment.
        delta: i64,
    },
}

impl<'a> Update<'a> {
    /// The metric name this update targets.
    pub fn id(&self) -> &'a str {
        match *self {
            Update::Gauge { id, .. } | Update::Counter { id, .. } => id,
        }
    }
}

impl Metrics {
    /// A gauge record.
    pub fn gauge<S: Into<String>>(id: S, value: f64) -> Metrics {
        Metrics {
            id: id.into(),
            mtype: Kind::Gauge.as_str().to_string(),
            delta: None,
            value: Some(value),
        }
    }

    /// A counter record.
    pub fn counter<S: Into<String>>(id: S, delta: i64) -> Metrics {
        Metrics {
            id: id.into(),
            mtype: Kind::Counter.as_str().to_string(),
            delta: Some(delta),
            value: None,
        }
    }

    /// Parse the declared kind.
    pub fn kind(&self) -> Result<Kind, ProtocolError> {
        self.mtype.parse()
    }

    /// Check the record and turn it into a typed write.
    pub fn update(&self) -> Result<Update, ProtocolError> {
        if self.id.is_empty() {
            return Err(ProtocolError::EmptyId);
        }
        let kind = self.kind()?;
        let missing = || ProtocolError::MissingValue {
            id: self.id.clone(),
            kind,
        };
        match kind {
            Kind::Gauge => match self.value {
                Some(value) if value.is_finite() => Ok(Update::Gauge { id: &self.id, value }),
                Some(value) => Err(ProtocolError::InvalidValue(value.to_string())),
                None => Err(missing()),
            },
            Kind::Counter => self.delta.map(|delta| Update::Counter { id: &self.id, delta }).ok_or_else(missing),
        }
    }

    /// Parse a value given as text, as in `/update/{type}/{name}/{value}`.
    pub fn from_text(kind: Kind, id: &str, value: &str) -> Result<Metrics, ProtocolError> {
        let invalid = || ProtocolError::InvalidValue(value.to_string());
        match kind {
            Kind::Gauge => value
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(|v| Metrics::gauge(id, v))
                .ok_or_else(invalid),
            Kind::Counter => value.parse::<i64>().map(|d| Metrics::counter(id, d)).map_err(|_| invalid()),
        }
    }
}

impl<'a> From<&'a Sample> for Metrics {
    fn from(sample: &'a Sample) -> Metrics {
        match sample.kind() {
            Kind::Gauge => Metrics::gauge(sample.name(), sample.value()),
            Kind::Counter => Metrics::counter(sample.name(), sample.delta()),
        }
    }
}
