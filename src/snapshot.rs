use std::collections::BTreeMap;

/// A numeric field value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self {
        Self::UInteger(value)
    }
}

/// One measurement at one point in time.
///
/// Tags and fields are kept sorted by key so identical records always encode identically.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ms,
        }
    }

    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Hands the publisher the current metric values, once per publish cycle.
pub trait SnapshotSource: Send + Sync {
    /// Captures every metric, stamping records with `timestamp_ms`.
    fn snapshot(&self, timestamp_ms: u64) -> Vec<MetricRecord>;
}

impl<F> SnapshotSource for F
where
    F: Fn(u64) -> Vec<MetricRecord> + Send + Sync,
{
    fn snapshot(&self, timestamp_ms: u64) -> Vec<MetricRecord> {
        self(timestamp_ms)
    }
}
